//! Known resource types and their replacement rules.
//!
//! Only the types needed by the supported stacks are modelled. Unknown types
//! are still accepted, but every property change is treated as an in-place
//! update and validation emits a warning.

/// Static description of a resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSchema {
    /// Type name in `AWS::Service::Type` form.
    pub type_name: &'static str,
    /// Properties whose change forces a replacement.
    pub create_only: &'static [&'static str],
    /// Attributes the provider reports after creation.
    pub read_only: &'static [&'static str],
    /// Prefix used for synthesized identifiers.
    pub id_prefix: &'static str,
}

const SCHEMAS: &[ResourceSchema] = &[
    ResourceSchema {
        type_name: "AWS::EC2::VPC",
        create_only: &["CidrBlock", "InstanceTenancy", "Ipv4IpamPoolId", "Ipv4NetmaskLength"],
        read_only: &["VpcId", "DefaultSecurityGroup", "DefaultNetworkAcl", "CidrBlockAssociations"],
        id_prefix: "vpc",
    },
    ResourceSchema {
        type_name: "AWS::EC2::Subnet",
        create_only: &["VpcId", "CidrBlock", "AvailabilityZone", "AvailabilityZoneId"],
        read_only: &["SubnetId", "NetworkAclAssociationId"],
        id_prefix: "subnet",
    },
    ResourceSchema {
        type_name: "AWS::EC2::SecurityGroup",
        create_only: &["GroupName", "GroupDescription", "VpcId"],
        read_only: &["GroupId", "Id"],
        id_prefix: "sg",
    },
    ResourceSchema {
        type_name: "AWS::EC2::InternetGateway",
        create_only: &[],
        read_only: &["InternetGatewayId"],
        id_prefix: "igw",
    },
    ResourceSchema {
        type_name: "AWS::EC2::VPCGatewayAttachment",
        create_only: &["VpcId", "InternetGatewayId", "VpnGatewayId"],
        read_only: &["AttachmentType"],
        id_prefix: "IGW",
    },
    ResourceSchema {
        type_name: "AWS::EC2::RouteTable",
        create_only: &["VpcId"],
        read_only: &["RouteTableId"],
        id_prefix: "rtb",
    },
    ResourceSchema {
        type_name: "AWS::EC2::Route",
        create_only: &["RouteTableId", "DestinationCidrBlock", "DestinationIpv6CidrBlock"],
        read_only: &["CidrBlock"],
        id_prefix: "rtb-route",
    },
    ResourceSchema {
        type_name: "AWS::EC2::SubnetRouteTableAssociation",
        create_only: &["SubnetId", "RouteTableId"],
        read_only: &["Id"],
        id_prefix: "rtbassoc",
    },
    ResourceSchema {
        type_name: "AWS::EC2::Instance",
        create_only: &[
            "ImageId",
            "KeyName",
            "SubnetId",
            "SecurityGroups",
            "AvailabilityZone",
            "NetworkInterfaces",
            "PrivateIpAddress",
            "Tenancy",
        ],
        read_only: &["InstanceId", "PublicIp", "PublicDnsName", "PrivateIp", "PrivateDnsName"],
        id_prefix: "i",
    },
    ResourceSchema {
        type_name: "AWS::S3::Bucket",
        create_only: &["BucketName", "ObjectLockEnabled"],
        read_only: &["Arn", "DomainName", "RegionalDomainName", "WebsiteURL"],
        id_prefix: "bucket",
    },
    ResourceSchema {
        type_name: "AWS::ElasticLoadBalancingV2::LoadBalancer",
        create_only: &["Name", "Scheme", "Type"],
        read_only: &[
            "LoadBalancerArn",
            "DNSName",
            "CanonicalHostedZoneID",
            "LoadBalancerFullName",
            "LoadBalancerName",
        ],
        id_prefix: "arn:aws:elasticloadbalancing:loadbalancer/app",
    },
    ResourceSchema {
        type_name: "AWS::ElasticLoadBalancingV2::TargetGroup",
        create_only: &["Name", "Port", "Protocol", "ProtocolVersion", "TargetType", "VpcId"],
        read_only: &["TargetGroupArn", "TargetGroupFullName", "TargetGroupName", "LoadBalancerArns"],
        id_prefix: "arn:aws:elasticloadbalancing:targetgroup",
    },
    ResourceSchema {
        type_name: "AWS::ElasticLoadBalancingV2::Listener",
        create_only: &["LoadBalancerArn"],
        read_only: &["ListenerArn"],
        id_prefix: "arn:aws:elasticloadbalancing:listener/app",
    },
];

/// Looks up the schema of a resource type.
#[must_use]
pub fn lookup(type_name: &str) -> Option<&'static ResourceSchema> {
    SCHEMAS.iter().find(|s| s.type_name == type_name)
}

/// Returns every known type name.
#[must_use]
pub fn known_types() -> Vec<&'static str> {
    SCHEMAS.iter().map(|s| s.type_name).collect()
}

/// Returns true if changing `property` on `type_name` forces a replacement.
///
/// Unknown types never force a replacement.
#[must_use]
pub fn is_create_only(type_name: &str, property: &str) -> bool {
    lookup(type_name).is_some_and(|s| s.create_only.contains(&property))
}

/// Returns true if `type_name` follows the `AWS::Service::Type` form.
#[must_use]
pub fn is_valid_type_name(type_name: &str) -> bool {
    let parts: Vec<&str> = type_name.split("::").collect();
    parts.len() == 3
        && parts[0] == "AWS"
        && parts[1..]
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_only_lookup() {
        assert!(is_create_only("AWS::EC2::VPC", "CidrBlock"));
        assert!(!is_create_only("AWS::EC2::VPC", "EnableDnsSupport"));
        assert!(is_create_only("AWS::ElasticLoadBalancingV2::TargetGroup", "Port"));
        assert!(!is_create_only("AWS::Custom::Thing", "Anything"));
    }

    #[test]
    fn test_type_name_validation() {
        assert!(is_valid_type_name("AWS::EC2::Instance"));
        assert!(is_valid_type_name("AWS::ElasticLoadBalancingV2::Listener"));
        assert!(!is_valid_type_name("aws.ec2.instance"));
        assert!(!is_valid_type_name("AWS::EC2"));
        assert!(!is_valid_type_name("AWS::EC2::"));
    }

    #[test]
    fn test_known_types_are_unique() {
        let mut types = known_types();
        let total = types.len();
        types.sort_unstable();
        types.dedup();
        assert_eq!(types.len(), total);
        assert!(lookup("AWS::S3::Bucket").is_some());
    }
}
