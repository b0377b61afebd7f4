//! AWS provider backed by the Cloud Control API.
//!
//! Cloud Control exposes every CloudFormation resource type through one
//! generic CRUD interface. Mutating calls are asynchronous: each returns a
//! progress event whose request token is polled until the request reaches a
//! terminal status.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use aws_sdk_cloudcontrol::Client;
use aws_sdk_cloudcontrol::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_cloudcontrol::types::{OperationStatus, ProgressEvent};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::config::ProviderConfig;
use crate::error::{ProviderError, ProviderResult};
use crate::resource::Properties;

use super::{CloudProvider, ProvisionedResource, json_patch};

const INSTANCE_TYPE: &str = "AWS::EC2::Instance";
const USER_DATA: &str = "UserData";

/// [`CloudProvider`] for AWS through Cloud Control.
#[derive(Debug, Clone)]
pub struct CloudControlProvider {
    client: Client,
    poll_interval: Duration,
    operation_timeout: Duration,
    encode_user_data: bool,
}

impl CloudControlProvider {
    /// Creates a provider using the standard AWS credential chain.
    pub async fn new(config: &ProviderConfig) -> Self {
        let sdk_config = if let Some(region) = &config.region {
            aws_config::from_env()
                .region(aws_config::Region::new(region.clone()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&sdk_config), config)
    }

    /// Creates a provider with an existing client.
    #[must_use]
    pub fn with_client(client: Client, config: &ProviderConfig) -> Self {
        Self {
            client,
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            operation_timeout: Duration::from_secs(config.operation_timeout_secs),
            encode_user_data: config.encode_user_data,
        }
    }

    /// Applies provider-specific encodings to resolved inputs.
    fn prepare_inputs(&self, resource_type: &str, inputs: &Properties) -> Properties {
        let mut prepared = inputs.clone();
        if self.encode_user_data
            && resource_type == INSTANCE_TYPE
            && let Some(Value::String(script)) = prepared.get(USER_DATA)
        {
            let encoded = STANDARD.encode(script.as_bytes());
            prepared.insert(USER_DATA.to_string(), Value::String(encoded));
        }
        prepared
    }

    fn serialize(inputs: &Properties) -> ProviderResult<String> {
        serde_json::to_string(inputs).map_err(|e| ProviderError::InvalidRequest {
            message: format!("cannot serialize properties: {e}"),
        })
    }

    /// Polls a request until it reaches a terminal status.
    ///
    /// Returns the resource identifier reported by the final event, if any.
    async fn wait_for(
        &self,
        initial: Option<ProgressEvent>,
        operation: &str,
        resource: &str,
    ) -> ProviderResult<Option<String>> {
        let mut event = initial.ok_or_else(|| {
            ProviderError::failed("MissingProgressEvent", format!("{operation} of {resource} returned no progress event"))
        })?;
        let token = event
            .request_token()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::failed("MissingRequestToken", format!("{operation} of {resource}")))?;
        let start = Instant::now();

        loop {
            trace!(%token, status = ?event.operation_status(), "{operation} {resource}");
            if let Some(done) = terminal_status(&event, resource) {
                return done;
            }

            if start.elapsed() >= self.operation_timeout {
                return Err(ProviderError::Timeout {
                    operation: operation.to_string(),
                    resource: resource.to_string(),
                });
            }

            tokio::time::sleep(self.poll_interval).await;

            let output = self
                .client
                .get_resource_request_status()
                .request_token(&token)
                .send()
                .await
                .map_err(|e| classify_sdk_error(e, operation, resource))?;
            event = output.progress_event().cloned().ok_or_else(|| {
                ProviderError::failed("MissingProgressEvent", format!("status of {token}"))
            })?;
        }
    }

    async fn describe(&self, resource_type: &str, physical_id: &str) -> ProviderResult<Option<ProvisionedResource>> {
        let result = self
            .client
            .get_resource()
            .type_name(resource_type)
            .identifier(physical_id)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e)
                if e.as_service_error()
                    .is_some_and(aws_sdk_cloudcontrol::operation::get_resource::GetResourceError::is_resource_not_found_exception) =>
            {
                return Ok(None);
            }
            Err(e) => return Err(classify_sdk_error(e, "read", physical_id)),
        };

        let Some(description) = output.resource_description() else {
            return Ok(None);
        };

        let outputs = match description.properties() {
            Some(raw) => serde_json::from_str::<Properties>(raw).map_err(|e| {
                ProviderError::failed("InvalidResponse", format!("unparseable properties of {physical_id}: {e}"))
            })?,
            None => Properties::new(),
        };

        Ok(Some(ProvisionedResource {
            physical_id: description.identifier().unwrap_or(physical_id).to_string(),
            outputs,
        }))
    }

    async fn describe_or_inputs(
        &self,
        resource_type: &str,
        physical_id: String,
        inputs: &Properties,
    ) -> ProviderResult<ProvisionedResource> {
        Ok(self
            .describe(resource_type, &physical_id)
            .await?
            .unwrap_or_else(|| ProvisionedResource {
                physical_id,
                outputs: inputs.clone(),
            }))
    }
}

#[async_trait]
impl CloudProvider for CloudControlProvider {
    fn name(&self) -> &'static str {
        "aws"
    }

    async fn create(
        &self,
        resource_type: &str,
        logical_name: &str,
        client_token: &str,
        inputs: &Properties,
    ) -> ProviderResult<ProvisionedResource> {
        let desired_state = Self::serialize(&self.prepare_inputs(resource_type, inputs))?;
        debug!("Creating {resource_type} {logical_name} (client token {client_token})");

        let output = self
            .client
            .create_resource()
            .type_name(resource_type)
            .desired_state(desired_state)
            .client_token(client_token)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "create", logical_name))?;

        let identifier = self
            .wait_for(output.progress_event().cloned(), "create", logical_name)
            .await?;
        let physical_id = require_identifier(identifier, "create", logical_name)?;
        info!("Created {resource_type} {logical_name} ({physical_id})");

        self.describe_or_inputs(resource_type, physical_id, inputs).await
    }

    async fn read(
        &self,
        resource_type: &str,
        physical_id: &str,
    ) -> ProviderResult<Option<ProvisionedResource>> {
        self.describe(resource_type, physical_id).await
    }

    async fn update(
        &self,
        resource_type: &str,
        physical_id: &str,
        old_inputs: &Properties,
        new_inputs: &Properties,
    ) -> ProviderResult<ProvisionedResource> {
        let old = self.prepare_inputs(resource_type, old_inputs);
        let new = self.prepare_inputs(resource_type, new_inputs);
        let patch = json_patch(&old, &new);

        if patch.as_array().is_some_and(Vec::is_empty) {
            debug!("No property changes for {physical_id}, skipping update call");
        } else {
            let output = self
                .client
                .update_resource()
                .type_name(resource_type)
                .identifier(physical_id)
                .patch_document(patch.to_string())
                .client_token(Uuid::new_v4().to_string())
                .send()
                .await
                .map_err(|e| classify_sdk_error(e, "update", physical_id))?;

            self.wait_for(output.progress_event().cloned(), "update", physical_id)
                .await?;
            info!("Updated {resource_type} {physical_id}");
        }

        self.describe_or_inputs(resource_type, physical_id.to_string(), new_inputs)
            .await
    }

    async fn delete(&self, resource_type: &str, physical_id: &str) -> ProviderResult<()> {
        let output = self
            .client
            .delete_resource()
            .type_name(resource_type)
            .identifier(physical_id)
            .client_token(Uuid::new_v4().to_string())
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "delete", physical_id))?;

        self.wait_for(output.progress_event().cloned(), "delete", physical_id)
            .await?;
        info!("Deleted {resource_type} {physical_id}");
        Ok(())
    }
}

/// Returns the outcome of a finished request, or `None` while it runs.
fn terminal_status(event: &ProgressEvent, resource: &str) -> Option<ProviderResult<Option<String>>> {
    match event.operation_status()? {
        OperationStatus::Success => Some(Ok(event.identifier().map(str::to_string))),
        OperationStatus::Failed | OperationStatus::CancelComplete => {
            let code = event.error_code().map_or("GeneralServiceException", |c| c.as_str());
            let message = event
                .status_message()
                .map_or_else(|| format!("{:?}", event.operation_status()), str::to_string);
            Some(Err(classify_code(code, message, resource)))
        }
        _ => None,
    }
}

/// A created resource without an identifier could never be read or deleted.
fn require_identifier(identifier: Option<String>, operation: &str, resource: &str) -> ProviderResult<String> {
    identifier.filter(|id| !id.is_empty()).ok_or_else(|| {
        ProviderError::failed(
            "MissingIdentifier",
            format!("{operation} of {resource} succeeded without reporting an identifier"),
        )
    })
}

/// Maps an SDK error to a provider error.
fn classify_sdk_error<E, R>(err: SdkError<E, R>, operation: &str, resource: &str) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::TimeoutError(_) => ProviderError::Timeout {
            operation: operation.to_string(),
            resource: resource.to_string(),
        },
        SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            ProviderError::network(DisplayErrorContext(&err).to_string())
        }
        SdkError::ServiceError(context) => {
            let code = context.err().code().unwrap_or("Unknown");
            let message = context
                .err()
                .message()
                .map_or_else(|| DisplayErrorContext(&err).to_string(), str::to_string);
            classify_code(code, message, resource)
        }
        _ => ProviderError::failed("SdkError", DisplayErrorContext(&err).to_string()),
    }
}

/// Maps an API exception name or handler error code to a provider error.
fn classify_code(code: &str, message: String, resource: &str) -> ProviderError {
    let code = code.trim_end_matches("Exception");
    match code {
        "Throttling" | "ServiceLimitExceeded" | "RequestLimitExceeded" => ProviderError::Throttled {
            message,
            retry_after_secs: None,
        },
        "NetworkFailure" => ProviderError::Network { message },
        "ServiceTimeout" => ProviderError::Timeout {
            operation: String::from("provider request"),
            resource: resource.to_string(),
        },
        "ServiceInternalError" | "InternalFailure" | "HandlerInternalFailure" | "GeneralService"
        | "ConcurrentOperation" | "ResourceConflict" => ProviderError::Service {
            code: code.to_string(),
            message,
        },
        "ResourceNotFound" | "NotFound" => ProviderError::NotFound {
            resource_type: String::from("resource"),
            identifier: resource.to_string(),
        },
        "AlreadyExists" => ProviderError::AlreadyExists {
            resource_type: resource.to_string(),
            message,
        },
        "InvalidRequest" | "NotUpdatable" | "ClientTokenConflict" => {
            ProviderError::InvalidRequest { message }
        }
        "TypeNotFound" | "UnsupportedAction" => ProviderError::Unsupported {
            resource_type: message,
        },
        other => ProviderError::failed(other, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_cloudcontrol::types::HandlerErrorCode;
    use serde_json::json;

    fn provider(encode_user_data: bool) -> CloudControlProvider {
        let sdk_config = aws_sdk_cloudcontrol::Config::builder()
            .behavior_version(aws_sdk_cloudcontrol::config::BehaviorVersion::latest())
            .region(aws_sdk_cloudcontrol::config::Region::new("us-east-1"))
            .build();
        let config = ProviderConfig {
            encode_user_data,
            ..ProviderConfig::default()
        };
        CloudControlProvider::with_client(Client::from_conf(sdk_config), &config)
    }

    #[test]
    fn test_user_data_is_encoded_for_instances() {
        let mut inputs = Properties::new();
        inputs.insert(String::from("UserData"), json!("#!/bin/bash\necho hi\n"));

        let prepared = provider(true).prepare_inputs(INSTANCE_TYPE, &inputs);
        assert_eq!(prepared["UserData"], json!(STANDARD.encode("#!/bin/bash\necho hi\n")));

        let untouched = provider(false).prepare_inputs(INSTANCE_TYPE, &inputs);
        assert_eq!(untouched["UserData"], inputs["UserData"]);

        let other = provider(true).prepare_inputs("AWS::EC2::VPC", &inputs);
        assert_eq!(other["UserData"], inputs["UserData"]);
    }

    #[test]
    fn test_success_without_identifier_is_an_error() {
        let event = ProgressEvent::builder()
            .operation_status(OperationStatus::Success)
            .build();
        let identifier = terminal_status(&event, "Vpc").unwrap().unwrap();
        assert_eq!(identifier, None);

        let err = require_identifier(identifier, "create", "Vpc").unwrap_err();
        assert!(matches!(err, ProviderError::Failed { ref code, .. } if code == "MissingIdentifier"));
        assert!(!err.is_transient());
        assert!(require_identifier(Some(String::new()), "create", "Vpc").is_err());

        let event = ProgressEvent::builder()
            .operation_status(OperationStatus::Success)
            .identifier("vpc-0abc")
            .build();
        let identifier = terminal_status(&event, "Vpc").unwrap().unwrap();
        assert_eq!(require_identifier(identifier, "create", "Vpc").unwrap(), "vpc-0abc");
    }

    #[test]
    fn test_terminal_status() {
        let running = ProgressEvent::builder()
            .operation_status(OperationStatus::InProgress)
            .build();
        assert!(terminal_status(&running, "Vpc").is_none());

        let failed = ProgressEvent::builder()
            .operation_status(OperationStatus::Failed)
            .error_code(HandlerErrorCode::Throttling)
            .status_message("Rate exceeded")
            .build();
        assert!(terminal_status(&failed, "Vpc").unwrap().unwrap_err().is_transient());
    }

    #[test]
    fn test_classify_codes() {
        assert!(classify_code("ThrottlingException", String::new(), "x").is_transient());
        assert!(classify_code("NetworkFailure", String::new(), "x").is_transient());
        assert!(classify_code("ServiceInternalError", String::new(), "x").is_transient());
        assert!(matches!(
            classify_code("ResourceNotFoundException", String::new(), "vpc-1"),
            ProviderError::NotFound { ref identifier, .. } if identifier == "vpc-1"
        ));
        assert!(matches!(
            classify_code("InvalidRequest", String::from("bad cidr"), "x"),
            ProviderError::InvalidRequest { .. }
        ));
        assert!(!classify_code("AccessDenied", String::new(), "x").is_transient());
    }
}
