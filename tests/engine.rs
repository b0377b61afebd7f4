//! End-to-end runs of the engine against the in-memory provider.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cumulus::config::{ConfigParser, ConfigValidator, DeployConfig};
use cumulus::engine::Engine;
use cumulus::error::{CumulusError, GraphError, ProviderError, ProviderResult, StateError};
use cumulus::graph::ResourceGraph;
use cumulus::planner::{ChangeAction, ChangeOutcome};
use cumulus::provider::{CloudProvider, MemoryProvider, ProviderOperation, ProvisionedResource};
use cumulus::resource::Properties;
use cumulus::state::{LocalStateStore, ResourceStatus, StateStore};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// A VPC with two subnets and an instance in the first one.
const NETWORK: &str = r"
project:
  name: web
execution:
  parallelism: 4
  retry:
    max_attempts: 3
    base_delay_ms: 1
    max_delay_ms: 5
resources:
  - name: Vpc
    type: AWS::EC2::VPC
    properties:
      CidrBlock: 10.0.0.0/16
  - name: SubnetA
    type: AWS::EC2::Subnet
    properties:
      VpcId: ${Vpc.id}
      CidrBlock: 10.0.0.0/18
  - name: SubnetB
    type: AWS::EC2::Subnet
    properties:
      VpcId: ${Vpc.id}
      CidrBlock: 10.0.64.0/18
  - name: Web
    type: AWS::EC2::Instance
    properties:
      ImageId: ami-07caf09b362be10b8
      InstanceType: t2.micro
      SubnetId: ${SubnetA.id}
outputs:
  publicIp: ${Web.PublicIp}
";

struct Fixture {
    _dir: TempDir,
    config: DeployConfig,
    store: LocalStateStore,
    provider: Arc<MemoryProvider>,
}

impl Fixture {
    fn new(yaml: &str) -> Self {
        Self::with_provider(yaml, MemoryProvider::new())
    }

    fn with_provider(yaml: &str, provider: MemoryProvider) -> Self {
        let dir = TempDir::new().unwrap();
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        let store = LocalStateStore::with_base_dir(dir.path().join(".cumulus"));
        Self {
            _dir: dir,
            config,
            store,
            provider: Arc::new(provider),
        }
    }

    fn engine(&self) -> Engine<'_> {
        Engine::new(&self.config, &self.store, self.provider.clone())
    }

    fn position(calls: &[String], name: &str) -> usize {
        calls.iter().position(|c| c == name).unwrap()
    }
}

#[tokio::test]
async fn creates_follow_dependency_order() {
    let fx = Fixture::new(NETWORK);
    let outcome = fx.engine().apply(false, |_| true).await.unwrap();
    assert!(outcome.is_success());

    let creates = fx.provider.calls_of(ProviderOperation::Create);
    assert_eq!(creates.len(), 4);
    assert_eq!(creates[0], "Vpc");
    assert!(Fixture::position(&creates, "SubnetA") < Fixture::position(&creates, "Web"));

    let state = fx.store.load().await.unwrap().unwrap();
    let subnet_id = state.get("SubnetA").unwrap().physical_id.clone().unwrap();
    let web_inputs = fx
        .provider
        .live_inputs(state.get("Web").unwrap().physical_id.as_deref().unwrap())
        .unwrap();
    assert_eq!(web_inputs["SubnetId"], json!(subnet_id));
    assert!(outcome.outputs.contains_key("publicIp"));
}

#[tokio::test]
async fn second_apply_is_all_noop() {
    let fx = Fixture::new(NETWORK);
    fx.engine().apply(false, |_| true).await.unwrap();
    let calls = fx.provider.calls().len();

    let plan = fx.engine().plan(true).await.unwrap();
    assert!(plan.is_empty());
    assert!(plan.changes.iter().all(|c| c.action == ChangeAction::NoOp));
    assert_eq!(plan.unchanged_count(), 4);

    let outcome = fx.engine().apply(false, |_| true).await.unwrap();
    assert!(outcome.is_success());
    let after_refresh = calls + 4;
    assert_eq!(fx.provider.calls().len(), after_refresh);
}

/// Creates the resource, then reports a timeout for the first create of
/// `flaky`, as when polling gives up on a request the cloud accepted.
struct TimeoutAfterAccept {
    inner: MemoryProvider,
    flaky: &'static str,
    timed_out: AtomicBool,
}

#[async_trait]
impl CloudProvider for TimeoutAfterAccept {
    fn name(&self) -> &'static str {
        "timeout-after-accept"
    }

    async fn create(
        &self,
        resource_type: &str,
        logical_name: &str,
        client_token: &str,
        inputs: &Properties,
    ) -> ProviderResult<ProvisionedResource> {
        let created = self.inner.create(resource_type, logical_name, client_token, inputs).await?;
        if logical_name == self.flaky && !self.timed_out.swap(true, Ordering::SeqCst) {
            return Err(ProviderError::Timeout {
                operation: String::from("create"),
                resource: logical_name.to_string(),
            });
        }
        Ok(created)
    }

    async fn read(&self, resource_type: &str, physical_id: &str) -> ProviderResult<Option<ProvisionedResource>> {
        self.inner.read(resource_type, physical_id).await
    }

    async fn update(
        &self,
        resource_type: &str,
        physical_id: &str,
        old_inputs: &Properties,
        new_inputs: &Properties,
    ) -> ProviderResult<ProvisionedResource> {
        self.inner.update(resource_type, physical_id, old_inputs, new_inputs).await
    }

    async fn delete(&self, resource_type: &str, physical_id: &str) -> ProviderResult<()> {
        self.inner.delete(resource_type, physical_id).await
    }
}

#[tokio::test]
async fn retried_create_after_timeout_leaves_no_orphan() {
    let fx = Fixture::new(NETWORK);
    let provider = Arc::new(TimeoutAfterAccept {
        inner: MemoryProvider::new(),
        flaky: "SubnetA",
        timed_out: AtomicBool::new(false),
    });
    let engine = Engine::new(&fx.config, &fx.store, provider.clone());

    let outcome = engine.apply(false, |_| true).await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(provider.inner.calls_of(ProviderOperation::Create).len(), 5);
    assert_eq!(provider.inner.resource_count(), 4);

    let state = fx.store.load().await.unwrap().unwrap();
    assert_eq!(state.resources.len(), 4);
    let subnet_id = state.get("SubnetA").unwrap().physical_id.clone().unwrap();
    assert_eq!(provider.inner.physical_id_of("SubnetA"), Some(subnet_id));

    assert!(engine.destroy(|_| true).await.unwrap().is_success());
    assert_eq!(provider.inner.resource_count(), 0);
}

#[tokio::test]
async fn cancel_mid_run_records_in_flight_work_and_releases_lock() {
    let fx = Fixture::with_provider(NETWORK, MemoryProvider::new().with_delay(Duration::from_millis(300)));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = fx
        .engine()
        .with_cancellation(cancel)
        .apply(false, |_| true)
        .await
        .unwrap();

    let report = outcome.report.as_ref().unwrap();
    assert!(report.cancelled);
    assert!(!outcome.is_success());
    assert_eq!(report.result_for("Vpc").unwrap().outcome, ChangeOutcome::Succeeded);
    for name in ["SubnetA", "SubnetB", "Web"] {
        assert_eq!(report.result_for(name).unwrap().outcome, ChangeOutcome::Cancelled);
    }
    assert_eq!(fx.provider.calls_of(ProviderOperation::Create), vec!["Vpc"]);

    let state = fx.store.load().await.unwrap().unwrap();
    assert!(state.get("Vpc").unwrap().physical_id.is_some());
    assert!(state.get("SubnetA").is_none());
    assert!(fx.store.get_lock_info().await.unwrap().is_none());
}

#[tokio::test]
async fn cycle_is_rejected_before_any_call() {
    let fx = Fixture::new(
        r"
project:
  name: web
resources:
  - name: A
    type: AWS::EC2::SecurityGroup
    properties:
      GroupDescription: ${B.GroupId}
  - name: B
    type: AWS::EC2::SecurityGroup
    properties:
      GroupDescription: ${A.GroupId}
",
    );

    let err = fx.engine().apply(false, |_| true).await.unwrap_err();
    assert!(matches!(err, CumulusError::Graph(GraphError::CyclicDependency { .. })));
    assert!(fx.provider.calls().is_empty());
    assert!(!fx.store.exists().await.unwrap());
}

#[tokio::test]
async fn dangling_reference_has_no_side_effects() {
    let fx = Fixture::new(
        r"
project:
  name: web
resources:
  - name: Subnet
    type: AWS::EC2::Subnet
    properties:
      VpcId: ${Vppc.id}
",
    );

    assert!(ConfigValidator::new().validate(&fx.config).is_err());

    let err = fx.engine().apply(false, |_| true).await.unwrap_err();
    match err {
        CumulusError::Graph(GraphError::UnknownReference { resource, target, .. }) => {
            assert_eq!(resource, "Subnet");
            assert_eq!(target, "Vppc");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(fx.provider.calls().is_empty());
    assert!(!fx.store.exists().await.unwrap());
    assert!(fx.store.get_lock_info().await.unwrap().is_none());
}

#[tokio::test]
async fn failure_blocks_dependents_only() {
    let fx = Fixture::new(NETWORK);
    fx.provider.fail_on(
        "SubnetA",
        ProviderError::InvalidRequest {
            message: String::from("CIDR overlaps"),
        },
    );

    let outcome = fx.engine().apply(false, |_| true).await.unwrap();
    assert!(!outcome.is_success());
    let report = outcome.report.as_ref().unwrap();
    assert_eq!(report.result_for("Vpc").unwrap().outcome, ChangeOutcome::Succeeded);
    assert_eq!(report.result_for("SubnetB").unwrap().outcome, ChangeOutcome::Succeeded);
    assert_eq!(report.result_for("SubnetA").unwrap().outcome, ChangeOutcome::Failed);
    assert_eq!(report.result_for("Web").unwrap().outcome, ChangeOutcome::Blocked);
    assert!(!fx.provider.calls_of(ProviderOperation::Create).contains(&String::from("Web")));

    let state = fx.store.load().await.unwrap().unwrap();
    assert_eq!(state.get("SubnetA").unwrap().status, ResourceStatus::Failed);
    assert_eq!(state.get("Web").unwrap().status, ResourceStatus::Blocked);
    assert!(!state.history.last().unwrap().success);

    // The next run resumes: only the failed branch is created.
    fx.provider.clear_failure("SubnetA");
    let outcome = fx.engine().apply(false, |_| true).await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.plan.create_count(), 2);
    assert_eq!(fx.provider.resource_count(), 4);
}

#[tokio::test]
async fn destroy_runs_in_exact_reverse_order() {
    let fx = Fixture::new(NETWORK);
    fx.engine().apply(false, |_| true).await.unwrap();

    let state = fx.store.load().await.unwrap().unwrap();
    let state_graph = ResourceGraph::from_state(&state).unwrap();
    let expected: Vec<String> = state_graph.reverse_order().into_iter().map(String::from).collect();

    let outcome = fx
        .engine()
        .with_parallelism(1)
        .destroy(|_| true)
        .await
        .unwrap();
    assert!(outcome.is_success());

    let deletes = fx.provider.calls_of(ProviderOperation::Delete);
    assert_eq!(deletes, expected);
    for name in &deletes {
        for dependency in state_graph.dependencies(name) {
            assert!(Fixture::position(&deletes, name) < Fixture::position(&deletes, dependency));
        }
    }
    assert_eq!(fx.provider.resource_count(), 0);
}

#[tokio::test]
async fn forward_references_are_ordered() {
    let fx = Fixture::new(
        r"
project:
  name: web
resources:
  - name: Listener
    type: AWS::ElasticLoadBalancingV2::Listener
    properties:
      Port: 80
      DefaultActions:
        - Type: forward
          TargetGroupArn: ${TargetGroup.id}
  - name: TargetGroup
    type: AWS::ElasticLoadBalancingV2::TargetGroup
    properties:
      Port: 8080
      Protocol: HTTP
",
    );

    fx.engine().apply(false, |_| true).await.unwrap();
    assert_eq!(
        fx.provider.calls_of(ProviderOperation::Create),
        vec!["TargetGroup", "Listener"]
    );
}

#[tokio::test]
async fn changing_create_only_property_replaces() {
    let fx = Fixture::new(NETWORK);
    fx.engine().apply(false, |_| true).await.unwrap();
    let old_subnet = fx.provider.physical_id_of("SubnetA").unwrap();

    let changed = NETWORK.replace("10.0.0.0/18", "10.0.128.0/18");
    let config = ConfigParser::new().parse_yaml(&changed, None).unwrap();
    let engine = Engine::new(&config, &fx.store, fx.provider.clone());

    let plan = engine.plan(false).await.unwrap();
    let subnet = plan
        .changes
        .iter()
        .find(|c| c.resource_name == "SubnetA" && !c.old_copy)
        .unwrap();
    assert_eq!(subnet.action, ChangeAction::Replace);
    let web = plan.changes.iter().find(|c| c.resource_name == "Web").unwrap();
    assert_eq!(web.action, ChangeAction::Replace);

    let outcome = engine.apply(false, |_| true).await.unwrap();
    assert!(outcome.is_success());
    assert!(fx.provider.live_inputs(&old_subnet).is_none());
    assert_eq!(fx.provider.resource_count(), 4);
    assert!(fx.store.load().await.unwrap().unwrap().pending_deletes.is_empty());
}

#[tokio::test]
async fn held_lock_fails_fast() {
    let fx = Fixture::new(NETWORK);
    let lock = fx.store.acquire_lock("ci-runner", "apply").await.unwrap();

    let err = fx.engine().plan(false).await.unwrap_err();
    assert!(matches!(err, CumulusError::State(StateError::LockConflict { .. })));

    fx.store.release_lock(&lock.lock_id).await.unwrap();
    assert!(fx.engine().plan(false).await.is_ok());
}

#[tokio::test]
async fn template_stack_round_trip() {
    let yaml = include_str!("../templates/cumulus.deploy.yaml").replace("kind: aws", "kind: memory");
    let fx = Fixture::new(&yaml);
    ConfigValidator::new().validate(&fx.config).unwrap();

    let graph = ResourceGraph::build(&fx.config.resources).unwrap();
    let order = graph.topological_order();
    let at = |name: &str| order.iter().position(|n| *n == name).unwrap();
    assert!(at("GatewayAttachment") < at("DefaultPublicRoute"));
    assert!(at("TargetGroup") < at("Listener"));
    assert!(at("WebServer2") < at("TargetGroup"));

    let outcome = fx.engine().apply(false, |_| true).await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(fx.provider.resource_count(), fx.config.resources.len());
    assert!(outcome.outputs.contains_key("publicHostName"));
    assert!(outcome.outputs["loadBalancer"].as_str().unwrap().starts_with("http://"));

    let outcome = fx.engine().destroy(|_| true).await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(fx.provider.resource_count(), 0);
}
