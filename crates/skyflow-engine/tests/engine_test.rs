//! Engine の統合テスト
//!
//! LocalProvider と一時ディレクトリの状態ファイルを使って、
//! リンク → 実行 → 状態保存までを通しで確認します。

use serde_json::json;
use skyflow_cloud::{ResourceStatus, StateManager};
use skyflow_cloud_local::{CallKind, LocalProvider};
use skyflow_core::{
    Deployment, ImportSource, InputValue, NodeId, OutputRef, ResourceKind, ResourceNode, Stack,
    ValueType,
};
use skyflow_engine::{
    ConfigurationError, Engine, EngineError, NodeState, RunStatus, StackLockTable, StackStatus,
    link,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn id(stack: &str, name: &str) -> NodeId {
    NodeId::new(stack, name)
}

fn out(stack: &str, name: &str, output: &str) -> OutputRef {
    OutputRef::new(id(stack, name), output)
}

/// iac-test 構成（証明書は us-east-1、アプリは ap-northeast-1）
fn iac_test() -> Deployment {
    let mut acm = Stack::new("AcmStack", "us-east-1");
    acm.add_node(
        ResourceNode::new(id("AcmStack", "HostedZone"), ResourceKind::HostedZoneLookup)
            .with_literal("domain_name", "example.com"),
    )
    .unwrap();
    let cert = acm
        .add_node(
            ResourceNode::new(id("AcmStack", "Certificate"), ResourceKind::Certificate)
                .with_literal("domain_name", "iac-test.example.com")
                .with_ref("hosted_zone_id", out("AcmStack", "HostedZone", "hosted_zone_id")),
        )
        .unwrap();
    acm.export_output("certificate_arn", &cert, "certificate_arn")
        .unwrap();

    let c = "CdkStack";
    let mut cdk = Stack::new(c, "ap-northeast-1");
    cdk.require_input(
        "certificate_arn",
        ValueType::String,
        Some(ImportSource {
            stack: "AcmStack".to_string(),
            export: "certificate_arn".to_string(),
        }),
    );
    let nodes = vec![
        ResourceNode::new(id(c, "MyVPC"), ResourceKind::Vpc)
            .with_literal("cidr", "10.0.0.0/16")
            .with_literal("max_azs", 2),
        ResourceNode::new(id(c, "DbSg"), ResourceKind::SecurityGroup)
            .with_ref("vpc_id", out(c, "MyVPC", "vpc_id"))
            .with_literal("ingress", json!([3306])),
        ResourceNode::new(id(c, "AppSg"), ResourceKind::SecurityGroup)
            .with_ref("vpc_id", out(c, "MyVPC", "vpc_id")),
        ResourceNode::new(id(c, "Database"), ResourceKind::DatabaseInstance)
            .with_ref("vpc_id", out(c, "MyVPC", "vpc_id"))
            .with_ref("security_group_id", out(c, "DbSg", "security_group_id"))
            .with_literal("engine", "mysql8.0"),
        ResourceNode::new(id(c, "LaunchTemplate"), ResourceKind::LaunchTemplate)
            .with_ref("security_group_id", out(c, "AppSg", "security_group_id")),
        ResourceNode::new(id(c, "Asg"), ResourceKind::AutoScalingGroup)
            .with_ref("vpc_id", out(c, "MyVPC", "vpc_id"))
            .with_ref(
                "launch_template_id",
                out(c, "LaunchTemplate", "launch_template_id"),
            ),
        ResourceNode::new(id(c, "Alb"), ResourceKind::LoadBalancer)
            .with_ref("vpc_id", out(c, "MyVPC", "vpc_id"))
            .with_ref("security_group_id", out(c, "AppSg", "security_group_id")),
        ResourceNode::new(id(c, "TargetGroup"), ResourceKind::TargetGroup)
            .with_ref("vpc_id", out(c, "MyVPC", "vpc_id"))
            .with_literal("port", 80),
        ResourceNode::new(id(c, "Listener"), ResourceKind::Listener)
            .with_ref("load_balancer_arn", out(c, "Alb", "load_balancer_arn"))
            .with_ref("target_group_arn", out(c, "TargetGroup", "target_group_arn"))
            .with_stack_input("certificate_arn", "certificate_arn"),
        ResourceNode::new(id(c, "Distribution"), ResourceKind::Distribution)
            .with_ref("origin_domain", out(c, "Alb", "dns_name"))
            .with_stack_input("certificate_arn", "certificate_arn"),
        ResourceNode::new(id(c, "Record"), ResourceKind::DnsRecord)
            .with_ref(
                "hosted_zone_id",
                out("AcmStack", "HostedZone", "hosted_zone_id"),
            )
            .with_literal("record_name", "iac-test.example.com")
            .with_ref("target", out(c, "Distribution", "domain_name")),
    ];
    for node in nodes {
        cdk.add_node(node).unwrap();
    }

    let mut deployment = Deployment::new("iac-test");
    deployment.add_stack(acm).unwrap();
    deployment.add_stack(cdk).unwrap();
    deployment
}

/// A（失敗させる）→ C、B は独立
fn failing_fixture() -> Deployment {
    let mut stack = Stack::new("S", "us-east-1");
    stack
        .add_node(ResourceNode::new(id("S", "A"), ResourceKind::Vpc).with_literal("cidr", "10.0.0.0/16"))
        .unwrap();
    stack
        .add_node(ResourceNode::new(id("S", "B"), ResourceKind::Vpc).with_literal("cidr", "10.1.0.0/16"))
        .unwrap();
    stack
        .add_node(
            ResourceNode::new(id("S", "C"), ResourceKind::SecurityGroup)
                .with_ref("vpc_id", out("S", "A", "vpc_id")),
        )
        .unwrap();
    let mut deployment = Deployment::new("failing");
    deployment.add_stack(stack).unwrap();
    deployment
}

struct Harness {
    _dir: TempDir,
    provider: Arc<LocalProvider>,
    engine: Engine,
}

fn harness(provider: LocalProvider, parallelism: usize) -> Harness {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(provider);
    let engine = Engine::new(provider.clone(), StateManager::new(dir.path()))
        .with_parallelism(parallelism);
    Harness {
        _dir: dir,
        provider,
        engine,
    }
}

#[tokio::test]
async fn test_no_node_starts_before_its_dependencies_finish() {
    let deployment = iac_test();
    let h = harness(
        LocalProvider::new().with_latency(Duration::from_millis(5)),
        4,
    );

    let report = h
        .engine
        .apply(&deployment, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.exit_code(), 0);

    let graph = link(&deployment).unwrap();
    for edge in graph.edges() {
        let producer = &report.nodes[edge.from];
        let consumer = &report.nodes[edge.to];
        assert!(
            consumer.started_step > producer.finished_step,
            "{} started before {} finished",
            consumer.id,
            producer.id
        );
    }
    assert!(h.provider.max_concurrency() <= 4);
    assert!(h.provider.max_concurrency() > 1);
}

#[tokio::test]
async fn test_parallelism_one_follows_topological_order() {
    let deployment = iac_test();
    let h = harness(LocalProvider::new(), 1);

    let report = h
        .engine
        .apply(&deployment, CancellationToken::new())
        .await
        .unwrap();

    let graph = link(&deployment).unwrap();
    let expected: Vec<String> = graph
        .topological_order()
        .iter()
        .map(|&v| graph.vertex(v))
        .filter(|v| !v.is_virtual())
        .map(|v| v.id.key())
        .collect();
    assert_eq!(h.provider.call_ids(CallKind::Create), expected);
    assert_eq!(h.provider.max_concurrency(), 1);
    assert_eq!(
        report
            .completion_order()
            .into_iter()
            .map(|id| id.key())
            .collect::<Vec<_>>(),
        expected
    );
}

#[tokio::test]
async fn test_cross_stack_cycle_is_rejected_before_provisioning() {
    let mut a = Stack::new("A", "us-east-1");
    a.require_input(
        "lt",
        ValueType::String,
        Some(ImportSource {
            stack: "B".to_string(),
            export: "lt".to_string(),
        }),
    );
    let sg = a
        .add_node(
            ResourceNode::new(id("A", "Sg"), ResourceKind::SecurityGroup)
                .with_stack_input("vpc_id", "lt"),
        )
        .unwrap();
    a.export_output("sg", &sg, "security_group_id").unwrap();

    let mut b = Stack::new("B", "us-east-1");
    b.require_input(
        "sg",
        ValueType::String,
        Some(ImportSource {
            stack: "A".to_string(),
            export: "sg".to_string(),
        }),
    );
    let lt = b
        .add_node(
            ResourceNode::new(id("B", "Lt"), ResourceKind::LaunchTemplate)
                .with_stack_input("security_group_id", "sg"),
        )
        .unwrap();
    b.export_output("lt", &lt, "launch_template_id").unwrap();

    let mut deployment = Deployment::new("cyclic");
    deployment.add_stack(a).unwrap();
    deployment.add_stack(b).unwrap();

    let h = harness(LocalProvider::new(), 4);
    let err = h
        .engine
        .apply(&deployment, CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        EngineError::Configuration(ConfigurationError::CyclicDependency { members }) => {
            assert!(members.contains(&"A/Sg".to_string()));
            assert!(members.contains(&"B/Lt".to_string()));
            assert_eq!(members.first(), members.last());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(h.provider.calls().is_empty());
    assert!(h.engine.state().load().await.unwrap().resources.is_empty());
}

#[tokio::test]
async fn test_cross_region_import_waits_for_whole_producer_stack() {
    // X の Slow は Y が参照する出力と無関係だが、Y はその完了も待つ
    let mut x = Stack::new("X", "us-east-1");
    let zone = x
        .add_node(
            ResourceNode::new(id("X", "Zone"), ResourceKind::HostedZoneLookup)
                .with_literal("domain_name", "example.com"),
        )
        .unwrap();
    x.add_node(ResourceNode::new(id("X", "Slow"), ResourceKind::Vpc).with_literal("cidr", "10.0.0.0/16"))
        .unwrap();
    x.export_output("zone", &zone, "hosted_zone_id").unwrap();

    let mut y = Stack::new("Y", "eu-west-1");
    y.require_input(
        "zone",
        ValueType::String,
        Some(ImportSource {
            stack: "X".to_string(),
            export: "zone".to_string(),
        }),
    );
    y.add_node(
        ResourceNode::new(id("Y", "Record"), ResourceKind::DnsRecord)
            .with_stack_input("hosted_zone_id", "zone")
            .with_literal("record_name", "www.example.com")
            .with_literal("target", "example.com"),
    )
    .unwrap();

    let mut deployment = Deployment::new("barrier");
    deployment.add_stack(x).unwrap();
    deployment.add_stack(y).unwrap();

    let h = harness(
        LocalProvider::new().with_latency(Duration::from_millis(5)),
        4,
    );
    let report = h
        .engine
        .apply(&deployment, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Success);

    let record = report.node(&id("Y", "Record")).unwrap();
    for producer in ["Zone", "Slow"] {
        let producer = report.node(&id("X", producer)).unwrap();
        assert!(record.started_step > producer.finished_step);
    }
    assert_eq!(
        h.provider.call_ids(CallKind::Create).last().map(String::as_str),
        Some("Y/Record")
    );
}

#[tokio::test]
async fn test_failed_node_skips_only_its_dependents() {
    let deployment = failing_fixture();
    let h = harness(LocalProvider::new().with_failure("S/A"), 4);

    let report = h
        .engine
        .apply(&deployment, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::PartialFailure);
    assert_eq!(report.exit_code(), 1);

    let a = report.node(&id("S", "A")).unwrap();
    assert_eq!(a.state, NodeState::Failed);
    assert!(a.error.as_deref().unwrap_or_default().contains("injected failure"));

    let b = report.node(&id("S", "B")).unwrap();
    assert_eq!(b.state, NodeState::Applied);

    let c = report.node(&id("S", "C")).unwrap();
    assert_eq!(c.state, NodeState::Skipped);
    assert_eq!(c.skipped_because, Some(id("S", "A")));
    assert!(!h.provider.call_ids(CallKind::Create).contains(&"S/C".to_string()));

    assert_eq!(report.stack("S").unwrap().status, StackStatus::Failed);

    // B だけが状態に記録される
    let state = h.engine.state().load().await.unwrap();
    assert!(state.get_resource("S/B").is_some());
    assert!(state.get_resource("S/A").is_none());
    assert!(state.get_resource("S/C").is_none());
}

#[tokio::test]
async fn test_destroy_is_reverse_of_apply() {
    let deployment = iac_test();
    let h = harness(LocalProvider::new(), 1);

    let applied = h
        .engine
        .apply(&deployment, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(applied.status, RunStatus::Success);

    let destroyed = h
        .engine
        .destroy(&deployment, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(destroyed.status, RunStatus::Success);

    let mut created = h.provider.call_ids(CallKind::Create);
    created.reverse();
    assert_eq!(h.provider.call_ids(CallKind::Delete), created);
    assert!(
        destroyed
            .stacks
            .iter()
            .all(|s| s.status == StackStatus::Destroyed)
    );
    assert!(h.engine.state().load().await.unwrap().resources.is_empty());
}

#[tokio::test]
async fn test_failed_delete_keeps_producers() {
    let deployment = failing_fixture();
    let h = harness(LocalProvider::new().with_delete_failure("S/C"), 1);
    h.engine
        .apply(&deployment, CancellationToken::new())
        .await
        .unwrap();

    let report = h
        .engine
        .destroy(&deployment, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::PartialFailure);
    assert_eq!(report.node(&id("S", "C")).unwrap().state, NodeState::Failed);
    assert_eq!(report.node(&id("S", "A")).unwrap().state, NodeState::Skipped);
    assert_eq!(report.node(&id("S", "B")).unwrap().state, NodeState::Destroyed);

    let state = h.engine.state().load().await.unwrap();
    assert!(state.get_resource("S/A").is_some());
    assert_eq!(
        state.get_resource("S/C").unwrap().status,
        ResourceStatus::Failed
    );
    assert!(state.get_resource("S/B").is_none());
}

#[tokio::test]
async fn test_link_and_apply_are_deterministic() {
    let deployment = iac_test();
    let first = serde_json::to_value(link(&deployment).unwrap()).unwrap();
    let second = serde_json::to_value(link(&deployment).unwrap()).unwrap();
    assert_eq!(first, second);

    let one = harness(LocalProvider::new(), 1);
    let two = harness(LocalProvider::new(), 1);
    for h in [&one, &two] {
        h.engine
            .apply(&deployment, CancellationToken::new())
            .await
            .unwrap();
    }
    assert_eq!(
        one.provider.call_ids(CallKind::Create),
        two.provider.call_ids(CallKind::Create)
    );

    let recorded = |state: skyflow_cloud::GlobalState| {
        state
            .by_sequence()
            .into_iter()
            .map(|r| (r.id.clone(), r.sequence, r.outputs.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(
        recorded(one.engine.state().load().await.unwrap()),
        recorded(two.engine.state().load().await.unwrap())
    );
}

#[tokio::test]
async fn test_unchanged_nodes_are_reused() {
    let mut deployment = failing_fixture();
    let h = harness(LocalProvider::new(), 4);
    h.engine
        .apply(&deployment, CancellationToken::new())
        .await
        .unwrap();

    let again = h
        .engine
        .apply(&deployment, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(again.summary().unchanged, 3);
    assert!(h.provider.call_ids(CallKind::Update).is_empty());
    assert_eq!(h.provider.call_ids(CallKind::Create).len(), 3);

    // A の入力だけを変えると、ID を保つ更新なので C は変更なし
    let stack = deployment.stack_mut("S").unwrap();
    stack.nodes[0]
        .inputs
        .insert("cidr".to_string(), InputValue::literal("10.9.0.0/16"));
    let plan = h.engine.plan(&deployment).await.unwrap();
    assert_eq!(plan.summary().update, 1);

    let changed = h
        .engine
        .apply(&deployment, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(changed.summary().updated, 1);
    assert_eq!(h.provider.call_ids(CallKind::Update), vec!["S/A".to_string()]);

    let state = h.engine.state().load().await.unwrap();
    assert_eq!(
        state.get_resource("S/A").unwrap().inputs["cidr"],
        json!("10.9.0.0/16")
    );
}

#[tokio::test]
async fn test_removed_nodes_are_pruned_after_apply() {
    let mut deployment = failing_fixture();
    let h = harness(LocalProvider::new(), 4);
    h.engine
        .apply(&deployment, CancellationToken::new())
        .await
        .unwrap();

    let stack = deployment.stack_mut("S").unwrap();
    stack.nodes.retain(|n| n.id.name != "B");

    let report = h
        .engine
        .apply(&deployment, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.pruned, vec!["S/B".to_string()]);
    assert_eq!(h.provider.call_ids(CallKind::Delete), vec!["S/B".to_string()]);
    assert!(
        h.engine
            .state()
            .load()
            .await
            .unwrap()
            .get_resource("S/B")
            .is_none()
    );
}

#[tokio::test]
async fn test_destroy_leaves_undeclared_stacks_alone() {
    let mut deployment = failing_fixture();
    let mut other = Stack::new("Old", "us-east-1");
    other
        .add_node(ResourceNode::new(id("Old", "Vpc"), ResourceKind::Vpc).with_literal("cidr", "10.8.0.0/16"))
        .unwrap();
    deployment.add_stack(other).unwrap();

    let h = harness(LocalProvider::new(), 4);
    h.engine
        .apply(&deployment, CancellationToken::new())
        .await
        .unwrap();

    // Old スタックを宣言から外してから destroy
    deployment.stacks.retain(|s| s.name != "Old");
    let report = h
        .engine
        .destroy(&deployment, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert!(report.pruned.is_empty());
    assert!(
        !h.provider
            .call_ids(CallKind::Delete)
            .contains(&"Old/Vpc".to_string())
    );

    let state = h.engine.state().load().await.unwrap();
    assert!(state.get_resource("Old/Vpc").is_some());
    assert!(state.get_resource("S/A").is_none());
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let deployment = failing_fixture();
    let h = harness(LocalProvider::new(), 4);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = h.engine.apply(&deployment, cancel).await.unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.exit_code(), 1);
    assert!(h.provider.calls().is_empty());
    assert!(report.resources().all(|n| n.state == NodeState::Skipped));
}

#[tokio::test]
async fn test_cancel_lets_in_flight_calls_finish() {
    let deployment = iac_test();
    let h = harness(
        LocalProvider::new().with_latency(Duration::from_millis(50)),
        1,
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let report = h.engine.apply(&deployment, cancel).await.unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);

    // 実行中だった1件は完了し、それ以外は着手しない
    let started = h.provider.calls().len();
    assert_eq!(started, 1);
    let applied = report
        .resources()
        .filter(|n| n.state == NodeState::Applied)
        .count();
    assert_eq!(applied, 1);
    assert_eq!(
        h.engine.state().load().await.unwrap().resources.len(),
        1
    );
}

#[tokio::test]
async fn test_concurrent_runs_on_same_stack_are_rejected() {
    let deployment = failing_fixture();
    let table = StackLockTable::new();
    let h = harness(LocalProvider::new(), 4);
    let engine = h.engine.with_lock_table(table.clone());

    let _held = table.try_acquire(["S"]).unwrap();
    let err = engine
        .apply(&deployment, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StackLocked(ref s) if s == "S"));
    assert!(h.provider.calls().is_empty());
}

#[tokio::test]
async fn test_exports_and_virtual_inputs() {
    let deployment = iac_test();
    let h = harness(LocalProvider::new(), 4);
    let report = h
        .engine
        .apply(&deployment, CancellationToken::new())
        .await
        .unwrap();

    let acm = report.stack("AcmStack").unwrap();
    assert_eq!(acm.status, StackStatus::Applied);
    let arn = acm.exports["certificate_arn"].clone();
    assert!(
        arn.as_str()
            .unwrap()
            .starts_with("arn:aws:certificate:us-east-1:")
    );

    // 証明書 ARN はリージョンをまたいで両方の消費者に届く
    for consumer in ["Listener", "Distribution"] {
        let node = report.node(&id("CdkStack", consumer)).unwrap();
        assert_eq!(node.inputs["certificate_arn"], arn);
    }

    // 仮想入力ノードは状態に記録しない
    let state = h.engine.state().load().await.unwrap();
    assert!(state.resources.keys().all(|k| !k.contains("$input.")));
    assert_eq!(state.resources.len(), deployment.node_count());
}

#[tokio::test]
async fn test_broken_reference_is_configuration_error() {
    let mut stack = Stack::new("S", "us-east-1");
    stack
        .add_node(
            ResourceNode::new(id("S", "Sg"), ResourceKind::SecurityGroup)
                .with_input("vpc_id", InputValue::Reference(out("S", "Nope", "vpc_id"))),
        )
        .unwrap();
    let mut deployment = Deployment::new("broken");
    deployment.add_stack(stack).unwrap();

    let h = harness(LocalProvider::new(), 4);
    let err = h
        .engine
        .apply(&deployment, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Configuration(ConfigurationError::BrokenReference { .. })
    ));
}
