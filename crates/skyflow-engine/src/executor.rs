//! トポロジカル実行器
//!
//! 依存グラフを依存順に辿り、準備できたノードから並列度の上限まで同時に
//! プロバイダーへ渡します。apply は作成順序、destroy は辺を逆にした同じループです。
//!
//! - 失敗したノードの推移的な依存先はスキップ（着手済みのものは完了まで待つ）
//! - キャンセル後は新しいノードに着手せず、実行中の呼び出しだけを待つ
//! - 仮想入力ノードと入力に変更のないノードはプロバイダーを呼ばずに確定

use crate::error::EngineError;
use crate::graph::{DependencyGraph, VertexId, VertexInput};
use crate::report::{NodeReport, NodeState, Operation, RunReport, RunStatus};
use chrono::Utc;
use serde_json::Value;
use skyflow_cloud::{
    ActionType, CloudError, CloudProvider, GlobalState, ResourceConfig, ResourceOutputs,
    ResourceStatus,
};
use skyflow_core::{Deployment, OutputStore, Resolution};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// 既定の並列度
pub const DEFAULT_PARALLELISM: usize = 4;

/// プロバイダー呼び出しの結果
struct TaskOutcome {
    vertex: VertexId,
    action: ActionType,
    inputs: BTreeMap<String, Value>,
    result: Result<ResourceOutputs, CloudError>,
}

/// ノードの着手準備
enum Prepared {
    /// プロバイダーを呼ばずに確定
    Inline {
        action: Option<ActionType>,
        inputs: BTreeMap<String, Value>,
        outputs: ResourceOutputs,
    },
    /// プロバイダー呼び出しが必要
    Call {
        action: ActionType,
        config: ResourceConfig,
        current: ResourceOutputs,
    },
}

pub struct Executor {
    provider: Arc<dyn CloudProvider>,
    parallelism: usize,
}

impl Executor {
    pub fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self {
            provider,
            parallelism: DEFAULT_PARALLELISM,
        }
    }

    /// 並列度（最小1）
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// 作成順に適用
    pub async fn apply(
        &self,
        deployment: &Deployment,
        graph: &DependencyGraph,
        prior: &GlobalState,
        cancel: CancellationToken,
    ) -> RunReport {
        self.run(deployment, graph, prior, Operation::Apply, cancel)
            .await
    }

    /// 作成の逆順に削除
    pub async fn destroy(
        &self,
        deployment: &Deployment,
        graph: &DependencyGraph,
        prior: &GlobalState,
        cancel: CancellationToken,
    ) -> RunReport {
        self.run(deployment, graph, prior, Operation::Destroy, cancel)
            .await
    }

    #[instrument(skip_all, fields(
        deployment = %deployment.name,
        operation = ?operation,
        parallelism = self.parallelism,
    ))]
    async fn run(
        &self,
        deployment: &Deployment,
        graph: &DependencyGraph,
        prior: &GlobalState,
        operation: Operation,
        cancel: CancellationToken,
    ) -> RunReport {
        let started_at = Utc::now();
        let mut run = Run::new(graph, prior, operation);

        info!(nodes = graph.len(), "Starting run");

        let mut join_set: JoinSet<TaskOutcome> = JoinSet::new();
        let mut in_flight: BTreeSet<VertexId> = BTreeSet::new();
        let mut cancelled = false;

        loop {
            // 着手できるノードを並列度の上限まで起動
            while run.aborted.is_none() && !cancelled && in_flight.len() < self.parallelism {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                let Some(v) = run.next_ready() else {
                    break;
                };

                run.start(v);
                match run.prepare(v) {
                    Ok(Prepared::Inline {
                        action,
                        inputs,
                        outputs,
                    }) => run.succeed(v, action, inputs, outputs),
                    Ok(Prepared::Call {
                        action,
                        config,
                        current,
                    }) => {
                        debug!(node = %graph.vertex(v).id, action = %action, "Calling provider");
                        in_flight.insert(v);
                        let provider = Arc::clone(&self.provider);
                        join_set.spawn(async move {
                            let result = match action {
                                ActionType::Create => provider.create(&config).await,
                                ActionType::Update => provider.update(&config, &current).await,
                                ActionType::Delete => provider
                                    .delete(&config, &current)
                                    .await
                                    .map(|_| ResourceOutputs::new()),
                                ActionType::NoOp => Ok(current),
                            };
                            TaskOutcome {
                                vertex: v,
                                action,
                                inputs: config.inputs,
                                result,
                            }
                        });
                    }
                    Err(e) => {
                        warn!(node = %graph.vertex(v).id, error = %e, "Aborting run");
                        run.aborted = Some(e.to_string());
                    }
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                joined = join_set.join_next() => match joined {
                    Some(Ok(outcome)) => {
                        in_flight.remove(&outcome.vertex);
                        run.finish(outcome);
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Provider task did not complete");
                        run.aborted.get_or_insert_with(|| format!("タスクが異常終了しました: {e}"));
                    }
                    None => break,
                },
                _ = cancel.cancelled(), if !cancelled => {
                    info!(in_flight = in_flight.len(), "Cancellation requested, waiting for in-flight calls");
                    cancelled = true;
                }
            }
        }

        // 異常終了したタスクのノード
        for v in in_flight {
            run.fail(v, "タスクが異常終了しました".to_string());
        }

        let remaining = run.skip_remaining();
        let status = if run.aborted.is_some() {
            RunStatus::Aborted
        } else if cancelled && remaining > 0 {
            RunStatus::Cancelled
        } else if run.reports.iter().any(|r| r.state == NodeState::Failed) {
            RunStatus::PartialFailure
        } else {
            RunStatus::Success
        };

        let aborted = run.aborted.take();
        let mut report = RunReport::new(deployment, operation, status, run.reports, started_at);
        report.error = aborted;

        info!(status = %report.status, summary = %report.summary(), "Run finished");
        report
    }

    /// 宣言から消えたリソースを作成の逆順に削除して状態から除く
    ///
    /// 削除できたリソースのキーを返します。失敗したものは状態に残します。
    #[instrument(skip_all)]
    pub async fn prune_orphans(
        &self,
        graph: &DependencyGraph,
        state: &mut GlobalState,
    ) -> (Vec<String>, Vec<String>) {
        let declared: HashSet<String> = graph
            .vertices()
            .iter()
            .filter(|v| !v.is_virtual())
            .map(|v| v.id.key())
            .collect();
        let orphans: Vec<_> = state
            .by_sequence()
            .into_iter()
            .rev()
            .filter(|r| !declared.contains(&r.id))
            .cloned()
            .collect();

        let mut pruned = Vec::new();
        let mut errors = Vec::new();
        for resource in orphans {
            let mut config =
                ResourceConfig::new(&resource.resource_type, &resource.id, &resource.region);
            config.inputs = resource.inputs.clone();

            match self.provider.delete(&config, &resource.outputs).await {
                Ok(()) => {
                    info!(resource = %resource.id, "Deleted orphaned resource");
                    state.remove_resource(&resource.id);
                    pruned.push(resource.id);
                }
                Err(e) => {
                    warn!(resource = %resource.id, error = %e, "Failed to delete orphaned resource");
                    errors.push(format!("{}: {}", resource.id, e));
                }
            }
        }
        (pruned, errors)
    }
}

/// 1回の実行の進行状況
struct Run<'a> {
    graph: &'a DependencyGraph,
    prior: &'a GlobalState,
    operation: Operation,
    /// 実行順序上の位置（ready 集合の優先度）
    rank: Vec<usize>,
    /// 未完了の依存元の数
    waiting: Vec<usize>,
    ready: BinaryHeap<Reverse<(usize, VertexId)>>,
    store: OutputStore,
    reports: Vec<NodeReport>,
    step: usize,
    aborted: Option<String>,
}

impl<'a> Run<'a> {
    fn new(graph: &'a DependencyGraph, prior: &'a GlobalState, operation: Operation) -> Self {
        let order = match operation {
            Operation::Apply => graph.topological_order().to_vec(),
            Operation::Destroy => graph.destroy_order(),
        };
        let mut rank = vec![0; graph.len()];
        for (position, &v) in order.iter().enumerate() {
            rank[v] = position;
        }

        let mut run = Self {
            graph,
            prior,
            operation,
            rank,
            waiting: Vec::with_capacity(graph.len()),
            ready: BinaryHeap::new(),
            store: OutputStore::new(),
            reports: Vec::with_capacity(graph.len()),
            step: 0,
            aborted: None,
        };

        for v in 0..graph.len() {
            let vertex = graph.vertex(v);
            let mut report = NodeReport::new(vertex.id.clone(), vertex.kind, &vertex.region);
            report.transition(NodeState::Planned);
            run.reports.push(report);

            let waiting = run.requires(v).len();
            run.waiting.push(waiting);
            if waiting == 0 {
                run.ready.push(Reverse((run.rank[v], v)));
            }
        }
        run
    }

    /// 先に完了している必要があるノード
    fn requires(&self, v: VertexId) -> &'a [VertexId] {
        match self.operation {
            Operation::Apply => self.graph.predecessors(v),
            Operation::Destroy => self.graph.successors(v),
        }
    }

    /// 完了を待っているノード
    fn unblocks(&self, v: VertexId) -> &'a [VertexId] {
        match self.operation {
            Operation::Apply => self.graph.successors(v),
            Operation::Destroy => self.graph.predecessors(v),
        }
    }

    fn next_ready(&mut self) -> Option<VertexId> {
        while let Some(Reverse((_, v))) = self.ready.pop() {
            if !self.reports[v].state.is_terminal() {
                return Some(v);
            }
        }
        None
    }

    fn next_step(&mut self) -> usize {
        let step = self.step;
        self.step += 1;
        step
    }

    fn start(&mut self, v: VertexId) {
        let step = self.next_step();
        let in_progress = match self.operation {
            Operation::Apply => NodeState::Applying,
            Operation::Destroy => NodeState::Destroying,
        };
        let report = &mut self.reports[v];
        report.started_step = Some(step);
        report.transition(in_progress);
    }

    fn prepare(&self, v: VertexId) -> Result<Prepared, EngineError> {
        match self.operation {
            Operation::Apply => self.prepare_apply(v),
            Operation::Destroy => Ok(self.prepare_destroy(v)),
        }
    }

    fn prepare_apply(&self, v: VertexId) -> Result<Prepared, EngineError> {
        let vertex = self.graph.vertex(v);

        let mut inputs = BTreeMap::new();
        for (name, input) in &vertex.inputs {
            let value = match input {
                VertexInput::Literal(value) => value.clone(),
                VertexInput::Bound(index) => {
                    let binding = self.graph.binding(*index);
                    let unresolved = || EngineError::UnresolvedReference {
                        producer: binding.producer.to_string(),
                        output: binding.output.clone(),
                        consumer: binding.consumer.to_string(),
                        input: binding.input.clone(),
                    };
                    match binding.resolve(&self.store) {
                        Ok(Resolution::Resolved(value)) => vertex.kind.coerce_input(name, value),
                        Ok(Resolution::Pending) | Err(_) => return Err(unresolved()),
                    }
                }
            };
            inputs.insert(name.clone(), value);
        }

        if vertex.is_virtual() {
            let outputs = inputs
                .get("value")
                .map(|value| ResourceOutputs::from([("value".to_string(), value.clone())]))
                .unwrap_or_default();
            return Ok(Prepared::Inline {
                action: None,
                inputs,
                outputs,
            });
        }

        match self.prior.get_resource(&vertex.id.key()) {
            Some(existing)
                if existing.status == ResourceStatus::Applied && existing.inputs == inputs =>
            {
                debug!(node = %vertex.id, "Inputs unchanged, reusing recorded outputs");
                Ok(Prepared::Inline {
                    action: Some(ActionType::NoOp),
                    inputs,
                    outputs: existing.outputs.clone(),
                })
            }
            Some(existing) => Ok(Prepared::Call {
                action: ActionType::Update,
                config: self.config(v, inputs),
                current: existing.outputs.clone(),
            }),
            None => Ok(Prepared::Call {
                action: ActionType::Create,
                config: self.config(v, inputs),
                current: ResourceOutputs::new(),
            }),
        }
    }

    fn prepare_destroy(&self, v: VertexId) -> Prepared {
        let vertex = self.graph.vertex(v);
        let existing = if vertex.is_virtual() {
            None
        } else {
            self.prior.get_resource(&vertex.id.key())
        };

        match existing {
            Some(existing) => Prepared::Call {
                action: ActionType::Delete,
                config: self.config(v, existing.inputs.clone()),
                current: existing.outputs.clone(),
            },
            None => Prepared::Inline {
                action: None,
                inputs: BTreeMap::new(),
                outputs: ResourceOutputs::new(),
            },
        }
    }

    fn config(&self, v: VertexId, inputs: BTreeMap<String, Value>) -> ResourceConfig {
        let vertex = self.graph.vertex(v);
        let mut config = ResourceConfig::new(vertex.kind.as_str(), vertex.id.key(), &vertex.region)
            .with_account(vertex.account.clone());
        config.inputs = inputs;
        config
    }

    fn finish(&mut self, outcome: TaskOutcome) {
        let TaskOutcome {
            vertex: v,
            action,
            inputs,
            result,
        } = outcome;

        match result {
            Ok(outputs) => {
                let kind = self.graph.vertex(v).kind;
                let missing = kind
                    .outputs()
                    .iter()
                    .find(|spec| self.operation == Operation::Apply && !outputs.contains_key(spec.name));
                match missing {
                    Some(spec) => self.fail(
                        v,
                        format!("プロバイダーが出力 '{}' を返しませんでした", spec.name),
                    ),
                    None => self.succeed(v, Some(action), inputs, outputs),
                }
            }
            Err(e) => self.fail(v, e.to_string()),
        }
    }

    fn succeed(
        &mut self,
        v: VertexId,
        action: Option<ActionType>,
        inputs: BTreeMap<String, Value>,
        outputs: ResourceOutputs,
    ) {
        let id = self.graph.vertex(v).id.clone();
        let done = match self.operation {
            Operation::Apply => NodeState::Applied,
            Operation::Destroy => NodeState::Destroyed,
        };

        if self.operation == Operation::Apply
            && let Err(e) = self.store.insert(id.clone(), outputs.clone())
        {
            self.aborted.get_or_insert_with(|| e.to_string());
        }

        let step = self.next_step();
        let report = &mut self.reports[v];
        report.action = action;
        report.inputs = inputs;
        report.outputs = outputs;
        report.finished_step = Some(step);
        report.transition(done);
        debug!(node = %id, state = %done, "Node finished");

        for &next in self.unblocks(v) {
            self.waiting[next] -= 1;
            if self.waiting[next] == 0 && !self.reports[next].state.is_terminal() {
                self.ready.push(Reverse((self.rank[next], next)));
            }
        }
    }

    /// 失敗を記録し、このノードを待つノードを推移的にスキップ
    fn fail(&mut self, v: VertexId, error: String) {
        let id = self.graph.vertex(v).id.clone();
        warn!(node = %id, error = %error, "Node failed");

        let step = self.next_step();
        let report = &mut self.reports[v];
        report.error = Some(error);
        report.finished_step = Some(step);
        report.transition(NodeState::Failed);

        let forward = self.operation == Operation::Apply;
        for dependent in self.graph.reachable(v, forward) {
            let report = &mut self.reports[dependent];
            if !report.state.is_terminal() && report.started_step.is_none() {
                report.skipped_because = Some(id.clone());
                report.transition(NodeState::Skipped);
            }
        }
    }

    /// 未着手のノードをスキップし、その数を返す
    fn skip_remaining(&mut self) -> usize {
        let mut skipped = 0;
        for report in &mut self.reports {
            if !report.state.is_terminal() {
                report.transition(NodeState::Skipped);
                skipped += 1;
            }
        }
        skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linker::link;
    use skyflow_cloud_local::{CallKind, LocalProvider};
    use skyflow_core::{InputValue, OutputRef, ResourceKind, Stack};

    /// A → B、C は A に依存しない
    fn deployment() -> Deployment {
        let mut stack = Stack::new("Net", "us-east-1");
        let vpc = stack
            .declare(
                "Vpc",
                ResourceKind::Vpc,
                [("cidr".to_string(), InputValue::literal("10.0.0.0/16"))],
            )
            .unwrap();
        stack
            .declare(
                "Sg",
                ResourceKind::SecurityGroup,
                [(
                    "vpc_id".to_string(),
                    InputValue::Reference(OutputRef::new(vpc, "vpc_id")),
                )],
            )
            .unwrap();
        stack
            .declare(
                "Other",
                ResourceKind::Vpc,
                [("cidr".to_string(), InputValue::literal("10.1.0.0/16"))],
            )
            .unwrap();
        let mut d = Deployment::new("test");
        d.add_stack(stack).unwrap();
        d
    }

    #[tokio::test]
    async fn test_apply_passes_outputs_downstream() {
        let d = deployment();
        let graph = link(&d).unwrap();
        let provider = Arc::new(LocalProvider::new());
        let executor = Executor::new(provider.clone()).with_parallelism(1);

        let report = executor
            .apply(&d, &graph, &GlobalState::new(), CancellationToken::new())
            .await;

        assert_eq!(report.status, RunStatus::Success);
        let vpc_id = &report
            .node(&skyflow_core::NodeId::new("Net", "Vpc"))
            .unwrap()
            .outputs["vpc_id"];
        let sg = report
            .node(&skyflow_core::NodeId::new("Net", "Sg"))
            .unwrap();
        assert_eq!(&sg.inputs["vpc_id"], vpc_id);
        assert_eq!(provider.call_ids(CallKind::Create).len(), 3);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let d = deployment();
        let graph = link(&d).unwrap();
        let provider = Arc::new(LocalProvider::new().with_failure("Net/Vpc"));
        let executor = Executor::new(provider.clone());

        let report = executor
            .apply(&d, &graph, &GlobalState::new(), CancellationToken::new())
            .await;

        assert_eq!(report.status, RunStatus::PartialFailure);
        let sg = report
            .node(&skyflow_core::NodeId::new("Net", "Sg"))
            .unwrap();
        assert_eq!(sg.state, NodeState::Skipped);
        assert_eq!(
            sg.skipped_because,
            Some(skyflow_core::NodeId::new("Net", "Vpc"))
        );
        assert_eq!(
            report
                .node(&skyflow_core::NodeId::new("Net", "Other"))
                .unwrap()
                .state,
            NodeState::Applied
        );
        assert!(!provider.call_ids(CallKind::Create).contains(&"Net/Sg".to_string()));
    }

    #[tokio::test]
    async fn test_missing_recorded_output_aborts_run() {
        let d = deployment();
        let graph = link(&d).unwrap();

        let first = Executor::new(Arc::new(LocalProvider::new()))
            .with_parallelism(1)
            .apply(&d, &graph, &GlobalState::new(), CancellationToken::new())
            .await;
        let mut state = GlobalState::new();
        first.record_into(&mut state);
        // 入力は同じなので Vpc は再利用されるが、記録済みの出力から vpc_id が欠けている
        state
            .resources
            .get_mut("Net/Vpc")
            .unwrap()
            .outputs
            .remove("vpc_id");

        let provider = Arc::new(LocalProvider::new());
        let report = Executor::new(provider.clone())
            .with_parallelism(1)
            .apply(&d, &graph, &state, CancellationToken::new())
            .await;

        assert_eq!(report.status, RunStatus::Aborted);
        assert!(report.error.as_deref().unwrap().contains("Net/Sg"));
        let node = |name: &str| {
            report
                .node(&skyflow_core::NodeId::new("Net", name))
                .unwrap()
                .state
        };
        assert_eq!(node("Vpc"), NodeState::Applied);
        assert_ne!(node("Sg"), NodeState::Applied);
        assert_ne!(node("Other"), NodeState::Applied);
        assert!(provider.call_ids(CallKind::Create).is_empty());
        assert!(provider.call_ids(CallKind::Update).is_empty());
    }

    #[tokio::test]
    async fn test_parallelism_is_clamped_to_one() {
        let executor = Executor::new(Arc::new(LocalProvider::new())).with_parallelism(0);
        assert_eq!(executor.parallelism(), 1);
    }

    #[tokio::test]
    async fn test_prune_orphans() {
        let d = deployment();
        let graph = link(&d).unwrap();
        let provider = Arc::new(LocalProvider::new());
        let executor = Executor::new(provider.clone());

        let mut state = GlobalState::new();
        state.set_resource(
            "Old/Vpc".to_string(),
            skyflow_cloud::ResourceState::new("Old/Vpc", "vpc", "Old", "us-east-1"),
        );
        let (pruned, errors) = executor.prune_orphans(&graph, &mut state).await;

        assert_eq!(pruned, vec!["Old/Vpc".to_string()]);
        assert!(errors.is_empty());
        assert!(state.resources.is_empty());
        assert_eq!(provider.call_ids(CallKind::Delete), vec!["Old/Vpc".to_string()]);
    }
}
