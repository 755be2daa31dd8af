//! 実行レポート
//!
//! 1回の apply / destroy の結果。ノードごとの状態遷移・エラー・スキップ理由と、
//! そこから導かれるスタックの状態と実行全体のステータスを持ちます。

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use skyflow_cloud::{ActionType, GlobalState, ResourceState, ResourceStatus};
use skyflow_core::{Deployment, NodeId, ResourceKind};
use std::collections::BTreeMap;
use std::fmt;

/// ノードのライフサイクル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Declared,
    Planned,
    Applying,
    Applied,
    Failed,
    Skipped,
    Destroying,
    Destroyed,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Applied | NodeState::Failed | NodeState::Skipped | NodeState::Destroyed
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Declared => "declared",
            NodeState::Planned => "planned",
            NodeState::Applying => "applying",
            NodeState::Applied => "applied",
            NodeState::Failed => "failed",
            NodeState::Skipped => "skipped",
            NodeState::Destroying => "destroying",
            NodeState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// 実行全体のステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// 一部のノードが失敗（依存先はスキップ）
    PartialFailure,
    /// キャンセルにより未着手のノードが残った
    Cancelled,
    /// 実行中の内部エラーで中断
    Aborted,
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::PartialFailure | RunStatus::Cancelled => 1,
            RunStatus::Aborted => 2,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Success => "success",
            RunStatus::PartialFailure => "partial failure",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// 実行の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Apply,
    Destroy,
}

/// ノード単位の結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeReport {
    pub id: NodeId,
    pub kind: ResourceKind,
    pub region: String,
    pub state: NodeState,
    /// 通過した状態（先頭は Declared）
    pub transitions: Vec<NodeState>,
    /// プロバイダーに対して行った操作（再利用時は NoOp）
    pub action: Option<ActionType>,
    pub error: Option<String>,
    /// スキップの原因となった失敗ノード
    pub skipped_because: Option<NodeId>,
    pub inputs: BTreeMap<String, Value>,
    pub outputs: BTreeMap<String, Value>,
    /// 着手・完了を観測した順番（実行全体で単調増加）
    pub started_step: Option<usize>,
    pub finished_step: Option<usize>,
}

impl NodeReport {
    pub fn new(id: NodeId, kind: ResourceKind, region: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            region: region.into(),
            state: NodeState::Declared,
            transitions: vec![NodeState::Declared],
            action: None,
            error: None,
            skipped_because: None,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            started_step: None,
            finished_step: None,
        }
    }

    pub fn transition(&mut self, state: NodeState) {
        if self.state != state {
            self.state = state;
            self.transitions.push(state);
        }
    }

    pub fn is_virtual(&self) -> bool {
        self.kind.is_virtual()
    }
}

/// スタックの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StackStatus {
    /// 全ノードが適用済みで、全エクスポートが解決可能
    Applied,
    Destroyed,
    /// 失敗したノードを含む
    Failed,
    /// スキップ・未着手のノードを含む
    Incomplete,
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StackStatus::Applied => "applied",
            StackStatus::Destroyed => "destroyed",
            StackStatus::Failed => "failed",
            StackStatus::Incomplete => "incomplete",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackReport {
    pub name: String,
    pub region: String,
    pub status: StackStatus,
    /// 解決済みのエクスポート値
    pub exports: BTreeMap<String, Value>,
}

/// 集計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub skipped: usize,
    pub destroyed: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} unchanged, {} destroyed, {} failed, {} skipped",
            self.created, self.updated, self.unchanged, self.destroyed, self.failed, self.skipped
        )
    }
}

/// 実行レポート
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub deployment: String,
    pub operation: Operation,
    pub status: RunStatus,
    /// グラフの頂点順（仮想入力ノードを含む）
    pub nodes: Vec<NodeReport>,
    pub stacks: Vec<StackReport>,
    /// 中断理由
    pub error: Option<String>,
    /// 実行後に状態から削除した孤立リソース
    pub pruned: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub(crate) fn new(
        deployment: &Deployment,
        operation: Operation,
        status: RunStatus,
        nodes: Vec<NodeReport>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let stacks = stack_reports(deployment, operation, &nodes);
        Self {
            deployment: deployment.name.clone(),
            operation,
            status,
            nodes,
            stacks,
            error: None,
            pruned: Vec::new(),
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn stack(&self, name: &str) -> Option<&StackReport> {
        self.stacks.iter().find(|s| s.name == name)
    }

    /// 仮想入力ノードを除いたノード
    pub fn resources(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter().filter(|n| !n.is_virtual())
    }

    pub fn failed(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter().filter(|n| n.state == NodeState::Failed)
    }

    /// 完了した順のノードID（仮想入力ノードを除く）
    pub fn completion_order(&self) -> Vec<&NodeId> {
        let mut finished: Vec<_> = self
            .resources()
            .filter_map(|n| n.finished_step.map(|step| (step, &n.id)))
            .collect();
        finished.sort_by_key(|(step, _)| *step);
        finished.into_iter().map(|(_, id)| id).collect()
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for node in self.resources() {
            match node.state {
                NodeState::Applied => match node.action {
                    Some(ActionType::Create) => summary.created += 1,
                    Some(ActionType::Update) => summary.updated += 1,
                    _ => summary.unchanged += 1,
                },
                NodeState::Destroyed => summary.destroyed += 1,
                NodeState::Failed => summary.failed += 1,
                NodeState::Skipped => summary.skipped += 1,
                _ => {}
            }
        }
        summary
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    /// 結果を状態へ反映
    ///
    /// - 適用されたノードは入力・出力を記録（新規は完了順に作成順序を採番）
    /// - 既存ノードの失敗は Failed として記録
    /// - 削除されたノードは状態から除く
    ///
    /// 仮想入力ノードは記録しません。
    pub fn record_into(&self, state: &mut GlobalState) {
        let mut nodes: Vec<&NodeReport> = self.resources().collect();
        nodes.sort_by_key(|n| n.finished_step.unwrap_or(usize::MAX));

        for node in nodes {
            let key = node.id.key();
            match node.state {
                NodeState::Applied => {
                    if node.action == Some(ActionType::NoOp) && state.get_resource(&key).is_some() {
                        continue;
                    }
                    let (sequence, created_at) = match state.get_resource(&key) {
                        Some(existing) => (existing.sequence, existing.created_at),
                        None => (state.next_sequence(), Utc::now()),
                    };
                    let mut resource = ResourceState::new(
                        &key,
                        node.kind.as_str(),
                        &node.id.stack,
                        &node.region,
                    )
                    .with_sequence(sequence)
                    .with_inputs(node.inputs.clone())
                    .with_outputs(node.outputs.clone());
                    resource.created_at = created_at;
                    state.set_resource(key, resource);
                }
                NodeState::Failed => {
                    if let Some(existing) = state.get_resource(&key) {
                        let failed = existing.clone().with_status(ResourceStatus::Failed);
                        state.set_resource(key, failed);
                    }
                }
                NodeState::Destroyed => {
                    state.remove_resource(&key);
                }
                _ => {}
            }
        }
    }
}

fn stack_reports(
    deployment: &Deployment,
    operation: Operation,
    nodes: &[NodeReport],
) -> Vec<StackReport> {
    deployment
        .stacks
        .iter()
        .map(|stack| {
            let members: Vec<&NodeReport> =
                nodes.iter().filter(|n| n.id.stack == stack.name).collect();

            let exports: BTreeMap<String, Value> = stack
                .exports
                .iter()
                .filter_map(|(name, export)| {
                    members
                        .iter()
                        .find(|n| n.id == export.node && n.state == NodeState::Applied)
                        .and_then(|n| n.outputs.get(&export.output))
                        .map(|value| (name.clone(), value.clone()))
                })
                .collect();

            let done = match operation {
                Operation::Apply => NodeState::Applied,
                Operation::Destroy => NodeState::Destroyed,
            };
            let status = if members.iter().any(|n| n.state == NodeState::Failed) {
                StackStatus::Failed
            } else if !members.iter().all(|n| n.state == done) {
                StackStatus::Incomplete
            } else if operation == Operation::Destroy {
                StackStatus::Destroyed
            } else if exports.len() == stack.exports.len() {
                StackStatus::Applied
            } else {
                StackStatus::Incomplete
            };

            StackReport {
                name: stack.name.clone(),
                region: stack.region.clone(),
                status,
                exports,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skyflow_core::{InputValue, Stack};

    fn applied(name: &str, step: usize, action: ActionType) -> NodeReport {
        let mut node = NodeReport::new(NodeId::new("S", name), ResourceKind::Vpc, "us-east-1");
        node.transition(NodeState::Planned);
        node.transition(NodeState::Applying);
        node.transition(NodeState::Applied);
        node.action = Some(action);
        node.inputs.insert("cidr".to_string(), json!("10.0.0.0/16"));
        node.outputs.insert("vpc_id".to_string(), json!(format!("vpc-{name}")));
        node.finished_step = Some(step);
        node
    }

    fn deployment() -> Deployment {
        let mut stack = Stack::new("S", "us-east-1");
        let a = stack
            .declare(
                "A",
                ResourceKind::Vpc,
                [("cidr".to_string(), InputValue::literal("10.0.0.0/16"))],
            )
            .unwrap();
        stack
            .declare(
                "B",
                ResourceKind::Vpc,
                [("cidr".to_string(), InputValue::literal("10.0.0.0/16"))],
            )
            .unwrap();
        stack.export_output("vpc", &a, "vpc_id").unwrap();
        let mut d = Deployment::new("test");
        d.add_stack(stack).unwrap();
        d
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunStatus::Success.exit_code(), 0);
        assert_eq!(RunStatus::PartialFailure.exit_code(), 1);
        assert_eq!(RunStatus::Cancelled.exit_code(), 1);
        assert_eq!(RunStatus::Aborted.exit_code(), 2);
    }

    #[test]
    fn test_transition_records_history() {
        let node = applied("A", 0, ActionType::Create);
        assert_eq!(
            node.transitions,
            vec![
                NodeState::Declared,
                NodeState::Planned,
                NodeState::Applying,
                NodeState::Applied
            ]
        );
        assert!(node.state.is_terminal());
    }

    #[test]
    fn test_stack_status_and_exports() {
        let d = deployment();
        let report = RunReport::new(
            &d,
            Operation::Apply,
            RunStatus::Success,
            vec![applied("A", 0, ActionType::Create), applied("B", 1, ActionType::Create)],
            Utc::now(),
        );
        let stack = report.stack("S").unwrap();
        assert_eq!(stack.status, StackStatus::Applied);
        assert_eq!(stack.exports["vpc"], json!("vpc-A"));

        let mut skipped = NodeReport::new(NodeId::new("S", "B"), ResourceKind::Vpc, "us-east-1");
        skipped.transition(NodeState::Skipped);
        let report = RunReport::new(
            &d,
            Operation::Apply,
            RunStatus::PartialFailure,
            vec![applied("A", 0, ActionType::Create), skipped],
            Utc::now(),
        );
        assert_eq!(report.stack("S").unwrap().status, StackStatus::Incomplete);
        assert_eq!(report.summary().skipped, 1);
    }

    #[test]
    fn test_record_into_assigns_sequence_in_completion_order() {
        let d = deployment();
        let report = RunReport::new(
            &d,
            Operation::Apply,
            RunStatus::Success,
            vec![applied("A", 5, ActionType::Create), applied("B", 2, ActionType::Create)],
            Utc::now(),
        );
        let mut state = GlobalState::new();
        report.record_into(&mut state);

        assert_eq!(state.get_resource("S/B").unwrap().sequence, 0);
        assert_eq!(state.get_resource("S/A").unwrap().sequence, 1);
        assert_eq!(
            state.get_resource("S/A").unwrap().get_output::<String>("vpc_id"),
            Some("vpc-A".to_string())
        );
        assert_eq!(report.completion_order(), vec![
            &NodeId::new("S", "B"),
            &NodeId::new("S", "A")
        ]);
    }

    #[test]
    fn test_record_into_update_keeps_sequence_and_marks_failures() {
        let d = deployment();
        let mut state = GlobalState::new();
        state.set_resource(
            "S/A".to_string(),
            ResourceState::new("S/A", "vpc", "S", "us-east-1").with_sequence(7),
        );
        state.set_resource(
            "S/B".to_string(),
            ResourceState::new("S/B", "vpc", "S", "us-east-1").with_sequence(8),
        );

        let mut failed = NodeReport::new(NodeId::new("S", "B"), ResourceKind::Vpc, "us-east-1");
        failed.transition(NodeState::Failed);
        failed.error = Some("boom".to_string());

        let report = RunReport::new(
            &d,
            Operation::Apply,
            RunStatus::PartialFailure,
            vec![applied("A", 0, ActionType::Update), failed],
            Utc::now(),
        );
        report.record_into(&mut state);

        let a = state.get_resource("S/A").unwrap();
        assert_eq!(a.sequence, 7);
        assert_eq!(a.outputs["vpc_id"], json!("vpc-A"));
        assert_eq!(
            state.get_resource("S/B").unwrap().status,
            ResourceStatus::Failed
        );
    }

    #[test]
    fn test_record_into_removes_destroyed() {
        let d = deployment();
        let mut state = GlobalState::new();
        state.set_resource(
            "S/A".to_string(),
            ResourceState::new("S/A", "vpc", "S", "us-east-1"),
        );
        let mut destroyed = NodeReport::new(NodeId::new("S", "A"), ResourceKind::Vpc, "us-east-1");
        destroyed.transition(NodeState::Destroyed);

        let report = RunReport::new(
            &d,
            Operation::Destroy,
            RunStatus::Success,
            vec![destroyed],
            Utc::now(),
        );
        report.record_into(&mut state);
        assert!(state.resources.is_empty());
    }
}
