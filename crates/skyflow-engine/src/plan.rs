//! 実行計画のプレビュー
//!
//! 前回の状態と宣言を比較し、プロバイダーを呼ばずに作成・更新・変更なし・削除を見積もります。
//! 生産者が新規作成になる入力は適用後まで値が確定しないため、消費者は変更ありとして扱います。

use crate::graph::{DependencyGraph, VertexId, VertexInput};
use serde_json::Value;
use skyflow_cloud::{Action, ActionType, GlobalState, Plan, ResourceStatus};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, instrument};

/// 適用後に確定する値の表示
const KNOWN_AFTER_APPLY: &str = "(known after apply)";

/// 依存グラフと状態から計画を作成
#[instrument(skip_all, fields(vertices = graph.len(), resources = state.resources.len()))]
pub fn plan(graph: &DependencyGraph, state: &GlobalState) -> Plan {
    let mut planned: HashMap<VertexId, ActionType> = HashMap::new();
    let mut actions = Vec::new();

    for &v in graph.topological_order() {
        let vertex = graph.vertex(v);
        if vertex.is_virtual() {
            continue;
        }

        let key = vertex.id.key();
        let mut inputs = BTreeMap::new();
        let mut pending = Vec::new();
        for name in vertex.inputs.keys() {
            match resolve(graph, state, &planned, v, name) {
                Some(value) => {
                    inputs.insert(name.clone(), vertex.kind.coerce_input(name, value));
                }
                None => pending.push(name.clone()),
            }
        }

        let kind = vertex.kind.as_str();
        let action = match state.get_resource(&key) {
            None => {
                let mut action = Action::new(ActionType::Create, kind, &key, "作成");
                for name in &pending {
                    action = action.with_change(name, Value::String(KNOWN_AFTER_APPLY.into()));
                }
                action
            }
            Some(existing) => {
                let mut changes: BTreeMap<String, Value> = inputs
                    .iter()
                    .filter(|(name, value)| existing.inputs.get(name.as_str()) != Some(*value))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect();
                for name in &pending {
                    changes.insert(name.clone(), Value::String(KNOWN_AFTER_APPLY.into()));
                }
                for name in existing.inputs.keys() {
                    if !vertex.inputs.contains_key(name) {
                        changes.insert(name.clone(), Value::Null);
                    }
                }

                if changes.is_empty() && existing.status == ResourceStatus::Applied {
                    Action::new(ActionType::NoOp, kind, &key, "変更なし")
                } else {
                    let description = if existing.status == ResourceStatus::Failed {
                        "更新（前回失敗）"
                    } else {
                        "更新"
                    };
                    let mut action = Action::new(ActionType::Update, kind, &key, description);
                    action.changes = changes;
                    action
                }
            }
        };

        planned.insert(v, action.action_type);
        actions.push(action);
    }

    // 宣言から消えたリソースは作成の逆順で削除
    let declared: HashSet<String> = graph
        .vertices()
        .iter()
        .filter(|v| !v.is_virtual())
        .map(|v| v.id.key())
        .collect();
    for resource in state.by_sequence().into_iter().rev() {
        if !declared.contains(&resource.id) {
            actions.push(Action::new(
                ActionType::Delete,
                &resource.resource_type,
                &resource.id,
                "削除（宣言から除外）",
            ));
        }
    }

    let plan = Plan::new(actions);
    debug!(summary = %plan.summary(), "Planned");
    plan
}

/// 入力値を見積もる（確定できない場合は None）
fn resolve(
    graph: &DependencyGraph,
    state: &GlobalState,
    planned: &HashMap<VertexId, ActionType>,
    v: VertexId,
    input: &str,
) -> Option<Value> {
    match graph.vertex(v).inputs.get(input)? {
        VertexInput::Literal(value) => Some(value.clone()),
        VertexInput::Bound(index) => {
            let binding = graph.binding(*index);
            let producer = graph.index_of(&binding.producer)?;
            if graph.vertex(producer).is_virtual() {
                return resolve(graph, state, planned, producer, "value");
            }
            if planned.get(&producer) == Some(&ActionType::Create) {
                return None;
            }
            state
                .get_resource(&binding.producer.key())
                .and_then(|r| r.outputs.get(&binding.output))
                .cloned()
        }
    }
}
