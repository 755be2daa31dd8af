//! 参照バインディング
//!
//! あるノードの出力スロットと別ノードの入力スロットを結ぶ型付きの約束。
//! 生産者ノードが適用されるまでは `Pending` のままです。

use super::node::NodeId;
use crate::error::{FlowError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// ノードの出力（出力名 → 値）
pub type Outputs = BTreeMap<String, Value>;

/// バインディングが越える境界
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Boundary {
    /// 同一スタック内
    Local,
    /// 同一リージョン内のスタック間
    CrossStack,
    /// リージョンをまたぐスタック間（生産者スタック全体の完了が必要）
    CrossRegion { from: String, to: String },
}

/// 参照バインディング
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceBinding {
    pub producer: NodeId,
    pub output: String,
    pub consumer: NodeId,
    pub input: String,
    pub boundary: Boundary,
}

/// バインディング解決の結果
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(Value),
    /// 生産者ノードが未適用
    Pending,
}

impl ReferenceBinding {
    pub fn new(
        producer: NodeId,
        output: impl Into<String>,
        consumer: NodeId,
        input: impl Into<String>,
    ) -> Self {
        Self {
            producer,
            output: output.into(),
            consumer,
            input: input.into(),
            boundary: Boundary::Local,
        }
    }

    pub fn with_boundary(mut self, boundary: Boundary) -> Self {
        self.boundary = boundary;
        self
    }

    /// 生産者スタック全体の適用完了を待つ必要があるか
    pub fn is_barrier(&self) -> bool {
        matches!(self.boundary, Boundary::CrossRegion { .. })
    }

    /// 出力ストアから値を解決
    ///
    /// 生産者が確定済みなのに出力が無い場合はエラーです。
    pub fn resolve(&self, store: &OutputStore) -> Result<Resolution> {
        match store.get(&self.producer) {
            None => Ok(Resolution::Pending),
            Some(outputs) => outputs
                .get(&self.output)
                .cloned()
                .map(Resolution::Resolved)
                .ok_or_else(|| FlowError::MissingOutput {
                    producer: self.producer.to_string(),
                    output: self.output.clone(),
                }),
        }
    }
}

/// 確定済みノード出力のストア
///
/// 一度書き込まれた出力は変更できません。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputStore {
    outputs: BTreeMap<NodeId, Outputs>,
}

impl OutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &NodeId) -> Option<&Outputs> {
        self.outputs.get(id)
    }

    pub fn is_materialized(&self, id: &NodeId) -> bool {
        self.outputs.contains_key(id)
    }

    /// 出力を確定
    pub fn insert(&mut self, id: NodeId, outputs: Outputs) -> Result<()> {
        if self.outputs.contains_key(&id) {
            return Err(FlowError::OutputsAlreadySet(id.to_string()));
        }
        self.outputs.insert(id, outputs);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Outputs)> {
        self.outputs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn binding() -> ReferenceBinding {
        ReferenceBinding::new(
            NodeId::new("s", "vpc"),
            "vpc_id",
            NodeId::new("s", "sg"),
            "vpc_id",
        )
    }

    #[test]
    fn test_resolve_pending_before_materialize() {
        let store = OutputStore::new();
        assert_eq!(binding().resolve(&store).unwrap(), Resolution::Pending);
    }

    #[test]
    fn test_resolve_after_materialize() {
        let mut store = OutputStore::new();
        store
            .insert(
                NodeId::new("s", "vpc"),
                Outputs::from([("vpc_id".to_string(), json!("vpc-1"))]),
            )
            .unwrap();
        assert_eq!(
            binding().resolve(&store).unwrap(),
            Resolution::Resolved(json!("vpc-1"))
        );
    }

    #[test]
    fn test_resolve_missing_output_is_error() {
        let mut store = OutputStore::new();
        store.insert(NodeId::new("s", "vpc"), Outputs::new()).unwrap();
        assert!(matches!(
            binding().resolve(&store),
            Err(FlowError::MissingOutput { .. })
        ));
    }

    #[test]
    fn test_outputs_are_immutable() {
        let mut store = OutputStore::new();
        let id = NodeId::new("s", "vpc");
        store.insert(id.clone(), Outputs::new()).unwrap();
        assert!(matches!(
            store.insert(id, Outputs::new()),
            Err(FlowError::OutputsAlreadySet(_))
        ));
    }

    #[test]
    fn test_cross_region_is_barrier() {
        let b = binding().with_boundary(Boundary::CrossRegion {
            from: "us-east-1".to_string(),
            to: "ap-northeast-1".to_string(),
        });
        assert!(b.is_barrier());
        assert!(!binding().is_barrier());
    }
}
