//! リソースノード
//!
//! 宣言の最小単位。入力はリテラル、他ノードの出力への参照、
//! またはスタックの必須入力のいずれかです。

use super::kind::ResourceKind;
use crate::error::{FlowError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// 仮想入力ノード名のプレフィックス
pub const INPUT_NODE_PREFIX: &str = "$input.";

/// スタック内で一意なノード識別子
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub stack: String,
    pub name: String,
}

impl NodeId {
    pub fn new(stack: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            name: name.into(),
        }
    }

    /// スタックの必須入力を保持する仮想ノードのID
    pub fn stack_input(stack: impl Into<String>, input: &str) -> Self {
        Self::new(stack, format!("{INPUT_NODE_PREFIX}{input}"))
    }

    pub fn is_stack_input(&self) -> bool {
        self.name.starts_with(INPUT_NODE_PREFIX)
    }

    /// 状態ファイルのキー（stack/name）
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stack, self.name)
    }
}

/// ノード出力への参照
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    pub node: NodeId,
    pub output: String,
}

impl OutputRef {
    pub fn new(node: NodeId, output: impl Into<String>) -> Self {
        Self {
            node,
            output: output.into(),
        }
    }

    /// 参照式をパース
    ///
    /// - `Node.output` → 同一スタック（`current_stack`）のノード
    /// - `Stack/Node.output` → 別スタックのノード
    pub fn parse(expr: &str, current_stack: &str) -> Result<Self> {
        let invalid = || FlowError::InvalidReference(expr.to_string());

        let (stack, rest) = match expr.split_once('/') {
            Some((stack, rest)) => (stack, rest),
            None => (current_stack, expr),
        };
        let (node, output) = rest.rsplit_once('.').ok_or_else(invalid)?;

        if stack.is_empty() || node.is_empty() || output.is_empty() || output.contains('/') {
            return Err(invalid());
        }

        Ok(Self::new(NodeId::new(stack, node), output))
    }

    pub fn is_cross_stack(&self, consumer_stack: &str) -> bool {
        self.node.stack != consumer_stack
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.output)
    }
}

/// ノード入力の値
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputValue {
    /// リテラル値
    Literal(Value),
    /// 他ノードの出力への参照
    Reference(OutputRef),
    /// スタックの必須入力（`input "name"` で宣言したもの）
    StackInput(String),
}

impl InputValue {
    pub fn literal(value: impl Into<Value>) -> Self {
        InputValue::Literal(value.into())
    }
}

/// 宣言されたリソース
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    pub id: NodeId,
    pub kind: ResourceKind,
    pub inputs: BTreeMap<String, InputValue>,
    /// 値の受け渡しを伴わない明示的な順序制約
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<NodeId>,
}

impl ResourceNode {
    pub fn new(id: NodeId, kind: ResourceKind) -> Self {
        Self {
            id,
            kind,
            inputs: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value: InputValue) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    pub fn with_literal(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_input(name, InputValue::literal(value))
    }

    pub fn with_ref(self, name: impl Into<String>, reference: OutputRef) -> Self {
        self.with_input(name, InputValue::Reference(reference))
    }

    pub fn with_stack_input(self, name: impl Into<String>, input: impl Into<String>) -> Self {
        self.with_input(name, InputValue::StackInput(input.into()))
    }

    pub fn with_dependency(mut self, id: NodeId) -> Self {
        self.depends_on.push(id);
        self
    }

    /// 他ノード出力への参照を入力名とともに列挙
    pub fn references(&self) -> impl Iterator<Item = (&str, &OutputRef)> {
        self.inputs.iter().filter_map(|(name, value)| match value {
            InputValue::Reference(r) => Some((name.as_str(), r)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local_reference() {
        let r = OutputRef::parse("MyVPC.vpc_id", "CdkStack").unwrap();
        assert_eq!(r.node, NodeId::new("CdkStack", "MyVPC"));
        assert_eq!(r.output, "vpc_id");
        assert!(!r.is_cross_stack("CdkStack"));
    }

    #[test]
    fn test_parse_cross_stack_reference() {
        let r = OutputRef::parse("AcmStack/Certificate.certificate_arn", "CdkStack").unwrap();
        assert_eq!(r.node, NodeId::new("AcmStack", "Certificate"));
        assert_eq!(r.output, "certificate_arn");
        assert!(r.is_cross_stack("CdkStack"));
    }

    #[test]
    fn test_parse_invalid_reference() {
        assert!(OutputRef::parse("MyVPC", "s").is_err());
        assert!(OutputRef::parse(".vpc_id", "s").is_err());
        assert!(OutputRef::parse("/Node.out", "s").is_err());
        assert!(OutputRef::parse("Node.", "s").is_err());
    }

    #[test]
    fn test_stack_input_id() {
        let id = NodeId::stack_input("CdkStack", "certificate_arn");
        assert!(id.is_stack_input());
        assert_eq!(id.to_string(), "CdkStack/$input.certificate_arn");
        assert!(!NodeId::new("CdkStack", "MyVPC").is_stack_input());
    }

    #[test]
    fn test_references() {
        let node = ResourceNode::new(NodeId::new("s", "sg"), ResourceKind::SecurityGroup)
            .with_ref("vpc_id", OutputRef::new(NodeId::new("s", "vpc"), "vpc_id"))
            .with_literal("description", "web");
        let refs: Vec<_> = node.references().collect();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].0, "vpc_id");
    }
}
