//! デプロイメント
//!
//! 1回の実行で扱うスタック集合とパラメータを所有するコンテキスト。

use super::node::{NodeId, ResourceNode};
use super::stack::Stack;
use crate::error::{FlowError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub name: String,
    /// 宣言順を保持
    pub stacks: Vec<Stack>,
    /// スタック名 → 入力名 → 値（`from` を持たない必須入力に使用）
    pub parameters: BTreeMap<String, BTreeMap<String, Value>>,
}

impl Deployment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn add_stack(&mut self, stack: Stack) -> Result<()> {
        if self.stack(&stack.name).is_some() {
            return Err(FlowError::DuplicateStack(stack.name));
        }
        self.stacks.push(stack);
        Ok(())
    }

    pub fn stack(&self, name: &str) -> Option<&Stack> {
        self.stacks.iter().find(|s| s.name == name)
    }

    pub fn stack_mut(&mut self, name: &str) -> Option<&mut Stack> {
        self.stacks.iter_mut().find(|s| s.name == name)
    }

    pub fn node(&self, id: &NodeId) -> Option<&ResourceNode> {
        self.stack(&id.stack).and_then(|s| s.node(&id.name))
    }

    pub fn set_parameter(
        &mut self,
        stack: impl Into<String>,
        input: impl Into<String>,
        value: impl Into<Value>,
    ) {
        self.parameters
            .entry(stack.into())
            .or_default()
            .insert(input.into(), value.into());
    }

    pub fn parameter(&self, stack: &str, input: &str) -> Option<&Value> {
        self.parameters.get(stack).and_then(|p| p.get(input))
    }

    /// オーバーライドをマージ
    ///
    /// 同名のスタックは宣言位置を保ったまま置き換え、新しいスタックは末尾に追加します。
    /// パラメータはスタック単位で上書きされます。
    pub fn merge_override(&mut self, other: Deployment) {
        for stack in other.stacks {
            match self.stacks.iter_mut().find(|s| s.name == stack.name) {
                Some(existing) => *existing = stack,
                None => self.stacks.push(stack),
            }
        }
        for (stack, params) in other.parameters {
            self.parameters.entry(stack).or_default().extend(params);
        }
    }

    /// 全スタックのノード数（仮想入力ノードを除く）
    pub fn node_count(&self) -> usize {
        self.stacks.iter().map(|s| s.nodes.len()).sum()
    }
}
