//! スタック
//!
//! 独立してデプロイできるリソースの集合。他スタックとの結合は
//! `export` / `input` の組だけを通じて行います。

use super::binding::{Boundary, ReferenceBinding};
use super::kind::{ResourceKind, ValueType};
use super::node::{InputValue, NodeId, OutputRef, ResourceNode};
use crate::error::{FlowError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 他スタックのエクスポートを受け取る元
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSource {
    pub stack: String,
    pub export: String,
}

/// スタックの必須入力
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredInput {
    pub name: String,
    pub value_type: ValueType,
    /// 指定が無い場合はデプロイメントのパラメータから供給する
    pub from: Option<ImportSource>,
}

/// スタック定義
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    pub name: String,
    pub region: String,
    pub account: Option<String>,
    pub description: Option<String>,
    /// 宣言順を保持
    pub nodes: Vec<ResourceNode>,
    /// エクスポート名 → ノード出力
    pub exports: BTreeMap<String, OutputRef>,
    /// 入力名 → 必須入力
    pub inputs: BTreeMap<String, RequiredInput>,
    /// このスタックより先に完全に適用されるべきスタック
    pub depends_on: Vec<String>,
}

impl Stack {
    pub fn new(name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            ..Default::default()
        }
    }

    /// リソースを宣言してIDを返す
    pub fn declare(
        &mut self,
        name: impl Into<String>,
        kind: ResourceKind,
        inputs: impl IntoIterator<Item = (String, InputValue)>,
    ) -> Result<NodeId> {
        let mut node = ResourceNode::new(NodeId::new(&self.name, name), kind);
        node.inputs.extend(inputs);
        self.add_node(node)
    }

    /// 構築済みのノードを追加
    pub fn add_node(&mut self, node: ResourceNode) -> Result<NodeId> {
        if node.id.stack != self.name {
            return Err(FlowError::InvalidConfig(format!(
                "リソース {} はスタック {} に属していません",
                node.id, self.name
            )));
        }
        if self.node(&node.id.name).is_some() {
            return Err(FlowError::DuplicateNode(node.id.to_string()));
        }
        let id = node.id.clone();
        self.nodes.push(node);
        Ok(id)
    }

    /// ノード出力をエクスポート
    pub fn export_output(
        &mut self,
        name: impl Into<String>,
        node: &NodeId,
        output: impl Into<String>,
    ) -> Result<()> {
        if node.stack != self.name {
            return Err(FlowError::InvalidConfig(format!(
                "他スタックのリソース {} はエクスポートできません",
                node
            )));
        }
        if self.node(&node.name).is_none() {
            return Err(FlowError::NodeNotFound {
                stack: self.name.clone(),
                node: node.name.clone(),
            });
        }
        self.exports
            .insert(name.into(), OutputRef::new(node.clone(), output));
        Ok(())
    }

    /// 必須入力を宣言し、その値を指す参照を返す
    pub fn require_input(
        &mut self,
        name: impl Into<String>,
        value_type: ValueType,
        from: Option<ImportSource>,
    ) -> OutputRef {
        let name = name.into();
        let reference = self.input_ref(&name);
        self.inputs.insert(
            name.clone(),
            RequiredInput {
                name,
                value_type,
                from,
            },
        );
        reference
    }

    /// 必須入力の仮想ノードの出力参照
    pub fn input_ref(&self, name: &str) -> OutputRef {
        OutputRef::new(NodeId::stack_input(&self.name, name), "value")
    }

    /// 別スタックへの順序制約を追加
    pub fn add_dependency(&mut self, stack: impl Into<String>) {
        let stack = stack.into();
        if !self.depends_on.contains(&stack) {
            self.depends_on.push(stack);
        }
    }

    pub fn node(&self, name: &str) -> Option<&ResourceNode> {
        self.nodes.iter().find(|n| n.id.name == name)
    }

    /// ノード入力から導かれるバインディング
    ///
    /// 他スタックへの直接参照は `CrossStack` として返します。
    /// リージョン判定と仮想入力ノードへの書き換えはリンカーの責務です。
    pub fn bindings(&self) -> Vec<ReferenceBinding> {
        let mut bindings = Vec::new();
        for node in &self.nodes {
            for (input, value) in &node.inputs {
                let binding = match value {
                    InputValue::Literal(_) => continue,
                    InputValue::Reference(r) => {
                        let boundary = if r.is_cross_stack(&self.name) {
                            Boundary::CrossStack
                        } else {
                            Boundary::Local
                        };
                        ReferenceBinding::new(r.node.clone(), &r.output, node.id.clone(), input)
                            .with_boundary(boundary)
                    }
                    InputValue::StackInput(name) => {
                        let r = self.input_ref(name);
                        ReferenceBinding::new(r.node, r.output, node.id.clone(), input)
                    }
                };
                bindings.push(binding);
            }
        }
        bindings
    }
}
