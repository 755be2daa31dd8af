//! スタック間・リージョン間リンカー
//!
//! デプロイメント全体の宣言を検証し、依存グラフを組み立てます。
//!
//! - スタックの必須入力ごとに仮想入力ノードを合成し、`from` のエクスポートか
//!   デプロイメントのパラメータから値を供給する
//! - 他スタックのノード出力への直接参照は、暗黙のエクスポート/インポートの組に
//!   書き換える（スタック間の結合は常に仮想入力ノード経由）
//! - リージョンをまたぐインポートとスタック単位の `depends-on` はバリア辺になる
//!
//! 不整合はリソースを1つも作成する前に `ConfigurationError` として返します。

use crate::error::ConfigurationError;
use crate::graph::{DependencyGraph, EdgeKind, Vertex, VertexId, VertexInput};
use skyflow_core::{
    Boundary, Deployment, INPUT_NODE_PREFIX, InputValue, NodeId, OutputRef, ReferenceBinding,
    ResourceKind, Stack, ValueType,
};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, instrument};

type Result<T> = std::result::Result<T, ConfigurationError>;

/// 宣言を検証して依存グラフを構築
#[instrument(skip(deployment), fields(deployment = %deployment.name))]
pub fn link(deployment: &Deployment) -> Result<DependencyGraph> {
    let graph = Linker {
        deployment,
        graph: DependencyGraph::new(),
    }
    .link()?;

    debug!(
        vertices = graph.len(),
        edges = graph.edges().len(),
        bindings = graph.bindings().len(),
        "Linked deployment"
    );
    Ok(graph)
}

struct Linker<'a> {
    deployment: &'a Deployment,
    graph: DependencyGraph,
}

impl<'a> Linker<'a> {
    fn link(mut self) -> Result<DependencyGraph> {
        let deployment = self.deployment;
        self.check_declarations()?;
        let implicit = self.collect_implicit_imports()?;

        for stack in &deployment.stacks {
            self.add_vertices(stack, implicit.get(&stack.name).map(Vec::as_slice))?;
        }

        for stack in &deployment.stacks {
            self.wire_required_inputs(stack)?;
            for import in implicit.get(&stack.name).into_iter().flatten() {
                let virtual_id = NodeId::stack_input(&stack.name, &import.to_string());
                self.bind_import(import, stack, &virtual_id)?;
            }
            self.wire_nodes(stack)?;
        }

        for stack in &deployment.stacks {
            self.wire_stack_order(stack);
        }

        self.graph.finalize()
    }

    /// 重複・未知スタック・エクスポートの検証
    fn check_declarations(&self) -> Result<()> {
        let mut stacks = HashSet::new();
        for stack in &self.deployment.stacks {
            if !stacks.insert(stack.name.as_str()) {
                return Err(ConfigurationError::DuplicateStack(stack.name.clone()));
            }

            let mut nodes = HashSet::new();
            for node in &stack.nodes {
                if node.id.stack != stack.name
                    || node.id.is_stack_input()
                    || !nodes.insert(node.id.name.as_str())
                {
                    return Err(ConfigurationError::DuplicateNode(node.id.to_string()));
                }
            }

            for dep in &stack.depends_on {
                if self.deployment.stack(dep).is_none() {
                    return Err(ConfigurationError::UnknownStack(dep.clone()));
                }
            }

            for (name, export) in &stack.exports {
                let consumer = format!("{}:export {}", stack.name, name);
                if export.node.stack != stack.name {
                    return Err(ConfigurationError::BrokenReference {
                        consumer,
                        input: name.clone(),
                        target: export.to_string(),
                    });
                }
                self.output_type(export, &consumer, name)?;
            }
        }
        Ok(())
    }

    /// 他スタックへの直接参照を暗黙のインポートとして収集（出現順・重複なし）
    fn collect_implicit_imports(&self) -> Result<BTreeMap<String, Vec<OutputRef>>> {
        let mut implicit: BTreeMap<String, Vec<OutputRef>> = BTreeMap::new();
        for stack in &self.deployment.stacks {
            for node in &stack.nodes {
                for (input, reference) in node.references() {
                    if !reference.is_cross_stack(&stack.name) {
                        continue;
                    }
                    self.output_type(reference, &node.id.to_string(), input)?;
                    let imports = implicit.entry(stack.name.clone()).or_default();
                    if !imports.contains(reference) {
                        imports.push(reference.clone());
                    }
                }
            }
        }
        Ok(implicit)
    }

    /// 仮想入力ノード → リソースの順に頂点を追加
    fn add_vertices(&mut self, stack: &Stack, implicit: Option<&[OutputRef]>) -> Result<()> {
        for (name, required) in &stack.inputs {
            self.add_virtual(stack, name, required.value_type)?;
        }
        for import in implicit.unwrap_or_default() {
            let produced = self.output_type(import, &stack.name, "import")?;
            self.add_virtual(stack, &import.to_string(), produced)?;
        }
        for node in &stack.nodes {
            self.graph.add_vertex(Vertex {
                id: node.id.clone(),
                kind: node.kind,
                region: stack.region.clone(),
                account: stack.account.clone(),
                inputs: BTreeMap::new(),
                value_type: None,
            });
        }
        Ok(())
    }

    fn add_virtual(&mut self, stack: &Stack, name: &str, value_type: ValueType) -> Result<()> {
        let id = NodeId::stack_input(&stack.name, name);
        if self.graph.index_of(&id).is_some() {
            return Err(ConfigurationError::DuplicateNode(id.to_string()));
        }
        self.graph.add_vertex(Vertex {
            id,
            kind: ResourceKind::StackInput,
            region: stack.region.clone(),
            account: stack.account.clone(),
            inputs: BTreeMap::new(),
            value_type: Some(value_type),
        });
        Ok(())
    }

    /// 必須入力の供給元（エクスポートまたはパラメータ）を接続
    fn wire_required_inputs(&mut self, stack: &Stack) -> Result<()> {
        let deployment = self.deployment;
        for (name, required) in &stack.inputs {
            let virtual_id = NodeId::stack_input(&stack.name, name);
            let consumer = virtual_id.to_string();

            match &required.from {
                Some(source) => {
                    let producer_stack = deployment.stack(&source.stack).ok_or_else(|| {
                        ConfigurationError::BrokenReference {
                            consumer: consumer.clone(),
                            input: "value".to_string(),
                            target: format!("{}:export {}", source.stack, source.export),
                        }
                    })?;
                    let export = producer_stack.exports.get(&source.export).ok_or_else(|| {
                        ConfigurationError::UnknownExport {
                            stack: source.stack.clone(),
                            export: source.export.clone(),
                            consumer: consumer.clone(),
                        }
                    })?;
                    let produced = self.output_type(export, &consumer, "value")?;
                    if !required.value_type.accepts(produced) {
                        return Err(ConfigurationError::TypeMismatch {
                            producer: export.to_string(),
                            produced,
                            consumer,
                            input: "value".to_string(),
                            expected: required.value_type,
                        });
                    }
                    self.bind_import(export, stack, &virtual_id)?;
                }
                None => {
                    let value = deployment.parameter(&stack.name, name).ok_or_else(|| {
                        ConfigurationError::MissingParameter {
                            stack: stack.name.clone(),
                            input: name.clone(),
                        }
                    })?;
                    required.value_type.validate(value).map_err(|reason| {
                        ConfigurationError::InvalidInput {
                            node: consumer.clone(),
                            input: "value".to_string(),
                            reason,
                        }
                    })?;
                    let v = self.vertex_index(&virtual_id)?;
                    self.graph
                        .vertex_mut(v)
                        .inputs
                        .insert("value".to_string(), VertexInput::Literal(value.clone()));
                }
            }
        }
        Ok(())
    }

    /// 生産者ノード出力 → 仮想入力ノードのバインディング
    ///
    /// リージョンが異なる場合は生産者スタックの全頂点からバリア辺を張ります。
    fn bind_import(
        &mut self,
        source: &OutputRef,
        consumer_stack: &Stack,
        virtual_id: &NodeId,
    ) -> Result<()> {
        let deployment = self.deployment;
        let producer_stack = deployment.stack(&source.node.stack).ok_or_else(|| {
            ConfigurationError::BrokenReference {
                consumer: virtual_id.to_string(),
                input: "value".to_string(),
                target: source.to_string(),
            }
        })?;

        let boundary = if producer_stack.name == consumer_stack.name {
            Boundary::Local
        } else if producer_stack.region != consumer_stack.region {
            Boundary::CrossRegion {
                from: producer_stack.region.clone(),
                to: consumer_stack.region.clone(),
            }
        } else {
            Boundary::CrossStack
        };

        let binding =
            ReferenceBinding::new(source.node.clone(), &source.output, virtual_id.clone(), "value")
                .with_boundary(boundary);
        let barrier = binding.is_barrier();
        let index = self.add_binding(binding)?;

        let v = self.vertex_index(virtual_id)?;
        self.graph
            .vertex_mut(v)
            .inputs
            .insert("value".to_string(), VertexInput::Bound(index));

        if barrier {
            debug!(
                producer = %producer_stack.name,
                consumer = %virtual_id,
                "Cross-region import, adding barrier"
            );
            for p in self.graph.stack_vertices(&producer_stack.name) {
                self.graph.add_edge(p, v, EdgeKind::CrossRegionBarrier);
            }
        }
        Ok(())
    }

    /// ノード入力の検証とバインディング・明示的依存の接続
    fn wire_nodes(&mut self, stack: &Stack) -> Result<()> {
        for node in &stack.nodes {
            let v = self.vertex_index(&node.id)?;
            let node_name = node.id.to_string();

            for (input, value) in &node.inputs {
                let spec = node.kind.input(input).ok_or_else(|| ConfigurationError::InvalidInput {
                    node: node_name.clone(),
                    input: input.clone(),
                    reason: format!("{} は入力 '{}' を持ちません", node.kind, input),
                })?;
                if let InputValue::Literal(literal) = value {
                    spec.value_type.validate(literal).map_err(|reason| {
                        ConfigurationError::InvalidInput {
                            node: node_name.clone(),
                            input: input.clone(),
                            reason,
                        }
                    })?;
                    self.graph
                        .vertex_mut(v)
                        .inputs
                        .insert(input.clone(), VertexInput::Literal(literal.clone()));
                }
            }

            for spec in node.kind.inputs() {
                if spec.required && !node.inputs.contains_key(spec.name) {
                    return Err(ConfigurationError::MissingInput {
                        node: node_name,
                        input: spec.name.to_string(),
                    });
                }
            }

            for dep in &node.depends_on {
                let from = self.graph.index_of(dep).ok_or_else(|| {
                    ConfigurationError::BrokenReference {
                        consumer: node_name.clone(),
                        input: "depends-on".to_string(),
                        target: dep.to_string(),
                    }
                })?;
                self.graph.add_edge(from, v, EdgeKind::Explicit);
            }
        }

        for binding in stack.bindings() {
            self.wire_binding(stack, binding)?;
        }
        Ok(())
    }

    /// ノード入力のバインディングを型検査して登録
    fn wire_binding(&mut self, stack: &Stack, binding: ReferenceBinding) -> Result<()> {
        let consumer = binding.consumer.to_string();
        let expected = self
            .deployment
            .node(&binding.consumer)
            .and_then(|n| n.kind.input(&binding.input))
            .map(|spec| spec.value_type)
            .ok_or_else(|| ConfigurationError::InvalidInput {
                node: consumer.clone(),
                input: binding.input.clone(),
                reason: "入力スキーマが見つかりません".to_string(),
            })?;

        let (binding, produced) = if binding.producer.is_stack_input() {
            let name = binding
                .producer
                .name
                .strip_prefix(INPUT_NODE_PREFIX)
                .unwrap_or(&binding.producer.name);
            let required = stack.inputs.get(name).ok_or_else(|| {
                ConfigurationError::BrokenReference {
                    consumer: consumer.clone(),
                    input: binding.input.clone(),
                    target: binding.producer.to_string(),
                }
            })?;
            let produced = required.value_type;
            (binding, produced)
        } else {
            let source = OutputRef::new(binding.producer.clone(), &binding.output);
            let produced = self.output_type(&source, &consumer, &binding.input)?;
            if binding.boundary == Boundary::CrossStack {
                // 暗黙のインポート経由に書き換え
                let virtual_id = NodeId::stack_input(&stack.name, &source.to_string());
                let rewritten =
                    ReferenceBinding::new(virtual_id, "value", binding.consumer, binding.input);
                (rewritten, produced)
            } else {
                (binding, produced)
            }
        };

        if !expected.accepts(produced) {
            return Err(ConfigurationError::TypeMismatch {
                producer: format!("{}.{}", binding.producer, binding.output),
                produced,
                consumer,
                input: binding.input.clone(),
                expected,
            });
        }

        let consumer_v = self.vertex_index(&binding.consumer)?;
        let input = binding.input.clone();
        let index = self.add_binding(binding)?;
        self.graph
            .vertex_mut(consumer_v)
            .inputs
            .insert(input, VertexInput::Bound(index));
        Ok(())
    }

    /// スタック単位の `depends-on` をバリア辺に変換
    fn wire_stack_order(&mut self, stack: &Stack) {
        let consumers = self.graph.stack_vertices(&stack.name);
        for dep in &stack.depends_on {
            for p in self.graph.stack_vertices(dep) {
                for &c in &consumers {
                    self.graph.add_edge(p, c, EdgeKind::StackOrder);
                }
            }
        }
    }

    /// 参照先ノードが宣言する出力の型
    fn output_type(&self, source: &OutputRef, consumer: &str, input: &str) -> Result<ValueType> {
        let producer = self.deployment.node(&source.node).ok_or_else(|| {
            ConfigurationError::BrokenReference {
                consumer: consumer.to_string(),
                input: input.to_string(),
                target: source.to_string(),
            }
        })?;
        producer
            .kind
            .output(&source.output)
            .map(|spec| spec.value_type)
            .ok_or_else(|| ConfigurationError::UnknownOutput {
                producer: source.node.to_string(),
                kind: producer.kind.to_string(),
                output: source.output.clone(),
            })
    }

    fn vertex_index(&self, id: &NodeId) -> Result<VertexId> {
        self.graph
            .index_of(id)
            .ok_or_else(|| ConfigurationError::BrokenReference {
                consumer: id.to_string(),
                input: String::new(),
                target: id.to_string(),
            })
    }

    fn add_binding(&mut self, binding: ReferenceBinding) -> Result<usize> {
        let consumer = binding.consumer.to_string();
        let input = binding.input.clone();
        let target = binding.producer.to_string();
        self.graph
            .add_binding(binding)
            .ok_or(ConfigurationError::BrokenReference {
                consumer,
                input,
                target,
            })
    }
}
