//! 依存グラフ
//!
//! 全スタックのノードと仮想入力ノードを頂点に、バインディング・明示的依存・
//! リンカーが合成したスタック間エッジ・バリアエッジを辺に持つ有向グラフ。
//! 頂点番号は宣言順で、トポロジカル順序の同順位はこの番号で決まります。

use crate::error::ConfigurationError;
use serde::Serialize;
use serde_json::Value;
use skyflow_core::{NodeId, ReferenceBinding, ResourceKind, ValueType};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

pub type VertexId = usize;

/// 頂点の入力
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VertexInput {
    Literal(Value),
    /// `DependencyGraph::bindings()` のインデックス
    Bound(usize),
}

/// グラフの頂点
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Vertex {
    pub id: NodeId,
    pub kind: ResourceKind,
    pub region: String,
    pub account: Option<String>,
    pub inputs: BTreeMap<String, VertexInput>,
    /// 仮想入力ノードが保持する値の型
    pub value_type: Option<ValueType>,
}

impl Vertex {
    pub fn is_virtual(&self) -> bool {
        self.kind.is_virtual()
    }
}

/// 辺の由来
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// 参照バインディング
    Binding,
    /// `depends-on` による明示的な順序
    Explicit,
    /// リージョンをまたぐ参照のバリア（生産者スタック全体 → 消費者）
    CrossRegionBarrier,
    /// スタック単位の `depends-on`
    StackOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub from: VertexId,
    pub to: VertexId,
    pub kind: EdgeKind,
}

/// 依存グラフ
#[derive(Debug, Clone, Default, Serialize)]
pub struct DependencyGraph {
    vertices: Vec<Vertex>,
    #[serde(skip)]
    index: HashMap<NodeId, VertexId>,
    edges: Vec<Edge>,
    #[serde(skip)]
    edge_set: BTreeSet<(VertexId, VertexId)>,
    bindings: Vec<ReferenceBinding>,
    #[serde(skip)]
    successors: Vec<Vec<VertexId>>,
    #[serde(skip)]
    predecessors: Vec<Vec<VertexId>>,
    order: Vec<VertexId>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 頂点を追加（重複IDは呼び出し側で検出済みであること）
    pub fn add_vertex(&mut self, vertex: Vertex) -> VertexId {
        let id = self.vertices.len();
        self.index.insert(vertex.id.clone(), id);
        self.vertices.push(vertex);
        self.successors.push(Vec::new());
        self.predecessors.push(Vec::new());
        id
    }

    /// 辺を追加
    ///
    /// 同じ頂点対の辺は最初に追加された由来のみ保持します。
    pub fn add_edge(&mut self, from: VertexId, to: VertexId, kind: EdgeKind) {
        if !self.edge_set.insert((from, to)) {
            return;
        }
        self.edges.push(Edge { from, to, kind });
        insert_sorted(&mut self.successors[from], to);
        insert_sorted(&mut self.predecessors[to], from);
    }

    /// バインディングを登録して生産者 → 消費者の辺を張る
    pub fn add_binding(&mut self, binding: ReferenceBinding) -> Option<usize> {
        let from = self.index_of(&binding.producer)?;
        let to = self.index_of(&binding.consumer)?;
        self.add_edge(from, to, EdgeKind::Binding);
        self.bindings.push(binding);
        Some(self.bindings.len() - 1)
    }

    pub fn index_of(&self, id: &NodeId) -> Option<VertexId> {
        self.index.get(id).copied()
    }

    pub fn vertex(&self, v: VertexId) -> &Vertex {
        &self.vertices[v]
    }

    pub fn vertex_mut(&mut self, v: VertexId) -> &mut Vertex {
        &mut self.vertices[v]
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn bindings(&self) -> &[ReferenceBinding] {
        &self.bindings
    }

    pub fn binding(&self, index: usize) -> &ReferenceBinding {
        &self.bindings[index]
    }

    pub fn successors(&self, v: VertexId) -> &[VertexId] {
        &self.successors[v]
    }

    pub fn predecessors(&self, v: VertexId) -> &[VertexId] {
        &self.predecessors[v]
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// スタックに属する頂点（宣言順）
    pub fn stack_vertices(&self, stack: &str) -> Vec<VertexId> {
        (0..self.vertices.len())
            .filter(|&v| self.vertices[v].id.stack == stack)
            .collect()
    }

    /// 循環を検出して実行順序を確定
    pub fn finalize(mut self) -> Result<Self, ConfigurationError> {
        self.detect_cycles()?;
        self.order = self.compute_order()?;
        Ok(self)
    }

    /// 作成順序（`finalize` 済みのグラフのみ）
    pub fn topological_order(&self) -> &[VertexId] {
        &self.order
    }

    /// 削除順序（作成順序の完全な逆順）
    pub fn destroy_order(&self) -> Vec<VertexId> {
        self.order.iter().rev().copied().collect()
    }

    /// 三色DFSによる循環検出
    ///
    /// 灰色（探索中）の頂点に到達したら循環。探索スタックから循環の構成員を復元します。
    pub fn detect_cycles(&self) -> Result<(), ConfigurationError> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        fn dfs(
            v: VertexId,
            successors: &[Vec<VertexId>],
            colors: &mut [Color],
            stack: &mut Vec<VertexId>,
        ) -> Result<(), Vec<VertexId>> {
            colors[v] = Color::Gray;
            stack.push(v);

            for &next in &successors[v] {
                match colors[next] {
                    Color::Gray => {
                        let start = stack.iter().position(|&x| x == next).unwrap_or(0);
                        let mut cycle = stack[start..].to_vec();
                        cycle.push(next);
                        return Err(cycle);
                    }
                    Color::White => dfs(next, successors, colors, stack)?,
                    Color::Black => {}
                }
            }

            stack.pop();
            colors[v] = Color::Black;
            Ok(())
        }

        let mut colors = vec![Color::White; self.vertices.len()];
        let mut stack = Vec::new();

        for v in 0..self.vertices.len() {
            if colors[v] == Color::White
                && let Err(cycle) = dfs(v, &self.successors, &mut colors, &mut stack)
            {
                return Err(ConfigurationError::CyclicDependency {
                    members: cycle
                        .into_iter()
                        .map(|v| self.vertices[v].id.to_string())
                        .collect(),
                });
            }
        }

        Ok(())
    }

    /// Kahn法によるトポロジカルソート（同順位は宣言順）
    fn compute_order(&self) -> Result<Vec<VertexId>, ConfigurationError> {
        let mut in_degree: Vec<usize> = self.predecessors.iter().map(|p| p.len()).collect();
        let mut ready: BinaryHeap<Reverse<VertexId>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(v, _)| Reverse(v))
            .collect();

        let mut order = Vec::with_capacity(self.vertices.len());
        while let Some(Reverse(v)) = ready.pop() {
            order.push(v);
            for &next in &self.successors[v] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() != self.vertices.len() {
            let members = (0..self.vertices.len())
                .filter(|v| in_degree[*v] > 0)
                .map(|v| self.vertices[v].id.to_string())
                .collect();
            return Err(ConfigurationError::CyclicDependency { members });
        }

        Ok(order)
    }

    /// `from` から辿れる頂点（`from` 自身を除く）
    pub fn reachable(&self, from: VertexId, forward: bool) -> BTreeSet<VertexId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![from];
        while let Some(v) = stack.pop() {
            let next = if forward {
                &self.successors[v]
            } else {
                &self.predecessors[v]
            };
            for &n in next {
                if seen.insert(n) {
                    stack.push(n);
                }
            }
        }
        seen
    }
}

fn insert_sorted(list: &mut Vec<VertexId>, v: VertexId) {
    if let Err(pos) = list.binary_search(&v) {
        list.insert(pos, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(names: &[&str], edges: &[(usize, usize)]) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for name in names {
            g.add_vertex(Vertex {
                id: NodeId::new("s", *name),
                kind: ResourceKind::Vpc,
                region: "us-east-1".to_string(),
                account: None,
                inputs: BTreeMap::new(),
                value_type: None,
            });
        }
        for &(from, to) in edges {
            g.add_edge(from, to, EdgeKind::Explicit);
        }
        g
    }

    #[test]
    fn test_detect_cycle_simple() {
        let g = graph(&["a", "b", "c"], &[(0, 1), (1, 2), (2, 0)]);
        match g.detect_cycles() {
            Err(ConfigurationError::CyclicDependency { members }) => {
                assert_eq!(members, vec!["s/a", "s/b", "s/c", "s/a"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let g = graph(&["a"], &[(0, 0)]);
        assert!(g.finalize().is_err());
    }

    #[test]
    fn test_diamond_order_uses_declaration_tie_break() {
        let g = graph(&["a", "b", "c", "d"], &[(0, 1), (0, 2), (1, 3), (2, 3)])
            .finalize()
            .unwrap();
        assert_eq!(g.topological_order(), &[0, 1, 2, 3]);
        assert_eq!(g.destroy_order(), vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_independent_vertices_keep_declaration_order() {
        let g = graph(&["x", "y", "z"], &[(2, 0)]).finalize().unwrap();
        assert_eq!(g.topological_order(), &[1, 2, 0]);
    }

    #[test]
    fn test_duplicate_edges_are_merged() {
        let mut g = graph(&["a", "b"], &[(0, 1)]);
        g.add_edge(0, 1, EdgeKind::StackOrder);
        assert_eq!(g.edges().len(), 1);
        assert_eq!(g.edges()[0].kind, EdgeKind::Explicit);
        assert_eq!(g.successors(0), &[1]);
    }

    #[test]
    fn test_reachable() {
        let g = graph(&["a", "b", "c", "d"], &[(0, 1), (1, 2)]);
        assert_eq!(g.reachable(0, true), BTreeSet::from([1, 2]));
        assert_eq!(g.reachable(2, false), BTreeSet::from([0, 1]));
        assert!(g.reachable(3, true).is_empty());
    }
}
