//! SkyFlow engine
//!
//! スタック間・リージョン間リンカー、依存グラフ、トポロジカル実行器。
//!
//! ```text
//! Deployment ──link──▶ DependencyGraph ──Executor──▶ RunReport ──▶ GlobalState
//! ```
//!
//! [`Engine`] は状態の読み書きとロックを含めた1回の実行をまとめます。

pub mod error;
pub mod executor;
pub mod graph;
pub mod linker;
pub mod lock;
pub mod plan;
pub mod report;

pub use error::{ConfigurationError, EngineError, Result};
pub use executor::{DEFAULT_PARALLELISM, Executor};
pub use graph::{DependencyGraph, Edge, EdgeKind, Vertex, VertexId, VertexInput};
pub use linker::link;
pub use lock::{StackLockGuard, StackLockTable};
pub use report::{
    NodeReport, NodeState, Operation, RunReport, RunStatus, RunSummary, StackReport, StackStatus,
};

use skyflow_cloud::{CloudProvider, Plan, StateManager};
use skyflow_core::Deployment;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// 状態・ロック・実行器をまとめたエントリポイント
pub struct Engine {
    executor: Executor,
    state: StateManager,
    locks: StackLockTable,
}

impl Engine {
    pub fn new(provider: Arc<dyn CloudProvider>, state: StateManager) -> Self {
        Self {
            executor: Executor::new(provider),
            state,
            locks: StackLockTable::new(),
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.executor = self.executor.with_parallelism(parallelism);
        self
    }

    /// 複数の Engine で同じロック表を共有
    pub fn with_lock_table(mut self, locks: StackLockTable) -> Self {
        self.locks = locks;
        self
    }

    pub fn parallelism(&self) -> usize {
        self.executor.parallelism()
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    /// 宣言を検証して依存グラフを構築
    pub fn link(&self, deployment: &Deployment) -> Result<DependencyGraph> {
        Ok(link(deployment)?)
    }

    /// 前回の状態と比較した計画
    #[instrument(skip_all, fields(deployment = %deployment.name))]
    pub async fn plan(&self, deployment: &Deployment) -> Result<Plan> {
        let graph = link(deployment)?;
        let state = self.state.load().await?;
        Ok(plan::plan(&graph, &state))
    }

    pub async fn apply(
        &self,
        deployment: &Deployment,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        self.run(deployment, Operation::Apply, cancel).await
    }

    pub async fn destroy(
        &self,
        deployment: &Deployment,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        self.run(deployment, Operation::Destroy, cancel).await
    }

    /// リンク → ロック → 実行 → 状態の保存
    ///
    /// 宣言の不整合はリソースに触れる前に `Err` で返します。
    /// 実行中の失敗はレポートのステータスで表されます。
    #[instrument(skip_all, fields(deployment = %deployment.name, operation = ?operation))]
    async fn run(
        &self,
        deployment: &Deployment,
        operation: Operation,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let graph = link(deployment)?;

        let stacks: Vec<&str> = deployment.stacks.iter().map(|s| s.name.as_str()).collect();
        let _guard = self.locks.try_acquire(stacks.iter().copied())?;
        let file_locks = self.state.acquire_locks(stacks.iter().copied()).await?;

        let prior = self.state.load().await?;
        let mut report = match operation {
            Operation::Apply => {
                self.executor
                    .apply(deployment, &graph, &prior, cancel.clone())
                    .await
            }
            Operation::Destroy => {
                self.executor
                    .destroy(deployment, &graph, &prior, cancel.clone())
                    .await
            }
        };

        let mut state = prior.clone();
        report.record_into(&mut state);

        // 宣言から消えたリソースの削除は apply のみ（destroy は宣言済みスタックだけが対象）
        if operation == Operation::Apply
            && matches!(report.status, RunStatus::Success | RunStatus::PartialFailure)
            && !cancel.is_cancelled()
        {
            let (pruned, errors) = self.executor.prune_orphans(&graph, &mut state).await;
            if !errors.is_empty() {
                warn!(count = errors.len(), "Some orphaned resources could not be deleted");
                report.status = RunStatus::PartialFailure;
                report.error = Some(errors.join("\n"));
            }
            report.pruned = pruned;
        }

        self.state.save(&state).await?;
        for lock in file_locks {
            lock.release().await?;
        }

        info!(status = %report.status, "Run recorded");
        Ok(report)
    }
}
