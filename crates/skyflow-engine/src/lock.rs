//! プロセス内のスタックロック
//!
//! 同じプロセス内で同一スタックに対する実行が重ならないようにします。
//! プロセス間の排他は `StateManager` のロックファイルが担います。

use crate::error::{EngineError, Result};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// ロック中のスタック名の表
#[derive(Debug, Clone, Default)]
pub struct StackLockTable {
    held: Arc<Mutex<BTreeSet<String>>>,
}

impl StackLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 全スタックをまとめてロック
    ///
    /// 1つでもロック済みなら何も取得せずに `StackLocked` を返します。
    pub fn try_acquire<I, S>(&self, stacks: I) -> Result<StackLockGuard>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let stacks: BTreeSet<String> = stacks.into_iter().map(Into::into).collect();
        let mut held = self.held();

        if let Some(locked) = stacks.iter().find(|s| held.contains(*s)) {
            return Err(EngineError::StackLocked(locked.clone()));
        }
        held.extend(stacks.iter().cloned());
        debug!(stacks = ?stacks, "Acquired in-process stack locks");

        Ok(StackLockGuard {
            table: self.clone(),
            stacks,
        })
    }

    pub fn is_locked(&self, stack: &str) -> bool {
        self.held().contains(stack)
    }
}

/// ドロップ時にロックを解放
#[derive(Debug)]
pub struct StackLockGuard {
    table: StackLockTable,
    stacks: BTreeSet<String>,
}

impl StackLockGuard {
    pub fn stacks(&self) -> impl Iterator<Item = &str> {
        self.stacks.iter().map(String::as_str)
    }
}

impl Drop for StackLockGuard {
    fn drop(&mut self) {
        let mut held = self.table.held();
        for stack in &self.stacks {
            held.remove(stack);
        }
    }
}
