//! State management for provisioned resources
//!
//! Manages the `.skyflow/state.json` file which records, per node, the inputs
//! a resource was last applied with and the outputs the provider returned.
//! Concurrent runs against the same stack are prevented by per-stack lock
//! files under `.skyflow/locks/`.

use crate::error::{CloudError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const STATE_VERSION: u32 = 1;
const STATE_DIR: &str = ".skyflow";
const STATE_FILE: &str = "state.json";
const STATE_BACKUP: &str = "state.json.backup";
const LOCKS_DIR: &str = "locks";
const LOCK_STALE_HOURS: i64 = 1;

/// Persisted state of every resource managed in this project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    /// State file version
    pub version: u32,

    /// Last modified timestamp
    pub updated_at: DateTime<Utc>,

    /// Resources indexed by `stack/name`
    pub resources: BTreeMap<String, ResourceState>,
}

impl Default for GlobalState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            resources: BTreeMap::new(),
        }
    }
}

impl GlobalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get resources belonging to a stack
    pub fn stack_resources(&self, stack: &str) -> Vec<&ResourceState> {
        self.resources.values().filter(|r| r.stack == stack).collect()
    }

    /// Add or update a resource
    pub fn set_resource(&mut self, key: String, state: ResourceState) {
        self.resources.insert(key, state);
        self.updated_at = Utc::now();
    }

    /// Remove a resource
    pub fn remove_resource(&mut self, key: &str) -> Option<ResourceState> {
        let result = self.resources.remove(key);
        if result.is_some() {
            self.updated_at = Utc::now();
        }
        result
    }

    pub fn get_resource(&self, key: &str) -> Option<&ResourceState> {
        self.resources.get(key)
    }

    /// Sequence number for the next created resource
    pub fn next_sequence(&self) -> u64 {
        self.resources
            .values()
            .map(|r| r.sequence + 1)
            .max()
            .unwrap_or(0)
    }

    /// Resources ordered by creation sequence
    pub fn by_sequence(&self) -> Vec<&ResourceState> {
        let mut resources: Vec<_> = self.resources.values().collect();
        resources.sort_by_key(|r| r.sequence);
        resources
    }
}

/// State of a single resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Resource key (`stack/name`)
    pub id: String,

    /// Resource type
    pub resource_type: String,

    /// Owning stack
    pub stack: String,

    /// Region the resource was applied in
    pub region: String,

    /// Current status
    pub status: ResourceStatus,

    /// Resolved inputs of the last successful apply
    pub inputs: BTreeMap<String, serde_json::Value>,

    /// Outputs returned by the provider
    pub outputs: BTreeMap<String, serde_json::Value>,

    /// Creation order across the whole project
    pub sequence: u64,

    /// When the resource was created
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl ResourceState {
    pub fn new(
        id: impl Into<String>,
        resource_type: impl Into<String>,
        stack: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            stack: stack.into(),
            region: region.into(),
            status: ResourceStatus::Applied,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            sequence: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_inputs(mut self, inputs: BTreeMap<String, serde_json::Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: BTreeMap<String, serde_json::Value>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn get_output<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.outputs
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Status of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Resource exists with the recorded inputs
    Applied,
    /// The last provider call for this resource failed
    Failed,
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceStatus::Applied => write!(f, "applied"),
            ResourceStatus::Failed => write!(f, "failed"),
        }
    }
}

/// State manager for reading/writing state files
pub struct StateManager {
    state_dir: PathBuf,
}

impl StateManager {
    /// State under `<project_root>/.skyflow`
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self::with_state_dir(project_root.as_ref().join(STATE_DIR))
    }

    /// State under an explicit directory
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn state_path(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        self.state_dir.join(STATE_BACKUP)
    }

    fn lock_path(&self, stack: &str) -> PathBuf {
        let file_name: String = stack
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.state_dir.join(LOCKS_DIR).join(format!("{file_name}.json"))
    }

    async fn ensure_dir(&self, dir: &Path) -> Result<()> {
        if !dir.exists() {
            fs::create_dir_all(dir).await?;
            tracing::debug!(dir = %dir.display(), "Created state directory");
        }
        Ok(())
    }

    /// Load the current state
    pub async fn load(&self) -> Result<GlobalState> {
        let path = self.state_path();
        if !path.exists() {
            tracing::debug!("State file not found, returning empty state");
            return Ok(GlobalState::new());
        }

        let content = fs::read_to_string(&path).await?;
        let state: GlobalState = serde_json::from_str(&content)?;

        if state.version > STATE_VERSION {
            return Err(CloudError::StateError(format!(
                "State file version {} is newer than supported version {}",
                state.version, STATE_VERSION
            )));
        }

        tracing::debug!(resources = state.resources.len(), "Loaded state");
        Ok(state)
    }

    /// Save the state, keeping the previous file as a backup
    pub async fn save(&self, state: &GlobalState) -> Result<()> {
        self.ensure_dir(&self.state_dir).await?;

        let path = self.state_path();
        let backup = self.backup_path();

        if path.exists() {
            if backup.exists() {
                fs::remove_file(&backup).await?;
            }
            fs::rename(&path, &backup).await?;
            tracing::debug!("Created state backup");
        }

        let content = serde_json::to_string_pretty(state)?;
        fs::write(&path, content).await?;

        tracing::debug!(resources = state.resources.len(), "Saved state");
        Ok(())
    }

    /// Acquire an exclusive lock on one stack
    ///
    /// Lock files older than one hour are considered stale and replaced.
    pub async fn acquire_lock(&self, stack: &str) -> Result<StateLock> {
        let lock_path = self.lock_path(stack);
        if let Some(dir) = lock_path.parent() {
            self.ensure_dir(dir).await?;
        }

        let lock_info = LockInfo {
            stack: stack.to_string(),
            holder: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let content = serde_json::to_string_pretty(&lock_info)?;

        // Second attempt only happens after a stale lock was removed
        for _ in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(content.as_bytes()).await?;
                    file.flush().await?;
                    tracing::debug!(stack, "Acquired stack lock");
                    return Ok(StateLock {
                        stack: stack.to_string(),
                        lock_path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let existing = fs::read_to_string(&lock_path).await?;
                    if let Ok(existing) = serde_json::from_str::<LockInfo>(&existing) {
                        let age = Utc::now().signed_duration_since(existing.acquired_at);
                        if age.num_hours() < LOCK_STALE_HOURS {
                            return Err(CloudError::LockError(format!(
                                "Stack '{}' is locked by {} (pid {}) since {}",
                                stack, existing.holder, existing.pid, existing.acquired_at
                            )));
                        }
                        tracing::warn!(stack, holder = %existing.holder, "Removing stale lock");
                    } else {
                        tracing::warn!(stack, "Removing unreadable lock file");
                    }
                    fs::remove_file(&lock_path).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CloudError::LockError(format!(
            "Stack '{}' lock could not be acquired",
            stack
        )))
    }

    /// Acquire locks on several stacks in name order
    ///
    /// Locks already taken are released if any acquisition fails.
    pub async fn acquire_locks<'a>(
        &self,
        stacks: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<StateLock>> {
        let mut names: Vec<&str> = stacks.into_iter().collect();
        names.sort_unstable();
        names.dedup();

        let mut locks = Vec::with_capacity(names.len());
        for stack in names {
            locks.push(self.acquire_lock(stack).await?);
        }
        Ok(locks)
    }
}

/// Lock information
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    stack: String,
    holder: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// RAII guard for a stack lock
#[derive(Debug)]
pub struct StateLock {
    stack: String,
    lock_path: PathBuf,
    released: bool,
}

impl StateLock {
    pub fn stack(&self) -> &str {
        &self.stack
    }

    /// Release the lock
    pub async fn release(mut self) -> Result<()> {
        if !self.released {
            if self.lock_path.exists() {
                fs::remove_file(&self.lock_path).await?;
                tracing::debug!(stack = %self.stack, "Released stack lock");
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if !self.released && self.lock_path.exists() {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}
