//! Local provider implementation

use async_trait::async_trait;
use serde_json::{Value, json};
use skyflow_cloud::{AuthStatus, CloudError, CloudProvider, ResourceConfig, ResourceOutputs, Result};
use skyflow_core::{ResourceKind, ValueType};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const DEFAULT_ACCOUNT: &str = "000000000000";

/// Kind of provider call recorded in the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Create,
    Update,
    Delete,
}

/// A provider call as recorded when it started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    pub kind: CallKind,
    pub id: String,
}

/// In-process provider with deterministic outputs
#[derive(Debug, Default)]
pub struct LocalProvider {
    latency: Option<Duration>,
    failing: Mutex<HashSet<String>>,
    failing_deletes: Mutex<HashSet<String>>,
    journal: Mutex<Vec<ProviderCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl LocalProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make create/update of `id` (`stack/name`) fail
    pub fn with_failure(self, id: impl Into<String>) -> Self {
        lock(&self.failing).insert(id.into());
        self
    }

    /// Make delete of `id` (`stack/name`) fail
    pub fn with_delete_failure(self, id: impl Into<String>) -> Self {
        lock(&self.failing_deletes).insert(id.into());
        self
    }

    /// Calls in the order they started
    pub fn calls(&self) -> Vec<ProviderCall> {
        lock(&self.journal).clone()
    }

    /// Resource ids of calls of one kind, in start order
    pub fn call_ids(&self, kind: CallKind) -> Vec<String> {
        lock(&self.journal)
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.id.clone())
            .collect()
    }

    /// Highest number of calls that were in flight at once
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, kind: CallKind, id: &str) -> InFlight<'_> {
        lock(&self.journal).push(ProviderCall {
            kind,
            id: id.to_string(),
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let guard = InFlight {
            counter: &self.in_flight,
        };
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        guard
    }

    fn check_failure(&self, set: &Mutex<HashSet<String>>, resource: &ResourceConfig) -> Result<()> {
        if lock(set).contains(&resource.id) {
            tracing::debug!(resource = %resource.id, "Injected failure");
            return Err(CloudError::ProviderFailed {
                resource: resource.id.clone(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl CloudProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn display_name(&self) -> &str {
        "Local (simulated)"
    }

    async fn check_auth(&self) -> Result<AuthStatus> {
        Ok(AuthStatus::ok("local simulation"))
    }

    async fn create(&self, resource: &ResourceConfig) -> Result<ResourceOutputs> {
        let _guard = self.enter(CallKind::Create, &resource.id).await;
        self.check_failure(&self.failing, resource)?;
        let outputs = synthesize_outputs(resource)?;
        tracing::info!(resource = %resource.id, kind = %resource.resource_type, "Created");
        Ok(outputs)
    }

    async fn update(
        &self,
        resource: &ResourceConfig,
        current: &ResourceOutputs,
    ) -> Result<ResourceOutputs> {
        let _guard = self.enter(CallKind::Update, &resource.id).await;
        self.check_failure(&self.failing, resource)?;
        let mut outputs = synthesize_outputs(resource)?;
        // Identifiers survive an in-place update
        for (name, value) in current {
            if name.ends_with("_id") || name.ends_with("_arn") {
                outputs.insert(name.clone(), value.clone());
            }
        }
        tracing::info!(resource = %resource.id, kind = %resource.resource_type, "Updated");
        Ok(outputs)
    }

    async fn delete(&self, resource: &ResourceConfig, _current: &ResourceOutputs) -> Result<()> {
        let _guard = self.enter(CallKind::Delete, &resource.id).await;
        self.check_failure(&self.failing_deletes, resource)?;
        tracing::info!(resource = %resource.id, kind = %resource.resource_type, "Deleted");
        Ok(())
    }
}

/// Synthesize the outputs a kind declares
fn synthesize_outputs(resource: &ResourceConfig) -> Result<ResourceOutputs> {
    let kind: ResourceKind = resource
        .resource_type
        .parse()
        .map_err(|_| CloudError::UnsupportedResource(resource.resource_type.clone()))?;
    if kind.is_virtual() {
        return Err(CloudError::UnsupportedResource(kind.to_string()));
    }

    let hash = format!("{:016x}", fnv1a(&format!("{}@{}", resource.id, resource.region)));
    let short = &hash[..8];
    let account = resource.account.as_deref().unwrap_or(DEFAULT_ACCOUNT);

    let mut outputs = ResourceOutputs::new();
    for spec in kind.outputs() {
        let value = match (spec.name, spec.value_type) {
            ("endpoint_port", _) => json!(default_port(resource)),
            ("zone_name", _) => resource
                .inputs
                .get("domain_name")
                .cloned()
                .unwrap_or_else(|| json!(format!("{short}.example.com"))),
            ("fqdn", _) => json!(format!(
                "{}.{}",
                resource
                    .get_input::<String>("record_name")
                    .unwrap_or_else(|| short.to_string()),
                "local.skyflow.dev"
            )),
            (name, ValueType::String) if name.ends_with("_arn") => json!(format!(
                "arn:aws:{}:{}:{}:{}/{}",
                kind,
                resource.region,
                account,
                name.trim_end_matches("_arn"),
                hash
            )),
            (name, ValueType::String) if name.ends_with("_id") => {
                json!(format!("{}-{}", id_prefix(kind), hash))
            }
            (name, ValueType::String) => json!(format!("{}-{}", name.replace('_', "-"), short)),
            (_, ValueType::Domain) => json!(format!(
                "{}.{}.{}.local.skyflow.dev",
                short, kind, resource.region
            )),
            (name, ValueType::List) => {
                let count = resource.get_input::<u64>("max_azs").unwrap_or(2);
                let prefix = name.trim_end_matches("_ids").replace('_', "-");
                Value::Array(
                    (0..count)
                        .map(|i| json!(format!("{prefix}-{short}-{i}")))
                        .collect(),
                )
            }
            (_, ValueType::Integer) => json!(0),
            (_, ValueType::Bool) => json!(false),
            (_, ValueType::Cidr) => json!("10.0.0.0/16"),
            (_, ValueType::Any) => Value::Null,
        };
        outputs.insert(spec.name.to_string(), value);
    }
    Ok(outputs)
}

fn id_prefix(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::HostedZoneLookup => "Z",
        ResourceKind::Vpc => "vpc",
        ResourceKind::SecurityGroup => "sg",
        ResourceKind::DatabaseInstance => "db",
        ResourceKind::LaunchTemplate => "lt",
        ResourceKind::Distribution => "E",
        _ => "res",
    }
}

fn default_port(resource: &ResourceConfig) -> u16 {
    match resource.get_input::<String>("engine").as_deref() {
        Some(engine) if engine.starts_with("postgres") => 5432,
        _ => 3306,
    }
}

/// FNV-1a 64-bit
fn fnv1a(input: &str) -> u64 {
    input.bytes().fold(0xcbf29ce484222325, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x100000001b3)
    })
}
