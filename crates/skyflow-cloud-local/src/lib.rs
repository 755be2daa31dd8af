//! Local provider for SkyFlow
//!
//! Simulates a cloud account in process. Every resource kind gets
//! deterministic outputs derived from its identity and region, so plans and
//! applies can be exercised without credentials or network access.
//! Failures and latency can be injected for testing the executor.

mod provider;

pub use provider::{CallKind, LocalProvider, ProviderCall};
