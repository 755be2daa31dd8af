//! SkyFlow Cloud
//!
//! Provider abstraction, plan types and persisted state for SkyFlow.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                   SkyFlow CLI                    │
//! │           (sky plan / apply / destroy)           │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                 skyflow-engine                   │
//! │       linker · dependency graph · executor       │
//! └───────┬─────────────────┬───────────────────────┘
//!         │                 │
//! ┌───────▼───────────────────▼─────────────────────┐
//! │                  skyflow-cloud                   │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │  trait CloudProvider { create/update/... }│   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────────┐  ┌──────────────────────┐     │
//! │  │  Plan/Action │  │ State + stack locks  │     │
//! │  └──────────────┘  └──────────────────────┘     │
//! └───────┬─────────────────────────────────────────┘
//!         │
//! ┌───────▼───────┐
//! │ cloud-local   │
//! │   provider    │
//! └───────────────┘
//! ```

pub mod action;
pub mod error;
pub mod provider;
pub mod state;

// Re-exports
pub use action::{Action, ActionType, Plan, PlanSummary};
pub use error::{CloudError, Result};
pub use provider::{AuthStatus, CloudProvider, ResourceConfig, ResourceOutputs};
pub use state::{GlobalState, ResourceState, ResourceStatus, StateLock, StateManager};
