//! Certpilot Library
//!
//! Certificate lifecycle orchestration for IRC daemons: issue via ACME
//! DNS-01, hand material off to the daemon's directory, trigger a
//! reload, and confirm the daemon came back healthy.
//!
//! This library provides the building blocks of that pipeline:
//!
//! - **Issuer**: ACME DNS-01 issuance with retry and rate-limit handling
//! - **DNS**: provider-agnostic TXT record management and propagation waits
//! - **Propagator**: atomic handoff of PEM material to the consumer
//! - **Coordinator**: reload triggering plus health confirmation
//! - **Scheduler**: periodic renewal checks across domain sets
//!
//! # Example
//!
//! ```ignore
//! use certpilot::pipeline::Pipeline;
//!
//! let mut pipeline = build_pipeline(&config)?;
//! let state = pipeline.run_cycle(false).await?;
//! println!("pipeline finished in state {state}");
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod activate;
pub mod backoff;
pub mod dns;
pub mod errors;
pub mod issuer;
pub mod pipeline;
pub mod propagate;
pub mod scheduler;
pub mod state;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Error taxonomy
pub use errors::{Classify, ErrorClass, PipelineError};

// Issuance
pub use issuer::{AcmeAuthority, CertificateAuthority, Issuer};

// Handoff and activation
pub use activate::RestartCoordinator;
pub use propagate::SyncPropagator;

// Lifecycle
pub use pipeline::{Pipeline, PipelineState};
pub use scheduler::RenewalScheduler;

// Storage
pub use store::{CertificateBundle, CertificateStore};
