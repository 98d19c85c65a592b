//! The certificate lifecycle pipeline for one domain set.
//!
//! One cycle walks issue -> propagate -> activate and lands in a
//! terminal state:
//!
//! * `Ready`    - valid material installed and the consumer is serving it
//! * `Degraded` - new material installed but the consumer never confirmed
//!   health; the previous certificate keeps serving
//! * `Failed`   - the cycle aborted; nothing was handed off
//!
//! `Failed` and `Degraded` are not sticky: the next cycle starts over
//! from issuance.

use std::fmt;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::dns::normalize_domain;
use crate::errors::PipelineError;
use crate::issuer::Issuer;
use crate::propagate::SyncPropagator;
use crate::activate::RestartCoordinator;
use crate::state::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Issuing,
    Propagating,
    Restarting,
    Ready,
    Degraded,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Uninitialized => "uninitialized",
            PipelineState::Issuing => "issuing",
            PipelineState::Propagating => "propagating",
            PipelineState::Restarting => "restarting",
            PipelineState::Ready => "ready",
            PipelineState::Degraded => "degraded",
            PipelineState::Failed => "failed",
        };
        f.write_str(s)
    }
}

pub struct Pipeline {
    domains: Vec<String>,
    issuer: Issuer,
    propagator: SyncPropagator,
    coordinator: RestartCoordinator,
    tracker: Arc<dyn StateStore>,
    state: PipelineState,
}

impl Pipeline {
    pub fn new(
        domains: Vec<String>,
        issuer: Issuer,
        propagator: SyncPropagator,
        coordinator: RestartCoordinator,
        tracker: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            domains,
            issuer,
            propagator,
            coordinator,
            tracker,
            state: PipelineState::Uninitialized,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn primary(&self) -> &str {
        normalize_domain(&self.domains[0])
    }

    fn installed_flag(&self) -> String {
        format!("installed:{}", self.primary())
    }

    /// Run one lifecycle cycle. Returns the terminal state reached, or
    /// the error that forced `Failed`.
    pub async fn run_cycle(&mut self, force: bool) -> Result<PipelineState, PipelineError> {
        let primary = self.primary().to_string();

        self.state = PipelineState::Issuing;
        let issuance = match self.issuer.issue(&self.domains, force).await {
            Ok(issuance) => issuance,
            Err(e) => return self.fail(e.into()),
        };

        let installed = match self.tracker.has(&self.installed_flag()) {
            Ok(installed) => installed,
            Err(e) => return self.fail(e.into()),
        };

        // Fresh material already handed off on an earlier cycle: nothing
        // to do, and crucially no daily reload of a healthy consumer.
        if !issuance.renewed && installed {
            self.state = PipelineState::Ready;
            return Ok(self.state);
        }

        self.state = PipelineState::Propagating;
        if let Err(e) = self.propagator.propagate(&issuance.bundle).await {
            return self.fail(e.into());
        }

        self.state = PipelineState::Restarting;
        match self.coordinator.activate().await {
            Ok(()) => {
                if !installed {
                    if let Err(e) = self.tracker.set(&self.installed_flag()) {
                        return self.fail(e.into());
                    }
                }
                info!(
                    primary = %primary,
                    expires_at = %issuance.bundle.expires_at,
                    "certificate pipeline ready"
                );
                self.state = PipelineState::Ready;
                Ok(self.state)
            }
            Err(e) => {
                warn!(
                    primary = %primary,
                    error = %e,
                    "consumer did not confirm new material, marking degraded"
                );
                self.state = PipelineState::Degraded;
                Ok(self.state)
            }
        }
    }

    fn fail(&mut self, err: PipelineError) -> Result<PipelineState, PipelineError> {
        error!(
            primary = self.primary(),
            error = %err,
            "certificate pipeline failed"
        );
        self.state = PipelineState::Failed;
        Err(err)
    }
}
