//! Making the consumer pick up new certificate material.
//!
//! A [`ReloadStrategy`] triggers the consumer (hot reload via a rehash
//! command, or a full restart), then a [`HealthProbe`] confirms the
//! service came back. If it never does within the probe budget the
//! caller marks the pipeline degraded; the previous certificate keeps
//! serving and the situation is an operator problem, not a crash.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

use certpilot_config::{HealthConfig, ProbeKind, ReloadConfig, ReloadMode};

use crate::errors::{Classify, ErrorClass};

#[derive(Debug, Error)]
pub enum ActivateError {
    #[error("Reload command failed: {0}")]
    Reload(String),

    #[error("Service did not become healthy after {attempts} probe attempts")]
    HealthCheckTimeout { attempts: u32 },

    #[error("Invalid activation configuration: {0}")]
    Configuration(String),
}

impl Classify for ActivateError {
    fn class(&self) -> ErrorClass {
        match self {
            ActivateError::Reload(_) => ErrorClass::Transient,
            ActivateError::HealthCheckTimeout { .. } => ErrorClass::Timeout,
            ActivateError::Configuration(_) => ErrorClass::Permanent,
        }
    }
}

/// How to make the consumer load the new material.
#[async_trait]
pub trait ReloadStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn trigger(&self) -> Result<(), ActivateError>;
}

/// Runs a rehash-style command; the consumer stays up throughout.
pub struct HotReload {
    command: Vec<String>,
}

/// Runs a command that restarts the consumer process entirely.
pub struct FullRestart {
    command: Vec<String>,
}

#[async_trait]
impl ReloadStrategy for HotReload {
    fn name(&self) -> &'static str {
        "hot-reload"
    }

    async fn trigger(&self) -> Result<(), ActivateError> {
        run_command(&self.command).await
    }
}

#[async_trait]
impl ReloadStrategy for FullRestart {
    fn name(&self) -> &'static str {
        "full-restart"
    }

    async fn trigger(&self) -> Result<(), ActivateError> {
        run_command(&self.command).await
    }
}

/// Build the strategy the config asks for.
pub fn strategy_from_config(config: &ReloadConfig) -> Result<Box<dyn ReloadStrategy>, ActivateError> {
    if config.command.is_empty() {
        return Err(ActivateError::Configuration("empty reload command".into()));
    }
    Ok(match config.mode {
        ReloadMode::HotReload => Box::new(HotReload {
            command: config.command.clone(),
        }),
        ReloadMode::Restart => Box::new(FullRestart {
            command: config.command.clone(),
        }),
    })
}

async fn run_command(command: &[String]) -> Result<(), ActivateError> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| ActivateError::Configuration("empty reload command".into()))?;

    debug!(command = ?command, "running reload command");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| ActivateError::Reload(format!("{program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ActivateError::Reload(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

/// A liveness check against the consumer.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// TCP connect probe against the consumer's listener.
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn check(&self) -> bool {
        let addr = format!("{}:{}", self.host, self.port);
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(&addr)).await,
            Ok(Ok(_))
        )
    }
}

/// Probe that runs a command and treats exit 0 as healthy.
pub struct CommandProbe {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandProbe {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl HealthProbe for CommandProbe {
    async fn check(&self) -> bool {
        let Some((program, args)) = self.command.split_first() else {
            return false;
        };
        let result = tokio::time::timeout(
            self.timeout,
            Command::new(program).args(args).output(),
        )
        .await;
        matches!(result, Ok(Ok(output)) if output.status.success())
    }
}

/// Build the probe the config asks for.
pub fn probe_from_config(
    config: &HealthConfig,
    host: &str,
    port: u16,
) -> Result<Box<dyn HealthProbe>, ActivateError> {
    Ok(match config.probe {
        ProbeKind::Tcp => Box::new(TcpProbe::new(host, port, config.timeout())),
        ProbeKind::Command => {
            let command = config
                .command
                .clone()
                .filter(|c| !c.is_empty())
                .ok_or_else(|| {
                    ActivateError::Configuration("command probe requires a command".into())
                })?;
            Box::new(CommandProbe::new(command, config.timeout()))
        }
    })
}

/// Drives reload-then-verify for one consumer.
pub struct RestartCoordinator {
    strategy: Box<dyn ReloadStrategy>,
    probe: Box<dyn HealthProbe>,
    retries: u32,
    interval: Duration,
}

impl RestartCoordinator {
    pub fn new(
        strategy: Box<dyn ReloadStrategy>,
        probe: Box<dyn HealthProbe>,
        retries: u32,
        interval: Duration,
    ) -> Self {
        Self {
            strategy,
            probe,
            retries,
            interval,
        }
    }

    /// Trigger the reload, then poll the probe exactly `retries` times at
    /// the configured interval until it reports healthy.
    pub async fn activate(&self) -> Result<(), ActivateError> {
        info!(strategy = self.strategy.name(), "activating new certificate material");
        self.strategy.trigger().await?;

        for attempt in 1..=self.retries {
            if self.probe.check().await {
                info!(attempt, "service healthy after activation");
                return Ok(());
            }
            debug!(attempt, retries = self.retries, "service not healthy yet");
            if attempt < self.retries {
                tokio::time::sleep(self.interval).await;
            }
        }

        warn!(
            attempts = self.retries,
            "service never became healthy, previous certificate continues to serve"
        );
        Err(ActivateError::HealthCheckTimeout {
            attempts: self.retries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingProbe, CountingStrategy};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_service_probed_exact_number_of_times() {
        let probe = Arc::new(CountingProbe::never_healthy());
        let strategy = Arc::new(CountingStrategy::succeeding());
        let coordinator = RestartCoordinator::new(
            Box::new(strategy.as_ref().clone()),
            Box::new(probe.as_ref().clone()),
            4,
            Duration::from_millis(250),
        );

        let start = tokio::time::Instant::now();
        let err = coordinator.activate().await.unwrap_err();

        assert!(matches!(err, ActivateError::HealthCheckTimeout { attempts: 4 }));
        assert_eq!(probe.checks(), 4);
        assert_eq!(strategy.triggers(), 1);
        // Three sleeps between four probes, none after the last.
        assert_eq!(start.elapsed(), Duration::from_millis(750));
    }

    #[tokio::test]
    async fn test_healthy_service_stops_probing() {
        let probe = Arc::new(CountingProbe::healthy_after(2));
        let strategy = Arc::new(CountingStrategy::succeeding());
        let coordinator = RestartCoordinator::new(
            Box::new(strategy.as_ref().clone()),
            Box::new(probe.as_ref().clone()),
            10,
            Duration::from_millis(1),
        );

        coordinator.activate().await.unwrap();
        assert_eq!(probe.checks(), 2);
    }

    #[tokio::test]
    async fn test_failed_reload_skips_probing() {
        let probe = Arc::new(CountingProbe::never_healthy());
        let strategy = Arc::new(CountingStrategy::failing());
        let coordinator = RestartCoordinator::new(
            Box::new(strategy.as_ref().clone()),
            Box::new(probe.as_ref().clone()),
            5,
            Duration::from_millis(1),
        );

        let err = coordinator.activate().await.unwrap_err();
        assert!(matches!(err, ActivateError::Reload(_)));
        assert_eq!(probe.checks(), 0);
    }

    #[tokio::test]
    async fn test_tcp_probe_against_live_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = TcpProbe::new("127.0.0.1", port, Duration::from_secs(1));
        assert!(probe.check().await);

        drop(listener);
        let probe = TcpProbe::new("127.0.0.1", port, Duration::from_millis(200));
        assert!(!probe.check().await);
    }

    #[tokio::test]
    async fn test_command_probe_exit_codes() {
        let healthy = CommandProbe::new(vec!["true".into()], Duration::from_secs(1));
        assert!(healthy.check().await);
        let unhealthy = CommandProbe::new(vec!["false".into()], Duration::from_secs(1));
        assert!(!unhealthy.check().await);
    }

    #[test]
    fn test_strategy_selection() {
        let hot = strategy_from_config(&ReloadConfig {
            mode: ReloadMode::HotReload,
            command: vec!["ircd".into(), "rehash".into()],
        })
        .unwrap();
        assert_eq!(hot.name(), "hot-reload");

        let restart = strategy_from_config(&ReloadConfig {
            mode: ReloadMode::Restart,
            command: vec!["systemctl".into(), "restart".into(), "ircd".into()],
        })
        .unwrap();
        assert_eq!(restart.name(), "full-restart");

        assert!(strategy_from_config(&ReloadConfig {
            mode: ReloadMode::Restart,
            command: vec![],
        })
        .is_err());
    }
}
