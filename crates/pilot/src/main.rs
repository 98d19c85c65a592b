//! Certpilot - Main entry point
//!
//! Certificate lifecycle orchestration for IRC daemons: ACME DNS-01
//! issuance, atomic handoff, reload coordination, scheduled renewal.

use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use certpilot_config::Config;

use certpilot::activate::{probe_from_config, strategy_from_config, RestartCoordinator};
use certpilot::backoff::BackoffPolicy;
use certpilot::dns::{load_credentials, DnsProvider, PropagationWait, ZoneApiProvider};
use certpilot::errors::{Classify, PipelineError};
use certpilot::issuer::{AcmeAuthority, Issuer};
use certpilot::pipeline::{Pipeline, PipelineState};
use certpilot::propagate::SyncPropagator;
use certpilot::scheduler::RenewalScheduler;
use certpilot::state::{FileStateStore, StateStore};
use certpilot::store::CertificateStore;

/// Certpilot - certificate lifecycle orchestration for IRC daemons
#[derive(Parser, Debug)]
#[command(name = "certpilot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTPILOT_CONFIG")]
    config: String,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Issue certificates for all configured domain sets (idempotent)
    Issue,
    /// Renew certificates, optionally even when not yet due
    Renew {
        /// Renew regardless of the remaining validity
        #[arg(long)]
        force: bool,
    },
    /// Show stored certificates and their expiry
    Status,
    /// Run the renewal scheduler until interrupted
    Run,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %cli.config, error = %e, "failed to load configuration");
            return ExitCode::from(2);
        }
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "configuration is invalid");
        return ExitCode::from(2);
    }
    info!(path = %cli.config, domain_sets = config.domain_sets.len(), "configuration loaded");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            return ExitCode::from(1);
        }
    };

    runtime.block_on(dispatch(cli.command, &config))
}

async fn dispatch(command: Commands, config: &Config) -> ExitCode {
    match command {
        Commands::Issue => run_cycles(config, false).await,
        Commands::Renew { force } => run_cycles(config, force).await,
        Commands::Status => show_status(config),
        Commands::Run => run_scheduler(config).await,
    }
}

/// Shared components plus one pipeline per domain set.
fn build_pipelines(config: &Config) -> Result<Vec<Pipeline>, PipelineError> {
    let store = Arc::new(CertificateStore::new(&config.store.cert_dir)?);
    let tracker: Arc<dyn StateStore> = Arc::new(FileStateStore::new(&config.store.state_dir)?);

    // Credentials are read exactly once per process.
    let credentials = load_credentials(&config.dns.credentials_file)?;
    let dns: Arc<dyn DnsProvider> = Arc::new(ZoneApiProvider::new(
        &config.dns.api_url,
        &credentials,
        config.dns.api_timeout(),
    )?);

    let authority = Arc::new(AcmeAuthority::new(
        store.clone(),
        &config.acme.contact,
        config.acme.staging,
    ));
    let acme_backoff = BackoffPolicy::from_config(&config.acme.backoff);
    let propagation_backoff = BackoffPolicy::from_config(&config.consumer.propagation_backoff);

    let mut pipelines = Vec::with_capacity(config.domain_sets.len());
    for set in &config.domain_sets {
        let issuer = Issuer::new(
            authority.clone(),
            dns.clone(),
            PropagationWait::from_config(&config.dns.propagation),
            store.clone(),
            config.acme.renew_before_days,
            acme_backoff.clone(),
        );
        let propagator = SyncPropagator::new(config.target_dir_for(set), propagation_backoff.clone());
        let coordinator = RestartCoordinator::new(
            strategy_from_config(&config.consumer.reload)?,
            probe_from_config(
                &config.consumer.health,
                &config.consumer.host,
                config.consumer.port,
            )?,
            config.consumer.health.retries,
            config.consumer.health.interval(),
        );
        pipelines.push(Pipeline::new(
            set.domains.clone(),
            issuer,
            propagator,
            coordinator,
            tracker.clone(),
        ));
    }
    Ok(pipelines)
}

/// Run one cycle per domain set and fold the results into an exit code.
async fn run_cycles(config: &Config, force: bool) -> ExitCode {
    let mut pipelines = match build_pipelines(config) {
        Ok(pipelines) => pipelines,
        Err(e) => {
            error!(error = %e, "failed to assemble pipelines");
            return ExitCode::from(e.exit_code());
        }
    };

    let mut worst: u8 = 0;
    for pipeline in &mut pipelines {
        let primary = pipeline.primary().to_string();
        match pipeline.run_cycle(force).await {
            Ok(PipelineState::Degraded) => {
                // Material is in place and the old certificate still serves;
                // an operator should look, but this is not a failure.
                warn!(primary = %primary, "pipeline degraded, consumer never confirmed health");
            }
            Ok(state) => {
                info!(primary = %primary, state = %state, "pipeline finished");
            }
            Err(e) => {
                error!(primary = %primary, error = %e, "pipeline failed");
                worst = worst.max(e.exit_code());
            }
        }
    }
    ExitCode::from(worst)
}

fn show_status(config: &Config) -> ExitCode {
    let store = match CertificateStore::new(&config.store.cert_dir) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "cannot open certificate store");
            return ExitCode::from(e.class().exit_code());
        }
    };
    let tracker = match FileStateStore::new(&config.store.state_dir) {
        Ok(tracker) => tracker,
        Err(e) => {
            error!(error = %e, "cannot open state directory");
            return ExitCode::from(e.class().exit_code());
        }
    };

    let now = Utc::now();
    for set in &config.domain_sets {
        let primary = set.primary();
        match store.load(primary) {
            Ok(Some(bundle)) => {
                let remaining = bundle.remaining(now).num_days();
                let due = bundle.expires_within_days(config.acme.renew_before_days, now);
                let installed = tracker
                    .get(&format!("installed:{}", bundle.primary()))
                    .ok()
                    .flatten()
                    .map(|ts| ts.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{}: expires {} ({} days remaining){}, installed {}",
                    bundle.primary(),
                    bundle.expires_at.to_rfc3339(),
                    remaining,
                    if due { ", renewal due" } else { "" },
                    installed,
                );
            }
            Ok(None) => println!("{primary}: no certificate issued"),
            Err(e) => println!("{primary}: unreadable ({e})"),
        }
    }
    ExitCode::SUCCESS
}

async fn run_scheduler(config: &Config) -> ExitCode {
    let pipelines = match build_pipelines(config) {
        Ok(pipelines) => pipelines,
        Err(e) => {
            error!(error = %e, "failed to assemble pipelines");
            return ExitCode::from(e.exit_code());
        }
    };

    let scheduler = RenewalScheduler::new(
        pipelines,
        config.scheduler.check_interval(),
        config.scheduler.concurrent,
    );

    tokio::select! {
        _ = scheduler.run() => ExitCode::from(1),
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => {
                    info!("shutdown signal received");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = %e, "failed to listen for shutdown signal");
                    ExitCode::from(1)
                }
            }
        }
    }
}
