use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use certquota::api::{build_router, QuotaApiState};
use certquota::cli::{
    exit_code_for, CliArgs, OutputFormat, EXIT_DATA_SOURCE, EXIT_INVALID, EXIT_SERVER, VERSION,
};
use certquota::config::Config;
use certquota::error::InputError;
use certquota::estimator::Estimator;
use certquota::ledger::{import_file, DeltaLedger, Ledger};
use certquota::lookback::parse_lookback;
use certquota::models::QuotaReport;
use certquota::window::parse_timestamp;

#[tokio::main]
async fn main() -> ExitCode {
    let cli_args = match CliArgs::parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Run with --help for usage.");
            return ExitCode::from(EXIT_INVALID);
        }
    };

    if cli_args.show_help {
        CliArgs::print_help();
        return ExitCode::SUCCESS;
    }

    if cli_args.show_version {
        CliArgs::print_version();
        return ExitCode::SUCCESS;
    }

    let mut config = Config::load();
    if let Some(ref table) = cli_args.table {
        config.ledger.table_path = table.clone();
    }

    if cli_args.validate_config {
        return print_config_validation(&config);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(errors) = config.validate() {
        for err in errors {
            error!(field = %err.field, "{}", err.message);
        }
        return ExitCode::from(EXIT_INVALID);
    }
    for w in config.warnings() {
        warn!(field = %w.field, "{}", w.message);
    }

    if let Some(ref path) = cli_args.import {
        return run_import(path, &config.ledger.table_path).await;
    }

    if cli_args.serve {
        return run_server(config).await;
    }

    run_estimates(&cli_args, &config).await
}

async fn run_import(path: &str, table_path: &str) -> ExitCode {
    match import_file(path, table_path).await {
        Ok(summary) => {
            println!(
                "Imported {} observations into {} ({} skipped)",
                summary.imported, table_path, summary.skipped
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Import failed");
            ExitCode::from(EXIT_DATA_SOURCE)
        }
    }
}

fn resolve_inputs(
    cli_args: &CliArgs,
    config: &Config,
) -> Result<(Duration, Option<DateTime<Utc>>), InputError> {
    let lookback = match cli_args.lookback.as_deref() {
        Some(s) => parse_lookback(s)?,
        None => config.estimator.default_lookback()?,
    };
    let now = cli_args.now.as_deref().map(parse_timestamp).transpose()?;
    Ok((lookback, now))
}

async fn run_estimates(cli_args: &CliArgs, config: &Config) -> ExitCode {
    if cli_args.is_estimate() && cli_args.domains.is_empty() {
        eprintln!("Error: at least one --domain is required");
        return ExitCode::from(EXIT_INVALID);
    }

    let (lookback, now) = match resolve_inputs(cli_args, config) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(EXIT_INVALID);
        }
    };

    let estimator = Estimator::with_options(
        DeltaLedger::from_config(&config.ledger),
        config.estimator.options(),
    );

    let estimator = &estimator;
    let results = join_all(
        cli_args
            .domains
            .iter()
            .map(|domain| async move {
                match now {
                    Some(now) => estimator.estimate(domain, lookback, now).await,
                    None => estimator.estimate_now(domain, lookback).await,
                }
            }),
    )
    .await;

    let mut code = ExitCode::SUCCESS;
    let mut worst = 0u8;
    for (domain, result) in cli_args.domains.iter().zip(results) {
        match result {
            Ok(report) => print_report(&report, cli_args.output),
            Err(e) => {
                let exit = exit_code_for(&e);
                eprintln!("Error: {}: {}", domain, e);
                if exit > worst {
                    worst = exit;
                    code = ExitCode::from(exit);
                }
            }
        }
    }
    code
}

fn print_report(report: &QuotaReport, output: OutputFormat) {
    match output {
        OutputFormat::Json => match serde_json::to_string(report) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("Error: failed to encode report for {}: {}", report.domain, e),
        },
        OutputFormat::Text => {
            println!("{}", report.domain);
            println!("  window:      {} .. {}", report.window_start, report.window_end);
            println!("  total:       {}", report.total_certs);
            println!("  new:         {}", report.new_issued);
            println!("  renewals:    {}", report.renewals);
            match (report.oldest_not_before, report.newest_not_before) {
                (Some(oldest), Some(newest)) => {
                    println!("  oldest:      {}", oldest);
                    println!("  newest:      {}", newest);
                }
                _ => println!("  oldest/newest: none"),
            }
            if let Some(age) = report.age_of_newest_before_window_end {
                println!("  newest age:  {}s before window end", age.num_seconds());
            }
        }
    }
}

async fn run_server(config: Config) -> ExitCode {
    info!("starting certquota v{}", VERSION);

    let default_lookback = match config.estimator.default_lookback() {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "Invalid default lookback");
            return ExitCode::from(EXIT_INVALID);
        }
    };

    let prometheus_handle = if config.protocols.metrics {
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Failed to install prometheus recorder, /metrics disabled");
                None
            }
        }
    } else {
        None
    };

    let delta = DeltaLedger::from_config(&config.ledger);
    info!(table = delta.table_path(), "using Delta ledger");
    let ledger: Arc<dyn Ledger> = Arc::new(delta);
    let state = Arc::new(QuotaApiState {
        estimator: Estimator::with_options(ledger, config.estimator.options()),
        default_lookback,
    });
    let app = build_router(&config.protocols, state, prometheus_handle);

    let shutdown_token = CancellationToken::new();
    spawn_signal_handler(shutdown_token.clone());

    let addr = SocketAddr::new(config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "Failed to bind");
            return ExitCode::from(EXIT_SERVER);
        }
    };
    info!(%addr, "listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
            info!("shutting down HTTP server");
        })
        .await;

    match served {
        Ok(()) => {
            info!("server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::from(EXIT_SERVER)
        }
    }
}

fn spawn_signal_handler(shutdown_token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl+c");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = terminate => info!("received SIGTERM"),
        }

        warn!("initiating graceful shutdown...");
        shutdown_token.cancel();
    });
}

fn print_config_validation(config: &Config) -> ExitCode {
    println!("Validating configuration...");
    match config.validate() {
        Ok(()) => {
            println!("Configuration is valid.");
            if let Some(ref path) = config.config_path {
                println!("Config file: {}", path);
            }
            println!("Host: {}", config.host);
            println!("Port: {}", config.port);
            println!("Log level: {}", config.log_level);
            println!("Ledger table: {}", config.ledger.table_path);
            println!("Query timeout: {}s", config.ledger.query_timeout_secs);
            println!("Candidate margin: {} days", config.estimator.candidate_margin_days);
            println!("Default lookback: {}", config.estimator.default_lookback);
            println!("API: {}", config.protocols.api);
            println!("Health: {}", config.protocols.health);
            println!("Metrics: {}", config.protocols.metrics);
            for w in config.warnings() {
                println!("Warning: {}: {}", w.field, w.message);
            }
            ExitCode::SUCCESS
        }
        Err(errors) => {
            eprintln!("Configuration validation failed:");
            for err in errors {
                eprintln!("  - {}: {}", err.field, err.message);
            }
            ExitCode::from(EXIT_INVALID)
        }
    }
}
