use anyhow::{Context, Result};
use bucket_recovery::{
    config::{AppConfig, Args},
    services::{
        credentials::EnvOrFileTokenSource, recovery_service::RecoveryService,
        storage_client::StorageClient,
    },
};
use std::{fs, process::ExitCode};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // --- Parse config ---
    let args = Args::parse_or_exit();
    let cfg = match AppConfig::from_env_and_args(args) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {:#}", err);
            return Ok(ExitCode::from(1));
        }
    };
    tracing::info!("Starting bucket recovery with config: {:?}", cfg);

    // --- Initialize client and run ---
    let client = StorageClient::new(&cfg.endpoint, cfg.client_options())?;
    let tokens = EnvOrFileTokenSource::new(&cfg.token_file);
    let service = RecoveryService::new(client, cfg.recovery_options());
    let report = service.run(&tokens).await;

    println!("{}", report);

    if let Some(path) = &cfg.report_path {
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(path, json)
            .with_context(|| format!("writing report to {}", path.display()))?;
        tracing::info!("Report written to {}", path.display());
    }

    Ok(ExitCode::from(report.exit_code() as u8))
}
