use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use skyproof::anchor::solana::{SolanaBackend, SolanaConfig};
use skyproof::anchor::stub::StubBackend;
use skyproof::anchor::{AnchorBackend, PaymentLedger};
use skyproof::config::{AppConfig, BackendKind};
use skyproof::gateway::VerificationGateway;
use skyproof::server::{self, AppState};
use skyproof::keeper;
use skyproof::store::Database;

#[derive(Parser)]
#[command(name = "skyproof")]
#[command(about = "Evidence anchoring service for counter-drone platforms")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API server
    Serve {
        /// Also run the anchoring keeper in-process
        #[arg(long)]
        with_keeper: bool,
    },
    /// Run the anchoring keeper (dispatcher + workers)
    Keeper,
    /// Submit evidence to a running API for anchoring
    Submit {
        /// Precomputed sha-256 digest (64 hex chars)
        #[arg(long, conflicts_with = "payload")]
        digest: Option<String>,
        /// Inline JSON payload, or @path/to/file.json; hashed canonically
        #[arg(long)]
        payload: Option<String>,
        /// API base URL
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        api_url: String,
    },
    /// Fetch and print the status of an evidence job
    Status {
        id: String,
        /// API base URL
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        api_url: String,
    },
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "skyproof=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build the backend pair (anchoring + payment ledger) the config asks for.
fn build_backend(config: &AppConfig) -> (Arc<dyn AnchorBackend>, Arc<dyn PaymentLedger>) {
    match config.backend.kind {
        BackendKind::Stub => {
            tracing::info!("using stub anchoring backend");
            let stub = Arc::new(StubBackend::new(0, config.payment.wallet_address.clone()));
            (stub.clone(), stub)
        }
        BackendKind::Solana => {
            tracing::info!(
                rpc_url = %config.backend.rpc_url,
                network = %config.backend.network,
                "using solana anchoring backend"
            );
            let solana = Arc::new(SolanaBackend::new(SolanaConfig {
                rpc_url: config.backend.rpc_url.clone(),
                network: config.backend.network.clone(),
                payment_wallet: if config.payment.wallet_address.is_empty() {
                    None
                } else {
                    Some(config.payment.wallet_address.clone())
                },
            }));
            (solana.clone(), solana)
        }
    }
}

async fn open_database(config: &AppConfig) -> anyhow::Result<Database> {
    let db = Database::connect(&config.database_url)
        .await
        .with_context(|| format!("cannot open database at {}", config.database_url))?;
    db.migrate().await.context("database migration failed")?;
    Ok(db)
}

/// Resolve a submit payload argument: inline JSON or `@/path/to/file.json`.
fn resolve_payload(payload_arg: &str) -> anyhow::Result<serde_json::Value> {
    if let Some(path) = payload_arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read payload file {path}"))?;
        serde_json::from_str(&content).with_context(|| format!("invalid JSON in {path}"))
    } else {
        serde_json::from_str(payload_arg).context("invalid inline JSON payload")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Commands::Serve { with_keeper } => {
            let config = AppConfig::from_env()?;
            let db = open_database(&config).await?;
            let (backend, ledger) = build_backend(&config);

            let gateway = if config.payment.enabled {
                Some(Arc::new(VerificationGateway::new(
                    db.clone(),
                    ledger,
                    config.payment.clone(),
                )))
            } else {
                tracing::info!("payment subsystem disabled");
                None
            };

            if with_keeper {
                let keeper_db = db.clone();
                let keeper_config = config.keeper.clone();
                tokio::spawn(async move {
                    keeper::run(keeper_db, backend, keeper_config).await;
                });
            }

            server::serve(AppState { db, gateway }, &config.bind_addr).await?;
        }
        Commands::Keeper => {
            let config = AppConfig::from_env()?;
            let db = open_database(&config).await?;
            let (backend, _) = build_backend(&config);

            tokio::select! {
                _ = keeper::run(db, backend, config.keeper.clone()) => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown signal received");
                }
            }
        }
        Commands::Submit {
            digest,
            payload,
            api_url,
        } => {
            let digest_hex = match (digest, payload) {
                (Some(digest), _) => digest,
                (None, Some(payload_arg)) => {
                    let payload = resolve_payload(&payload_arg)?;
                    let canonical = serde_json::to_string(&payload)?;
                    hex::encode(Sha256::digest(canonical.as_bytes()))
                }
                (None, None) => anyhow::bail!("provide --digest or --payload"),
            };

            let response = reqwest::Client::new()
                .post(format!("{api_url}/evidence"))
                .json(&serde_json::json!({ "digest_hex": digest_hex }))
                .send()
                .await
                .context("evidence submission failed")?;

            let status = response.status();
            let body: serde_json::Value = response.json().await?;
            if !status.is_success() {
                anyhow::bail!("submission rejected ({status}): {body}");
            }
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Commands::Status { id, api_url } => {
            let response = reqwest::Client::new()
                .get(format!("{api_url}/evidence/{id}"))
                .send()
                .await
                .context("status request failed")?;

            let status = response.status();
            let body: serde_json::Value = response.json().await?;
            if !status.is_success() {
                anyhow::bail!("status request rejected ({status}): {body}");
            }
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }

    Ok(())
}
