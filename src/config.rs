/// Environment-driven configuration.
///
/// Every knob has a default that works for local development against an
/// in-process stub ledger; production deployments override via `SKYPROOF_*`,
/// `SOLANA_*` and `X402_*` variables.
use crate::error::{Result, SkyproofError};

/// Which anchoring backend the keeper talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Deterministic in-process backend, no network.
    Stub,
    /// Solana JSON-RPC backend.
    Solana,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// JSON-RPC endpoint (Solana backend only).
    pub rpc_url: String,
    /// Network label recorded on transaction references.
    pub network: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Stub,
            rpc_url: "https://api.devnet.solana.com".to_string(),
            network: "devnet".to_string(),
        }
    }
}

/// Tuning for the claim/lease dispatcher and worker pool.
#[derive(Debug, Clone)]
pub struct KeeperConfig {
    /// Dispatcher poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Jobs claimed per dispatch cycle.
    pub batch_size: i64,
    /// Concurrent worker tasks.
    pub worker_count: usize,
    /// Lease duration in milliseconds.
    pub lease_ms: i64,
    /// Submission attempts before a transient failure turns terminal.
    pub max_attempts: i64,
    /// Retry backoff base in milliseconds.
    pub backoff_base_ms: i64,
    /// Exponent cap for the backoff doubling.
    pub backoff_cap_exp: u32,
    /// Upper clamp on a single backoff delay.
    pub backoff_max_ms: i64,
    /// Jitter added to each backoff, 0..jitter_ms.
    pub backoff_jitter_ms: i64,
    /// Initial delay between finality polls.
    pub finality_poll_ms: u64,
    /// Budget for finality polling within one lease before the job is
    /// handed back for a later re-poll.
    pub finality_budget_ms: i64,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            batch_size: 8,
            worker_count: 4,
            lease_ms: 30_000,
            max_attempts: 5,
            backoff_base_ms: 5_000,
            backoff_cap_exp: 6,
            backoff_max_ms: 300_000,
            backoff_jitter_ms: 1_000,
            finality_poll_ms: 1_000,
            finality_budget_ms: 120_000,
        }
    }
}

/// Policy for the payment-gated premium verification path.
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    pub enabled: bool,
    /// Wallet that must be the payment recipient.
    pub wallet_address: String,
    /// Token symbols accepted as payment.
    pub supported_tokens: Vec<String>,
    /// Minimum payment amount (decimal string, compared numerically).
    pub min_payment: String,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            wallet_address: String::new(),
            supported_tokens: vec!["USDC".to_string(), "USDT".to_string(), "SOL".to_string()],
            min_payment: "0.001".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub bind_addr: String,
    pub backend: BackendConfig,
    pub keeper: KeeperConfig,
    pub payment: PaymentConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://skyproof.sqlite3?mode=rwc".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
            backend: BackendConfig::default(),
            keeper: KeeperConfig::default(),
            payment: PaymentConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let backend_kind = match env_or("SKYPROOF_BACKEND", "stub").to_lowercase().as_str() {
            "stub" => BackendKind::Stub,
            "solana" => BackendKind::Solana,
            other => {
                return Err(SkyproofError::Validation(format!(
                    "unknown SKYPROOF_BACKEND '{other}', expected 'stub' or 'solana'"
                )))
            }
        };

        let payment_enabled = std::env::var("X402_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let wallet_address = std::env::var("X402_WALLET_ADDRESS").unwrap_or_default();
        if payment_enabled && wallet_address.is_empty() {
            return Err(SkyproofError::Validation(
                "X402_ENABLED is set but X402_WALLET_ADDRESS is not".to_string(),
            ));
        }

        Ok(Self {
            database_url: env_or("SKYPROOF_DB_URL", &defaults.database_url),
            bind_addr: env_or("SKYPROOF_BIND_ADDR", &defaults.bind_addr),
            backend: BackendConfig {
                kind: backend_kind,
                rpc_url: env_or("SOLANA_RPC_URL", &defaults.backend.rpc_url),
                network: env_or("SOLANA_NETWORK", &defaults.backend.network),
            },
            keeper: KeeperConfig {
                poll_interval_ms: env_parse("SKYPROOF_POLL_MS", defaults.keeper.poll_interval_ms)?,
                batch_size: env_parse("SKYPROOF_CLAIM_BATCH", defaults.keeper.batch_size)?,
                worker_count: env_parse("SKYPROOF_WORKERS", defaults.keeper.worker_count)?,
                lease_ms: env_parse("SKYPROOF_LEASE_MS", defaults.keeper.lease_ms)?,
                max_attempts: env_parse("SKYPROOF_MAX_ATTEMPTS", defaults.keeper.max_attempts)?,
                backoff_base_ms: env_parse(
                    "SKYPROOF_BACKOFF_BASE_MS",
                    defaults.keeper.backoff_base_ms,
                )?,
                backoff_cap_exp: env_parse(
                    "SKYPROOF_BACKOFF_CAP_EXP",
                    defaults.keeper.backoff_cap_exp,
                )?,
                backoff_max_ms: env_parse(
                    "SKYPROOF_BACKOFF_MAX_MS",
                    defaults.keeper.backoff_max_ms,
                )?,
                backoff_jitter_ms: env_parse(
                    "SKYPROOF_BACKOFF_JITTER_MS",
                    defaults.keeper.backoff_jitter_ms,
                )?,
                finality_poll_ms: env_parse(
                    "SKYPROOF_FINALITY_POLL_MS",
                    defaults.keeper.finality_poll_ms,
                )?,
                finality_budget_ms: env_parse(
                    "SKYPROOF_FINALITY_BUDGET_MS",
                    defaults.keeper.finality_budget_ms,
                )?,
            },
            payment: PaymentConfig {
                enabled: payment_enabled,
                wallet_address,
                supported_tokens: std::env::var("X402_SUPPORTED_TOKENS")
                    .map(|v| {
                        v.split(',')
                            .map(|t| t.trim().to_string())
                            .filter(|t| !t.is_empty())
                            .collect()
                    })
                    .unwrap_or(defaults.payment.supported_tokens),
                min_payment: env_or("X402_MIN_PAYMENT", &defaults.payment.min_payment),
            },
        })
    }

    /// Payment config for local testing against the stub ledger.
    pub fn devnet_payments(wallet_address: &str) -> PaymentConfig {
        PaymentConfig {
            enabled: true,
            wallet_address: wallet_address.to_string(),
            ..PaymentConfig::default()
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| SkyproofError::Validation(format!("cannot parse {key}='{raw}'"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_stub_and_disabled_payments() {
        let config = AppConfig::default();
        assert_eq!(config.backend.kind, BackendKind::Stub);
        assert!(!config.payment.enabled);
        assert_eq!(config.keeper.max_attempts, 5);
    }

    #[test]
    fn devnet_payments_enable_with_wallet() {
        let payment = AppConfig::devnet_payments("SkyWallet123");
        assert!(payment.enabled);
        assert_eq!(payment.wallet_address, "SkyWallet123");
        assert!(payment.supported_tokens.contains(&"USDC".to_string()));
    }
}
