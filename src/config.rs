use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use cosmrs::AccountId;

use crate::chain::ton::TonCenterConfig;
use crate::chain::QueryTag;
use crate::confirmation::ConfirmationConfig;
use crate::proof::CommitmentNamespaces;
use crate::watchers::{OrchestratorConfig, PollerConfig};
use crate::writers::{PipelineConfig, RetryPolicy};

/// Main configuration for the relayer
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub cosmos: CosmosConfig,
    pub sync: SyncConfig,
    pub ton: TonConfig,
    pub relayer: RelayerConfig,
}

/// Database configuration
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// Source chain (CosmWasm) configuration
#[derive(Debug, Clone)]
pub struct CosmosConfig {
    pub rpc_url: String,
    /// Bech32 address of the CosmWasm bridge contract
    pub bridge_address: String,
    pub packet_namespace: String,
    pub ack_namespace: String,
}

/// Block sync settings
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Offset floor
    pub start_height: u64,
    pub limit: u64,
    pub threads: usize,
    pub interval_ms: u64,
    pub query_tags: Vec<QueryTag>,
}

/// Destination chain (TON) configuration
#[derive(Clone)]
pub struct TonConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub index_url: Option<String>,
    pub wallet_address: String,
    pub bridge_address: String,
    pub light_client_master: String,
    /// Remote signer holding the wallet key
    pub signer_url: String,
    pub recv_packet_value_nano: u64,
    pub update_client_value_nano: u64,
    pub min_wallet_balance_nano: u128,
}

/// Custom Debug that redacts the API key to prevent accidental log leakage.
impl fmt::Debug for TonConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TonConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("index_url", &self.index_url)
            .field("wallet_address", &self.wallet_address)
            .field("bridge_address", &self.bridge_address)
            .field("light_client_master", &self.light_client_master)
            .field("signer_url", &self.signer_url)
            .field("recv_packet_value_nano", &self.recv_packet_value_nano)
            .field("update_client_value_nano", &self.update_client_value_nano)
            .field("min_wallet_balance_nano", &self.min_wallet_balance_nano)
            .finish()
    }
}

/// Relayer behavior
#[derive(Debug, Clone)]
pub struct RelayerConfig {
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub worker_concurrency: usize,
    pub confirm_poll_interval_ms: u64,
    pub confirm_timeout_ms: u64,
    pub max_offset_save_failures: u32,
    pub api_port: u16,
}

fn default_packet_namespace() -> String {
    "send_packet_commitment".to_string()
}

fn default_ack_namespace() -> String {
    "ack_commitment".to_string()
}

fn default_sync_limit() -> u64 {
    100
}

fn default_sync_threads() -> usize {
    4
}

fn default_sync_interval() -> u64 {
    5000
}

fn default_recv_packet_value() -> u64 {
    700_000_000 // 0.7 TON
}

fn default_update_client_value() -> u64 {
    1_000_000_000 // 1 TON
}

fn default_min_wallet_balance() -> u128 {
    2_000_000_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2000
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_confirm_poll_interval() -> u64 {
    1500
}

fn default_confirm_timeout() -> u64 {
    90_000
}

fn default_max_offset_save_failures() -> u32 {
    5
}

fn default_api_port() -> u16 {
    9090
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{} environment variable is required", name))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match optional(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| eyre!("{} has invalid value {:?}: {}", name, raw, e)),
        None => Ok(default),
    }
}

/// Parse `SYNC_QUERY_TAGS`: comma-separated `key=value` pairs
pub fn parse_query_tags(raw: &str) -> Result<Vec<QueryTag>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| QueryTag::parse(s).ok_or_else(|| eyre!("invalid query tag {:?}", s)))
        .collect()
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: required("DATABASE_URL")?,
        };

        let cosmos = CosmosConfig {
            rpc_url: required("COSMOS_RPC_URL")?,
            bridge_address: required("WASM_BRIDGE")?,
            packet_namespace: optional("PACKET_COMMITMENT_NAMESPACE")
                .unwrap_or_else(default_packet_namespace),
            ack_namespace: optional("ACK_COMMITMENT_NAMESPACE")
                .unwrap_or_else(default_ack_namespace),
        };

        let sync = SyncConfig {
            start_height: parse_or("SYNC_BLOCK_OFFSET", 0)?,
            limit: parse_or("SYNC_LIMIT", default_sync_limit())?,
            threads: parse_or("SYNC_THREADS", default_sync_threads())?,
            interval_ms: parse_or("SYNC_INTERVAL", default_sync_interval())?,
            query_tags: match optional("SYNC_QUERY_TAGS") {
                Some(raw) => parse_query_tags(&raw).wrap_err("SYNC_QUERY_TAGS is invalid")?,
                None => Vec::new(),
            },
        };

        let ton = TonConfig {
            api_url: required("TON_CENTER")?,
            api_key: optional("TON_API_KEY"),
            index_url: optional("TON_INDEX_URL"),
            wallet_address: required("TON_WALLET_ADDRESS")?,
            bridge_address: required("TON_BRIDGE")?,
            light_client_master: required("COSMOS_LIGHT_CLIENT_MASTER")?,
            signer_url: required("TON_SIGNER_URL")?,
            recv_packet_value_nano: parse_or("RECV_PACKET_VALUE_NANO", default_recv_packet_value())?,
            update_client_value_nano: parse_or(
                "UPDATE_CLIENT_VALUE_NANO",
                default_update_client_value(),
            )?,
            min_wallet_balance_nano: parse_or(
                "MIN_WALLET_BALANCE_NANO",
                default_min_wallet_balance(),
            )?,
        };

        let relayer = RelayerConfig {
            retry_attempts: parse_or("RETRY_ATTEMPTS", default_retry_attempts())?,
            retry_delay_ms: parse_or("RETRY_DELAY_MS", default_retry_delay())?,
            worker_concurrency: parse_or("WORKER_CONCURRENCY", default_worker_concurrency())?,
            confirm_poll_interval_ms: parse_or(
                "CONFIRM_POLL_INTERVAL_MS",
                default_confirm_poll_interval(),
            )?,
            confirm_timeout_ms: parse_or("CONFIRM_TIMEOUT_MS", default_confirm_timeout())?,
            max_offset_save_failures: parse_or(
                "MAX_OFFSET_SAVE_FAILURES",
                default_max_offset_save_failures(),
            )?,
            api_port: parse_or("API_PORT", default_api_port())?,
        };

        let config = Config {
            database,
            cosmos,
            sync,
            ton,
            relayer,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        if !self.cosmos.rpc_url.starts_with("http") {
            return Err(eyre!("cosmos.rpc_url must be an http(s) URL"));
        }

        AccountId::from_str(&self.cosmos.bridge_address)
            .map_err(|e| eyre!("cosmos.bridge_address is not a valid bech32 address: {}", e))?;

        if self.cosmos.packet_namespace.is_empty() || self.cosmos.ack_namespace.is_empty() {
            return Err(eyre!("commitment namespaces cannot be empty"));
        }
        if self.cosmos.packet_namespace.len() > u16::MAX as usize
            || self.cosmos.ack_namespace.len() > u16::MAX as usize
        {
            return Err(eyre!("commitment namespaces are too long"));
        }

        if self.sync.limit == 0 {
            return Err(eyre!("sync.limit must be greater than zero"));
        }
        if self.sync.threads == 0 {
            return Err(eyre!("sync.threads must be greater than zero"));
        }

        if !self.ton.api_url.starts_with("http") {
            return Err(eyre!("ton.api_url must be an http(s) URL"));
        }
        if !self.ton.signer_url.starts_with("http") {
            return Err(eyre!("ton.signer_url must be an http(s) URL"));
        }
        for (name, address) in [
            ("ton.wallet_address", &self.ton.wallet_address),
            ("ton.bridge_address", &self.ton.bridge_address),
            ("ton.light_client_master", &self.ton.light_client_master),
        ] {
            if address.trim().is_empty() {
                return Err(eyre!("{} cannot be empty", name));
            }
        }

        if self.relayer.retry_attempts == 0 {
            return Err(eyre!("relayer.retry_attempts must be at least 1"));
        }
        if self.relayer.worker_concurrency == 0 {
            return Err(eyre!("relayer.worker_concurrency must be at least 1"));
        }
        if self.relayer.confirm_timeout_ms < self.relayer.confirm_poll_interval_ms {
            return Err(eyre!(
                "relayer.confirm_timeout_ms cannot be shorter than the poll interval"
            ));
        }
        if self.relayer.max_offset_save_failures == 0 {
            return Err(eyre!("relayer.max_offset_save_failures must be at least 1"));
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.relayer.retry_attempts,
            Duration::from_millis(self.relayer.retry_delay_ms),
        )
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            limit: self.sync.limit,
            parallelism: self.sync.threads,
            interval: Duration::from_millis(self.sync.interval_ms),
            query_tags: self.sync.query_tags.clone(),
        }
    }

    pub fn namespaces(&self) -> CommitmentNamespaces {
        CommitmentNamespaces {
            packet: self.cosmos.packet_namespace.clone(),
            ack: self.cosmos.ack_namespace.clone(),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            workers: self.relayer.worker_concurrency,
            retry: self.retry_policy(),
            confirmation: ConfirmationConfig {
                poll_interval: Duration::from_millis(self.relayer.confirm_poll_interval_ms),
                timeout: Duration::from_millis(self.relayer.confirm_timeout_ms),
            },
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_offset_save_failures: self.relayer.max_offset_save_failures,
            retry: self.retry_policy(),
        }
    }

    pub fn ton_center_config(&self) -> TonCenterConfig {
        TonCenterConfig {
            api_url: self.ton.api_url.clone(),
            api_key: self.ton.api_key.clone(),
            index_url: self.ton.index_url.clone(),
            wallet: self.ton.wallet_address.clone(),
            bridge: self.ton.bridge_address.clone(),
            light_client_master: self.ton.light_client_master.clone(),
            recv_packet_value_nano: self.ton.recv_packet_value_nano,
            update_client_value_nano: self.ton.update_client_value_nano,
        }
    }
}
