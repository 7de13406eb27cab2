//! Indexer configuration (TOML file, overlaid by CLI flags)

use anyhow::{Context, Result};
use blockpipe_client::CallerConfig;
use blockpipe_core::PerformanceRecorder;
use blockpipe_export::{ExportConfig, TableSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

fn default_rpc_url() -> String {
    "http://localhost:8545".to_string()
}

fn default_metrics_addr() -> Option<SocketAddr> {
    Some(SocketAddr::from(([0, 0, 0, 0], 9100)))
}

fn default_max_connections() -> u32 {
    10
}

fn default_blocks_per_range() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_tables() -> BTreeMap<String, TableSpec> {
    let mut tables = BTreeMap::new();
    tables.insert(
        "blocks".to_string(),
        TableSpec::new(
            "blocks",
            &["number"],
            &[
                "hash",
                "parent_hash",
                "timestamp",
                "miner",
                "gas_used",
                "gas_limit",
                "base_fee_per_gas",
                "transaction_count",
            ],
        ),
    );
    tables.insert(
        "transactions".to_string(),
        TableSpec::new(
            "transactions",
            &["block_number", "transaction_index"],
            &["hash", "from_address", "to_address", "value", "gas", "gas_price", "nonce", "input"],
        ),
    );
    tables
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// JSON-RPC endpoint of the node
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// Postgres URL. Without one, records go to an in-memory store (dry run).
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Address of the `/metrics` endpoint; `None` disables it
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: Option<SocketAddr>,

    /// Blocks fetched per scan range; each range ends with an explicit flush
    #[serde(default = "default_blocks_per_range")]
    pub blocks_per_range: u64,

    /// Fetch full transaction objects with each block
    #[serde(default = "default_true")]
    pub include_transactions: bool,

    #[serde(default)]
    pub caller: CallerConfig,

    #[serde(default)]
    pub export: ExportConfig,

    /// Record kind -> table mapping
    #[serde(default = "default_tables")]
    pub tables: BTreeMap<String, TableSpec>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            database_url: None,
            max_connections: default_max_connections(),
            metrics_addr: default_metrics_addr(),
            blocks_per_range: default_blocks_per_range(),
            include_transactions: true,
            caller: CallerConfig::default(),
            export: ExportConfig::default(),
            tables: default_tables(),
        }
    }
}

impl IndexerConfig {
    /// Load from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str(&contents)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Self::default(),
        };
        Ok(config)
    }

    /// Shared call/flush recorder, sized by `[caller] recorder_capacity`.
    pub fn recorder(&self) -> Arc<PerformanceRecorder> {
        Arc::new(self.caller.recorder())
    }

    pub fn validate(&self) -> Result<()> {
        self.caller.validate().context("invalid [caller] section")?;
        self.export.validate().context("invalid [export] section")?;
        if self.blocks_per_range == 0 {
            anyhow::bail!("blocks_per_range must be at least 1");
        }
        for (kind, spec) in &self.tables {
            if spec.key_columns.is_empty() {
                anyhow::bail!("table mapping for {} has no key columns", kind);
            }
        }
        Ok(())
    }
}
