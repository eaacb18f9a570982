use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{BlockNumber, ChainId, RelayerId};
use crate::Error;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Evm,
    Substrate,
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainKind::Evm => f.write_str("evm"),
            ChainKind::Substrate => f.write_str("substrate"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChainConfig {
    pub id: ChainId,
    pub name: String,
    pub kind: ChainKind,
    pub endpoint: String,
    /// 本中继者在该链上的签名身份（十六进制）
    pub from: String,
    pub bridge_address: String,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    /// 费用下限，也是首次提交使用的价格
    #[serde(default = "default_gas_price")]
    pub gas_price: u128,
    /// 费用上限，加价不会超过这个值
    #[serde(default = "default_max_gas_price")]
    pub max_gas_price: u128,
    #[serde(default = "default_block_confirmations")]
    pub block_confirmations: u64,
    #[serde(default = "default_threshold")]
    pub threshold: usize,
    #[serde(default = "default_proposal_expiry")]
    pub proposal_expiry: BlockNumber,
    #[serde(default)]
    pub start_block: BlockNumber,
    #[serde(default)]
    pub proposal_store: Option<PathBuf>,
}

impl ChainConfig {
    pub fn relayer_id(&self) -> Result<RelayerId, Error> {
        RelayerId::from_hex(&self.from)
            .map_err(|e| Error::Config(format!("Invalid signing identity for chain {}: {}", self.id, e)))
    }
}

fn default_gas_limit() -> u64 {
    6_721_975
}

fn default_gas_price() -> u128 {
    20_000_000_000
}

fn default_max_gas_price() -> u128 {
    200_000_000_000
}

fn default_block_confirmations() -> u64 {
    10
}

fn default_threshold() -> usize {
    1
}

fn default_proposal_expiry() -> BlockNumber {
    100
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelayerConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// 遇到 underpriced 时单次加价的百分比
    #[serde(default = "default_gas_bump_percent")]
    pub gas_bump_percent: u32,
    #[serde(default = "default_inclusion_timeout_secs")]
    pub inclusion_timeout_secs: u64,
    /// 监听器向路由转发失败时的重试次数，超过后视为致命错误
    #[serde(default = "default_forward_retries")]
    pub forward_retries: u32,
    #[serde(default = "default_forward_backoff_ms")]
    pub forward_backoff_ms: u64,
    #[serde(default = "default_route_timeout_ms")]
    pub route_timeout_ms: u64,
    #[serde(default = "default_writer_queue_size")]
    pub writer_queue_size: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            gas_bump_percent: default_gas_bump_percent(),
            inclusion_timeout_secs: default_inclusion_timeout_secs(),
            forward_retries: default_forward_retries(),
            forward_backoff_ms: default_forward_backoff_ms(),
            route_timeout_ms: default_route_timeout_ms(),
            writer_queue_size: default_writer_queue_size(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl RelayerConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn inclusion_timeout(&self) -> Duration {
        Duration::from_secs(self.inclusion_timeout_secs)
    }

    pub fn forward_backoff(&self) -> Duration {
        Duration::from_millis(self.forward_backoff_ms)
    }

    pub fn route_timeout(&self) -> Duration {
        Duration::from_millis(self.route_timeout_ms)
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    2_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_gas_bump_percent() -> u32 {
    20
}

fn default_inclusion_timeout_secs() -> u64 {
    120
}

fn default_forward_retries() -> u32 {
    5
}

fn default_forward_backoff_ms() -> u64 {
    500
}

fn default_route_timeout_ms() -> u64 {
    5_000
}

fn default_writer_queue_size() -> usize {
    256
}

fn default_max_in_flight() -> usize {
    16
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub relayer: RelayerConfig,
}

impl Config {
    /// 按扩展名选择格式：`.toml` 使用 TOML，其余按 JSON 解析
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self, Error> {
        let path = config_path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&config_str)?,
            _ => Self::from_json(&config_str)?,
        };

        config.validate()?;

        Ok(config)
    }

    pub fn from_json(s: &str) -> Result<Self, Error> {
        serde_json::from_str(s).map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn from_toml(s: &str) -> Result<Self, Error> {
        toml::from_str(s).map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.chains.len() < 2 {
            return Err(Error::Config("At least two chains must be configured".to_string()));
        }

        let mut seen = HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.id) {
                return Err(Error::Config(format!("Duplicate chain id: {}", chain.id)));
            }
            if chain.endpoint.is_empty() {
                return Err(Error::Config(format!("Chain {} has no endpoint", chain.id)));
            }
            if chain.bridge_address.is_empty() {
                return Err(Error::Config(format!("Chain {} has no bridge address", chain.id)));
            }
            if chain.relayer_id()?.is_empty() {
                return Err(Error::Config(format!("Chain {} has an empty signing identity", chain.id)));
            }
            if chain.threshold == 0 {
                return Err(Error::Config(format!("Chain {} threshold must be greater than 0", chain.id)));
            }
            if chain.proposal_expiry == 0 {
                return Err(Error::Config(format!(
                    "Chain {} proposal expiry must be greater than 0",
                    chain.id
                )));
            }
            if chain.gas_price > chain.max_gas_price {
                return Err(Error::Config(format!(
                    "Chain {} gas price {} exceeds max gas price {}",
                    chain.id, chain.gas_price, chain.max_gas_price
                )));
            }
        }

        if self.relayer.max_retries == 0 {
            return Err(Error::Config("Relayer max retries must be greater than 0".to_string()));
        }
        if self.relayer.forward_retries == 0 {
            return Err(Error::Config("Relayer forward retries must be greater than 0".to_string()));
        }
        if self.relayer.writer_queue_size == 0 || self.relayer.max_in_flight == 0 {
            return Err(Error::Config("Writer queue size and max in-flight must be greater than 0".to_string()));
        }
        if self.relayer.initial_backoff_ms > self.relayer.max_backoff_ms {
            return Err(Error::Config("Initial backoff must not exceed max backoff".to_string()));
        }

        Ok(())
    }

    pub fn get_chain_config(&self, chain_id: ChainId) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.id == chain_id)
    }
}
