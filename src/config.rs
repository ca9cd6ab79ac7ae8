//! Layered configuration: built-in defaults, an optional JSON file, environment
//! overrides, then command-line flags.

use crate::{
    DEFAULT_CONTRACT_ADDRESS,
    DEFAULT_POLL_INTERVAL,
    DEFAULT_PUBLIC_RPC_URLS,
    DEFAULT_SETTLE_DELAY,
};
use ethers::types::Address;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
    time::Duration,
};
use thiserror::Error;

pub const ENV_RPC_URLS: &str = "BTCR_RPC_URLS";
pub const ENV_CONTRACT_ADDRESS: &str = "BTCR_CONTRACT_ADDRESS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("environment variable {0} referenced by the config is not set")]
    MissingEnv(String),
    #[error("invalid contract address {0}")]
    InvalidAddress(String),
    #[error("no rpc endpoints configured")]
    NoEndpoints,
}

/// Shape of the optional JSON config file. Every field is optional.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub rpc_urls: Option<Vec<String>>,
    pub contract_address: Option<String>,
    pub poll_interval_secs: Option<u64>,
    pub settle_delay_secs: Option<u64>,
    pub log_dir: Option<String>,
    pub wallet: Option<FileWalletConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileWalletConfig {
    pub dir: Option<String>,
    pub names: Option<Vec<String>>,
    pub rpc_url: Option<String>,
}

/// Flags given on the command line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub rpc_urls: Vec<String>,
    pub contract_address: Option<String>,
    pub wallet_names: Vec<String>,
    pub wallet_dir: Option<String>,
    pub wallet_rpc_url: Option<String>,
    pub no_wallet: bool,
    pub log_dir: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalletConfig {
    pub dir: Option<PathBuf>,
    /// Keystores to unlock. Empty means every keystore in `dir`.
    pub names: Vec<String>,
    pub rpc_url: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    pub rpc_urls: Vec<String>,
    pub contract_address: Address,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub log_dir: PathBuf,
    pub wallet: Option<WalletConfig>,
}

impl AppConfig {
    pub fn load(cli: &CliOverrides) -> Result<Self, ConfigError> {
        let file = match &cli.config_path {
            Some(path) => read_file_config(path)?,
            None => FileConfig::default(),
        };
        Self::from_layers(file, |name| std::env::var(name).ok(), cli)
    }

    /// Merges the layers. `env` is injected so callers can control lookups.
    pub fn from_layers(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
        cli: &CliOverrides,
    ) -> Result<Self, ConfigError> {
        let mut rpc_urls = file
            .rpc_urls
            .unwrap_or_else(|| DEFAULT_PUBLIC_RPC_URLS.iter().map(|u| u.to_string()).collect());
        let mut contract = file
            .contract_address
            .unwrap_or_else(|| DEFAULT_CONTRACT_ADDRESS.to_owned());
        let mut log_dir = file.log_dir.unwrap_or_else(|| "./logs".to_owned());

        if let Some(raw) = env(ENV_RPC_URLS) {
            let urls = split_list(&raw);
            if !urls.is_empty() {
                rpc_urls = urls;
            }
        }
        if let Some(raw) = env(ENV_CONTRACT_ADDRESS) {
            contract = raw;
        }

        if !cli.rpc_urls.is_empty() {
            rpc_urls = cli.rpc_urls.clone();
        }
        if let Some(address) = &cli.contract_address {
            contract = address.clone();
        }
        if let Some(dir) = &cli.log_dir {
            log_dir = dir.clone();
        }

        let rpc_urls = rpc_urls
            .iter()
            .map(|url| resolve_env_ref(url, &env))
            .collect::<Result<Vec<_>, _>>()?;
        if rpc_urls.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        let contract = resolve_env_ref(&contract, &env)?;
        let contract_address = contract
            .trim()
            .parse::<Address>()
            .map_err(|_| ConfigError::InvalidAddress(contract.clone()))?;

        let wallet = if cli.no_wallet {
            None
        } else {
            let file_wallet = file.wallet.unwrap_or_default();
            let dir = cli.wallet_dir.clone().or(file_wallet.dir).map(expand_path);
            let names = if cli.wallet_names.is_empty() {
                file_wallet.names.unwrap_or_default()
            } else {
                cli.wallet_names.clone()
            };
            let rpc_url = match cli.wallet_rpc_url.clone().or(file_wallet.rpc_url) {
                Some(url) => resolve_env_ref(&url, &env)?,
                None => rpc_urls[0].clone(),
            };
            Some(WalletConfig {
                dir,
                names,
                rpc_url,
            })
        };

        Ok(Self {
            rpc_urls,
            contract_address,
            poll_interval: file
                .poll_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            settle_delay: file
                .settle_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_SETTLE_DELAY),
            log_dir: expand_path(log_dir),
            wallet,
        })
    }
}

pub fn read_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let expanded = expand_path(path.to_string_lossy().into_owned());
    let raw = fs::read_to_string(&expanded).map_err(|source| ConfigError::Read {
        path: expanded.clone(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: expanded,
        source,
    })
}

/// `env:NAME` reads the value from the environment; anything else is literal.
pub fn resolve_env_ref(
    value: &str,
    env: impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    match value.strip_prefix("env:") {
        Some(name) => env(name).ok_or_else(|| ConfigError::MissingEnv(name.to_owned())),
        None => Ok(value.to_owned()),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

fn expand_path(raw: String) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&raw).into_owned())
}
