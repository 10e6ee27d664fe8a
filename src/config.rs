//! Configuration file support for the membership sync node.
//!
//! This module provides configuration file loading from TOML format,
//! allowing for easier deployment and configuration management.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::merkle::DEFAULT_TREE_DEPTH;
use crate::root_tracker::{ACCEPTABLE_ROOT_WINDOW_SIZE, HISTORY_BUFFER_SIZE};

const DEFAULT_ETH_CLIENT_ADDRESS: &str = "http://localhost:8545";
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_MAX_BLOCK_RANGE: u64 = 5_000;

/// Configuration for the membership sync node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub keystore: KeystoreConfig,
    #[serde(default)]
    pub tree: TreeConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub roots: RootsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_eth_client_address")]
    pub eth_client_address: String,
    /// Registry contract; required to start syncing.
    #[serde(default)]
    pub membership_contract_address: Option<String>,
    /// First block to scan when no progress was persisted.
    #[serde(default)]
    pub start_block: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
}

/// Empty path or password fall back to the keystore defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeystoreConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub keystore_index: usize,
    #[serde(default)]
    pub membership_group_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    #[serde(default = "default_tree_depth")]
    pub depth: usize,
    #[serde(default = "default_tree_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_metadata_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootsConfig {
    #[serde(default = "default_acceptable_root_window_size")]
    pub acceptable_root_window_size: usize,
    #[serde(default = "default_history_buffer_size")]
    pub history_buffer_size: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            eth_client_address: default_eth_client_address(),
            membership_contract_address: None,
            start_block: 0,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_block_range: DEFAULT_MAX_BLOCK_RANGE,
        }
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            depth: DEFAULT_TREE_DEPTH,
            path: default_tree_path(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            path: default_metadata_path(),
        }
    }
}

impl Default for RootsConfig {
    fn default() -> Self {
        Self {
            acceptable_root_window_size: ACCEPTABLE_ROOT_WINDOW_SIZE,
            history_buffer_size: HISTORY_BUFFER_SIZE,
        }
    }
}

fn default_eth_client_address() -> String {
    DEFAULT_ETH_CLIENT_ADDRESS.to_string()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_max_block_range() -> u64 {
    DEFAULT_MAX_BLOCK_RANGE
}

fn default_tree_depth() -> usize {
    DEFAULT_TREE_DEPTH
}

fn default_tree_path() -> PathBuf {
    PathBuf::from("rln_tree.json")
}

fn default_metadata_path() -> PathBuf {
    PathBuf::from("rln_metadata.bin")
}

fn default_acceptable_root_window_size() -> usize {
    ACCEPTABLE_ROOT_WINDOW_SIZE
}

fn default_history_buffer_size() -> usize {
    HISTORY_BUFFER_SIZE
}

impl Config {
    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn save_to_file(&self, path: &PathBuf) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }
}
