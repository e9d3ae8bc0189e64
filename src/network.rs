use std::fs;
use std::path::Path;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;

use crate::datadir::{CONFIG_FILE, GENESIS_FILE};
use crate::error::{Result, SupervisorError};

#[derive(Debug, Deserialize)]
struct NodeConfig {
    #[serde(default)]
    p2p: P2pSection,
}

#[derive(Debug, Default, Deserialize)]
struct P2pSection {
    #[serde(default)]
    seeds: String,
}

pub fn read_chain_id(root: &Path) -> Result<String> {
    let text =
        fs::read_to_string(root.join(GENESIS_FILE)).map_err(SupervisorError::GenesisUnreadable)?;
    let genesis: Value =
        serde_json::from_str(&text).map_err(|err| SupervisorError::GenesisInvalid(err.to_string()))?;
    genesis
        .get("chain_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SupervisorError::GenesisInvalid("missing chain_id".into()))
}

pub fn read_seeds(root: &Path) -> Result<Vec<String>> {
    let text =
        fs::read_to_string(root.join(CONFIG_FILE)).map_err(SupervisorError::ConfigUnreadable)?;
    let config: NodeConfig =
        toml::from_str(&text).map_err(|err| SupervisorError::ConfigInvalid(err.to_string()))?;
    Ok(config
        .p2p
        .seeds
        .split(',')
        .map(str::trim)
        .filter(|seed| !seed.is_empty())
        .map(str::to_string)
        .collect())
}

/// Picks a random seed and points it at the RPC port instead of the p2p one.
pub fn pick_peer<R: Rng + ?Sized>(root: &Path, rpc_port: u16, rng: &mut R) -> Result<String> {
    let seeds = read_seeds(root)?;
    let seed = seeds.choose(rng).ok_or(SupervisorError::NoSeeds)?;
    let host = seed.split(':').next().unwrap_or(seed);
    Ok(format!("{host}:{rpc_port}"))
}
