//! Environment-driven configuration.
//!
//! Kept small and explicit:
//! - RPC endpoint + program id
//! - listen ports (HTTP, DHT, LAN beacon)
//! - data directory for wallet / deposit book / tree cache
//! - relayer delay window and mixing-loop wait windows

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use solana_sdk::pubkey::Pubkey;

use crate::constants::*;

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u16(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Solana HTTP RPC endpoint.
    pub rpc_url: String,
    /// Shielded-pool program id.
    pub program_id: Pubkey,
    /// HTTP port for the tree-sharing + relayer surface.
    pub http_port: u16,
    /// TCP port for the DHT server.
    pub dht_port: u16,
    /// UDP port for LAN announce datagrams.
    pub beacon_port: u16,
    /// Directory holding wallet, deposit book, known peers and tree cache.
    /// Defaults to `<home>/.cipher-agent`.
    pub data_dir: PathBuf,
    /// Optional explicit wallet path (bypasses `<data_dir>/agent-wallet.json`).
    pub wallet_path: Option<PathBuf>,
    /// Optional seed peer `host:port` for DHT bootstrap.
    pub bootstrap_peer: Option<String>,
    /// Publicly reachable host to advertise in DHT announces, if known.
    pub public_host: Option<String>,
    /// Production mode rejects private-range peer addresses.
    pub production: bool,
    /// Fixed denomination for pool deposits, base units.
    pub denomination: u64,
    /// Relayer delay window, milliseconds.
    pub relay_min_delay_ms: u64,
    pub relay_max_delay_ms: u64,
    /// Mixing-loop wait windows, milliseconds.
    pub withdraw_wait_min_ms: u64,
    pub withdraw_wait_max_ms: u64,
    pub deposit_wait_min_ms: u64,
    pub deposit_wait_max_ms: u64,
    /// Optional wall-clock deadline for the auto-mix loop, seconds from start.
    pub mix_deadline_secs: Option<u64>,
    /// Allow deposit codes and secrets in logs. Off unless explicitly enabled.
    pub debug_secrets: bool,
}

pub fn load_config() -> anyhow::Result<Config> {
    let rpc_url =
        env::var("RPC_URL").unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".to_string());
    let program_id_str = env::var("PROGRAM_ID")
        .unwrap_or_else(|_| "M1xEr7qZP4bQvC5jjWQ97kXDPRaQsMRxjc5y3zKjnbS".to_string());
    let program_id = Pubkey::from_str(program_id_str.trim())
        .with_context(|| format!("invalid PROGRAM_ID: {program_id_str}"))?;

    let data_dir = match env::var("CIPHER_AGENT_DIR") {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => dirs::home_dir()
            .context("cannot determine home directory (set CIPHER_AGENT_DIR)")?
            .join(".cipher-agent"),
    };

    let wallet_path = env::var("CIPHER_AGENT_WALLET")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from);

    let bootstrap_peer = env::var("CIPHER_AGENT_BOOTSTRAP")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let public_host = env::var("CIPHER_AGENT_PUBLIC_HOST")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let relay_min_delay_ms = env_u64("RELAY_MIN_DELAY_MS", DEFAULT_RELAY_MIN_DELAY_MS);
    let relay_max_delay_ms = env_u64("RELAY_MAX_DELAY_MS", DEFAULT_RELAY_MAX_DELAY_MS);
    anyhow::ensure!(
        relay_min_delay_ms <= relay_max_delay_ms,
        "RELAY_MIN_DELAY_MS must be <= RELAY_MAX_DELAY_MS"
    );

    Ok(Config {
        rpc_url,
        program_id,
        http_port: env_u16("CIPHER_AGENT_HTTP_PORT", DEFAULT_HTTP_PORT),
        dht_port: env_u16("CIPHER_AGENT_DHT_PORT", DEFAULT_DHT_PORT),
        beacon_port: env_u16("CIPHER_AGENT_BEACON_PORT", DEFAULT_BEACON_PORT),
        data_dir,
        wallet_path,
        bootstrap_peer,
        public_host,
        production: env_bool("CIPHER_AGENT_PRODUCTION", false),
        denomination: env_u64("CIPHER_AGENT_DENOMINATION", 1_000_000),
        relay_min_delay_ms,
        relay_max_delay_ms,
        withdraw_wait_min_ms: env_u64("WITHDRAW_WAIT_MIN_MS", DEFAULT_WITHDRAW_WAIT_MIN_MS),
        withdraw_wait_max_ms: env_u64("WITHDRAW_WAIT_MAX_MS", DEFAULT_WITHDRAW_WAIT_MAX_MS),
        deposit_wait_min_ms: env_u64("DEPOSIT_WAIT_MIN_MS", DEFAULT_DEPOSIT_WAIT_MIN_MS),
        deposit_wait_max_ms: env_u64("DEPOSIT_WAIT_MAX_MS", DEFAULT_DEPOSIT_WAIT_MAX_MS),
        mix_deadline_secs: env::var("MIX_DEADLINE_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok()),
        debug_secrets: env_bool("CIPHER_AGENT_DEBUG_SECRETS", false),
    })
}

impl Config {
    /// Minimal config for tests: everything local, ephemeral ports, tempdir data.
    pub fn for_tests(data_dir: PathBuf) -> Self {
        Config {
            rpc_url: "http://127.0.0.1:8899".to_string(),
            program_id: Pubkey::new_unique(),
            http_port: 0,
            dht_port: 0,
            beacon_port: 0,
            data_dir,
            wallet_path: None,
            bootstrap_peer: None,
            public_host: None,
            production: false,
            denomination: 1_000_000,
            relay_min_delay_ms: 0,
            relay_max_delay_ms: 1,
            withdraw_wait_min_ms: 0,
            withdraw_wait_max_ms: 1,
            deposit_wait_min_ms: 0,
            deposit_wait_max_ms: 1,
            mix_deadline_secs: None,
            debug_secrets: false,
        }
    }
}
