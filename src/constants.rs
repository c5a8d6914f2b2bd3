// Centralized constants (kept out of `main.rs`).

// ---------------------------------------------------------------------
// Network identity
// ---------------------------------------------------------------------
/// Well-known rendezvous key. The announce key and the lookup target
/// `SHA-256(NETWORK_ID)` both derive from this value; it must match across
/// every agent on the network.
pub const NETWORK_ID: &str = "cipher-agent-mainnet-v1";

// ---------------------------------------------------------------------
// Merkle tree shape (must match the on-chain program and the circuit)
// ---------------------------------------------------------------------
pub const TREE_HEIGHT: usize = 20;
pub const TREE_CAPACITY: usize = 1 << TREE_HEIGHT;

// ---------------------------------------------------------------------
// Kademlia parameters
// ---------------------------------------------------------------------
pub const BUCKET_SIZE: usize = 20; // K
pub const LOOKUP_ALPHA: usize = 3;
pub const LOOKUP_MAX_ROUNDS: usize = 10;
pub const RPC_TIMEOUT_MS: u64 = 5_000;
pub const IDLE_CONN_TIMEOUT_MS: u64 = 60_000;
pub const MAX_TRANSPORT_CONNS: usize = 100;
/// Frames larger than this are treated as malformed and dropped.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

// ---------------------------------------------------------------------
// Default ports
// ---------------------------------------------------------------------
pub const DEFAULT_HTTP_PORT: u16 = 8547;
pub const DEFAULT_BEACON_PORT: u16 = 8548;
pub const DEFAULT_DHT_PORT: u16 = 8549;

// ---------------------------------------------------------------------
// Peer hygiene
// ---------------------------------------------------------------------
pub const MAX_PEERS_PER_SUBNET: usize = 5; // per IPv4 /24
pub const PEER_STALE_MS: u128 = 120_000;
pub const BEACON_INTERVAL_SECS: u64 = 30;
pub const PEER_CLEANUP_INTERVAL_SECS: u64 = 60;
pub const REANNOUNCE_INTERVAL_SECS: u64 = 300;

// ---------------------------------------------------------------------
// Relayer service limits
// ---------------------------------------------------------------------
pub const MAX_SUBMIT_BODY_BYTES: usize = 1024 * 1024;
pub const RATE_LIMIT_REQUESTS: usize = 10;
pub const RATE_LIMIT_WINDOW_MS: u128 = 60_000;
pub const RATE_LIMIT_MAX_IPS: usize = 1_000;
pub const MAX_WITHDRAW_AMOUNT: u64 = 1_000_000_000_000; // 10^12 base units
pub const MAX_CHUNK_ID: u32 = 1_000;
pub const RELAYER_RETRY_MS: u128 = 60_000;

// ---------------------------------------------------------------------
// Outbound deadlines
// ---------------------------------------------------------------------
pub const RELAYER_STATUS_PROBE_MS: u64 = 2_000;
pub const RELAYER_SUBMIT_TIMEOUT_MS: u64 = 30_000;
pub const CHAIN_CALL_TIMEOUT_MS: u64 = 15_000;

// ---------------------------------------------------------------------
// Mixing-loop defaults (milliseconds)
// ---------------------------------------------------------------------
pub const DEFAULT_RELAY_MIN_DELAY_MS: u64 = 30_000;
pub const DEFAULT_RELAY_MAX_DELAY_MS: u64 = 300_000;
pub const DEFAULT_WITHDRAW_WAIT_MIN_MS: u64 = 60_000;
pub const DEFAULT_WITHDRAW_WAIT_MAX_MS: u64 = 600_000;
pub const DEFAULT_DEPOSIT_WAIT_MIN_MS: u64 = 60_000;
pub const DEFAULT_DEPOSIT_WAIT_MAX_MS: u64 = 600_000;
pub const MIX_COOLDOWN_SECS: u64 = 60;

// ---------------------------------------------------------------------
// Validation limits (spam protection)
// ---------------------------------------------------------------------
pub const MIN_PUBKEY_B58_LEN: usize = 32;
pub const MAX_PUBKEY_B58_LEN: usize = 44; // base58 pubkeys are 32-44 chars
