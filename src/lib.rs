//! Terminal client for the BTCR mining game.
//!
//! The library holds the connection lifecycle, the polled contract read model and
//! the write sequencing. The binary adds the terminal UI on top.

use std::time::Duration;

pub mod actions;
pub mod chain;
pub mod config;
pub mod connection;
pub mod contract;
pub mod error;
pub mod keystore;
pub mod resolver;
pub mod sync;
pub mod units;
pub mod wallet;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

/// Ethereum mainnet. The only network the client will sign on.
pub const TARGET_CHAIN_ID: u64 = 1;

pub const DEFAULT_CONTRACT_ADDRESS: &str = "0x40067f4a61cDb51b6965DABbD4b0fF5E7D430B71";

/// Public read endpoints, tried in order.
pub const DEFAULT_PUBLIC_RPC_URLS: [&str; 3] = [
    "https://ethereum-rpc.publicnode.com",
    "https://eth.llamarpc.com",
    "https://rpc.ankr.com/eth",
];

/// `play()` must be called with exactly 0.001 ETH.
pub const ENTRY_FEE_WEI: u64 = 1_000_000_000_000_000;

/// Entry count below which the newbie protection window still applies.
pub const NEWBEE_THRESHOLD: u64 = 30;

/// Upper bound of players per epoch as documented by the contract. Not used for
/// gating; see [`NEWBEE_THRESHOLD`].
pub const MAX_PLAYERS_PER_EPOCH: u64 = 100;

/// Expected seconds between mined blocks.
pub const BLOCK_TIME_SECS: u64 = 600;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);
pub const CONFIRMATION_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const CONFIRMATION_POLL_LIMIT: u32 = 200;
