//! peerpool-node - decentralized mining pool node
//!
//! A peer-to-peer mining pool for Scrypt/X11-family parent chains. Instead
//! of a central operator, peers maintain a low-difficulty share chain that
//! rides on the parent blockchain; any parent block a peer finds pays every
//! recent contributor directly through the coinbase (PPLNS). The node speaks
//! Stratum to miners, JSON-RPC to the parent full node, a gossip protocol to
//! other pool nodes, and can merge-mine auxiliary chains.
//!
//! Module map, leaves first:
//!
//! - [`networks`]: per-chain parameter descriptors
//! - [`primitives`]: hashes, consensus codec, transactions, merkle, targets,
//!   address/script translation
//! - [`share`]: the versioned share record and its wire codec
//! - [`tracker`]: the share forest, best-chain selection, PPLNS weights
//! - [`parent`]: adapter to the parent full node
//! - [`work`]: job assembly and submission classification
//! - [`merged`]: auxiliary-chain commitments and payouts
//! - [`network`]: share gossip P2P
//! - [`stratum`]: the miner-facing server
//! - [`storage`]: persisted state
//! - [`node`]: orchestration

pub mod config;
pub mod merged;
pub mod network;
pub mod networks;
pub mod node;
pub mod parent;
pub mod primitives;
pub mod share;
pub mod storage;
pub mod stratum;
pub mod tracker;
pub mod utils;
pub mod work;

pub use config::{Cli, NodeConfig};
pub use networks::NetworkDescriptor;
pub use primitives::hash::Hash256;
pub use share::{Share, ShareVersion};
pub use tracker::ShareTracker;
