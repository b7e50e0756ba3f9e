//! Parent-chain adapter
//!
//! Everything that talks to the external full node lives here: the JSON-RPC
//! client, the template poller that publishes fresh work context, and the
//! known-transaction table needed to assemble a full block when a share
//! crosses the parent target.

pub mod client;
pub mod known_txs;
pub mod template;

pub use client::{ParentRpcClient, RpcError};
pub use known_txs::KnownTxs;
pub use template::{BlockTemplate, TemplatePoller, TemplateTx};
