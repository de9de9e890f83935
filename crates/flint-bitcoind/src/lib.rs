//! Driving an external Bitcoin full node through `bitcoin-cli`.
//!
//! The node is reached exclusively by spawning its command-line tool:
//! every request becomes one child process whose output is parsed and
//! delivered to the caller through a completion callback. Requests are
//! strictly serialized — at most one child is ever alive — and callers
//! may pin a request to an [`Anchor`] whose drop silences the callback
//! without killing the child.
//!
//! The driver tolerates transient `bitcoin-cli` failures (a reorg can
//! make commands fail for a while) but treats a sustained error streak,
//! malformed output, or a signaled child as fatal.

pub mod chainparams;
pub mod db;
pub mod driver;
mod parsing;

pub use chainparams::ChainParams;
pub use db::WalletDb;
pub use driver::{Anchor, Bitcoind, BitcoindError};
