//! The wallet-database bracket.
//!
//! The wallet database belongs to the host; the driver only needs to wrap
//! each completion callback in a transaction so that whatever state the
//! callback touches lands atomically.

/// Transaction bracket over the host's wallet database.
///
/// [`begin_transaction`](WalletDb::begin_transaction) is called
/// immediately before a request's result processing runs and
/// [`commit_transaction`](WalletDb::commit_transaction) immediately
/// after. The bracket is suppressed, along with the callback, when the
/// driver is shutting down or the request's anchor is gone.
pub trait WalletDb: Send + Sync {
    fn begin_transaction(&self);
    fn commit_transaction(&self);
}
