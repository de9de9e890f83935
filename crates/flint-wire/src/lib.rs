//! BOLT wire encoding for Lightning peer-to-peer messages.
//!
//! This crate provides the byte-level codec shared by every Lightning
//! message: big-endian integer primitives, fixed-width opaque values, and
//! the domain types that appear on the wire (channel identifiers,
//! secp256k1 keys and signatures, transaction and block hashes).
//!
//! Decoding runs against a [`Cursor`] with *poisoning* failure semantics:
//! any failed read permanently poisons the cursor, every subsequent read
//! observes the poisoned state, and the caller checks the cursor once at
//! the end of a compound decode instead of threading a `Result` through
//! each field. Encoding through [`Writer`] is infallible.

pub mod cursor;
pub mod keys;
pub mod types;
pub mod writer;

pub use cursor::{peek_type, Cursor};
pub use types::{ChannelId, Preimage, PrivKey, Secret, ShortChannelId};
pub use writer::Writer;
