//! Lightning domain types and their wire representation.
//!
//! Hash-shaped values reuse the `bitcoin` crate's types (`Txid` and
//! `BlockHash` are double-SHA newtypes there already); the identifiers
//! specific to Lightning channels live here.

use std::fmt;

use bitcoin::hashes::{ripemd160, sha256, sha256d, Hash};
use bitcoin::hex::DisplayHex;
use bitcoin::{BlockHash, Txid};

use crate::cursor::Cursor;
use crate::writer::Writer;

// ==============================================================================
// Channel Identifiers
// ==============================================================================

/// The 32-byte channel identifier introduced by `funding_locked`.
///
/// BOLT #2: derived from the funding transaction by combining the
/// `funding_txid` and the `funding_output_index` using big-endian
/// exclusive-OR (ie. `funding_output_index` alters the last two bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub [u8; 32]);

// A channel id is exactly a txid's width; the derivation below relies on it.
const _: () = assert!(std::mem::size_of::<ChannelId>() == std::mem::size_of::<Txid>());

impl ChannelId {
    pub fn derive(txid: &Txid, txout: u16) -> Self {
        let mut id = txid.to_byte_array();
        id[30] ^= (txout >> 8) as u8;
        id[31] ^= txout as u8;
        Self(id)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_hex())
    }
}

/// Locates a channel's funding output by position in the chain.
///
/// On the wire this is 8 bytes: 3-byte block height, 3-byte transaction
/// index within the block, 2-byte output index, all big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortChannelId {
    pub blocknum: u32,
    pub txnum: u32,
    pub outnum: u16,
}

impl fmt::Display for ShortChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.blocknum, self.txnum, self.outnum)
    }
}

// ==============================================================================
// Raw Key Material and Preimages
// ==============================================================================

/// 32 raw bytes of secret material. Not validated against the curve order.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(pub [u8; 32]);

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(..)")
    }
}

/// A node or per-commitment private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivKey(pub Secret);

/// An HTLC payment preimage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Preimage(pub [u8; 32]);

// ==============================================================================
// Wire Codec
// ==============================================================================

impl<'a> Cursor<'a> {
    pub fn pull_channel_id(&mut self) -> ChannelId {
        ChannelId(self.pull_array())
    }

    pub fn pull_short_channel_id(&mut self) -> ShortChannelId {
        let blocknum = self.pull_be24();
        let txnum = self.pull_be24();
        let outnum = self.pull_u16();
        ShortChannelId {
            blocknum,
            txnum,
            outnum,
        }
    }

    pub fn pull_sha256(&mut self) -> sha256::Hash {
        sha256::Hash::from_byte_array(self.pull_array())
    }

    /// Reads the stored digest only; applying the second hash round is the
    /// caller's convention, never the codec's.
    pub fn pull_sha256d(&mut self) -> sha256d::Hash {
        sha256d::Hash::from_byte_array(self.pull_array())
    }

    pub fn pull_txid(&mut self) -> Txid {
        Txid::from_byte_array(self.pull_array())
    }

    pub fn pull_block_hash(&mut self) -> BlockHash {
        BlockHash::from_byte_array(self.pull_array())
    }

    pub fn pull_ripemd160(&mut self) -> ripemd160::Hash {
        ripemd160::Hash::from_byte_array(self.pull_array())
    }

    pub fn pull_preimage(&mut self) -> Preimage {
        Preimage(self.pull_array())
    }

    pub fn pull_secret(&mut self) -> Secret {
        Secret(self.pull_array())
    }

    pub fn pull_privkey(&mut self) -> PrivKey {
        PrivKey(self.pull_secret())
    }
}

impl Writer {
    pub fn put_channel_id(&mut self, id: &ChannelId) {
        self.put_bytes(&id.0);
    }

    pub fn put_short_channel_id(&mut self, scid: &ShortChannelId) {
        self.put_be24(scid.blocknum);
        self.put_be24(scid.txnum);
        self.put_u16(scid.outnum);
    }

    pub fn put_sha256(&mut self, hash: &sha256::Hash) {
        self.put_bytes(hash.as_byte_array());
    }

    pub fn put_sha256d(&mut self, hash: &sha256d::Hash) {
        self.put_bytes(hash.as_byte_array());
    }

    pub fn put_txid(&mut self, txid: &Txid) {
        self.put_bytes(txid.as_byte_array());
    }

    pub fn put_block_hash(&mut self, hash: &BlockHash) {
        self.put_bytes(hash.as_byte_array());
    }

    pub fn put_ripemd160(&mut self, hash: &ripemd160::Hash) {
        self.put_bytes(hash.as_byte_array());
    }

    pub fn put_preimage(&mut self, preimage: &Preimage) {
        self.put_bytes(&preimage.0);
    }

    pub fn put_secret(&mut self, secret: &Secret) {
        self.put_bytes(&secret.0);
    }

    pub fn put_privkey(&mut self, key: &PrivKey) {
        self.put_secret(&key.0);
    }
}
