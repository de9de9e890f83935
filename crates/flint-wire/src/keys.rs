//! Codec for secp256k1 points and signatures.
//!
//! These are the only wire types whose decode can fail on well-sized
//! input: the bytes must also parse as curve material. Such reads return
//! `Option` (the types have no zero value) and poison the cursor on a
//! parse failure, so compound decodes still only check the cursor once.

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId, Signature};
use secp256k1::PublicKey;

use crate::cursor::Cursor;
use crate::writer::Writer;

/// Compressed SEC1 encoding of a secp256k1 point.
pub const PUBKEY_LEN: usize = 33;

/// Compact `r || s` encoding of an ECDSA signature.
pub const SIGNATURE_LEN: usize = 64;

impl<'a> Cursor<'a> {
    /// A 33-byte compressed public key. Poisons unless the bytes name a
    /// valid curve point.
    pub fn pull_pubkey(&mut self) -> Option<PublicKey> {
        let der: [u8; PUBKEY_LEN] = self.pull_array();
        if self.is_poisoned() {
            return None;
        }
        match PublicKey::from_slice(&der) {
            Ok(key) => Some(key),
            Err(_) => {
                self.fail();
                None
            }
        }
    }

    /// A 64-byte compact ECDSA signature.
    pub fn pull_signature(&mut self) -> Option<Signature> {
        let compact: [u8; SIGNATURE_LEN] = self.pull_array();
        if self.is_poisoned() {
            return None;
        }
        match Signature::from_compact(&compact) {
            Ok(sig) => Some(sig),
            Err(_) => {
                self.fail();
                None
            }
        }
    }

    /// A compact signature followed by its one-byte recovery id.
    pub fn pull_recoverable_signature(&mut self) -> Option<RecoverableSignature> {
        let compact: [u8; SIGNATURE_LEN] = self.pull_array();
        let recid = self.pull_u8();
        if self.is_poisoned() {
            return None;
        }
        let recid = match RecoveryId::from_i32(i32::from(recid)) {
            Ok(id) => id,
            Err(_) => {
                self.fail();
                return None;
            }
        };
        match RecoverableSignature::from_compact(&compact, recid) {
            Ok(sig) => Some(sig),
            Err(_) => {
                self.fail();
                None
            }
        }
    }
}

impl Writer {
    pub fn put_pubkey(&mut self, key: &PublicKey) {
        self.put_bytes(&key.serialize());
    }

    pub fn put_signature(&mut self, sig: &Signature) {
        self.put_bytes(&sig.serialize_compact());
    }

    pub fn put_recoverable_signature(&mut self, sig: &RecoverableSignature) {
        let (recid, compact) = sig.serialize_compact();
        self.put_bytes(&compact);
        self.put_u8(recid.to_i32() as u8);
    }
}
