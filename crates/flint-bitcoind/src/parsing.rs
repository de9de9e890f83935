//! Extracting typed results from `bitcoin-cli` output.
//!
//! Some commands answer with JSON, some with a bare text line, one with a
//! raw hex blob. Helpers here return `Err(description)`; the driver
//! decides whether a failure is fatal (it almost always is — malformed
//! output means a broken or incompatible CLI, not a transient condition).

use bitcoin::consensus;
use bitcoin::hex::FromHex;
use bitcoin::{Amount, Block, BlockHash, ScriptBuf, TxOut, Txid};

/// Parse output that must be a JSON object.
fn json_object(output: &[u8]) -> Result<serde_json::Value, String> {
    let value: serde_json::Value =
        serde_json::from_slice(output).map_err(|e| format!("invalid response: {e}"))?;
    if !value.is_object() {
        return Err(format!(
            "gave non-object ({})?",
            String::from_utf8_lossy(output)
        ));
    }
    Ok(value)
}

/// The `feerate` field of an `estimatesmartfee` reply, in BTC per kB.
/// `Ok(None)` when the node declined to estimate.
pub(crate) fn feerate_btc_per_kb(output: &[u8]) -> Result<Option<f64>, String> {
    let obj = json_object(output)?;
    Ok(obj.get("feerate").and_then(serde_json::Value::as_f64))
}

/// Convert a BTC-per-kB fee rate to satoshi per kiloweight.
pub(crate) fn btc_per_kb_to_sat_per_kw(feerate: f64) -> u32 {
    (feerate * 100_000_000.0 / 4.0).round() as u32
}

/// A `gettxout` reply. Both `value` and `scriptPubKey.hex` are mandatory;
/// a missing output is signalled by the CLI's exit status, never by an
/// incomplete object.
pub(crate) fn txout_from_gettxout(output: &[u8]) -> Result<TxOut, String> {
    let obj = json_object(output)?;
    let value = obj
        .get("value")
        .ok_or_else(|| "had no value member?".to_owned())?;
    let value = btc_value(value)?;

    let hex = obj
        .get("scriptPubKey")
        .and_then(|spk| spk.get("hex"))
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| "had no scriptPubKey.hex member?".to_owned())?;
    let script_pubkey =
        ScriptBuf::from_hex(hex).map_err(|e| format!("scriptPubKey.hex invalid hex: {e}"))?;

    Ok(TxOut {
        value,
        script_pubkey,
    })
}

/// The BTC-denominated `value` of an output. bitcoin-cli prints it as a
/// JSON number; some RPC wrappers quote it, so a numeric string is
/// accepted too.
fn btc_value(value: &serde_json::Value) -> Result<Amount, String> {
    let btc = if let Some(n) = value.as_f64() {
        n
    } else if let Some(text) = value.as_str() {
        text.parse::<f64>()
            .map_err(|_| format!("had non-numeric value '{text}'?"))?
    } else {
        return Err(format!("had non-numeric value ({value})?"));
    };
    Amount::from_btc(btc).map_err(|e| format!("had bad value ({value}): {e}?"))
}

/// The txid at position `txnum` of a verbose `getblock` reply.
///
/// `Ok(None)` when `txnum` is past the end of the block's `tx` array — a
/// perfectly possible caller error. A missing `tx` member or malformed
/// txid hex is a protocol error.
pub(crate) fn block_txid(output: &[u8], txnum: usize) -> Result<Option<Txid>, String> {
    let obj = json_object(output)?;
    let txs = obj
        .get("tx")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| "had no tx member?".to_owned())?;

    let Some(entry) = txs.get(txnum) else {
        return Ok(None);
    };
    let hex = entry
        .as_str()
        .ok_or_else(|| format!("had non-string txid ({entry})?"))?;
    hex.parse::<Txid>()
        .map(Some)
        .map_err(|e| format!("had bad txid ({hex}): {e}?"))
}

/// The decimal block height printed by `getblockcount`.
pub(crate) fn block_count(output: &[u8]) -> Result<u32, String> {
    let text =
        std::str::from_utf8(output).map_err(|e| format!("gave non-utf8 blockcount: {e}"))?;
    let trimmed = text.trim();
    trimmed
        .parse::<u32>()
        .map_err(|_| format!("gave non-numeric blockcount {trimmed}"))
}

/// The block-hash line printed by `getblockhash`.
pub(crate) fn block_hash_line(output: &[u8]) -> Result<BlockHash, String> {
    let text = std::str::from_utf8(output).map_err(|e| format!("gave non-utf8 blockid: {e}"))?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("bad blockid ''".to_owned());
    }
    trimmed
        .parse::<BlockHash>()
        .map_err(|e| format!("bad blockid '{trimmed}': {e}"))
}

/// A raw block from `getblock <hash> false`: hex of the consensus
/// serialization.
pub(crate) fn block_from_hex(output: &[u8]) -> Result<Block, String> {
    let text = std::str::from_utf8(output).map_err(|e| format!("bad block (non-utf8): {e}"))?;
    let raw = Vec::<u8>::from_hex(text.trim()).map_err(|e| format!("bad block hex: {e}"))?;
    consensus::deserialize(&raw).map_err(|e| format!("bad block: {e}"))
}
