//! End-to-end driver tests against a scripted fake `bitcoin-cli`.
//!
//! Each test writes a small shell script that pattern-matches on the RPC
//! command and replies with canned output, then points [`ChainParams::cli`]
//! at it. This exercises the real spawn/read/reap path without a node.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use bitcoin::{Amount, Network};
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};

use flint_bitcoind::{Anchor, Bitcoind, BitcoindError, ChainParams, WalletDb};

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("flint_bitcoind=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Counts transaction brackets so tests can assert the callback ran (or
/// did not run) inside one.
#[derive(Default)]
struct CountingDb {
    begins: AtomicU32,
    commits: AtomicU32,
}

impl WalletDb for CountingDb {
    fn begin_transaction(&self) {
        self.begins.fetch_add(1, Ordering::SeqCst);
    }

    fn commit_transaction(&self) {
        self.commits.fetch_add(1, Ordering::SeqCst);
    }
}

/// Write an executable `case`-dispatch script and return chain params
/// pointing at it. `arms` supplies the per-command case arms.
fn fake_cli(dir: &TempDir, arms: &str) -> ChainParams {
    let path = dir.path().join("fake-bitcoin-cli");
    let script = format!(
        "#!/bin/sh\ncmd=\"$1\"\ncase \"$cmd\" in\n{arms}\n*) echo \"unexpected command: $cmd\" >&2; exit 99 ;;\nesac\n"
    );
    fs::write(&path, script).expect("fake cli script must be writable");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .expect("fake cli script must be executable");
    ChainParams {
        network: "regtest".to_owned(),
        cli: path.display().to_string(),
        cli_args: None,
    }
}

fn harness(arms: &str) -> (TempDir, Bitcoind, Arc<CountingDb>) {
    init_tracing();
    let dir = TempDir::new().expect("tempdir must be creatable");
    let params = fake_cli(&dir, arms);
    let db = Arc::new(CountingDb::default());
    let bitcoind = Bitcoind::new(params, None, db.clone());
    (dir, bitcoind, db)
}

#[tokio::test]
async fn get_block_count_parses_height() {
    let (_dir, bitcoind, db) = harness("getblockcount) echo 123456 ;;");

    let (tx, rx) = oneshot::channel();
    bitcoind.get_block_count(None, move |count| {
        let _ = tx.send(count);
    });

    assert_eq!(rx.await.expect("callback must fire"), 123_456);
    assert_eq!(db.begins.load(Ordering::SeqCst), 1);
    assert_eq!(db.commits.load(Ordering::SeqCst), 1);

    bitcoind.join().await.expect("clean shutdown");
}

#[tokio::test]
async fn callbacks_fire_in_enqueue_order() {
    let (_dir, bitcoind, _db) = harness("getblockcount) echo 7 ;;");

    let (tx, mut rx) = mpsc::unbounded_channel();
    for i in 0..3u32 {
        let tx = tx.clone();
        bitcoind.get_block_count(None, move |_| {
            let _ = tx.send(i);
        });
    }

    for want in 0..3u32 {
        assert_eq!(rx.recv().await, Some(want));
    }
}

#[tokio::test]
async fn send_raw_tx_hands_exit_code_and_output_to_caller() {
    let (_dir, bitcoind, _db) = harness("sendrawtransaction) printf '%s' 'bad tx'; exit 25 ;;");

    let (tx, rx) = oneshot::channel();
    bitcoind.send_raw_tx("deadbeef", None, move |status, msg| {
        let _ = tx.send((status, msg));
    });

    let (status, msg) = rx.await.expect("callback must fire");
    assert_eq!(status, 25);
    assert_eq!(msg, "bad tx");

    // The nonzero exit above went to the caller, not the error streak:
    // the driver keeps working.
    bitcoind.join().await.expect("capture exits are not fatal");
}

#[tokio::test]
async fn get_block_hash_missing_height_is_none() {
    let arms = "getblockhash) echo 'Block height out of range' >&2; exit 8 ;;";
    let (_dir, bitcoind, _db) = harness(arms);

    let (tx, rx) = oneshot::channel();
    bitcoind.get_block_hash(999_999, None, move |blockid| {
        let _ = tx.send(blockid);
    });

    assert_eq!(rx.await.expect("callback must fire"), None);
}

#[tokio::test]
async fn get_block_hash_resolves_height() {
    let hash = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
    let arms = format!("getblockhash) echo {hash} ;;");
    let (_dir, bitcoind, _db) = harness(&arms);

    let (tx, rx) = oneshot::channel();
    bitcoind.get_block_hash(0, None, move |blockid| {
        let _ = tx.send(blockid);
    });

    let blockid = rx.await.expect("callback must fire").expect("height 0 exists");
    assert_eq!(blockid.to_string(), hash);
}

#[tokio::test]
async fn get_output_chains_to_the_spendable_output() {
    let arms = concat!(
        "getblockhash) echo 0000000000000000000000000000000000000000000000000000000000000001 ;;\n",
        "getblock) printf '%s' '{\"tx\":[\"2222222222222222222222222222222222222222222222222222222222222222\"]}' ;;\n",
        "gettxout) printf '%s' '{\"value\":0.5,\"scriptPubKey\":{\"hex\":\"ac\"}}' ;;"
    );
    let (_dir, bitcoind, db) = harness(arms);

    let (tx, rx) = oneshot::channel();
    bitcoind.get_output(100, 0, 0, None, move |txout| {
        let _ = tx.send(txout);
    });

    let txout = rx
        .await
        .expect("callback must fire")
        .expect("output must be found");
    assert_eq!(txout.value, Amount::from_sat(50_000_000));
    assert_eq!(txout.script_pubkey.as_bytes(), &[0xAC]);

    // Three chained invocations, each processed inside its own bracket.
    assert_eq!(db.begins.load(Ordering::SeqCst), 3);
    assert_eq!(db.commits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn get_output_bad_blocknum_is_none() {
    let (_dir, bitcoind, _db) = harness("getblockhash) exit 8 ;;");

    let (tx, rx) = oneshot::channel();
    bitcoind.get_output(999_999_999, 0, 0, None, move |txout| {
        let _ = tx.send(txout);
    });

    assert!(rx.await.expect("callback must fire").is_none());
}

#[tokio::test]
async fn get_output_txnum_out_of_range_is_none() {
    let arms = concat!(
        "getblockhash) echo 0000000000000000000000000000000000000000000000000000000000000001 ;;\n",
        "getblock) printf '%s' '{\"tx\":[\"2222222222222222222222222222222222222222222222222222222222222222\"]}' ;;"
    );
    let (_dir, bitcoind, _db) = harness(arms);

    let (tx, rx) = oneshot::channel();
    bitcoind.get_output(100, 5, 0, None, move |txout| {
        let _ = tx.send(txout);
    });

    assert!(rx.await.expect("callback must fire").is_none());
}

#[tokio::test]
async fn get_output_spent_output_is_none() {
    let arms = concat!(
        "getblockhash) echo 0000000000000000000000000000000000000000000000000000000000000001 ;;\n",
        "getblock) printf '%s' '{\"tx\":[\"2222222222222222222222222222222222222222222222222222222222222222\"]}' ;;\n",
        "gettxout) exit 1 ;;"
    );
    let (_dir, bitcoind, _db) = harness(arms);

    let (tx, rx) = oneshot::channel();
    bitcoind.get_output(100, 0, 1, None, move |txout| {
        let _ = tx.send(txout);
    });

    assert!(rx.await.expect("callback must fire").is_none());
}

#[tokio::test]
async fn get_raw_block_decodes_consensus_hex() {
    let genesis = bitcoin::constants::genesis_block(Network::Regtest);
    let hex = bitcoin::consensus::encode::serialize_hex(&genesis);
    let arms = format!("getblock) printf '%s' '{hex}' ;;");
    let (_dir, bitcoind, _db) = harness(&arms);

    let (tx, rx) = oneshot::channel();
    bitcoind.get_raw_block(&genesis.block_hash(), None, move |block| {
        let _ = tx.send(block);
    });

    let block = rx.await.expect("callback must fire");
    assert_eq!(block.block_hash(), genesis.block_hash());
}

#[tokio::test]
async fn estimate_fees_chains_targets_and_zeroes_unavailable() {
    let arms = concat!(
        "estimatesmartfee) if [ \"$3\" = \"CONSERVATIVE\" ]; then ",
        "printf '%s' '{\"feerate\":0.00001}'; else printf '%s' '{}'; fi ;;"
    );
    let (_dir, bitcoind, db) = harness(arms);

    let (tx, rx) = oneshot::channel();
    bitcoind
        .estimate_fees(
            &[2, 6],
            &["CONSERVATIVE", "ECONOMICAL"],
            None,
            move |rates| {
                let _ = tx.send(rates);
            },
        )
        .expect("matched targets must be accepted");

    // 0.00001 BTC/kB * 1e8 / 4 = 250 sat/kw; the second target could not
    // be estimated and reports 0.
    assert_eq!(rx.await.expect("callback must fire"), vec![250, 0]);
    assert_eq!(db.begins.load(Ordering::SeqCst), 2);
    assert_eq!(db.commits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn estimate_fees_rejects_mismatched_targets() {
    let (_dir, bitcoind, _db) = harness("getblockcount) echo 7 ;;");

    let err = bitcoind
        .estimate_fees(&[2, 6], &["CONSERVATIVE"], None, |_| {
            unreachable!("rejected request must not run")
        })
        .expect_err("mismatched target lists must be rejected");
    assert!(matches!(
        err,
        BitcoindError::BadFeeTargets { blocks: 2, modes: 1 }
    ));

    let err = bitcoind
        .estimate_fees(&[], &[], None, |_| unreachable!("rejected request must not run"))
        .expect_err("empty target lists must be rejected");
    assert!(matches!(
        err,
        BitcoindError::BadFeeTargets { blocks: 0, modes: 0 }
    ));
}

#[tokio::test]
async fn chained_legs_keep_logical_enqueue_order() {
    let arms = concat!(
        "estimatesmartfee) printf '%s' '{\"feerate\":0.0001}' ;;\n",
        "getblockcount) echo 7 ;;"
    );
    let (_dir, bitcoind, _db) = harness(arms);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let fees_tx = tx.clone();
    bitcoind
        .estimate_fees(&[2, 6], &["CONSERVATIVE", "CONSERVATIVE"], None, move |_| {
            let _ = fees_tx.send("fees");
        })
        .expect("matched targets must be accepted");
    bitcoind.get_block_count(None, move |_| {
        let _ = tx.send("count");
    });

    // The fee estimate was enqueued first; its internal second leg must
    // not push its completion behind the later block-count request.
    assert_eq!(rx.recv().await, Some("fees"));
    assert_eq!(rx.recv().await, Some("count"));
}

#[tokio::test]
async fn dropped_anchor_suppresses_callback_but_child_still_runs() {
    let dir = TempDir::new().expect("tempdir must be creatable");
    let marker = dir.path().join("broadcast-ran");
    let arms = format!(
        "sendrawtransaction) touch {} ; printf ok ;;\ngetblockcount) echo 7 ;;",
        marker.display()
    );
    init_tracing();
    let params = fake_cli(&dir, &arms);
    let db = Arc::new(CountingDb::default());
    let bitcoind = Bitcoind::new(params, None, db.clone());

    let fired = Arc::new(AtomicBool::new(false));
    let fired_cb = fired.clone();
    let anchor = Anchor::new();
    bitcoind.send_raw_tx("deadbeef", Some(&anchor), move |_, _| {
        fired_cb.store(true, Ordering::SeqCst);
    });
    drop(anchor);

    // A second, unanchored request to fence on: once its callback fires,
    // the anchored request has long been reaped.
    let (tx, rx) = oneshot::channel();
    bitcoind.get_block_count(None, move |count| {
        let _ = tx.send(count);
    });
    assert_eq!(rx.await.expect("callback must fire"), 7);

    assert!(marker.exists(), "child must run to completion");
    assert!(!fired.load(Ordering::SeqCst), "callback must be suppressed");
    // Only the unanchored request was bracketed.
    assert_eq!(db.begins.load(Ordering::SeqCst), 1);
    assert_eq!(db.commits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn live_anchor_lets_callback_through() {
    let (_dir, bitcoind, _db) = harness("getblockcount) echo 7 ;;");

    let anchor = Anchor::new();
    let (tx, rx) = oneshot::channel();
    bitcoind.get_block_count(Some(&anchor), move |count| {
        let _ = tx.send(count);
    });

    assert_eq!(rx.await.expect("callback must fire"), 7);
    drop(anchor);
}

#[tokio::test]
async fn shutdown_abandons_pending_work_silently() {
    let (_dir, bitcoind, db) = harness("getblockcount) sleep 0.2; echo 7 ;;");

    let fired = Arc::new(AtomicBool::new(false));
    let fired_cb = fired.clone();
    bitcoind.get_block_count(None, move |_| {
        fired_cb.store(true, Ordering::SeqCst);
    });

    // Shut down while the request is (at best) mid-flight.
    bitcoind.join().await.expect("shutdown is not a fault");

    assert!(!fired.load(Ordering::SeqCst));
    assert_eq!(db.begins.load(Ordering::SeqCst), 0);
    assert_eq!(db.commits.load(Ordering::SeqCst), 0);
}

// ==============================================================================
// Error Streak
// ==============================================================================

/// Fail `getblockcount` while a marker file exists; `sendrawtransaction`
/// always exits 25 so tests can fence on a captured-exit callback without
/// touching the streak.
fn streak_arms(fail_marker: &std::path::Path) -> String {
    format!(
        "getblockcount) if [ -f {m} ]; then echo 'error code: -1' >&2; exit 1; else echo 7; fi ;;\n\
         sendrawtransaction) printf fenced; exit 25 ;;",
        m = fail_marker.display()
    )
}

async fn fence(bitcoind: &Bitcoind) {
    let (tx, rx) = oneshot::channel();
    bitcoind.send_raw_tx("00", None, move |_, _| {
        let _ = tx.send(());
    });
    rx.await.expect("fence callback must fire");
}

#[tokio::test(start_paused = true)]
async fn error_streak_past_window_is_fatal() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir must be creatable");
    let marker = dir.path().join("fail");
    fs::write(&marker, "").expect("marker must be writable");
    let params = fake_cli(&dir, &streak_arms(&marker));
    let bitcoind = Bitcoind::new(params, None, Arc::new(CountingDb::default()));

    // First failure opens the streak window.
    bitcoind.get_block_count(None, |_| unreachable!("failed request must not complete"));
    fence(&bitcoind).await;

    tokio::time::advance(Duration::from_secs(61)).await;

    // Still failing past the window: the dispatcher aborts.
    bitcoind.get_block_count(None, |_| unreachable!("failed request must not complete"));
    let err = bitcoind
        .join()
        .await
        .expect_err("sustained error streak must be fatal");
    assert!(err.is_panic());
}

#[tokio::test(start_paused = true)]
async fn zero_exit_resets_the_error_streak() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir must be creatable");
    let marker = dir.path().join("fail");
    fs::write(&marker, "").expect("marker must be writable");
    let params = fake_cli(&dir, &streak_arms(&marker));
    let bitcoind = Bitcoind::new(params, None, Arc::new(CountingDb::default()));

    // Open a streak, then recover.
    bitcoind.get_block_count(None, |_| unreachable!("failed request must not complete"));
    fence(&bitcoind).await;
    fs::remove_file(&marker).expect("marker must be removable");

    let (tx, rx) = oneshot::channel();
    bitcoind.get_block_count(None, move |count| {
        let _ = tx.send(count);
    });
    assert_eq!(rx.await.expect("callback must fire"), 7);

    // Well past the original window. A fresh failure starts a new streak
    // instead of tripping the old one.
    tokio::time::advance(Duration::from_secs(120)).await;
    fs::write(&marker, "").expect("marker must be writable");
    bitcoind.get_block_count(None, |_| unreachable!("failed request must not complete"));
    fence(&bitcoind).await;

    bitcoind.join().await.expect("reset streak must not be fatal");
}

// ==============================================================================
// Warm-up Probe
// ==============================================================================

#[tokio::test]
async fn warmup_returns_once_node_answers() {
    let (_dir, bitcoind, _db) = harness("echo) echo '' ;;");
    bitcoind
        .wait_for_warmup()
        .await
        .expect("ready node must pass the probe");
}

#[tokio::test(start_paused = true)]
async fn warmup_retries_while_warming_up() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir must be creatable");
    let warm = dir.path().join("warm");
    let arms = format!(
        "echo) if [ -f {w} ]; then echo ready; else touch {w}; exit 28; fi ;;",
        w = warm.display()
    );
    let params = fake_cli(&dir, &arms);
    let bitcoind = Bitcoind::new(params, None, Arc::new(CountingDb::default()));

    bitcoind
        .wait_for_warmup()
        .await
        .expect("probe must retry through warm-up");
    assert!(warm.exists());
}

#[tokio::test]
async fn warmup_other_failure_is_an_error() {
    let (_dir, bitcoind, _db) = harness("echo) echo 'cannot connect' >&2; exit 5 ;;");

    let err = bitcoind
        .wait_for_warmup()
        .await
        .expect_err("non-warmup failure must be reported");
    match err {
        BitcoindError::Startup { status, output, .. } => {
            assert_eq!(status, 5);
            assert!(output.contains("cannot connect"));
        }
        other => panic!("unexpected error: {other}"),
    }
}
