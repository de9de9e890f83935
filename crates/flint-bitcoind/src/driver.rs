//! The serialized request driver.
//!
//! A dedicated dispatcher task owns the pending queue and runs requests
//! one at a time: compose argv, spawn `bitcoin-cli`, drain its output,
//! reap it, then apply the exit-status policy and hand the output to the
//! request's processing function inside the wallet-database bracket.
//! Public operations enqueue and return immediately; results arrive
//! through completion callbacks.
//!
//! There is no timeout on the child: a hung CLI stalls the queue.
//! FIXME: add an adjustable watchdog around the child wait.

use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bitcoin::{Block, BlockHash, TxOut, Txid};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::chainparams::ChainParams;
use crate::db::WalletDb;
use crate::parsing;

/// Spurious nonzero exits (eg. during a reorg) are tolerated until the
/// first error of the streak is this old.
const ERROR_STREAK_LIMIT: Duration = Duration::from_secs(60);

/// bitcoin-cli maps RPC_IN_WARMUP (-28) to this exit code.
const WARMUP_EXIT_CODE: i32 = 28;

/// How much trailing output a fatal report carries.
const FATAL_TAIL_BYTES: usize = 512;

/// Invalid requests and boot-time failures reaching the node.
///
/// Runtime protocol violations are not represented here: once the queue
/// is running, a broken CLI is unrecoverable and panics the dispatcher
/// task (observable through [`Bitcoind::join`]).
#[derive(Debug, thiserror::Error)]
pub enum BitcoindError {
    #[error("{cmd}: exec failed: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{cmd} died with signal {signal}")]
    Signaled { cmd: String, signal: i32 },

    #[error("{cmd} exited with code {status}: {output}")]
    Startup {
        cmd: String,
        status: i32,
        output: String,
    },

    #[error("fee estimation needs matched non-empty targets: {blocks} block targets, {modes} modes")]
    BadFeeTargets { blocks: usize, modes: usize },
}

// ==============================================================================
// Cancellation Anchors
// ==============================================================================

/// A caller-owned lifetime scope for pending requests.
///
/// A request pinned to an anchor has its completion callback suppressed
/// if the anchor is dropped first; the child process still runs to
/// completion and is reaped normally. Requests without an anchor are
/// guaranteed their callback.
#[derive(Debug, Default)]
pub struct Anchor(Arc<()>);

impl Anchor {
    pub fn new() -> Self {
        Self::default()
    }

    fn link(&self) -> Weak<()> {
        Arc::downgrade(&self.0)
    }
}

// ==============================================================================
// Requests
// ==============================================================================

/// Exit code and combined output of one finished CLI invocation, plus the
/// rendered command line for diagnostics.
struct Finished {
    status: i32,
    output: Vec<u8>,
    cmd: String,
}

type ProcessFn = Box<dyn FnOnce(&mut Dispatcher, Finished) + Send>;

struct Request {
    cmd: &'static str,
    args: Vec<String>,
    /// When set, the exit status is the caller's to interpret and the
    /// error streak is not advanced.
    nonzero_exit_ok: bool,
    anchor: Option<Weak<()>>,
    process: ProcessFn,
}

// ==============================================================================
// Public Handle
// ==============================================================================

/// Handle to the external Bitcoin node.
///
/// Dropping the handle shuts the driver down: a request in flight is
/// still reaped, but no further callbacks fire and the queue is
/// abandoned.
pub struct Bitcoind {
    params: ChainParams,
    datadir: Option<PathBuf>,
    queue: mpsc::UnboundedSender<Request>,
    shutdown: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Bitcoind {
    pub fn new(params: ChainParams, datadir: Option<PathBuf>, db: Arc<dyn WalletDb>) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let dispatcher = Dispatcher {
            params: params.clone(),
            datadir: datadir.clone(),
            db,
            rx,
            chained: VecDeque::new(),
            error_count: 0,
            first_error: None,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(dispatcher.run());
        Self {
            params,
            datadir,
            queue,
            shutdown,
            task: Some(task),
        }
    }

    /// Wait for the dispatcher task to wind down, shutting the driver
    /// down first. Surfaces a dispatcher panic (fatal protocol error) as
    /// the join error.
    pub async fn join(mut self) -> Result<(), tokio::task::JoinError> {
        let task = self.task.take().expect("join consumes the only handle");
        drop(self);
        task.await
    }

    fn start(&self, req: Request) {
        // A closed queue means the dispatcher died on a fatal error; the
        // request is dropped like every other post-fatal enqueue.
        let _ = self.queue.send(req);
    }

    /// Probe the node until it answers a trivial command.
    ///
    /// Retries once a second while the node reports it is warming up;
    /// any other failure is returned to the embedder, which has nothing
    /// better to do than exit.
    pub async fn wait_for_warmup(&self) -> Result<(), BitcoindError> {
        let argv = gather_args(&self.params, self.datadir.as_deref(), "echo", &[]);
        let cmd = argv.join(" ");
        let mut logged = false;

        loop {
            let out = Command::new(&argv[0])
                .args(&argv[1..])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await
                .map_err(|source| BitcoindError::Spawn {
                    cmd: cmd.clone(),
                    source,
                })?;

            let Some(status) = out.status.code() else {
                return Err(BitcoindError::Signaled {
                    signal: out.status.signal().unwrap_or(0),
                    cmd,
                });
            };
            if status == 0 {
                return Ok(());
            }
            if status != WARMUP_EXIT_CODE {
                let mut output = out.stdout;
                output.extend_from_slice(&out.stderr);
                return Err(BitcoindError::Startup {
                    cmd,
                    status,
                    output: String::from_utf8_lossy(&output).into_owned(),
                });
            }

            if !logged {
                warn!("waiting for bitcoind to warm up...");
                logged = true;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    // --------------------------------------------------------------------------
    // Operations
    // --------------------------------------------------------------------------

    /// Estimate fee rates for each `(blocks, estmode)` target, in satoshi
    /// per kiloweight. Targets the node cannot estimate come back as 0.
    /// One callback with all results, in target order.
    pub fn estimate_fees(
        &self,
        blocks: &[u32],
        estmode: &[&str],
        anchor: Option<&Anchor>,
        cb: impl FnOnce(Vec<u32>) + Send + 'static,
    ) -> Result<(), BitcoindError> {
        if blocks.is_empty() || blocks.len() != estmode.len() {
            return Err(BitcoindError::BadFeeTargets {
                blocks: blocks.len(),
                modes: estmode.len(),
            });
        }

        let state = EstimateFees {
            blocks: blocks.to_vec(),
            estmode: estmode.iter().map(|s| (*s).to_owned()).collect(),
            satoshi_per_kw: Vec::with_capacity(blocks.len()),
            anchor: anchor.map(Anchor::link),
            cb: Box::new(cb),
        };
        self.start(estimatefee_request(state));
        Ok(())
    }

    /// Broadcast a hex-encoded transaction. The callback always fires
    /// (anchor permitting) with the CLI's exit code and raw output text;
    /// a rejected transaction is the caller's problem, not the driver's.
    pub fn send_raw_tx(
        &self,
        hextx: &str,
        anchor: Option<&Anchor>,
        cb: impl FnOnce(i32, String) + Send + 'static,
    ) {
        debug!(tx = %hextx, "sendrawtransaction");
        let cb = Box::new(cb);
        self.start(Request {
            cmd: "sendrawtransaction",
            args: vec![hextx.to_owned()],
            nonzero_exit_ok: true,
            anchor: anchor.map(Anchor::link),
            process: Box::new(move |_disp, fin| {
                let msg = String::from_utf8_lossy(&fin.output).into_owned();
                debug!(status = fin.status, msg = %msg, "sendrawtransaction exit");
                cb(fin.status, msg);
            }),
        });
    }

    /// Fetch and decode a full block.
    pub fn get_raw_block(
        &self,
        blockid: &BlockHash,
        anchor: Option<&Anchor>,
        cb: impl FnOnce(Block) + Send + 'static,
    ) {
        let cb = Box::new(cb);
        self.start(Request {
            cmd: "getblock",
            args: vec![blockid.to_string(), "false".to_owned()],
            nonzero_exit_ok: false,
            anchor: anchor.map(Anchor::link),
            process: Box::new(move |_disp, fin| match parsing::block_from_hex(&fin.output) {
                Ok(block) => cb(block),
                Err(msg) => fatal(&fin.cmd, &msg),
            }),
        });
    }

    /// Fetch the current block height.
    pub fn get_block_count(
        &self,
        anchor: Option<&Anchor>,
        cb: impl FnOnce(u32) + Send + 'static,
    ) {
        let cb = Box::new(cb);
        self.start(Request {
            cmd: "getblockcount",
            args: Vec::new(),
            nonzero_exit_ok: false,
            anchor: anchor.map(Anchor::link),
            process: Box::new(move |_disp, fin| match parsing::block_count(&fin.output) {
                Ok(count) => cb(count),
                Err(msg) => fatal(&fin.cmd, &msg),
            }),
        });
    }

    /// Locate a transaction output by chain position. `None` when the
    /// block, transaction index, or output does not exist (or the output
    /// is already spent).
    pub fn get_output(
        &self,
        blocknum: u32,
        txnum: u32,
        outnum: u32,
        anchor: Option<&Anchor>,
        cb: impl FnOnce(Option<TxOut>) + Send + 'static,
    ) {
        // Our own topology may not reach that far back; ask the node.
        let state = GetOutput {
            txnum,
            outnum,
            anchor: anchor.map(Anchor::link),
            cb: Box::new(cb),
        };
        self.start(getoutput_blockhash_request(state, blocknum));
    }

    /// Resolve a block height to its hash. `None` when the node has no
    /// block at that height.
    pub fn get_block_hash(
        &self,
        height: u32,
        anchor: Option<&Anchor>,
        cb: impl FnOnce(Option<BlockHash>) + Send + 'static,
    ) {
        let cb = Box::new(cb);
        self.start(Request {
            cmd: "getblockhash",
            args: vec![height.to_string()],
            nonzero_exit_ok: true,
            anchor: anchor.map(Anchor::link),
            process: Box::new(move |_disp, fin| {
                if fin.status != 0 {
                    cb(None);
                    return;
                }
                match parsing::block_hash_line(&fin.output) {
                    Ok(blockid) => cb(Some(blockid)),
                    Err(msg) => fatal(&fin.cmd, &msg),
                }
            }),
        });
    }
}

impl Drop for Bitcoind {
    fn drop(&mut self) {
        // In-flight work is reaped but no longer processed; the queue
        // sender drops right after, stopping the dispatcher.
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

// ==============================================================================
// Chained Request States
// ==============================================================================

struct EstimateFees {
    blocks: Vec<u32>,
    estmode: Vec<String>,
    satoshi_per_kw: Vec<u32>,
    anchor: Option<Weak<()>>,
    cb: Box<dyn FnOnce(Vec<u32>) + Send>,
}

fn estimatefee_request(state: EstimateFees) -> Request {
    let i = state.satoshi_per_kw.len();
    let args = vec![state.blocks[i].to_string(), state.estmode[i].clone()];
    let anchor = state.anchor.clone();
    Request {
        cmd: "estimatesmartfee",
        args,
        nonzero_exit_ok: false,
        anchor,
        process: Box::new(move |disp, fin| process_estimatefee(disp, fin, state)),
    }
}

fn process_estimatefee(disp: &mut Dispatcher, fin: Finished, mut state: EstimateFees) {
    let i = state.satoshi_per_kw.len();
    let sat_per_kw = match parsing::feerate_btc_per_kb(&fin.output) {
        Ok(Some(feerate)) => parsing::btc_per_kb_to_sat_per_kw(feerate),
        Ok(None) => {
            warn!(
                mode = %state.estmode[i],
                blocks = state.blocks[i],
                "unable to estimate fee"
            );
            0
        }
        Err(msg) => fatal(&fin.cmd, &msg),
    };
    state.satoshi_per_kw.push(sat_per_kw);

    if state.satoshi_per_kw.len() == state.blocks.len() {
        let EstimateFees {
            satoshi_per_kw, cb, ..
        } = state;
        cb(satoshi_per_kw);
    } else {
        disp.push_chained(estimatefee_request(state));
    }
}

struct GetOutput {
    txnum: u32,
    outnum: u32,
    anchor: Option<Weak<()>>,
    cb: Box<dyn FnOnce(Option<TxOut>) + Send>,
}

fn getoutput_blockhash_request(state: GetOutput, blocknum: u32) -> Request {
    let anchor = state.anchor.clone();
    Request {
        cmd: "getblockhash",
        args: vec![blocknum.to_string()],
        nonzero_exit_ok: true,
        anchor,
        process: Box::new(move |disp, fin| {
            if fin.status != 0 {
                debug!(cmd = %fin.cmd, "invalid blocknum?");
                (state.cb)(None);
                return;
            }
            let blockhash = String::from_utf8_lossy(&fin.output).trim().to_owned();
            disp.push_chained(getoutput_block_request(state, blockhash));
        }),
    }
}

fn getoutput_block_request(state: GetOutput, blockhash: String) -> Request {
    let anchor = state.anchor.clone();
    Request {
        cmd: "getblock",
        args: vec![blockhash],
        nonzero_exit_ok: false,
        anchor,
        process: Box::new(move |disp, fin| {
            match parsing::block_txid(&fin.output, state.txnum as usize) {
                Ok(Some(txid)) => disp.push_chained(getoutput_txout_request(state, txid)),
                Ok(None) => {
                    debug!(cmd = %fin.cmd, txnum = state.txnum, "no such txnum");
                    (state.cb)(None);
                }
                Err(msg) => fatal(&fin.cmd, &msg),
            }
        }),
    }
}

fn getoutput_txout_request(state: GetOutput, txid: Txid) -> Request {
    let anchor = state.anchor.clone();
    Request {
        cmd: "gettxout",
        args: vec![txid.to_string(), state.outnum.to_string()],
        nonzero_exit_ok: true,
        anchor,
        process: Box::new(move |_disp, fin| {
            if fin.status != 0 {
                debug!(cmd = %fin.cmd, "not an unspent output?");
                (state.cb)(None);
                return;
            }
            match parsing::txout_from_gettxout(&fin.output) {
                Ok(txout) => (state.cb)(Some(txout)),
                Err(msg) => fatal(&fin.cmd, &msg),
            }
        }),
    }
}

// ==============================================================================
// Dispatcher
// ==============================================================================

struct Dispatcher {
    params: ChainParams,
    datadir: Option<PathBuf>,
    db: Arc<dyn WalletDb>,
    rx: mpsc::UnboundedReceiver<Request>,
    /// Follow-up invocations of multi-step requests. Served before the
    /// public queue so a logical request's callback keeps its slot in
    /// enqueue order.
    chained: VecDeque<Request>,
    error_count: u32,
    first_error: Option<Instant>,
    shutdown: Arc<AtomicBool>,
}

impl Dispatcher {
    fn push_chained(&mut self, req: Request) {
        self.chained.push_back(req);
    }

    async fn run(mut self) {
        loop {
            let req = match self.chained.pop_front() {
                Some(req) => req,
                None => match self.rx.recv().await {
                    Some(req) => req,
                    None => break,
                },
            };
            self.run_one(req).await;
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
        }
    }

    async fn run_one(&mut self, req: Request) {
        let argv = gather_args(&self.params, self.datadir.as_deref(), req.cmd, &req.args);
        let cmd = argv.join(" ");
        debug!(cmd = %cmd, "starting");

        let fin = run_command(argv, cmd).await;

        if !req.nonzero_exit_ok && fin.status != 0 {
            // Allow 60 seconds of spurious errors, eg. reorg.
            warn!(cmd = %fin.cmd, status = fin.status, "exited with nonzero status");
            if self.error_count == 0 {
                self.first_error = Some(Instant::now());
            }
            let first = self.first_error.expect("first_error set at streak start");
            if first.elapsed() > ERROR_STREAK_LIMIT {
                fatal(
                    &fin.cmd,
                    &format!(
                        "exited {} (after {} other errors) '{}'",
                        fin.status,
                        self.error_count,
                        output_tail(&fin.output)
                    ),
                );
            }
            self.error_count += 1;
        }
        if fin.status == 0 {
            self.error_count = 0;
        }

        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        if !req.nonzero_exit_ok && fin.status != 0 {
            // Absorbed into the streak; the result is not processed.
            return;
        }
        if let Some(anchor) = &req.anchor {
            if anchor.upgrade().is_none() {
                debug!(cmd = %fin.cmd, "caller gone, suppressing callback");
                return;
            }
        }

        self.db.begin_transaction();
        (req.process)(self, fin);
        self.db.commit_transaction();
    }
}

/// Spawn one CLI invocation, drain its output, and reap it.
///
/// stdin is /dev/null; stdout and stderr are both captured and combined
/// (stderr after stdout) so error text reaches callbacks and fatal
/// reports.
async fn run_command(argv: Vec<String>, cmd: String) -> Finished {
    let child = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(e) => fatal(&cmd, &format!("exec failed: {e}")),
    };

    let out = match child.wait_with_output().await {
        Ok(out) => out,
        Err(e) => fatal(&cmd, &format!("reading output failed: {e}")),
    };

    let status = match out.status.code() {
        Some(code) => code,
        None => fatal(
            &cmd,
            &format!("died with signal {}", out.status.signal().unwrap_or(0)),
        ),
    };

    let mut output = out.stdout;
    output.extend_from_slice(&out.stderr);
    Finished {
        status,
        output,
        cmd,
    }
}

fn gather_args(
    params: &ChainParams,
    datadir: Option<&Path>,
    cmd: &str,
    args: &[String],
) -> Vec<String> {
    let mut argv = Vec::with_capacity(args.len() + 4);
    argv.push(params.cli.clone());
    if let Some(extra) = &params.cli_args {
        argv.push(extra.clone());
    }
    if let Some(dir) = datadir {
        argv.push(format!("-datadir={}", dir.display()));
    }
    argv.push(cmd.to_owned());
    argv.extend_from_slice(args);
    argv
}

fn output_tail(output: &[u8]) -> String {
    let start = output.len().saturating_sub(FATAL_TAIL_BYTES);
    String::from_utf8_lossy(&output[start..]).into_owned()
}

/// A broken or incompatible CLI is unrecoverable: log it and take the
/// dispatcher down.
fn fatal(cmd: &str, msg: &str) -> ! {
    error!(cmd = %cmd, "{msg}");
    panic!("{cmd}: {msg}");
}
