//! Granite WAL writer: append path, group commit and deferred fsync
//!
//! All writes to the log file happen on one dedicated worker thread. Callers
//! hand it fully encoded frames through a FIFO channel. LSN assignment and
//! channel submission happen together under the append lock, so the order of
//! frames in the file is exactly LSN order and byte offsets can be reserved
//! up front.
//!
//! ## Deferred Fsync with Commit Latches
//!
//! - Frames are written to the OS buffer as soon as the worker receives them
//! - Fsyncs happen every `fsync_interval_ms`, when `max_unfsynced_bytes` is
//!   reached, or when a caller forces one with [`WalWriter::flush`]
//! - A committing transaction blocks on a commit latch
//!   ([`WalWriter::wait_for_durable`]) until an fsync covers its COMMIT LSN,
//!   so many commits can share one fsync
//!
//! With `fsync_interval_ms == 0` every batch is fsynced before the writers
//! are acknowledged.
//!
//! A failed write or fsync poisons the writer. Every waiter and every later
//! append is refused with an I/O error; the engine never keeps accepting
//! writes it cannot record durably.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::codec::encode_frame;
use super::log::{LogOperation, LogRecord};
use super::types::{Lsn, TxnId};
use crate::error::{GraniteError, Result};

/// Configuration for the Granite WAL's group-commit and deferred fsync behavior.
///
/// # Presets
///
/// - [`GraniteConfig::default()`] - Balanced (10ms fsync interval)
/// - [`GraniteConfig::synchronous()`] - Fsync every batch, lowest commit latency
/// - [`GraniteConfig::high_throughput()`] - Larger batches, longer fsync interval
#[derive(Debug, Clone)]
pub struct GraniteConfig {
    /// Maximum number of frames the worker writes per batch
    pub max_batch_size: usize,
    /// Log growth (bytes) after which commits trigger an automatic checkpoint.
    /// 0 disables automatic checkpoints.
    pub checkpoint_threshold_bytes: u64,
    /// How often to fsync the WAL file (milliseconds). 0 = fsync every batch.
    pub fsync_interval_ms: u64,
    /// Maximum bytes written but not fsynced before forcing an fsync
    pub max_unfsynced_bytes: usize,
    /// How long a commit waits on its latch before giving up (milliseconds)
    pub durable_wait_timeout_ms: u64,
}

impl Default for GraniteConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 128,
            checkpoint_threshold_bytes: 10 * 1024 * 1024, // 10 MB
            fsync_interval_ms: 10,
            max_unfsynced_bytes: 1 << 20, // 1 MB
            durable_wait_timeout_ms: 30_000,
        }
    }
}

impl GraniteConfig {
    /// Fsync every batch before acknowledging it
    pub fn synchronous() -> Self {
        Self {
            fsync_interval_ms: 0,
            ..Default::default()
        }
    }

    /// Optimized for throughput at the cost of commit latency
    pub fn high_throughput() -> Self {
        Self {
            max_batch_size: 512,
            fsync_interval_ms: 100,
            max_unfsynced_bytes: 4 << 20, // 4 MB
            ..Default::default()
        }
    }
}

/// Where an appended record landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalPosition {
    /// LSN assigned to the record
    pub lsn: Lsn,
    /// Byte offset of the record's frame
    pub offset: u64,
    /// Frame length in bytes
    pub len: u64,
}

/// Shared state for commit latches - lets transactions wait for durability
pub struct FsyncState {
    /// Highest LSN durably fsynced to disk
    durable_lsn: AtomicU64,
    /// Highest LSN written (but not necessarily fsynced)
    written_lsn: AtomicU64,
    /// Signalled after every fsync, failure and shutdown
    condvar: Condvar,
    /// Failure that poisoned the writer, if any. Also the condvar's mutex.
    failure: Mutex<Option<String>>,
    /// Set once the worker has exited
    shutdown: AtomicU64,
}

impl FsyncState {
    fn new() -> Self {
        Self {
            durable_lsn: AtomicU64::new(0),
            written_lsn: AtomicU64::new(0),
            condvar: Condvar::new(),
            failure: Mutex::new(None),
            shutdown: AtomicU64::new(0),
        }
    }

    /// Get the current durable LSN
    pub fn durable_lsn(&self) -> Lsn {
        self.durable_lsn.load(Ordering::Acquire)
    }

    /// Get the current written (but not necessarily durable) LSN
    pub fn written_lsn(&self) -> Lsn {
        self.written_lsn.load(Ordering::Acquire)
    }

    /// The failure that poisoned the writer, if any
    pub fn failure(&self) -> Option<String> {
        match self.failure.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => Some("FsyncState mutex poisoned".to_string()),
        }
    }

    /// Wait until the given LSN is durable (fsynced).
    pub fn wait_for_durable(&self, target_lsn: Lsn, timeout: Duration) -> Result<()> {
        // Fast path: already durable
        if self.durable_lsn() >= target_lsn {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self
            .failure
            .lock()
            .map_err(|_| GraniteError::io_other("FsyncState mutex poisoned"))?;

        loop {
            if self.durable_lsn() >= target_lsn {
                return Ok(());
            }
            if let Some(reason) = guard.as_ref() {
                return Err(GraniteError::io_other(format!("WAL writer failed: {}", reason)));
            }
            if self.shutdown.load(Ordering::Acquire) != 0 {
                return Err(GraniteError::io_other("WAL worker shutdown during wait"));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GraniteError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!(
                        "Timeout waiting for LSN {} to become durable (current: {})",
                        target_lsn,
                        self.durable_lsn()
                    ),
                )));
            }

            guard = self
                .condvar
                .wait_timeout(guard, remaining)
                .map_err(|_| GraniteError::io_other("FsyncState condvar wait failed"))?
                .0;
        }
    }

    /// Signal that fsync has completed up to the given LSN and wake waiters
    fn signal_durable(&self, lsn: Lsn) {
        self.durable_lsn.fetch_max(lsn, Ordering::AcqRel);
        // Take the mutex so a waiter between its check and its wait cannot miss this
        drop(self.failure.lock());
        self.condvar.notify_all();
    }

    /// Update the written LSN (called after write, before fsync)
    fn update_written(&self, lsn: Lsn) {
        self.written_lsn.fetch_max(lsn, Ordering::AcqRel);
    }

    /// Poison the writer and wake every waiter
    fn fail(&self, reason: String) {
        if let Ok(mut guard) = self.failure.lock() {
            if guard.is_none() {
                log::error!("Granite WAL writer poisoned: {}", reason);
                *guard = Some(reason);
            }
        }
        self.condvar.notify_all();
    }

    fn signal_shutdown(&self) {
        self.shutdown.store(1, Ordering::Release);
        drop(self.failure.lock());
        self.condvar.notify_all();
    }
}

/// A frame waiting to be written by the worker
struct WriteRequest {
    lsn: Lsn,
    frame: Vec<u8>,
    responder: mpsc::SyncSender<Result<()>>,
}

/// Control messages for the WAL worker thread
enum WalMessage {
    Write(WriteRequest),
    /// Cut the file back to the given length (torn-tail repair)
    TruncateTo(u64, mpsc::SyncSender<Result<()>>),
    /// Force an immediate fsync; answered with the durable LSN
    ForceSync(mpsc::SyncSender<Result<Lsn>>),
    Shutdown,
}

/// Next LSN and byte offset, guarded together so they advance as one step
struct AppendCursor {
    next_lsn: Lsn,
    next_offset: u64,
}

/// Append-only writer for the log file. Exclusively owns the write handle.
pub struct WalWriter {
    path: PathBuf,
    config: GraniteConfig,
    sender: mpsc::SyncSender<WalMessage>,
    fsync_state: Arc<FsyncState>,
    cursor: Mutex<AppendCursor>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WalWriter {
    /// Open (or create) the log file and spawn the worker thread.
    ///
    /// LSNs start at 1 until [`WalWriter::resume`] seeds them from recovery.
    pub fn open(path: PathBuf, config: GraniteConfig) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let file_len = file.metadata()?.len();

        let (tx, rx) = mpsc::sync_channel::<WalMessage>(10_000);
        let fsync_state = Arc::new(FsyncState::new());

        let worker_config = config.clone();
        let worker_state = Arc::clone(&fsync_state);
        let worker = std::thread::Builder::new()
            .name("granite-wal".to_string())
            .spawn(move || wal_worker_thread(file, rx, worker_config, worker_state))?;

        log::debug!("Opened WAL {} ({} bytes)", path.display(), file_len);

        Ok(Self {
            path,
            config,
            sender: tx,
            fsync_state,
            cursor: Mutex::new(AppendCursor {
                next_lsn: 1,
                next_offset: file_len,
            }),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_cursor(&self) -> Result<std::sync::MutexGuard<'_, AppendCursor>> {
        self.cursor
            .lock()
            .map_err(|_| GraniteError::io_other("WAL append lock poisoned"))
    }

    /// The failure that poisoned the writer, if any
    pub fn failure(&self) -> Option<String> {
        self.fsync_state.failure()
    }

    #[cfg(test)]
    pub(crate) fn poison(&self, reason: &str) {
        self.fsync_state.fail(reason.to_string());
    }

    fn refuse_if_poisoned(&self) -> Result<()> {
        match self.failure() {
            Some(reason) => Err(GraniteError::io_other(format!("WAL writer failed: {}", reason))),
            None => Ok(()),
        }
    }

    /// Append a record and wait until the worker has written it.
    ///
    /// The record is not necessarily durable on return; use
    /// [`WalWriter::wait_for_durable`] or [`WalWriter::flush`] for that.
    pub fn append(&self, txn_id: TxnId, op: LogOperation) -> Result<WalPosition> {
        self.refuse_if_poisoned()?;

        let (tx, rx) = mpsc::sync_channel(1);
        let position = {
            let mut cursor = self.lock_cursor()?;
            let record = LogRecord {
                lsn: cursor.next_lsn,
                txn_id,
                op,
                timestamp: timestamp(),
            };
            let frame = encode_frame(&record)?;
            let position = WalPosition {
                lsn: record.lsn,
                offset: cursor.next_offset,
                len: frame.len() as u64,
            };

            self.sender
                .send(WalMessage::Write(WriteRequest {
                    lsn: record.lsn,
                    frame,
                    responder: tx,
                }))
                .map_err(|e| GraniteError::io_other(format!("WAL worker channel closed: {}", e)))?;

            cursor.next_lsn += 1;
            cursor.next_offset += position.len;
            position
        };

        rx.recv()
            .map_err(|e| GraniteError::io_other(format!("WAL worker response lost: {}", e)))??;
        Ok(position)
    }

    /// Durability barrier: returns once every record appended before the
    /// call is fsynced. Returns the durable LSN.
    pub fn flush(&self) -> Result<Lsn> {
        self.refuse_if_poisoned()?;

        let (tx, rx) = mpsc::sync_channel(1);
        self.sender
            .send(WalMessage::ForceSync(tx))
            .map_err(|e| GraniteError::io_other(format!("WAL worker channel closed: {}", e)))?;

        rx.recv()
            .map_err(|e| GraniteError::io_other(format!("WAL force sync response lost: {}", e)))?
    }

    /// Block on the commit latch until `lsn` is durable
    pub fn wait_for_durable(&self, lsn: Lsn) -> Result<()> {
        self.fsync_state
            .wait_for_durable(lsn, Duration::from_millis(self.config.durable_wait_timeout_ms))
    }

    /// Highest LSN known to be fsynced
    pub fn durable_lsn(&self) -> Lsn {
        self.fsync_state.durable_lsn()
    }

    /// Highest LSN handed out so far (0 if none)
    pub fn last_lsn(&self) -> Result<Lsn> {
        Ok(self.lock_cursor()?.next_lsn - 1)
    }

    /// Byte length of the log including frames not yet written
    pub fn end_offset(&self) -> Result<u64> {
        Ok(self.lock_cursor()?.next_offset)
    }

    /// Seed the writer from what recovery found on disk: the next LSN to
    /// assign and the length of the intact prefix of the file. Anything
    /// after `valid_len` (a torn final frame) is cut off.
    pub fn resume(&self, next_lsn: Lsn, valid_len: u64) -> Result<()> {
        let mut cursor = self.lock_cursor()?;
        if cursor.next_offset > valid_len {
            log::warn!(
                "Truncating torn WAL tail: {} -> {} bytes",
                cursor.next_offset,
                valid_len
            );
            let (tx, rx) = mpsc::sync_channel(1);
            self.sender
                .send(WalMessage::TruncateTo(valid_len, tx))
                .map_err(|e| GraniteError::io_other(format!("WAL worker channel closed: {}", e)))?;
            rx.recv()
                .map_err(|e| GraniteError::io_other(format!("WAL truncate response lost: {}", e)))??;
        }
        cursor.next_lsn = next_lsn.max(1);
        cursor.next_offset = valid_len;
        // Everything recovery read back is already on disk
        self.fsync_state.update_written(cursor.next_lsn - 1);
        self.fsync_state.signal_durable(cursor.next_lsn - 1);
        Ok(())
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        let _ = self.sender.send(WalMessage::Shutdown);
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Current timestamp in milliseconds
fn timestamp() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_millis() as u64,
        Err(_) => 0,
    }
}

/// Messages collected for one worker iteration
#[derive(Default)]
struct Pending {
    writes: Vec<WriteRequest>,
    truncates: Vec<(u64, mpsc::SyncSender<Result<()>>)>,
    force_syncs: Vec<mpsc::SyncSender<Result<Lsn>>>,
    shutdown: bool,
}

impl Pending {
    fn push(&mut self, msg: WalMessage) {
        match msg {
            WalMessage::Write(req) => self.writes.push(req),
            WalMessage::TruncateTo(len, responder) => self.truncates.push((len, responder)),
            WalMessage::ForceSync(responder) => self.force_syncs.push(responder),
            WalMessage::Shutdown => self.shutdown = true,
        }
    }
}

/// WAL worker thread - batches writes and performs deferred fsync
fn wal_worker_thread(
    mut file: File,
    rx: mpsc::Receiver<WalMessage>,
    config: GraniteConfig,
    fsync_state: Arc<FsyncState>,
) {
    let fsync_interval = Duration::from_millis(config.fsync_interval_ms);
    let deferred_fsync = config.fsync_interval_ms > 0;
    let max_batch_size = config.max_batch_size.max(1);

    let mut last_fsync = Instant::now();
    let mut unfsynced_bytes: usize = 0;
    let mut max_written_lsn: Lsn = 0;

    loop {
        let mut pending = Pending::default();

        // Only wake on a timer while there is something left to fsync
        if deferred_fsync && unfsynced_bytes > 0 {
            let remaining = fsync_interval.saturating_sub(last_fsync.elapsed());
            match rx.recv_timeout(remaining) {
                Ok(msg) => pending.push(msg),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => pending.shutdown = true,
            }
        } else {
            match rx.recv() {
                Ok(msg) => pending.push(msg),
                Err(_) => pending.shutdown = true,
            }
        }

        // Drain whatever else is already queued
        while pending.writes.len() < max_batch_size && !pending.shutdown {
            match rx.try_recv() {
                Ok(msg) => pending.push(msg),
                Err(_) => break,
            }
        }

        if !pending.writes.is_empty() {
            let batch = std::mem::take(&mut pending.writes);
            let batch_lsn = batch.iter().map(|r| r.lsn).max().unwrap_or(0);

            let result = match fsync_state.failure() {
                Some(reason) => Err(format!("WAL writer failed: {}", reason)),
                None => write_frames(&mut file, &batch).map_err(|e| e.to_string()),
            };

            let result = result.and_then(|bytes_written| {
                max_written_lsn = max_written_lsn.max(batch_lsn);
                fsync_state.update_written(max_written_lsn);
                unfsynced_bytes += bytes_written;

                if !deferred_fsync {
                    file.sync_data().map_err(|e| e.to_string())?;
                    fsync_state.signal_durable(max_written_lsn);
                    unfsynced_bytes = 0;
                    last_fsync = Instant::now();
                }
                if batch.len() > 1 {
                    log::debug!("WAL batch written: {} records, {} bytes", batch.len(), bytes_written);
                }
                Ok(())
            });

            match result {
                Ok(()) => {
                    for req in batch {
                        let _ = req.responder.send(Ok(()));
                    }
                }
                Err(msg) => {
                    fsync_state.fail(msg.clone());
                    for req in batch {
                        let _ = req.responder.send(Err(GraniteError::io_other(msg.clone())));
                    }
                }
            }
        }

        let force_requested = !pending.force_syncs.is_empty();
        let truncate_requested = !pending.truncates.is_empty();
        let time_triggered = deferred_fsync && last_fsync.elapsed() >= fsync_interval;
        let size_triggered = unfsynced_bytes >= config.max_unfsynced_bytes;

        if unfsynced_bytes > 0
            && fsync_state.failure().is_none()
            && (time_triggered || size_triggered || force_requested || truncate_requested || pending.shutdown)
        {
            match file.sync_data() {
                Ok(()) => {
                    fsync_state.signal_durable(max_written_lsn);
                    log::debug!(
                        "Granite fsync complete: LSN {}, {} bytes (trigger: {})",
                        max_written_lsn,
                        unfsynced_bytes,
                        if force_requested {
                            "force"
                        } else if size_triggered {
                            "size"
                        } else if time_triggered {
                            "time"
                        } else {
                            "shutdown"
                        }
                    );
                    unfsynced_bytes = 0;
                    last_fsync = Instant::now();
                }
                Err(e) => fsync_state.fail(format!("fsync failed: {}", e)),
            }
        }

        for responder in pending.force_syncs {
            let reply = match fsync_state.failure() {
                Some(reason) => Err(GraniteError::io_other(format!("WAL writer failed: {}", reason))),
                None => Ok(fsync_state.durable_lsn()),
            };
            let _ = responder.send(reply);
        }

        for (len, responder) in pending.truncates {
            let _ = responder.send(truncate_to(&mut file, len));
        }

        if pending.shutdown {
            fsync_state.signal_shutdown();
            log::debug!("Granite WAL worker shutting down");
            break;
        }
    }
}

/// Write a batch of frames without fsync. Returns the number of bytes written.
fn write_frames(file: &mut File, batch: &[WriteRequest]) -> std::io::Result<usize> {
    let mut total_bytes = 0;
    for req in batch {
        file.write_all(&req.frame)?;
        total_bytes += req.frame.len();
    }
    file.flush()?;
    Ok(total_bytes)
}

fn truncate_to(file: &mut File, len: u64) -> Result<()> {
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::granite::log::Mutation;
    use crate::granite::reader::WalReader;
    use std::collections::HashSet;
    use std::thread;

    fn insert(table: &str, row_id: u64) -> LogOperation {
        LogOperation::Operation(Mutation::Insert {
            table: table.to_string(),
            row_id,
            values: vec![],
        })
    }

    #[test]
    fn test_granite_config_default() {
        let config = GraniteConfig::default();
        assert_eq!(config.max_batch_size, 128);
        assert_eq!(config.checkpoint_threshold_bytes, 10 * 1024 * 1024);
        assert_eq!(config.fsync_interval_ms, 10);
        assert_eq!(config.max_unfsynced_bytes, 1 << 20);
    }

    #[test]
    fn test_granite_config_presets() {
        assert_eq!(GraniteConfig::synchronous().fsync_interval_ms, 0);
        let config = GraniteConfig::high_throughput();
        assert_eq!(config.fsync_interval_ms, 100);
        assert_eq!(config.max_batch_size, 512);
    }

    #[test]
    fn test_fsync_state_only_moves_forward() {
        let state = FsyncState::new();
        state.update_written(5);
        state.update_written(3);
        assert_eq!(state.written_lsn(), 5);

        state.signal_durable(10);
        state.signal_durable(3);
        assert_eq!(state.durable_lsn(), 10);
    }

    #[test]
    fn test_fsync_state_wait_already_durable() {
        let state = FsyncState::new();
        state.signal_durable(10);
        assert!(state.wait_for_durable(5, Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn test_fsync_state_wait_timeout() {
        let state = FsyncState::new();
        let err = state.wait_for_durable(10, Duration::from_millis(50)).unwrap_err();
        assert!(err.to_string().contains("Timeout"));
    }

    #[test]
    fn test_fsync_state_wait_signaled() {
        let state = Arc::new(FsyncState::new());
        let state_clone = Arc::clone(&state);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            state_clone.signal_durable(10);
        });

        let result = state.wait_for_durable(10, Duration::from_millis(2000));
        handle.join().unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_fsync_state_failure_wakes_waiters() {
        let state = Arc::new(FsyncState::new());
        let state_clone = Arc::clone(&state);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            state_clone.fail("disk full".to_string());
        });

        let err = state.wait_for_durable(10, Duration::from_secs(5)).unwrap_err();
        handle.join().unwrap();
        assert!(err.to_string().contains("disk full"));
        assert_eq!(state.failure().as_deref(), Some("disk full"));
    }

    #[test]
    fn test_append_assigns_sequential_lsns_and_offsets() {
        let temp_dir = tempfile::tempdir().unwrap();
        let wal = WalWriter::open(temp_dir.path().join("wal.log"), GraniteConfig::synchronous()).unwrap();

        let first = wal.append(1, LogOperation::Begin).unwrap();
        let second = wal.append(1, insert("t", 1)).unwrap();
        let third = wal.append(1, LogOperation::Commit).unwrap();

        assert_eq!((first.lsn, second.lsn, third.lsn), (1, 2, 3));
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, first.len);
        assert_eq!(third.offset, first.len + second.len);
        assert_eq!(wal.last_lsn().unwrap(), 3);
        assert_eq!(wal.end_offset().unwrap(), third.offset + third.len);
    }

    #[test]
    fn test_synchronous_mode_is_durable_on_append() {
        let temp_dir = tempfile::tempdir().unwrap();
        let wal = WalWriter::open(temp_dir.path().join("wal.log"), GraniteConfig::synchronous()).unwrap();

        let pos = wal.append(1, LogOperation::Begin).unwrap();
        assert!(wal.durable_lsn() >= pos.lsn);
    }

    #[test]
    fn test_flush_forces_deferred_fsync() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = GraniteConfig {
            fsync_interval_ms: 60_000,
            ..Default::default()
        };
        let wal = WalWriter::open(temp_dir.path().join("wal.log"), config).unwrap();

        let pos = wal.append(1, LogOperation::Begin).unwrap();
        let durable = wal.flush().unwrap();
        assert!(durable >= pos.lsn);
        assert!(wal.durable_lsn() >= pos.lsn);
    }

    #[test]
    fn test_deferred_fsync_releases_commit_latch() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = GraniteConfig {
            fsync_interval_ms: 20,
            ..Default::default()
        };
        let wal = WalWriter::open(temp_dir.path().join("wal.log"), config).unwrap();

        let pos = wal.append(1, LogOperation::Commit).unwrap();
        wal.wait_for_durable(pos.lsn).unwrap();
        assert!(wal.durable_lsn() >= pos.lsn);
    }

    #[test]
    fn test_size_triggered_fsync() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = GraniteConfig {
            fsync_interval_ms: 60_000,
            max_unfsynced_bytes: 100,
            ..Default::default()
        };
        let wal = WalWriter::open(temp_dir.path().join("wal.log"), config).unwrap();

        let mut last = 0;
        for i in 1..=10 {
            last = wal.append(i, insert("big_table", i)).unwrap().lsn;
        }
        wal.wait_for_durable(last - 1).unwrap();
        assert!(wal.durable_lsn() > 0);
    }

    #[test]
    fn test_concurrent_appends_are_gap_free_and_in_file_order() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("wal.log");
        let config = GraniteConfig {
            fsync_interval_ms: 5,
            ..Default::default()
        };
        let wal = Arc::new(WalWriter::open(path.clone(), config).unwrap());

        let mut handles = Vec::new();
        for t in 0..8u64 {
            let wal = Arc::clone(&wal);
            handles.push(thread::spawn(move || {
                (0..50)
                    .map(|i| wal.append(t, insert(&format!("table_{}", t), i)).unwrap().lsn)
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for h in handles {
            for lsn in h.join().unwrap() {
                assert!(seen.insert(lsn), "LSN {} handed out twice", lsn);
            }
        }
        assert_eq!(seen.len(), 400);
        assert_eq!(*seen.iter().max().unwrap(), 400);

        wal.flush().unwrap();
        let scan = WalReader::open(&path).unwrap().read_to_end().unwrap();
        let lsns: Vec<Lsn> = scan.records.iter().map(|(_, r)| r.lsn).collect();
        assert_eq!(lsns, (1..=400).collect::<Vec<_>>());
    }

    #[test]
    fn test_resume_truncates_torn_tail_and_continues_lsns() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("wal.log");

        let valid_len = {
            let wal = WalWriter::open(path.clone(), GraniteConfig::synchronous()).unwrap();
            wal.append(1, LogOperation::Begin).unwrap();
            wal.end_offset().unwrap()
        };
        // Half-written frame from a crash
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0x20, 0x00, 0x00]).unwrap();
        }

        let wal = WalWriter::open(path.clone(), GraniteConfig::synchronous()).unwrap();
        wal.resume(2, valid_len).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), valid_len);
        assert_eq!(wal.durable_lsn(), 1);

        let pos = wal.append(1, LogOperation::Commit).unwrap();
        assert_eq!(pos.lsn, 2);
        assert_eq!(pos.offset, valid_len);
    }
}
