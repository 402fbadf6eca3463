// action-ledger-rs/src/lib.rs
// Append-only history of terminal request records.
//
// - Append-only on disk
// - Each entry participates in a SHA-256 hash chain for tamper detection
// - At most one entry per request id, also across restarts
// - Public API:
//     * HistoryLedger::open / append / entries / verify
//     * MemoryHistory for tests and local-only runs
//     * HistorySink, the trait the dispatcher writes through

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared_types::RequestRecord;
use tracing::{debug, info, warn};

/// Result of an append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The request id was already recorded; nothing was written.
    Duplicate,
}

/// Destination for terminal records. Appends are at-most-once per request id.
pub trait HistorySink: Send + Sync {
    fn append(&self, record: &RequestRecord) -> Result<AppendOutcome, LedgerError>;

    fn contains(&self, request_id: &str) -> Result<bool, LedgerError>;

    fn entries(&self) -> Result<Vec<RequestRecord>, LedgerError>;
}

/// On-disk representation of a single entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerFileEntry {
    /// SHA-256(prev_hash || payload) to form a verifiable chain.
    hash_chain: [u8; 32],
    /// JSON bytes of the RequestRecord.
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct LedgerState {
    /// Last hash in the chain (or all zeros for an empty file).
    last_hash: [u8; 32],
    request_ids: HashSet<String>,
}

/// Hash-chained append-only ledger file.
#[derive(Debug)]
pub struct HistoryLedger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl HistoryLedger {
    /// Open (or create) the ledger at `path`.
    ///
    /// This scans the existing file to rebuild the hash chain head and the
    /// set of recorded request ids, failing on any chain mismatch.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut state = LedgerState::default();
        for entry in read_entries(&path)? {
            let record: RequestRecord = serde_json::from_slice(&entry.payload)?;
            state.request_ids.insert(record.request_id);
            state.last_hash = entry.hash_chain;
        }
        info!(
            path = %path.display(),
            entries = state.request_ids.len(),
            "history ledger opened"
        );

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the whole file and check every link of the chain.
    pub fn verify(&self) -> Result<usize, LedgerError> {
        read_entries(&self.path).map(|entries| entries.len())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LedgerState>, LedgerError> {
        self.state.lock().map_err(|_| LedgerError::Poisoned)
    }
}

impl HistorySink for HistoryLedger {
    fn append(&self, record: &RequestRecord) -> Result<AppendOutcome, LedgerError> {
        let mut state = self.lock()?;
        if state.request_ids.contains(&record.request_id) {
            debug!(request_id = %record.request_id, "already in history, skipping append");
            return Ok(AppendOutcome::Duplicate);
        }

        let payload = serde_json::to_vec(record)?;
        let hash_chain = chain_hash(&state.last_hash, &payload);
        let encoded = bincode::serialize(&LedgerFileEntry {
            hash_chain,
            payload,
        })?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        write_frame(&mut file, &encoded)?;

        state.last_hash = hash_chain;
        state.request_ids.insert(record.request_id.clone());
        Ok(AppendOutcome::Appended)
    }

    fn contains(&self, request_id: &str) -> Result<bool, LedgerError> {
        Ok(self.lock()?.request_ids.contains(request_id))
    }

    fn entries(&self) -> Result<Vec<RequestRecord>, LedgerError> {
        // Hold the lock so a concurrent append is not half-read.
        let _state = self.lock()?;
        read_entries(&self.path)?
            .into_iter()
            .map(|entry| serde_json::from_slice(&entry.payload).map_err(LedgerError::from))
            .collect()
    }
}

/// In-memory history with the same at-most-once semantics.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    records: Mutex<Vec<RequestRecord>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HistorySink for MemoryHistory {
    fn append(&self, record: &RequestRecord) -> Result<AppendOutcome, LedgerError> {
        let mut records = self.records.lock().map_err(|_| LedgerError::Poisoned)?;
        if records.iter().any(|r| r.request_id == record.request_id) {
            return Ok(AppendOutcome::Duplicate);
        }
        records.push(record.clone());
        Ok(AppendOutcome::Appended)
    }

    fn contains(&self, request_id: &str) -> Result<bool, LedgerError> {
        let records = self.records.lock().map_err(|_| LedgerError::Poisoned)?;
        Ok(records.iter().any(|r| r.request_id == request_id))
    }

    fn entries(&self) -> Result<Vec<RequestRecord>, LedgerError> {
        let records = self.records.lock().map_err(|_| LedgerError::Poisoned)?;
        Ok(records.clone())
    }
}

/// Errors produced by the ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] bincode::Error),

    #[error("record encoding error: {0}")]
    Record(#[from] serde_json::Error),

    #[error("ledger file truncated or corrupted at byte {0}")]
    Truncated(usize),

    #[error("ledger hash chain mismatch at entry {0}; possible tampering")]
    ChainMismatch(usize),

    #[error("ledger lock poisoned")]
    Poisoned,
}

// --- helpers ---------------------------------------------------------------

fn chain_hash(prev: &[u8; 32], payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev);
    hasher.update(payload);
    hasher.finalize().into()
}

/// Append `encoded` as one `u32 length + bytes` frame. A failed write is cut
/// back to the previous end of file so no torn frame is left behind.
fn write_frame(file: &mut File, encoded: &[u8]) -> Result<(), LedgerError> {
    let start = file.metadata()?.len();
    let mut frame = Vec::with_capacity(4 + encoded.len());
    frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
    frame.extend_from_slice(encoded);

    if let Err(err) = file.write_all(&frame).and_then(|()| file.flush()) {
        rollback(file, start);
        return Err(err.into());
    }
    Ok(())
}

fn rollback(file: &File, len: u64) {
    if let Err(err) = file.set_len(len) {
        warn!(error = %err, len, "could not discard partial ledger frame");
    }
}

/// Read every entry, validating that the chain is internally consistent.
///
/// If the file does not exist, returns no entries.
fn read_entries(path: &Path) -> Result<Vec<LedgerFileEntry>, LedgerError> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut file = OpenOptions::new().read(true).open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut cursor = 0usize;
    let mut last_hash = [0u8; 32];
    let mut entries = Vec::new();

    while cursor < buf.len() {
        let len_bytes: [u8; 4] = buf
            .get(cursor..cursor + 4)
            .and_then(|b| b.try_into().ok())
            .ok_or(LedgerError::Truncated(cursor))?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        let start = cursor + 4;

        let slice = buf
            .get(start..start + len)
            .ok_or(LedgerError::Truncated(cursor))?;
        cursor = start + len;

        let entry: LedgerFileEntry = bincode::deserialize(slice)?;
        if entry.hash_chain != chain_hash(&last_hash, &entry.payload) {
            return Err(LedgerError::ChainMismatch(entries.len()));
        }
        last_hash = entry.hash_chain;
        entries.push(entry);
    }

    Ok(entries)
}
