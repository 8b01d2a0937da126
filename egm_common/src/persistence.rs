//! Transactional integer slot store.
//!
//! A [`PersistentStore`] holds named blocks of `i64` slots. All mutation
//! goes through a [`Transaction`]: writes are buffered, applied atomically
//! on [`Transaction::commit`] and, when the store is file-backed, written to
//! disk before the in-memory image changes. Completion callbacks registered
//! on a transaction run exactly once with `true` after a successful commit
//! or `false` if the transaction fails or is dropped uncommitted.
//!
//! There is no hidden ambient transaction: a caller nested inside a larger
//! operation passes its open `&mut Transaction` down explicitly.
//!
//! The on-disk image is encoded with bincode and replaced atomically
//! (write to a temporary file, fsync, rename).

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised by the slot store.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Backing storage cannot be created or opened.
    #[error("Persistent storage unavailable: {0}")]
    Unavailable(String),

    /// No block with this name.
    #[error("Block not found: {0}")]
    BlockNotFound(String),

    /// Index outside the block.
    #[error("Slot {index} out of range for block '{block}' ({slots} slots)")]
    SlotOutOfRange {
        /// Block name.
        block: String,
        /// Requested index.
        index: usize,
        /// Block size.
        slots: usize,
    },

    /// Block already exists with more slots than requested.
    #[error("Block '{block}' has {existing} slots, cannot shrink to {requested}")]
    BlockSizeMismatch {
        /// Block name.
        block: String,
        /// Existing size.
        existing: usize,
        /// Requested size.
        requested: usize,
    },

    /// An add would leave the slot outside the `i64` range.
    #[error("Slot {index} of block '{block}' would overflow")]
    Overflow {
        /// Block name.
        block: String,
        /// Slot index.
        index: usize,
    },

    /// File system error.
    #[error("I/O error on {path:?}: {source}")]
    Io {
        /// Affected path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Encoding the store image failed.
    #[error("Failed to encode store: {0}")]
    Encode(String),

    /// Decoding the store image failed.
    #[error("Failed to decode store: {0}")]
    Decode(String),
}

/// On-disk image of all blocks.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
struct StoreImage {
    version: u32,
    blocks: BTreeMap<String, Vec<i64>>,
    saved_at: u64,
}

impl StoreImage {
    const CURRENT_VERSION: u32 = 1;

    fn new() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            blocks: BTreeMap::new(),
            saved_at: 0,
        }
    }
}

/// Handle to a named block, validated at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHandle {
    name: Arc<str>,
    slots: usize,
}

impl BlockHandle {
    /// Block name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of slots.
    pub fn slots(&self) -> usize {
        self.slots
    }

    fn check(&self, index: usize) -> Result<(), PersistenceError> {
        if index >= self.slots {
            return Err(PersistenceError::SlotOutOfRange {
                block: self.name.to_string(),
                index,
                slots: self.slots,
            });
        }
        Ok(())
    }
}

/// Durable store of named integer blocks.
pub struct PersistentStore {
    path: Option<PathBuf>,
    image: Mutex<StoreImage>,
}

impl PersistentStore {
    /// Create a store that lives only in memory.
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            path: None,
            image: Mutex::new(StoreImage::new()),
        })
    }

    /// Backing file, `None` for an in-memory store.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Open (or create) a file-backed store.
    ///
    /// # Errors
    /// `Unavailable` if the parent directory cannot be created, `Decode` if
    /// an existing file is corrupt or of an unknown version.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>, PersistenceError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                PersistenceError::Unavailable(format!("cannot create {:?}: {}", parent, e))
            })?;
        }

        let image = if path.exists() {
            let file = File::open(&path).map_err(|source| PersistenceError::Io {
                path: path.clone(),
                source,
            })?;
            let image: StoreImage = bincode::deserialize_from(BufReader::new(file))
                .map_err(|e| PersistenceError::Decode(e.to_string()))?;
            if image.version != StoreImage::CURRENT_VERSION {
                return Err(PersistenceError::Decode(format!(
                    "store version {} differs from current {}",
                    image.version,
                    StoreImage::CURRENT_VERSION
                )));
            }
            info!(
                "Loaded {} persisted blocks from {:?} (saved at {})",
                image.blocks.len(),
                path,
                image.saved_at
            );
            image
        } else {
            debug!("Store file {:?} does not exist, starting fresh", path);
            StoreImage::new()
        };

        Ok(Arc::new(Self {
            path: Some(path),
            image: Mutex::new(image),
        }))
    }

    /// Create a block of `slots` zeroed slots, or reuse an existing one.
    ///
    /// An existing smaller block is grown with zeroed slots; shrinking is
    /// refused so persisted counts are never dropped silently.
    pub fn create_block(&self, name: &str, slots: usize) -> Result<BlockHandle, PersistenceError> {
        let mut image = self.image.lock();
        match image.blocks.get(name).map(Vec::len) {
            Some(existing) if existing == slots => {}
            Some(existing) if existing > slots => {
                return Err(PersistenceError::BlockSizeMismatch {
                    block: name.to_string(),
                    existing,
                    requested: slots,
                });
            }
            existing => {
                let mut next = image.clone();
                next.blocks.entry(name.to_string()).or_default().resize(slots, 0);
                self.flush(&mut next)?;
                *image = next;
                info!(
                    "Block '{}' ready with {} slots (was {:?})",
                    name, slots, existing
                );
            }
        }
        Ok(BlockHandle {
            name: Arc::from(name),
            slots,
        })
    }

    /// Look up an existing block.
    pub fn block(&self, name: &str) -> Result<BlockHandle, PersistenceError> {
        let image = self.image.lock();
        let slots = image
            .blocks
            .get(name)
            .map(Vec::len)
            .ok_or_else(|| PersistenceError::BlockNotFound(name.to_string()))?;
        Ok(BlockHandle {
            name: Arc::from(name),
            slots,
        })
    }

    /// Read the committed value of one slot.
    pub fn read(&self, block: &BlockHandle, index: usize) -> Result<i64, PersistenceError> {
        block.check(index)?;
        let image = self.image.lock();
        image
            .blocks
            .get(block.name())
            .and_then(|slots| slots.get(index).copied())
            .ok_or_else(|| PersistenceError::BlockNotFound(block.name().to_string()))
    }

    /// Start a transaction.
    pub fn begin(self: &Arc<Self>) -> Transaction {
        Transaction {
            store: Arc::clone(self),
            writes: Vec::new(),
            callbacks: Vec::new(),
            finished: false,
        }
    }

    /// Zero every slot of every block.
    pub fn clear(&self) -> Result<(), PersistenceError> {
        let mut image = self.image.lock();
        let mut next = image.clone();
        for slots in next.blocks.values_mut() {
            slots.iter_mut().for_each(|s| *s = 0);
        }
        self.flush(&mut next)?;
        *image = next;
        warn!("Persistent store cleared");
        Ok(())
    }

    fn apply(&self, writes: &[(BlockHandle, usize, SlotWrite)]) -> Result<(), PersistenceError> {
        let mut image = self.image.lock();
        let mut next = image.clone();
        for (block, index, write) in writes {
            let slot = next
                .blocks
                .get_mut(block.name())
                .and_then(|slots| slots.get_mut(*index))
                .ok_or_else(|| PersistenceError::BlockNotFound(block.name().to_string()))?;
            *slot = write.apply(*slot).ok_or_else(|| PersistenceError::Overflow {
                block: block.name().to_string(),
                index: *index,
            })?;
        }
        self.flush(&mut next)?;
        *image = next;
        Ok(())
    }

    fn flush(&self, image: &mut StoreImage) -> Result<(), PersistenceError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        image.saved_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let tmp = path.with_extension("tmp");
        let io_err = |source| PersistenceError::Io {
            path: tmp.clone(),
            source,
        };

        let file = File::create(&tmp).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, image)
            .map_err(|e| PersistenceError::Encode(e.to_string()))?;
        writer.flush().map_err(io_err)?;
        let file = writer
            .into_inner()
            .map_err(|e| io_err(e.into_error()))?;
        file.sync_all().map_err(io_err)?;

        fs::rename(&tmp, path).map_err(|source| PersistenceError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum SlotWrite {
    Set(i64),
    Add(i64),
}

impl SlotWrite {
    /// `None` on overflow.
    fn apply(self, current: i64) -> Option<i64> {
        match self {
            SlotWrite::Set(value) => Some(value),
            SlotWrite::Add(delta) => current.checked_add(delta),
        }
    }
}

type CompletionCallback = Box<dyn FnOnce(bool) + Send>;

/// Buffered atomic multi-slot write.
///
/// `add` records a delta applied against the value current at commit time,
/// so concurrent transactions adding to the same slot never lose updates.
pub struct Transaction {
    store: Arc<PersistentStore>,
    writes: Vec<(BlockHandle, usize, SlotWrite)>,
    callbacks: Vec<CompletionCallback>,
    finished: bool,
}

impl Transaction {
    /// Read a slot as this transaction would leave it.
    pub fn read(&self, block: &BlockHandle, index: usize) -> Result<i64, PersistenceError> {
        let base = self.store.read(block, index)?;
        self.writes
            .iter()
            .filter(|(b, i, _)| b == block && *i == index)
            .try_fold(base, |value, (_, _, write)| write.apply(value))
            .ok_or_else(|| PersistenceError::Overflow {
                block: block.name().to_string(),
                index,
            })
    }

    /// Overwrite a slot.
    pub fn write(
        &mut self,
        block: &BlockHandle,
        index: usize,
        value: i64,
    ) -> Result<(), PersistenceError> {
        block.check(index)?;
        self.writes.push((block.clone(), index, SlotWrite::Set(value)));
        Ok(())
    }

    /// Add `delta` to a slot.
    pub fn add(
        &mut self,
        block: &BlockHandle,
        index: usize,
        delta: i64,
    ) -> Result<(), PersistenceError> {
        block.check(index)?;
        self.writes.push((block.clone(), index, SlotWrite::Add(delta)));
        Ok(())
    }

    /// Register a callback run once the transaction completes.
    pub fn on_completed<F>(&mut self, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.callbacks.push(Box::new(callback));
    }

    /// Whether no write has been recorded.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Apply all writes atomically.
    ///
    /// Callbacks run after the store is updated, with `true` on success.
    pub fn commit(mut self) -> Result<(), PersistenceError> {
        let result = if self.writes.is_empty() {
            Ok(())
        } else {
            self.store.apply(&self.writes)
        };
        if let Err(e) = &result {
            warn!("Transaction commit failed: {}", e);
        }
        self.complete(result.is_ok());
        result
    }

    /// Discard all writes.
    pub fn rollback(mut self) {
        self.complete(false);
    }

    fn complete(&mut self, committed: bool) {
        self.finished = true;
        for callback in self.callbacks.drain(..) {
            callback(committed);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            self.complete(false);
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("writes", &self.writes)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[test]
    fn commit_applies_writes_atomically() {
        let store = PersistentStore::in_memory();
        let block = store.create_block("counters", 4).unwrap();

        let mut tx = store.begin();
        tx.write(&block, 0, 10).unwrap();
        tx.add(&block, 0, 5).unwrap();
        tx.add(&block, 3, -2).unwrap();
        assert_eq!(tx.read(&block, 0).unwrap(), 15);
        assert_eq!(store.read(&block, 0).unwrap(), 0);

        tx.commit().unwrap();
        assert_eq!(store.read(&block, 0).unwrap(), 15);
        assert_eq!(store.read(&block, 3).unwrap(), -2);
    }

    #[test]
    fn add_is_applied_against_value_at_commit() {
        let store = PersistentStore::in_memory();
        let block = store.create_block("ledger", 1).unwrap();

        let mut first = store.begin();
        first.add(&block, 0, 7).unwrap();
        let mut second = store.begin();
        second.add(&block, 0, 3).unwrap();

        second.commit().unwrap();
        first.commit().unwrap();
        assert_eq!(store.read(&block, 0).unwrap(), 10);
    }

    #[test]
    fn callbacks_report_commit_and_drop() {
        let store = PersistentStore::in_memory();
        let block = store.create_block("b", 1).unwrap();
        let committed = Arc::new(AtomicUsize::new(0));
        let aborted = Arc::new(AtomicUsize::new(0));

        let counter = |hits: &Arc<AtomicUsize>, want: bool| {
            let hits = hits.clone();
            move |ok: bool| {
                if ok == want {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            }
        };

        let mut tx = store.begin();
        tx.add(&block, 0, 1).unwrap();
        tx.on_completed(counter(&committed, true));
        tx.commit().unwrap();

        let mut tx = store.begin();
        tx.add(&block, 0, 1).unwrap();
        tx.on_completed(counter(&aborted, false));
        drop(tx);

        let mut tx = store.begin();
        tx.on_completed(counter(&aborted, false));
        tx.rollback();

        assert_eq!(committed.load(Ordering::SeqCst), 1);
        assert_eq!(aborted.load(Ordering::SeqCst), 2);
        assert_eq!(store.read(&block, 0).unwrap(), 1);
    }

    #[test]
    fn overflowing_add_fails_the_whole_commit() {
        let store = PersistentStore::in_memory();
        let block = store.create_block("ledger", 2).unwrap();
        let mut tx = store.begin();
        tx.write(&block, 0, i64::MAX - 1).unwrap();
        tx.commit().unwrap();

        let rolled_back = Arc::new(AtomicUsize::new(0));
        let hits = rolled_back.clone();
        let mut tx = store.begin();
        tx.add(&block, 1, 5).unwrap();
        tx.add(&block, 0, 2).unwrap();
        tx.on_completed(move |ok| {
            if !ok {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(matches!(
            tx.read(&block, 0),
            Err(PersistenceError::Overflow { index: 0, .. })
        ));
        assert!(matches!(
            tx.commit(),
            Err(PersistenceError::Overflow { index: 0, .. })
        ));

        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
        assert_eq!(store.read(&block, 0).unwrap(), i64::MAX - 1);
        assert_eq!(store.read(&block, 1).unwrap(), 0);
    }

    #[test]
    fn out_of_range_slot_is_rejected() {
        let store = PersistentStore::in_memory();
        let block = store.create_block("b", 2).unwrap();
        let mut tx = store.begin();
        assert!(matches!(
            tx.add(&block, 2, 1),
            Err(PersistenceError::SlotOutOfRange { index: 2, .. })
        ));
        assert!(matches!(
            store.block("missing"),
            Err(PersistenceError::BlockNotFound(_))
        ));
    }

    #[test]
    fn blocks_grow_but_never_shrink() {
        let store = PersistentStore::in_memory();
        let block = store.create_block("b", 2).unwrap();
        let mut tx = store.begin();
        tx.write(&block, 1, 42).unwrap();
        tx.commit().unwrap();

        let grown = store.create_block("b", 3).unwrap();
        assert_eq!(store.read(&grown, 1).unwrap(), 42);
        assert_eq!(store.read(&grown, 2).unwrap(), 0);

        assert!(matches!(
            store.create_block("b", 1),
            Err(PersistenceError::BlockSizeMismatch { .. })
        ));
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("meters.bin");

        {
            let store = PersistentStore::open(&path).unwrap();
            let block = store.create_block("committed", 2).unwrap();
            let mut tx = store.begin();
            tx.add(&block, 1, 250).unwrap();
            tx.commit().unwrap();
        }
        assert!(path.exists());

        let store = PersistentStore::open(&path).unwrap();
        let block = store.block("committed").unwrap();
        assert_eq!(store.read(&block, 1).unwrap(), 250);

        store.clear().unwrap();
        assert_eq!(store.read(&block, 1).unwrap(), 0);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meters.bin");
        fs::write(&path, b"not a store").unwrap();
        assert!(matches!(
            PersistentStore::open(&path),
            Err(PersistenceError::Decode(_))
        ));
    }
}
