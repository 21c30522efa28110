//! JSON-lines dead letter storage.
//!
//! The file is an append-only log of records, one JSON object per line:
//!
//! ```text
//! {"op":"checkpoint","next_id":41}
//! {"op":"append","message":{"id":41,"payload":{...},"reason":"...",...}}
//! {"op":"remove","ids":[39,41]}
//! ```
//!
//! Every write is flushed and fsynced before the call returns; a write that
//! fails part way is truncated back off the log. On open the log is replayed
//! to rebuild the live set and any incomplete tail is cut off.
//!
//! Once removal tombstones outnumber live messages the log is compacted: live
//! messages are written to a sibling temp file, fsynced, and renamed over the
//! original, then the parent directory is fsynced. A checkpoint record at the
//! top of the compacted log keeps ids monotonic even when the highest id was
//! removed.
//!
//! The file handle sits behind an async mutex so concurrent appends are
//! serialized without blocking the runtime.

use bulwark_core::{
    DeadLetterDraft, DeadLetterMessage, DlqStorage, MessageId, StorageError, StorageFuture,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogRecord {
    Checkpoint { next_id: u64 },
    Append { message: DeadLetterMessage },
    Remove { ids: Vec<MessageId> },
}

#[derive(Debug)]
struct LogState {
    file: File,
    // Bytes of complete records in the file.
    len: u64,
    live: BTreeMap<MessageId, DeadLetterMessage>,
    next_id: u64,
    tombstones: usize,
    // Set when a partial write could not be rolled back; the log refuses writes after that.
    poisoned: Option<String>,
}

impl LogState {
    async fn write_record(&mut self, record: &LogRecord) -> Result<(), StorageError> {
        if let Some(reason) = &self.poisoned {
            return Err(StorageError::Io(format!("Dead letter log is unusable: {reason}")));
        }

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        match write_durably(&mut self.file, &line).await {
            Ok(()) => {
                self.len += byte_len(line.len());
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = truncate_durably(&mut self.file, self.len).await {
                    tracing::error!(
                        error = %rollback,
                        "Failed to roll back partial dead letter record"
                    );
                    self.poisoned = Some(rollback.to_string());
                }
                Err(e.into())
            }
        }
    }
}

/// Append-log [`DlqStorage`] backed by a local file.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl FileStorage {
    /// Open (or create) the log at `path` and rebuild the live set.
    ///
    /// Malformed lines are skipped with a warning. Anything after the last
    /// valid record, such as a half-written record left by a crash, is cut
    /// off before the log accepts new writes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the file cannot be read, repaired or
    /// created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let replay = Replay::scan(&path, &contents);

        let file_len = byte_len(contents.len());
        if replay.valid_len < file_len {
            tracing::warn!(
                path = %path.display(),
                discarded_bytes = file_len - replay.valid_len,
                "Truncating incomplete dead letter log tail"
            );
            let mut file = OpenOptions::new().write(true).open(&path).await?;
            truncate_durably(&mut file, replay.valid_len).await?;
        }

        let file = Self::open_for_append(&path).await?;
        tracing::info!(
            path = %path.display(),
            messages = replay.live.len(),
            next_id = replay.next_id,
            "Opened dead letter log"
        );

        Ok(Self {
            path,
            state: Mutex::new(LogState {
                file,
                len: replay.valid_len,
                live: replay.live,
                next_id: replay.next_id,
                tombstones: replay.tombstones,
                poisoned: None,
            }),
        })
    }

    /// Log file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the log so it holds only live messages.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the temp file cannot be written or renamed.
    /// The original log and the open handle are untouched on failure.
    pub async fn compact(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        self.compact_locked(&mut state).await
    }

    async fn open_for_append(path: &Path) -> Result<File, StorageError> {
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?)
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp_path = self.path.clone().into_os_string();
        temp_path.push(".compact");
        PathBuf::from(temp_path)
    }

    async fn compact_locked(&self, state: &mut LogState) -> Result<(), StorageError> {
        if let Some(reason) = &state.poisoned {
            return Err(StorageError::Io(format!("Dead letter log is unusable: {reason}")));
        }

        let mut buffer = serde_json::to_vec(&LogRecord::Checkpoint {
            next_id: state.next_id,
        })?;
        buffer.push(b'\n');
        for message in state.live.values() {
            serde_json::to_writer(
                &mut buffer,
                &LogRecord::Append {
                    message: message.clone(),
                },
            )?;
            buffer.push(b'\n');
        }

        // The temp handle becomes the append handle, so it exists before the swap.
        let temp_path = self.temp_path();
        let temp = match Self::write_compacted(&temp_path, &buffer).await {
            Ok(temp) => temp,
            Err(e) => {
                discard_temp(&temp_path).await;
                return Err(e);
            }
        };
        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            discard_temp(&temp_path).await;
            return Err(e.into());
        }

        state.file = temp;
        state.len = byte_len(buffer.len());
        tracing::debug!(
            path = %self.path.display(),
            live = state.live.len(),
            dropped_tombstones = state.tombstones,
            "Compacted dead letter log"
        );
        state.tombstones = 0;

        sync_parent_dir(&self.path).await?;
        Ok(())
    }

    async fn write_compacted(temp_path: &Path, buffer: &[u8]) -> Result<File, StorageError> {
        let mut temp = Self::open_for_append(temp_path).await?;
        temp.set_len(0).await?;
        write_durably(&mut temp, buffer).await?;
        Ok(temp)
    }
}

/// Live set rebuilt from the log contents.
struct Replay {
    live: BTreeMap<MessageId, DeadLetterMessage>,
    next_id: u64,
    tombstones: usize,
    // Offset just past the last record that parsed.
    valid_len: u64,
}

impl Replay {
    fn scan(path: &Path, contents: &[u8]) -> Self {
        let mut replay = Self {
            live: BTreeMap::new(),
            next_id: 1,
            tombstones: 0,
            valid_len: 0,
        };

        let mut offset = 0u64;
        for (index, chunk) in contents.split_inclusive(|b| *b == b'\n').enumerate() {
            offset += byte_len(chunk.len());
            let Some(line) = chunk.strip_suffix(b"\n") else {
                tracing::warn!(
                    path = %path.display(),
                    line = index + 1,
                    "Dead letter log ends with an incomplete record"
                );
                break;
            };
            if line.trim_ascii().is_empty() {
                continue;
            }

            match serde_json::from_slice::<LogRecord>(line) {
                Ok(record) => {
                    replay.apply(record);
                    replay.valid_len = offset;
                }
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %e,
                    "Skipping malformed dead letter log record"
                ),
            }
        }
        replay
    }

    fn apply(&mut self, record: LogRecord) {
        match record {
            LogRecord::Checkpoint { next_id } => {
                self.next_id = self.next_id.max(next_id);
            }
            LogRecord::Append { message } => {
                self.next_id = self.next_id.max(message.id.value() + 1);
                self.live.insert(message.id, message);
            }
            LogRecord::Remove { ids } => {
                for id in ids {
                    if self.live.remove(&id).is_some() {
                        self.tombstones += 1;
                    }
                }
            }
        }
    }
}

fn byte_len(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX)
}

async fn write_durably(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

async fn truncate_durably(file: &mut File, len: u64) -> std::io::Result<()> {
    file.set_len(len).await?;
    file.sync_all().await
}

async fn discard_temp(temp_path: &Path) {
    if let Err(e) = tokio::fs::remove_file(temp_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %temp_path.display(), error = %e, "Failed to remove compaction temp file");
        }
    }
}

#[cfg(unix)]
async fn sync_parent_dir(path: &Path) -> Result<(), StorageError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(parent).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_parent_dir(_path: &Path) -> Result<(), StorageError> {
    Ok(())
}

impl DlqStorage for FileStorage {
    fn append(&self, draft: DeadLetterDraft) -> StorageFuture<'_, DeadLetterMessage> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let message = DeadLetterMessage::from_draft(MessageId::new(state.next_id), draft);

            state
                .write_record(&LogRecord::Append {
                    message: message.clone(),
                })
                .await?;

            state.next_id += 1;
            state.live.insert(message.id, message.clone());
            Ok(message)
        })
    }

    fn list(&self) -> StorageFuture<'_, Vec<DeadLetterMessage>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.live.values().cloned().collect())
        })
    }

    fn remove(&self, ids: Vec<MessageId>) -> StorageFuture<'_, usize> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let present: Vec<MessageId> = ids
                .into_iter()
                .filter(|id| state.live.contains_key(id))
                .collect();
            if present.is_empty() {
                return Ok(0);
            }

            state
                .write_record(&LogRecord::Remove {
                    ids: present.clone(),
                })
                .await?;

            for id in &present {
                state.live.remove(id);
            }
            state.tombstones += present.len();

            if state.tombstones > state.live.len() {
                if let Err(e) = self.compact_locked(&mut state).await {
                    // Removal is already durable; compaction can wait for the next attempt.
                    tracing::warn!(path = %self.path.display(), error = %e, "Dead letter log compaction failed");
                }
            }
            Ok(present.len())
        })
    }

    fn get(&self, id: MessageId) -> StorageFuture<'_, Option<DeadLetterMessage>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.live.get(&id).cloned())
        })
    }

    fn count(&self) -> StorageFuture<'_, usize> {
        Box::pin(async move { Ok(self.state.lock().await.live.len()) })
    }
}
