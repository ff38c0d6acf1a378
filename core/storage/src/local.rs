//! Local filesystem append log.

use async_trait::async_trait;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::log::{LogEntry, LogStore};
use offsync_common::{Error, Result};

/// Local filesystem append log.
///
/// Stores each namespace as a JSON-lines file (`<namespace>.log`) under a
/// root directory. Every append is flushed and synced before returning.
pub struct FileLog {
    root: PathBuf,
    /// Serializes appends and compactions so lines never interleave.
    write_lock: Mutex<()>,
}

impl FileLog {
    /// Create a new file log rooted at the given directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Root directory of this log.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_path(&self, namespace: &str) -> Result<PathBuf> {
        if namespace.is_empty()
            || !namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::InvalidInput(format!(
                "Invalid log namespace: '{}'",
                namespace
            )));
        }
        Ok(self.root.join(format!("{}.log", namespace)))
    }

    /// Cut a torn final line left by an interrupted append, so the next
    /// entry starts on a line of its own.
    async fn repair_tail(path: &Path) -> Result<()> {
        let mut file = match OpenOptions::new().read(true).write(true).open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        if len == 0 {
            return Ok(());
        }
        file.seek(SeekFrom::Start(len - 1)).await?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last).await?;
        if last[0] == b'\n' {
            return Ok(());
        }

        file.seek(SeekFrom::Start(0)).await?;
        let mut content = Vec::new();
        file.read_to_end(&mut content).await?;
        let keep = content
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |i| i + 1) as u64;

        warn!(
            "Truncating {} torn bytes at the end of {}",
            len - keep,
            path.display()
        );
        file.set_len(keep).await?;
        file.sync_data().await?;
        Ok(())
    }

    fn encode(entry: &LogEntry) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        Ok(line)
    }
}

#[async_trait]
impl LogStore for FileLog {
    fn name(&self) -> &str {
        "file"
    }

    async fn append(&self, namespace: &str, entry: LogEntry) -> Result<()> {
        let path = self.namespace_path(namespace)?;
        let line = Self::encode(&entry)?;

        let _guard = self.write_lock.lock().await;
        Self::repair_tail(&path).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        file.sync_data().await?;

        Ok(())
    }

    async fn replay(&self, namespace: &str) -> Result<Vec<LogEntry>> {
        let path = self.namespace_path(namespace)?;
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path).await?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut entries = Vec::with_capacity(lines.len());

        for (index, line) in lines.iter().enumerate() {
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => entries.push(entry),
                // A crash mid-append can leave a torn final line.
                Err(e) if index + 1 == lines.len() => {
                    warn!("Ignoring torn trailing entry in {}: {}", path.display(), e);
                }
                Err(e) => {
                    return Err(Error::Storage(format!(
                        "Corrupt entry {} in {}: {}",
                        index + 1,
                        path.display(),
                        e
                    )));
                }
            }
        }

        debug!("Replayed {} entries from {}", entries.len(), path.display());
        Ok(entries)
    }

    async fn compact(&self, namespace: &str, entries: Vec<LogEntry>) -> Result<()> {
        let path = self.namespace_path(namespace)?;
        let tmp_path = path.with_extension("log.tmp");

        let mut buffer = Vec::new();
        for entry in &entries {
            buffer.extend_from_slice(&Self::encode(entry)?);
        }

        let _guard = self.write_lock.lock().await;
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&buffer).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &path).await?;

        debug!("Compacted {} to {} entries", path.display(), entries.len());
        Ok(())
    }
}
