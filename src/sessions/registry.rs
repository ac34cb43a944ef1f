//! Append-only disk registry of sessions.
//!
//! Every session is one JSON line in `$DATA_DIR/sessions.jsonl`. The file is
//! loaded into an in-memory index on startup. A lookup that misses the index
//! reads whatever was appended since the last read, so sessions written by
//! another process sharing the data directory are still found. Only complete
//! lines are consumed; a partially written tail is picked up on a later read.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use super::{JobRank, Session, SessionStore, SessionType};
use crate::error::Result;

const REGISTRY_FILE: &str = "sessions.jsonl";

/// Disk-backed [`SessionStore`].
pub struct FileStore {
    path: PathBuf,
    index: RwLock<HashMap<String, Session>>,
    /// Serializes appends so lines never interleave.
    writer: Mutex<fs::File>,
    /// Byte offset up to which the file has been parsed.
    read_offset: Mutex<u64>,
}

impl FileStore {
    /// Open (or create) the registry under `data_dir` and load existing records.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir).await?;
        let path = data_dir.join(REGISTRY_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let mut sessions = HashMap::new();
        let read_offset = read_records(&path, 0, &mut sessions).await?;
        info!(
            "Session registry loaded {} records from {}",
            sessions.len(),
            path.display()
        );

        Ok(Self {
            path,
            index: RwLock::new(sessions),
            writer: Mutex::new(file),
            read_offset: Mutex::new(read_offset),
        })
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }

    async fn append(&self, session: &Session) -> Result<()> {
        let mut line = serde_json::to_string(session)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push('\n');
        let mut file = self.writer.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Parse records appended since the last read and merge them into the
    /// index.
    async fn reload(&self) -> Result<()> {
        let mut offset = self.read_offset.lock().await;
        let mut appended = HashMap::new();
        *offset = read_records(&self.path, *offset, &mut appended).await?;
        if appended.is_empty() {
            return Ok(());
        }
        let mut index = self.index.write().await;
        for (id, session) in appended {
            index.entry(id).or_insert(session);
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileStore {
    async fn create(&self, job_id: &str, rank: u32, session_type: SessionType) -> Result<String> {
        let session = Session::new(job_id, rank, session_type);
        self.append(&session).await?;
        let id = session.id.clone();
        self.index.write().await.insert(id.clone(), session);
        Ok(id)
    }

    async fn find(&self, session_id: &str, expected: SessionType) -> Result<Option<JobRank>> {
        let lookup = |index: &HashMap<String, Session>| {
            index
                .get(session_id)
                .map(|s| (s.session_type == expected).then(|| s.job_rank()))
        };

        if let Some(hit) = lookup(&*self.index.read().await) {
            return Ok(hit);
        }

        self.reload().await?;
        Ok(lookup(&*self.index.read().await).flatten())
    }
}

/// Parse the complete lines of the registry file from byte `offset` on into
/// `sessions` and return the offset after the last complete line. Malformed
/// lines are skipped with a warning.
async fn read_records(
    path: &Path,
    offset: u64,
    sessions: &mut HashMap<String, Session>,
) -> Result<u64> {
    let mut file = match fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(offset),
        Err(e) => return Err(e.into()),
    };
    if file.metadata().await?.len() <= offset {
        return Ok(offset);
    }
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;

    let Some(end) = buf.iter().rposition(|&b| b == b'\n') else {
        return Ok(offset);
    };
    for line in buf[..end].split(|&b| b == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<Session>(line) {
            Ok(session) => {
                sessions.insert(session.id.clone(), session);
            }
            Err(e) => warn!("Skipping malformed registry line in {}: {e}", path.display()),
        }
    }
    Ok(offset + end as u64 + 1)
}
