//! Source persistence
//!
//! The set of known sources is saved as one text line per Source:
//!
//! ```text
//! name; size, index[:guid], addr:port[,hostname]; hash-or-*; queue-id-or-*
//! ```
//!
//! Text fields (name, hostname, hash, queue id) are percent-escaped for
//! `%`, `;`, `,`, `*` and line breaks, so peer-supplied values cannot split
//! or forge a record. An unknown value is written as `*`. Lines starting with `#` are comments. Restoring feeds
//! each record back through `add_file`/`add_source`.

use crate::error::{Result, StorageErrorKind, TransferError};
use crate::types::Guid;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const HEADER: &str = "# gosh-swarm sources, format 1";

/// One persisted Source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub name: String,
    pub size: Option<u64>,
    pub file_index: u32,
    pub guid: Guid,
    pub addr: SocketAddr,
    pub hostname: Option<String>,
    pub hash: Option<String>,
    /// Remote queue slot we held
    pub queue_id: Option<String>,
}

impl SourceRecord {
    /// Render as one line, without the trailing newline
    pub fn encode(&self) -> String {
        let size = self
            .size
            .map(|s| s.to_string())
            .unwrap_or_else(|| "*".to_string());
        let guid = if self.guid.is_blank() {
            String::new()
        } else {
            format!(":{}", self.guid.to_hex())
        };
        let host = self
            .hostname
            .as_ref()
            .map(|h| format!(",{}", escape_field(h)))
            .unwrap_or_default();

        format!(
            "{}; {}, {}{}, {}{}; {}; {}",
            escape_field(&self.name),
            size,
            self.file_index,
            guid,
            self.addr,
            host,
            optional_field(self.hash.as_deref()),
            optional_field(self.queue_id.as_deref()),
        )
    }

    /// Parse one line; `line_no` is only used for error reporting
    pub fn parse_line(line: &str, line_no: usize) -> Result<Self> {
        let bad = |message: &str| TransferError::Record {
            line: line_no,
            message: message.to_string(),
        };

        let fields: Vec<&str> = line.split(';').collect();
        if fields.len() != 4 {
            return Err(bad("expected 4 ';'-separated fields"));
        }

        let name = unescape_field(fields[0].trim()).ok_or_else(|| bad("bad escape in name"))?;
        if name.is_empty() {
            return Err(bad("empty name"));
        }

        let location: Vec<&str> = fields[1].split(',').map(str::trim).collect();
        if location.len() < 3 || location.len() > 4 {
            return Err(bad("expected size, index, address[, hostname]"));
        }

        let size = match location[0] {
            "*" => None,
            s => Some(s.parse::<u64>().map_err(|_| bad("bad size"))?),
        };

        let (index, guid) = match location[1].split_once(':') {
            Some((index, guid)) => (
                index,
                Guid::from_hex(guid).ok_or_else(|| bad("bad guid"))?,
            ),
            None => (location[1], Guid::BLANK),
        };
        let file_index = index.parse::<u32>().map_err(|_| bad("bad file index"))?;

        let addr = location[2]
            .parse::<SocketAddr>()
            .map_err(|_| bad("bad address"))?;

        let hostname = match location.get(3).filter(|h| !h.is_empty()) {
            Some(h) => Some(unescape_field(h).ok_or_else(|| bad("bad escape in hostname"))?),
            None => None,
        };

        let optional = |s: &str, what: &str| -> Result<Option<String>> {
            let s = s.trim();
            if s == "*" || s.is_empty() {
                return Ok(None);
            }
            unescape_field(s)
                .map(Some)
                .ok_or_else(|| bad(&format!("bad escape in {}", what)))
        };

        Ok(Self {
            name,
            size,
            file_index,
            guid,
            addr,
            hostname,
            hash: optional(fields[2], "hash")?,
            queue_id: optional(fields[3], "queue id")?,
        })
    }
}

/// Render a full record file
pub fn encode_records(records: &[SourceRecord]) -> String {
    let mut out = String::with_capacity(64 * (records.len() + 1));
    out.push_str(HEADER);
    out.push('\n');
    for record in records {
        out.push_str(&record.encode());
        out.push('\n');
    }
    out
}

/// Parse a record file, skipping comments and logging malformed lines
pub fn decode_records(text: &str) -> Vec<SourceRecord> {
    let mut records = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        match SourceRecord::parse_line(line, i + 1) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!("Skipping persisted source: {}", e),
        }
    }
    records
}

fn optional_field(value: Option<&str>) -> String {
    value.map(escape_field).unwrap_or_else(|| "*".to_string())
}

fn escape_field(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '%' => out.push_str("%25"),
            ';' => out.push_str("%3B"),
            ',' => out.push_str("%2C"),
            '*' => out.push_str("%2A"),
            '\n' => out.push_str("%0A"),
            '\r' => out.push_str("%0D"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_field(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let pair = bytes.get(i + 1..i + 3)?;
            let decoded = hex::decode(pair).ok()?;
            out.push(decoded[0]);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Where the source set is kept between runs
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn save(&self, records: &[SourceRecord]) -> Result<()>;

    async fn load(&self) -> Result<Vec<SourceRecord>>;
}

/// Text file store, replaced atomically on every save
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl PersistenceStore for FileStore {
    async fn save(&self, records: &[SourceRecord]) -> Result<()> {
        let temp = self.temp_path();
        let text = encode_records(records);

        tokio::fs::write(&temp, text.as_bytes()).await.map_err(|e| {
            TransferError::storage(StorageErrorKind::Io, &temp, format!("Write failed: {}", e))
        })?;
        tokio::fs::rename(&temp, &self.path).await.map_err(|e| {
            TransferError::storage(
                StorageErrorKind::Io,
                &self.path,
                format!("Rename failed: {}", e),
            )
        })?;

        tracing::debug!("Saved {} sources to {:?}", records.len(), self.path);
        Ok(())
    }

    async fn load(&self) -> Result<Vec<SourceRecord>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(decode_records(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(TransferError::storage(
                StorageErrorKind::Open,
                &self.path,
                format!("Read failed: {}", e),
            )),
        }
    }
}

/// In-memory store for testing; keeps the encoded text
#[derive(Debug, Default)]
pub struct MemoryStore {
    text: parking_lot::RwLock<String>,
    saves: std::sync::atomic::AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encoded content of the last save
    pub fn text(&self) -> String {
        self.text.read().clone()
    }

    /// Number of saves so far
    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn save(&self, records: &[SourceRecord]) -> Result<()> {
        *self.text.write() = encode_records(records);
        self.saves
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self) -> Result<Vec<SourceRecord>> {
        Ok(decode_records(&self.text.read()))
    }
}
