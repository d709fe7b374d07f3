//! Short host -> target URL table.
//!
//! The live table is an `Arc<MappingSnapshot>` behind a `RwLock`. Readers
//! clone the `Arc` and keep using that snapshot for the whole request;
//! reloads build a complete new snapshot and swap it in under the write
//! lock, so nobody ever sees a half-updated table.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Rejected(String),

    #[error("no valid records found in config file")]
    Empty,
}

/// Envelope of the mapping source document
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingDocument {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Vec<MappingRecord>,
}

/// A single short link record; fields beyond these are ignored
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingRecord {
    #[serde(default)]
    pub short_url: Option<String>,
    #[serde(default)]
    pub long_url: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
}

impl MappingRecord {
    /// `(lower-cased short host, protocol://longUrl)`, or `None` if unusable
    fn entry(&self) -> Option<(String, String)> {
        let short = self.short_url.as_deref().filter(|s| !s.is_empty())?;
        let long = self.long_url.as_deref().filter(|s| !s.is_empty())?;
        let protocol = self.protocol.as_deref().unwrap_or_default();
        Some((short.to_lowercase(), format!("{}://{}", protocol, long)))
    }
}

impl MappingDocument {
    pub fn from_slice(body: &[u8]) -> Result<Self, MappingError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Validate the document and turn it into table entries
    pub fn into_entries(self) -> Result<HashMap<String, String>, MappingError> {
        if !self.success {
            warn!("Config file indicates error: {}", self.message);
            return Err(MappingError::Rejected(self.message));
        }

        let mut entries = HashMap::with_capacity(self.data.len());
        for record in &self.data {
            match record.entry() {
                Some((short, target)) => {
                    entries.insert(short, target);
                }
                None => warn!("Invalid record received: {:?}", record),
            }
        }

        if entries.is_empty() {
            return Err(MappingError::Empty);
        }
        Ok(entries)
    }
}

/// Immutable view of the table at one point in time
#[derive(Debug, Default)]
pub struct MappingSnapshot {
    entries: HashMap<String, String>,
    loaded_at: Option<DateTime<Local>>,
}

impl MappingSnapshot {
    pub fn new(entries: HashMap<String, String>, loaded_at: DateTime<Local>) -> Self {
        Self {
            entries,
            loaded_at: Some(loaded_at),
        }
    }

    /// Exact, case-insensitive lookup
    pub fn lookup(&self, host: &str) -> Option<&str> {
        self.entries
            .get(host.to_lowercase().as_str())
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Time of the successful load that produced this snapshot
    pub fn loaded_at(&self) -> Option<DateTime<Local>> {
        self.loaded_at
    }

    /// Up to `n` entries ordered by short host
    pub fn samples(&self, n: usize) -> Vec<(&str, &str)> {
        let mut all: Vec<(&str, &str)> = self
            .entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        all.sort_unstable();
        all.truncate(n);
        all
    }
}

/// Hot-swappable mapping table shared by every request
#[derive(Debug, Default)]
pub struct MappingTable {
    current: RwLock<Arc<MappingSnapshot>>,
}

impl MappingTable {
    /// Empty table; populated by the first successful load
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Arc<MappingSnapshot> {
        Arc::clone(&*self.current.read().await)
    }

    /// Install a new table wholesale, stamped with the current time
    pub async fn replace(&self, entries: HashMap<String, String>) -> usize {
        let snapshot = Arc::new(MappingSnapshot::new(entries, Local::now()));
        let total = snapshot.len();
        *self.current.write().await = snapshot;
        total
    }

    /// Load `path` and swap it in. The live table is untouched on error.
    pub async fn reload_from(&self, path: &Path) -> Result<usize, MappingError> {
        info!("Loading mappings from {}...", path.display());

        let body = tokio::fs::read(path)
            .await
            .map_err(|source| MappingError::Read {
                path: path.display().to_string(),
                source,
            })?;
        let entries = MappingDocument::from_slice(&body)?.into_entries()?;
        let total = self.replace(entries).await;

        info!("Mappings loaded successfully. Total {} records.", total);
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    const IDEV_DOC: &str = r#"{"success":true,"data":[{"shortUrl":"idev","longUrl":"internal.example.com/app","protocol":"http"}]}"#;

    fn write_doc(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn builds_target_from_protocol_and_long_url() {
        let entries = MappingDocument::from_slice(IDEV_DOC.as_bytes())
            .unwrap()
            .into_entries()
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries["idev"], "http://internal.example.com/app");
    }

    #[test]
    fn keys_are_lowercased_and_lookup_ignores_case() {
        let doc = r#"{"success":true,"message":"ok","timeTaken":3,"data":[
            {"id":1,"shortUrl":"WiKi","longUrl":"wiki.example.com","protocol":"https","userId":null,"allowUriConcat":true}
        ]}"#;
        let entries = MappingDocument::from_slice(doc.as_bytes())
            .unwrap()
            .into_entries()
            .unwrap();
        assert!(entries.contains_key("wiki"));

        let snapshot = MappingSnapshot::new(entries, Local::now());
        assert_eq!(snapshot.lookup("WIKI"), Some("https://wiki.example.com"));
        assert_eq!(snapshot.lookup("wiki.example.com"), None);
    }

    #[test]
    fn incomplete_records_are_skipped() {
        let doc = r#"{"success":true,"data":[
            {"shortUrl":"a","longUrl":"a.example.com","protocol":"http"},
            {"shortUrl":"","longUrl":"b.example.com","protocol":"http"},
            {"shortUrl":"c","protocol":"http"},
            {"longUrl":"d.example.com"}
        ]}"#;
        let entries = MappingDocument::from_slice(doc.as_bytes())
            .unwrap()
            .into_entries()
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("a"));
    }

    #[test]
    fn unsuccessful_document_is_rejected() {
        let doc = r#"{"success":false,"message":"upstream down","data":[]}"#;
        let err = MappingDocument::from_slice(doc.as_bytes())
            .unwrap()
            .into_entries()
            .unwrap_err();
        assert!(matches!(err, MappingError::Rejected(ref m) if m == "upstream down"));
    }

    #[test]
    fn document_without_usable_records_is_rejected() {
        let doc = r#"{"success":true,"data":[{"shortUrl":"x"}]}"#;
        let err = MappingDocument::from_slice(doc.as_bytes())
            .unwrap()
            .into_entries()
            .unwrap_err();
        assert!(matches!(err, MappingError::Empty));
    }

    #[test]
    fn samples_are_sorted_and_capped() {
        let entries = (0..8)
            .map(|i| (format!("h{}", i), format!("http://t{}", i)))
            .collect();
        let snapshot = MappingSnapshot::new(entries, Local::now());
        let samples = snapshot.samples(5);
        assert_eq!(samples.len(), 5);
        assert_eq!(samples[0], ("h0", "http://t0"));
        assert_eq!(samples[4], ("h4", "http://t4"));
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_table() {
        let table = MappingTable::new();
        let good = write_doc(IDEV_DOC);
        assert_eq!(table.reload_from(good.path()).await.unwrap(), 1);
        let before = table.snapshot().await;

        let bad = write_doc("{not json");
        assert!(matches!(
            table.reload_from(bad.path()).await,
            Err(MappingError::Parse(_))
        ));
        let rejected = write_doc(r#"{"success":false,"message":"nope"}"#);
        assert!(table.reload_from(rejected.path()).await.is_err());
        assert!(matches!(
            table.reload_from(Path::new("/nonexistent/mappings.json")).await,
            Err(MappingError::Read { .. })
        ));

        let after = table.snapshot().await;
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.lookup("idev"), Some("http://internal.example.com/app"));
    }

    #[tokio::test]
    async fn reloading_same_document_only_moves_timestamp() {
        let table = MappingTable::new();
        assert!(table.snapshot().await.is_empty());
        assert!(table.snapshot().await.loaded_at().is_none());

        let doc = write_doc(IDEV_DOC);
        table.reload_from(doc.path()).await.unwrap();
        let first = table.snapshot().await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        table.reload_from(doc.path()).await.unwrap();
        let second = table.snapshot().await;

        assert_eq!(first.entries, second.entries);
        assert!(second.loaded_at().unwrap() >= first.loaded_at().unwrap());
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_never_see_a_mixed_table() {
        let old: HashMap<String, String> = [
            ("a".to_string(), "http://old/a".to_string()),
            ("b".to_string(), "http://old/b".to_string()),
        ]
        .into();
        let new: HashMap<String, String> = [
            ("a".to_string(), "http://new/a".to_string()),
            ("b".to_string(), "http://new/b".to_string()),
        ]
        .into();

        let table = Arc::new(MappingTable::new());
        table.replace(old.clone()).await;

        let mut readers = Vec::new();
        for _ in 0..8 {
            let table = Arc::clone(&table);
            readers.push(tokio::spawn(async move {
                for _ in 0..500 {
                    let snapshot = table.snapshot().await;
                    let a = snapshot.lookup("a").unwrap().to_string();
                    tokio::task::yield_now().await;
                    let b = snapshot.lookup("b").unwrap().to_string();
                    let a_old = a.contains("old");
                    let b_old = b.contains("old");
                    assert_eq!(a_old, b_old, "mixed snapshot: {} / {}", a, b);
                }
            }));
        }

        for i in 0..50 {
            let next = if i % 2 == 0 { new.clone() } else { old.clone() };
            table.replace(next).await;
            tokio::task::yield_now().await;
        }

        for reader in readers {
            reader.await.unwrap();
        }
    }
}
