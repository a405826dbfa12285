//! MAC address vendor lookup (Organizationally Unique Identifier, OUI).
//!
//! The database is built from a Wireshark-style `manuf` file (optionally
//! gzip-compressed) and answers longest-prefix lookups for prefixes of any
//! length between 1 and 48 bits. Rebuilding swaps in a fresh index only after
//! it is fully parsed; lookups never touch the filesystem.

pub mod index;
pub mod parser;

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tracing::info;

pub use index::{Entry, PrefixIndex};
pub use parser::Address;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Fatal errors while loading the reference file. Individual bad lines are
/// not errors; they are skipped.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to decompress reference data: {0}")]
    Decompress(#[source] io::Error),
}

/// A lookup result as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OuiMatch {
    pub prefix: String,
    pub organization: String,
    pub annotation: String,
}

impl From<&Entry> for OuiMatch {
    fn from(entry: &Entry) -> Self {
        Self {
            prefix: entry.prefix.clone(),
            organization: entry.organization.clone(),
            annotation: entry.annotation.clone(),
        }
    }
}

/// Summary of the currently served index.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub entries: usize,
    pub prefix_lengths: Vec<u8>,
    pub skipped_lines: usize,
    pub built_at: Option<DateTime<Utc>>,
}

/// The current index for one reference file.
pub struct OuiDatabase {
    path: PathBuf,
    current: RwLock<Arc<PrefixIndex>>,
}

impl OuiDatabase {
    /// Create a database backed by `path`, initially empty.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(Arc::new(PrefixIndex::new())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse `raw` (plain or gzip) and make it the current index.
    ///
    /// On error the previous index stays in place.
    pub fn build(&self, raw: &[u8]) -> Result<usize, IndexError> {
        let index = parse_raw(raw)?;
        Ok(self.swap(index))
    }

    /// Re-read the backing file and rebuild.
    pub async fn rebuild(&self) -> Result<usize, IndexError> {
        let path = self.path.clone();
        let index = tokio::task::spawn_blocking(move || {
            let raw = std::fs::read(&path).map_err(|source| IndexError::Read {
                path: path.clone(),
                source,
            })?;
            parse_raw(&raw)
        })
        .await
        .map_err(|e| IndexError::Read {
            path: self.path.clone(),
            source: io::Error::new(io::ErrorKind::Other, e),
        })??;

        let entries = self.swap(index);
        info!(path = %self.path.display(), entries, "OUI database rebuilt");
        Ok(entries)
    }

    /// Longest-prefix match for `address`, or `None`.
    pub fn lookup(&self, address: &str) -> Option<OuiMatch> {
        self.current().lookup(address).map(OuiMatch::from)
    }

    /// A snapshot of the current index.
    pub fn current(&self) -> Arc<PrefixIndex> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn stats(&self) -> IndexStats {
        let index = self.current();
        IndexStats {
            entries: index.len(),
            prefix_lengths: index.prefix_lengths().to_vec(),
            skipped_lines: index.skipped_lines(),
            built_at: index.built_at(),
        }
    }

    fn swap(&self, index: PrefixIndex) -> usize {
        let entries = index.len();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(index);
        entries
    }
}

fn parse_raw(raw: &[u8]) -> Result<PrefixIndex, IndexError> {
    if raw.starts_with(&GZIP_MAGIC) {
        let mut text = Vec::new();
        GzDecoder::new(raw)
            .read_to_end(&mut text)
            .map_err(IndexError::Decompress)?;
        Ok(PrefixIndex::parse(&String::from_utf8_lossy(&text)))
    } else {
        Ok(PrefixIndex::parse(&String::from_utf8_lossy(raw)))
    }
}
