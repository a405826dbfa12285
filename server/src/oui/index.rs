//! Longest-prefix index over the 48-bit hardware address space.
//!
//! Entries are bucketed by prefix length. A lookup probes one bucket per
//! distinct length present, longest first, so a 36-bit assignment always
//! wins over the 24-bit block that contains it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::parser::{self, Address, Record};

/// One organization assignment from the reference file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub bits: u8,
    pub value: u64,
    /// The prefix token as written in the reference file.
    pub prefix: String,
    pub organization: String,
    pub annotation: String,
}

/// An immutable, fully built index.
#[derive(Debug, Default)]
pub struct PrefixIndex {
    buckets: HashMap<u8, HashMap<u64, Entry>>,
    /// Distinct prefix lengths present, longest first.
    lengths: Vec<u8>,
    skipped: usize,
    built_at: Option<DateTime<Utc>>,
}

impl PrefixIndex {
    /// Create an empty index that matches nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from the text of a reference file.
    ///
    /// Malformed lines are skipped and counted. When two lines claim the same
    /// prefix the later one wins.
    pub fn parse(text: &str) -> Self {
        let mut buckets: HashMap<u8, HashMap<u64, Entry>> = HashMap::new();
        let mut skipped = 0;

        for (number, line) in text.lines().enumerate() {
            match parser::parse_line(line) {
                Ok(Some(record)) => {
                    let entry = Entry::from(record);
                    buckets
                        .entry(entry.bits)
                        .or_default()
                        .insert(entry.value, entry);
                }
                Ok(None) => {}
                Err(e) => {
                    skipped += 1;
                    debug!(line = number + 1, error = %e, "Skipping malformed reference line");
                }
            }
        }

        let mut lengths: Vec<u8> = buckets.keys().copied().collect();
        lengths.sort_unstable_by(|a, b| b.cmp(a));

        let index = Self {
            buckets,
            lengths,
            skipped,
            built_at: Some(Utc::now()),
        };
        info!(
            entries = index.len(),
            prefix_lengths = ?index.lengths,
            skipped,
            "Built OUI prefix index"
        );
        index
    }

    /// Look up an address string. Malformed input is simply "no match".
    pub fn lookup(&self, address: &str) -> Option<&Entry> {
        self.lookup_address(&Address::parse(address)?)
    }

    /// Longest matching entry for a parsed address.
    ///
    /// Prefix lengths longer than the bits the caller supplied are skipped,
    /// so a bare 24-bit OUI never matches a 36-bit sub-assignment.
    pub fn lookup_address(&self, address: &Address) -> Option<&Entry> {
        self.lengths
            .iter()
            .filter(|&&bits| bits <= address.width())
            .find_map(|&bits| self.buckets.get(&bits)?.get(&address.top_bits(bits)))
    }

    /// Number of distinct prefixes.
    pub fn len(&self) -> usize {
        self.buckets.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Distinct prefix lengths present, longest first.
    pub fn prefix_lengths(&self) -> &[u8] {
        &self.lengths
    }

    pub fn skipped_lines(&self) -> usize {
        self.skipped
    }

    /// When the index was built; `None` for the empty placeholder.
    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at
    }
}

impl From<Record<'_>> for Entry {
    fn from(record: Record<'_>) -> Self {
        Self {
            bits: record.prefix.bits,
            value: record.prefix.value,
            prefix: record.token.to_string(),
            organization: record.short_name.to_string(),
            annotation: record.annotation.to_string(),
        }
    }
}
