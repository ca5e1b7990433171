//! Change feed sources.
//!
//! The feed is append-only and at-least-once: the same change may be
//! delivered more than once and changes to one entity may arrive out of
//! order. Nothing here assumes otherwise.
//!
//! - [`JsonlFeed`] reads `<entity_type>.jsonl` files from a directory; the
//!   sequence number of an entry is its 1-based line number.
//! - [`MemoryFeed`] holds entries in process, for tests and embedders.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::model::EntityType;
use crate::sync::types::{FeedCursor, SyncError, SyncResult};

/// One undecoded feed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFeedEntry {
    /// Position in the entity type's feed. Strictly increasing.
    pub sequence: u64,
    /// Discriminator as delivered by the source.
    pub entity_type: String,
    /// Unparsed payload.
    pub payload: String,
    /// Set when the raw bytes could not be read as text; `payload` then
    /// holds a lossy rendering for diagnostics only.
    pub unreadable: Option<String>,
}

impl RawFeedEntry {
    #[must_use]
    pub fn new(sequence: u64, entity_type: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            sequence,
            entity_type: entity_type.into(),
            payload: payload.into(),
            unreadable: None,
        }
    }

    /// Entry from raw line bytes. Invalid UTF-8 is flagged, never repaired.
    #[must_use]
    pub fn from_bytes(sequence: u64, entity_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(payload) => Self::new(sequence, entity_type, payload),
            Err(e) => {
                let reason = format!("payload is not valid UTF-8: {}", e.utf8_error());
                let lossy = String::from_utf8_lossy(e.as_bytes()).into_owned();
                Self {
                    unreadable: Some(reason),
                    ..Self::new(sequence, entity_type, lossy)
                }
            }
        }
    }
}

/// A window of feed entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedPage {
    pub entries: Vec<RawFeedEntry>,
    /// Cursor covering everything this page consumed, including skipped
    /// blank lines. Only valid once every entry reached a terminal outcome.
    pub next_cursor: FeedCursor,
}

/// Read side of the source's change feed.
pub trait FeedSource {
    /// Fetch up to `max_count` entries positioned after `cursor`.
    ///
    /// # Errors
    ///
    /// Returns an error if the feed cannot be read.
    fn fetch_changes(
        &self,
        entity_type: EntityType,
        cursor: FeedCursor,
        max_count: usize,
    ) -> SyncResult<FeedPage>;
}

/// End of a complete line: `sequence` ends at byte `offset`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct LineMark {
    sequence: u64,
    offset: u64,
}

/// Feed backed by JSONL files, one per entity type.
///
/// Remembers where the last consumed line ended so consecutive windows
/// seek forward instead of rescanning the file from the top.
#[derive(Debug)]
pub struct JsonlFeed {
    dir: PathBuf,
    marks: Mutex<HashMap<EntityType, LineMark>>,
}

impl JsonlFeed {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            marks: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the feed file for an entity type.
    #[must_use]
    pub fn feed_path(&self, entity_type: EntityType) -> PathBuf {
        self.dir.join(format!("{}.jsonl", entity_type.as_str()))
    }

    /// Where to start reading for `cursor`: the remembered mark if it is not
    /// past the cursor and still inside the file, else the top.
    fn start_for(&self, entity_type: EntityType, cursor: FeedCursor, file_len: u64) -> LineMark {
        let marks = self.marks.lock().unwrap_or_else(PoisonError::into_inner);
        marks
            .get(&entity_type)
            .copied()
            .filter(|m| m.sequence <= cursor.position() && m.offset <= file_len)
            .unwrap_or_default()
    }

    fn remember(&self, entity_type: EntityType, mark: LineMark) {
        let mut marks = self.marks.lock().unwrap_or_else(PoisonError::into_inner);
        marks.insert(entity_type, mark);
    }
}

impl FeedSource for JsonlFeed {
    fn fetch_changes(
        &self,
        entity_type: EntityType,
        cursor: FeedCursor,
        max_count: usize,
    ) -> SyncResult<FeedPage> {
        let path = self.feed_path(entity_type);
        if !path.exists() {
            return Ok(FeedPage {
                entries: Vec::new(),
                next_cursor: cursor,
            });
        }

        let feed_err = |e: std::io::Error| SyncError::Feed(format!("{}: {e}", path.display()));
        let mut file = File::open(&path).map_err(feed_err)?;
        let file_len = file.metadata().map_err(feed_err)?.len();
        let start = self.start_for(entity_type, cursor, file_len);
        file.seek(SeekFrom::Start(start.offset)).map_err(feed_err)?;

        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut next_cursor = cursor;
        let mut mark = start;
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf).map_err(feed_err)?;
            if read == 0 {
                break;
            }
            let sequence = mark.sequence + 1;
            // A trailing line without a newline may still be mid-append.
            if buf.last() != Some(&b'\n') {
                break;
            }
            if sequence > cursor.position() && entries.len() == max_count {
                break;
            }
            mark = LineMark {
                sequence,
                offset: mark.offset + read as u64,
            };
            if sequence <= cursor.position() {
                continue;
            }

            next_cursor = FeedCursor(sequence);
            let line = buf.trim_ascii();
            if line.is_empty() {
                continue;
            }
            entries.push(RawFeedEntry::from_bytes(
                sequence,
                entity_type.as_str(),
                line.to_vec(),
            ));
        }

        self.remember(entity_type, mark);
        Ok(FeedPage {
            entries,
            next_cursor,
        })
    }
}

/// In-process feed.
///
/// Each entity type gets its own sequence starting at 1.
#[derive(Debug, Default)]
pub struct MemoryFeed {
    entries: Mutex<BTreeMap<EntityType, Vec<RawFeedEntry>>>,
}

impl MemoryFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a payload and return its sequence number.
    pub fn push(&self, entity_type: EntityType, payload: impl Into<String>) -> u64 {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let feed = entries.entry(entity_type).or_default();
        let sequence = feed.last().map_or(1, |e| e.sequence + 1);
        feed.push(RawFeedEntry::new(sequence, entity_type.as_str(), payload));
        sequence
    }

    /// Number of entries appended for an entity type.
    #[must_use]
    pub fn len(&self, entity_type: EntityType) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(&entity_type).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn is_empty(&self, entity_type: EntityType) -> bool {
        self.len(entity_type) == 0
    }
}

impl FeedSource for MemoryFeed {
    fn fetch_changes(
        &self,
        entity_type: EntityType,
        cursor: FeedCursor,
        max_count: usize,
    ) -> SyncResult<FeedPage> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let page: Vec<RawFeedEntry> = entries
            .get(&entity_type)
            .map(|feed| {
                feed.iter()
                    .filter(|e| e.sequence > cursor.position())
                    .take(max_count)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let next_cursor = page.last().map_or(cursor, |e| FeedCursor(e.sequence));
        Ok(FeedPage {
            entries: page,
            next_cursor,
        })
    }
}
