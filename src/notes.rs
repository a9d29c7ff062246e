//! Note records and their persistence.
//!
//! The whole note list lives under a single key of a byte-oriented
//! key-value store, serialized as one JSON array. A missing or unreadable
//! entry yields the demo dataset instead of an error.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attachments::MAX_IMAGES_PER_NOTE;
use crate::errors::StoreError;

/// Key the note list is stored under.
pub const NOTES_KEY: &str = "ef_notes";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Attached images as data URLs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(default, rename = "tokenURI", skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl Note {
    /// Calendar date of the note in `tz`.
    pub fn local_date<Tz: TimeZone>(&self, tz: &Tz) -> NaiveDate {
        self.date.with_timezone(tz).date_naive()
    }
}

/// Fields supplied when creating a note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNote {
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub mood: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
}

/// Stores each key as `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Io(std::io::Error::other("memory store lock poisoned")))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Io(std::io::Error::other("memory store lock poisoned")))?;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

pub struct NoteStore {
    kv: Box<dyn KeyValueStore>,
    notes: Vec<Note>,
}

impl NoteStore {
    /// Loads the note list, falling back to [`demo_notes`] on missing or corrupt data.
    pub fn open(kv: Box<dyn KeyValueStore>) -> Self {
        let notes = load_notes(kv.as_ref());
        Self { kv, notes }
    }

    /// Newest-first list of notes.
    pub fn list(&self) -> &[Note] {
        &self.notes
    }

    pub fn get(&self, id: &str) -> Option<&Note> {
        self.notes.iter().find(|n| n.id == id)
    }

    pub fn on_date<Tz: TimeZone>(&self, date: NaiveDate, tz: &Tz) -> Vec<&Note> {
        self.notes
            .iter()
            .filter(|n| n.local_date(tz) == date)
            .collect()
    }

    pub fn add_note(&mut self, fields: NewNote) -> Result<String, StoreError> {
        if fields.title.trim().is_empty() {
            return Err(StoreError::InvalidNote("title is required".to_string()));
        }
        if fields.images.len() > MAX_IMAGES_PER_NOTE {
            return Err(StoreError::InvalidNote(format!(
                "at most {} images per note",
                MAX_IMAGES_PER_NOTE
            )));
        }

        let id = Uuid::new_v4().simple().to_string();
        let note = Note {
            id: id.clone(),
            title: fields.title,
            content: fields.content,
            date: fields.date,
            mood: fields.mood.filter(|m| !m.is_empty()),
            location: fields.location.filter(|l| !l.is_empty()),
            images: if fields.images.is_empty() {
                None
            } else {
                Some(fields.images)
            },
            token_uri: None,
            digest: None,
        };

        info!("Added note {} dated {}", id, note.date);
        self.notes.insert(0, note);
        self.persist();
        Ok(id)
    }

    /// Remembers the pinned metadata location of a note.
    pub fn record_pin(&mut self, id: &str, token_uri: &str, digest: &str) -> Result<(), StoreError> {
        let note = self
            .notes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        note.token_uri = Some(token_uri.to_string());
        note.digest = Some(digest.to_string());
        self.persist();
        Ok(())
    }

    // Write failures never surface to the caller; the in-memory list stays authoritative.
    fn persist(&self) {
        let result = serde_json::to_vec(&self.notes)
            .map_err(StoreError::from)
            .and_then(|bytes| self.kv.set(NOTES_KEY, &bytes));

        match result {
            Ok(()) => debug!("Saved {} notes", self.notes.len()),
            Err(e) => warn!("Failed to save notes: {}", e),
        }
    }
}

fn load_notes(kv: &dyn KeyValueStore) -> Vec<Note> {
    match kv.get(NOTES_KEY) {
        Ok(Some(bytes)) => match serde_json::from_slice::<Vec<Note>>(&bytes) {
            Ok(notes) => {
                info!("Loaded {} notes", notes.len());
                notes
            }
            Err(e) => {
                warn!("Stored notes are corrupt ({}), using demo notes", e);
                demo_notes(Utc::now())
            }
        },
        Ok(None) => {
            info!("No stored notes, using demo notes");
            demo_notes(Utc::now())
        }
        Err(e) => {
            warn!("Failed to read notes ({}), using demo notes", e);
            demo_notes(Utc::now())
        }
    }
}

pub fn demo_notes(now: DateTime<Utc>) -> Vec<Note> {
    let note = |id: &str, title: &str, content: &str, days_ago: i64| Note {
        id: id.to_string(),
        title: title.to_string(),
        content: content.to_string(),
        date: now - Duration::days(days_ago),
        mood: None,
        location: None,
        images: None,
        token_uri: None,
        digest: None,
    };

    vec![
        Note {
            mood: Some("Excited".to_string()),
            location: Some("Bali".to_string()),
            ..note("1", "First dive", "Bali. The water was so blue.", 0)
        },
        note("2", "First DApp", "Hello Web3!", 3),
        note("3", "First snow mountain climb", "Freezing, and worth it.", 10),
    ]
}
