//! Placeholder metadata pinning.
//!
//! Nothing is uploaded anywhere: the token URI and digest are both derived
//! from a SHA-256 of the serialized metadata document, which is enough to
//! exercise the mint flow end to end.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::SecondsFormat;
use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::EveryFirstError;
use crate::notes::Note;

/// Length of the fake CID taken from the hex hash.
const CID_HEX_LEN: usize = 46;

/// Note body accepted by the pin endpoint. Every field is optional so an
/// incomplete body is reported as an invalid note rather than a parse error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinRequest {
    pub title: Option<String>,
    pub content: Option<String>,
    pub date: Option<String>,
    pub mood: Option<String>,
    pub location: Option<String>,
    pub images: Option<Vec<String>>,
}

impl From<&Note> for PinRequest {
    fn from(note: &Note) -> Self {
        Self {
            title: Some(note.title.clone()),
            content: Some(note.content.clone()),
            date: Some(note.date.to_rfc3339_opts(SecondsFormat::Millis, true)),
            mood: note.mood.clone(),
            location: note.location.clone(),
            images: note.images.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub trait_type: String,
    pub value: String,
}

/// ERC-721 style metadata document. Field order is part of the hash input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteMetadata {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub attributes: Vec<Attribute>,
}

impl NoteMetadata {
    pub fn from_request(note: &PinRequest) -> Result<Self, EveryFirstError> {
        let name = note
            .title
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(EveryFirstError::InvalidNote)?;

        let attributes = [
            ("date", note.date.as_deref()),
            ("mood", note.mood.as_deref()),
            ("location", note.location.as_deref()),
        ]
        .into_iter()
        .filter_map(|(trait_type, value)| match value {
            Some(v) if !v.is_empty() => Some(Attribute {
                trait_type: trait_type.to_string(),
                value: v.to_string(),
            }),
            _ => None,
        })
        .collect();

        Ok(Self {
            name: name.to_string(),
            description: note.content.clone().unwrap_or_default(),
            image: note.images.as_ref().and_then(|imgs| imgs.first().cloned()),
            attributes,
        })
    }

    pub fn to_json(&self) -> Result<String, EveryFirstError> {
        serde_json::to_string(self)
            .map_err(|e| EveryFirstError::InvalidParameters(format!("Unserializable metadata: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinReceipt {
    #[serde(rename = "tokenURI")]
    pub token_uri: String,
    pub digest: String,
}

/// Hashes the metadata JSON into a fake `ipfs://` URI and a `0x` digest.
pub fn pin_metadata(metadata: &NoteMetadata) -> Result<PinReceipt, EveryFirstError> {
    let json = metadata.to_json()?;
    let hash = hex::encode(Sha256::digest(json.as_bytes()));

    Ok(PinReceipt {
        token_uri: format!("ipfs://{}", &hash[..CID_HEX_LEN]),
        digest: format!("0x{}", hash),
    })
}

#[derive(Debug, Clone)]
pub struct PinnedNote {
    pub note: PinRequest,
    pub receipt: PinReceipt,
}

/// In-memory record of pinned notes, keyed by note id.
#[derive(Debug, Default)]
pub struct PinRegistry {
    pinned: Mutex<HashMap<String, PinnedNote>>,
}

impl PinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(&self, id: &str, note: PinRequest) -> Result<PinReceipt, EveryFirstError> {
        let metadata = NoteMetadata::from_request(&note)?;
        let receipt = pin_metadata(&metadata)?;

        info!("Pinned note {} as {}", id, receipt.token_uri);
        let mut pinned = self
            .pinned
            .lock()
            .map_err(|_| EveryFirstError::InvalidParameters("pin registry lock poisoned".to_string()))?;
        pinned.insert(
            id.to_string(),
            PinnedNote {
                note,
                receipt: receipt.clone(),
            },
        );

        Ok(receipt)
    }

    pub fn get(&self, id: &str) -> Option<PinnedNote> {
        self.pinned.lock().ok()?.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.pinned.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
