// ABOUTME: Serde data models for note service responses and persisted state
// ABOUTME: Field-name variance is resolved here via aliases, not downstream

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// A note as listed by the remote service. List endpoints return partial
/// records; `merge_detail` fills them in from the note-view endpoint.
///
/// The service is inconsistent about field names depending on the call path
/// (`docGuid` vs `guid`, `dataModified` vs `modified`). Serde aliases map all
/// spellings onto one canonical shape at the boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoteSummary {
    #[serde(alias = "docGuid")]
    pub guid: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "category")]
    pub folder: Option<String>,
    #[serde(default, alias = "dtCreated", alias = "createdAt")]
    pub created: Option<String>,
    #[serde(default, alias = "dataModified", alias = "dtModified")]
    pub modified: Option<String>,
    #[serde(default, deserialize_with = "de_tags")]
    pub tags: Vec<String>,
    #[serde(default, alias = "attachmentCount")]
    pub attachment_count: u32,
    #[serde(default)]
    pub author: Option<String>,
}

impl NoteSummary {
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or("Untitled")
    }

    /// Merge the full record from the note-view endpoint into this partial
    /// listing record. Fields present in the detail win.
    pub fn merge_detail(&mut self, detail: NoteSummary) {
        if detail.title.is_some() {
            self.title = detail.title;
        }
        if detail.folder.is_some() {
            self.folder = detail.folder;
        }
        if detail.created.is_some() {
            self.created = detail.created;
        }
        if detail.modified.is_some() {
            self.modified = detail.modified;
        }
        if !detail.tags.is_empty() {
            self.tags = detail.tags;
        }
        if detail.attachment_count > 0 {
            self.attachment_count = detail.attachment_count;
        }
        if detail.author.is_some() {
            self.author = detail.author;
        }
    }
}

/// Accepts either a single string or a list of strings for the tag field.
fn de_tags<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Tags {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<Tags>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Tags::One(s)) => vec![s],
        Some(Tags::Many(v)) => v,
    })
}

/// An attachment descriptor from the note-view response. Bytes are fetched
/// lazily through the client; an attachment has no lifecycle of its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentInfo {
    #[serde(alias = "attGuid")]
    pub guid: String,
    #[serde(default, alias = "docGuid")]
    pub doc_guid: Option<String>,
    #[serde(default = "default_attachment_name")]
    pub name: String,
}

fn default_attachment_name() -> String {
    "attachment".into()
}

/// Binary media decoded out of note markup during conversion. Created by the
/// converter, written next to the note by the store, then dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedMedia {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Persistent index record: one per note guid, keyed in the index map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub title: String,
    pub file_path: String,
    pub team: String,
    pub folder: String,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub format: String,
    pub saved_at: String,
}

/// Persistent cross-run sync markers, stored beside the index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(default)]
    pub last_sync: Option<String>,
    #[serde(default)]
    pub synced_teams: BTreeMap<String, String>,
}
