// ABOUTME: On-disk layout, note index, and sync state persistence
// ABOUTME: Path derivation and collision handling live behind one lock

use crate::model::{IndexEntry, NoteSummary, SyncState};
use crate::{Error, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

const METADATA_DIR: &str = "_metadata";
const INDEX_FILE: &str = "index.json";
const SYNC_STATE_FILE: &str = "sync_state.json";
const MAX_STEM_CHARS: usize = 200;

/// Derived on demand for the end-of-run report.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub total_notes: usize,
    pub total_files: usize,
    pub total_size: u64,
}

struct IndexState {
    entries: HashMap<String, IndexEntry>,
    dirty: bool,
}

/// Owns the output tree and the persistent index. The index map is the only
/// state shared across sync workers, so every read-modify-write on it (path
/// collision check, disambiguation, insert) happens under the one mutex.
pub struct Store {
    root: PathBuf,
    metadata_dir: PathBuf,
    tmp_dir: PathBuf,
    preserve_structure: bool,
    inner: Mutex<IndexState>,
}

impl Store {
    pub fn open(root: impl Into<PathBuf>, preserve_structure: bool) -> Result<Self> {
        let root = root.into();
        let metadata_dir = root.join(METADATA_DIR);
        let tmp_dir = metadata_dir.join("tmp");
        fs::create_dir_all(&root)?;
        fs::create_dir_all(&metadata_dir)?;
        fs::create_dir_all(&tmp_dir)?;

        let entries = load_index_file(&metadata_dir.join(INDEX_FILE));

        Ok(Store {
            root,
            metadata_dir,
            tmp_dir,
            preserve_structure,
            inner: Mutex::new(IndexState {
                entries,
                dirty: false,
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True when the note needs fetching: unknown guid, no stored marker, or
    /// a remote marker sorting after the stored one.
    pub fn is_modified(&self, guid: &str, remote_modified: Option<&str>) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = inner.entries.get(guid) else {
            return true;
        };
        let Some(stored) = entry.modified.as_deref() else {
            return true;
        };
        match remote_modified {
            Some(remote) => remote > stored,
            None => true,
        }
    }

    pub fn index_entry(&self, guid: &str) -> Option<IndexEntry> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.get(guid).cloned()
    }

    /// Write a note's content at its derived path and record it in the index.
    /// Re-saving the same guid reuses the same path; a different note whose
    /// title sanitizes to an occupied path gets a guid-derived suffix.
    pub fn save_note(
        &self,
        team: &str,
        folder_path: &str,
        note: &NoteSummary,
        content: &str,
        format: &str,
    ) -> Result<PathBuf> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let file_path = self.derive_note_path(&inner.entries, team, folder_path, note, format);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&file_path, content.as_bytes(), &self.tmp_dir)?;

        inner.entries.insert(
            note.guid.clone(),
            IndexEntry {
                title: note.display_title().to_string(),
                file_path: file_path.to_string_lossy().into_owned(),
                team: team.to_string(),
                folder: folder_path.to_string(),
                created: note.created.clone(),
                modified: note.modified.clone(),
                tags: note.tags.clone(),
                format: format.to_string(),
                saved_at: Utc::now().to_rfc3339(),
            },
        );
        inner.dirty = true;

        debug!(path = %file_path.display(), "saved note");
        Ok(file_path)
    }

    fn derive_note_path(
        &self,
        entries: &HashMap<String, IndexEntry>,
        team: &str,
        folder_path: &str,
        note: &NoteSummary,
        format: &str,
    ) -> PathBuf {
        let mut dir = self.root.join(sanitize_filename(team));
        if self.preserve_structure {
            for part in folder_path.trim_matches('/').split('/') {
                if !part.is_empty() {
                    dir = dir.join(sanitize_filename(part));
                }
            }
        }

        let stem = sanitize_filename(note.display_title());
        // a *.md title already carries the right extension
        let ext = format!(".{}", format);
        let filename = if stem.to_ascii_lowercase().ends_with(&ext) {
            stem.clone()
        } else {
            format!("{}{}", stem, ext)
        };
        let candidate = dir.join(&filename);

        // Same title under the same folder: reuse the path only when the
        // index records it as this very note. A file the index knows
        // nothing about belongs to someone else and is never overwritten.
        let occupied_by_other = candidate.exists()
            && guid_for_path(entries, &candidate).as_deref() != Some(note.guid.as_str());

        if occupied_by_other {
            let suffix: String = note.guid.chars().take(8).collect();
            let base = filename.strip_suffix(&ext).unwrap_or(&filename);
            dir.join(format!("{}_{}{}", base, suffix, ext))
        } else {
            candidate
        }
    }

    /// Write attachment bytes into the `assets/` directory beside the note.
    /// A name collision with different content gets a numeric suffix;
    /// identical content reuses the existing file. Attachments are not
    /// content-addressed the way inline media is.
    pub fn save_attachment(&self, note_path: &Path, name: &str, content: &[u8]) -> Result<PathBuf> {
        let assets_dir = note_path
            .parent()
            .unwrap_or(&self.root)
            .join("assets");
        fs::create_dir_all(&assets_dir)?;

        let safe_name = sanitize_filename(name);
        let (stem, ext) = split_ext(&safe_name);

        let mut candidate = assets_dir.join(&safe_name);
        let mut counter = 1;
        while candidate.exists() {
            if fs::read(&candidate).map(|existing| existing == content).unwrap_or(false) {
                return Ok(candidate);
            }
            candidate = assets_dir.join(format!("{}_{}{}", stem, counter, ext));
            counter += 1;
        }

        write_atomic(&candidate, content, &self.tmp_dir)?;
        debug!(path = %candidate.display(), "saved attachment");
        Ok(candidate)
    }

    /// Inline media extracted during conversion lands in the same `assets/`
    /// directory as declared attachments.
    pub fn save_resource(&self, note_path: &Path, name: &str, content: &[u8]) -> Result<PathBuf> {
        self.save_attachment(note_path, name, content)
    }

    /// Flush the index to disk if anything changed since the last flush.
    /// Called once per run, not per note.
    pub fn save_index(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.dirty {
            return Ok(());
        }
        let json = serde_json::to_string_pretty(&inner.entries)?;
        write_atomic(
            &self.metadata_dir.join(INDEX_FILE),
            json.as_bytes(),
            &self.tmp_dir,
        )?;
        inner.dirty = false;
        info!(entries = inner.entries.len(), "index persisted");
        Ok(())
    }

    pub fn load_sync_state(&self) -> SyncState {
        let path = self.metadata_dir.join(SYNC_STATE_FILE);
        if !path.exists() {
            return SyncState::default();
        }
        match fs::read_to_string(&path)
            .map_err(Error::from)
            .and_then(|s| serde_json::from_str(&s).map_err(Error::from))
        {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "sync state unreadable, starting fresh");
                SyncState::default()
            }
        }
    }

    pub fn save_sync_state(&self, state: &SyncState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        write_atomic(
            &self.metadata_dir.join(SYNC_STATE_FILE),
            json.as_bytes(),
            &self.tmp_dir,
        )
    }

    pub fn statistics(&self) -> StoreStats {
        let total_notes = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.entries.len()
        };

        let mut stats = StoreStats {
            total_notes,
            ..Default::default()
        };
        walk_tree(&self.root, &mut stats);
        stats
    }
}

fn walk_tree(dir: &Path, stats: &mut StoreStats) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_tree(&path, stats);
        } else if let Ok(meta) = entry.metadata() {
            stats.total_files += 1;
            stats.total_size += meta.len();
        }
    }
}

fn load_index_file(path: &Path) -> HashMap<String, IndexEntry> {
    if !path.exists() {
        return HashMap::new();
    }
    match fs::read_to_string(path)
        .map_err(Error::from)
        .and_then(|s| serde_json::from_str(&s).map_err(Error::from))
    {
        Ok(entries) => {
            let entries: HashMap<String, IndexEntry> = entries;
            info!(count = entries.len(), "loaded index");
            entries
        }
        Err(e) => {
            warn!(error = %e, "index unreadable, starting with an empty one");
            HashMap::new()
        }
    }
}

fn guid_for_path(entries: &HashMap<String, IndexEntry>, path: &Path) -> Option<String> {
    let wanted = path.to_string_lossy();
    entries
        .iter()
        .find(|(_, e)| e.file_path == wanted)
        .map(|(guid, _)| guid.clone())
}

/// Replace filesystem-hostile characters with underscores, trim leading and
/// trailing spaces and dots, and cap the stem at 200 characters with the
/// extension preserved.
pub fn sanitize_filename(name: &str) -> String {
    const ILLEGAL: &[char] = &['<', '>', ':', '"', '|', '?', '*', '/', '\\', '\r', '\n', '\t'];

    let cleaned: String = name
        .chars()
        .map(|c| if ILLEGAL.contains(&c) { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == ' ' || c == '.');

    let (stem, ext) = split_ext(cleaned);
    let stem: String = stem.chars().take(MAX_STEM_CHARS).collect();
    format!("{}{}", stem, ext)
}

/// Split into stem and extension (extension includes the dot, may be empty).
fn split_ext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}

pub fn write_atomic(path: &Path, content: &[u8], tmp_dir: &Path) -> Result<()> {
    use rand::Rng;

    let random: u32 = rand::thread_rng().gen();
    let tmp_path = tmp_dir.join(format!("{:x}.part", random));

    fs::write(&tmp_path, content)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(&tmp_path, path)?;

    Ok(())
}
