// ABOUTME: Sync engine walking remote folders and fetching notes
// ABOUTME: Folders run sequentially, notes within a folder concurrently

use crate::api::ApiClient;
use crate::convert::Converter;
use crate::model::NoteSummary;
use crate::stats::{FailureKind, RunStats};
use crate::storage::Store;
use crate::{Error, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

static IMG_SRC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<img[^>]+src="([^"]+)""#).expect("static regex"));

pub struct SyncOptions {
    pub team: String,
    pub incremental: bool,
    pub exclude: Vec<String>,
    pub max_concurrent: usize,
    pub download_attachments: bool,
}

/// Drives one sync run. Folders are visited in order; the notes of a folder
/// fan out over at most `max_concurrent` in-flight fetches, and their
/// outcomes are folded back into one `RunStats` by the single consumer loop,
/// so no counter is ever shared between workers.
pub struct Syncer {
    client: Arc<ApiClient>,
    store: Arc<Store>,
    converter: Option<Converter>,
    team: String,
    incremental: bool,
    exclude: Vec<String>,
    max_concurrent: usize,
    download_attachments: bool,
    cancelled: Arc<AtomicBool>,
}

impl Syncer {
    pub fn new(
        client: Arc<ApiClient>,
        store: Arc<Store>,
        converter: Option<Converter>,
        options: SyncOptions,
    ) -> Self {
        Syncer {
            client,
            store,
            converter,
            team: options.team,
            incremental: options.incremental,
            exclude: options.exclude,
            max_concurrent: options.max_concurrent.max(1),
            download_attachments: options.download_attachments,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag a signal handler can set to stop dispatching further
    /// notes and folders. In-flight fetches finish and state written so
    /// far is still persisted.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Sync the folders named in `scope`, or everything not excluded when
    /// `scope` is empty. Only the initial folder listing is fatal; every
    /// later failure is recorded and the run keeps going.
    pub async fn run(&self, scope: &[String]) -> Result<RunStats> {
        let started = Instant::now();
        let mut stats = RunStats::default();

        let folders = self.client.list_folders().await?;
        if folders.is_empty() {
            warn!("no folders found on the server");
            stats.duration = started.elapsed();
            return Ok(stats);
        }

        let selected = self.select_folders(folders, scope);
        info!(folders = selected.len(), team = %self.team, "starting sync");

        for folder in &selected {
            if self.cancelled.load(Ordering::Relaxed) {
                warn!("cancelled, stopping before {}", folder);
                break;
            }
            self.sync_folder(folder, &mut stats).await;
        }

        self.store.save_index()?;
        let mut state = self.store.load_sync_state();
        let now = Utc::now().to_rfc3339();
        state.last_sync = Some(now.clone());
        state.synced_teams.insert(self.team.clone(), now);
        self.store.save_sync_state(&state)?;

        stats.duration = started.elapsed();
        Ok(stats)
    }

    fn select_folders(&self, folders: Vec<String>, scope: &[String]) -> Vec<String> {
        if !scope.is_empty() {
            let wanted: Vec<String> = scope.iter().map(|s| normalize_folder(s)).collect();
            folders
                .into_iter()
                .filter(|f| wanted.iter().any(|w| f == w || f.starts_with(w.as_str())))
                .collect()
        } else {
            folders
                .into_iter()
                .filter(|f| !self.exclude.iter().any(|e| f.starts_with(e.as_str())))
                .collect()
        }
    }

    async fn sync_folder(&self, folder: &str, stats: &mut RunStats) {
        let notes = match self.client.list_notes(folder).await {
            Ok(notes) => notes,
            Err(e) => {
                warn!(folder = %folder, error = %e, "folder listing failed, skipping");
                stats.record_failure(FailureKind::Folder, folder, "", &e.to_string());
                return;
            }
        };
        stats.total_notes += notes.len();

        let pending: Vec<NoteSummary> = if self.incremental {
            let (pending, skipped): (Vec<_>, Vec<_>) = notes
                .into_iter()
                .partition(|n| self.store.is_modified(&n.guid, n.modified.as_deref()));
            stats.skipped_notes += skipped.len();
            pending
        } else {
            notes
        };

        if pending.is_empty() {
            debug!(folder = %folder, "nothing to fetch");
            return;
        }

        let bar = ProgressBar::new(pending.len() as u64);
        bar.set_style(
            ProgressStyle::with_template("{msg:30} [{bar:30}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_message(folder.to_string());

        let mut outcomes = stream::iter(pending)
            .map(|note| self.sync_note(folder, note))
            .buffer_unordered(self.max_concurrent);

        while let Some(outcome) = outcomes.next().await {
            bar.inc(1);
            stats.absorb(outcome);
        }
        bar.finish_and_clear();
    }

    /// Fetch, convert, and store a single note. Never returns an error;
    /// failures become part of the returned outcome. Once cancellation is
    /// requested, notes not yet started yield an empty outcome without any
    /// network traffic; in-flight fetches still drain.
    async fn sync_note(&self, folder: &str, mut note: NoteSummary) -> RunStats {
        let mut out = RunStats::default();
        if self.cancelled.load(Ordering::Relaxed) {
            debug!(guid = %note.guid, "cancelled before dispatch");
            return out;
        }
        match self.fetch_and_store(folder, &mut note, &mut out).await {
            Ok(()) => {
                out.downloaded_notes += 1;
            }
            Err(e) => {
                warn!(title = %note.display_title(), guid = %note.guid, error = %e, "note failed");
                out.record_failure(
                    FailureKind::Note,
                    note.display_title(),
                    &note.guid,
                    &e.to_string(),
                );
            }
        }
        out
    }

    async fn fetch_and_store(
        &self,
        folder: &str,
        note: &mut NoteSummary,
        out: &mut RunStats,
    ) -> Result<()> {
        if let Some(detail) = self.client.get_note_info(&note.guid).await? {
            note.merge_detail(detail);
        }

        let html = self.client.get_note_html(&note.guid).await?;
        if html.trim().is_empty() {
            return Err(Error::ContentMissing {
                title: note.display_title().to_string(),
                guid: note.guid.clone(),
            });
        }
        out.total_bytes += html.len() as u64;

        // Notes titled *.md carry Markdown in their body, not HTML
        let markdown_native = note.display_title().to_ascii_lowercase().ends_with(".md");
        let resources = resource_refs(&html);
        let (content, media, format) = match &self.converter {
            Some(converter) if markdown_native => {
                (converter.process_markdown(&html, note), Vec::new(), "md")
            }
            Some(converter) => {
                let conversion = converter.convert(&html, note, &resources);
                let (markdown, media) = conversion.into_parts();
                (markdown, media, "md")
            }
            None => (html, Vec::new(), "html"),
        };

        let path = self.store.save_note(&self.team, folder, note, &content, format)?;

        for item in media {
            out.total_bytes += item.bytes.len() as u64;
            self.store.save_resource(&path, &item.filename, &item.bytes)?;
        }

        if self.download_attachments && note.attachment_count > 0 {
            self.sync_attachments(note, &path, out).await;
        }

        Ok(())
    }

    async fn sync_attachments(
        &self,
        note: &NoteSummary,
        note_path: &std::path::Path,
        out: &mut RunStats,
    ) {
        let attachments = match self.client.get_attachments(&note.guid).await {
            Ok(list) => list,
            Err(e) => {
                warn!(guid = %note.guid, error = %e, "attachment listing failed");
                out.record_failure(
                    FailureKind::Attachment,
                    note.display_title(),
                    &note.guid,
                    &e.to_string(),
                );
                return;
            }
        };
        out.total_attachments += attachments.len();

        for att in attachments {
            match self.client.download_attachment(&note.guid, &att.guid).await {
                Ok(bytes) => {
                    out.total_bytes += bytes.len() as u64;
                    match self.store.save_attachment(note_path, &att.name, &bytes) {
                        Ok(_) => out.downloaded_attachments += 1,
                        Err(e) => out.record_failure(
                            FailureKind::Attachment,
                            &att.name,
                            &att.guid,
                            &e.to_string(),
                        ),
                    }
                }
                Err(e) => {
                    out.record_failure(
                        FailureKind::Attachment,
                        &att.name,
                        &att.guid,
                        &e.to_string(),
                    );
                }
            }
        }
    }
}

/// Collect local image references from the raw HTML so the converter can tell
/// stored resources apart from external links. Remote and inline sources are
/// left alone.
pub fn resource_refs(html: &str) -> Vec<String> {
    IMG_SRC_RE
        .captures_iter(html)
        .map(|c| c[1].to_string())
        .filter(|src| {
            !src.starts_with("http://") && !src.starts_with("https://") && !src.starts_with("data:")
        })
        .collect()
}

fn normalize_folder(name: &str) -> String {
    let trimmed = name.trim_matches('/');
    format!("/{}/", trimmed)
}
