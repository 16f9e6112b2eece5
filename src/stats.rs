// ABOUTME: Run statistics accumulated across a sync or import run
// ABOUTME: Renders the end-of-run report with a capped failure list

use crate::storage::StoreStats;
use crate::util::format_size;
use std::time::Duration;

const MAX_REPORTED_FAILURES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Folder,
    Note,
    Attachment,
}

impl FailureKind {
    fn label(&self) -> &'static str {
        match self {
            FailureKind::Folder => "folder",
            FailureKind::Note => "note",
            FailureKind::Attachment => "attachment",
        }
    }
}

/// One failed item, kept so the report can name exactly what went wrong.
#[derive(Debug, Clone)]
pub struct FailedItem {
    pub kind: FailureKind,
    pub title: String,
    pub guid: String,
    pub error: String,
}

/// Counters for one run. A run with failures still completes; the exit
/// status decision belongs to the caller, this type only keeps score.
#[derive(Debug, Default)]
pub struct RunStats {
    pub total_notes: usize,
    pub downloaded_notes: usize,
    pub skipped_notes: usize,
    pub failed_notes: usize,
    pub total_attachments: usize,
    pub downloaded_attachments: usize,
    pub failed_attachments: usize,
    pub total_bytes: u64,
    pub duration: Duration,
    pub failed_items: Vec<FailedItem>,
}

impl RunStats {
    pub fn record_failure(&mut self, kind: FailureKind, title: &str, guid: &str, error: &str) {
        match kind {
            FailureKind::Note => self.failed_notes += 1,
            FailureKind::Attachment => self.failed_attachments += 1,
            FailureKind::Folder => {}
        }
        self.failed_items.push(FailedItem {
            kind,
            title: title.to_string(),
            guid: guid.to_string(),
            error: error.to_string(),
        });
    }

    /// Fold the outcome of one note worker into the run totals.
    pub fn absorb(&mut self, other: RunStats) {
        self.total_notes += other.total_notes;
        self.downloaded_notes += other.downloaded_notes;
        self.skipped_notes += other.skipped_notes;
        self.failed_notes += other.failed_notes;
        self.total_attachments += other.total_attachments;
        self.downloaded_attachments += other.downloaded_attachments;
        self.failed_attachments += other.failed_attachments;
        self.total_bytes += other.total_bytes;
        self.failed_items.extend(other.failed_items);
    }

    pub fn has_failures(&self) -> bool {
        !self.failed_items.is_empty()
    }

    pub fn render_report(&self, store: &StoreStats) -> String {
        let mut out = String::new();
        out.push_str("Export complete\n");
        out.push_str(&format!(
            "  Notes: {} downloaded, {} skipped, {} failed (of {})\n",
            self.downloaded_notes, self.skipped_notes, self.failed_notes, self.total_notes
        ));
        if self.total_attachments > 0 {
            out.push_str(&format!(
                "  Attachments: {} downloaded, {} failed (of {})\n",
                self.downloaded_attachments, self.failed_attachments, self.total_attachments
            ));
        }
        out.push_str(&format!(
            "  Transferred: {} in {:.1}s\n",
            format_size(self.total_bytes),
            self.duration.as_secs_f64()
        ));
        out.push_str(&format!(
            "  Store: {} notes, {} files, {}\n",
            store.total_notes,
            store.total_files,
            format_size(store.total_size)
        ));

        if !self.failed_items.is_empty() {
            out.push_str("\nFailures:\n");
            for item in self.failed_items.iter().take(MAX_REPORTED_FAILURES) {
                out.push_str(&format!(
                    "  [{}] {} ({}): {}\n",
                    item.kind.label(),
                    item.title,
                    item.guid,
                    item.error
                ));
            }
            let remaining = self.failed_items.len().saturating_sub(MAX_REPORTED_FAILURES);
            if remaining > 0 {
                out.push_str(&format!("  ... and {} more\n", remaining));
            }
        }

        out
    }
}
