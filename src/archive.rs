// ABOUTME: Packaged note bundles read from local zip archives
// ABOUTME: Legacy bundles ship non-UTF-8 markup, decoded with a fallback chain

use crate::convert::Converter;
use crate::model::{ExtractedMedia, NoteSummary};
use crate::stats::{FailureKind, RunStats};
use crate::storage::Store;
use crate::{Error, Result};
use encoding_rs::{Encoding, GB18030, GBK, UTF_16LE, UTF_8};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

const MARKUP_ENTRY: &str = "index.html";
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "webp"];
const BUNDLE_EXTENSIONS: &[&str] = &["zip", "ziw"];

/// One note packaged as a zip archive: a markup entry plus embedded media.
/// The file stem doubles as the note's identity.
pub struct NoteBundle {
    guid: String,
    archive: zip::ZipArchive<File>,
}

impl NoteBundle {
    pub fn open(path: &Path) -> Result<Self> {
        let guid = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Archive(format!("no file stem: {}", path.display())))?;
        let file = File::open(path)?;
        let archive = zip::ZipArchive::new(file)?;
        Ok(NoteBundle { guid, archive })
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// Decode the markup entry. Legacy exports come in several encodings,
    /// so strict decoding is tried in order before falling back to lossy
    /// UTF-8, which always yields something renderable.
    pub fn markup(&mut self) -> Result<String> {
        let entry_name = self
            .archive
            .file_names()
            .find(|n| n == &MARKUP_ENTRY || n.ends_with("/index.html"))
            .map(String::from)
            .ok_or_else(|| Error::Archive(format!("{}: no {} entry", self.guid, MARKUP_ENTRY)))?;

        let mut entry = self.archive.by_name(&entry_name)?;
        let mut raw = Vec::new();
        entry.read_to_end(&mut raw)?;

        Ok(decode_markup(&raw))
    }

    /// Embedded image entries, recognized by extension.
    pub fn media(&mut self) -> Result<Vec<ExtractedMedia>> {
        let names: Vec<String> = self
            .archive
            .file_names()
            .filter(|n| is_image_name(n))
            .map(String::from)
            .collect();

        let mut media = Vec::with_capacity(names.len());
        for name in names {
            let mut entry = self.archive.by_name(&name)?;
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            let filename = name.rsplit('/').next().unwrap_or(&name).to_string();
            media.push(ExtractedMedia { filename, bytes });
        }
        Ok(media)
    }
}

fn decode_markup(raw: &[u8]) -> String {
    const CHAIN: &[&'static Encoding] = &[UTF_8, UTF_16LE, GBK, GB18030];
    for encoding in CHAIN {
        if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(raw) {
            return text.into_owned();
        }
    }
    String::from_utf8_lossy(raw).into_owned()
}

fn is_image_name(name: &str) -> bool {
    name.rsplit('.')
        .next()
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

fn is_bundle(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            BUNDLE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

/// Import every bundle under `dir` through the same convert-and-place path
/// the remote engine uses. The directory layout below `dir` becomes the
/// folder hierarchy. Per-bundle failures are recorded and skipped.
pub fn import_dir(
    dir: &Path,
    store: &Store,
    converter: Option<&Converter>,
    team: &str,
) -> Result<RunStats> {
    let started = Instant::now();
    let mut stats = RunStats::default();

    let mut bundles = Vec::new();
    collect_bundles(dir, &mut bundles)?;
    bundles.sort();
    info!(count = bundles.len(), "found bundles");

    for path in &bundles {
        stats.total_notes += 1;
        match import_bundle(path, dir, store, converter, team) {
            Ok(bytes) => {
                stats.downloaded_notes += 1;
                stats.total_bytes += bytes;
            }
            Err(e) => {
                let name = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                warn!(bundle = %path.display(), error = %e, "bundle import failed");
                stats.record_failure(FailureKind::Note, &name, &name, &e.to_string());
            }
        }
    }

    store.save_index()?;
    stats.duration = started.elapsed();
    Ok(stats)
}

fn collect_bundles(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_bundles(&path, out)?;
        } else if is_bundle(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn import_bundle(
    path: &Path,
    root: &Path,
    store: &Store,
    converter: Option<&Converter>,
    team: &str,
) -> Result<u64> {
    let mut bundle = NoteBundle::open(path)?;
    let html = bundle.markup()?;
    if html.trim().is_empty() {
        return Err(Error::ContentMissing {
            title: bundle.guid().to_string(),
            guid: bundle.guid().to_string(),
        });
    }
    let mut bytes = html.len() as u64;

    let folder = folder_from_path(path, root);
    let note = synthesized_note(&bundle);

    let bundled = bundle.media()?;
    let resources: Vec<String> = bundled.iter().map(|m| m.filename.clone()).collect();

    let (content, inline_media, format) = match converter {
        Some(converter) => {
            let (markdown, media) = converter.convert(&html, &note, &resources).into_parts();
            (markdown, media, "md")
        }
        None => (html, Vec::new(), "html"),
    };

    let note_path = store.save_note(team, &folder, &note, &content, format)?;
    debug!(path = %note_path.display(), "imported bundle");

    for item in bundled.into_iter().chain(inline_media) {
        bytes += item.bytes.len() as u64;
        store.save_resource(&note_path, &item.filename, &item.bytes)?;
    }

    Ok(bytes)
}

fn folder_from_path(path: &Path, root: &Path) -> String {
    let relative = path.parent().and_then(|p| p.strip_prefix(root).ok());
    match relative {
        Some(rel) if rel.as_os_str().is_empty() => "/".to_string(),
        Some(rel) => {
            let mut folder = String::from("/");
            for part in rel.components() {
                folder.push_str(&part.as_os_str().to_string_lossy());
                folder.push('/');
            }
            folder
        }
        None => "/".to_string(),
    }
}

fn synthesized_note(bundle: &NoteBundle) -> NoteSummary {
    let mut note = NoteSummary::default();
    note.guid = bundle.guid().to_string();
    note.title = Some(bundle.guid().to_string());
    note
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_bundle(path: &Path, markup: &[u8], media: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        writer.start_file("index.html", options).unwrap();
        writer.write_all(markup).unwrap();
        for (name, bytes) in media {
            writer.start_file(*name, options).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_bundle_markup_and_media() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("note-1.zip");
        write_bundle(
            &path,
            b"<html><body><p>Hello</p></body></html>",
            &[
                ("index_files/pic.PNG", b"\x89PNG" as &[u8]),
                ("index_files/notes.txt", b"skip me"),
            ],
        );

        let mut bundle = NoteBundle::open(&path).unwrap();
        assert_eq!(bundle.guid(), "note-1");
        assert!(bundle.markup().unwrap().contains("Hello"));

        let media = bundle.media().unwrap();
        assert_eq!(media.len(), 1);
        assert_eq!(media[0].filename, "pic.PNG");
        assert_eq!(media[0].bytes, b"\x89PNG");
    }

    #[test]
    fn test_markup_decodes_gbk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cn.zip");
        // "中文" in GBK, invalid as UTF-8
        let gbk_bytes: &[u8] = &[
            b'<', b'p', b'>', 0xd6, 0xd0, 0xce, 0xc4, b'<', b'/', b'p', b'>',
        ];
        write_bundle(&path, gbk_bytes, &[]);

        let mut bundle = NoteBundle::open(&path).unwrap();
        let markup = bundle.markup().unwrap();
        assert!(markup.contains('中') || markup.contains("中文"));
    }

    #[test]
    fn test_missing_markup_entry_is_archive_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.zip");
        let file = File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("other.txt", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"x").unwrap();
        writer.finish().unwrap();

        let mut bundle = NoteBundle::open(&path).unwrap();
        assert!(matches!(bundle.markup(), Err(Error::Archive(_))));
    }

    #[test]
    fn test_import_dir_places_notes_and_records_failures() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("Work")).unwrap();

        write_bundle(
            &src.join("Work/good.zip"),
            b"<html><body><h2>Hi</h2></body></html>",
            &[],
        );
        // not a zip at all
        fs::write(src.join("Work/broken.zip"), b"garbage").unwrap();

        let out = temp.path().join("out");
        let store = Store::open(&out, true).unwrap();
        let converter = Converter::new(true, false);

        let stats = import_dir(&src, &store, Some(&converter), "Imported").unwrap();
        assert_eq!(stats.total_notes, 2);
        assert_eq!(stats.downloaded_notes, 1);
        assert_eq!(stats.failed_notes, 1);
        assert_eq!(stats.failed_items.len(), 1);

        let note_path = out.join("Imported/Work/good.md");
        assert!(note_path.exists());
        assert!(fs::read_to_string(&note_path).unwrap().contains("## Hi"));
    }

    #[test]
    fn test_folder_from_path_nesting() {
        let root = Path::new("/data");
        assert_eq!(folder_from_path(Path::new("/data/a.zip"), root), "/");
        assert_eq!(
            folder_from_path(Path::new("/data/Work/Projects/a.zip"), root),
            "/Work/Projects/"
        );
    }
}
