//! # rblibrary — the Track Library Scanner
//!
//! Walks a directory tree for audio files, extracts metadata (tags first,
//! path-parsing fallback second), fingerprints each file for rescan-change
//! detection, and upserts into the `music_library` table.
//!
//! File I/O never runs on the caller's task: [`scan_paths`] spawns a
//! blocking walk and streams paths back; [`LibraryScanner::scan_directory`]
//! then extracts each file's metadata inside its own `spawn_blocking` call
//! so a slow tag read on one file doesn't stall anything else.

pub mod error;

pub use error::{Error, Result};

use chrono::Utc;
use futures::{Stream, StreamExt};
use lofty::file::{AudioFile, TaggedFileExt};
use lofty::probe::Probe;
use lofty::tag::Accessor;
use md5::{Digest, Md5};
use rbtypes::Track;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use walkdir::WalkDir;

/// Extensions recognized as audio files, matched case-insensitively.
pub const AUDIO_EXTENSIONS: &[&str] =
    &["mp3", "flac", "ogg", "wav", "m4a", "aac", "opus", "wma"];

/// Recursively walks `root` off the calling task, yielding every audio
/// file found.
pub fn scan_paths(root: PathBuf) -> impl Stream<Item = PathBuf> {
    let (tx, rx) = mpsc::channel(100);

    tokio::task::spawn_blocking(move || {
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let is_audio = path
                .extension()
                .and_then(|s| s.to_str())
                .map(|ext| AUDIO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                .unwrap_or(false);
            if is_audio && tx.blocking_send(path.to_path_buf()).is_err() {
                break;
            }
        }
    });

    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|path| (path, rx)) })
}

/// Owns the `music_library` table and drives scans against it.
pub struct LibraryScanner {
    conn: Arc<StdMutex<Connection>>,
}

impl LibraryScanner {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS music_library (
                file_path TEXT PRIMARY KEY,
                artist TEXT,
                title TEXT,
                album TEXT,
                genre TEXT,
                year INTEGER,
                duration_seconds INTEGER NOT NULL,
                file_hash TEXT NOT NULL,
                last_scanned TEXT NOT NULL
            )",
        )?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    /// Walks `root`, extracting and upserting one record per file. A
    /// single file's extraction failure doesn't abort the scan — it's
    /// logged and skipped.
    pub async fn scan_directory(&self, root: PathBuf) -> Result<usize> {
        let mut stream = Box::pin(scan_paths(root));
        let mut scanned = 0usize;

        while let Some(path) = stream.next().await {
            let extracted = tokio::task::spawn_blocking(move || extract_track(&path)).await;
            match extracted {
                Ok(Ok(track)) => {
                    if let Err(e) = self.upsert(&track) {
                        tracing::warn!(file = %track.file_path, error = %e, "failed to persist scanned track");
                        continue;
                    }
                    scanned += 1;
                }
                Ok(Err((path, e))) => {
                    tracing::warn!(file = %path.display(), error = %e, "scan failed for file, skipping");
                }
                Err(join_err) => {
                    tracing::warn!(error = %join_err, "scan task panicked");
                }
            }
        }

        Ok(scanned)
    }

    fn upsert(&self, track: &Track) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO music_library
                (file_path, artist, title, album, genre, year, duration_seconds, file_hash, last_scanned)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(file_path) DO UPDATE SET
                artist = excluded.artist,
                title = excluded.title,
                album = excluded.album,
                genre = excluded.genre,
                year = excluded.year,
                duration_seconds = excluded.duration_seconds,
                file_hash = excluded.file_hash,
                last_scanned = excluded.last_scanned",
            params![
                track.file_path,
                track.artist,
                track.title,
                track.album,
                track.genre,
                track.year,
                track.duration_seconds,
                track.file_hash,
                track.last_scanned.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Loads the whole library, ordered by path.
    pub fn load_all(&self) -> Result<Vec<Track>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT file_path, artist, title, album, genre, year, duration_seconds, file_hash, last_scanned
             FROM music_library ORDER BY file_path",
        )?;
        let rows = stmt.query_map([], |row| {
            let last_scanned: String = row.get(8)?;
            Ok(Track {
                file_path: row.get(0)?,
                artist: row.get(1)?,
                title: row.get(2)?,
                album: row.get(3)?,
                genre: row.get(4)?,
                year: row.get(5)?,
                duration_seconds: row.get(6)?,
                file_hash: row.get(7)?,
                last_scanned: chrono::DateTime::parse_from_rfc3339(&last_scanned)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

/// Extracts a [`Track`] record from a file: tags first, then path parsing
/// for whatever the tags didn't cover, then a content fingerprint.
fn extract_track(path: &Path) -> std::result::Result<Track, (PathBuf, Error)> {
    let (mut artist, mut title, mut album, mut genre, mut year, mut duration_seconds) =
        (None, None, None, None, None, 0u32);

    match Probe::open(path).and_then(|p| p.read()) {
        Ok(tagged_file) => {
            let tag = tagged_file.primary_tag().or_else(|| tagged_file.first_tag());
            if let Some(tag) = tag {
                artist = tag.artist().map(|s| s.to_string());
                title = tag.title().map(|s| s.to_string());
                album = tag.album().map(|s| s.to_string());
                genre = tag.genre().map(|s| s.to_string());
                year = tag.year();
            }
            duration_seconds = tagged_file.properties().duration().as_secs() as u32;
        }
        Err(e) => {
            tracing::debug!(file = %path.display(), error = %e, "tag read failed, falling back to path parsing");
        }
    }

    if artist.is_none() || title.is_none() {
        let (fallback_artist, fallback_title) = parse_path_fallback(path);
        artist = artist.or(fallback_artist);
        title = title.or(fallback_title);
    }

    let file_hash = fingerprint(path).map_err(|e| (path.to_path_buf(), Error::from(e)))?;

    Ok(Track {
        file_path: path.display().to_string(),
        artist,
        title,
        album,
        genre,
        year,
        duration_seconds,
        file_hash,
        last_scanned: Utc::now(),
    })
}

/// Path-based metadata fallback when tags are absent or unreadable:
/// - `"artist - title"` stems split on `" - "`; if the left part is purely
///   digits and the path has at least two components, the parent directory
///   is promoted to artist instead (track-numbered filenames).
/// - otherwise, leading digits/punctuation are stripped from the stem and
///   the parent directory is used as artist when the file is nested.
fn parse_path_fallback(path: &Path) -> (Option<String>, Option<String>) {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let parent_name = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|s| s.to_str())
        .map(|s| s.to_string());

    if let Some((left, right)) = stem.split_once(" - ") {
        let left = left.trim();
        let right = right.trim();
        if !left.is_empty() && left.chars().all(|c| c.is_ascii_digit()) && path.components().count() >= 2 {
            return (parent_name, Some(right.to_string()));
        }
        return (Some(left.to_string()), Some(right.to_string()));
    }

    let stripped: String = stem
        .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == '-' || c == ' ')
        .to_string();
    let title = if stripped.is_empty() { None } else { Some(stripped) };
    let artist = if path.parent().is_some() { parent_name } else { None };
    (artist, title)
}

/// md5 over the ASCII file size followed by the file's first 8 KiB.
fn fingerprint(path: &Path) -> std::io::Result<String> {
    use std::io::Read;

    let metadata = std::fs::metadata(path)?;
    let size = metadata.len();

    let mut file = std::fs::File::open(path)?;
    let mut prefix = vec![0u8; 8192.min(size as usize)];
    file.read_exact(&mut prefix)?;

    let mut hasher = Md5::new();
    hasher.update(size.to_string().as_bytes());
    hasher.update(&prefix);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn scan_paths_finds_only_audio_extensions_case_insensitively() {
        let dir = tempdir().unwrap();
        let root = dir.path();

        File::create(root.join("song.mp3")).unwrap();
        File::create(root.join("notes.txt")).unwrap();
        File::create(root.join("UPPERCASE.OGG")).unwrap();
        std::fs::create_dir(root.join("sub")).unwrap();
        File::create(root.join("sub/track.flac")).unwrap();

        let found: Vec<PathBuf> = scan_paths(root.to_path_buf()).collect::<Vec<_>>().await;
        let names: Vec<String> = found
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(|s| s.to_string()))
            .collect();

        assert_eq!(found.len(), 3);
        assert!(names.contains(&"song.mp3".to_string()));
        assert!(names.contains(&"UPPERCASE.OGG".to_string()));
        assert!(names.contains(&"track.flac".to_string()));
    }

    #[test]
    fn path_fallback_splits_artist_dash_title() {
        let path = Path::new("/music/Queen/Queen - Bohemian Rhapsody.mp3");
        let (artist, title) = parse_path_fallback(path);
        assert_eq!(artist.as_deref(), Some("Queen"));
        assert_eq!(title.as_deref(), Some("Bohemian Rhapsody"));
    }

    #[test]
    fn path_fallback_promotes_parent_dir_when_left_side_is_track_number() {
        let path = Path::new("/music/Queen/A Night at the Opera/03 - Bohemian Rhapsody.mp3");
        let (artist, title) = parse_path_fallback(path);
        assert_eq!(artist.as_deref(), Some("A Night at the Opera"));
        assert_eq!(title.as_deref(), Some("Bohemian Rhapsody"));
    }

    #[test]
    fn path_fallback_strips_leading_track_number_without_dash_split() {
        let path = Path::new("/music/Queen/03. Bohemian Rhapsody.mp3");
        let (artist, title) = parse_path_fallback(path);
        assert_eq!(artist.as_deref(), Some("Queen"));
        assert_eq!(title.as_deref(), Some("Bohemian Rhapsody"));
    }

    #[test]
    fn fingerprint_differs_for_different_content() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        File::create(&a).unwrap().write_all(b"hello world").unwrap();
        File::create(&b).unwrap().write_all(b"goodbye world").unwrap();

        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[tokio::test]
    async fn scan_directory_persists_extracted_tracks() {
        let dir = tempdir().unwrap();
        File::create(dir.path().join("Artist - Song.mp3"))
            .unwrap()
            .write_all(b"not really audio but enough bytes to fingerprint 0123456789")
            .unwrap();

        let db_path = dir.path().join("library.db");
        let scanner = LibraryScanner::new(&db_path).unwrap();
        let count = scanner.scan_directory(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(count, 1);

        let tracks = scanner.load_all().unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].artist.as_deref(), Some("Artist"));
        assert_eq!(tracks[0].title.as_deref(), Some("Song"));
    }
}
