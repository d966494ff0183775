//! Reader for the Kobo on-device database (`.kobo/KoboReader.sqlite`).
//!
//! Relevant tables:
//! ```sql
//! CREATE TABLE Bookmark (
//!     BookmarkID TEXT NOT NULL,
//!     VolumeID TEXT NOT NULL,            -- the book, "file:///mnt/onboard/.../x.kepub.epub"
//!     ContentID TEXT NOT NULL,           -- chapter, "<volume>!OEBPS!ch01.xhtml#kobo.1.1"
//!     StartContainerPath TEXT NOT NULL,  -- "span#kobo\.12\.3"
//!     StartOffset INTEGER NOT NULL,
//!     EndContainerPath TEXT NOT NULL,
//!     EndOffset INTEGER NOT NULL,
//!     Text TEXT,
//!     Annotation TEXT,                   -- user note, newer firmware only
//!     DateCreated TEXT,
//!     Color INTEGER,                     -- newer firmware only
//!     ...
//! );
//! CREATE TABLE content (ContentID TEXT, ContentType TEXT, Title TEXT, Attribution TEXT, ...);
//! ```
//!
//! The device database is never opened for writing. Reads go through a
//! snapshot taken with the SQLite backup API.

use chrono::{DateTime, NaiveDateTime, Utc};
use eyre::{Context, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension, backup::Backup};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

/// A highlight as stored by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct KoboHighlight {
    pub volume_id: String,
    /// Chapter path inside the EPUB archive, e.g. `OEBPS/ch01.xhtml`.
    pub content_path: String,
    pub start_path: String,
    pub end_path: String,
    pub start_offset: i64,
    pub end_offset: i64,
    pub text: String,
    pub note: Option<String>,
    pub color: Option<i64>,
    pub created: Option<DateTime<Utc>>,
}

/// All highlights of one book on the device.
#[derive(Debug, Clone)]
pub struct KoboVolume {
    pub volume_id: String,
    pub title: Option<String>,
    pub authors: Option<String>,
    pub highlights: Vec<KoboHighlight>,
}

impl KoboVolume {
    /// File name of the book on the device.
    pub fn file_name(&self) -> &str {
        self.volume_id
            .rsplit('/')
            .next()
            .unwrap_or(&self.volume_id)
    }

    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or_else(|| self.file_name())
    }
}

pub fn kobo_db_path(volume_root: &Path) -> PathBuf {
    volume_root.join(".kobo").join("KoboReader.sqlite")
}

/// Copy the device database into a temporary file.
pub fn snapshot_database(db_path: &Path) -> Result<NamedTempFile> {
    let src = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .wrap_err_with(|| format!("Failed to open Kobo database: {}", db_path.display()))?;

    let tmp = NamedTempFile::new().wrap_err("Failed to create temporary file")?;
    let mut dst =
        Connection::open(tmp.path()).wrap_err("Failed to open snapshot database connection")?;

    {
        let backup = Backup::new(&src, &mut dst).wrap_err("Failed to initialize backup")?;
        backup
            .run_to_completion(1000, Duration::from_millis(5), None)
            .wrap_err("Backup did not complete successfully")?;
    }

    tracing::debug!(
        path = %db_path.display(),
        snapshot = %tmp.path().display(),
        "snapshotted Kobo database"
    );
    Ok(tmp)
}

pub fn open_db(path: &Path) -> Result<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .wrap_err_with(|| format!("Failed to open database: {}", path.display()))
}

fn bookmark_columns(conn: &Connection) -> Result<HashSet<String>> {
    let mut stmt = conn
        .prepare("PRAGMA table_info(Bookmark)")
        .wrap_err("Failed to inspect Bookmark table")?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<HashSet<_>, _>>()
        .wrap_err("Failed to read Bookmark columns")?;
    if columns.is_empty() {
        eyre::bail!("Bookmark table not found; is this a Kobo database?");
    }
    Ok(columns)
}

/// Read every highlighted bookmark, grouped by book in first-seen order.
pub fn read_volumes(conn: &Connection) -> Result<Vec<KoboVolume>> {
    let columns = bookmark_columns(conn)?;
    let optional = |name: &str| {
        if columns.contains(name) {
            name.to_string()
        } else {
            "NULL".to_string()
        }
    };
    let query = format!(
        "SELECT VolumeID, ContentID, StartContainerPath, StartOffset, EndContainerPath, EndOffset, \
         Text, {}, {}, {} FROM Bookmark WHERE Text IS NOT NULL AND Text != '' ORDER BY rowid",
        optional("Annotation"),
        optional("Color"),
        optional("DateCreated"),
    );

    let mut stmt = conn.prepare(&query).wrap_err("Failed to prepare bookmark query")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                KoboHighlight {
                    volume_id: row.get(0)?,
                    content_path: String::new(),
                    start_path: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    start_offset: row.get::<_, Option<i64>>(3)?.unwrap_or_default(),
                    end_path: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                    end_offset: row.get::<_, Option<i64>>(5)?.unwrap_or_default(),
                    text: row.get(6)?,
                    note: row
                        .get::<_, Option<String>>(7)?
                        .filter(|n| !n.trim().is_empty()),
                    color: row.get(8)?,
                    created: row
                        .get::<_, Option<String>>(9)?
                        .as_deref()
                        .and_then(parse_kobo_date),
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()
        .wrap_err("Failed to read bookmarks")?;

    let mut volumes: Vec<KoboVolume> = Vec::new();
    for (volume_id, content_id, mut highlight) in rows {
        let Some(content_path) = content_path_from_content_id(&content_id) else {
            tracing::debug!(%content_id, "bookmark has no chapter path, skipping");
            continue;
        };
        highlight.content_path = content_path;

        match volumes.iter_mut().find(|v| v.volume_id == volume_id) {
            Some(volume) => volume.highlights.push(highlight),
            None => {
                let (title, authors) = volume_metadata(conn, &volume_id)?;
                volumes.push(KoboVolume {
                    volume_id,
                    title,
                    authors,
                    highlights: vec![highlight],
                });
            }
        }
    }

    Ok(volumes)
}

fn volume_metadata(conn: &Connection, volume_id: &str) -> Result<(Option<String>, Option<String>)> {
    let found = conn
        .query_row(
            "SELECT Title, Attribution FROM content WHERE ContentID = ?1 LIMIT 1",
            [volume_id],
            |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?)),
        )
        .optional();

    match found {
        Ok(found) => Ok(found.unwrap_or((None, None))),
        // Stripped-down databases (and our fixtures) may lack the content table.
        Err(rusqlite::Error::SqliteFailure(_, Some(msg))) if msg.contains("no such table") => {
            Ok((None, None))
        }
        Err(e) => Err(e).wrap_err_with(|| format!("Failed to read metadata for {}", volume_id)),
    }
}

/// Turn a bookmark `ContentID` into the chapter path inside the EPUB.
///
/// `file:///mnt/onboard/b.kepub.epub!OEBPS!text!ch01.xhtml#kobo.1.1` becomes
/// `OEBPS/text/ch01.xhtml`.
pub fn content_path_from_content_id(content_id: &str) -> Option<String> {
    let tail = content_id
        .rsplit("epub!")
        .next()
        .unwrap_or(content_id)
        .trim_start_matches('!');
    let mut path = tail.replace('!', "/");
    // With several fragments the part between the last two `#` is the path.
    if path.contains('#') {
        path = path.rsplit('#').nth(1).unwrap_or_default().to_string();
    }
    (!path.is_empty()).then_some(path)
}

/// Kobo writes `DateCreated` as RFC 3339 on newer firmware and as a naive
/// `YYYY-MM-DDTHH:MM:SS[.fff]` on older ones.
pub fn parse_kobo_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}
