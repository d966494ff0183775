use crate::calibre::{self, DeviceMetadata, TitleMatch};
use crate::convert::{self, BookReport, ConvertOptions};
use crate::epub::EpubBook;
use crate::kobo::{self, KoboVolume};
use crate::utils::{MigrateConfig, ensure_file};
use eyre::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Summary {
    pub books_seen: usize,
    pub books_matched: usize,
    pub books_skipped: usize,
    pub books_failed: usize,
    pub highlights_seen: usize,
    pub highlights_located: usize,
    pub highlights_failed: usize,
    pub inserted: usize,
    pub already_present: usize,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Books: {} on device, {} matched, {} skipped, {} failed.",
            self.books_seen, self.books_matched, self.books_skipped, self.books_failed
        )?;
        writeln!(
            f,
            "Highlights: {} on device, {} located, {} not located.",
            self.highlights_seen, self.highlights_located, self.highlights_failed
        )?;
        write!(
            f,
            "Annotations: {} inserted, {} already in Calibre.",
            self.inserted, self.already_present
        )
    }
}

/// What happened to one Kobo volume.
enum VolumeOutcome {
    Converted(BookReport),
    Unmatched,
    /// Several library books share the title and none shares an author.
    Ambiguous(usize),
    NoEpub(String),
}

/// Run the whole migration. Nothing is written when `config.dry_run` is set.
pub fn execute(config: &MigrateConfig) -> Result<Summary> {
    let kobo_db = kobo::kobo_db_path(&config.kobo_volume);
    ensure_file(
        &kobo_db,
        "Kobo database",
        "Pass the mount point of the device, e.g. /media/KOBOeReader.",
    )?;
    let calibre_db = calibre::library_db_path(&config.calibre_library);
    ensure_file(
        &calibre_db,
        "Calibre database",
        "Pass the Calibre library folder, the one containing metadata.db.",
    )?;

    let snapshot = kobo::snapshot_database(&kobo_db)?;
    let volumes = {
        let conn = kobo::open_db(snapshot.path())?;
        kobo::read_volumes(&conn)?
    };
    drop(snapshot);
    tracing::info!(books = volumes.len(), "read highlights from Kobo");

    let device_metadata = DeviceMetadata::load(&config.kobo_volume).unwrap_or_else(|e| {
        tracing::warn!("ignoring device metadata, matching by title only: {:#}", e);
        DeviceMetadata::default()
    });

    let mut library = Connection::open(&calibre_db)
        .wrap_err_with(|| format!("Failed to open Calibre database: {}", calibre_db.display()))?;

    let options = ConvertOptions {
        default_color: config.default_color.clone(),
        ..ConvertOptions::default()
    };
    let pb = progress_bar(volumes.len() as u64, config.progress);

    let mut summary = Summary::default();
    let mut to_insert = Vec::new();
    for volume in &volumes {
        pb.set_message(volume.display_name().to_string());
        pb.inc(1);
        if !config.accepts(&volume.volume_id, volume.title.as_deref()) {
            continue;
        }

        summary.books_seen += 1;
        summary.highlights_seen += volume.highlights.len();
        let book = volume.display_name();

        match process_volume(config, &library, &device_metadata, volume, &options) {
            Ok(VolumeOutcome::Converted(report)) => {
                summary.books_matched += 1;
                summary.highlights_located += report.located;
                summary.highlights_failed += report.failed;
                tracing::debug!(
                    book,
                    located = report.located,
                    searched = report.searched,
                    failed = report.failed,
                    "processed book"
                );
                pb.suspend(|| {
                    for chapter in &report.broken_chapters {
                        tracing::warn!(book, chapter = %chapter, "cannot parse chapter");
                    }
                    if report.unverified > 0 {
                        tracing::warn!(
                            book,
                            highlights = report.unverified,
                            "highlight text not found; kept at the device position"
                        );
                    }
                });
                to_insert.extend(report.annotations);
            }
            Ok(outcome) => {
                summary.books_skipped += 1;
                summary.highlights_failed += volume.highlights.len();
                match outcome {
                    VolumeOutcome::Ambiguous(candidates) => pb.suspend(|| {
                        tracing::warn!(book, candidates, "ambiguous title match, skipping it")
                    }),
                    VolumeOutcome::NoEpub(title) => pb.suspend(|| {
                        tracing::warn!(book = %title, "book has no EPUB format, skipping it")
                    }),
                    _ => tracing::debug!(book, "failed to match book, skipping it"),
                }
            }
            Err(e) => {
                summary.books_failed += 1;
                summary.highlights_failed += volume.highlights.len();
                pb.suspend(|| tracing::error!(book, "failed to convert highlights: {:#}", e));
            }
        }
    }
    pb.finish_and_clear();

    if config.dry_run {
        let mut seen = HashSet::new();
        for annotation in &to_insert {
            if !seen.insert(annotation.annot_id())
                || calibre::annotation_exists(&library, annotation.annot_id())?
            {
                summary.already_present += 1;
            }
        }
        tracing::info!(
            would_insert = to_insert.len() - summary.already_present,
            "dry run, Calibre database left untouched"
        );
        return Ok(summary);
    }

    if to_insert.is_empty() {
        tracing::info!("nothing to insert");
        return Ok(summary);
    }

    if config.backup {
        calibre::backup_database(&calibre_db)?;
    }
    summary.inserted = calibre::insert_annotations(&mut library, &to_insert)?;
    summary.already_present = to_insert.len() - summary.inserted;
    tracing::info!(
        inserted = summary.inserted,
        "inserted new highlights from Kobo into Calibre"
    );

    Ok(summary)
}

fn progress_bar(len: u64, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::with_template("{bar:30.green/white} {pos}/{len} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb
}

fn match_book(
    library: &Connection,
    device_metadata: &DeviceMetadata,
    volume: &KoboVolume,
) -> Result<TitleMatch> {
    if let Some(id) = device_metadata.book_id(volume.file_name()) {
        if let Some(book) = calibre::find_book(library, id)? {
            return Ok(TitleMatch::Found(book));
        }
        tracing::debug!(id, "device metadata points at a book missing from the library");
    }

    match volume.title.as_deref() {
        Some(title) => calibre::find_book_by_metadata(library, title, volume.authors.as_deref()),
        None => Ok(TitleMatch::Missing),
    }
}

fn process_volume(
    config: &MigrateConfig,
    library: &Connection,
    device_metadata: &DeviceMetadata,
    volume: &KoboVolume,
    options: &ConvertOptions,
) -> Result<VolumeOutcome> {
    let book = match match_book(library, device_metadata, volume)? {
        TitleMatch::Found(book) => book,
        TitleMatch::Missing => return Ok(VolumeOutcome::Unmatched),
        TitleMatch::Ambiguous(n) => return Ok(VolumeOutcome::Ambiguous(n)),
    };
    let Some(epub_path) = calibre::epub_path(&config.calibre_library, &book)? else {
        return Ok(VolumeOutcome::NoEpub(book.title));
    };

    tracing::debug!(book = %book.title, epub = %epub_path.display(), "processing book");
    let epub = EpubBook::open(&epub_path)?;
    Ok(VolumeOutcome::Converted(convert::convert_book(
        &epub,
        book.id,
        &volume.highlights,
        options,
    )))
}
