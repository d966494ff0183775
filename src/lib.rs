//! # kobo2calibre
//!
//! A CLI tool that copies the highlights made on a [Kobo](https://www.kobo.com) e-reader
//! into a [Calibre](https://calibre-ebook.com) library, where they show up as regular
//! annotations in Calibre's e-book viewer.
//!
//! ## What it does
//!
//! Kobo keeps highlights in `.kobo/KoboReader.sqlite` on the device. Each one records the
//! highlighted text and a position expressed in kepub span ids (`kobo.12.3`), which only
//! exist in the Kobo-converted copy of the book. This tool finds the matching book in the
//! Calibre library, rebuilds the position inside the plain EPUB (falling back to searching
//! for the highlighted text), and inserts an annotation with EPUB CFI anchors into
//! Calibre's `metadata.db`.
//!
//! The device database is only read, through a snapshot. The Calibre database is backed up
//! before anything is written, and annotations that already exist are skipped, so running
//! the tool twice is harmless.
//!
//! ## Usage
//!
//! ```sh
//! # Import everything
//! kobo2calibre /media/KOBOeReader ~/Calibre\ Library
//!
//! # Only one book, without touching the library
//! kobo2calibre /media/KOBOeReader ~/Calibre\ Library --filter-bookname Orwell --dry-run
//! ```
//!
//! Preferences can be persisted in `~/.config/kobo2calibre/config.toml`.
//!
//! ## Compatibility
//!
//! Books must be sent to the device by Calibre as kepubs and still have an EPUB format in
//! the library. Highlights on sideloaded books are matched by title and author.

pub mod calibre;
pub mod convert;
pub mod epub;
pub mod kobo;
pub mod locate;
pub mod migrate;
pub mod sentence;
pub mod utils;
