use kobo2calibre::migrate;
use kobo2calibre::utils::MigrateConfig;
use rusqlite::Connection;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

const CONTAINER: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

const OPF: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0">
  <manifest>
    <item id="ch01" href="ch01.xhtml" media-type="application/xhtml+xml"/>
  </manifest>
  <spine><itemref idref="ch01"/></spine>
</package>"#;

const CHAPTER: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml">
<head><title>One</title></head>
<body>
<p>It was a bright cold day in April. The clocks were striking thirteen.</p>
<p>Winston Smith slipped quickly through the glass doors.</p>
</body>
</html>"#;

const VOLUME: &str = "file:///mnt/onboard/Orwell/1984 - George Orwell.kepub.epub";
const SIDELOADED: &str = "file:///mnt/onboard/animal-farm.kepub.epub";

fn write_epub(path: &Path) {
    let mut writer = zip::ZipWriter::new(fs::File::create(path).unwrap());
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, content) in [
        ("mimetype", "application/epub+zip"),
        ("META-INF/container.xml", CONTAINER),
        ("OEBPS/content.opf", OPF),
        ("OEBPS/ch01.xhtml", CHAPTER),
    ] {
        writer.start_file(name, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap();
}

fn kobo_fixture(root: &Path) {
    fs::create_dir_all(root.join(".kobo")).unwrap();
    let conn = Connection::open(root.join(".kobo/KoboReader.sqlite")).unwrap();
    conn.execute_batch(
        "CREATE TABLE Bookmark (
            BookmarkID TEXT, VolumeID TEXT, ContentID TEXT,
            StartContainerPath TEXT, StartOffset INTEGER,
            EndContainerPath TEXT, EndOffset INTEGER,
            Text TEXT, Annotation TEXT, DateCreated TEXT, Color INTEGER);
         CREATE TABLE content (ContentID TEXT, ContentType TEXT, Title TEXT, Attribution TEXT);",
    )
    .unwrap();
    let chapter = format!("{}!OEBPS!ch01.xhtml#kobo.1.1", VOLUME);
    conn.execute(
        "INSERT INTO Bookmark VALUES ('a', ?1, ?2, 'span#kobo\\.1\\.2', 0, 'span#kobo\\.1\\.2', 34,
            'The clocks were striking thirteen.', 'a note', '2023-04-01T10:20:30.000', 0)",
        [VOLUME, chapter.as_str()],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO Bookmark VALUES ('b', ?1, ?2, 'span#kobo\\.9\\.1', 0, 'span#kobo\\.9\\.1', 5,
            'glass doors', NULL, NULL, NULL)",
        [VOLUME, chapter.as_str()],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO Bookmark VALUES ('c', ?1, ?2, 'span#kobo\\.1\\.1', 0, 'span#kobo\\.1\\.1', 3,
            'All animals are equal', NULL, NULL, NULL)",
        [SIDELOADED, format!("{}!ch.xhtml", SIDELOADED).as_str()],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO content VALUES (?1, '6', 'Animal Farm', 'George Orwell')",
        [SIDELOADED],
    )
    .unwrap();

    fs::write(
        root.join("metadata.calibre"),
        r#"[{"lpath": "Orwell/1984 - George Orwell.kepub.epub", "application_id": 1, "title": "1984"}]"#,
    )
    .unwrap();
}

fn calibre_fixture(root: &Path) {
    let book_dir = root.join("George Orwell/1984 (1)");
    fs::create_dir_all(&book_dir).unwrap();
    write_epub(&book_dir.join("1984 - George Orwell.epub"));

    let conn = Connection::open(root.join("metadata.db")).unwrap();
    conn.execute_batch(
        "CREATE TABLE books (id INTEGER PRIMARY KEY, title TEXT, path TEXT);
         CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT);
         CREATE TABLE books_authors_link (id INTEGER PRIMARY KEY, book INTEGER, author INTEGER);
         CREATE TABLE annotations (
            id INTEGER PRIMARY KEY, book INTEGER NOT NULL, format TEXT NOT NULL,
            user_type TEXT NOT NULL, user TEXT NOT NULL, timestamp REAL NOT NULL,
            annot_id TEXT NOT NULL, annot_type TEXT NOT NULL, annot_data TEXT NOT NULL,
            searchable_text TEXT NOT NULL DEFAULT '');
         INSERT INTO books VALUES (1, '1984', 'George Orwell/1984 (1)');
         INSERT INTO authors VALUES (1, 'George Orwell');
         INSERT INTO books_authors_link VALUES (1, 1, 1);",
    )
    .unwrap();
}

fn setup() -> (TempDir, MigrateConfig) {
    let dir = tempfile::tempdir().unwrap();
    let kobo = dir.path().join("KOBOeReader");
    let library = dir.path().join("Calibre Library");
    kobo_fixture(&kobo);
    calibre_fixture(&library);
    let config = MigrateConfig::new(kobo, library);
    (dir, config)
}

fn annotation_rows(library: &Path) -> Vec<(i64, String, String)> {
    let conn = Connection::open(library.join("metadata.db")).unwrap();
    let mut stmt = conn
        .prepare("SELECT book, annot_data, searchable_text FROM annotations ORDER BY id")
        .unwrap();
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    rows
}

#[test]
fn migrates_highlights_into_calibre() {
    let (_dir, config) = setup();

    let summary = migrate::execute(&config).unwrap();
    assert_eq!(summary.books_seen, 2);
    assert_eq!(summary.books_matched, 1);
    assert_eq!(summary.books_skipped, 1);
    assert_eq!(summary.highlights_seen, 3);
    assert_eq!(summary.highlights_located, 2);
    assert_eq!(summary.highlights_failed, 1);
    assert_eq!(summary.inserted, 2);

    let rows = annotation_rows(&config.calibre_library);
    assert_eq!(rows.len(), 2);

    let (book, data, searchable) = &rows[0];
    assert_eq!(*book, 1);
    assert_eq!(searchable, "The clocks were striking thirteen.\na note");
    let data: serde_json::Value = serde_json::from_str(data).unwrap();
    assert_eq!(data["start_cfi"], "/2/4/2/1:35");
    assert_eq!(data["end_cfi"], "/2/4/2/1:69");
    assert_eq!(data["spine_name"], "OEBPS/ch01.xhtml");
    assert_eq!(data["spine_index"], 0);
    assert_eq!(data["style"]["which"], "yellow");
    assert_eq!(data["timestamp"], "2023-04-01T10:20:30Z");
    assert_eq!(data["notes"], "a note");

    // Found by searching: paragraph 9 does not exist.
    let data: serde_json::Value = serde_json::from_str(&rows[1].1).unwrap();
    assert_eq!(data["start_cfi"], "/2/4/4/1:42");
    assert_eq!(data["end_cfi"], "/2/4/4/1:53");
    assert_eq!(data["style"]["which"], "green");

    let backups = fs::read_dir(&config.calibre_library)
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().ends_with(".bak"))
        .count();
    assert_eq!(backups, 1);
}

#[test]
fn second_run_inserts_nothing() {
    let (_dir, mut config) = setup();
    config.backup = false;

    migrate::execute(&config).unwrap();
    let summary = migrate::execute(&config).unwrap();
    assert_eq!(summary.inserted, 0);
    assert_eq!(summary.already_present, 2);
    assert_eq!(annotation_rows(&config.calibre_library).len(), 2);
}

#[test]
fn dry_run_leaves_library_untouched() {
    let (_dir, mut config) = setup();
    config.dry_run = true;
    config.filter_bookname = Some("1984".into());

    let summary = migrate::execute(&config).unwrap();
    assert_eq!(summary.books_seen, 1);
    assert_eq!(summary.highlights_located, 2);
    assert_eq!(summary.inserted, 0);
    assert_eq!(summary.already_present, 0);
    assert!(annotation_rows(&config.calibre_library).is_empty());
}

#[test]
fn missing_kobo_database_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let library = dir.path().join("lib");
    calibre_fixture(&library);
    let config = MigrateConfig::new(dir.path().join("nowhere"), library);

    let err = migrate::execute(&config).unwrap_err();
    assert!(format!("{:#}", err).contains("Kobo database not found"));
}

#[test]
fn unreadable_epub_counts_book_as_failed() {
    let (_dir, config) = setup();
    let epub = config
        .calibre_library
        .join("George Orwell/1984 (1)/1984 - George Orwell.epub");
    fs::write(&epub, b"this is not a zip archive").unwrap();

    let summary = migrate::execute(&config).unwrap();
    assert_eq!(summary.books_seen, 2);
    assert_eq!(summary.books_matched, 0);
    assert_eq!(summary.books_failed, 1);
    assert_eq!(summary.books_skipped, 1);
    assert_eq!(summary.highlights_failed, 3);
    assert_eq!(summary.inserted, 0);
    assert!(annotation_rows(&config.calibre_library).is_empty());
}

#[test]
fn malformed_device_metadata_falls_back_to_title() {
    let (_dir, mut config) = setup();
    config.backup = false;
    fs::write(config.kobo_volume.join("metadata.calibre"), "{ not json").unwrap();
    let conn = Connection::open(config.kobo_volume.join(".kobo/KoboReader.sqlite")).unwrap();
    conn.execute(
        "INSERT INTO content VALUES (?1, '6', '1984', 'George Orwell')",
        [VOLUME],
    )
    .unwrap();
    drop(conn);

    let summary = migrate::execute(&config).unwrap();
    assert_eq!(summary.books_failed, 0);
    assert_eq!(summary.books_matched, 1);
    assert_eq!(summary.inserted, 2);
}
