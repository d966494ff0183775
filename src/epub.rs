//! In-memory view of a Calibre EPUB: archive entries and the spine.

use eyre::{Context, Result, eyre};
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;
use zip::ZipArchive;

#[derive(Debug)]
pub struct EpubBook {
    entries: HashMap<String, Vec<u8>>,
    /// Archive path of each spine document to its position in the spine.
    spine_index: HashMap<String, usize>,
    /// Manifest hrefs that had to be resolved to a different archive path.
    fixed_paths: HashMap<String, String>,
}

impl EpubBook {
    pub fn open(path: &Path) -> Result<Self> {
        let data =
            fs::read(path).wrap_err_with(|| format!("Failed to read EPUB: {}", path.display()))?;
        Self::from_bytes(&data).wrap_err_with(|| format!("Invalid EPUB: {}", path.display()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut archive =
            ZipArchive::new(Cursor::new(data)).wrap_err("Failed to open zip archive")?;

        let mut entries = HashMap::new();
        for i in 0..archive.len() {
            let mut file = archive.by_index(i)?;
            if file.is_file() {
                let name = file.name().to_string();
                let mut content = Vec::new();
                file.read_to_end(&mut content)
                    .wrap_err_with(|| format!("Failed to extract {}", name))?;
                entries.insert(name, content);
            }
        }

        let opf_path = find_opf_path(&entries)?;
        let opf = entries
            .get(&opf_path)
            .map(|bytes| decode_text(bytes))
            .ok_or_else(|| eyre!("Package document missing from archive: {}", opf_path))?;
        let opf_dir = opf_path
            .rsplit_once('/')
            .map(|(dir, _)| dir.to_string())
            .unwrap_or_default();

        let mut book = Self {
            entries,
            spine_index: HashMap::new(),
            fixed_paths: HashMap::new(),
        };
        book.read_spine(&opf, &opf_dir)
            .wrap_err_with(|| format!("Failed to read spine from {}", opf_path))?;
        Ok(book)
    }

    fn read_spine(&mut self, opf: &str, opf_dir: &str) -> Result<()> {
        let doc = roxmltree::Document::parse(opf).wrap_err("Failed to parse package document")?;

        let spine: HashMap<&str, usize> = doc
            .descendants()
            .filter(|n| n.tag_name().name() == "itemref")
            .filter_map(|n| n.attribute("idref"))
            .enumerate()
            .map(|(i, idref)| (idref, i))
            .collect();
        tracing::debug!(items = spine.len(), "read spine");

        for item in doc.descendants().filter(|n| n.tag_name().name() == "item") {
            let (Some(id), Some(href), Some(media_type)) = (
                item.attribute("id"),
                item.attribute("href"),
                item.attribute("media-type"),
            ) else {
                continue;
            };
            let Some(&index) = spine.get(id) else {
                continue;
            };
            if !media_type.contains("application/xhtml") {
                continue;
            }

            let href = href.split('#').next().unwrap_or(href);
            let Some(archive_path) = self.resolve_manifest_href(href, opf_dir) else {
                tracing::debug!(href, "spine document not found in archive");
                continue;
            };
            if archive_path != href {
                self.fixed_paths.insert(href.to_string(), archive_path.clone());
            }
            self.spine_index.insert(archive_path, index);
        }

        if self.spine_index.is_empty() {
            return Err(eyre!("No XHTML documents in spine"));
        }
        Ok(())
    }

    fn resolve_manifest_href(&self, href: &str, opf_dir: &str) -> Option<String> {
        let decoded = urlencoding::decode(href)
            .map(|d| d.into_owned())
            .unwrap_or_else(|_| href.to_string());
        [href.to_string(), decoded.clone(), join_archive_path(opf_dir, &decoded)]
            .into_iter()
            .find(|candidate| self.entries.contains_key(candidate))
            .or_else(|| self.find_by_file_name(&decoded))
    }

    fn find_by_file_name(&self, path: &str) -> Option<String> {
        let name = path.rsplit('/').next().unwrap_or(path);
        let mut found: Vec<&String> = self
            .entries
            .keys()
            .filter(|k| k.rsplit('/').next() == Some(name))
            .collect();
        found.sort();
        // Prefer an entry ending with the whole of `path`.
        found
            .iter()
            .find(|k| k.ends_with(&format!("/{}", path)))
            .or_else(|| found.first())
            .map(|k| k.to_string())
    }

    /// Map a chapter path as the device recorded it to an archive entry.
    pub fn resolve_content_path(&self, path: &str) -> Option<String> {
        if let Some(fixed) = self.fixed_paths.get(path) {
            return Some(fixed.clone());
        }
        if self.entries.contains_key(path) {
            return Some(path.to_string());
        }
        let bang = path.replace('/', "!");
        if self.entries.contains_key(&bang) {
            return Some(bang);
        }
        if let Ok(decoded) = urlencoding::decode(path)
            && self.entries.contains_key(decoded.as_ref())
        {
            return Some(decoded.into_owned());
        }
        self.find_by_file_name(path)
    }

    pub fn spine_index(&self, archive_path: &str) -> Option<usize> {
        self.spine_index.get(archive_path).copied()
    }

    pub fn spine_len(&self) -> usize {
        self.spine_index.len()
    }

    pub fn read_text(&self, archive_path: &str) -> Result<String> {
        self.entries
            .get(archive_path)
            .map(|bytes| decode_text(bytes))
            .ok_or_else(|| eyre!("No such file in EPUB: {}", archive_path))
    }
}

fn decode_text(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.strip_prefix('\u{feff}').unwrap_or(&*text).to_string()
}

fn find_opf_path(entries: &HashMap<String, Vec<u8>>) -> Result<String> {
    if let Some(container) = entries.get("META-INF/container.xml") {
        let content = decode_text(container);
        let doc = roxmltree::Document::parse(&content).wrap_err("Failed to parse container.xml")?;
        if let Some(path) = doc
            .descendants()
            .filter(|n| n.tag_name().name() == "rootfile")
            .find_map(|n| n.attribute("full-path"))
            && entries.contains_key(path)
        {
            return Ok(path.to_string());
        }
    }

    let mut opfs: Vec<&String> = entries.keys().filter(|k| k.ends_with(".opf")).collect();
    opfs.sort();
    opfs.first()
        .map(|p| p.to_string())
        .ok_or_else(|| eyre!("Could not find package document (.opf)"))
}

/// Join `href` onto the archive directory `dir`, resolving `.` and `..`.
fn join_archive_path(dir: &str, href: &str) -> String {
    let mut parts: Vec<&str> = dir.split('/').filter(|p| !p.is_empty()).collect();
    for part in href.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    parts.join("/")
}
