//! Per-slide text extraction from the presentation package.
//!
//! Slides live at `ppt/slides/slideN.xml`; visible text is the leaf `<a:t>`
//! elements inside runs. Runs of one paragraph are concatenated, paragraphs
//! are joined with a newline.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;

/// Extraction failures, tagged with the page they belong to. These are
/// per-page errors: the job continues with the next slide.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("slide {page_no} missing from package")]
    MissingSlide { page_no: u32 },
    #[error("slide {page_no} xml malformed: {source}")]
    MalformedXml {
        page_no: u32,
        source: quick_xml::Error,
    },
    #[error("package unreadable: {0}")]
    Package(#[from] zip::result::ZipError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Number of slides in the package, from the zip directory.
pub fn slide_count(path: &Path) -> Result<u32, ExtractError> {
    let file = File::open(path)?;
    let archive = zip::ZipArchive::new(file)?;
    let mut count = 0;
    for name in archive.file_names() {
        if slide_number(name).is_some() {
            count += 1;
        }
    }
    Ok(count)
}

fn slide_number(entry_name: &str) -> Option<u32> {
    entry_name
        .strip_prefix("ppt/slides/slide")?
        .strip_suffix(".xml")?
        .parse()
        .ok()
}

/// Raw text of one slide (1-based page number), paragraphs joined with
/// newlines. Callers normalize separately.
pub fn extract_slide_text(path: &Path, page_no: u32) -> Result<String, ExtractError> {
    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let entry_name = format!("ppt/slides/slide{page_no}.xml");
    let mut xml = Vec::new();
    match archive.by_name(&entry_name) {
        Ok(mut entry) => {
            entry.read_to_end(&mut xml)?;
        }
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(ExtractError::MissingSlide { page_no });
        }
        Err(e) => return Err(e.into()),
    }
    collect_text(&xml, page_no)
}

/// Walk the slide XML collecting `<a:t>` content in document order.
fn collect_text(xml: &[u8], page_no: u32) -> Result<String, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_paragraph = false;
    let mut in_text = false;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|source| ExtractError::MalformedXml { page_no, source })?;
        match event {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"p" => {
                    in_paragraph = true;
                    current.clear();
                }
                b"t" => in_text = true,
                _ => {}
            },
            Event::End(ref e) => match e.local_name().as_ref() {
                b"p" => {
                    if in_paragraph {
                        paragraphs.push(std::mem::take(&mut current));
                        in_paragraph = false;
                    }
                }
                b"t" => in_text = false,
                _ => {}
            },
            Event::Text(ref t) => {
                if in_text {
                    let text = t
                        .unescape()
                        .map_err(|source| ExtractError::MalformedXml { page_no, source })?;
                    if in_paragraph {
                        current.push_str(&text);
                    } else {
                        // Text outside any paragraph still counts (notes
                        // shapes emit these).
                        paragraphs.push(text.into_owned());
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(paragraphs.join("\n"))
}

/// Canonical form of slide text: zero-width characters stripped, CRLF
/// folded to LF, intra-line whitespace collapsed, empty lines dropped,
/// surviving line order preserved. Idempotent.
pub fn normalize_text(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines = Vec::new();
    for line in unified.lines() {
        let cleaned: String = line.chars().filter(|c| !is_zero_width(*c)).collect();
        let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
        if !collapsed.is_empty() {
            lines.push(collapsed);
        }
    }
    lines.join("\n")
}

fn is_zero_width(c: char) -> bool {
    matches!(
        c,
        '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}'
    )
}

/// Stable content signature of normalized text: lowercase hex blake3,
/// truncated to 32 chars. The empty string maps to the empty signature,
/// which downstream uses to short-circuit embedding.
pub fn fast_text_sig(norm_text: &str) -> String {
    if norm_text.is_empty() {
        return String::new();
    }
    let hash = blake3::hash(norm_text.as_bytes());
    hash.to_hex().as_str()[..32].to_string()
}
