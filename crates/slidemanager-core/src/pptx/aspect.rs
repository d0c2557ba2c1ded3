//! Deck aspect detection from `ppt/presentation.xml`.
//!
//! Indexing must tolerate malformed packages, so every failure path here
//! collapses to `Aspect::Unknown` instead of an error.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

/// Slide aspect ratio of a deck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Aspect {
    #[serde(rename = "4:3")]
    FourThree,
    #[serde(rename = "16:9")]
    SixteenNine,
    #[serde(rename = "unknown")]
    Unknown,
}

impl Aspect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FourThree => "4:3",
            Self::SixteenNine => "16:9",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "4:3" => Self::FourThree,
            "16:9" => Self::SixteenNine,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for Aspect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ratio tolerance around 4/3 and 16/9.
const EPSILON: f64 = 0.01;

/// Read the deck aspect from the package. Missing file, missing `sldSz`
/// element, zero dimensions, or any parse failure returns `Unknown`.
pub fn detect_aspect(path: &Path) -> Aspect {
    match read_slide_size(path) {
        Some((cx, cy)) => classify(cx, cy),
        None => Aspect::Unknown,
    }
}

fn classify(cx: u64, cy: u64) -> Aspect {
    if cx == 0 || cy == 0 {
        return Aspect::Unknown;
    }
    let ratio = cx as f64 / cy as f64;
    if (ratio - 4.0 / 3.0).abs() < EPSILON {
        Aspect::FourThree
    } else if (ratio - 16.0 / 9.0).abs() < EPSILON {
        Aspect::SixteenNine
    } else {
        Aspect::Unknown
    }
}

fn read_slide_size(path: &Path) -> Option<(u64, u64)> {
    let file = File::open(path).ok()?;
    let mut archive = zip::ZipArchive::new(file).ok()?;
    let mut xml = Vec::new();
    archive
        .by_name("ppt/presentation.xml")
        .ok()?
        .read_to_end(&mut xml)
        .ok()?;

    let mut reader = Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"sldSz" {
                    let cx = attr_u64(&e, "cx")?;
                    let cy = attr_u64(&e, "cy")?;
                    return Some((cx, cy));
                }
            }
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

fn attr_u64(e: &quick_xml::events::BytesStart<'_>, name: &str) -> Option<u64> {
    let attr = e.try_get_attribute(name).ok()??;
    std::str::from_utf8(&attr.value).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::build_pptx;

    #[test]
    fn test_detects_four_three() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pptx");
        build_pptx(&path, &["hello"], Some((9_144_000, 6_858_000)));
        assert_eq!(detect_aspect(&path), Aspect::FourThree);
    }

    #[test]
    fn test_detects_sixteen_nine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pptx");
        build_pptx(&path, &["hello"], Some((12_192_000, 6_858_000)));
        assert_eq!(detect_aspect(&path), Aspect::SixteenNine);
    }

    #[test]
    fn test_odd_ratio_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pptx");
        build_pptx(&path, &["hello"], Some((10_000_000, 6_858_000)));
        assert_eq!(detect_aspect(&path), Aspect::Unknown);
    }

    #[test]
    fn test_zero_dimensions_are_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pptx");
        build_pptx(&path, &["hello"], Some((0, 6_858_000)));
        assert_eq!(detect_aspect(&path), Aspect::Unknown);
    }

    #[test]
    fn test_missing_slide_size_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pptx");
        build_pptx(&path, &["hello"], None);
        assert_eq!(detect_aspect(&path), Aspect::Unknown);
    }

    #[test]
    fn test_missing_file_is_unknown() {
        assert_eq!(detect_aspect(Path::new("/nonexistent/deck.pptx")), Aspect::Unknown);
    }

    #[test]
    fn test_not_a_zip_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.pptx");
        std::fs::write(&path, b"this is not a zip").unwrap();
        assert_eq!(detect_aspect(&path), Aspect::Unknown);
    }

    #[test]
    fn test_aspect_round_trips_through_str() {
        for aspect in [Aspect::FourThree, Aspect::SixteenNine, Aspect::Unknown] {
            assert_eq!(Aspect::parse(aspect.as_str()), aspect);
        }
    }
}
