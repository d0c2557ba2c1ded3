//! Shared fixture builders for tests: minimal .pptx packages and PDFs.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use zip::write::SimpleFileOptions;

/// Build a minimal .pptx at `path` with one slide per entry in `slides`.
/// Newlines inside a slide string become separate paragraphs. `slide_size`
/// controls the `<p:sldSz>` element (EMU units); `None` omits it.
pub(crate) fn build_pptx(path: &Path, slides: &[&str], slide_size: Option<(u64, u64)>) {
    build_pptx_with_raw_slides(path, slides, &[], slide_size);
}

/// Like `build_pptx`, but slides listed in `raw_slides` get the given raw
/// XML body instead of a generated one (for malformed-slide fixtures).
pub(crate) fn build_pptx_with_raw_slides(
    path: &Path,
    slides: &[&str],
    raw_slides: &[(u32, &str)],
    slide_size: Option<(u64, u64)>,
) {
    let total = slides
        .len()
        .max(raw_slides.iter().map(|(n, _)| *n as usize).max().unwrap_or(0));

    let file = File::create(path).expect("fixture pptx should be creatable");
    let mut archive = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default();

    archive
        .start_file("[Content_Types].xml", options)
        .unwrap();
    archive
        .write_all(br#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"/>"#)
        .unwrap();

    archive.start_file("ppt/presentation.xml", options).unwrap();
    archive
        .write_all(presentation_xml(slide_size).as_bytes())
        .unwrap();

    for page_no in 1..=total as u32 {
        archive
            .start_file(format!("ppt/slides/slide{page_no}.xml"), options)
            .unwrap();
        let body = match raw_slides.iter().find(|(n, _)| *n == page_no) {
            Some((_, raw)) => (*raw).to_string(),
            None => slide_xml(slides.get(page_no as usize - 1).copied().unwrap_or("")),
        };
        archive.write_all(body.as_bytes()).unwrap();
    }

    archive.finish().unwrap();
}

fn presentation_xml(slide_size: Option<(u64, u64)>) -> String {
    let sld_sz = match slide_size {
        Some((cx, cy)) => format!(r#"<p:sldSz cx="{cx}" cy="{cy}"/>"#),
        None => String::new(),
    };
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><p:presentation xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main" xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main">{sld_sz}</p:presentation>"#
    )
}

fn slide_xml(text: &str) -> String {
    let paragraphs: String = text
        .split('\n')
        .map(|p| format!("<a:p><a:r><a:rPr lang=\"en-US\"/><a:t>{}</a:t></a:r></a:p>", xml_escape(p)))
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><p:sld xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main" xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main"><p:cSld><p:spTree><p:sp><p:txBody><a:bodyPr/>{paragraphs}</p:txBody></p:sp></p:spTree></p:cSld></p:sld>"#
    )
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Build a valid multi-page PDF with one line of text per page.
pub(crate) fn build_pdf(page_texts: &[&str]) -> Vec<u8> {
    use lopdf::{dictionary, Document, Object, Stream};

    let mut doc = Document::with_version("1.4");

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut page_ids = Vec::new();
    for text in page_texts {
        let content = format!(
            "BT /F1 12 Tf 72 700 Td ({}) Tj ET",
            text.replace('\\', "\\\\")
                .replace('(', "\\(")
                .replace(')', "\\)")
        );
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Resources" => resources_id,
            "Contents" => content_id,
        });
        page_ids.push(page_id);
    }

    let kids: Vec<Object> = page_ids.iter().map(|&id| id.into()).collect();
    let pages_id = doc.add_object(dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => Object::Integer(page_texts.len() as i64),
    });
    for page_id in &page_ids {
        if let Ok(Object::Dictionary(dict)) = doc.get_object_mut(*page_id) {
            dict.set("Parent", pages_id);
        }
    }

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer).expect("fixture pdf should serialize");
    buffer
}
