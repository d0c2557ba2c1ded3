//! Thumbnail rendering from converted PDFs.

use std::path::Path;
use std::sync::Arc;

use hayro::hayro_interpret::util::PageExt;
use hayro::hayro_interpret::InterpreterSettings;
use hayro::hayro_syntax::Pdf;
use hayro::vello_cpu::color::palette::css::WHITE;
use hayro::{render, RenderSettings};
use image::imageops::FilterType;

use crate::pptx::Aspect;

/// 4:3 thumbnails are 320x240.
pub const THUMB_4_3: (u32, u32) = (320, 240);
/// 16:9 thumbnails are 320x180.
pub const THUMB_16_9: (u32, u32) = (320, 180);

/// Thumbnail dimensions for a page aspect. Unknown aspects use the
/// configured default aspect's size, so the choice is stable per job.
pub fn thumb_size(aspect: Aspect, default_aspect: Aspect) -> (u32, u32) {
    match aspect {
        Aspect::FourThree => THUMB_4_3,
        Aspect::SixteenNine => THUMB_16_9,
        Aspect::Unknown => match default_aspect {
            Aspect::SixteenNine => THUMB_16_9,
            _ => THUMB_4_3,
        },
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ThumbError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to parse pdf")]
    Parse,
    #[error("page {page_no} out of range ({page_count} pages)")]
    PageOutOfRange { page_no: u32, page_count: usize },
    #[error("render produced an empty image")]
    EmptyRender,
    #[error("failed to encode thumbnail: {0}")]
    Encode(#[from] image::ImageError),
}

/// Rasterize one PDF page (1-based) and write a JPEG of exactly `size`
/// pixels. Returns the written dimensions; the output file is guaranteed
/// to exist and be non-empty on success.
pub fn render_pdf_page_to_thumb(
    pdf_path: &Path,
    page_no: u32,
    out_path: &Path,
    size: (u32, u32),
) -> Result<(u32, u32), ThumbError> {
    let bytes = std::fs::read(pdf_path)?;
    let pdf = Pdf::new(Arc::new(bytes)).map_err(|_| ThumbError::Parse)?;
    let pages = pdf.pages();
    let index = page_no.saturating_sub(1) as usize;
    let page = pages.get(index).ok_or(ThumbError::PageOutOfRange {
        page_no,
        page_count: pages.len(),
    })?;

    let (page_w, _page_h) = page.render_dimensions();
    let (target_w, target_h) = size;
    let scale = if page_w > 0.0 {
        target_w as f32 / page_w
    } else {
        1.0
    };

    let render_settings = RenderSettings {
        x_scale: scale,
        y_scale: scale,
        bg_color: WHITE,
        ..Default::default()
    };
    let pixmap = render(page, &InterpreterSettings::default(), &render_settings);
    let (width, height) = (pixmap.width() as u32, pixmap.height() as u32);
    if width == 0 || height == 0 {
        return Err(ThumbError::EmptyRender);
    }

    let rgba = image::RgbaImage::from_raw(width, height, pixmap.data_as_u8_slice().to_vec())
        .ok_or(ThumbError::EmptyRender)?;
    let resized = image::imageops::resize(&rgba, target_w, target_h, FilterType::Triangle);
    let rgb = image::DynamicImage::ImageRgba8(resized).to_rgb8();

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    rgb.save(out_path)?;

    if std::fs::metadata(out_path)?.len() == 0 {
        return Err(ThumbError::EmptyRender);
    }
    Ok((target_w, target_h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::build_pdf;

    #[test]
    fn test_thumb_size_per_aspect() {
        assert_eq!(thumb_size(Aspect::FourThree, Aspect::FourThree), (320, 240));
        assert_eq!(thumb_size(Aspect::SixteenNine, Aspect::FourThree), (320, 180));
    }

    #[test]
    fn test_unknown_aspect_follows_configured_default() {
        assert_eq!(thumb_size(Aspect::Unknown, Aspect::FourThree), (320, 240));
        assert_eq!(thumb_size(Aspect::Unknown, Aspect::SixteenNine), (320, 180));
        // Stability: the same inputs always give the same answer.
        assert_eq!(
            thumb_size(Aspect::Unknown, Aspect::Unknown),
            thumb_size(Aspect::Unknown, Aspect::Unknown)
        );
    }

    #[test]
    fn test_render_writes_exact_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let pdf_path = dir.path().join("deck.pdf");
        std::fs::write(&pdf_path, build_pdf(&["first page", "second page"])).unwrap();
        let out = dir.path().join("thumbs").join("1_4x3_320x240.jpg");

        let (w, h) = render_pdf_page_to_thumb(&pdf_path, 1, &out, THUMB_4_3).unwrap();
        assert_eq!((w, h), (320, 240));

        let written = image::open(&out).unwrap();
        assert_eq!(written.width(), 320);
        assert_eq!(written.height(), 240);
        assert!(std::fs::metadata(&out).unwrap().len() > 0);
    }

    #[test]
    fn test_render_second_page() {
        let dir = tempfile::tempdir().unwrap();
        let pdf_path = dir.path().join("deck.pdf");
        std::fs::write(&pdf_path, build_pdf(&["one", "two", "three"])).unwrap();
        let out = dir.path().join("2.jpg");

        render_pdf_page_to_thumb(&pdf_path, 2, &out, THUMB_16_9).unwrap();
        let written = image::open(&out).unwrap();
        assert_eq!((written.width(), written.height()), (320, 180));
    }

    #[test]
    fn test_page_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let pdf_path = dir.path().join("deck.pdf");
        std::fs::write(&pdf_path, build_pdf(&["only page"])).unwrap();

        let err =
            render_pdf_page_to_thumb(&pdf_path, 9, &dir.path().join("9.jpg"), THUMB_4_3)
                .unwrap_err();
        assert!(matches!(
            err,
            ThumbError::PageOutOfRange {
                page_no: 9,
                page_count: 1
            }
        ));
    }

    #[test]
    fn test_garbage_pdf_fails_to_parse() {
        let dir = tempfile::tempdir().unwrap();
        let pdf_path = dir.path().join("bad.pdf");
        std::fs::write(&pdf_path, b"not a pdf at all").unwrap();

        let err = render_pdf_page_to_thumb(&pdf_path, 1, &dir.path().join("1.jpg"), THUMB_4_3)
            .unwrap_err();
        assert!(matches!(err, ThumbError::Parse));
    }

    #[test]
    fn test_missing_pdf_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = render_pdf_page_to_thumb(
            Path::new("/nonexistent/deck.pdf"),
            1,
            &dir.path().join("1.jpg"),
            THUMB_4_3,
        )
        .unwrap_err();
        assert!(matches!(err, ThumbError::Io(_)));
    }
}
