//! Image encoding: cell PNG bytes → base64 wrapped in `ImageData`.
//!
//! Vision APIs accept images as base64 data-URIs embedded in the JSON
//! request body. Crops are already PNG (lossless; sub- and superscripts
//! survive), so encoding is only the base64 step.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use tracing::debug;

/// Wrap a PNG cell crop for an edgequake-llm vision request.
///
/// `detail: "high"` keeps small glyphs such as indices and primes legible
/// to tiling models; a `low` single-tile view loses them.
pub fn encode_cell(png: &[u8]) -> ImageData {
    let b64 = STANDARD.encode(png);
    debug!("Encoded cell image → {} bytes base64", b64.len());
    ImageData::new(b64, "image/png").with_detail("high")
}

/// `data:` URI of a PNG, as expected by OpenAI-style `image_url` parts.
pub fn png_data_uri(png: &[u8]) -> String {
    format!("data:image/png;base64,{}", STANDARD.encode(png))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::io::Cursor;

    fn tiny_png() -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png).unwrap();
        buf
    }

    #[test]
    fn encode_small_cell() {
        let png = tiny_png();
        let data = encode_cell(&png);
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(decoded, png);
    }

    #[test]
    fn data_uri_prefix() {
        let uri = png_data_uri(&tiny_png());
        assert!(uri.starts_with("data:image/png;base64,iVBOR"));
    }
}
