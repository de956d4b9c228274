use std::io::Cursor;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};

pub const DEFAULT_IMAGE_MIME: &str = "image/jpeg";

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    if data.len() > 12 {
        let ftyp = &data[4..12];
        if ftyp.starts_with(b"ftyp") {
            let brand = &ftyp[4..8];
            if brand == b"heic" || brand == b"heif" || brand == b"hevc" {
                return Some("image/heic".to_string());
            }
        }
    }

    infer::get(data).map(|kind| kind.mime_type().to_string())
}

/// Splits `data:<mime>;base64,<payload>` into its parts. Bare base64 passes
/// through with no mime type.
pub fn split_data_url(value: &str) -> (Option<&str>, &str) {
    let trimmed = value.trim();
    let Some(rest) = trimmed.strip_prefix("data:") else {
        return (None, trimmed);
    };
    match rest.split_once(',') {
        Some((header, payload)) => {
            let mime = header.split(';').next().filter(|mime| !mime.is_empty());
            (mime, payload)
        }
        None => (None, trimmed),
    }
}

pub fn decode_base64_image(value: &str) -> Result<Vec<u8>> {
    let (_, payload) = split_data_url(value);
    general_purpose::STANDARD
        .decode(payload.trim())
        .context("image payload is not valid base64")
}

/// Mime type for an inline image part: the data URL header wins, then the
/// sniffed bytes.
pub fn mime_type_for_base64(value: &str) -> String {
    let (declared, payload) = split_data_url(value);
    if let Some(mime) = declared {
        return mime.to_string();
    }

    // 64 base64 chars decode to 48 bytes, enough for every signature we sniff.
    let prefix_len = payload.len().min(64) / 4 * 4;
    payload
        .get(..prefix_len)
        .and_then(|prefix| general_purpose::STANDARD.decode(prefix).ok())
        .and_then(|bytes| detect_mime_type(&bytes))
        .filter(|mime| mime.starts_with("image/"))
        .unwrap_or_else(|| DEFAULT_IMAGE_MIME.to_string())
}

pub fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/heic" => "heic",
        _ => "jpg",
    }
}

/// Loads an image file, shrinks it so its longest side is at most
/// `max_dimension` and returns it re-encoded as base64.
pub fn encode_image_file(path: &Path, max_dimension: u32) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    encode_image_bytes(&bytes, max_dimension)
        .with_context(|| format!("encoding {}", path.display()))
}

pub fn encode_image_bytes(bytes: &[u8], max_dimension: u32) -> Result<String> {
    if bytes.is_empty() {
        return Err(anyhow!("image is empty"));
    }
    let image = image::load_from_memory(bytes)?;
    let image = if image.width() > max_dimension || image.height() > max_dimension {
        image.resize(max_dimension, max_dimension, FilterType::Lanczos3)
    } else {
        image
    };

    let mut out = Cursor::new(Vec::new());
    if image.color().has_alpha() {
        image.write_to(&mut out, ImageFormat::Png)?;
    } else {
        DynamicImage::ImageRgb8(image.to_rgb8()).write_to(&mut out, ImageFormat::Jpeg)?;
    }
    Ok(general_purpose::STANDARD.encode(out.into_inner()))
}
