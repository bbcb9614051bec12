//! Image attachments and clipboard access.
//!
//! Attachments are carried as bare base64 payloads; the client adds the
//! `data:` prefix when building the request.

use crate::{ChatError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::path::Path;
use tracing::debug;

/// Dimensions and payload of an image taken from the clipboard
#[derive(Debug, Clone)]
pub struct PastedImage {
    pub width: u32,
    pub height: u32,
    pub base64: String,
}

pub fn encode_bytes(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Read an image file and return its base64 payload.
pub async fn encode_image_file(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ChatError::fs(path, e))?;
    if bytes.is_empty() {
        return Err(ChatError::Clipboard(format!(
            "{} is empty",
            path.display()
        )));
    }
    debug!("Attached {:?} ({} bytes)", path, bytes.len());
    Ok(encode_bytes(&bytes))
}

/// Encode raw RGBA pixels as PNG.
pub fn rgba_to_png(width: u32, height: u32, rgba: Vec<u8>) -> Result<Vec<u8>> {
    let Some(rgba_img) = image::RgbaImage::from_raw(width, height, rgba) else {
        return Err(ChatError::Clipboard("invalid RGBA image buffer".to_string()));
    };

    let mut png = Vec::<u8>::new();
    image::DynamicImage::ImageRgba8(rgba_img)
        .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|e| ChatError::Clipboard(format!("could not encode image: {e}")))?;
    Ok(png)
}

/// Take the image currently on the system clipboard.
pub fn paste_image() -> Result<PastedImage> {
    let mut cb = arboard::Clipboard::new()
        .map_err(|e| ChatError::Clipboard(format!("clipboard unavailable: {e}")))?;
    let image = cb
        .get_image()
        .map_err(|e| ChatError::Clipboard(format!("no image on clipboard: {e}")))?;

    let width = image.width as u32;
    let height = image.height as u32;
    let png = rgba_to_png(width, height, image.bytes.into_owned())?;
    Ok(PastedImage {
        width,
        height,
        base64: encode_bytes(&png),
    })
}

/// Put text on the system clipboard.
pub fn copy_text(text: &str) -> Result<()> {
    let mut cb = arboard::Clipboard::new()
        .map_err(|e| ChatError::Clipboard(format!("clipboard unavailable: {e}")))?;
    cb.set_text(text.to_string())
        .map_err(|e| ChatError::Clipboard(e.to_string()))
}
