//! Input modality dispatch.

use std::path::Path;

use segblur_core::error::{EngineError, Result};
use segblur_core::types::Modality;

/// Still-image extensions the image source decodes.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Whether `path` names a supported still image, by extension.
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}

/// Choose the modality for `input`.
///
/// Directories and image files select [`Modality::Images`]; every other path
/// is treated as a video container.  Never opens the input.
pub fn detect_modality(input: &Path) -> Modality {
    if input.is_dir() || is_image_file(input) {
        Modality::Images
    } else {
        Modality::Video
    }
}

/// Cheap existence/readability check run before any device work.
pub fn preflight(input: &Path) -> Result<()> {
    let meta = std::fs::metadata(input)
        .map_err(|e| EngineError::source_open(input, e.to_string()))?;
    if meta.is_dir() {
        std::fs::read_dir(input).map_err(|e| EngineError::source_open(input, e.to_string()))?;
    } else {
        std::fs::File::open(input).map_err(|e| EngineError::source_open(input, e.to_string()))?;
    }
    Ok(())
}
