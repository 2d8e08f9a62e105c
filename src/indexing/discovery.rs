use crate::core::error::{Error, Result};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Extensions accepted as gallery images (lowercase)
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];

/// Discover all image files under a directory, in file-name order.
///
/// Only the extension is checked here; use [`is_valid_image`] before
/// handing a file to the embedder.
pub fn discover_images(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Err(Error::Config(format!(
            "Directory does not exist: {}",
            root.display()
        )));
    }

    if !root.is_dir() {
        return Err(Error::Config(format!(
            "Path is not a directory: {}",
            root.display()
        )));
    }

    let mut images = Vec::new();

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(true)
        .git_exclude(true)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    for result in walker {
        match result {
            Ok(entry) => {
                let path = entry.path();

                if path.is_dir() || !is_image_file(path) {
                    continue;
                }

                images.push(path.to_path_buf());
            }
            Err(err) => {
                // Some files might be inaccessible
                warn!("Failed to access file: {}", err);
            }
        }
    }

    debug!("Found {} images in {}", images.len(), root.display());
    Ok(images)
}

/// Check if a file is a supported image based on extension. Dot-files are
/// never images.
pub fn is_image_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(true);
    if hidden {
        return false;
    }

    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Check that a file opens as an image by reading its header
pub fn is_valid_image(path: &Path) -> bool {
    let reader = match image::ImageReader::open(path).and_then(|r| r.with_guessed_format()) {
        Ok(reader) => reader,
        Err(_) => return false,
    };
    reader.into_dimensions().is_ok()
}
