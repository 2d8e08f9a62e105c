#![allow(dead_code)]

use picvec::{Config, Embedder, Error, Gallery, Result, UploadFile};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const RED: [u8; 3] = [220, 20, 20];
pub const GREEN: [u8; 3] = [20, 200, 20];
pub const BLUE: [u8; 3] = [20, 20, 220];
pub const YELLOW: [u8; 3] = [220, 220, 20];
pub const PURPLE: [u8; 3] = [150, 20, 150];
pub const GREY: [u8; 3] = [128, 128, 128];

/// Embeds an image as its mean colour and a colour word as that colour.
///
/// Files whose name contains "corrupt" fail to embed.
#[derive(Default)]
pub struct StubEmbedder {
    image_calls: AtomicUsize,
}

impl StubEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image_calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }
}

impl Embedder for StubEmbedder {
    fn model_id(&self) -> &str {
        "stub-colour-v1"
    }

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);

        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if name.contains("corrupt") {
            return Err(Error::Embedding {
                path: path.to_path_buf(),
                reason: "decoder rejected the file".to_string(),
            });
        }

        let img = image::open(path)?.to_rgb8();
        let pixels = img.pixels().count().max(1) as f32;
        let mut sums = [0f32; 3];
        for pixel in img.pixels() {
            for (sum, channel) in sums.iter_mut().zip(pixel.0) {
                *sum += channel as f32;
            }
        }
        Ok(vec![
            sums[0] / pixels / 255.0,
            sums[1] / pixels / 255.0,
            sums[2] / pixels / 255.0,
            0.1,
        ])
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let vector = match text {
            "red" => vec![1.0, 0.0, 0.0, 0.1],
            "green" => vec![0.0, 1.0, 0.0, 0.1],
            "blue" => vec![0.0, 0.0, 1.0, 0.1],
            _ => vec![0.5, 0.5, 0.5, 0.1],
        };
        Ok(vector)
    }
}

/// Config rooted in `temp_dir` that never schedules background runs on upload
pub fn test_config(temp_dir: &TempDir) -> Config {
    Config::new(Some(temp_dir.path().join("picvec")))
        .unwrap()
        .without_auto_index()
}

pub fn open_gallery(config: Config) -> (Gallery, Arc<StubEmbedder>) {
    let embedder = Arc::new(StubEmbedder::new());
    let gallery = Gallery::open(config, embedder.clone()).unwrap();
    (gallery, embedder)
}

/// A small solid-colour PNG
pub fn png_bytes(rgb: [u8; 3]) -> Vec<u8> {
    let mut bytes = Vec::new();
    image::RgbImage::from_pixel(4, 4, image::Rgb(rgb))
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

pub fn write_png(path: &Path, rgb: [u8; 3]) {
    std::fs::write(path, png_bytes(rgb)).unwrap();
}

pub fn png_upload(name: &str, rgb: [u8; 3]) -> UploadFile {
    UploadFile::new(name, png_bytes(rgb))
}

/// Poll `condition` until it holds or a generous deadline passes
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

/// Wait for a background run to finish and leave a built index behind
pub fn wait_for_index(gallery: &Gallery) -> bool {
    wait_until(|| {
        let status = gallery.status();
        gallery.config().index_path.exists()
            && !status.is_indexing
            && !gallery.has_queued_run()
            && status.status == picvec::RunStatus::Done
    })
}
