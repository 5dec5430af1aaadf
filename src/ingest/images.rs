use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

pub const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

pub(crate) fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// A single image or a directory of images, played back in file-name order.
pub struct ImageSource {
    root: PathBuf,
    paths: Vec<PathBuf>,
    next: usize,
    last_error: Option<String>,
}

impl ImageSource {
    pub fn new(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!("image source {} does not exist", path.display()));
        }
        Ok(Self {
            root: path.to_path_buf(),
            paths: Vec::new(),
            next: 0,
            last_error: None,
        })
    }
}

impl FrameSource for ImageSource {
    fn connect(&mut self) -> Result<()> {
        self.paths = if self.root.is_dir() {
            let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.root)
                .with_context(|| format!("read image directory {}", self.root.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_image_path(p))
                .collect();
            paths.sort();
            paths
        } else {
            vec![self.root.clone()]
        };
        self.next = 0;
        log::info!(
            "ImageSource: {} image(s) from {}",
            self.paths.len(),
            self.root.display()
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.paths.get(self.next) else {
            return Ok(None);
        };
        let decoded = image::open(path).with_context(|| format!("decode {}", path.display()));
        let image = match decoded {
            Ok(image) => image.to_rgb8(),
            Err(e) => {
                self.last_error = Some(format!("{:#}", e));
                return Err(e);
            }
        };
        self.next += 1;
        Ok(Some(Frame::new(image, self.next as u64)))
    }

    fn is_healthy(&self) -> bool {
        self.last_error.is_none()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.next as u64,
            uri: self.root.display().to_string(),
        }
    }

    fn frame_count_hint(&self) -> Option<u64> {
        Some(self.paths.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn directory_frames_come_in_name_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        RgbImage::from_pixel(8, 6, Rgb([10, 10, 10])).save(dir.path().join("b.png"))?;
        RgbImage::from_pixel(8, 6, Rgb([200, 0, 0])).save(dir.path().join("a.png"))?;
        std::fs::write(dir.path().join("notes.txt"), "skip me")?;

        let mut source = ImageSource::new(dir.path())?;
        source.connect()?;
        assert_eq!(source.frame_count_hint(), Some(2));

        let first = source.next_frame()?.ok_or_else(|| anyhow!("missing frame"))?;
        assert_eq!(first.image().get_pixel(0, 0).0, [200, 0, 0]);
        assert_eq!(first.sequence, 1);
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_none());
        assert!(source.is_healthy());
        Ok(())
    }

    #[test]
    fn single_image_is_one_frame() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("still.png");
        RgbImage::new(4, 4).save(&path)?;
        let mut source = ImageSource::new(&path)?;
        source.connect()?;
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_none());
        Ok(())
    }

    #[test]
    fn extension_check_is_case_insensitive() {
        assert!(is_image_path(Path::new("x/Frame.JPG")));
        assert!(!is_image_path(Path::new("x/clip.mp4")));
    }
}
