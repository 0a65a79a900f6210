use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::plan::UploadTask;
use crate::{Error, Result};

/// Produces the JPEG bytes for one task.
///
/// Called on the blocking pool; implementations must be deterministic per
/// task so a retried run produces the same payload.
pub trait AssetSynthesizer: Send + Sync {
    fn synthesize(&self, task: &UploadTask) -> Result<Vec<u8>>;
}

/// Derives each asset from a source JPEG under the input directory, or from
/// a generated pattern when there are no sources.
#[derive(Debug, Clone)]
pub struct ImageSynthesizer {
    sources: Vec<PathBuf>,
    output_dir: Option<PathBuf>,
}

impl ImageSynthesizer {
    pub fn new(input_dir: Option<&Path>, output_dir: Option<PathBuf>) -> Result<Self> {
        let sources = match input_dir {
            Some(dir) if dir.is_dir() => scan_sources(dir)?,
            Some(dir) => {
                warn!(
                    event = "synth.no_input_dir",
                    input_dir = %dir.display(),
                    "synth.no_input_dir"
                );
                Vec::new()
            }
            None => Vec::new(),
        };
        if let Some(dir) = &output_dir {
            std::fs::create_dir_all(dir)?;
        }
        debug!(event = "synth.ready", sources = sources.len(), "synth.ready");
        Ok(Self {
            sources,
            output_dir,
        })
    }

    fn render(&self, task: &UploadTask) -> Result<RgbImage> {
        let (width, height) = (task.shape.width, task.shape.height);
        if self.sources.is_empty() {
            return Ok(pattern(task.seq, width, height));
        }

        let path = &self.sources[((task.seq.saturating_sub(1)) % self.sources.len() as u64) as usize];
        let source = image::open(path).map_err(|e| Error::Synthesis {
            message: format!("open {}: {e}", path.display()),
        })?;
        let mut img = source
            .resize_exact(width, height, FilterType::Triangle)
            .to_rgb8();
        tint(&mut img, seq_color(task.seq));
        Ok(img)
    }
}

impl AssetSynthesizer for ImageSynthesizer {
    fn synthesize(&self, task: &UploadTask) -> Result<Vec<u8>> {
        let img = self.render(task)?;
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
            .map_err(|e| Error::Synthesis {
                message: format!("encode {}: {e}", task.file_name),
            })?;

        if let Some(dir) = &self.output_dir {
            std::fs::write(dir.join(&task.file_name), &bytes)?;
        }
        Ok(bytes)
    }
}

fn scan_sources(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut sources = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_jpeg = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"));
        if is_jpeg {
            sources.push(entry.into_path());
        }
    }
    sources.sort();
    Ok(sources)
}

fn seq_color(seq: u64) -> Rgb<u8> {
    let mut rng = StdRng::seed_from_u64(seq);
    Rgb([rng.random(), rng.random(), rng.random()])
}

/// Blends `color` over the image at 20% and paints a solid band along the
/// top edge so assets from one source still differ.
fn tint(img: &mut RgbImage, color: Rgb<u8>) {
    let band = (img.height() / 12).max(1);
    for (_, y, px) in img.enumerate_pixels_mut() {
        for c in 0..3 {
            px[c] = if y < band {
                color[c]
            } else {
                ((u16::from(px[c]) * 4 + u16::from(color[c])) / 5) as u8
            };
        }
    }
}

fn pattern(seq: u64, width: u32, height: u32) -> RgbImage {
    let mut rng = StdRng::seed_from_u64(seq);
    let from: [u8; 3] = [rng.random(), rng.random(), rng.random()];
    let to: [u8; 3] = [rng.random(), rng.random(), rng.random()];
    let w = width.max(2) - 1;
    let h = height.max(2) - 1;

    RgbImage::from_fn(width, height, |x, y| {
        let t = (x * 255 / w + y * 255 / h) / 2;
        let noise: i16 = rng.random_range(-12..=12);
        let mut px = [0u8; 3];
        for c in 0..3 {
            let base = (u32::from(from[c]) * (255 - t) + u32::from(to[c]) * t) / 255;
            px[c] = (base as i16 + noise).clamp(0, 255) as u8;
        }
        Rgb(px)
    })
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::plan::{AssetMetadata, AssetShape};

    fn task(seq: u64) -> UploadTask {
        UploadTask {
            seq,
            destination_folder: "/content/dam/gen".to_string(),
            file_name: format!("vivid_reef_{seq:06}.jpg"),
            shape: AssetShape {
                width: 32,
                height: 24,
            },
            metadata: AssetMetadata {
                title: "Vivid Reef".to_string(),
                captured_on: NaiveDate::from_ymd_opt(2019, 6, 1).unwrap(),
                tags: vec!["findme".to_string()],
            },
            attempt_count: 0,
        }
    }

    #[test]
    fn generated_pattern_is_a_deterministic_jpeg() {
        let synth = ImageSynthesizer::new(None, None).unwrap();
        let a = synth.synthesize(&task(7)).unwrap();
        let b = synth.synthesize(&task(7)).unwrap();
        let c = synth.synthesize(&task(8)).unwrap();
        assert_eq!(&a[..2], &[0xFF, 0xD8]);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let decoded = image::load_from_memory(&a).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[test]
    fn sources_are_resized_and_output_is_persisted() {
        let temp = tempfile::tempdir().unwrap();
        let input = temp.path().join("img");
        std::fs::create_dir_all(input.join("nested")).unwrap();
        RgbImage::from_pixel(64, 64, Rgb([10, 200, 30]))
            .save_with_format(input.join("nested").join("src.JPG"), ImageFormat::Jpeg)
            .unwrap();
        std::fs::write(input.join("notes.txt"), "not an image").unwrap();

        let output = temp.path().join("out");
        let synth = ImageSynthesizer::new(Some(&input), Some(output.clone())).unwrap();
        assert_eq!(synth.sources.len(), 1);

        let bytes = synth.synthesize(&task(1)).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
        assert_eq!(std::fs::read(output.join("vivid_reef_000001.jpg")).unwrap(), bytes);
    }

    #[test]
    fn missing_input_dir_falls_back_to_pattern() {
        let temp = tempfile::tempdir().unwrap();
        let synth = ImageSynthesizer::new(Some(&temp.path().join("absent")), None).unwrap();
        assert!(synth.sources.is_empty());
        assert!(!synth.synthesize(&task(1)).unwrap().is_empty());
    }
}
