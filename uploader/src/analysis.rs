//! This module provides [Analyzer], which derives the searchable metadata for an image: its dimensions and dominant
//! colors, computed locally, and descriptive words, obtained from a [WordExtractor] such as
//! [Gemini](crate::gemini::Gemini).

use {
    anyhow::{anyhow, Context, Error, Result},
    futures::{future::BoxFuture, FutureExt},
    image::{io::Reader as ImageReader, GenericImageView},
    std::{cmp::Ordering, io::Cursor},
    tokio::task,
    tracing::warn,
    walls_shared as shared,
};

/// Number of dominant colors to report
const COLOR_COUNT: usize = 3;

/// Images are downsampled to fit these bounds before clustering their colors.
const SAMPLE_BOUNDS: u32 = 80;

const MAX_ITERATIONS: usize = 32;

/// Everything [ImageAnalyzer::analyze] learns about an image
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub width: u32,
    pub height: u32,
    pub pixel_density: f64,
    pub file_format: String,
    pub colors: Vec<String>,
    pub words: Vec<String>,
}

pub trait ImageAnalyzer: Send + Sync {
    /// Analyze the image in `content`, whose format (as returned by [shared::file_format]) is `format`.
    ///
    /// Only a failure to determine the image dimensions is reported as an error.  Color and word extraction
    /// failures are logged and yield empty lists.
    fn analyze<'a>(&'a self, content: &'a [u8], format: &'a str) -> BoxFuture<'a, Result<Analysis>>;
}

/// Source of descriptive and OCR words for an image
pub trait WordExtractor: Send + Sync {
    fn words<'a>(&'a self, content: &'a [u8], mime_type: &'a str) -> BoxFuture<'a, Result<Vec<String>>>;
}

pub struct Analyzer<W> {
    words: W,
}

impl<W: WordExtractor> Analyzer<W> {
    pub fn new(words: W) -> Self {
        Self { words }
    }

    async fn run(&self, content: &[u8], format: &str) -> Result<Analysis> {
        let (width, height) = dimensions(content).context("failed to read image dimensions")?;

        let owned = content.to_vec();

        let colors = match task::spawn_blocking(move || dominant_colors(&owned))
            .await
            .map_err(Error::from)
            .and_then(|colors| colors)
        {
            Ok(colors) => colors,
            Err(e) => {
                warn!("failed to extract colors: {:?}", e);
                Vec::new()
            }
        };

        let words = match self.words.words(content, shared::mime_type(format)).await {
            Ok(words) => words,
            Err(e) => {
                warn!("failed to extract words: {:?}", e);
                Vec::new()
            }
        };

        Ok(Analysis {
            width,
            height,
            pixel_density: f64::from(width) * f64::from(height) / 1_000_000.0,
            file_format: format.to_owned(),
            colors,
            words,
        })
    }
}

impl<W: WordExtractor> ImageAnalyzer for Analyzer<W> {
    fn analyze<'a>(&'a self, content: &'a [u8], format: &'a str) -> BoxFuture<'a, Result<Analysis>> {
        self.run(content, format).boxed()
    }
}

/// Read the dimensions from the image header without decoding the pixel data.
pub fn dimensions(content: &[u8]) -> Result<(u32, u32)> {
    Ok(ImageReader::new(Cursor::new(content))
        .with_guessed_format()?
        .into_dimensions()?)
}

type Color = [f64; 3];

fn distance(a: &Color, b: &Color) -> f64 {
    a.iter().zip(b).map(|(a, b)| (a - b) * (a - b)).sum()
}

/// Index of and distance to the center nearest `color`, preferring the lowest index on ties
fn nearest(centers: &[Color], color: &Color) -> (usize, f64) {
    centers
        .iter()
        .enumerate()
        .map(|(index, center)| (index, distance(center, color)))
        .fold((0, f64::INFINITY), |best, candidate| {
            if candidate.1 < best.1 {
                candidate
            } else {
                best
            }
        })
}

fn mean<'a>(colors: impl Iterator<Item = &'a Color>) -> Option<Color> {
    let (sum, count) = colors.fold(([0.0; 3], 0usize), |(mut sum, count), color| {
        for (sum, channel) in sum.iter_mut().zip(color) {
            *sum += channel;
        }
        (sum, count + 1)
    });

    if count == 0 {
        None
    } else {
        Some(sum.map(|channel| channel / count as f64))
    }
}

/// Cluster `pixels` into at most `count` groups using k-means, returning each non-empty group's center along with
/// its population, most populous first.
///
/// Seeding is deterministic: the first center is the mean of all pixels, and each subsequent center is the pixel
/// farthest from every center chosen so far.
fn cluster(pixels: &[Color], count: usize) -> Vec<(Color, usize)> {
    let mut centers = match mean(pixels.iter()) {
        Some(center) => vec![center],
        None => return Vec::new(),
    };

    while centers.len() < count {
        let farthest = pixels
            .iter()
            .map(|pixel| (pixel, nearest(&centers, pixel).1))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

        match farthest {
            Some((pixel, distance)) if distance > 0.0 => centers.push(*pixel),
            _ => break,
        }
    }

    let mut assignments = vec![usize::MAX; pixels.len()];

    for _ in 0..MAX_ITERATIONS {
        let mut changed = false;

        for (assignment, pixel) in assignments.iter_mut().zip(pixels) {
            let (index, _) = nearest(&centers, pixel);

            if *assignment != index {
                *assignment = index;
                changed = true;
            }
        }

        if !changed {
            break;
        }

        for (index, center) in centers.iter_mut().enumerate() {
            if let Some(mean) = mean(
                pixels
                    .iter()
                    .zip(&assignments)
                    .filter(|(_, assignment)| **assignment == index)
                    .map(|(pixel, _)| pixel),
            ) {
                *center = mean;
            }
        }
    }

    let mut populations = vec![0; centers.len()];

    for &assignment in &assignments {
        populations[assignment] += 1;
    }

    let mut clusters = centers
        .into_iter()
        .zip(populations)
        .filter(|(_, population)| *population > 0)
        .collect::<Vec<_>>();

    // Stable, so equally populous clusters keep their seeding order.
    clusters.sort_by(|a, b| b.1.cmp(&a.1));

    clusters
}

fn hex(color: &Color) -> String {
    let [red, green, blue] = color.map(|channel| channel.round().clamp(0.0, 255.0) as u8);

    format!("#{:02x}{:02x}{:02x}", red, green, blue)
}

/// Decode `content` and return up to [COLOR_COUNT] dominant colors as `#rrggbb` strings, most prominent first.
pub fn dominant_colors(content: &[u8]) -> Result<Vec<String>> {
    let mut image = image::load_from_memory(content)?;

    if image.width() > SAMPLE_BOUNDS || image.height() > SAMPLE_BOUNDS {
        image = image.thumbnail(SAMPLE_BOUNDS, SAMPLE_BOUNDS);
    }

    let pixels = image
        .to_rgb8()
        .pixels()
        .map(|pixel| pixel.0.map(f64::from))
        .collect::<Vec<_>>();

    if pixels.is_empty() {
        return Err(anyhow!("image has no pixels"));
    }

    Ok(cluster(&pixels, COLOR_COUNT)
        .iter()
        .map(|(center, _)| hex(center))
        .collect())
}
