use std::collections::HashMap;

use image::RgbImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    pub fn from_hex(value: &str) -> Option<Self> {
        let hex = value.strip_prefix('#')?;
        if hex.len() != 6 {
            return None;
        }
        let channel =
            |range: std::ops::Range<usize>| u8::from_str_radix(hex.get(range)?, 16).ok();
        Some(Self::new(channel(0..2)?, channel(2..4)?, channel(4..6)?))
    }

    fn lightness(&self) -> f32 {
        let (min, max) = self.min_max();
        (min + max) / 2.0
    }

    fn saturation(&self) -> f32 {
        let (min, max) = self.min_max();
        if max == min {
            return 0.0;
        }
        let lightness = (min + max) / 2.0;
        let delta = max - min;
        if lightness > 0.5 {
            delta / (2.0 - max - min)
        } else {
            delta / (max + min)
        }
    }

    fn min_max(&self) -> (f32, f32) {
        let channels = [self.r, self.g, self.b].map(|c| f32::from(c) / 255.0);
        let min = channels.iter().copied().fold(f32::MAX, f32::min);
        let max = channels.iter().copied().fold(f32::MIN, f32::max);
        (min, max)
    }
}

/// Representative colors of a cover, cached so the UI never re-decodes the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    /// Largest color cluster.
    pub dominant: Rgb,
    pub dark_muted: Rgb,
    pub vibrant: Rgb,
}

/// Platform color extraction. Returns `None` when the platform cannot decode or
/// does not support extraction.
pub trait PaletteExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8]) -> Option<Palette>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPaletteExtractor;

impl PaletteExtractor for NoopPaletteExtractor {
    fn extract(&self, _bytes: &[u8]) -> Option<Palette> {
        None
    }
}

/// Decodes with the `image` crate and clusters a downscaled sample into
/// 4-bit-per-channel buckets.
#[derive(Debug, Clone, Copy)]
pub struct ImagePaletteExtractor {
    sample_size: u32,
}

impl Default for ImagePaletteExtractor {
    fn default() -> Self {
        Self { sample_size: 64 }
    }
}

impl ImagePaletteExtractor {
    pub fn with_sample_size(sample_size: u32) -> Self {
        Self {
            sample_size: sample_size.max(1),
        }
    }
}

impl PaletteExtractor for ImagePaletteExtractor {
    fn extract(&self, bytes: &[u8]) -> Option<Palette> {
        let image = match image::load_from_memory(bytes) {
            Ok(image) => image,
            Err(err) => {
                tracing::debug!(error = %err, "cover is not decodable, skipping palette");
                return None;
            }
        };
        let size = self.sample_size;
        let sample = if image.width() > size || image.height() > size {
            image.thumbnail(size, size).to_rgb8()
        } else {
            image.to_rgb8()
        };
        palette_from_clusters(&quantize(&sample))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Cluster {
    count: u64,
    sum: [u64; 3],
}

impl Cluster {
    fn color(&self) -> Rgb {
        let avg = |i: usize| (self.sum[i] / self.count.max(1)).min(255) as u8;
        Rgb::new(avg(0), avg(1), avg(2))
    }
}

fn quantize(image: &RgbImage) -> Vec<Cluster> {
    let mut buckets: HashMap<(u8, u8, u8), Cluster> = HashMap::new();
    for pixel in image.pixels() {
        let [r, g, b] = pixel.0;
        let cluster = buckets.entry((r >> 4, g >> 4, b >> 4)).or_default();
        cluster.count += 1;
        cluster.sum[0] += u64::from(r);
        cluster.sum[1] += u64::from(g);
        cluster.sum[2] += u64::from(b);
    }
    let mut clusters: Vec<_> = buckets.into_iter().collect();
    clusters.sort_by(|(a_key, a), (b_key, b)| b.count.cmp(&a.count).then(a_key.cmp(b_key)));
    clusters.into_iter().map(|(_, cluster)| cluster).collect()
}

fn palette_from_clusters(clusters: &[Cluster]) -> Option<Palette> {
    let dominant = clusters.first()?.color();
    let total: u64 = clusters.iter().map(|c| c.count).sum();
    let min_population = (total / 100).max(1);
    let eligible: Vec<Rgb> = clusters
        .iter()
        .filter(|c| c.count >= min_population)
        .map(Cluster::color)
        .collect();

    let dark_muted = eligible
        .iter()
        .filter(|c| c.lightness() < 0.5)
        .min_by(|a, b| {
            (a.lightness() + a.saturation()).total_cmp(&(b.lightness() + b.saturation()))
        })
        .or_else(|| {
            eligible
                .iter()
                .min_by(|a, b| a.lightness().total_cmp(&b.lightness()))
        })
        .copied()
        .unwrap_or(dominant);

    let vibrant = eligible
        .iter()
        .filter(|c| (0.2..=0.85).contains(&c.lightness()))
        .max_by(|a, b| a.saturation().total_cmp(&b.saturation()))
        .copied()
        .unwrap_or(dominant);

    Some(Palette {
        dominant,
        dark_muted,
        vibrant,
    })
}
