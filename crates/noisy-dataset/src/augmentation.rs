//! Seeded augmentation pipeline.
//!
//! Every stochastic decision draws from a `ChaCha8Rng` derived from
//! `(seed, epoch, sample index)`, so a sample's augmented view does not depend
//! on which producer thread built it or in which order.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageBuffer, Rgb, RgbImage};
use noisy_core::{
    AffineConfig, AugmentationConfig, ColorJitterConfig, GaussianNoiseConfig, ImageDimensions,
    RandomErasingConfig,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

const MAX_SAMPLING_ATTEMPTS: usize = 10;

/// Config-driven transform sequence producing CHW tensors in [0, 1]
#[derive(Debug, Clone)]
pub struct AugmentationPipeline {
    config: AugmentationConfig,
    dims: ImageDimensions,
}

impl AugmentationPipeline {
    pub fn new(config: AugmentationConfig, dims: ImageDimensions) -> Self {
        Self { config, dims }
    }

    /// Deterministic resize + centre crop, for evaluation and augmentation-off runs.
    pub fn evaluation(dims: ImageDimensions) -> Self {
        Self::new(
            AugmentationConfig {
                enabled: false,
                ..AugmentationConfig::default()
            },
            dims,
        )
    }

    pub fn dims(&self) -> ImageDimensions {
        self.dims
    }

    pub fn is_stochastic(&self) -> bool {
        self.config.enabled
    }

    /// RNG for one sample view; same inputs always give the same stream.
    pub fn sample_rng(seed: u64, epoch: usize, index: usize) -> ChaCha8Rng {
        let mixed = seed
            ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (index as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        ChaCha8Rng::seed_from_u64(mixed)
    }

    /// Runs the full pipeline on one decoded image.
    pub fn apply(&self, img: DynamicImage, rng: &mut ChaCha8Rng) -> Vec<f32> {
        let (height, width) = (self.dims.height as u32, self.dims.width as u32);
        let mut result = img;

        if !self.config.enabled {
            result = resize_and_center_crop(&result, self.config.resize_shorter_side, width, height);
            return self.to_tensor_data(&result);
        }

        if let Some(affine) = &self.config.random_affine {
            result = random_affine(&result, affine, rng);
        }

        result = match self.config.random_resized_crop_scale {
            Some(scale) => random_resized_crop(&result, scale, width, height, rng),
            None => resize_and_center_crop(&result, self.config.resize_shorter_side, width, height),
        };

        if rng.gen::<f32>() < self.config.horizontal_flip_prob {
            result = result.fliph();
        }

        if let Some((lo, hi)) = self.config.random_gamma {
            let gamma = rng.gen_range(lo..=hi);
            result = adjust_gamma(&result, gamma);
        }

        if let Some(jitter) = &self.config.color_jitter {
            result = color_jitter(&result, jitter, rng);
        }

        let mut data = self.to_tensor_data(&result);

        if let Some(erasing) = &self.config.random_erasing {
            random_erasing(&mut data, self.dims, erasing, rng);
        }
        if let Some(noise) = &self.config.gaussian_noise {
            add_gaussian_noise(&mut data, noise, rng);
        }

        data
    }

    /// Converts to CHW floats in [0, 1] with the configured channel count.
    fn to_tensor_data(&self, img: &DynamicImage) -> Vec<f32> {
        let channels = self.dims.channels;
        let mut data = Vec::with_capacity(self.dims.num_elements());

        if channels == 1 || self.config.expand_channels {
            let luma = img.to_luma8();
            for _ in 0..channels {
                data.extend(luma.pixels().map(|p| p[0] as f32 / 255.0));
            }
            return data;
        }

        let rgb = img.to_rgb8();
        for c in 0..channels.min(3) {
            data.extend(rgb.pixels().map(|p| p[c] as f32 / 255.0));
        }
        data
    }
}

fn resize_and_center_crop(
    img: &DynamicImage,
    shorter_side: Option<u32>,
    width: u32,
    height: u32,
) -> DynamicImage {
    let Some(shorter) = shorter_side else {
        return img.resize_exact(width, height, FilterType::Triangle);
    };

    let (w, h) = img.dimensions();
    let scale = shorter as f32 / w.min(h).max(1) as f32;
    let new_w = ((w as f32 * scale).round() as u32).max(1);
    let new_h = ((h as f32 * scale).round() as u32).max(1);

    if new_w < width || new_h < height {
        return img.resize_exact(width, height, FilterType::Triangle);
    }

    let resized = img.resize_exact(new_w, new_h, FilterType::Triangle);
    let x = (new_w - width) / 2;
    let y = (new_h - height) / 2;
    resized.crop_imm(x, y, width, height)
}

fn random_resized_crop(
    img: &DynamicImage,
    (scale_lo, scale_hi): (f32, f32),
    width: u32,
    height: u32,
    rng: &mut ChaCha8Rng,
) -> DynamicImage {
    let (w, h) = img.dimensions();
    let area = (w * h) as f32;
    let (log_lo, log_hi) = ((3.0f32 / 4.0).ln(), (4.0f32 / 3.0).ln());

    for _ in 0..MAX_SAMPLING_ATTEMPTS {
        let target_area = area * rng.gen_range(scale_lo..=scale_hi);
        let ratio = rng.gen_range(log_lo..=log_hi).exp();
        let crop_w = (target_area * ratio).sqrt().round() as u32;
        let crop_h = (target_area / ratio).sqrt().round() as u32;

        if crop_w > 0 && crop_h > 0 && crop_w <= w && crop_h <= h {
            let x = rng.gen_range(0..=(w - crop_w));
            let y = rng.gen_range(0..=(h - crop_h));
            return img
                .crop_imm(x, y, crop_w, crop_h)
                .resize_exact(width, height, FilterType::Triangle);
        }
    }

    // Fallback: largest centred square.
    let side = w.min(h);
    img.crop_imm((w - side) / 2, (h - side) / 2, side, side)
        .resize_exact(width, height, FilterType::Triangle)
}

/// Rotation, translation and horizontal shear about the image centre.
fn random_affine(img: &DynamicImage, config: &AffineConfig, rng: &mut ChaCha8Rng) -> DynamicImage {
    let angle = symmetric_sample(rng, config.max_angle).to_radians();
    let shear = symmetric_sample(rng, config.max_shear).to_radians();
    let (width, height) = img.dimensions();
    let tx = symmetric_sample(rng, config.max_translation) * width as f32;
    let ty = symmetric_sample(rng, config.max_translation) * height as f32;

    if angle.abs() < 1e-4 && shear.abs() < 1e-4 && tx.abs() < 0.5 && ty.abs() < 0.5 {
        return img.clone();
    }

    let rgb = img.to_rgb8();
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    let (sin_a, cos_a) = angle.sin_cos();
    let tan_s = shear.tan();

    let output = ImageBuffer::from_fn(width, height, |x, y| {
        let dx = x as f32 - cx - tx;
        let dy = y as f32 - cy - ty;
        // Inverse of rotate(shear(p)).
        let u = cos_a * dx + sin_a * dy;
        let v = -sin_a * dx + cos_a * dy;
        bilinear_sample(&rgb, u - tan_s * v + cx, v + cy)
    });

    DynamicImage::ImageRgb8(output)
}

fn symmetric_sample(rng: &mut ChaCha8Rng, max: f32) -> f32 {
    if max > 0.0 {
        rng.gen_range(-max..=max)
    } else {
        0.0
    }
}

fn bilinear_sample(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = img.dimensions();
    if x < 0.0 || y < 0.0 || x > (width - 1) as f32 || y > (height - 1) as f32 {
        return Rgb([0, 0, 0]);
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0);
    let p10 = img.get_pixel(x1, y0);
    let p01 = img.get_pixel(x0, y1);
    let p11 = img.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let v = p00[c] as f32 * (1.0 - fx) * (1.0 - fy)
            + p10[c] as f32 * fx * (1.0 - fy)
            + p01[c] as f32 * (1.0 - fx) * fy
            + p11[c] as f32 * fx * fy;
        out[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

fn map_rgb(img: &DynamicImage, f: impl Fn([f32; 3]) -> [f32; 3]) -> DynamicImage {
    let mut rgb = img.to_rgb8();
    for pixel in rgb.pixels_mut() {
        let mapped = f([pixel[0] as f32, pixel[1] as f32, pixel[2] as f32]);
        for c in 0..3 {
            pixel[c] = mapped[c].round().clamp(0.0, 255.0) as u8;
        }
    }
    DynamicImage::ImageRgb8(rgb)
}

fn adjust_gamma(img: &DynamicImage, gamma: f32) -> DynamicImage {
    map_rgb(img, |p| p.map(|v| 255.0 * (v / 255.0).powf(gamma)))
}

fn luminance(p: [f32; 3]) -> f32 {
    0.299 * p[0] + 0.587 * p[1] + 0.114 * p[2]
}

fn jitter_factor(rng: &mut ChaCha8Rng, strength: f32) -> Option<f32> {
    (strength > 0.0).then(|| rng.gen_range((1.0 - strength).max(0.0)..=1.0 + strength))
}

fn color_jitter(img: &DynamicImage, config: &ColorJitterConfig, rng: &mut ChaCha8Rng) -> DynamicImage {
    let mut result = img.clone();

    if let Some(factor) = jitter_factor(rng, config.brightness) {
        result = map_rgb(&result, |p| p.map(|v| v * factor));
    }

    if let Some(factor) = jitter_factor(rng, config.contrast) {
        let rgb = result.to_rgb8();
        let count = (rgb.width() * rgb.height()).max(1) as f32;
        let mean = rgb
            .pixels()
            .map(|p| luminance([p[0] as f32, p[1] as f32, p[2] as f32]))
            .sum::<f32>()
            / count;
        result = map_rgb(&result, |p| p.map(|v| mean + factor * (v - mean)));
    }

    if let Some(factor) = jitter_factor(rng, config.saturation) {
        result = map_rgb(&result, |p| {
            let gray = luminance(p);
            p.map(|v| gray + factor * (v - gray))
        });
    }

    result
}

fn random_erasing(
    data: &mut [f32],
    dims: ImageDimensions,
    config: &RandomErasingConfig,
    rng: &mut ChaCha8Rng,
) {
    if rng.gen::<f32>() >= config.probability {
        return;
    }

    let (h, w) = (dims.height, dims.width);
    let area = (h * w) as f32;
    let (scale_lo, scale_hi) = config.scale;
    let (log_lo, log_hi) = (0.3f32.ln(), 3.3f32.ln());

    for _ in 0..MAX_SAMPLING_ATTEMPTS {
        let target = area * rng.gen_range(scale_lo..=scale_hi.max(scale_lo));
        let ratio = rng.gen_range(log_lo..=log_hi).exp();
        let eh = (target * ratio).sqrt().round() as usize;
        let ew = (target / ratio).sqrt().round() as usize;
        if eh == 0 || ew == 0 || eh >= h || ew >= w {
            continue;
        }

        let top = rng.gen_range(0..=h - eh);
        let left = rng.gen_range(0..=w - ew);
        for c in 0..dims.channels {
            for y in top..top + eh {
                let row = c * h * w + y * w;
                data[row + left..row + left + ew].fill(0.0);
            }
        }
        return;
    }
}

fn add_gaussian_noise(data: &mut [f32], config: &GaussianNoiseConfig, rng: &mut ChaCha8Rng) {
    if config.std <= 0.0 || rng.gen::<f32>() >= config.probability {
        return;
    }
    let Ok(normal) = Normal::new(0.0f32, config.std) else {
        return;
    };
    for value in data.iter_mut() {
        *value += normal.sample(rng);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_image(width: u32, height: u32) -> DynamicImage {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x * 4 % 256) as u8, (y * 4 % 256) as u8, 128])
        });
        DynamicImage::ImageRgb8(img)
    }

    fn heavy_config() -> AugmentationConfig {
        AugmentationConfig {
            enabled: true,
            random_affine: Some(AffineConfig {
                max_angle: 15.0,
                max_translation: 0.1,
                max_shear: 5.0,
            }),
            random_resized_crop_scale: Some((0.5, 1.0)),
            horizontal_flip_prob: 0.5,
            random_gamma: Some((0.8, 1.2)),
            color_jitter: Some(ColorJitterConfig {
                brightness: 0.2,
                contrast: 0.2,
                saturation: 0.2,
            }),
            resize_shorter_side: None,
            random_erasing: Some(RandomErasingConfig {
                probability: 0.5,
                scale: (0.02, 0.2),
            }),
            gaussian_noise: Some(GaussianNoiseConfig {
                probability: 0.5,
                std: 0.05,
            }),
            expand_channels: false,
        }
    }

    #[test]
    fn test_same_seed_same_view() {
        let pipeline = AugmentationPipeline::new(heavy_config(), ImageDimensions::new(3, 16, 16));
        let img = create_test_image(40, 30);

        let a = pipeline.apply(img.clone(), &mut AugmentationPipeline::sample_rng(7, 2, 11));
        let b = pipeline.apply(img.clone(), &mut AugmentationPipeline::sample_rng(7, 2, 11));
        let c = pipeline.apply(img, &mut AugmentationPipeline::sample_rng(7, 3, 11));

        assert_eq!(a.len(), 3 * 16 * 16);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_disabled_pipeline_is_deterministic() {
        let dims = ImageDimensions::new(3, 8, 8);
        let pipeline = AugmentationPipeline::evaluation(dims);
        let img = create_test_image(20, 12);

        let a = pipeline.apply(img.clone(), &mut AugmentationPipeline::sample_rng(1, 0, 0));
        let b = pipeline.apply(img, &mut AugmentationPipeline::sample_rng(99, 5, 3));
        assert_eq!(a, b);
        assert!(!pipeline.is_stochastic());
        assert!(a.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_resize_then_center_crop() {
        let img = create_test_image(64, 32);
        let cropped = resize_and_center_crop(&img, Some(20), 16, 16);
        assert_eq!(cropped.dimensions(), (16, 16));

        let too_small = resize_and_center_crop(&img, Some(8), 16, 16);
        assert_eq!(too_small.dimensions(), (16, 16));
    }

    #[test]
    fn test_expand_channels_replicates_luma() {
        let config = AugmentationConfig {
            expand_channels: true,
            ..AugmentationConfig::default()
        };
        let pipeline = AugmentationPipeline::new(config, ImageDimensions::new(3, 4, 4));
        let data = pipeline.apply(create_test_image(4, 4), &mut AugmentationPipeline::sample_rng(0, 0, 0));
        assert_eq!(data.len(), 48);
        assert_eq!(&data[0..16], &data[16..32]);
        assert_eq!(&data[0..16], &data[32..48]);
    }

    #[test]
    fn test_random_erasing_zeroes_patch() {
        let dims = ImageDimensions::new(3, 16, 16);
        let mut data = vec![1.0f32; dims.num_elements()];
        let config = RandomErasingConfig {
            probability: 1.0,
            scale: (0.1, 0.2),
        };
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        random_erasing(&mut data, dims, &config, &mut rng);
        let zeros = data.iter().filter(|v| **v == 0.0).count();
        assert!(zeros > 0);
        assert_eq!(zeros % 3, 0);
    }
}
