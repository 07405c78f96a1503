use image::imageops::{self, FilterType};
use image::DynamicImage;
use rand::Rng;

/// Resize / crop / flip pipeline that turns a decoded image into a
/// `[3, crop, crop]` tensor in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct ImageTransform {
    resize: u32,
    crop: u32,
    horizontal_flip: bool,
}

impl ImageTransform {
    /// Random crop and random horizontal flip.
    pub fn train(resize: u32, crop: u32) -> Self {
        Self {
            resize,
            crop,
            horizontal_flip: true,
        }
    }

    /// Random crop without flipping; used for validation and test splits.
    pub fn validation(resize: u32, crop: u32) -> Self {
        Self {
            resize,
            crop,
            horizontal_flip: false,
        }
    }

    pub fn apply(&self, img: &DynamicImage) -> (Vec<f32>, [usize; 3]) {
        let (width, height) = shorter_side_to(img.width(), img.height(), self.resize);
        let rgb = img.resize_exact(width, height, FilterType::Triangle).to_rgb8();

        let crop_w = self.crop.min(width);
        let crop_h = self.crop.min(height);
        let mut rng = rand::thread_rng();
        let x = rng.gen_range(0..=width - crop_w);
        let y = rng.gen_range(0..=height - crop_h);

        let mut cropped = imageops::crop_imm(&rgb, x, y, crop_w, crop_h).to_image();
        if self.horizontal_flip && rng.gen_bool(0.5) {
            cropped = imageops::flip_horizontal(&cropped);
        }

        let (w, h) = (cropped.width() as usize, cropped.height() as usize);
        let plane = w * h;
        let mut data = vec![0.0f32; 3 * plane];
        for (px, py, pixel) in cropped.enumerate_pixels() {
            let offset = py as usize * w + px as usize;
            for channel in 0..3 {
                data[channel * plane + offset] = f32::from(pixel[channel]) / 255.0;
            }
        }

        (data, [3, h, w])
    }
}

fn shorter_side_to(width: u32, height: u32, target: u32) -> (u32, u32) {
    if width <= height {
        let scaled = (height as f64 * target as f64 / width as f64).round() as u32;
        (target, scaled.max(target))
    } else {
        let scaled = (width as f64 * target as f64 / height as f64).round() as u32;
        (scaled.max(target), target)
    }
}
