//! Raster helpers: decode, resize, crop, mask, colour and PNG encoding

use dripdrop_core::{BoundingBox, CroppedImage, Rgb};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageOutputFormat, RgbImage};
use std::io::Cursor;

use crate::endpoint::RawMask;
use crate::error::VisionError;

const MAX_PIXELS: u64 = 100_000_000;

/// Integer pixel rectangle, half-open: [x0, x1) x [y0, y1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl PixelRect {
    /// Truncate a pixel-space box to integers and clamp it into the frame
    pub fn from_box(bbox: &BoundingBox, frame_w: u32, frame_h: u32) -> Self {
        let clamp = |v: f32, max: u32| -> u32 {
            if v.is_nan() || v <= 0.0 {
                0
            } else {
                (v as u32).min(max)
            }
        };
        Self {
            x0: clamp(bbox.xmin, frame_w),
            y0: clamp(bbox.ymin, frame_h),
            x1: clamp(bbox.xmax, frame_w),
            y1: clamp(bbox.ymax, frame_h),
        }
    }

    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Corners normalized to [0, 1] against the frame
    pub fn normalized(&self, frame_w: u32, frame_h: u32) -> BoundingBox {
        BoundingBox::new(self.x0 as f32, self.y0 as f32, self.x1 as f32, self.y1 as f32)
            .normalized(frame_w, frame_h)
    }
}

pub fn decode(bytes: &[u8]) -> Result<RgbImage, VisionError> {
    let image = image::load_from_memory(bytes)?;
    if image.width() as u64 * image.height() as u64 > MAX_PIXELS {
        return Err(VisionError::Processing("Image too large (max 100M pixels)".to_string()));
    }
    Ok(image.to_rgb8())
}

pub fn resize_to(image: &RgbImage, width: u32, height: u32) -> Result<RgbImage, VisionError> {
    if width == 0 || height == 0 {
        return Err(VisionError::Processing("Target dimensions cannot be zero".to_string()));
    }
    if image.width() == width && image.height() == height {
        return Ok(image.clone());
    }
    Ok(imageops::resize(image, width, height, FilterType::Triangle))
}

pub fn crop(frame: &RgbImage, rect: PixelRect) -> RgbImage {
    imageops::crop_imm(frame, rect.x0, rect.y0, rect.width(), rect.height()).to_image()
}

/// Zero every crop pixel whose mask value is not above `threshold`. The mask
/// covers the whole frame; `rect` locates the crop inside it. Returns the
/// foreground flags in crop pixel order.
pub fn apply_mask(
    crop: &mut RgbImage,
    mask: &RawMask,
    rect: PixelRect,
    frame_w: u32,
    frame_h: u32,
    threshold: f32,
) -> Vec<bool> {
    let mut foreground = Vec::with_capacity((crop.width() * crop.height()) as usize);
    for y in 0..crop.height() {
        for x in 0..crop.width() {
            let keep = mask.sample(rect.x0 + x, rect.y0 + y, frame_w, frame_h) > threshold;
            if !keep {
                crop.put_pixel(x, y, image::Rgb([0, 0, 0]));
            }
            foreground.push(keep);
        }
    }
    foreground
}

pub fn is_all_black(image: &RgbImage) -> bool {
    image.pixels().all(|p| p.0 == [0, 0, 0])
}

/// Arithmetic mean of each channel over the foreground pixels (all pixels
/// when no mask was applied). `None` if there are no pixels to average.
pub fn mean_color(image: &RgbImage, foreground: Option<&[bool]>) -> Option<Rgb> {
    let mut sums = [0u64; 3];
    let mut count = 0u64;
    for (i, pixel) in image.pixels().enumerate() {
        if let Some(mask) = foreground {
            if !mask.get(i).copied().unwrap_or(false) {
                continue;
            }
        }
        for (sum, channel) in sums.iter_mut().zip(pixel.0) {
            *sum += channel as u64;
        }
        count += 1;
    }
    if count == 0 {
        return None;
    }
    Some(Rgb::new(
        (sums[0] / count) as u8,
        (sums[1] / count) as u8,
        (sums[2] / count) as u8,
    ))
}

pub fn encode_png(image: &RgbImage) -> Result<CroppedImage, VisionError> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.clone()).write_to(&mut buffer, ImageOutputFormat::Png)?;
    Ok(CroppedImage {
        width: image.width(),
        height: image.height(),
        png: buffer.into_inner(),
    })
}

pub fn decode_png(image: &CroppedImage) -> Result<RgbImage, VisionError> {
    let decoded = image::load_from_memory_with_format(&image.png, image::ImageFormat::Png)?;
    Ok(decoded.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(w, h, image::Rgb(rgb))
    }

    #[test]
    fn test_pixel_rect_clamps_and_truncates() {
        let rect = PixelRect::from_box(&BoundingBox::new(-5.0, 10.7, 700.2, 20.9), 640, 640);
        assert_eq!(rect, PixelRect { x0: 0, y0: 10, x1: 640, y1: 20 });
        assert!(!rect.is_empty());
        assert!(PixelRect::from_box(&BoundingBox::new(10.2, 0.0, 10.8, 5.0), 640, 640).is_empty());
    }

    #[test]
    fn test_pixel_rect_normalized() {
        let rect = PixelRect { x0: 64, y0: 0, x1: 320, y1: 640 };
        let n = rect.normalized(640, 640);
        assert!((n.xmin - 0.1).abs() < 1e-6);
        assert!((n.xmax - 0.5).abs() < 1e-6);
        assert_eq!(n.ymax, 1.0);
    }

    #[test]
    fn test_mask_zeroes_background_and_mean_ignores_it() {
        let frame_w = 4;
        let frame_h = 4;
        let mut crop_img = solid(4, 4, [200, 100, 50]);
        // left half foreground
        let data = (0..16).map(|i| if i % 4 < 2 { 0.8 } else { 0.2 }).collect();
        let mask = RawMask { width: 4, height: 4, data };
        let rect = PixelRect { x0: 0, y0: 0, x1: 4, y1: 4 };

        let fg = apply_mask(&mut crop_img, &mask, rect, frame_w, frame_h, 0.5);
        assert_eq!(fg.iter().filter(|f| **f).count(), 8);
        assert_eq!(crop_img.get_pixel(3, 0).0, [0, 0, 0]);
        assert_eq!(crop_img.get_pixel(0, 0).0, [200, 100, 50]);

        assert_eq!(mean_color(&crop_img, Some(fg.as_slice())), Some(Rgb::new(200, 100, 50)));
        assert_eq!(mean_color(&crop_img, None), Some(Rgb::new(100, 50, 25)));
    }

    #[test]
    fn test_mask_threshold_is_exclusive() {
        let mut crop_img = solid(1, 1, [9, 9, 9]);
        let mask = RawMask { width: 1, height: 1, data: vec![0.5] };
        let fg = apply_mask(&mut crop_img, &mask, PixelRect { x0: 0, y0: 0, x1: 1, y1: 1 }, 1, 1, 0.5);
        assert_eq!(fg, vec![false]);
        assert!(is_all_black(&crop_img));
    }

    #[test]
    fn test_mean_color_empty() {
        let img = solid(2, 2, [1, 2, 3]);
        assert_eq!(mean_color(&img, Some(&[false, false, false, false][..])), None);
        assert_eq!(mean_color(&RgbImage::new(0, 0), None), None);
    }

    #[test]
    fn test_png_roundtrip_and_resize() {
        let img = solid(10, 6, [1, 2, 3]);
        let encoded = encode_png(&img).unwrap();
        assert_eq!((encoded.width, encoded.height), (10, 6));
        let decoded = decode_png(&encoded).unwrap();
        assert_eq!(decoded.get_pixel(5, 5).0, [1, 2, 3]);

        let resized = resize_to(&decoded, 4, 4).unwrap();
        assert_eq!(resized.dimensions(), (4, 4));
        assert!(resize_to(&decoded, 0, 4).is_err());
    }

    #[test]
    fn test_crop() {
        let mut img = solid(8, 8, [0, 0, 0]);
        img.put_pixel(5, 5, image::Rgb([255, 0, 0]));
        let c = crop(&img, PixelRect { x0: 4, y0: 4, x1: 8, y1: 8 });
        assert_eq!(c.dimensions(), (4, 4));
        assert_eq!(c.get_pixel(1, 1).0, [255, 0, 0]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(b"not an image"), Err(VisionError::Image(_))));
    }
}
