//! Region cropping and the binarization variants each crop is recognized under.

use crate::types::Region;
use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma};
use imageproc::contrast::{otsu_level, threshold, ThresholdType};
use imageproc::filter::box_filter;

const PADDING: u32 = 5;
const MIN_CROP_WIDTH: u32 = 200;
// 11x11 block.
const ADAPTIVE_RADIUS: u32 = 5;
const ADAPTIVE_OFFSET: i16 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Variant {
    GlobalThreshold,
    AdaptiveThreshold,
    InvertedThreshold,
}

pub const VARIANTS: [Variant; 3] = [
    Variant::GlobalThreshold,
    Variant::AdaptiveThreshold,
    Variant::InvertedThreshold,
];

impl Variant {
    pub fn apply(self, crop: &GrayImage) -> GrayImage {
        match self {
            Variant::GlobalThreshold => threshold(crop, otsu_level(crop), ThresholdType::Binary),
            Variant::AdaptiveThreshold => adaptive_mean(crop),
            Variant::InvertedThreshold => {
                threshold(crop, otsu_level(crop), ThresholdType::BinaryInverted)
            }
        }
    }
}

/// Pads the region, clamps it to the frame and upscales narrow crops.
pub fn crop_region(frame: &GrayImage, region: &Region) -> Option<GrayImage> {
    let left = region.x.saturating_sub(PADDING);
    let top = region.y.saturating_sub(PADDING);
    let right = region
        .x
        .saturating_add(region.width)
        .saturating_add(PADDING)
        .min(frame.width());
    let bottom = region
        .y
        .saturating_add(region.height)
        .saturating_add(PADDING)
        .min(frame.height());
    if right <= left || bottom <= top {
        return None;
    }
    let crop = imageops::crop_imm(frame, left, top, right - left, bottom - top).to_image();
    if crop.width() >= MIN_CROP_WIDTH {
        return Some(crop);
    }
    let scale = MIN_CROP_WIDTH as f64 / crop.width() as f64;
    let height = ((crop.height() as f64 * scale).round() as u32).max(1);
    Some(imageops::resize(
        &crop,
        MIN_CROP_WIDTH,
        height,
        FilterType::CatmullRom,
    ))
}

/// Foreground where a pixel is brighter than its block mean less the offset.
fn adaptive_mean(crop: &GrayImage) -> GrayImage {
    let mean = box_filter(crop, ADAPTIVE_RADIUS, ADAPTIVE_RADIUS);
    ImageBuffer::from_fn(crop.width(), crop.height(), |x, y| {
        let value = crop.get_pixel(x, y)[0] as i16;
        let local = mean.get_pixel(x, y)[0] as i16;
        Luma([if value > local - ADAPTIVE_OFFSET { 255 } else { 0 }])
    })
}
