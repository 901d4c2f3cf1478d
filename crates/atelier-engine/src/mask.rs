//! Binary masks from a user's markings.
//!
//! Users mark the region to repaint by drawing on a copy of the original.
//! Brush marks are recovered by diffing the two images. Circle marks are a red
//! loop whose interior is flood-filled. White in the resulting mask means
//! "repaint here".

use std::io::Cursor;

use atelier_contracts::InpaintMode;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageError, ImageFormat, Luma, RgbImage};
use thiserror::Error;

/// Per-channel difference above which a pixel counts as marked.
pub const CHANNEL_DIFF_THRESHOLD: i16 = 30;

pub const MARKER_MIN_RED: u8 = 150;
pub const MARKER_MAX_GREEN: u8 = 100;
pub const MARKER_MAX_BLUE: u8 = 100;

/// Loops covering at least this share of the image are taken as already
/// filled and are not flood-filled.
pub const FLOOD_FILL_MAX_MARKER_SHARE: f64 = 0.10;

const SELECTED: u8 = 255;
const CLEAR: u8 = 0;

#[derive(Debug, Error)]
pub enum MaskError {
    #[error("failed to decode {which} image: {source}")]
    Decode {
        which: &'static str,
        #[source]
        source: ImageError,
    },

    #[error("{0} image has no pixels")]
    EmptyImage(&'static str),

    #[error("failed to encode mask: {0}")]
    Encode(#[source] ImageError),
}

/// Single-channel mask; 255 is selected, 0 is kept.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    image: GrayImage,
}

impl Mask {
    fn from_selection(width: u32, height: u32, selected: &[bool]) -> Self {
        let image = GrayImage::from_fn(width, height, |x, y| {
            let idx = (y as usize) * (width as usize) + x as usize;
            Luma([if selected[idx] { SELECTED } else { CLEAR }])
        });
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_selected(&self, x: u32, y: u32) -> bool {
        self.image
            .get_pixel_checked(x, y)
            .is_some_and(|pixel| pixel.0[0] == SELECTED)
    }

    pub fn selected_pixels(&self) -> usize {
        self.image.as_raw().iter().filter(|v| **v == SELECTED).count()
    }

    pub fn as_image(&self) -> &GrayImage {
        &self.image
    }

    /// PNG bytes, three-channel black and white as the service expects.
    pub fn to_png(&self) -> Result<Vec<u8>, MaskError> {
        let rgb = DynamicImage::ImageLuma8(self.image.clone()).to_rgb8();
        let mut out = Cursor::new(Vec::new());
        rgb.write_to(&mut out, ImageFormat::Png)
            .map_err(MaskError::Encode)?;
        Ok(out.into_inner())
    }

    pub fn to_data_uri(&self) -> Result<String, MaskError> {
        Ok(format!("data:image/png;base64,{}", BASE64.encode(self.to_png()?)))
    }
}

/// Dispatches on the marking style. Brush masks ignore `invert`.
pub fn build_mask(
    mode: InpaintMode,
    original: &[u8],
    marked: &[u8],
    invert: bool,
) -> Result<Mask, MaskError> {
    match mode {
        InpaintMode::Brush => diff_mask(original, marked),
        InpaintMode::Circle => circle_mask(original, marked, invert),
    }
}

pub fn diff_mask(original: &[u8], marked: &[u8]) -> Result<Mask, MaskError> {
    let (original, marked) = decode_pair(original, marked)?;
    Ok(diff_mask_from_images(&original, &marked))
}

pub fn circle_mask(original: &[u8], marked: &[u8], invert: bool) -> Result<Mask, MaskError> {
    let (original, marked) = decode_pair(original, marked)?;
    Ok(circle_mask_from_images(&original, &marked, invert))
}

/// Selects every pixel where any channel moved past the threshold, then grows
/// the selection by one pixel. `marked` must already match `original` in size.
pub fn diff_mask_from_images(original: &RgbImage, marked: &RgbImage) -> Mask {
    let (width, height) = original.dimensions();
    let selected: Vec<bool> = pixel_pairs(original, marked)
        .map(|(o, m)| deltas(o, m).iter().any(|d| d.abs() > CHANNEL_DIFF_THRESHOLD))
        .collect();
    Mask::from_selection(width, height, &dilate(&selected, width, height))
}

/// Finds red marker strokes, fills the loop they enclose and grows the result
/// by one pixel. With `invert` the region outside the loop is selected.
/// Without any marker pixels the mask is empty regardless of `invert`.
pub fn circle_mask_from_images(original: &RgbImage, marked: &RgbImage, invert: bool) -> Mask {
    let (width, height) = original.dimensions();
    let markers: Vec<bool> = pixel_pairs(original, marked)
        .map(|(o, m)| is_marker(o, m))
        .collect();
    let marker_count = markers.iter().filter(|m| **m).count();
    if marker_count == 0 {
        return Mask::from_selection(width, height, &markers);
    }

    let mut selected = markers.clone();
    let area = (width as usize) * (height as usize);
    if (marker_count as f64) < (area as f64) * FLOOD_FILL_MAX_MARKER_SHARE {
        let (cx, cy) = centroid(&markers, width, marker_count);
        flood_fill(&mut selected, &markers, width, height, cx, cy);
    }
    if invert {
        selected.iter_mut().for_each(|s| *s = !*s);
    }
    Mask::from_selection(width, height, &dilate(&selected, width, height))
}

fn decode_pair(original: &[u8], marked: &[u8]) -> Result<(RgbImage, RgbImage), MaskError> {
    let original = decode("original", original)?;
    let marked = decode("marked", marked)?;
    let (width, height) = original.dimensions();
    let marked = if marked.dimensions() == (width, height) {
        marked
    } else {
        tracing::debug!(
            from = ?marked.dimensions(),
            to = ?(width, height),
            "resampling marked image"
        );
        image::imageops::resize(&marked, width, height, FilterType::Triangle)
    };
    Ok((original, marked))
}

fn decode(which: &'static str, bytes: &[u8]) -> Result<RgbImage, MaskError> {
    let image = image::load_from_memory(bytes)
        .map_err(|source| MaskError::Decode { which, source })?
        .to_rgb8();
    if image.width() == 0 || image.height() == 0 {
        return Err(MaskError::EmptyImage(which));
    }
    Ok(image)
}

fn pixel_pairs<'a>(
    original: &'a RgbImage,
    marked: &'a RgbImage,
) -> impl Iterator<Item = (&'a [u8], &'a [u8])> + 'a {
    original
        .as_raw()
        .chunks_exact(3)
        .zip(marked.as_raw().chunks_exact(3))
}

fn deltas(original: &[u8], marked: &[u8]) -> [i16; 3] {
    [
        i16::from(marked[0]) - i16::from(original[0]),
        i16::from(marked[1]) - i16::from(original[1]),
        i16::from(marked[2]) - i16::from(original[2]),
    ]
}

/// A pixel is marker ink when it reads as saturated red, or when its red
/// channel jumped and now dominates.
fn is_marker(original: &[u8], marked: &[u8]) -> bool {
    let (r, g, b) = (marked[0], marked[1], marked[2]);
    let saturated = r > MARKER_MIN_RED && g < MARKER_MAX_GREEN && b < MARKER_MAX_BLUE;
    let [dr, _, _] = deltas(original, marked);
    let shifted = dr.abs() > CHANNEL_DIFF_THRESHOLD && r > g && r > b;
    saturated || shifted
}

fn centroid(markers: &[bool], width: u32, count: usize) -> (u32, u32) {
    let width = width as usize;
    let (sum_x, sum_y) = markers
        .iter()
        .enumerate()
        .filter(|(_, marked)| **marked)
        .fold((0usize, 0usize), |(sx, sy), (idx, _)| {
            (sx + idx % width, sy + idx / width)
        });
    ((sum_x / count) as u32, (sum_y / count) as u32)
}

/// 4-connected fill over non-marker pixels starting at the seed. A seed that
/// sits on the stroke fills nothing. An unclosed loop leaks to the border.
fn flood_fill(
    selected: &mut [bool],
    markers: &[bool],
    width: u32,
    height: u32,
    seed_x: u32,
    seed_y: u32,
) {
    let (w, h) = (width as usize, height as usize);
    let seed = (seed_y as usize) * w + seed_x as usize;
    if seed >= markers.len() || markers[seed] {
        return;
    }
    let mut visited = vec![false; markers.len()];
    let mut stack = vec![seed];
    visited[seed] = true;
    while let Some(idx) = stack.pop() {
        selected[idx] = true;
        let (x, y) = (idx % w, idx / w);
        let neighbors = [
            (x > 0).then(|| idx - 1),
            (x + 1 < w).then(|| idx + 1),
            (y > 0).then(|| idx - w),
            (y + 1 < h).then(|| idx + w),
        ];
        for next in neighbors.into_iter().flatten() {
            if !visited[next] && !markers[next] {
                visited[next] = true;
                stack.push(next);
            }
        }
    }
}

/// 3x3 max filter, done as a horizontal then a vertical pass.
fn dilate(selected: &[bool], width: u32, height: u32) -> Vec<bool> {
    let (w, h) = (width as usize, height as usize);
    let mut horizontal = vec![false; selected.len()];
    for y in 0..h {
        let row = &selected[y * w..(y + 1) * w];
        for x in 0..w {
            let lo = x.saturating_sub(1);
            let hi = (x + 1).min(w - 1);
            horizontal[y * w + x] = row[lo..=hi].iter().any(|s| *s);
        }
    }
    let mut out = vec![false; selected.len()];
    for y in 0..h {
        let lo = y.saturating_sub(1);
        let hi = (y + 1).min(h - 1);
        for x in 0..w {
            out[y * w + x] = (lo..=hi).any(|yy| horizontal[yy * w + x]);
        }
    }
    out
}
