//! Side-by-side previews of a record's images.
//!
//! - one image is returned as is
//! - two images share a row, separated by a divider
//! - three or four images: the first fills the left, the rest stack in a
//!   narrow right column of three cells; unused cells stay blank

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};

use crate::error::{EngineError, EngineResult};
use crate::transport::ServiceTransport;

pub const DIVIDER_WIDTH: u32 = 10;
pub const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
pub const MAX_TILES: usize = 4;
pub const JPEG_QUALITY: u8 = 95;

const SIDE_CELLS: u32 = 3;

#[derive(Debug, Clone)]
pub struct Composite {
    pub image: RgbImage,
    /// Images that made it onto the canvas.
    pub tiles: usize,
}

impl Composite {
    pub fn to_jpeg(&self) -> EngineResult<Vec<u8>> {
        encode_jpeg(&self.image)
    }
}

pub fn encode_jpeg(image: &RgbImage) -> EngineResult<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode_image(image)
        .map_err(|err| EngineError::composite(format!("jpeg encode failed: {err}")))?;
    Ok(out.into_inner())
}

pub fn compose(images: Vec<DynamicImage>) -> EngineResult<Composite> {
    let tiles: Vec<RgbImage> = images
        .into_iter()
        .take(MAX_TILES)
        .map(|image| image.to_rgb8())
        .filter(|image| image.width() > 0 && image.height() > 0)
        .collect();
    let image = match tiles.len() {
        0 => return Err(EngineError::composite("no images to compose")),
        1 => tiles[0].clone(),
        2 => side_by_side(&tiles[0], &tiles[1]),
        _ => hero_with_column(&tiles),
    };
    Ok(Composite {
        image,
        tiles: tiles.len(),
    })
}

/// Downloads what it can; images that fail to fetch or decode are left out
/// and the first `MAX_TILES` survivors are laid out.
pub fn fetch_and_compose(
    transport: &dyn ServiceTransport,
    urls: &[String],
) -> EngineResult<Composite> {
    let mut images = Vec::new();
    for url in urls {
        if images.len() == MAX_TILES {
            break;
        }
        let bytes = match transport.download(url) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(%url, error = %err, "dropping image from composite");
                continue;
            }
        };
        match image::load_from_memory(&bytes) {
            Ok(image) => images.push(image),
            Err(err) => tracing::warn!(%url, error = %err, "dropping undecodable image"),
        }
    }
    compose(images)
}

fn side_by_side(first: &RgbImage, second: &RgbImage) -> RgbImage {
    let base_width = first.width();
    let max_ratio = [first, second]
        .iter()
        .map(|image| f64::from(image.width()) / f64::from(image.height()))
        .fold(f64::MIN_POSITIVE, f64::max);
    let height = ((f64::from(base_width + DIVIDER_WIDTH) / (2.0 * max_ratio)) as u32).max(1);
    let slot_width = (base_width.saturating_sub(DIVIDER_WIDTH) / 2).max(1);

    let mut canvas = RgbImage::from_pixel(base_width, height, BACKGROUND);
    for (slot, image) in [first, second].into_iter().enumerate() {
        let ratio = f64::from(image.width()) / f64::from(image.height());
        let mut fit_height = height;
        let mut fit_width = (f64::from(fit_height) * ratio) as u32;
        if fit_width > slot_width {
            fit_width = slot_width;
            fit_height = (f64::from(fit_width) / ratio) as u32;
        }
        let fit_width = fit_width.max(1);
        let fit_height = fit_height.max(1);
        let resized = imageops::resize(image, fit_width, fit_height, FilterType::Lanczos3);
        let x = slot as u32 * (slot_width + DIVIDER_WIDTH)
            + slot_width.saturating_sub(fit_width) / 2;
        let y = height.saturating_sub(fit_height) / 2;
        imageops::overlay(&mut canvas, &resized, i64::from(x), i64::from(y));
    }
    canvas
}

fn hero_with_column(tiles: &[RgbImage]) -> RgbImage {
    let hero = &tiles[0];
    let (base_width, base_height) = hero.dimensions();
    let cell_width = (base_width / SIDE_CELLS).max(1);
    let cell_height = (base_height / SIDE_CELLS).max(1);

    let mut canvas = RgbImage::from_pixel(
        base_width + DIVIDER_WIDTH + cell_width,
        base_height,
        BACKGROUND,
    );
    imageops::overlay(&mut canvas, hero, 0, 0);
    let column_x = i64::from(base_width + DIVIDER_WIDTH);
    // Missing cells keep the background fill.
    for (cell, tile) in tiles.iter().skip(1).take(SIDE_CELLS as usize).enumerate() {
        let resized = imageops::resize(tile, cell_width, cell_height, FilterType::Lanczos3);
        let y = cell as u32 * (cell_height + DIVIDER_WIDTH);
        imageops::overlay(&mut canvas, &resized, column_x, i64::from(y));
    }
    canvas
}
