//! Image decoding, validation and model input preparation

use std::io::Cursor;

use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, GenericImageView, ImageBuffer, ImageReader, Rgb, RgbImage};
use ndarray::Array4;
use thiserror::Error;

/// Grey fill used around the letterboxed image (YOLO convention)
pub const LETTERBOX_FILL: u8 = 114;

/// Upload could not be turned into a usable image
#[derive(Debug, Error)]
pub enum InvalidImage {
    #[error("empty image payload")]
    Empty,
    #[error("unrecognized image format")]
    UnknownFormat,
    #[error("image has zero width or height")]
    ZeroSized,
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("failed to read image: {0}")]
    Io(#[from] std::io::Error),
}

/// Validated 8-bit RGB image ready for inference
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pixels: RgbImage,
}

impl DecodedImage {
    pub fn from_rgb(pixels: RgbImage) -> Self {
        Self { pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn channels(&self) -> u8 {
        3
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.pixels
    }
}

/// Decode and validate an uploaded image.
///
/// The whole stream is decoded, so truncated or corrupt payloads are rejected
/// here rather than inside the model. The result is RGB, upright according to
/// its EXIF orientation, and no larger than `target_size` on its longer side.
pub fn decode_image(data: &[u8], target_size: u32) -> Result<DecodedImage, InvalidImage> {
    if data.is_empty() {
        return Err(InvalidImage::Empty);
    }

    let reader = ImageReader::new(Cursor::new(data)).with_guessed_format()?;
    if reader.format().is_none() {
        return Err(InvalidImage::UnknownFormat);
    }
    let image = reader.decode()?;

    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(InvalidImage::ZeroSized);
    }

    let image = apply_exif_orientation(data, image);
    let rgb = into_rgb8(image);

    Ok(DecodedImage::from_rgb(downsize(rgb, target_size)))
}

fn into_rgb8(image: DynamicImage) -> RgbImage {
    match image {
        DynamicImage::ImageRgb8(buffer) => buffer,
        other => other.to_rgb8(),
    }
}

/// Shrink so the longer side equals `target_size`; smaller images pass through
fn downsize(image: RgbImage, target_size: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let longer = width.max(height);
    if target_size == 0 || longer <= target_size {
        return image;
    }

    let scale = target_size as f32 / longer as f32;
    let (new_w, new_h) = if width >= height {
        (target_size, ((height as f32 * scale).round() as u32).max(1))
    } else {
        (((width as f32 * scale).round() as u32).max(1), target_size)
    };

    image::imageops::resize(&image, new_w, new_h, FilterType::Triangle)
}

/// Orientation tag from the EXIF block, 1 (upright) when absent or unreadable
fn exif_orientation(data: &[u8]) -> u8 {
    exif::Reader::new()
        .read_from_container(&mut Cursor::new(data))
        .ok()
        .and_then(|meta| {
            meta.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
                .and_then(|field| field.value.get_uint(0))
        })
        .and_then(|value| u8::try_from(value).ok())
        .unwrap_or(1)
}

/// Camera images often only tag their rotation; bake it into the pixels
fn apply_exif_orientation(data: &[u8], image: DynamicImage) -> DynamicImage {
    orient(image, exif_orientation(data))
}

/// Values outside 1..=8 leave the image untouched
fn orient(mut image: DynamicImage, orientation: u8) -> DynamicImage {
    if let Some(orientation) = Orientation::from_exif(orientation) {
        image.apply_orientation(orientation);
    }
    image
}

/// Placement of the resized image inside the letterboxed model input
#[derive(Debug, Clone, Copy)]
struct ResizeInfo {
    new_width: u32,
    new_height: u32,
    offset_x: u32,
    offset_y: u32,
}

impl ResizeInfo {
    fn new(original: (u32, u32), target: (u32, u32)) -> Self {
        let (orig_w, orig_h) = original;
        let (target_w, target_h) = target;

        let scale = f32::min(
            target_w as f32 / orig_w as f32,
            target_h as f32 / orig_h as f32,
        );

        let new_w = ((orig_w as f32 * scale).round() as u32).clamp(1, target_w);
        let new_h = ((orig_h as f32 * scale).round() as u32).clamp(1, target_h);

        Self {
            new_width: new_w,
            new_height: new_h,
            offset_x: (target_w - new_w) / 2,
            offset_y: (target_h - new_h) / 2,
        }
    }
}

/// Letterbox the image into a square canvas and convert to an NCHW tensor
/// in RGB order scaled to [0, 1]
pub fn preprocess_for_detection(image: &DecodedImage, input_size: u32) -> Array4<f32> {
    let padded = letterbox(image.as_rgb(), input_size, input_size);
    image_to_nchw(&padded)
}

/// Resize preserving aspect ratio and pad to `target_w` x `target_h`
fn letterbox(image: &RgbImage, target_w: u32, target_h: u32) -> RgbImage {
    let info = ResizeInfo::new(image.dimensions(), (target_w, target_h));

    let resized = if (info.new_width, info.new_height) == image.dimensions() {
        image.clone()
    } else {
        image::imageops::resize(image, info.new_width, info.new_height, FilterType::Triangle)
    };

    let mut padded: RgbImage = ImageBuffer::from_pixel(
        target_w,
        target_h,
        Rgb([LETTERBOX_FILL, LETTERBOX_FILL, LETTERBOX_FILL]),
    );
    image::imageops::replace(
        &mut padded,
        &resized,
        i64::from(info.offset_x),
        i64::from(info.offset_y),
    );

    padded
}

fn image_to_nchw(image: &RgbImage) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
        tensor[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
        tensor[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
    }

    tensor
}
