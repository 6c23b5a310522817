//! TIFF export for captured frames.
//!
//! Single-frame grayscale export preserving bit depth (8-bit or 16-bit).
//! Paths are created as needed so a retake can rewrite an image after its
//! timepoint directory already exists.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use acq_core::error::{AcqError, AcqResult};
use acq_core::{Frame, PixelData};
use image::{GrayImage, ImageBuffer, ImageFormat, Luma};

/// Write one frame to `path` as grayscale TIFF, overwriting any existing
/// file.
///
/// 8-bit frames are written as 8-bit TIFF, 16-bit frames as 16-bit. The
/// sample buffer is validated against the frame dimensions before
/// anything touches the filesystem.
pub fn write_frame(frame: &Frame, path: &Path) -> AcqResult<()> {
    if !frame.is_complete() {
        return Err(AcqError::Processing(format!(
            "frame buffer holds {} samples for {}x{} pixels",
            frame.pixels().len(),
            frame.width(),
            frame.height()
        )));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    match frame.pixels() {
        PixelData::U16(samples) => {
            let img: ImageBuffer<Luma<u16>, Vec<u16>> =
                ImageBuffer::from_raw(frame.width(), frame.height(), samples.clone())
                    .ok_or_else(|| {
                        AcqError::Processing("frame dimensions do not match pixel count".into())
                    })?;
            img.write_to(&mut writer, ImageFormat::Tiff)
                .map_err(|e| AcqError::Processing(format!("tiff encoding failed: {}", e)))?;
        }
        PixelData::U8(samples) => {
            let img: GrayImage =
                ImageBuffer::from_raw(frame.width(), frame.height(), samples.clone())
                    .ok_or_else(|| {
                        AcqError::Processing("frame dimensions do not match pixel count".into())
                    })?;
            img.write_to(&mut writer, ImageFormat::Tiff)
                .map_err(|e| AcqError::Processing(format!("tiff encoding failed: {}", e)))?;
        }
    }

    Ok(())
}
