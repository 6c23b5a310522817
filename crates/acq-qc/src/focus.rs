//! Focus-score algorithms.
//!
//! Pure functions from an image frame to a scalar sharpness score. The
//! method is selected once per run from the QC configuration; higher
//! scores mean sharper images for every method.

use acq_core::config::FocusScoreMethod;
use acq_core::error::{AcqError, AcqResult};
use acq_core::Frame;
use ndarray::Array2;
use num_complex::Complex;
use rustfft::FftPlanner;

/// Compute the configured focus score for a frame.
pub fn focus_score(method: FocusScoreMethod, frame: &Frame) -> AcqResult<f64> {
    let img = to_array(frame)?;
    match method {
        FocusScoreMethod::LaplacianVariance => laplacian_variance(&img),
        FocusScoreMethod::NormalizedVariance => normalized_variance(&img),
        FocusScoreMethod::GradientMagnitude => gradient_magnitude(&img),
        FocusScoreMethod::FftHighFreq => fft_high_freq(&img),
    }
}

/// Convert a frame into a row-major `f64` array.
fn to_array(frame: &Frame) -> AcqResult<Array2<f64>> {
    if frame.width() == 0 || frame.height() == 0 {
        return Err(AcqError::Processing("empty image".into()));
    }
    if !frame.is_complete() {
        return Err(AcqError::Processing(format!(
            "frame buffer holds {} samples for {}x{} pixels",
            frame.pixels().len(),
            frame.width(),
            frame.height()
        )));
    }

    let (h, w) = (frame.height() as usize, frame.width() as usize);
    Array2::from_shape_vec((h, w), frame.to_f64())
        .map_err(|e| AcqError::Processing(format!("bad frame shape: {}", e)))
}

/// Population variance of a slice.
fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
}

fn require_min_size(img: &Array2<f64>, min: usize, what: &str) -> AcqResult<()> {
    let (h, w) = img.dim();
    if h < min || w < min {
        return Err(AcqError::Processing(format!(
            "image {}x{} too small for {} (needs at least {}x{})",
            w, h, what, min, min
        )));
    }
    Ok(())
}

/// Variance of the discrete Laplacian over interior pixels.
pub fn laplacian_variance(img: &Array2<f64>) -> AcqResult<f64> {
    require_min_size(img, 3, "laplacian")?;
    let (h, w) = img.dim();

    let mut responses = Vec::with_capacity((h - 2) * (w - 2));
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let r = img[[y - 1, x]] + img[[y + 1, x]] + img[[y, x - 1]] + img[[y, x + 1]]
                - 4.0 * img[[y, x]];
            responses.push(r);
        }
    }
    Ok(variance(&responses))
}

/// Image variance divided by its mean; defined as 0 when the mean is 0.
pub fn normalized_variance(img: &Array2<f64>) -> AcqResult<f64> {
    let n = img.len() as f64;
    let mean = img.iter().sum::<f64>() / n;
    if mean == 0.0 {
        return Ok(0.0);
    }
    let var = img.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Ok(var / mean)
}

/// Mean `sqrt(gx^2 + gy^2)` over interior pixels, with Sobel derivatives.
pub fn gradient_magnitude(img: &Array2<f64>) -> AcqResult<f64> {
    require_min_size(img, 3, "sobel")?;
    let (h, w) = img.dim();

    let mut sum = 0.0;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = img[[y - 1, x + 1]] + 2.0 * img[[y, x + 1]] + img[[y + 1, x + 1]]
                - img[[y - 1, x - 1]]
                - 2.0 * img[[y, x - 1]]
                - img[[y + 1, x - 1]];
            let gy = img[[y + 1, x - 1]] + 2.0 * img[[y + 1, x]] + img[[y + 1, x + 1]]
                - img[[y - 1, x - 1]]
                - 2.0 * img[[y - 1, x]]
                - img[[y - 1, x + 1]];
            sum += (gx * gx + gy * gy).sqrt();
        }
    }
    Ok(sum / ((h - 2) * (w - 2)) as f64)
}

/// Mean FFT magnitude after zeroing a centered low-frequency square of
/// side `min(h, w) / 8`. The mean is taken over the full spectrum size.
pub fn fft_high_freq(img: &Array2<f64>) -> AcqResult<f64> {
    let (h, w) = img.dim();

    let mut planner = FftPlanner::<f64>::new();
    let fft_rows = planner.plan_fft_forward(w);
    let fft_cols = planner.plan_fft_forward(h);

    let mut buf: Vec<Complex<f64>> = img.iter().map(|&v| Complex::new(v, 0.0)).collect();

    for row in buf.chunks_exact_mut(w) {
        fft_rows.process(row);
    }

    let mut col = vec![Complex::new(0.0, 0.0); h];
    for x in 0..w {
        for (y, slot) in col.iter_mut().enumerate() {
            *slot = buf[y * w + x];
        }
        fft_cols.process(&mut col);
        for (y, value) in col.iter().enumerate() {
            buf[y * w + x] = *value;
        }
    }

    // The low-frequency square is centered in the shifted spectrum; map
    // each unshifted index to its shifted position instead of shifting
    // the buffer.
    let side = h.min(w) / 8;
    let (cy, cx) = (h / 2, w / 2);
    let (y0, x0) = (cy - side / 2, cx - side / 2);

    let mut sum = 0.0;
    for y in 0..h {
        let sy = (y + cy) % h;
        for x in 0..w {
            let sx = (x + cx) % w;
            let low_freq =
                side > 0 && sy >= y0 && sy < y0 + side && sx >= x0 && sx < x0 + side;
            if !low_freq {
                sum += buf[y * w + x].norm();
            }
        }
    }
    Ok(sum / (h * w) as f64)
}
