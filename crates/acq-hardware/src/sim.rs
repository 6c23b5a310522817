//! Simulated microscope.
//!
//! Tracks stage position and channel selection with no real motion, and
//! synthesizes frames on capture. Tests that need specific image content
//! (a flat frame, a scripted failure) install a frame source closure;
//! everything else gets a deterministic checkerboard-plus-noise pattern.

use acq_core::error::{HardwareError, HardwareErrorKind};
use acq_core::Frame;

use crate::MicroscopeHardware;

const DEVICE: &str = "sim_microscope";

/// Per-capture frame synthesizer installed by tests.
pub type FrameSource = Box<dyn FnMut(u64) -> Result<Frame, HardwareError> + Send>;

/// Configuration for [`SimMicroscope`].
#[derive(Debug, Clone)]
pub struct SimMicroscopeConfig {
    /// Frame width in pixels (default: 64)
    pub frame_width: u32,

    /// Frame height in pixels (default: 64)
    pub frame_height: u32,

    /// Bits per pixel for synthesized frames (default: 16)
    pub bit_depth: u32,

    /// Fixed piezo-Z displacement to report, `None` for no piezo.
    pub piezo_z_um: Option<f64>,
}

impl Default for SimMicroscopeConfig {
    fn default() -> Self {
        Self {
            frame_width: 64,
            frame_height: 64,
            bit_depth: 16,
            piezo_z_um: None,
        }
    }
}

/// Simulated microscope with position tracking and synthetic frames.
pub struct SimMicroscope {
    config: SimMicroscopeConfig,
    x_mm: f64,
    y_mm: f64,
    z_mm: f64,
    channel: String,
    captures: u64,
    frame_source: Option<FrameSource>,
}

impl SimMicroscope {
    pub fn new() -> Self {
        Self::with_config(SimMicroscopeConfig::default())
    }

    pub fn with_config(config: SimMicroscopeConfig) -> Self {
        Self {
            config,
            x_mm: 0.0,
            y_mm: 0.0,
            z_mm: 0.0,
            channel: String::new(),
            captures: 0,
            frame_source: None,
        }
    }

    /// Install a closure that produces the frame for each capture.
    ///
    /// The closure receives the zero-based capture index and may return a
    /// hardware error to script a camera fault.
    pub fn with_frame_source(
        mut self,
        source: impl FnMut(u64) -> Result<Frame, HardwareError> + Send + 'static,
    ) -> Self {
        self.frame_source = Some(Box::new(source));
        self
    }

    /// Number of captures triggered so far.
    pub fn captures(&self) -> u64 {
        self.captures
    }

    /// Deterministic checkerboard with LCG noise, seeded by capture index.
    fn synth_frame(&self, index: u64) -> Frame {
        let w = self.config.frame_width;
        let h = self.config.frame_height;
        let seed = index.wrapping_mul(2654435761);

        let mut pixels = Vec::with_capacity((w * h) as usize);
        for y in 0..h {
            for x in 0..w {
                let base: u32 = if (x / 8 + y / 8) % 2 == 0 { 16384 } else { 19660 };
                let noise = prng(seed ^ ((y * w + x) as u64)) & 0x7FF;
                pixels.push((base + noise as u32).min(65535) as u16);
            }
        }

        if self.config.bit_depth == 8 {
            let bytes: Vec<u8> = pixels.iter().map(|&p| (p >> 8) as u8).collect();
            Frame::from_gray8(w, h, bytes)
        } else {
            Frame::from_gray16(w, h, pixels)
        }
    }
}

impl Default for SimMicroscope {
    fn default() -> Self {
        Self::new()
    }
}

/// Simple LCG for reproducible noise.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

impl MicroscopeHardware for SimMicroscope {
    fn move_to(&mut self, x_mm: f64, y_mm: f64, z_mm: f64) -> Result<(), HardwareError> {
        tracing::debug!(x_mm, y_mm, z_mm, "SimMicroscope: move");
        self.x_mm = x_mm;
        self.y_mm = y_mm;
        self.z_mm = z_mm;
        Ok(())
    }

    fn set_channel(&mut self, channel: &str) -> Result<(), HardwareError> {
        if channel.is_empty() {
            return Err(HardwareError::new(
                DEVICE,
                HardwareErrorKind::Channel,
                "empty channel identifier",
            ));
        }
        self.channel = channel.to_string();
        Ok(())
    }

    fn trigger_capture(&mut self) -> Result<Frame, HardwareError> {
        let index = self.captures;
        self.captures += 1;

        if let Some(source) = self.frame_source.as_mut() {
            source(index)
        } else {
            Ok(self.synth_frame(index))
        }
    }

    fn current_z_um(&self) -> Result<f64, HardwareError> {
        Ok(self.z_mm * 1000.0 + self.config.piezo_z_um.unwrap_or(0.0))
    }

    fn piezo_z_um(&self) -> Result<Option<f64>, HardwareError> {
        Ok(self.config.piezo_z_um)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_updates_position() {
        let mut scope = SimMicroscope::new();
        scope.move_to(1.5, 2.5, 0.2).unwrap();
        assert_eq!(scope.current_z_um().unwrap(), 200.0);
    }

    #[test]
    fn test_piezo_included_in_absolute_z() {
        let mut scope = SimMicroscope::with_config(SimMicroscopeConfig {
            piezo_z_um: Some(4.0),
            ..Default::default()
        });
        scope.move_to(0.0, 0.0, 1.0).unwrap();
        assert_eq!(scope.current_z_um().unwrap(), 1004.0);
        assert_eq!(scope.piezo_z_um().unwrap(), Some(4.0));
    }

    #[test]
    fn test_default_frames_are_deterministic_per_index() {
        let mut a = SimMicroscope::new();
        let mut b = SimMicroscope::new();
        let first = a.trigger_capture().unwrap();
        assert_eq!(first, b.trigger_capture().unwrap());

        // Different capture index, different noise seed.
        assert_ne!(first, a.trigger_capture().unwrap());
        assert_eq!(a.captures(), 2);
    }

    #[test]
    fn test_frame_source_overrides_synth() {
        let mut scope = SimMicroscope::new()
            .with_frame_source(|i| Ok(Frame::from_gray8(2, 2, vec![i as u8; 4])));
        assert_eq!(
            scope.trigger_capture().unwrap(),
            Frame::from_gray8(2, 2, vec![0; 4])
        );
        assert_eq!(
            scope.trigger_capture().unwrap(),
            Frame::from_gray8(2, 2, vec![1; 4])
        );
    }

    #[test]
    fn test_frame_source_can_script_failure() {
        let mut scope = SimMicroscope::new().with_frame_source(|_| {
            Err(HardwareError::new(
                DEVICE,
                HardwareErrorKind::Trigger,
                "sensor readout failed",
            ))
        });
        assert!(scope.trigger_capture().is_err());
    }

    #[test]
    fn test_empty_channel_rejected() {
        let mut scope = SimMicroscope::new();
        assert!(scope.set_channel("").is_err());
        assert!(scope.set_channel("BF").is_ok());
    }
}
