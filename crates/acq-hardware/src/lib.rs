//! Microscope hardware interface.
//!
//! The acquisition worker is the sole driver of hardware: it runs on one
//! dedicated thread and every operation here is synchronous from its
//! perspective. The trait is therefore `&mut self`; there is no interior
//! locking to get wrong, and implementations do not need to be `Sync`.
//!
//! Real stages, cameras and illumination controllers live behind this
//! boundary and are out of scope for this workspace; [`sim::SimMicroscope`]
//! provides a deterministic implementation for development and tests.

pub mod sim;

pub use sim::{SimMicroscope, SimMicroscopeConfig};

use acq_core::error::HardwareError;
use acq_core::Frame;

/// The operations the acquisition worker needs from the instrument.
///
/// All failures are structured [`HardwareError`]s; any of them is fatal
/// to the run from the worker's point of view.
pub trait MicroscopeHardware: Send {
    /// Move the stage to an absolute position (millimeters) and settle.
    fn move_to(&mut self, x_mm: f64, y_mm: f64, z_mm: f64) -> Result<(), HardwareError>;

    /// Select the illumination/filter channel for subsequent captures.
    fn set_channel(&mut self, channel: &str) -> Result<(), HardwareError>;

    /// Trigger one exposure and return the captured frame.
    ///
    /// Ownership of the frame transfers to the caller; the driver keeps
    /// no reference to the buffer.
    fn trigger_capture(&mut self) -> Result<Frame, HardwareError>;

    /// Current absolute Z position in micrometers.
    fn current_z_um(&self) -> Result<f64, HardwareError>;

    /// Current piezo-Z displacement in micrometers, `None` when no piezo
    /// is fitted.
    fn piezo_z_um(&self) -> Result<Option<f64>, HardwareError>;
}
