//! Resource identity and shared infrastructure for the capture and replay
//! sides: the current/live ID↔handle tables, per-resource chunk records
//! with dirty-threshold diversion, the driver capability-table seam, a
//! deterministic software driver, and the TOML config loader.

pub mod config;
pub mod driver;
pub mod error;
pub mod mode;
pub mod resource_manager;
pub mod software;

pub use config::{CaptureSettings, GfxtraceConfig, ReplaySettings};
pub use mode::Mode;
pub use driver::{DriverError, ReadbackImage, ReplayDriver, ResolvedDescriptorWrite};
pub use error::CoreError;
pub use resource_manager::{RecordOutcome, ResourceManager, UpdateKind};
pub use software::SoftwareDriver;
