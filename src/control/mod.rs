//! Control service: operation modes, safe-mode supervision, and the
//! per-cycle control loop.

pub mod modes;
pub mod safe_mode;
pub mod service;

pub use modes::{calculate, LoadSource, ModeInputs, ModeOutput};
pub use safe_mode::SafeModeSupervisor;
pub use service::ControlService;
