//! Device service: polling, status tracking, aggregation, write commands.

pub mod manager;
pub mod service;

pub use manager::{DeviceManager, DeviceSnapshot};
pub use service::DeviceService;
