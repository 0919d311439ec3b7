//! Logging subsystem: local durable store, alarm evaluation, and the
//! cloud sync engine.

pub mod alarm_evaluator;
pub mod cloud_sync;
pub mod local_db;
pub mod service;

pub use alarm_evaluator::{AlarmEvaluator, TriggeredAlarm};
pub use cloud_sync::CloudSync;
pub use local_db::LocalDatabase;
pub use service::LoggingService;
