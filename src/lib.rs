//! On-site controller firmware for solar/diesel hybrid energy sites.
//!
//! Every control cycle: poll field devices over Modbus, compute the safe
//! maximum solar output that will not reverse-feed the generators, write
//! that limit to the inverters, verify the write, persist readings,
//! evaluate alarms, and ship results to the cloud — degrading gracefully
//! when the cloud, individual devices, or individual services are gone.

pub mod cloud;
pub mod config;
pub mod config_service;
pub mod control;
pub mod device;
pub mod errors;
pub mod health;
pub mod logging;
pub mod modbus;
pub mod scheduler;
pub mod state;
pub mod supervisor;
pub mod system;
pub mod timestamp;
