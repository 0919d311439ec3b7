//! Modbus I/O layer: typed codec, transport clients, connection pool,
//! and the register reader/writer used by the device service.

pub mod client;
pub mod codec;
pub mod pool;
pub mod reader;
pub mod writer;

pub use client::ModbusClient;
pub use codec::DecodedValue;
pub use pool::ConnectionPool;
pub use reader::RegisterReader;
pub use writer::{RegisterWriter, WriteResult};
