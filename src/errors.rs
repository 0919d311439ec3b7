use thiserror::Error;

/// Controller error taxonomy.
///
/// Errors stay inside the service that produced them: they mutate device
/// status, enqueue alarms, or leave rows unsynced. They never cross the
/// shared-state boundary — other services only see documents.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Invalid or missing configuration; recoverable by reload.
    #[error("config error: {0}")]
    Config(String),

    /// Transport failure (timeout, refused, reset, serial closed).
    /// Recoverable; drives device-level backoff.
    #[error("communication error: {message}")]
    Communication { message: String },

    /// Device responded with a Modbus exception code, or client-side
    /// address validation failed. Never retried, never cascades to the
    /// device's other registers.
    #[error("register error: {message}")]
    Register { message: String },

    /// Write was sent but the device rejected it.
    #[error("write error: reg={register} value={value}: {message}")]
    Write {
        register: u16,
        value: u16,
        message: String,
    },

    /// Write succeeded but the read-back disagrees beyond tolerance.
    #[error("command not taken: expected {expected}, got {actual}")]
    CommandNotTaken { expected: u16, actual: u16 },

    /// Cloud POST/PATCH failed after retries; affected rows stay unsynced.
    #[error("sync error: {0}")]
    Sync(String),

    /// Service lifecycle failure, visible to the supervisor via /health.
    #[error("service [{service}]: {message}")]
    Service { service: String, message: String },

    /// Deliberate stop after too many failures — not a retry signal.
    #[error("circuit open for {service} after {failures} failures")]
    CircuitOpen { service: String, failures: u32 },

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ControllerError {
    pub fn communication(message: impl Into<String>) -> Self {
        Self::Communication {
            message: message.into(),
        }
    }

    pub fn register(message: impl Into<String>) -> Self {
        Self::Register {
            message: message.into(),
        }
    }

    /// Transport-class errors trigger device backoff and cascade-skip the
    /// remaining registers of the same device; register-class errors do not.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Communication { .. } | Self::Io(_) | Self::Http(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;
