//! Per-service health endpoints.
//!
//! Each service exposes `GET /health` on its fixed loopback port; the
//! supervisor and the health monitor only ever learn about a service
//! through this endpoint. Ports are part of the external contract:
//! system 8081, config 8082, device 8083, control 8084, logging 8085.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::info;

pub const PORT_SYSTEM: u16 = 8081;
pub const PORT_CONFIG: u16 = 8082;
pub const PORT_DEVICE: u16 = 8083;
pub const PORT_CONTROL: u16 = 8084;
pub const PORT_LOGGING: u16 = 8085;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HealthStatus {
    Starting = 0,
    Healthy = 1,
    Unhealthy = 2,
    Stopped = 3,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Stopped => "stopped",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Healthy,
            3 => Self::Stopped,
            _ => Self::Unhealthy,
        }
    }
}

type ExtraFields = Arc<dyn Fn() -> Value + Send + Sync>;

/// Shared handle a service uses to flip its own health status.
#[derive(Clone)]
pub struct HealthHandle {
    service: &'static str,
    status: Arc<AtomicU8>,
    started_at: DateTime<Utc>,
    server: Arc<std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl HealthHandle {
    pub fn set(&self, status: HealthStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    /// Tear down the HTTP listener so a restarted service instance can
    /// re-bind the port.
    pub fn stop_server(&self) {
        if let Ok(mut server) = self.server.lock() {
            if let Some(handle) = server.take() {
                handle.abort();
            }
        }
    }

    pub fn get(&self) -> HealthStatus {
        HealthStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}

#[derive(Clone)]
struct HealthServerState {
    handle: HealthHandle,
    extra: ExtraFields,
}

async fn health_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    let mut body = json!({
        "status": state.handle.get().as_str(),
        "service": state.handle.service,
        "uptime": state.handle.uptime_seconds(),
        "timestamp": Utc::now().to_rfc3339(),
    });

    // Service-specific fields (device counts, sync stats, …).
    let extra = (state.extra)();
    if let (Value::Object(map), Value::Object(extra)) = (&mut body, extra) {
        for (k, v) in extra {
            map.insert(k, v);
        }
    }

    Json(body)
}

/// Spawn a `/health` server for a service and return the handle it uses
/// to report its status. `extra` supplies service-specific fields merged
/// into every response.
pub fn spawn_health_server(
    service: &'static str,
    port: u16,
    extra: ExtraFields,
) -> HealthHandle {
    let handle = HealthHandle {
        service,
        status: Arc::new(AtomicU8::new(HealthStatus::Starting as u8)),
        started_at: Utc::now(),
        server: Arc::new(std::sync::Mutex::new(None)),
    };

    let state = HealthServerState {
        handle: handle.clone(),
        extra,
    };

    let app = Router::new()
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let server = tokio::spawn(async move {
        info!(service, port, "health server listening");
        if let Err(e) = axum_server::bind(addr).serve(app.into_make_service()).await {
            tracing::error!(service, error = %e, "health server failed");
        }
    });
    if let Ok(mut slot) = handle.server.lock() {
        *slot = Some(server);
    }

    handle
}

/// No service-specific fields.
pub fn no_extra_fields() -> ExtraFields {
    Arc::new(|| json!({}))
}
