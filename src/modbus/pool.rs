//! Modbus connection pool.
//!
//! Keyed by `host:port` for network transports and by serial port path
//! for RTU-direct. Connections are created cold and dial lazily on first
//! use; a reaper closes connections idle beyond a window. Serial ports
//! additionally get a bus mutex: one RS485 line carries many slaves, and
//! every read or write+verify sequence against any of them must hold the
//! mutex for its entire duration — which is why the pool hands the mutex
//! to callers instead of burying it inside the transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::Transport;
use crate::modbus::client::ModbusClient;

const REAPER_INTERVAL: Duration = Duration::from_secs(60);

pub type SharedClient = Arc<Mutex<ModbusClient>>;
pub type BusMutex = Arc<Mutex<()>>;

struct PooledConnection {
    client: SharedClient,
    bus: Option<BusMutex>,
    last_used: Instant,
    use_count: u64,
}

#[derive(Clone)]
pub struct ConnectionPool {
    connections: Arc<Mutex<HashMap<String, PooledConnection>>>,
    max_idle: Duration,
}

impl ConnectionPool {
    pub fn new(max_idle: Duration) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            max_idle,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(300))
    }

    /// Get (or create) the client for a transport, plus the bus mutex for
    /// serial transports. TCP and gateway transports carry no bus mutex.
    pub async fn get(&self, transport: &Transport) -> (SharedClient, Option<BusMutex>) {
        let key = transport.endpoint_key();
        let mut connections = self.connections.lock().await;

        if let Some(pooled) = connections.get_mut(&key) {
            pooled.last_used = Instant::now();
            pooled.use_count += 1;
            return (pooled.client.clone(), pooled.bus.clone());
        }

        let client = Arc::new(Mutex::new(ModbusClient::new(transport.clone())));
        let bus = transport.is_serial().then(|| Arc::new(Mutex::new(())));
        debug!(endpoint = %key, serial = transport.is_serial(), "pooled new connection");

        connections.insert(
            key,
            PooledConnection {
                client: client.clone(),
                bus: bus.clone(),
                last_used: Instant::now(),
                use_count: 1,
            },
        );
        (client, bus)
    }

    /// Drop and redial a serial connection. Serial ports hold exclusive
    /// OS locks, so a wedged client stays wedged until replaced; the
    /// reader invokes this when a serial device is declared unreachable.
    pub async fn reconnect_serial(&self, serial_port: &str) {
        let connections = self.connections.lock().await;
        if let Some(pooled) = connections.get(serial_port) {
            let client = pooled.client.clone();
            drop(connections);
            client.lock().await.disconnect().await;
            info!(endpoint = serial_port, "serial connection reset");
        }
    }

    /// Force-close one endpoint.
    pub async fn close(&self, endpoint: &str) {
        let mut connections = self.connections.lock().await;
        if let Some(pooled) = connections.remove(endpoint) {
            drop(connections);
            pooled.client.lock().await.disconnect().await;
            debug!(endpoint, "closed connection");
        }
    }

    /// Close everything (shutdown).
    pub async fn close_all(&self) {
        let mut connections = self.connections.lock().await;
        for (_, pooled) in connections.drain() {
            pooled.client.lock().await.disconnect().await;
        }
    }

    /// Periodic idle-connection reaper; runs until the returned task is
    /// aborted.
    pub fn spawn_reaper(&self) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(REAPER_INTERVAL).await;
                pool.reap_idle().await;
            }
        })
    }

    async fn reap_idle(&self) {
        let mut to_close = Vec::new();
        {
            let mut connections = self.connections.lock().await;
            let idle: Vec<String> = connections
                .iter()
                .filter(|(_, p)| p.last_used.elapsed() > self.max_idle)
                .map(|(k, _)| k.clone())
                .collect();
            for key in idle {
                if let Some(pooled) = connections.remove(&key) {
                    to_close.push((key, pooled.client));
                }
            }
        }

        if !to_close.is_empty() {
            info!(count = to_close.len(), "reaped idle modbus connections");
        }
        for (_, client) in to_close {
            client.lock().await.disconnect().await;
        }
    }

    pub async fn stats(&self) -> serde_json::Value {
        let connections = self.connections.lock().await;
        let mut per_endpoint = serde_json::Map::new();
        for (key, pooled) in connections.iter() {
            per_endpoint.insert(
                key.clone(),
                serde_json::json!({
                    "use_count": pooled.use_count,
                    "idle_s": pooled.last_used.elapsed().as_secs(),
                    "has_bus_mutex": pooled.bus.is_some(),
                }),
            );
        }
        serde_json::json!({
            "total_connections": connections.len(),
            "connections": per_endpoint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp(host: &str) -> Transport {
        Transport::Tcp {
            host: host.into(),
            port: 502,
        }
    }

    fn serial(path: &str) -> Transport {
        Transport::RtuDirect {
            serial_port: path.into(),
            baudrate: 9600,
            parity: None,
            stopbits: 1,
        }
    }

    #[tokio::test]
    async fn same_endpoint_shares_one_client() {
        let pool = ConnectionPool::with_defaults();
        let (a, _) = pool.get(&tcp("10.0.0.1")).await;
        let (b, _) = pool.get(&tcp("10.0.0.1")).await;
        assert!(Arc::ptr_eq(&a, &b));

        let stats = pool.stats().await;
        assert_eq!(stats["total_connections"], 1);
        assert_eq!(stats["connections"]["10.0.0.1:502"]["use_count"], 2);
    }

    #[tokio::test]
    async fn serial_endpoints_carry_a_bus_mutex_and_share_it() {
        let pool = ConnectionPool::with_defaults();
        let (_, bus_a) = pool.get(&serial("/dev/ttyACM1")).await;
        let (_, bus_b) = pool.get(&serial("/dev/ttyACM1")).await;
        let bus_a = bus_a.expect("serial transport has a bus mutex");
        let bus_b = bus_b.unwrap();
        assert!(Arc::ptr_eq(&bus_a, &bus_b));

        let (_, none) = pool.get(&tcp("10.0.0.2")).await;
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn reaper_closes_idle_connections() {
        let pool = ConnectionPool::new(Duration::from_millis(10));
        let _ = pool.get(&tcp("10.0.0.3")).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.reap_idle().await;
        assert_eq!(pool.stats().await["total_connections"], 0);
    }
}
