//! System metrics for the heartbeat payload.

use serde_json::{json, Value};
use sysinfo::{Components, Disks, System};

#[derive(Debug, Clone, Default)]
pub struct SystemMetrics {
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub disk_pct: f64,
    pub temperature_c: Option<f64>,
    pub uptime_seconds: u64,
}

impl SystemMetrics {
    pub fn to_value(&self) -> Value {
        json!({
            "cpu_pct": self.cpu_pct,
            "memory_pct": self.memory_pct,
            "disk_pct": self.disk_pct,
            "temperature_c": self.temperature_c,
            "uptime_seconds": self.uptime_seconds,
        })
    }
}

pub struct MetricsCollector {
    system: System,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    pub fn collect(&mut self) -> SystemMetrics {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let cpu_pct = f64::from(self.system.global_cpu_usage());

        let total_memory = self.system.total_memory();
        let memory_pct = if total_memory > 0 {
            self.system.used_memory() as f64 / total_memory as f64 * 100.0
        } else {
            0.0
        };

        // Root filesystem usage.
        let disks = Disks::new_with_refreshed_list();
        let disk_pct = disks
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"))
            .or_else(|| disks.iter().next())
            .map(|d| {
                let total = d.total_space();
                if total > 0 {
                    (total - d.available_space()) as f64 / total as f64 * 100.0
                } else {
                    0.0
                }
            })
            .unwrap_or(0.0);

        // Highest component temperature, if the platform exposes any.
        let components = Components::new_with_refreshed_list();
        let temperature_c = components
            .iter()
            .map(|c| f64::from(c.temperature()))
            .fold(None, |acc: Option<f64>, t| {
                Some(acc.map_or(t, |a| a.max(t)))
            });

        SystemMetrics {
            cpu_pct,
            memory_pct,
            disk_pct,
            temperature_c,
            uptime_seconds: System::uptime(),
        }
    }
}
