//! System stats sampling for heartbeats.
//!
//! CPU, memory and load come from sysinfo; per-GPU active encode session
//! counts come from the worker's own job accounting, since the coordinator
//! treats the heartbeat-reported values as the source of truth either way.

use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::System;

use prismcast_core::control::StatsSource;
use prismcast_core::transcode::{GpuStats, SystemStats, WorkerCapabilities};

pub struct SysinfoStats {
    system: Mutex<System>,
    capabilities: WorkerCapabilities,
    /// Shared with the job accounting: active encode sessions per GPU id.
    gpu_sessions: Arc<Mutex<std::collections::HashMap<String, u32>>>,
}

impl SysinfoStats {
    #[must_use]
    pub fn new(
        capabilities: WorkerCapabilities,
        gpu_sessions: Arc<Mutex<std::collections::HashMap<String, u32>>>,
    ) -> Arc<Self> {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Arc::new(Self {
            system: Mutex::new(system),
            capabilities,
            gpu_sessions,
        })
    }
}

impl StatsSource for SysinfoStats {
    fn sample(&self) -> SystemStats {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_memory();

        let cpu_percent = system.global_cpu_info().cpu_usage();
        let load_average = System::load_average().one as f32;
        let sessions = self.gpu_sessions.lock();

        SystemStats {
            cpu_percent,
            memory_used_bytes: system.used_memory(),
            memory_total_bytes: system.total_memory(),
            load_average,
            gpus: self
                .capabilities
                .gpus
                .iter()
                .map(|gpu| GpuStats {
                    id: gpu.id.clone(),
                    // Utilization tracking needs a vendor API; encode
                    // session counts are what scheduling relies on.
                    utilization_percent: 0.0,
                    active_encode_sessions: sessions.get(&gpu.id).copied().unwrap_or(0),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_reports_memory_and_gpu_sessions() {
        let capabilities = WorkerCapabilities {
            gpus: vec![prismcast_core::transcode::GpuCapability {
                id: "gpu0".into(),
                name: "Test".into(),
                max_encode_sessions: 2,
            }],
            ..Default::default()
        };
        let sessions = Arc::new(Mutex::new(std::collections::HashMap::new()));
        sessions.lock().insert("gpu0".to_string(), 1);
        let stats = SysinfoStats::new(capabilities, sessions);
        let sample = stats.sample();
        assert!(sample.memory_total_bytes > 0);
        assert_eq!(sample.gpus.len(), 1);
        assert_eq!(sample.gpus[0].active_encode_sessions, 1);
    }
}
