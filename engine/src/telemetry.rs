//! Host resource usage for pre-deployment checks

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};

/// Host resource usage snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Disk usage in bytes
    pub disk_used: u64,

    /// Total disk space in bytes
    pub disk_total: u64,

    /// Disk usage percentage
    pub disk_percent: f32,

    /// Memory usage in bytes
    pub memory_used: u64,

    /// Total memory in bytes
    pub memory_total: u64,

    /// Memory usage percentage
    pub memory_percent: f32,
}

/// Source of host resource usage
pub trait ResourceProbe: Send + Sync {
    fn usage(&self) -> ResourceUsage;
}

/// Resource probe backed by `sysinfo`
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoProbe;

impl ResourceProbe for SysinfoProbe {
    fn usage(&self) -> ResourceUsage {
        let mut sys = System::new();
        sys.refresh_memory();

        let disks = Disks::new_with_refreshed_list();

        let (disk_used, disk_total) = disks.iter().fold((0u64, 0u64), |(used, total), disk| {
            (
                used + (disk.total_space() - disk.available_space()),
                total + disk.total_space(),
            )
        });

        let memory_used = sys.used_memory();
        let memory_total = sys.total_memory();

        ResourceUsage {
            disk_used,
            disk_total,
            disk_percent: percent(disk_used, disk_total),
            memory_used,
            memory_total,
            memory_percent: percent(memory_used, memory_total),
        }
    }
}

fn percent(used: u64, total: u64) -> f32 {
    if total > 0 {
        (used as f32 / total as f32) * 100.0
    } else {
        0.0
    }
}
