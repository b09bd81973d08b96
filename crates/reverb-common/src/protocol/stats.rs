use serde::{Deserialize, Serialize};

/// Periodic statistics pushed by a node over its message stream.
///
/// A snapshot always replaces the previous one wholesale; there is no
/// partial merge. Penalty scoring reads the latest snapshot at selection
/// time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Total players the node is tracking.
    pub players: u64,
    /// Players actively producing audio.
    pub playing_players: u64,
    pub uptime_ms: u64,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    /// Frame accounting over the last minute. Absent until the node has
    /// been up long enough to report a full window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames: Option<FrameStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub cores: u32,
    /// System-wide load in `[0.0, 1.0]`.
    pub system_load: f64,
    /// Load attributable to the node process in `[0.0, 1.0]`.
    pub node_load: f64,
}

/// Audio frame health over the reporting window. Deficit and nulled frames
/// indicate imminent audio quality failure even under otherwise-low load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    pub sent: u64,
    pub nulled: u64,
    pub deficit: u64,
}

impl StatsSnapshot {
    /// Ratio of used to allocated memory, in `[0.0, 1.0]`. Zero when the
    /// node has not reported an allocation yet.
    pub fn memory_pressure(&self) -> f64 {
        if self.memory.allocated == 0 {
            return 0.0;
        }
        self.memory.used as f64 / self.memory.allocated as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> StatsSnapshot {
        StatsSnapshot {
            players: 4,
            playing_players: 2,
            uptime_ms: 60_000,
            memory: MemoryStats {
                free: 256,
                used: 768,
                allocated: 1024,
                reservable: 2048,
            },
            cpu: CpuStats {
                cores: 8,
                system_load: 0.25,
                node_load: 0.1,
            },
            frames: None,
        }
    }

    #[test]
    fn memory_pressure_is_used_over_allocated() {
        assert_eq!(snapshot().memory_pressure(), 0.75);
    }

    #[test]
    fn memory_pressure_handles_zero_allocation() {
        let mut stats = snapshot();
        stats.memory.allocated = 0;
        assert_eq!(stats.memory_pressure(), 0.0);
    }

    #[test]
    fn deserializes_camel_case_payload() {
        let json = r#"{
            "players": 1,
            "playingPlayers": 1,
            "uptimeMs": 1000,
            "memory": {"free": 1, "used": 2, "allocated": 4, "reservable": 8},
            "cpu": {"cores": 4, "systemLoad": 0.5, "nodeLoad": 0.25},
            "frames": {"sent": 3000, "nulled": 10, "deficit": 5}
        }"#;

        let stats: StatsSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(stats.playing_players, 1);
        assert_eq!(stats.frames.unwrap().deficit, 5);
    }
}
