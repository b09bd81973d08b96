use reverb_common::protocol::StatsSnapshot;

/// Weights for the load penalty function. Operational tuning, not
/// structure: any non-negative weights keep the score monotonic in every
/// input, which is the only property selection relies on.
#[derive(Debug, Clone)]
pub struct PenaltyWeights {
    /// Points per actively playing player.
    pub playing_player: f64,
    /// Multiplier on the exponential CPU term.
    pub cpu: f64,
    /// Points at full memory pressure (used == allocated).
    pub memory: f64,
    /// Multiplier on the frame-deficit term.
    pub frame_deficit: f64,
    /// Multiplier on the nulled-frame term. Nulled frames are weighted
    /// heavier than deficit by default: the node already gave up on them.
    pub frame_nulled: f64,
}

impl Default for PenaltyWeights {
    fn default() -> Self {
        Self {
            playing_player: 1.0,
            cpu: 1.0,
            memory: 20.0,
            frame_deficit: 1.0,
            frame_nulled: 2.0,
        }
    }
}

/// Expected frames per reporting window; frame terms are normalized
/// against this before the exponential.
const EXPECTED_FRAMES_PER_WINDOW: f64 = 3000.0;

impl PenaltyWeights {
    /// Penalty score for one stats snapshot. Lower is better. Monotonic in
    /// playing players, system load, memory pressure, deficit frames and
    /// nulled frames.
    ///
    /// The CPU and frame terms grow exponentially so that a node showing
    /// frame loss is avoided long before raw player counts would tip the
    /// balance.
    pub fn score(&self, stats: &StatsSnapshot) -> u32 {
        let player_penalty = stats.playing_players as f64 * self.playing_player;

        let cpu_penalty = (1.05f64.powf(100.0 * stats.cpu.system_load) * 10.0 - 10.0) * self.cpu;

        let memory_penalty = stats.memory_pressure() * self.memory;

        let frame_penalty = match &stats.frames {
            Some(frames) => {
                let deficit = frames.deficit as f64 / EXPECTED_FRAMES_PER_WINDOW;
                let nulled = frames.nulled as f64 / EXPECTED_FRAMES_PER_WINDOW;
                let deficit_penalty =
                    (1.03f64.powf(500.0 * deficit) * 600.0 - 600.0) * self.frame_deficit;
                let nulled_penalty =
                    (1.03f64.powf(500.0 * nulled) * 600.0 - 600.0) * self.frame_nulled;
                deficit_penalty + nulled_penalty
            }
            None => 0.0,
        };

        let total = player_penalty + cpu_penalty + memory_penalty + frame_penalty;
        if total < 0.0 {
            0
        } else if total >= u32::MAX as f64 {
            u32::MAX
        } else {
            total as u32
        }
    }
}
