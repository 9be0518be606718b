// Runtime configuration. All of it is an explicit value handed to the
// components at construction time; nothing here is process-global or
// mutated after startup.

use std::path::PathBuf;
use std::time::Duration;

// Zenoh topics
pub const TOPIC_ACTION: &str = "lekiwi/cmd/action"; // client -> host
pub const TOPIC_OBSERVATION: &str = "lekiwi/rt/observation"; // host -> client
pub const TOPIC_HEALTH: &str = "lekiwi/state/health"; // host status

pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_CONTROL_LOOP_FPS: u32 = 30;

/// Per-attempt timeout while probing candidate ports during detection.
pub const DETECTION_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct RobotConfig {
    /// Motors split across two controller boards (arm + base) instead of
    /// sharing one.
    pub dual_board: bool,
    /// Explicit primary port. With `secondary_port` also set in dual-board
    /// mode, port detection is bypassed entirely.
    pub primary_port: Option<String>,
    pub secondary_port: Option<String>,
    /// Candidate ports probed when dual-board ports are not explicit.
    pub candidate_ports: Vec<String>,
    /// Base force-stops if no action arrives within this window.
    pub watchdog_timeout: Duration,
    pub control_loop_fps: u32,
    /// Stop the host loop after this long; `None` runs until shutdown.
    pub session_duration: Option<Duration>,
    /// Calibration records; `None` uses nominal full-range records.
    pub calibration_path: Option<PathBuf>,
    /// Run against in-memory echo buses instead of hardware.
    pub simulate: bool,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            dual_board: false,
            primary_port: None,
            secondary_port: None,
            candidate_ports: Vec::new(),
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            control_loop_fps: DEFAULT_CONTROL_LOOP_FPS,
            session_duration: None,
            calibration_path: None,
            simulate: false,
        }
    }
}

impl RobotConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.control_loop_fps.max(1) as f64)
    }
}
