use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lekiwi_host_runtime::config::{RobotConfig, DETECTION_PROBE_TIMEOUT};
use lekiwi_host_runtime::host::RobotHost;
use lekiwi_host_runtime::motor::routing::{DISCRIMINATING_ID, MotorGroup};
use lekiwi_host_runtime::motor::{
    lekiwi_motors, resolve_ports, BusOpener, EchoOpener, FeetechOpener, MotorBusManager,
};

/// LeKiwi host runtime: bus routing, watchdog, and the zenoh control loop.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Motors split across two controller boards (arm + base).
    #[arg(long)]
    dual_board: bool,

    /// Serial port of the primary (arm) board. In dual-board mode,
    /// supplying both ports skips auto-detection entirely.
    #[arg(long)]
    primary_port: Option<String>,

    /// Serial port of the secondary (base) board.
    #[arg(long)]
    secondary_port: Option<String>,

    /// Candidate port for auto-detection; pass twice in dual-board mode.
    #[arg(long = "candidate", value_name = "PORT")]
    candidates: Vec<String>,

    /// Watchdog timeout in milliseconds.
    #[arg(long, default_value_t = 500)]
    watchdog_ms: u64,

    /// Control loop rate.
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Stop after this many seconds instead of running until Ctrl-C.
    #[arg(long)]
    session_secs: Option<u64>,

    /// Calibration records (JSON). Omit for nominal full-range records.
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Run the homing sequence on all buses right after connecting.
    #[arg(long)]
    calibrate: bool,

    /// Use in-memory echo buses instead of serial hardware.
    #[arg(long)]
    simulate: bool,
}

impl Cli {
    fn into_config(self) -> RobotConfig {
        RobotConfig {
            dual_board: self.dual_board,
            primary_port: self.primary_port,
            secondary_port: self.secondary_port,
            candidate_ports: self.candidates,
            watchdog_timeout: Duration::from_millis(self.watchdog_ms),
            control_loop_fps: self.fps,
            session_duration: self.session_secs.map(Duration::from_secs),
            calibration_path: self.calibration,
            simulate: self.simulate,
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn build_manager(config: &RobotConfig) -> Result<MotorBusManager, BoxError> {
    let motors = lekiwi_motors();

    let opener: Box<dyn BusOpener> = if config.simulate {
        let arm_ids: Vec<u8> = motors
            .iter()
            .filter(|m| m.group == MotorGroup::Arm)
            .map(|m| m.id)
            .collect();
        let base_ids: Vec<u8> = motors
            .iter()
            .filter(|m| m.group == MotorGroup::Base)
            .map(|m| m.id)
            .collect();
        let all_ids: Vec<u8> = motors.iter().map(|m| m.id).collect();
        if config.dual_board {
            Box::new(
                EchoOpener::new()
                    .with_port("sim-primary", &arm_ids)
                    .with_port("sim-secondary", &base_ids),
            )
        } else {
            Box::new(EchoOpener::new().with_port("sim-primary", &all_ids))
        }
    } else {
        Box::new(FeetechOpener::default())
    };

    if !config.dual_board {
        let port = config
            .primary_port
            .clone()
            .or_else(|| config.candidate_ports.first().cloned())
            .or_else(|| config.simulate.then(|| "sim-primary".to_string()))
            .ok_or("single-board mode needs --primary-port")?;
        return Ok(MotorBusManager::single_board(
            opener,
            motors,
            port,
            config.calibration_path.clone(),
        ));
    }

    // Dual-board: explicit ports win over detection.
    let (primary, secondary) = match (&config.primary_port, &config.secondary_port) {
        (Some(p), Some(s)) => (p.clone(), s.clone()),
        _ if config.simulate => ("sim-primary".to_string(), "sim-secondary".to_string()),
        _ => {
            info!("probing candidate ports: {:?}", config.candidate_ports);
            let probe_opener = FeetechOpener::new(
                lekiwi_host_runtime::motor::feetech::DEFAULT_BAUDRATE,
                DETECTION_PROBE_TIMEOUT,
            );
            let resolution =
                resolve_ports(&probe_opener, &config.candidate_ports, DISCRIMINATING_ID)?;
            (resolution.primary, resolution.secondary)
        }
    };

    Ok(MotorBusManager::dual_board(
        opener,
        motors,
        primary,
        secondary,
        config.calibration_path.clone(),
    ))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let cli = Cli::parse();
    let run_homing = cli.calibrate;
    let config = cli.into_config();

    let result = async {
        let mut manager = build_manager(&config)?;
        manager.connect()?;
        if run_homing {
            manager.calibrate(None)?;
        }
        RobotHost::new(config, manager).run().await
    }
    .await;

    if let Err(e) = result {
        eprintln!("Runtime error: {e}");
        std::process::exit(1);
    }
}
