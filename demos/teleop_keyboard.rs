// Keyboard teleop: WASD move, Z/X rotate, O/P gripper, R/F speed, Q quit.
// Publishes the full action payload through RobotClient at ~50 Hz.
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::{Duration, Instant};
use tracing::info;

use lekiwi_host_runtime::client::RobotClient;
use lekiwi_host_runtime::messages::ActionPayload;
use lekiwi_host_runtime::motor::kinematics::BodyVelocity;

const SPEEDS: [f32; 3] = [0.05, 0.15, 0.3]; // m/s
const THETA_SPEEDS: [f32; 3] = [15.0, 45.0, 90.0]; // deg/s
const INPUT_TIMEOUT_MS: u64 = 100; // velocities decay to zero without input

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Connecting to robot over zenoh...");
    let client = RobotClient::connect().await?;

    info!("Controls: WASD=move, Z/X=rotate, O/P=gripper, R/F=speed, Q=quit");
    info!("Speed: LOW");

    enable_raw_mode()?;
    let result = run_teleop(client).await;
    disable_raw_mode()?;

    result
}

async fn run_teleop(client: RobotClient) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut speed_idx: usize = 0;
    let mut body = BodyVelocity::ZERO;
    let mut gripper: f32 = 0.0;
    let mut last_movement_input = Instant::now();

    loop {
        // Poll for key with 20ms timeout (~50Hz publish rate)
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;

                match code {
                    KeyCode::Char('w') if pressed => {
                        body.x = SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('s') if pressed => {
                        body.x = -SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('a') if pressed => {
                        body.y = SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('d') if pressed => {
                        body.y = -SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }

                    KeyCode::Char('z') if pressed => {
                        body.theta = THETA_SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('x') if pressed => {
                        body.theta = -THETA_SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }

                    // Gripper: open / close in the normalized [-1, 1] range
                    KeyCode::Char('o') if pressed => {
                        gripper = (gripper + 0.1).min(1.0);
                    }
                    KeyCode::Char('p') if pressed => {
                        gripper = (gripper - 0.1).max(-1.0);
                    }

                    KeyCode::Char('r') if pressed => {
                        speed_idx = (speed_idx + 1).min(2);
                        print_speed(speed_idx);
                    }
                    KeyCode::Char('f') if pressed => {
                        speed_idx = speed_idx.saturating_sub(1);
                        print_speed(speed_idx);
                    }

                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => {}
                }
            }
        }

        // Let go of the keys, let go of the base.
        if last_movement_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
            body = BodyVelocity::ZERO;
        }

        let mut action = ActionPayload::default();
        action.base = Some(body);
        action.arm.insert("arm_gripper".to_string(), gripper);
        client.send_action(&action).await?;
    }

    Ok(())
}

fn print_speed(idx: usize) {
    let label = ["LOW", "MED", "HIGH"][idx];
    info!("Speed: {}", label);
}
