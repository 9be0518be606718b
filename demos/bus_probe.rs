// Bus probe: read-only serial diagnostic.
//
// Pings every known motor id on each given port and, when two ports are
// supplied, dry-runs the board detection so you can see which port would
// be picked as primary before starting the host.
//
// Usage: cargo run --example bus_probe -- /dev/ttyACM0 [/dev/ttyACM1]

use lekiwi_host_runtime::config::DETECTION_PROBE_TIMEOUT;
use lekiwi_host_runtime::motor::bus::MotorBus;
use lekiwi_host_runtime::motor::routing::DISCRIMINATING_ID;
use lekiwi_host_runtime::motor::{
    feetech::DEFAULT_BAUDRATE, lekiwi_motors, resolve_ports, FeetechBus, FeetechOpener,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let ports: Vec<String> = std::env::args().skip(1).collect();
    if ports.is_empty() {
        eprintln!("usage: bus_probe <port> [<port>]");
        std::process::exit(2);
    }

    for port in &ports {
        println!("== {port}");
        let mut bus = match FeetechBus::open(port) {
            Ok(bus) => bus,
            Err(e) => {
                println!("  cannot open: {e}");
                continue;
            }
        };
        for motor in lekiwi_motors() {
            match bus.ping(motor.id) {
                Ok(true) => {
                    let pos = bus
                        .read_position(motor.id)
                        .map(|p| p.to_string())
                        .unwrap_or_else(|e| format!("read failed: {e}"));
                    println!("  [{}] {:<18} OK  position={}", motor.id, motor.name, pos);
                }
                Ok(false) => println!("  [{}] {:<18} no answer", motor.id, motor.name),
                Err(e) => println!("  [{}] {:<18} error: {}", motor.id, motor.name, e),
            }
        }
    }

    if ports.len() == 2 {
        println!("== detection dry run (discriminating id {DISCRIMINATING_ID})");
        let opener = FeetechOpener::new(DEFAULT_BAUDRATE, DETECTION_PROBE_TIMEOUT);
        match resolve_ports(&opener, &ports, DISCRIMINATING_ID) {
            Ok(res) => {
                println!("  primary   (arm):  {}", res.primary);
                println!("  secondary (base): {}", res.secondary);
            }
            Err(e) => println!("  detection failed: {e}"),
        }
    }

    Ok(())
}
