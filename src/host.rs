// Robot-side control loop.
//
// Fixed-period tick, strictly ordered: drain newest action -> forward
// motor targets -> watchdog check (forced base stop on trip) -> read
// observation -> publish. The ordering is a correctness requirement: the
// watchdog decision must see this tick's command state before the
// observation read reflects it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{RobotConfig, TOPIC_ACTION, TOPIC_HEALTH, TOPIC_OBSERVATION};
use crate::messages::{ActionPayload, HostHealth, Observation};
use crate::motor::kinematics::{body_to_wheel_counts, wheel_counts_to_body, WHEEL_IDS};
use crate::motor::routing::{MotorGroup, MotorId};
use crate::motor::{ConnectionState, MotorBusManager};
use crate::watchdog::{CommandWatchdog, WatchdogState};

pub struct RobotHost {
    config: RobotConfig,
    manager: MotorBusManager,
    watchdog: CommandWatchdog,
}

impl RobotHost {
    pub fn new(config: RobotConfig, manager: MotorBusManager) -> Self {
        let watchdog = CommandWatchdog::new(config.watchdog_timeout);
        Self { config, manager, watchdog }
    }

    /// Flatten an action into per-motor targets: named arm joints to their
    /// ids, the body velocity through the inverse kinematics to the three
    /// wheels.
    fn targets_for(&self, action: &ActionPayload) -> Vec<(MotorId, f32)> {
        let mut targets = Vec::new();
        for (name, value) in &action.arm {
            if let Some(motor) = self
                .manager
                .motors()
                .iter()
                .find(|m| m.group == MotorGroup::Arm && m.name == name)
            {
                targets.push((motor.id, *value));
            }
        }
        if let Some(body) = action.base {
            let counts = body_to_wheel_counts(body);
            for (id, c) in WHEEL_IDS.iter().zip(counts) {
                targets.push((*id, c as f32));
            }
        }
        targets
    }

    /// One control tick minus the network edges; `run` wraps this with the
    /// zenoh drain/publish. Returns what should be published.
    pub fn step(
        &mut self,
        incoming: Option<ActionPayload>,
        now: Instant,
    ) -> (Observation, HostHealth) {
        // (2) forward this tick's command, if any, before the watchdog
        // decision so it is judged on up-to-date command state.
        if let Some(action) = incoming {
            self.watchdog.notify_command_received(now);
            let targets = self.targets_for(&action);
            if !targets.is_empty() {
                match self.manager.write_targets(&targets) {
                    Ok(outcome) if !outcome.is_complete() => {
                        debug!("{} bus write failure(s) this tick", outcome.failures.len());
                    }
                    Ok(_) => {}
                    Err(e) => warn!("write rejected: {}", e),
                }
            }
        }

        // (3) forced stop is edge-triggered: one zero-velocity write per
        // trip, overriding any base command processed above. The arm keeps
        // its last goal (hold by omission).
        if self.watchdog.check(now) {
            warn!(
                "no command for over {:?}, stopping base",
                self.config.watchdog_timeout
            );
            match self.manager.stop_base() {
                Ok(outcome) if !outcome.is_complete() => {
                    warn!("forced stop incomplete: {} failure(s)", outcome.failures.len());
                }
                Ok(_) => {}
                Err(e) => warn!("forced stop rejected: {}", e),
            }
        }

        // (4) observation for every known motor; a bus that errors leaves
        // its motors out of this tick's payload.
        let observation = self.observe();
        (observation, self.health())
    }

    fn observe(&mut self) -> Observation {
        let ids = self.manager.motor_ids();
        let mut observation = Observation::default();
        match self.manager.read_positions(&ids) {
            Ok(readout) => {
                for (id, value) in &readout.values {
                    let Some(motor) = self.manager.motors().iter().find(|m| m.id == *id) else {
                        continue;
                    };
                    let key = match motor.group {
                        MotorGroup::Arm => format!("{}.pos", motor.name),
                        MotorGroup::Base => format!("{}.vel", motor.name),
                    };
                    observation.motors.insert(key, *value as f64);
                }
                // Body-frame estimate through the forward kinematics, in
                // the same frame and units as the inbound command. Skipped
                // when any wheel is missing from this tick's readout.
                let counts: Vec<i16> = WHEEL_IDS
                    .iter()
                    .filter_map(|id| readout.get(*id).map(|v| v as i16))
                    .collect();
                if let Ok(counts) = <[i16; 3]>::try_from(counts) {
                    let body = wheel_counts_to_body(counts);
                    observation.motors.insert("x.vel".into(), body.x as f64);
                    observation.motors.insert("y.vel".into(), body.y as f64);
                    observation.motors.insert("theta.vel".into(), body.theta as f64);
                }
            }
            Err(e) => warn!("observation read rejected: {}", e),
        }
        observation
    }

    fn health(&self) -> HostHealth {
        if self.watchdog.state() == WatchdogState::Tripped {
            HostHealth::CmdStale
        } else if self.manager.state() == ConnectionState::Degraded {
            HostHealth::BusDegraded
        } else {
            HostHealth::Ok
        }
    }

    /// Run until shutdown (Ctrl-C) or the configured session duration
    /// elapses. Always disconnects the buses on the way out; the tick in
    /// flight finishes first so no board is left mid-write.
    pub async fn run(mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.manager.connect()?;

        info!("opening zenoh session...");
        let session = zenoh::open(zenoh::Config::default()).await?;
        let subscriber = session.declare_subscriber(TOPIC_ACTION).await?;
        let pub_observation = session.declare_publisher(TOPIC_OBSERVATION).await?;
        let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

        let shutdown = Arc::new(AtomicBool::new(false));
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    shutdown.store(true, Ordering::SeqCst);
                }
            });
        }

        let deadline = self.config.session_duration.map(|d| Instant::now() + d);
        let mut tick = interval(self.config.tick_period());
        // A slow tick runs the next one immediately; no backlog builds up.
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "host loop started: {} fps, {:?} watchdog",
            self.config.control_loop_fps, self.config.watchdog_timeout
        );

        loop {
            tick.tick().await;

            // Shutdown is only honored between ticks (graceful drain).
            if shutdown.load(Ordering::SeqCst) {
                info!("shutdown requested");
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                info!("session duration elapsed");
                break;
            }

            // (1) keep only the newest queued action: staleness is worse
            // than loss.
            let mut newest = None;
            while let Ok(Some(sample)) = subscriber.try_recv() {
                newest = Some(sample);
            }
            let incoming = newest.and_then(|sample| {
                let payload = sample.payload().to_bytes();
                match ActionPayload::from_wire(&payload, self.manager.motors()) {
                    Ok(action) => Some(action),
                    Err(e) => {
                        warn!("unparseable action payload: {}", e);
                        None
                    }
                }
            });

            let (observation, health) = self.step(incoming, Instant::now());

            // (5) publish; a publish error is logged, the loop keeps
            // ticking so the watchdog stays in charge of the base.
            match serde_json::to_string(&observation) {
                Ok(json) => {
                    if let Err(e) = pub_observation.put(json).await {
                        warn!("observation publish failed: {}", e);
                    }
                }
                Err(e) => warn!("observation encode failed: {}", e),
            }
            if let Ok(json) = serde_json::to_string(&health) {
                if let Err(e) = pub_health.put(json).await {
                    warn!("health publish failed: {}", e);
                }
            }
        }

        self.manager.disconnect();
        info!("host loop stopped, buses disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::bus::{BusOpener, EchoOpener, MotorBus};
    use crate::motor::kinematics::BodyVelocity;
    use crate::motor::routing::lekiwi_motors;
    use crate::motor::FeetechError;
    use std::time::Duration;

    const PORT: &str = "sim0";

    struct SharedOpener(Arc<EchoOpener>);

    impl BusOpener for SharedOpener {
        fn open(&self, port: &str) -> Result<Box<dyn MotorBus>, FeetechError> {
            self.0.open(port)
        }
    }

    fn host() -> (RobotHost, Arc<EchoOpener>) {
        let all_ids: Vec<MotorId> = lekiwi_motors().iter().map(|m| m.id).collect();
        let opener = Arc::new(EchoOpener::new().with_port(PORT, &all_ids));
        let mut manager = MotorBusManager::single_board(
            Box::new(SharedOpener(opener.clone())),
            lekiwi_motors(),
            PORT.to_string(),
            None,
        );
        manager.connect().unwrap();
        (RobotHost::new(RobotConfig::default(), manager), opener)
    }

    fn action(arm: &[(&str, f32)], base: Option<BodyVelocity>) -> ActionPayload {
        let mut a = ActionPayload::default();
        for (name, v) in arm {
            a.arm.insert(name.to_string(), *v);
        }
        a.base = base;
        a
    }

    #[test]
    fn step_writes_action_and_reads_it_back() {
        let (mut host, _opener) = host();
        let now = Instant::now();

        let cmd = action(
            &[("arm_shoulder_pan", 0.5)],
            Some(BodyVelocity { x: 0.1, y: 0.0, theta: 0.0 }),
        );
        let (obs, health) = host.step(Some(cmd), now);

        assert_eq!(health, HostHealth::Ok);
        let pan = obs.get("arm_shoulder_pan.pos").unwrap();
        assert!((pan - 0.5).abs() < 2e-3, "got {pan}");
        // Forward motion spins the side wheels.
        assert!(obs.get("base_left_wheel.vel").unwrap().abs() > 0.0);
        assert!(obs.get("base_right_wheel.vel").unwrap().abs() > 0.0);
    }

    #[test]
    fn watchdog_trip_stops_base_but_holds_arm() {
        let (mut host, opener) = host();
        let start = Instant::now();

        let cmd = action(
            &[("arm_elbow_flex", -0.4)],
            Some(BodyVelocity { x: 0.2, y: 0.0, theta: 0.0 }),
        );
        host.step(Some(cmd), start);
        let bus = opener.bus(PORT).unwrap();
        assert_ne!(bus.velocity(7), Some(0));

        // 600 ms of silence: past the 500 ms default timeout.
        let (obs, health) = host.step(None, start + Duration::from_millis(600));
        assert_eq!(health, HostHealth::CmdStale);
        for id in [7, 8, 9] {
            assert_eq!(bus.velocity(id), Some(0), "wheel {id} not stopped");
        }
        // Arm target untouched: hold by omission.
        let elbow = obs.get("arm_elbow_flex.pos").unwrap();
        assert!((elbow - -0.4).abs() < 2e-3, "got {elbow}");
    }

    #[test]
    fn fresh_command_after_trip_resumes_silently() {
        let (mut host, _opener) = host();
        let start = Instant::now();

        host.step(None, start + Duration::from_millis(600));
        assert_eq!(host.health(), HostHealth::CmdStale);

        let cmd = action(&[], Some(BodyVelocity { x: 0.05, y: 0.0, theta: 0.0 }));
        let (_, health) = host.step(Some(cmd), start + Duration::from_millis(700));
        assert_eq!(health, HostHealth::Ok);
    }

    #[test]
    fn forced_stop_write_goes_out_once_per_trip() {
        let (mut host, opener) = host();
        let start = Instant::now();
        host.step(None, start + Duration::from_millis(600));

        let bus = opener.bus(PORT).unwrap();
        // Poke a wheel behind the host's back; further stalled ticks must
        // not re-issue the stop (edge-triggered, not level-triggered).
        bus.set_fault(false);
        bus_write(&bus, 7, 123);
        host.step(None, start + Duration::from_millis(700));
        host.step(None, start + Duration::from_millis(800));
        assert_eq!(bus.velocity(7), Some(123));
    }

    fn bus_write(bus: &crate::motor::bus::EchoBus, id: MotorId, counts: i16) {
        let mut b = bus.clone();
        b.write_velocities(&[(id, counts)]).unwrap();
    }

    #[test]
    fn observation_reports_body_frame_velocity() {
        let (mut host, _opener) = host();
        let body = BodyVelocity { x: 0.1, y: 0.0, theta: 0.0 };

        let (obs, _) = host.step(Some(action(&[], Some(body))), Instant::now());
        // Forward then inverse kinematics, so expect quantization error
        // of a tick or two per wheel.
        assert!((obs.get("x.vel").unwrap() - 0.1).abs() < 0.01);
        assert!(obs.get("y.vel").unwrap().abs() < 0.01);
        assert!(obs.get("theta.vel").unwrap().abs() < 2.0);
    }

    #[test]
    fn observation_tracks_positions_moved_outside_the_host() {
        let (mut host, opener) = host();
        let bus = opener.bus(PORT).unwrap();
        // Joint moved by hand (or by gravity): the next tick must see it.
        bus.set_position(1, 2148);

        let (obs, _) = host.step(None, Instant::now());
        let pan = obs.get("arm_shoulder_pan.pos").unwrap();
        // nominal record: center 2047.5, one tick = TAU/4096 rad
        assert!((pan - 0.1542).abs() < 2e-3, "got {pan}");
    }

    #[test]
    fn observation_covers_every_known_motor() {
        let (mut host, _opener) = host();
        let (obs, _) = host.step(None, Instant::now());
        for motor in lekiwi_motors() {
            let key = match motor.group {
                MotorGroup::Arm => format!("{}.pos", motor.name),
                MotorGroup::Base => format!("{}.vel", motor.name),
            };
            assert!(obs.get(&key).is_some(), "missing {key}");
        }
    }
}
