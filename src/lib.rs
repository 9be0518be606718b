// LeKiwi host runtime: motor-bus routing, safety watchdog, and the
// zenoh-facing control loop for a mobile manipulator whose motors are
// spread over one or two Feetech controller boards.

pub mod client;
pub mod config;
pub mod host;
pub mod messages;
pub mod motor;
pub mod watchdog;
