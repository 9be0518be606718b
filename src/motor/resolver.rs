// Port auto-detection for dual-board robots.
//
// USB enumeration order is not stable, so the two controller boards can
// swap device paths across reboots. Identity is established by probing:
// the board that answers a ping for the discriminating motor (an arm
// servo) is the primary board; the remaining candidate is the secondary
// board by elimination. Explicit configuration bypasses detection.

use tracing::{debug, info};

use super::bus::BusOpener;
use super::routing::MotorId;
use super::MotorError;

/// Outcome of board detection: which port hosts which group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortResolution {
    pub primary: String,
    pub secondary: String,
}

/// Probe `candidates` (exactly two) and decide which hosts the primary
/// group.
///
/// Each candidate is opened transiently, pinged once for
/// `discriminating_id`, and dropped again before this function returns
/// on every path, so the caller can reopen persistent handles cleanly.
///
/// Fails with [`MotorError::DetectionFailed`] when fewer than two
/// candidates are usable, or when zero or both of them answer the
/// discriminating ping (absent or ambiguous).
pub fn resolve_ports(
    opener: &dyn BusOpener,
    candidates: &[String],
    discriminating_id: MotorId,
) -> Result<PortResolution, MotorError> {
    if candidates.len() != 2 {
        return Err(MotorError::DetectionFailed(format!(
            "need exactly 2 candidate ports, got {}",
            candidates.len()
        )));
    }

    let mut responders: Vec<usize> = Vec::new();
    let mut usable = 0usize;

    for (idx, port) in candidates.iter().enumerate() {
        // Transient handle, dropped at the end of this iteration.
        match opener.open(port) {
            Ok(mut bus) => {
                usable += 1;
                match bus.ping(discriminating_id) {
                    Ok(true) => {
                        debug!("motor {} answered on {}", discriminating_id, port);
                        responders.push(idx);
                    }
                    Ok(false) => {
                        debug!("no answer for motor {} on {}", discriminating_id, port);
                    }
                    Err(e) => {
                        debug!("probe failed on {}: {}", port, e);
                    }
                }
            }
            Err(e) => {
                debug!("cannot open candidate {}: {}", port, e);
            }
        }
    }

    if usable < 2 {
        return Err(MotorError::DetectionFailed(format!(
            "only {usable} of {} candidate ports could be opened",
            candidates.len()
        )));
    }

    match responders.as_slice() {
        [primary_idx] => {
            let secondary_idx = 1 - primary_idx;
            let resolution = PortResolution {
                primary: candidates[*primary_idx].clone(),
                secondary: candidates[secondary_idx].clone(),
            };
            info!(
                "resolved boards: primary={} secondary={}",
                resolution.primary, resolution.secondary
            );
            Ok(resolution)
        }
        [] => Err(MotorError::DetectionFailed(format!(
            "motor {discriminating_id} answered on neither candidate port"
        ))),
        _ => Err(MotorError::DetectionFailed(format!(
            "motor {discriminating_id} answered on more than one port; \
             duplicate ids or crossed wiring"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::bus::EchoOpener;
    use crate::motor::routing::DISCRIMINATING_ID;

    const ARM_IDS: [MotorId; 6] = [1, 2, 3, 4, 5, 6];
    const BASE_IDS: [MotorId; 3] = [7, 8, 9];

    fn ports(a: &str, b: &str) -> Vec<String> {
        vec![a.to_string(), b.to_string()]
    }

    #[test]
    fn assigns_primary_to_responder_regardless_of_order() {
        for (first, second) in [("/dev/ttyACM0", "/dev/ttyACM1"), ("/dev/ttyACM1", "/dev/ttyACM0")] {
            let opener = EchoOpener::new()
                .with_port("/dev/ttyACM0", &ARM_IDS)
                .with_port("/dev/ttyACM1", &BASE_IDS);

            let res = resolve_ports(&opener, &ports(first, second), DISCRIMINATING_ID).unwrap();
            assert_eq!(res.primary, "/dev/ttyACM0");
            assert_eq!(res.secondary, "/dev/ttyACM1");
        }
    }

    #[test]
    fn fails_when_no_candidate_responds() {
        let opener = EchoOpener::new()
            .with_port("a", &BASE_IDS)
            .with_port("b", &BASE_IDS);
        let err = resolve_ports(&opener, &ports("a", "b"), DISCRIMINATING_ID).unwrap_err();
        assert!(matches!(err, MotorError::DetectionFailed(_)));
    }

    #[test]
    fn fails_when_both_candidates_respond() {
        let opener = EchoOpener::new()
            .with_port("a", &ARM_IDS)
            .with_port("b", &ARM_IDS);
        let err = resolve_ports(&opener, &ports("a", "b"), DISCRIMINATING_ID).unwrap_err();
        assert!(matches!(err, MotorError::DetectionFailed(_)));
    }

    #[test]
    fn fails_when_a_candidate_cannot_be_opened() {
        let opener = EchoOpener::new()
            .with_port("a", &ARM_IDS)
            .with_unreachable("b");
        let err = resolve_ports(&opener, &ports("a", "b"), DISCRIMINATING_ID).unwrap_err();
        assert!(matches!(err, MotorError::DetectionFailed(_)));
    }

    #[test]
    fn fails_with_wrong_candidate_count() {
        let opener = EchoOpener::new();
        let err = resolve_ports(&opener, &ports("a", "b")[..1].to_vec(), 1).unwrap_err();
        assert!(matches!(err, MotorError::DetectionFailed(_)));
    }
}
