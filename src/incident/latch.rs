//! Sticky perception flags.
//!
//! Perception output flickers frame to frame. While an incident is open a
//! positive observation is held until the incident is cancelled; while idle
//! the flags follow the raw observation.

use super::events::Detection;
use super::state::IncidentRecord;

/// Fold one observation into the record. Returns true if any flag changed.
pub fn apply(record: &mut IncidentRecord, observed: Detection) -> bool {
    let before = (record.person_present, record.person_fallen_by_pose);

    if record.status.is_open() {
        record.person_present |= observed.person_detected;
        record.person_fallen_by_pose |= observed.person_fallen_by_pose;
    } else {
        record.person_present = observed.person_detected;
        record.person_fallen_by_pose = observed.person_fallen_by_pose;
    }
    record.person_moving = false;

    before != (record.person_present, record.person_fallen_by_pose)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::state::Status;

    fn det(present: bool, fallen: bool) -> Detection {
        Detection { person_detected: present, person_fallen_by_pose: fallen }
    }

    #[test]
    fn test_idle_mirrors_observation() {
        let mut rec = IncidentRecord::new();
        apply(&mut rec, det(true, true));
        assert!(rec.person_present && rec.person_fallen_by_pose);
        apply(&mut rec, det(false, false));
        assert!(!rec.person_present && !rec.person_fallen_by_pose);
    }

    #[test]
    fn test_open_incident_holds_positive() {
        for status in [Status::Alert, Status::Emergency] {
            let mut rec = IncidentRecord { status, ..Default::default() };
            assert!(apply(&mut rec, det(true, false)));
            assert!(apply(&mut rec, det(false, true)));
            assert!(!apply(&mut rec, det(false, false)));
            assert!(rec.person_present);
            assert!(rec.person_fallen_by_pose);
        }
    }

    #[test]
    fn test_fallen_flag_never_decreases_while_open() {
        let mut rec = IncidentRecord { status: Status::Alert, ..Default::default() };
        let pattern = [false, true, false, false, true, false];
        let mut seen_true = false;
        for fallen in pattern {
            apply(&mut rec, det(fallen, fallen));
            seen_true |= fallen;
            assert_eq!(rec.person_fallen_by_pose, seen_true);
        }
    }

    #[test]
    fn test_moving_stays_false() {
        let mut rec = IncidentRecord { person_moving: true, ..Default::default() };
        apply(&mut rec, det(true, false));
        assert!(!rec.person_moving);
    }
}
