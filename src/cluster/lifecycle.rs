//! Lifecycle state machine: legal transitions and per-operation guards.
//!
//! ```text
//! New ──> Deploying ──> Created ─────────┐
//!              │                         ├──> Terminating ──> Terminated
//!              └──────> CreationFailed ──┘          │
//!                                                   └──────> TerminationFailed
//! ```
//!
//! Failed states are dead ends: nothing is retried automatically, and the
//! only way forward is a delete (forced if necessary) and a fresh create.

use nimbus_common::{ClusterRecord, ClusterStatus};

use crate::errors::ClusterError;

use ClusterStatus::*;

/// Validate that a status transition is legal.
pub fn is_valid_transition(from: ClusterStatus, to: ClusterStatus) -> bool {
    matches!(
        (from, to),
        (New, Deploying)
            | (Deploying, Created)
            | (Deploying, CreationFailed)
            | (Created, Terminating)
            | (CreationFailed, Terminating)
            | (Terminating, Terminated)
            | (Terminating, TerminationFailed)
    )
}

/// Statuses a record may be deleted from without `force`.
pub fn is_deletable(status: ClusterStatus) -> bool {
    matches!(status, New | CreationFailed | Terminated | TerminationFailed)
}

/// Start is only legal from `New`.
pub fn check_start(status: ClusterStatus) -> Result<(), ClusterError> {
    match status {
        New => Ok(()),
        Created => Err(ClusterError::state_conflict(
            "start",
            status,
            "cluster is already created",
        )),
        Deploying | Terminating => Err(ClusterError::state_conflict(
            "start",
            status,
            "an operation is already in progress",
        )),
        CreationFailed | Terminated | TerminationFailed => Err(ClusterError::state_conflict(
            "start",
            status,
            "delete the record and create it again",
        )),
    }
}

/// Update waits until the cluster is neither moving nor running.
pub fn check_update(status: ClusterStatus) -> Result<(), ClusterError> {
    if status.is_in_transition() {
        return Err(ClusterError::state_conflict(
            "update",
            status,
            "wait until the operation in progress finishes",
        ));
    }
    if status.is_running() {
        return Err(ClusterError::state_conflict(
            "update",
            status,
            "cluster is running; terminate it first",
        ));
    }
    Ok(())
}

pub fn check_terminate(status: ClusterStatus) -> Result<(), ClusterError> {
    match status {
        Created | CreationFailed => Ok(()),
        New => Err(ClusterError::state_conflict(
            "terminate",
            status,
            "cannot terminate a new cluster",
        )),
        Terminated => Err(ClusterError::state_conflict(
            "terminate",
            status,
            "cluster is already terminated",
        )),
        Deploying | Terminating => Err(ClusterError::state_conflict(
            "terminate",
            status,
            "an operation is already in progress",
        )),
        TerminationFailed => Err(ClusterError::state_conflict(
            "terminate",
            status,
            "termination already failed; force-delete the record",
        )),
    }
}

pub fn check_delete(status: ClusterStatus, force: bool) -> Result<(), ClusterError> {
    if force || is_deletable(status) {
        return Ok(());
    }
    let reason = if status.is_running() {
        "cluster is running; terminate it first"
    } else {
        "an operation is in progress; pass force to override"
    };
    Err(ClusterError::state_conflict("delete", status, reason))
}

/// Next version of `record` in status `to`, or a state conflict if the
/// transition is illegal. Moving into a non-failed state clears the
/// recorded failure reason.
pub fn transition(
    record: &ClusterRecord,
    to: ClusterStatus,
    failure_reason: Option<String>,
) -> Result<ClusterRecord, ClusterError> {
    if !is_valid_transition(record.status, to) {
        return Err(ClusterError::state_conflict(
            "transition",
            record.status,
            format!("{} -> {} is not a legal transition", record.status, to),
        ));
    }
    let reason = if to.is_failed() { failure_reason } else { None };
    Ok(record.with_status(to, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_common::{CloudKind, ClusterKey, NewCluster};

    fn record(status: ClusterStatus) -> ClusterRecord {
        ClusterRecord::new(
            ClusterKey::new("p1", "t1"),
            CloudKind::Aws,
            NewCluster {
                name: "c1".into(),
                ..Default::default()
            },
        )
        .with_status(status, None)
    }

    #[test]
    fn test_valid_transitions() {
        assert!(is_valid_transition(New, Deploying));
        assert!(is_valid_transition(Deploying, Created));
        assert!(is_valid_transition(Deploying, CreationFailed));
        assert!(is_valid_transition(Created, Terminating));
        assert!(is_valid_transition(CreationFailed, Terminating));
        assert!(is_valid_transition(Terminating, Terminated));
        assert!(is_valid_transition(Terminating, TerminationFailed));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!is_valid_transition(New, Created));
        assert!(!is_valid_transition(New, Terminating));
        assert!(!is_valid_transition(Created, Deploying));
        assert!(!is_valid_transition(Terminated, Deploying));
        assert!(!is_valid_transition(TerminationFailed, Terminating));
        assert!(!is_valid_transition(Deploying, Terminating));
        for status in ClusterStatus::ALL {
            assert!(!is_valid_transition(status, status));
        }
    }

    #[test]
    fn test_start_guard() {
        assert!(check_start(New).is_ok());
        for status in [
            Deploying,
            Created,
            CreationFailed,
            Terminating,
            Terminated,
            TerminationFailed,
        ] {
            assert!(
                matches!(check_start(status), Err(ClusterError::StateConflict { .. })),
                "start should be rejected from {}",
                status
            );
        }
    }

    #[test]
    fn test_update_guard() {
        for status in [Deploying, Terminating, Created] {
            assert!(check_update(status).is_err(), "update allowed from {}", status);
        }
        for status in [New, CreationFailed, Terminated, TerminationFailed] {
            assert!(check_update(status).is_ok(), "update rejected from {}", status);
        }
    }

    #[test]
    fn test_terminate_guard_rejects_new_cluster() {
        let err = check_terminate(New).unwrap_err();
        assert!(err.to_string().contains("cannot terminate a new cluster"));
        assert!(check_terminate(Terminated).is_err());
        assert!(check_terminate(Deploying).is_err());
        assert!(check_terminate(Created).is_ok());
        assert!(check_terminate(CreationFailed).is_ok());
    }

    #[test]
    fn test_delete_guard() {
        assert!(check_delete(New, false).is_ok());
        assert!(check_delete(Terminated, false).is_ok());
        assert!(check_delete(CreationFailed, false).is_ok());
        assert!(check_delete(TerminationFailed, false).is_ok());
        assert!(check_delete(Deploying, false).is_err());
        assert!(check_delete(Terminating, false).is_err());
        assert!(check_delete(Created, false).is_err());
        for status in ClusterStatus::ALL {
            assert!(check_delete(status, true).is_ok());
        }
    }

    #[test]
    fn test_transition_records_failure_reason_only_for_failed_states() {
        let deploying = transition(&record(New), Deploying, Some("ignored".into())).unwrap();
        assert_eq!(deploying.status, Deploying);
        assert_eq!(deploying.failure_reason, None);

        let failed = transition(&deploying, CreationFailed, Some("quota".into())).unwrap();
        assert_eq!(failed.failure_reason.as_deref(), Some("quota"));

        let terminating = transition(&failed, Terminating, None).unwrap();
        assert_eq!(terminating.failure_reason, None);
    }

    #[test]
    fn test_transition_rejects_illegal_move() {
        let err = transition(&record(New), Created, None).unwrap_err();
        assert!(matches!(err, ClusterError::StateConflict { status: New, .. }));
    }
}
