//! Deterministic conflict resolution between a local and a remote copy of the
//! same entity. Everything here is pure: same inputs, same answer, on every
//! device.

use serde::{Deserialize, Serialize};

use crate::model::{HighResTimestamp, MessageType, OrderStatus};

/// How a remote status competes with the local one when the remote entity
/// version is older than the local copy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusPrecedence {
    /// Higher-authority status wins regardless of version.
    #[default]
    Supremacy,
    /// A remote status from an older version never replaces the local one.
    VersionGated,
}

/// Version/timestamp/status triple that the resolver reasons about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedState {
    pub version: u64,
    pub timestamp: HighResTimestamp,
    pub status: OrderStatus,
}

/// Outcome of resolving a remote update against the local copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateResolution {
    /// Whether the remote data fields replace the local ones.
    pub accept_remote_fields: bool,
    pub status: OrderStatus,
}

/// Returns `true` when the remote copy should overwrite local data fields.
#[must_use]
pub fn resolve_version(
    local_version: u64,
    remote_version: u64,
    local_ts: HighResTimestamp,
    remote_ts: HighResTimestamp,
) -> bool {
    match remote_version.cmp(&local_version) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => remote_ts > local_ts,
    }
}

#[must_use]
pub fn status_priority(status: &OrderStatus) -> u8 {
    match status {
        OrderStatus::Void => 100,
        OrderStatus::Paid => 90,
        OrderStatus::Completed => 80,
        OrderStatus::Ready => 60,
        OrderStatus::InProgress => 50,
        OrderStatus::Pending => 10,
        OrderStatus::Other(_) => 0,
    }
}

/// Higher priority wins; a tie keeps the local status.
#[must_use]
pub fn resolve_status<'a>(local: &'a OrderStatus, remote: &'a OrderStatus) -> &'a OrderStatus {
    if status_priority(remote) > status_priority(local) {
        remote
    } else {
        local
    }
}

/// Creation-class messages never conflict.
#[must_use]
pub const fn is_additive(message_type: MessageType) -> bool {
    matches!(
        message_type,
        MessageType::OrderCreated | MessageType::LineItemAdded | MessageType::ItemClaimed
    )
}

#[must_use]
pub fn merge_additive(local: &VersionedState, remote: &VersionedState) -> VersionedState {
    VersionedState {
        version: local.version.max(remote.version).saturating_add(1),
        timestamp: local.timestamp.max(remote.timestamp),
        status: resolve_status(&local.status, &remote.status).clone(),
    }
}

/// Field-level and status-level outcome of a remote update, decided
/// independently of one another.
#[must_use]
pub fn resolve_update(
    local: &VersionedState,
    remote: &VersionedState,
    precedence: StatusPrecedence,
) -> UpdateResolution {
    let accept_remote_fields =
        resolve_version(local.version, remote.version, local.timestamp, remote.timestamp);

    let status = match precedence {
        StatusPrecedence::VersionGated if remote.version < local.version => local.status.clone(),
        StatusPrecedence::Supremacy | StatusPrecedence::VersionGated => {
            resolve_status(&local.status, &remote.status).clone()
        }
    };

    UpdateResolution {
        accept_remote_fields,
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ts(n: u64) -> HighResTimestamp {
        HighResTimestamp(n)
    }

    fn state(version: u64, timestamp: u64, status: OrderStatus) -> VersionedState {
        VersionedState {
            version,
            timestamp: ts(timestamp),
            status,
        }
    }

    #[test]
    fn newer_remote_version_wins_regardless_of_time() {
        assert!(resolve_version(5, 6, ts(900), ts(100)));
        assert!(resolve_version(5, 6, ts(100), ts(900)));
    }

    #[test]
    fn older_remote_version_loses_regardless_of_time() {
        assert!(!resolve_version(6, 5, ts(100), ts(900)));
    }

    #[test]
    fn equal_versions_fall_back_to_timestamp() {
        assert!(resolve_version(5, 5, ts(100), ts(200)));
        assert!(!resolve_version(5, 5, ts(200), ts(100)));
        assert!(!resolve_version(5, 5, ts(200), ts(200)));
    }

    #[test]
    fn void_beats_pending_both_ways() {
        let pending = OrderStatus::Pending;
        let void = OrderStatus::Void;
        assert_eq!(resolve_status(&pending, &void), &OrderStatus::Void);
        assert_eq!(resolve_status(&void, &pending), &OrderStatus::Void);
    }

    #[test]
    fn priority_table() {
        let ordered = [
            OrderStatus::Other("HELD".into()),
            OrderStatus::Pending,
            OrderStatus::InProgress,
            OrderStatus::Ready,
            OrderStatus::Completed,
            OrderStatus::Paid,
            OrderStatus::Void,
        ];
        for pair in ordered.windows(2) {
            assert!(status_priority(&pair[0]) < status_priority(&pair[1]));
        }
        assert_eq!(status_priority(&OrderStatus::Void), 100);
        assert_eq!(status_priority(&OrderStatus::Other("x".into())), 0);
    }

    #[test]
    fn equal_priority_keeps_local() {
        let a = OrderStatus::Other("A".into());
        let b = OrderStatus::Other("B".into());
        assert_eq!(resolve_status(&a, &b), &a);
        assert_eq!(resolve_status(&b, &a), &b);
    }

    #[test]
    fn additive_types() {
        assert!(is_additive(MessageType::OrderCreated));
        assert!(is_additive(MessageType::LineItemAdded));
        assert!(is_additive(MessageType::ItemClaimed));
        assert!(!is_additive(MessageType::OrderUpdated));
        assert!(!is_additive(MessageType::StatusChanged));
    }

    #[test]
    fn merge_additive_bumps_past_both() {
        let merged = merge_additive(
            &state(3, 50, OrderStatus::Ready),
            &state(7, 20, OrderStatus::InProgress),
        );
        assert_eq!(merged.version, 8);
        assert_eq!(merged.timestamp, ts(50));
        assert_eq!(merged.status, OrderStatus::Ready);
    }

    #[test]
    fn stale_void_under_each_precedence() {
        let local = state(4, 100, OrderStatus::Paid);
        let remote = state(2, 50, OrderStatus::Void);

        let supreme = resolve_update(&local, &remote, StatusPrecedence::Supremacy);
        assert!(!supreme.accept_remote_fields);
        assert_eq!(supreme.status, OrderStatus::Void);

        let gated = resolve_update(&local, &remote, StatusPrecedence::VersionGated);
        assert!(!gated.accept_remote_fields);
        assert_eq!(gated.status, OrderStatus::Paid);
    }

    fn any_status() -> impl Strategy<Value = OrderStatus> {
        prop_oneof![
            Just(OrderStatus::Pending),
            Just(OrderStatus::InProgress),
            Just(OrderStatus::Ready),
            Just(OrderStatus::Completed),
            Just(OrderStatus::Paid),
            Just(OrderStatus::Void),
        ]
    }

    proptest! {
        #[test]
        fn known_statuses_resolve_commutatively(a in any_status(), b in any_status()) {
            prop_assert_eq!(resolve_status(&a, &b), resolve_status(&b, &a));
        }

        #[test]
        fn status_resolution_is_idempotent(a in any_status(), b in any_status()) {
            let once = resolve_status(&a, &b).clone();
            prop_assert_eq!(resolve_status(&once, &b), &once);
        }

        #[test]
        fn exactly_one_side_wins_distinct_stamps(
            lv in 0u64..10, rv in 0u64..10, lt in 0u64..1_000, rt in 0u64..1_000,
        ) {
            prop_assume!(lv != rv || lt != rt);
            let remote_wins = resolve_version(lv, rv, ts(lt), ts(rt));
            let local_wins = resolve_version(rv, lv, ts(rt), ts(lt));
            prop_assert!(remote_wins != local_wins);
        }

        #[test]
        fn merge_is_symmetric(
            lv in 0u64..1_000, rv in 0u64..1_000, lt in 0u64..1_000, rt in 0u64..1_000,
            ls in any_status(), rs in any_status(),
        ) {
            let l = state(lv, lt, ls);
            let r = state(rv, rt, rs);
            let ab = merge_additive(&l, &r);
            let ba = merge_additive(&r, &l);
            prop_assert_eq!(&ab, &ba);
            prop_assert!(ab.version > lv && ab.version > rv);
        }
    }
}
