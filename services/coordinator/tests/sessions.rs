//! Session lifecycle: creation, tick CAS, expiry, stop and deletion.


use std::collections::BTreeSet;
use std::time::Duration;

use fleet_coordinator::clock::{window_ticks, Clock};
use fleet_coordinator::filters::FilterIndex;
use fleet_coordinator::sessions::{Capabilities, SessionStatus, SessionUpdate};
use fleet_coordinator::volatile::{keys, VolatileStore};
use fleet_id::{AgentId, SessionId};
use futures_util::TryStreamExt;
use harness::{linux, linux_cpu, TestFleet};
use proptest::prelude::*;

#[tokio::test]
async fn test_session_id_can_only_be_created_once() {
    let fleet = TestFleet::new();
    let sessions = fleet.coordinator.sessions();
    let agent = AgentId::parse("build-01").unwrap();
    let id = SessionId::new();

    let first = sessions.create_session(&agent, id, linux(8)).await.unwrap();
    assert!(first.is_some());
    let second = sessions
        .create_session(&agent, id, Capabilities::default())
        .await
        .unwrap();
    assert!(second.is_none());

    // The losing call did not overwrite anything.
    let stored = sessions.get_session(&id).await.unwrap().unwrap();
    assert_eq!(stored.capabilities, linux(8));
    assert_eq!(stored.status, SessionStatus::Ok);
}

#[tokio::test]
async fn test_stale_update_is_rejected() {
    let fleet = TestFleet::new();
    let sessions = fleet.coordinator.sessions();
    let agent = AgentId::parse("build-01").unwrap();
    let original = sessions
        .create_session(&agent, SessionId::new(), linux(8))
        .await
        .unwrap()
        .unwrap();

    let updated = sessions
        .update_session(&original, SessionUpdate::status(SessionStatus::Busy))
        .await
        .unwrap()
        .unwrap();
    assert!(updated.update_ticks > original.update_ticks);

    let lost = sessions
        .update_session(&original, SessionUpdate::status(SessionStatus::Ok))
        .await
        .unwrap();
    assert!(lost.is_none());

    let current = sessions.get_session(&original.id).await.unwrap().unwrap();
    assert_eq!(current.status, SessionStatus::Busy);
    assert_eq!(current.update_ticks, updated.update_ticks);
}

#[tokio::test]
async fn test_unchanged_capabilities_are_not_rewritten() {
    let fleet = TestFleet::new();
    let sessions = fleet.coordinator.sessions();
    let agent = AgentId::parse("build-01").unwrap();
    let session = sessions
        .create_session(&agent, SessionId::new(), linux(8))
        .await
        .unwrap()
        .unwrap();

    let update = SessionUpdate {
        capabilities: Some(linux(8)),
        ..SessionUpdate::default()
    };
    let updated = sessions.update_session(&session, update).await.unwrap().unwrap();
    assert_eq!(updated.capabilities_hash, session.capabilities_hash);

    let update = SessionUpdate {
        capabilities: Some(linux(16)),
        ..SessionUpdate::default()
    };
    let grown = sessions.update_session(&updated, update).await.unwrap().unwrap();
    assert_ne!(grown.capabilities_hash, session.capabilities_hash);
    let reread = sessions.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(reread.capabilities.resource("CPU"), 16);
}

#[tokio::test]
async fn test_find_expired_returns_only_stale_sessions() {
    let fleet = TestFleet::new();
    let sessions = fleet.coordinator.sessions();
    let expiry = fleet.coordinator.settings().session_expiry;

    let stale = sessions
        .create_session(&AgentId::parse("stale").unwrap(), SessionId::new(), linux(4))
        .await
        .unwrap()
        .unwrap();
    let fresh = sessions
        .create_session(&AgentId::parse("fresh").unwrap(), SessionId::new(), linux(4))
        .await
        .unwrap()
        .unwrap();

    fleet.advance(expiry / 2);
    sessions
        .update_session(&fresh, SessionUpdate::status(SessionStatus::Ok))
        .await
        .unwrap()
        .unwrap();
    fleet.advance(expiry / 2 + Duration::from_secs(1));

    let expired: Vec<_> = sessions.find_expired_sessions().try_collect().await.unwrap();
    let ids: Vec<SessionId> = expired.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![stale.id]);

    let cutoff = fleet.clock.now_ticks() - window_ticks(expiry);
    assert!(expired.iter().all(|s| s.update_ticks < cutoff));
}

#[tokio::test]
async fn test_stop_removes_session_from_every_filter() {
    let fleet = TestFleet::new();
    let hash = fleet
        .coordinator
        .filters()
        .create_filter(&linux_cpu(2))
        .await
        .unwrap();
    let sessions = fleet.coordinator.sessions();
    let session = sessions
        .create_session(&AgentId::parse("build-01").unwrap(), SessionId::new(), linux(8))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        fleet.members(&hash, FilterIndex::Potential).await,
        BTreeSet::from([session.id])
    );
    assert_eq!(
        fleet.members(&hash, FilterIndex::Available).await,
        BTreeSet::from([session.id])
    );

    let stopped = sessions
        .update_session(&session, SessionUpdate::stop())
        .await
        .unwrap()
        .unwrap();
    assert!(stopped.is_stopped());
    assert!(stopped.leases.is_empty());
    assert!(stopped.filters.is_empty());
    assert!(fleet.members(&hash, FilterIndex::Potential).await.is_empty());
    assert!(fleet.members(&hash, FilterIndex::Available).await.is_empty());

    // The stop pushes the tick one expiry window into the future.
    let expiry = window_ticks(fleet.coordinator.settings().session_expiry);
    assert!(stopped.update_ticks >= fleet.clock.now_ticks() + expiry);

    let membership = fleet
        .store
        .hash_get_all(&keys::session_filters(&session.id))
        .await
        .unwrap();
    assert!(membership.is_empty());
}

#[tokio::test]
async fn test_delete_session_leaves_no_trace() {
    let fleet = TestFleet::new();
    let hash = fleet
        .coordinator
        .filters()
        .create_filter(&linux_cpu(2))
        .await
        .unwrap();
    let sessions = fleet.coordinator.sessions();
    let session = sessions
        .create_session(&AgentId::parse("build-01").unwrap(), SessionId::new(), linux(8))
        .await
        .unwrap()
        .unwrap();

    assert!(sessions.delete_session(&session).await.unwrap());
    assert!(sessions.get_session(&session.id).await.unwrap().is_none());
    assert!(fleet
        .store
        .hash_get(keys::SESSIONS, &session.id.to_string())
        .await
        .unwrap()
        .is_none());
    assert!(fleet.members(&hash, FilterIndex::Potential).await.is_empty());

    // A second delete against the same tick finds nothing to remove.
    assert!(!sessions.delete_session(&session).await.unwrap());
}

#[tokio::test]
async fn test_wait_for_session_update_wakes_on_change() {
    let fleet = TestFleet::new();
    let sessions = fleet.coordinator.sessions().clone();
    let session = sessions
        .create_session(&AgentId::parse("build-01").unwrap(), SessionId::new(), linux(8))
        .await
        .unwrap()
        .unwrap();

    let waiter = {
        let sessions = sessions.clone();
        let session = session.clone();
        tokio::spawn(async move {
            sessions
                .wait_for_session_update(&session, Duration::from_secs(10))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    sessions
        .update_session(&session, SessionUpdate::status(SessionStatus::Busy))
        .await
        .unwrap()
        .unwrap();

    let woken = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(woken.status, SessionStatus::Busy);
}

#[tokio::test]
async fn test_wait_for_session_update_times_out_unchanged() {
    let fleet = TestFleet::new();
    let sessions = fleet.coordinator.sessions();
    let session = sessions
        .create_session(&AgentId::parse("build-01").unwrap(), SessionId::new(), linux(8))
        .await
        .unwrap()
        .unwrap();

    let same = sessions
        .wait_for_session_update(&session, Duration::from_millis(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(same.update_ticks, session.update_ticks);
}

#[tokio::test]
async fn test_store_outage_surfaces_as_error() {
    let fleet = TestFleet::new();
    fleet.store.set_unavailable(true);
    let result = fleet
        .coordinator
        .sessions()
        .create_session(&AgentId::parse("build-01").unwrap(), SessionId::new(), linux(8))
        .await;
    assert!(result.is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_ticks_strictly_increase(steps in prop::collection::vec(0u64..5_000, 1..20)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let fleet = TestFleet::new();
            let sessions = fleet.coordinator.sessions();
            let mut session = sessions
                .create_session(&AgentId::parse("prop").unwrap(), SessionId::new(), linux(8))
                .await
                .unwrap()
                .unwrap();

            for (i, step) in steps.iter().enumerate() {
                fleet.advance(Duration::from_millis(*step));
                let status = if i % 2 == 0 { SessionStatus::Busy } else { SessionStatus::Ok };
                let next = sessions
                    .update_session(&session, SessionUpdate::status(status))
                    .await
                    .unwrap()
                    .unwrap();
                prop_assert!(next.update_ticks > session.update_ticks);
                prop_assert!(next.update_ticks >= fleet.clock.now_ticks());
                session = next;
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
