//! Agent documents and their sessions: heal, upgrade, delete, reset and the
//! maintenance sweeps.


use std::time::Duration;

use chrono::Utc;
use fleet_coordinator::agents::{AgentSettings, SessionReport};
use fleet_coordinator::db::{AgentDocument, AgentQuery, AgentWorkspace, CURRENT_SCHEMA_VERSION};
use fleet_coordinator::sessions::SessionStatus;
use fleet_coordinator::CoordinatorError;
use fleet_id::{AgentId, SessionId};
use harness::{linux, session_id, TestFleet};

#[tokio::test]
async fn test_dangling_session_reference_is_cleared() {
    let fleet = TestFleet::new();
    let agent = fleet.connect("build-01", linux(8)).await;
    let session = agent.session.clone().unwrap();

    // Lose the volatile side, as after a store restart.
    assert!(fleet
        .coordinator
        .sessions()
        .delete_session(&session)
        .await
        .unwrap());

    let healed = fleet
        .coordinator
        .agents()
        .resolve(agent.id())
        .await
        .unwrap()
        .unwrap();
    assert!(healed.session.is_none());
    assert!(healed.document.session_id.is_none());
    assert!(healed.document.update_index > agent.document.update_index);

    let history = fleet
        .coordinator
        .durable()
        .sessions
        .find_by_agent(agent.id(), 10)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].finished_at.is_some());
}

#[tokio::test]
async fn test_session_owned_by_another_agent_is_not_adopted() {
    let fleet = TestFleet::new();
    let other = fleet.connect("build-02", linux(4)).await;
    let agents = fleet.coordinator.agents();
    let agent = agents
        .try_create_agent(AgentId::parse("build-01").unwrap(), false, None)
        .await
        .unwrap()
        .unwrap();

    let mut pointed = agent.document.clone();
    pointed.session_id = other.session_id();
    fleet
        .coordinator
        .durable()
        .agents
        .find_and_update(&agent.document, pointed)
        .await
        .unwrap()
        .unwrap();

    let resolved = agents.resolve(agent.id()).await.unwrap().unwrap();
    assert!(resolved.session.is_none());
    // The rightful owner is untouched.
    let owner = agents.resolve(other.id()).await.unwrap().unwrap();
    assert_eq!(owner.session_id(), other.session_id());
    let history = fleet
        .coordinator
        .durable()
        .sessions
        .find_by_agent(other.id(), 10)
        .await
        .unwrap();
    assert!(history[0].finished_at.is_none());
}

#[tokio::test]
async fn test_legacy_document_is_upgraded_on_resolve() {
    let fleet = TestFleet::new();
    let id = AgentId::parse("legacy-01").unwrap();
    let mut doc = AgentDocument::new(id.clone(), false, Utc::now());
    doc.schema_version = 0;
    doc.legacy_pools = vec![" linux".into(), "linux".into(), "gpu".into(), String::new()];
    assert!(fleet.coordinator.durable().agents.insert(&doc).await.unwrap());

    let agents = fleet.coordinator.agents();
    let (a, b) = tokio::join!(agents.resolve(&id), agents.resolve(&id));
    let a = a.unwrap().unwrap();
    let b = b.unwrap().unwrap();

    assert_eq!(a.document.schema_version, CURRENT_SCHEMA_VERSION);
    assert_eq!(a.document.explicit_pools, vec!["gpu", "linux"]);
    assert!(a.document.legacy_pools.is_empty());
    // Both readers converge on the same stored document.
    assert_eq!(a.document.update_index, b.document.update_index);
    assert_eq!(a.document.update_index, i64::from(CURRENT_SCHEMA_VERSION));
}

#[tokio::test]
async fn test_stale_document_write_is_rejected() {
    let fleet = TestFleet::new();
    let agents = fleet.coordinator.agents();
    let agent = fleet.connect("build-01", linux(8)).await;

    let disable = AgentSettings {
        enabled: Some(false),
        ..Default::default()
    };
    let comment = AgentSettings {
        comment: Some(Some("flaky disk".into())),
        ..Default::default()
    };
    agents
        .try_update_settings(&agent, &disable)
        .await
        .unwrap()
        .unwrap();
    let lost = agents.try_update_settings(&agent, &comment).await.unwrap();
    assert!(lost.is_none());

    let current = agents.resolve(agent.id()).await.unwrap().unwrap();
    assert!(!current.document.enabled);
    assert!(current.document.comment.is_none());
}

#[tokio::test]
async fn test_new_session_replaces_previous() {
    let fleet = TestFleet::new();
    let agents = fleet.coordinator.agents();
    let first = fleet.connect("build-01", linux(8)).await;
    let first_id = session_id(&first);

    fleet.advance(Duration::from_secs(5));
    let second = agents
        .try_create_session(&first, SessionId::new(), linux(16), Some("5.5.0".into()))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(session_id(&second), first_id);
    assert_eq!(second.document.version.as_deref(), Some("5.5.0"));

    let old = fleet
        .coordinator
        .sessions()
        .get_session(&first_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(old.status, SessionStatus::Stopped);

    let history = fleet
        .coordinator
        .durable()
        .sessions
        .find_by_agent(first.id(), 10)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].session_id, session_id(&second));
    assert!(history[0].finished_at.is_none());
    assert!(history[1].finished_at.is_some());
}

#[tokio::test]
async fn test_session_create_against_stale_agent_rolls_back() {
    let fleet = TestFleet::new();
    let agents = fleet.coordinator.agents();
    let agent = agents
        .try_create_agent(AgentId::parse("build-01").unwrap(), false, None)
        .await
        .unwrap()
        .unwrap();
    let settings = AgentSettings {
        explicit_pools: Some(vec!["linux".into()]),
        ..Default::default()
    };
    agents
        .try_update_settings(&agent, &settings)
        .await
        .unwrap()
        .unwrap();

    let id = SessionId::new();
    let lost = agents
        .try_create_session(&agent, id, linux(8), None)
        .await
        .unwrap();
    assert!(lost.is_none());
    assert!(fleet
        .coordinator
        .sessions()
        .get_session(&id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_stopped_report_detaches_session() {
    let fleet = TestFleet::new();
    let agents = fleet.coordinator.agents();
    let agent = fleet.connect("build-01", linux(8)).await;
    let report = SessionReport {
        status: Some(SessionStatus::Stopped),
        ..Default::default()
    };
    let stopped = agents.try_update_session(&agent, report).await.unwrap().unwrap();
    assert!(stopped.session.is_none());
    assert!(stopped.document.session_id.is_none());
    assert!(!stopped.is_online());

    let err = agents
        .try_update_session(&stopped, SessionReport::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::NoSession(_)));
}

#[tokio::test]
async fn test_dynamic_pools_are_normalized() {
    let fleet = TestFleet::new();
    let agents = fleet.coordinator.agents();
    let agent = fleet.connect("build-01", linux(8)).await;
    let report = SessionReport {
        dynamic_pools: Some(vec!["win ".into(), "arm".into(), "arm".into()]),
        ..Default::default()
    };
    let agent = agents.try_update_session(&agent, report).await.unwrap().unwrap();
    assert_eq!(agent.document.dynamic_pools, vec!["arm", "win"]);
    assert!(agent.document.in_pool("arm"));

    let found = agents
        .find(&AgentQuery {
            pool: Some("win".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id(), agent.id());
}

#[tokio::test]
async fn test_delete_and_reset() {
    let fleet = TestFleet::new();
    let agents = fleet.coordinator.agents();
    let agent = fleet.connect("build-01", linux(8)).await;
    let old_session = session_id(&agent);

    let deleted = agents.try_delete(&agent).await.unwrap().unwrap();
    assert!(deleted.document.deleted);
    assert!(!deleted.document.enabled);
    assert!(deleted.session.is_none());
    let old = fleet
        .coordinator
        .sessions()
        .get_session(&old_session)
        .await
        .unwrap()
        .unwrap();
    assert!(old.is_stopped());

    let err = agents
        .try_create_session(&deleted, SessionId::new(), linux(8), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::AgentDeleted(_)));

    let reset = agents.try_reset(&deleted).await.unwrap().unwrap();
    assert!(!reset.document.deleted);
    assert!(reset.document.enabled);
    let back = agents
        .try_create_session(&reset, SessionId::new(), linux(8), None)
        .await
        .unwrap()
        .unwrap();
    assert!(back.is_schedulable());
}

#[tokio::test]
async fn test_workspaces_are_deduplicated() {
    let fleet = TestFleet::new();
    let agents = fleet.coordinator.agents();
    let agent = fleet.connect("build-01", linux(8)).await;
    let ws = AgentWorkspace {
        identifier: "main".into(),
        stream: "//depot/main".into(),
        view: Vec::new(),
        incremental: true,
    };
    let updated = agents
        .try_update_workspaces(&agent, vec![ws.clone(), ws.clone()], true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.document.workspaces, vec![ws.clone()]);
    assert!(updated.document.request_conform);

    // No change, no write.
    let same = agents
        .try_update_workspaces(&updated, vec![ws], false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(same.document.update_index, updated.document.update_index);
}

#[tokio::test]
async fn test_settings_change_wakes_long_poll() {
    let fleet = TestFleet::new();
    let agents = fleet.coordinator.agents().clone();
    let agent = fleet.connect("build-01", linux(8)).await;

    let waiter = {
        let agents = agents.clone();
        let agent = agent.clone();
        tokio::spawn(async move { agents.wait_for_update(&agent, Duration::from_secs(10)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let restart = AgentSettings {
        request_restart: Some(true),
        ..Default::default()
    };
    agents
        .try_update_settings(&agent, &restart)
        .await
        .unwrap()
        .unwrap();

    let woken = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(woken.document.request_restart);
}

#[tokio::test]
async fn test_expired_sessions_are_stopped_then_finalised() {
    let fleet = TestFleet::new();
    let agents = fleet.coordinator.agents();
    let expiry = fleet.coordinator.settings().session_expiry;
    let agent = fleet.connect("build-01", linux(8)).await;
    let id = session_id(&agent);

    assert_eq!(agents.terminate_expired_sessions().await.unwrap(), 0);

    fleet.advance(expiry + Duration::from_secs(1));
    assert_eq!(agents.terminate_expired_sessions().await.unwrap(), 1);
    let stopped = fleet
        .coordinator
        .sessions()
        .get_session(&id)
        .await
        .unwrap()
        .unwrap();
    assert!(stopped.is_stopped());
    let detached = agents.resolve(agent.id()).await.unwrap().unwrap();
    assert!(detached.document.session_id.is_none());

    // The stop grace period has to run out before the session is removed.
    fleet.advance(expiry + Duration::from_secs(1));
    assert_eq!(agents.terminate_expired_sessions().await.unwrap(), 0);
    fleet.advance(expiry);
    assert_eq!(agents.terminate_expired_sessions().await.unwrap(), 1);
    assert!(fleet
        .coordinator
        .sessions()
        .get_session(&id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_offline_ephemeral_agents_are_evicted() {
    let fleet = TestFleet::new();
    let agents = fleet.coordinator.agents();
    let ttl = fleet.coordinator.settings().ephemeral_agent_ttl;

    let ephemeral = fleet.connect_with("spot-01", true, linux(8)).await;
    let online = fleet.connect_with("spot-02", true, linux(8)).await;
    let permanent = fleet.connect("build-01", linux(8)).await;

    let stop = SessionReport {
        status: Some(SessionStatus::Stopped),
        ..Default::default()
    };
    agents
        .try_update_session(&ephemeral, stop.clone())
        .await
        .unwrap()
        .unwrap();
    agents
        .try_update_session(&permanent, stop)
        .await
        .unwrap()
        .unwrap();

    fleet.advance(ttl + Duration::from_secs(1));
    assert_eq!(agents.evict_ephemeral_agents().await.unwrap(), 1);

    assert!(agents.resolve(ephemeral.id()).await.unwrap().is_none());
    assert!(fleet
        .coordinator
        .durable()
        .sessions
        .find_by_agent(ephemeral.id(), 10)
        .await
        .unwrap()
        .is_empty());
    assert!(agents.resolve(online.id()).await.unwrap().is_some());
    assert!(agents.resolve(permanent.id()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_deleted_ephemeral_agent_is_evicted_immediately() {
    let fleet = TestFleet::new();
    let agents = fleet.coordinator.agents();
    let agent = fleet.connect_with("spot-01", true, linux(8)).await;
    agents.try_delete(&agent).await.unwrap().unwrap();

    assert_eq!(agents.evict_ephemeral_agents().await.unwrap(), 1);
    assert!(agents.resolve(agent.id()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_never_connected_ephemeral_agent_expires_from_enrollment() {
    let fleet = TestFleet::new();
    let agents = fleet.coordinator.agents();
    let ttl = fleet.coordinator.settings().ephemeral_agent_ttl;
    let agent = agents
        .try_create_agent(AgentId::parse("spot-09").unwrap(), true, None)
        .await
        .unwrap()
        .unwrap();
    assert!(agent.document.last_online_time.is_none());

    fleet.advance(ttl / 2);
    assert_eq!(agents.evict_ephemeral_agents().await.unwrap(), 0);

    fleet.advance(ttl / 2 + Duration::from_secs(1));
    assert_eq!(agents.evict_ephemeral_agents().await.unwrap(), 1);
    assert!(agents.resolve(agent.id()).await.unwrap().is_none());
}
