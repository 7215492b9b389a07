mod common;

use std::time::Duration;

use cms_admin_client::ws::{MemoryServer, WireFrame};
use cms_admin_client::{
    AuthError, ConnectionState, MemoryNavigator, NotificationChannel, PermissionChange,
    SessionAuthority, SessionConfig, SessionError, SessionPhase, Visit,
};
use cms_admin_shared::{ApiError, Credentials};
use serde_json::json;

use common::{
    account_locked, frame, identity, memory_channel, role_names, role_updated, wait_for_state,
    wait_until, ScriptedBackend,
};

struct Harness {
    session: SessionAuthority,
    backend: ScriptedBackend,
    navigator: MemoryNavigator,
    channel: NotificationChannel,
    server: MemoryServer,
}

fn harness(backend: ScriptedBackend, path: &str) -> Harness {
    let (channel, _connector, server) = memory_channel();
    let navigator = MemoryNavigator::new(path);
    let session = SessionAuthority::new(
        SessionConfig::default(),
        backend.clone(),
        navigator.clone(),
        channel.clone(),
    );
    Harness {
        session,
        backend,
        navigator,
        channel,
        server,
    }
}

async fn wait_for_phase(session: &SessionAuthority, phase: SessionPhase) {
    let mut rx = session.phase_changes();
    wait_until(&mut rx, |p| *p == phase).await;
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn anonymous_start_never_opens_the_channel() {
    let h = harness(ScriptedBackend::default(), "/");

    h.session.init().await.unwrap();

    assert_eq!(h.session.phase(), SessionPhase::Unauthenticated);
    assert!(h.session.identity().is_none());
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.server.attempt_count(), 0);
    assert_eq!(h.channel.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn signed_in_start_opens_the_channel() {
    let mut h = harness(ScriptedBackend::signed_in(identity("u1", &["EDITOR"])), "/admin");

    h.session.init().await.unwrap();

    assert_eq!(h.session.phase(), SessionPhase::Authenticated);
    let _peer = h.server.accept().await.unwrap();
    wait_for_state(&h.channel, ConnectionState::Connected).await;

    // A second init neither re-registers handlers nor reconnects.
    h.session.init().await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.server.attempt_count(), 1);
    h.session.teardown();
}

#[tokio::test(start_paused = true)]
async fn failed_first_fetch_is_reported_and_stays_anonymous() {
    let backend = ScriptedBackend::signed_in(identity("u1", &["EDITOR"]));
    backend.fail_next(AuthError::Api(ApiError::Network("connection refused".into())));
    let h = harness(backend, "/");

    let err = h.session.init().await.unwrap_err();
    assert!(matches!(err, SessionError::Refresh(AuthError::Api(_))));
    assert_eq!(h.session.phase(), SessionPhase::Unauthenticated);
    assert_eq!(h.server.attempt_count(), 0);
}

// ---------------------------------------------------------------------------
// Role changes
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn demotion_inside_admin_is_withheld_until_acknowledged() {
    let mut h = harness(
        ScriptedBackend::signed_in(identity("u1", &["EDITOR"])),
        "/admin/articles/12",
    );
    h.session.init().await.unwrap();
    let peer = h.server.accept().await.unwrap();
    wait_for_state(&h.channel, ConnectionState::Connected).await;

    h.backend.set_identity(Some(identity("u1", &["READER"])));
    peer.send_frame(&role_updated());
    wait_for_phase(
        &h.session,
        SessionPhase::PermissionPending(PermissionChange::Demoted),
    )
    .await;

    // The old identity stays committed.
    let committed = h.session.identity().unwrap();
    assert_eq!(role_names(&committed), vec!["EDITOR"]);
    assert!(h.navigator.history().is_empty());

    h.session.acknowledge_permission_change().await.unwrap();

    assert_eq!(h.navigator.history(), vec![Visit::Navigate("/".into())]);
    assert_eq!(role_names(&h.session.identity().unwrap()), vec!["READER"]);
    assert_eq!(h.session.phase(), SessionPhase::Authenticated);
    assert_eq!(h.session.pending_permission_change(), None);
    h.session.teardown();
}

#[tokio::test(start_paused = true)]
async fn restored_role_withdraws_a_pending_demotion() {
    let mut h = harness(
        ScriptedBackend::signed_in(identity("u1", &["EDITOR"])),
        "/admin/articles/12",
    );
    h.session.init().await.unwrap();
    let _peer = h.server.accept().await.unwrap();

    h.backend.set_identity(Some(identity("u1", &["READER"])));
    h.session.refresh_identity().await.unwrap();
    assert_eq!(
        h.session.pending_permission_change(),
        Some(PermissionChange::Demoted)
    );

    h.backend.set_identity(Some(identity("u1", &["EDITOR", "READER"])));
    h.session.refresh_identity().await.unwrap();

    assert_eq!(h.session.pending_permission_change(), None);
    assert_eq!(h.session.phase(), SessionPhase::Authenticated);
    assert_eq!(role_names(&h.session.identity().unwrap()), vec!["EDITOR", "READER"]);

    // Nothing left to acknowledge, so the user stays where they are.
    h.session.acknowledge_permission_change().await.unwrap();
    assert!(h.navigator.history().is_empty());
    h.session.teardown();
}

#[tokio::test(start_paused = true)]
async fn demotion_outside_admin_commits_directly() {
    let mut h = harness(ScriptedBackend::signed_in(identity("u1", &["AUTHOR"])), "/profile");
    h.session.init().await.unwrap();
    let _peer = h.server.accept().await.unwrap();

    h.backend.set_identity(Some(identity("u1", &["READER"])));
    h.session.refresh_identity().await.unwrap();

    assert_eq!(h.session.phase(), SessionPhase::Authenticated);
    assert_eq!(role_names(&h.session.identity().unwrap()), vec!["READER"]);
    h.session.teardown();
}

#[tokio::test(start_paused = true)]
async fn promotion_outside_admin_commits_and_informs() {
    let mut h = harness(ScriptedBackend::signed_in(identity("u1", &["READER"])), "/home");
    h.session.init().await.unwrap();
    let peer = h.server.accept().await.unwrap();
    wait_for_state(&h.channel, ConnectionState::Connected).await;

    h.backend.set_identity(Some(identity("u1", &["EDITOR"])));
    peer.send_frame(&role_updated());
    wait_for_phase(
        &h.session,
        SessionPhase::PermissionPending(PermissionChange::Promoted),
    )
    .await;

    // Committed before the user acknowledges.
    assert_eq!(role_names(&h.session.identity().unwrap()), vec!["EDITOR"]);

    h.session.acknowledge_permission_change().await.unwrap();
    assert_eq!(h.session.phase(), SessionPhase::Authenticated);
    assert!(h.navigator.history().is_empty());
    h.session.teardown();
}

#[tokio::test(start_paused = true)]
async fn promotion_inside_admin_is_silent() {
    let mut h = harness(ScriptedBackend::signed_in(identity("u1", &["READER"])), "/admin");
    h.session.init().await.unwrap();
    let _peer = h.server.accept().await.unwrap();

    h.backend.set_identity(Some(identity("u1", &["ADMIN"])));
    h.session.refresh_identity().await.unwrap();

    assert_eq!(h.session.phase(), SessionPhase::Authenticated);
    assert_eq!(role_names(&h.session.identity().unwrap()), vec!["ADMIN"]);
    h.session.teardown();
}

#[tokio::test(start_paused = true)]
async fn overlapping_refreshes_raise_one_interstitial() {
    let mut h = harness(
        ScriptedBackend::signed_in(identity("u1", &["EDITOR"])),
        "/admin/users",
    );
    h.session.init().await.unwrap();
    let _peer = h.server.accept().await.unwrap();

    h.backend.set_identity(Some(identity("u1", &["READER"])));
    h.backend.set_fetch_delay(Duration::from_secs(1));

    let mut phases = h.session.phase_changes();
    let (a, b) = tokio::join!(h.session.refresh_identity(), h.session.refresh_identity());
    a.unwrap();
    b.unwrap();

    assert_eq!(h.backend.fetches(), 3);
    assert!(phases.has_changed().unwrap());
    assert_eq!(
        *phases.borrow_and_update(),
        SessionPhase::PermissionPending(PermissionChange::Demoted)
    );
    assert_eq!(role_names(&h.session.identity().unwrap()), vec!["EDITOR"]);

    // One acknowledgement settles it.
    h.session.acknowledge_permission_change().await.unwrap();
    assert_eq!(h.session.phase(), SessionPhase::Authenticated);
    assert_eq!(h.navigator.history(), vec![Visit::Navigate("/".into())]);
    h.session.teardown();
}

// ---------------------------------------------------------------------------
// Refresh failures
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn transient_failure_keeps_the_session() {
    let mut h = harness(ScriptedBackend::signed_in(identity("u1", &["EDITOR"])), "/admin");
    h.session.init().await.unwrap();
    let _peer = h.server.accept().await.unwrap();
    wait_for_state(&h.channel, ConnectionState::Connected).await;

    h.backend.fail_next(AuthError::Api(ApiError::Http {
        status: 503,
        body: String::new(),
    }));
    let err = h.session.refresh_identity().await.unwrap_err();

    assert!(matches!(err, SessionError::Refresh(_)));
    assert_eq!(h.session.phase(), SessionPhase::Authenticated);
    assert!(h.session.identity().is_some());
    assert_eq!(h.channel.state(), ConnectionState::Connected);
    h.session.teardown();
}

#[tokio::test(start_paused = true)]
async fn expired_session_clears_identity_and_closes_channel() {
    let mut h = harness(ScriptedBackend::signed_in(identity("u1", &["EDITOR"])), "/admin");
    h.session.init().await.unwrap();
    let mut peer = h.server.accept().await.unwrap();
    wait_for_state(&h.channel, ConnectionState::Connected).await;

    h.backend.set_identity(None);
    h.session.refresh_identity().await.unwrap();

    assert_eq!(h.session.phase(), SessionPhase::Unauthenticated);
    assert_eq!(h.channel.state(), ConnectionState::Disconnected);
    assert!(matches!(peer.recv().await, Some(WireFrame::Close(_))));
    h.session.teardown();
}

// ---------------------------------------------------------------------------
// Lock, login, logout
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn lock_blocks_until_logout() {
    let mut h = harness(ScriptedBackend::signed_in(identity("u1", &["EDITOR"])), "/admin");
    h.session.init().await.unwrap();
    let peer = h.server.accept().await.unwrap();
    wait_for_state(&h.channel, ConnectionState::Connected).await;

    peer.send_frame(&account_locked());
    wait_for_phase(&h.session, SessionPhase::Locked).await;
    assert!(h.session.is_locked());
    assert_eq!(h.channel.state(), ConnectionState::Disconnected);

    // Refreshes are skipped while locked.
    let fetches = h.backend.fetches();
    h.session.refresh_identity().await.unwrap();
    assert_eq!(h.backend.fetches(), fetches);
    assert_eq!(h.session.phase(), SessionPhase::Locked);

    h.session.logout().await;
    assert_eq!(h.session.phase(), SessionPhase::Unauthenticated);
    assert!(!h.session.is_locked());
    assert!(h.session.identity().is_none());
    assert_eq!(h.backend.logouts(), 1);
    assert_eq!(h.navigator.history(), vec![Visit::HardRedirect("/".into())]);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.server.attempt_count(), 1);
    h.session.teardown();
}

#[tokio::test(start_paused = true)]
async fn login_commits_and_opens_the_channel() {
    let backend = ScriptedBackend::default();
    backend.set_account(identity("u7", &["AUTHOR"]));
    let mut h = harness(backend, "/login");
    h.session.init().await.unwrap();

    let err = h
        .session
        .login(&Credentials {
            email: "u7@example.com".into(),
            password: "wrong".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Login(AuthError::InvalidCredentials(_))));
    assert_eq!(h.session.phase(), SessionPhase::Unauthenticated);

    h.session
        .login(&Credentials {
            email: "u7@example.com".into(),
            password: "correct horse".into(),
        })
        .await
        .unwrap();
    assert_eq!(h.session.phase(), SessionPhase::Authenticated);
    assert_eq!(h.session.identity().unwrap().id, "u7");
    let _peer = h.server.accept().await.unwrap();
    wait_for_state(&h.channel, ConnectionState::Connected).await;
    assert_eq!(h.backend.logins(), 2);
    h.session.teardown();
}

#[tokio::test(start_paused = true)]
async fn presence_is_exposed_through_the_session() {
    let mut h = harness(ScriptedBackend::signed_in(identity("u1", &["ADMIN"])), "/admin");
    h.session.init().await.unwrap();
    let peer = h.server.accept().await.unwrap();
    wait_for_state(&h.channel, ConnectionState::Connected).await;

    let (tx, mut applied) = tokio::sync::mpsc::unbounded_channel();
    let _tap = h.channel.subscribe("online_list", move |_| {
        let _ = tx.send(());
    });
    peer.send_frame(&frame("online_list", json!({ "user_ids": ["u1", "u5"] })));
    applied.recv().await.unwrap();

    assert!(h.session.is_online("u5"));
    assert_eq!(h.session.online_users().len(), 2);

    h.session.logout().await;
    assert!(h.session.online_users().is_empty());
    h.session.teardown();
}

#[tokio::test(start_paused = true)]
async fn teardown_stops_reacting_to_events() {
    let mut h = harness(ScriptedBackend::signed_in(identity("u1", &["EDITOR"])), "/admin");
    h.session.init().await.unwrap();
    let _peer = h.server.accept().await.unwrap();
    wait_for_state(&h.channel, ConnectionState::Connected).await;

    h.session.teardown();
    assert_eq!(h.channel.state(), ConnectionState::Disconnected);

    // Reconnect by hand: events no longer reach the session.
    h.channel.connect();
    let peer = h.server.accept().await.unwrap();
    wait_for_state(&h.channel, ConnectionState::Connected).await;
    let (tx, mut seen) = tokio::sync::mpsc::unbounded_channel();
    let _tap = h.channel.subscribe("account_locked", move |_| {
        let _ = tx.send(());
    });
    peer.send_frame(&account_locked());
    seen.recv().await.unwrap();

    assert!(!h.session.is_locked());
    h.channel.disconnect();
}
