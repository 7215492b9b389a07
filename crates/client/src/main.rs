//! cms-admin-watch: follows the admin notification stream from a terminal.
//!
//! Loads the session from the cookie jar or logs in with
//! `CMS_ADMIN_EMAIL`/`CMS_ADMIN_PASSWORD`, optionally joins the rooms listed in
//! `CMS_ADMIN_ROOMS`, and logs session, connection and presence changes until
//! Ctrl-C or an account lock.

use anyhow::{bail, Context};
use cms_admin_client::{
    logging, ApiClient, ClientConfig, HttpAuthBackend, MemoryNavigator, NotificationChannel,
    PermissionChange, RoomMembership, SessionAuthority, SessionPhase, TungsteniteConnector,
};
use cms_admin_shared::{Credentials, InboundFrame, ServerEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init(logging::DEFAULT_FILTER);

    let config = ClientConfig::from_env().context("invalid configuration")?;
    let api = ApiClient::new(config.api_url.clone()).context("failed to build HTTP client")?;
    let connector = TungsteniteConnector::new().with_cookies(api.cookie_jar());
    let channel = NotificationChannel::new(config.ws_url(), connector, config.reconnect.clone());
    let navigator = MemoryNavigator::new(config.session.privileged_path_prefix.clone());
    let session = SessionAuthority::new(
        config.session.clone(),
        HttpAuthBackend::new(api),
        navigator,
        channel.clone(),
    );

    let traces: Vec<_> = ServerEvent::TYPES
        .into_iter()
        .map(|event_type| {
            channel.subscribe(event_type, move |payload| {
                match ServerEvent::decode(&InboundFrame::new(event_type, payload.clone())) {
                    Ok(Some(event)) => tracing::info!(?event, "server event"),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(event_type, error = %e, "undecodable server event"),
                }
            })
        })
        .collect();

    if let Err(e) = session.init().await {
        tracing::warn!(error = %e, "could not load the current session");
    }
    if session.identity().is_none() {
        match (
            std::env::var("CMS_ADMIN_EMAIL"),
            std::env::var("CMS_ADMIN_PASSWORD"),
        ) {
            (Ok(email), Ok(password)) => {
                session
                    .login(&Credentials { email, password })
                    .await
                    .context("login failed")?;
            }
            _ => bail!("not logged in; set CMS_ADMIN_EMAIL and CMS_ADMIN_PASSWORD"),
        }
    }
    if let Some(identity) = session.identity() {
        tracing::info!(user = %identity.email, roles = ?identity.role_names().collect::<Vec<_>>(), "session ready");
    }

    let rooms = RoomMembership::new(channel.clone());
    let room_ids: Vec<String> = std::env::var("CMS_ADMIN_ROOMS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect();
    for room in &room_ids {
        rooms.join(room);
    }

    let mut phases = session.phase_changes();
    let mut states = channel.state_changes();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            changed = phases.changed() => {
                if changed.is_err() {
                    break;
                }
                let phase = *phases.borrow_and_update();
                tracing::info!(?phase, "session phase");
                match phase {
                    SessionPhase::Locked => {
                        tracing::warn!("account locked; logging out");
                        session.logout().await;
                        break;
                    }
                    SessionPhase::PermissionPending(change) => {
                        if change == PermissionChange::Demoted {
                            tracing::warn!("privileged roles revoked; leaving the admin area");
                        }
                        if let Err(e) = session.acknowledge_permission_change().await {
                            tracing::warn!(error = %e, "refresh after acknowledgement failed");
                        }
                    }
                    SessionPhase::Unauthenticated => {
                        tracing::warn!("session ended");
                        break;
                    }
                    SessionPhase::Authenticated => {}
                }
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                tracing::info!(
                    ?state,
                    online = session.online_users().len(),
                    attempts = channel.reconnect_attempts(),
                    "notification channel"
                );
            }
        }
    }

    for room in &room_ids {
        rooms.leave(room);
    }
    for trace in traces {
        trace.unsubscribe();
    }
    session.teardown();
    Ok(())
}
