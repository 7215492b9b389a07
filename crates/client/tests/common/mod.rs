#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cms_admin_client::ws::{MemoryConnector, MemoryServer};
use cms_admin_client::{AuthBackend, AuthError, ConnectionState, NotificationChannel, ReconnectConfig};
use cms_admin_shared::{Credentials, Identity, InboundFrame, Role};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;
use url::Url;

pub const WS_URL: &str = "ws://localhost:8080/api/v1/ws";

/// Channel over an in-memory connector.
pub fn memory_channel() -> (NotificationChannel, MemoryConnector, MemoryServer) {
    memory_channel_with(ReconnectConfig::default())
}

pub fn memory_channel_with(
    reconnect: ReconnectConfig,
) -> (NotificationChannel, MemoryConnector, MemoryServer) {
    let (connector, server) = MemoryConnector::new();
    let channel = NotificationChannel::new(Url::parse(WS_URL).unwrap(), connector.clone(), reconnect);
    (channel, connector, server)
}

/// Wait (bounded) until `rx` holds a value matching `pred`.
pub async fn wait_until<T>(rx: &mut watch::Receiver<T>, pred: impl FnMut(&T) -> bool) {
    tokio::time::timeout(Duration::from_secs(120), rx.wait_for(pred))
        .await
        .expect("timed out waiting for state")
        .expect("sender dropped");
}

pub async fn wait_for_state(channel: &NotificationChannel, state: ConnectionState) {
    let mut rx = channel.state_changes();
    wait_until(&mut rx, |s| *s == state).await;
}

pub fn frame(event_type: &str, payload: Value) -> InboundFrame {
    InboundFrame::new(event_type, payload)
}

pub fn role_updated() -> InboundFrame {
    frame("role_updated", json!({}))
}

pub fn account_locked() -> InboundFrame {
    frame("account_locked", json!({}))
}

pub fn identity(id: &str, roles: &[&str]) -> Identity {
    Identity {
        id: id.to_string(),
        email: format!("{id}@example.com"),
        full_name: id.to_uppercase(),
        roles: roles
            .iter()
            .map(|name| Role {
                id: format!("role-{}", name.to_lowercase()),
                name: name.to_string(),
                description: String::new(),
            })
            .collect(),
        avatar_url: None,
        last_login_at: None,
    }
}

pub fn role_names(identity: &Identity) -> Vec<&str> {
    identity.role_names().collect()
}

/// Backend whose answers the test controls.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    inner: Arc<Mutex<Script>>,
}

#[derive(Default)]
struct Script {
    /// What the server currently thinks of the session; `None` is a 401.
    current: Option<Identity>,
    /// Errors returned by the next fetches, before `current` is consulted.
    failures: VecDeque<AuthError>,
    /// Identity a successful login yields.
    account: Option<Identity>,
    fetch_delay: Option<Duration>,
    fetches: usize,
    logins: usize,
    logouts: usize,
}

impl ScriptedBackend {
    pub fn signed_in(identity: Identity) -> Self {
        let backend = Self::default();
        backend.set_identity(Some(identity));
        backend
    }

    pub fn set_identity(&self, identity: Option<Identity>) {
        self.inner.lock().current = identity;
    }

    pub fn set_account(&self, identity: Identity) {
        self.inner.lock().account = Some(identity);
    }

    pub fn fail_next(&self, err: AuthError) {
        self.inner.lock().failures.push_back(err);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.inner.lock().fetch_delay = Some(delay);
    }

    pub fn fetches(&self) -> usize {
        self.inner.lock().fetches
    }

    pub fn logins(&self) -> usize {
        self.inner.lock().logins
    }

    pub fn logouts(&self) -> usize {
        self.inner.lock().logouts
    }
}

#[async_trait]
impl AuthBackend for ScriptedBackend {
    async fn fetch_identity(&self) -> Result<Identity, AuthError> {
        let delay = {
            let mut script = self.inner.lock();
            script.fetches += 1;
            script.fetch_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.inner.lock();
        if let Some(err) = script.failures.pop_front() {
            return Err(err);
        }
        script.current.clone().ok_or(AuthError::Unauthenticated)
    }

    async fn login(&self, credentials: &Credentials) -> Result<Identity, AuthError> {
        let mut script = self.inner.lock();
        script.logins += 1;
        match script.account.clone() {
            Some(identity) if credentials.password == "correct horse" => {
                script.current = Some(identity.clone());
                Ok(identity)
            }
            _ => Err(AuthError::InvalidCredentials("invalid credentials".into())),
        }
    }

    async fn logout(&self) -> Result<(), AuthError> {
        let mut script = self.inner.lock();
        script.logouts += 1;
        script.current = None;
        Ok(())
    }
}
