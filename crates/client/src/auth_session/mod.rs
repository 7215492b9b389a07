//! Session authority: who the current user is, and what happens when the
//! server says that changed.
//!
//! The authority owns the committed identity and ties the notification
//! channel's lifecycle to it: the channel opens when an identity appears and
//! is torn down when it goes away or the account is locked. Two server
//! events drive it:
//!
//! - `account_locked` locks the session until logout.
//! - `role_updated` re-fetches the identity and diffs its privileged roles
//!   against the identity committed when the refresh started. Losing all
//!   privileged roles while inside the privileged area withholds the new
//!   identity behind a demotion notice; gaining one outside of it commits
//!   and shows a promotion notice.

mod backend;
mod navigator;

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use cms_admin_shared::{AccountLocked, Credentials, Identity, RoleUpdated};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::stores::PresenceTracker;
use crate::ws::{NotificationChannel, Subscription};

pub use backend::{AuthBackend, AuthError, HttpAuthBackend};
pub use navigator::{MemoryNavigator, Navigator, Visit};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Holding any of these grants access to the privileged area.
    pub privileged_roles: Vec<String>,
    pub privileged_path_prefix: String,
    pub home_route: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            privileged_roles: vec!["ADMIN".into(), "EDITOR".into(), "AUTHOR".into()],
            privileged_path_prefix: "/admin".into(),
            home_route: "/".into(),
        }
    }
}

impl SessionConfig {
    pub fn is_privileged(&self, identity: &Identity) -> bool {
        identity.has_any_role(&self.privileged_roles)
    }

    pub fn is_privileged_path(&self, path: &str) -> bool {
        let prefix = self.privileged_path_prefix.trim_end_matches('/');
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with(['/', '?', '#']),
            None => false,
        }
    }

    /// Interstitial owed for moving from `previous` to `next` while at `path`.
    fn permission_change(
        &self,
        previous: Option<&Identity>,
        next: &Identity,
        path: &str,
    ) -> Option<PermissionChange> {
        let previous = previous?;
        let in_area = self.is_privileged_path(path);
        match (self.is_privileged(previous), self.is_privileged(next)) {
            (true, false) if in_area => Some(PermissionChange::Demoted),
            (false, true) if !in_area => Some(PermissionChange::Promoted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionChange {
    /// Informational; the new identity is already committed.
    Promoted,
    /// Blocking; the new identity is withheld until acknowledged.
    Demoted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionPhase {
    #[default]
    Unauthenticated,
    Authenticated,
    /// Blocked until logout.
    Locked,
    PermissionPending(PermissionChange),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("identity refresh failed: {0}")]
    Refresh(#[source] AuthError),
    #[error("login failed: {0}")]
    Login(#[source] AuthError),
}

/// Shared handle to the session. Clones see the same session.
#[derive(Clone)]
pub struct SessionAuthority {
    inner: Arc<Inner>,
}

struct Inner {
    config: SessionConfig,
    backend: Arc<dyn AuthBackend>,
    navigator: Arc<dyn Navigator>,
    channel: NotificationChannel,
    presence: PresenceTracker,
    session: Mutex<Session>,
    phase: watch::Sender<SessionPhase>,
    /// Serializes refreshes so each diffs against a settled identity.
    refresh_lock: tokio::sync::Mutex<()>,
    subscriptions: Mutex<Vec<Subscription>>,
}

#[derive(Debug, Default)]
struct Session {
    identity: Option<Identity>,
    locked: bool,
    pending: Option<PermissionChange>,
    /// Bumped by login and logout; a refresh that started under an older
    /// generation does not commit.
    generation: u64,
}

impl Session {
    fn phase(&self) -> SessionPhase {
        if self.locked {
            SessionPhase::Locked
        } else if let Some(change) = self.pending {
            SessionPhase::PermissionPending(change)
        } else if self.identity.is_some() {
            SessionPhase::Authenticated
        } else {
            SessionPhase::Unauthenticated
        }
    }
}

impl SessionAuthority {
    pub fn new(
        config: SessionConfig,
        backend: impl AuthBackend,
        navigator: impl Navigator,
        channel: NotificationChannel,
    ) -> Self {
        let (phase, _) = watch::channel(SessionPhase::Unauthenticated);
        Self {
            inner: Arc::new(Inner {
                config,
                backend: Arc::new(backend),
                navigator: Arc::new(navigator),
                channel,
                presence: PresenceTracker::new(),
                session: Mutex::new(Session::default()),
                phase,
                refresh_lock: tokio::sync::Mutex::new(()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn channel(&self) -> &NotificationChannel {
        &self.inner.channel
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.inner.presence
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.session.lock().identity.clone()
    }

    pub fn phase(&self) -> SessionPhase {
        *self.inner.phase.borrow()
    }

    pub fn phase_changes(&self) -> watch::Receiver<SessionPhase> {
        self.inner.phase.subscribe()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.session.lock().locked
    }

    pub fn pending_permission_change(&self) -> Option<PermissionChange> {
        self.inner.session.lock().pending
    }

    pub fn online_users(&self) -> HashSet<String> {
        self.inner.presence.snapshot()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.inner.presence.is_online(user_id)
    }

    /// Wire channel handlers (once) and load the identity.
    pub async fn init(&self) -> Result<(), SessionError> {
        self.register_handlers();
        self.refresh_identity().await
    }

    fn register_handlers(&self) {
        let mut subscriptions = self.inner.subscriptions.lock();
        if !subscriptions.is_empty() {
            return;
        }
        let channel = &self.inner.channel;

        let weak = Arc::downgrade(&self.inner);
        subscriptions.push(channel.subscribe_event(move |_: AccountLocked| {
            if let Some(authority) = upgrade(&weak) {
                authority.lock_session();
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        subscriptions.push(channel.subscribe_event(move |_: RoleUpdated| {
            let Some(authority) = upgrade(&weak) else {
                return;
            };
            tokio::spawn(async move {
                if let Err(e) = authority.refresh_identity().await {
                    tracing::warn!(error = %e, "refresh after role update failed");
                }
            });
        }));
        drop(subscriptions);

        self.inner.presence.attach(channel);
    }

    /// Re-fetch the identity and commit it, unless it is a demotion that has
    /// to be acknowledged first. Skipped while locked.
    ///
    /// A confirmed "not authenticated" answer clears the session. Any other
    /// failure keeps an existing identity and is returned.
    pub async fn refresh_identity(&self) -> Result<(), SessionError> {
        let _serial = self.inner.refresh_lock.lock().await;

        let (previous, generation) = {
            let session = self.inner.session.lock();
            if session.locked {
                tracing::debug!("session locked; refresh skipped");
                return Ok(());
            }
            (session.identity.clone(), session.generation)
        };

        let fetched = self.inner.backend.fetch_identity().await;
        let path = self.inner.navigator.current_path();

        let mut session = self.inner.session.lock();
        if session.generation != generation || session.locked {
            tracing::debug!("session changed during refresh; result discarded");
            return Ok(());
        }
        let was_present = session.identity.is_some();

        let outcome = match fetched {
            Ok(identity) => {
                match self
                    .inner
                    .config
                    .permission_change(previous.as_ref(), &identity, &path)
                {
                    Some(PermissionChange::Demoted) => {
                        if session.pending == Some(PermissionChange::Demoted) {
                            tracing::debug!("demotion already pending");
                        } else {
                            tracing::info!(user = %identity.id, %path, "privileged roles revoked; awaiting acknowledgement");
                            session.pending = Some(PermissionChange::Demoted);
                        }
                    }
                    Some(PermissionChange::Promoted) => {
                        tracing::info!(user = %identity.id, "privileged role granted");
                        session.identity = Some(identity);
                        if session.pending.is_none() {
                            session.pending = Some(PermissionChange::Promoted);
                        }
                    }
                    None => {
                        if session.pending == Some(PermissionChange::Demoted)
                            && self.inner.config.is_privileged(&identity)
                        {
                            tracing::info!(user = %identity.id, "privileged role restored; demotion withdrawn");
                            session.pending = None;
                        }
                        session.identity = Some(identity);
                    }
                }
                Ok(())
            }
            Err(AuthError::Unauthenticated) => {
                if was_present {
                    tracing::info!("session expired");
                }
                session.identity = None;
                session.pending = None;
                Ok(())
            }
            Err(e) if was_present => {
                tracing::warn!(error = %e, "identity refresh failed; keeping current session");
                Err(SessionError::Refresh(e))
            }
            Err(e) => {
                tracing::warn!(error = %e, "identity fetch failed");
                Err(SessionError::Refresh(e))
            }
        };

        let now_present = session.identity.is_some();
        self.publish(&session);
        drop(session);

        self.sync_channel(was_present, now_present);
        outcome
    }

    /// Dismiss the pending interstitial. A demotion moves the user to the
    /// home route and then commits the withheld identity via a fresh refresh.
    pub async fn acknowledge_permission_change(&self) -> Result<(), SessionError> {
        let change = {
            let mut session = self.inner.session.lock();
            let change = session.pending.take();
            self.publish(&session);
            change
        };

        match change {
            Some(PermissionChange::Demoted) => {
                self.inner.navigator.navigate(&self.inner.config.home_route);
                self.refresh_identity().await
            }
            Some(PermissionChange::Promoted) | None => Ok(()),
        }
    }

    /// Start a fresh session. The returned identity is committed as is.
    pub async fn login(&self, credentials: &Credentials) -> Result<(), SessionError> {
        let identity = self
            .inner
            .backend
            .login(credentials)
            .await
            .map_err(SessionError::Login)?;
        tracing::info!(user = %identity.id, "logged in");

        let switched_user = {
            let mut session = self.inner.session.lock();
            let switched = session
                .identity
                .as_ref()
                .is_some_and(|current| current.id != identity.id);
            session.generation += 1;
            session.identity = Some(identity);
            session.locked = false;
            session.pending = None;
            self.publish(&session);
            switched
        };

        if switched_user {
            self.inner.channel.disconnect();
            self.inner.presence.clear();
        }
        self.inner.channel.connect();
        Ok(())
    }

    /// End the session. A failed logout request is logged; local state is
    /// cleared regardless and the user is sent home with a full reload.
    pub async fn logout(&self) {
        if let Err(e) = self.inner.backend.logout().await {
            tracing::warn!(error = %e, "logout request failed");
        }

        {
            let mut session = self.inner.session.lock();
            session.generation += 1;
            session.identity = None;
            session.locked = false;
            session.pending = None;
            self.publish(&session);
        }

        self.inner.channel.disconnect();
        self.inner.presence.clear();
        self.inner
            .navigator
            .hard_redirect(&self.inner.config.home_route);
        tracing::info!("logged out");
    }

    /// Drop channel handlers and close the channel.
    pub fn teardown(&self) {
        let subscriptions = std::mem::take(&mut *self.inner.subscriptions.lock());
        for sub in subscriptions {
            sub.unsubscribe();
        }
        self.inner.presence.detach();
        self.inner.channel.disconnect();
    }

    fn lock_session(&self) {
        {
            let mut session = self.inner.session.lock();
            if session.locked {
                return;
            }
            session.locked = true;
            self.publish(&session);
        }
        tracing::warn!("account locked by the server");
        self.inner.channel.disconnect();
        self.inner.presence.clear();
    }

    fn publish(&self, session: &Session) {
        let next = session.phase();
        self.inner.phase.send_if_modified(|phase| {
            if *phase == next {
                false
            } else {
                tracing::debug!(from = ?*phase, to = ?next, "session phase changed");
                *phase = next;
                true
            }
        });
    }

    fn sync_channel(&self, was_present: bool, now_present: bool) {
        match (was_present, now_present) {
            (false, true) => self.inner.channel.connect(),
            (true, false) => {
                self.inner.channel.disconnect();
                self.inner.presence.clear();
            }
            _ => {}
        }
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<SessionAuthority> {
    weak.upgrade().map(|inner| SessionAuthority { inner })
}

impl std::fmt::Debug for SessionAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAuthority")
            .field("phase", &self.phase())
            .field("channel", &self.inner.channel)
            .finish()
    }
}
