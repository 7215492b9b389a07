//! Presence store: ids of users currently online.
//!
//! Purely event driven. The set is only meaningful while the channel is
//! connected: once the connection drops it reads as empty, and data learned
//! on an earlier connection is discarded when the next event arrives.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cms_admin_shared::{OnlineList, PresenceStatus, UserStatus};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::ws::{ConnectionState, NotificationChannel, Subscription};

#[derive(Clone, Default)]
pub struct PresenceTracker {
    online: Arc<RwLock<OnlineSet>>,
    wiring: Arc<Mutex<Option<Wiring>>>,
}

/// Ids plus the connection they were learned on.
#[derive(Default)]
struct OnlineSet {
    epoch: u64,
    ids: HashSet<String>,
}

struct Wiring {
    subscriptions: Vec<Subscription>,
    state: watch::Receiver<ConnectionState>,
    epoch: Arc<AtomicU64>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole set (`online_list`).
    pub fn replace(&self, list: OnlineList) {
        let epoch = self.current_epoch();
        let mut online = self.online.write();
        online.epoch = epoch;
        online.ids = list.user_ids.into_iter().collect();
        tracing::debug!(online = online.ids.len(), "presence list replaced");
    }

    /// Add or remove one user (`user_status`).
    pub fn apply(&self, status: UserStatus) {
        let epoch = self.current_epoch();
        let mut online = self.online.write();
        if online.epoch != epoch {
            // Learned on an earlier connection; start over.
            online.ids.clear();
            online.epoch = epoch;
        }
        match status.status {
            PresenceStatus::Online => {
                online.ids.insert(status.user_id);
            }
            PresenceStatus::Offline => {
                online.ids.remove(&status.user_id);
            }
        }
    }

    pub fn clear(&self) {
        self.online.write().ids.clear();
    }

    fn current_epoch(&self) -> u64 {
        self.wiring
            .lock()
            .as_ref()
            .map_or(0, |w| w.epoch.load(Ordering::SeqCst))
    }

    /// The set is only trusted while the attached channel is connected, and
    /// only if it was learned on the current connection.
    fn trusted(&self, online: &OnlineSet) -> bool {
        match &*self.wiring.lock() {
            Some(wiring) => {
                wiring.state.borrow().is_connected()
                    && online.epoch == wiring.epoch.load(Ordering::SeqCst)
            }
            None => true,
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        let online = self.online.read();
        self.trusted(&online) && online.ids.contains(user_id)
    }

    pub fn snapshot(&self) -> HashSet<String> {
        let online = self.online.read();
        if !self.trusted(&online) {
            return HashSet::new();
        }
        online.ids.clone()
    }

    pub fn len(&self) -> usize {
        let online = self.online.read();
        if !self.trusted(&online) {
            return 0;
        }
        online.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to presence events on `channel`. While attached, reads
    /// return nothing unless the channel is connected and the data came from
    /// the current connection. Replaces any previous wiring.
    pub fn attach(&self, channel: &NotificationChannel) {
        self.detach();

        let for_list = self.clone();
        let list_sub = channel.subscribe_event(move |list: OnlineList| for_list.replace(list));
        let for_status = self.clone();
        let status_sub = channel.subscribe_event(move |status: UserStatus| for_status.apply(status));

        *self.wiring.lock() = Some(Wiring {
            subscriptions: vec![list_sub, status_sub],
            state: channel.state_changes(),
            epoch: channel.epoch_handle(),
        });
        self.clear();
    }

    pub fn detach(&self) {
        if let Some(wiring) = self.wiring.lock().take() {
            for sub in wiring.subscriptions {
                sub.unsubscribe();
            }
        }
    }
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("online", &self.len())
            .finish()
    }
}
