//! The notification channel: one logical WebSocket with auto-reconnect and a
//! type-keyed subscriber registry.
//!
//! A background driver task owns the socket. It is spawned by
//! [`NotificationChannel::connect`] and lives until the server closes the
//! socket normally, the reconnect budget runs out, or
//! [`NotificationChannel::disconnect`] is called. Every driver carries a
//! generation number; once `disconnect` bumps the generation, a stale driver
//! can no longer touch the channel state.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use cms_admin_shared::{ClientAction, EventPayload, InboundFrame, ABNORMAL_CLOSURE, NORMAL_CLOSURE};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use url::Url;

use super::connection::{ConnectionState, ReconnectConfig};
use super::connector::{CloseFrame, Connector, Link, WireFrame};
use super::registry::{self, SharedRegistry, Subscription};

/// Close status reported when a close frame carries no code.
const NO_STATUS_RECEIVED: u16 = 1005;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("notification channel is not connected")]
    NotConnected,
    #[error("failed to encode outbound frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Handle to the notification channel. Clones share the same socket.
#[derive(Clone)]
pub struct NotificationChannel {
    inner: Arc<Inner>,
}

struct Inner {
    url: Url,
    reconnect: ReconnectConfig,
    connector: Arc<dyn Connector>,
    registry: SharedRegistry,
    state: watch::Sender<ConnectionState>,
    attempts: AtomicU32,
    /// Number of successful opens.
    epoch: Arc<AtomicU64>,
    control: Mutex<Control>,
}

#[derive(Default)]
struct Control {
    generation: u64,
    driver: Option<Driver>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

struct Driver {
    shutdown: watch::Sender<bool>,
    wake: Arc<Notify>,
}

/// How a socket ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Close {
    /// `disconnect()` was called.
    Teardown,
    /// The server closed with code 1000.
    Normal,
    /// Anything else, including failed connection attempts.
    Abnormal(u16),
}

impl NotificationChannel {
    pub fn new(url: Url, connector: impl Connector, reconnect: ReconnectConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                url,
                reconnect,
                connector: Arc::new(connector),
                registry: SharedRegistry::default(),
                state,
                attempts: AtomicU32::new(0),
                epoch: Arc::new(AtomicU64::new(0)),
                control: Mutex::new(Control::default()),
            }),
        }
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Observe state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Consecutive failed attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Number of times the socket has opened. Data derived from channel
    /// events can be tagged with it to detect reconnects.
    pub fn connection_epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn epoch_handle(&self) -> Arc<AtomicU64> {
        self.inner.epoch.clone()
    }

    /// Open the socket. No-op while connecting or connected; while a reconnect
    /// is pending it skips the remaining delay.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut control = self.inner.control.lock();
        if self.state().is_active() {
            tracing::debug!("connect: already {:?}", self.state());
            return;
        }
        if let Some(driver) = &control.driver {
            tracing::debug!("connect: cutting reconnect delay short");
            driver.wake.notify_one();
            return;
        }

        control.generation += 1;
        let generation = control.generation;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let wake = Arc::new(Notify::new());
        control.driver = Some(Driver {
            shutdown,
            wake: wake.clone(),
        });
        self.inner.set_state(ConnectionState::Connecting);
        drop(control);

        tracing::info!(url = %self.inner.url, "opening notification channel");
        tokio::spawn(run_driver(self.inner.clone(), generation, shutdown_rx, wake));
    }

    /// Close the socket with a normal closure and cancel any pending
    /// reconnect. Nothing reconnects after this returns.
    pub fn disconnect(&self) {
        let mut control = self.inner.control.lock();
        control.generation += 1;
        control.outbound = None;
        if let Some(driver) = control.driver.take() {
            driver.shutdown.send_replace(true);
        }
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Disconnected);
        tracing::info!("notification channel torn down");
    }

    /// Register `callback` for frames whose `type` equals `event_type`.
    /// Callbacks run in registration order on the driver task.
    pub fn subscribe(
        &self,
        event_type: &str,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Subscription {
        registry::subscribe(&self.inner.registry, event_type, Arc::new(callback))
    }

    /// Typed variant of [`subscribe`](Self::subscribe). Payloads that do not
    /// decode are logged and skipped.
    pub fn subscribe_event<E: EventPayload>(
        &self,
        callback: impl Fn(E) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(E::EVENT_TYPE, move |payload| match E::from_payload(payload) {
            Ok(event) => callback(event),
            Err(e) => {
                tracing::warn!(event_type = E::EVENT_TYPE, error = %e, "undecodable event payload");
            }
        })
    }

    /// Send an action. Only succeeds while connected; nothing is buffered.
    pub fn send(&self, action: &ClientAction) -> Result<(), ChannelError> {
        let text = serde_json::to_string(action)?;
        let control = self.inner.control.lock();
        if !self.state().is_connected() {
            return Err(ChannelError::NotConnected);
        }
        let outbound = control.outbound.as_ref().ok_or(ChannelError::NotConnected)?;
        outbound.send(text).map_err(|_| ChannelError::NotConnected)?;
        tracing::debug!(action = action.name(), "queued outbound action");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn dispatch_text(&self, text: &str) {
        self.inner.dispatch(text);
    }
}

impl std::fmt::Debug for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationChannel")
            .field("url", &self.inner.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    /// Callers hold the control lock, so state changes are ordered with
    /// generation bumps.
    fn set_state(&self, new: ConnectionState) {
        self.state.send_if_modified(|state| {
            if *state == new {
                false
            } else {
                *state = new;
                true
            }
        });
    }

    fn connecting(&self, generation: u64) -> bool {
        let control = self.control.lock();
        if control.generation != generation {
            return false;
        }
        self.set_state(ConnectionState::Connecting);
        true
    }

    fn opened(&self, generation: u64) -> Option<mpsc::UnboundedReceiver<String>> {
        let mut control = self.control.lock();
        if control.generation != generation {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        control.outbound = Some(tx);
        self.attempts.store(0, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        Some(rx)
    }

    /// Record a closed socket. When `retire` is set the driver gives up its
    /// slot so the next `connect()` spawns a fresh one.
    fn closed(&self, generation: u64, retire: bool) -> bool {
        let mut control = self.control.lock();
        if control.generation != generation {
            return false;
        }
        control.outbound = None;
        if retire {
            control.driver = None;
        }
        self.set_state(ConnectionState::Disconnected);
        true
    }

    fn dispatch(&self, text: &str) {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed notification frame");
                return;
            }
        };

        let callbacks = self.registry.lock().callbacks_for(&frame.event_type);
        if callbacks.is_empty() {
            tracing::debug!(event_type = %frame.event_type, "no subscribers for event");
            return;
        }
        for callback in callbacks {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&frame.payload)));
            if outcome.is_err() {
                tracing::error!(event_type = %frame.event_type, "subscriber panicked during dispatch");
            }
        }
    }
}

async fn run_driver(
    inner: Arc<Inner>,
    generation: u64,
    mut shutdown: watch::Receiver<bool>,
    wake: Arc<Notify>,
) {
    loop {
        if !inner.connecting(generation) {
            return;
        }

        let result = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            result = inner.connector.connect(&inner.url) => result,
        };

        let close = match result {
            Ok(link) => {
                let Some(outbound) = inner.opened(generation) else {
                    return;
                };
                tracing::info!(url = %inner.url, "notification channel connected");
                pump(&inner, link, outbound, &mut shutdown).await
            }
            Err(e) => {
                tracing::warn!(url = %inner.url, error = %e, "notification channel connect failed");
                Close::Abnormal(ABNORMAL_CLOSURE)
            }
        };

        let attempt = inner.attempts.load(Ordering::SeqCst);
        let reconnect = match close {
            Close::Teardown => return,
            Close::Normal => false,
            Close::Abnormal(_) => inner.reconnect.allows(attempt),
        };
        if !inner.closed(generation, !reconnect) {
            return;
        }

        match close {
            Close::Normal => {
                tracing::info!("notification channel closed normally");
                return;
            }
            Close::Abnormal(code) if !reconnect => {
                tracing::error!(
                    code,
                    attempts = attempt,
                    "notification channel lost; reconnect attempts exhausted"
                );
                return;
            }
            Close::Abnormal(code) => {
                let delay = inner.reconnect.delay_for_attempt(attempt);
                inner.attempts.store(attempt + 1, Ordering::SeqCst);
                tracing::info!(
                    code,
                    delay_ms = delay.as_millis() as u64,
                    attempt = attempt + 1,
                    "notification channel closed; scheduling reconnect"
                );
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => return,
                    _ = wake.notified() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Close::Teardown => return,
        }
    }
}

/// Shuttle frames between the socket and the channel until it closes.
async fn pump(
    inner: &Inner,
    link: Link,
    mut outbound: mpsc::UnboundedReceiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> Close {
    let Link {
        mut sink,
        mut stream,
    } = link;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if let Err(e) = sink.send(WireFrame::Close(Some(CloseFrame::normal()))).await {
                    tracing::debug!(error = %e, "close frame not delivered");
                }
                let _ = sink.close().await;
                return Close::Teardown;
            }
            frame = stream.next() => match frame {
                Some(Ok(WireFrame::Text(text))) => inner.dispatch(&text),
                Some(Ok(WireFrame::Close(frame))) => {
                    let code = frame.map_or(NO_STATUS_RECEIVED, |f| f.code);
                    return if code == NORMAL_CLOSURE {
                        Close::Normal
                    } else {
                        Close::Abnormal(code)
                    };
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "notification channel read error");
                    return Close::Abnormal(ABNORMAL_CLOSURE);
                }
                None => return Close::Abnormal(ABNORMAL_CLOSURE),
            },
            Some(text) = outbound.recv() => {
                if let Err(e) = sink.send(WireFrame::Text(text)).await {
                    tracing::warn!(error = %e, "notification channel write error");
                    return Close::Abnormal(ABNORMAL_CLOSURE);
                }
            }
        }
    }
}
