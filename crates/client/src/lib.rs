//! CMS admin client: the real-time session layer of the admin dashboard.
//!
//! One [`NotificationChannel`] per session carries server events. The
//! [`SessionAuthority`] owns the current identity and reacts to lock and
//! role-change events, the [`PresenceTracker`] mirrors who is online, and
//! [`RoomMembership`] scopes broadcasts to the views that need them.

pub mod api_client;
pub mod auth_session;
pub mod config;
pub mod logging;
pub mod stores;
pub mod ws;

pub use api_client::ApiClient;
pub use auth_session::{
    AuthBackend, AuthError, HttpAuthBackend, MemoryNavigator, Navigator, PermissionChange,
    SessionAuthority, SessionConfig, SessionError, SessionPhase, Visit,
};
pub use config::{ClientConfig, ConfigError};
pub use stores::PresenceTracker;
pub use ws::{ConnectionState, NotificationChannel, ReconnectConfig, RoomMembership, TungsteniteConnector};
