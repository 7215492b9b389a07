//! Real-time notification channel.
//!
//! This module provides:
//! - A single WebSocket connection with auto-reconnect (exponential backoff)
//! - A publish/subscribe registry keyed by inbound event type
//! - Room membership layered on the same socket
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              NotificationChannel             │
//! │   (state watch, subscriber registry, send)   │
//! └──────────────────────────────────────────────┘
//!            │                        ▲
//!            ▼                        │ frames
//!   ┌─────────────────┐      ┌─────────────────┐
//!   │  driver task    │─────▶│   Connector     │
//!   │ (reconnect loop)│      │ (tungstenite /  │
//!   └─────────────────┘      │  in-memory)     │
//!            │               └─────────────────┘
//!            ▼
//!   ┌─────────────────┬─────────────────┬────────────────┐
//!   │ SessionAuthority│ PresenceTracker │ RoomMembership │
//!   └─────────────────┴─────────────────┴────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let channel = NotificationChannel::new(ws_url, TungsteniteConnector::new(), ReconnectConfig::default());
//! let sub = channel.subscribe_event(|status: UserStatus| {
//!     tracing::info!(user = %status.user_id, "status changed");
//! });
//! channel.connect();
//! // ...
//! sub.unsubscribe();
//! channel.disconnect();
//! ```

mod channel;
mod connection;
mod connector;
pub mod memory;
mod registry;
mod rooms;

pub use channel::{ChannelError, NotificationChannel};
pub use connection::{ConnectionState, ReconnectConfig};
pub use connector::{
    CloseFrame, Connector, FrameSink, FrameStream, Link, TransportError, TungsteniteConnector,
    WireFrame,
};
pub use memory::{Admission, MemoryConnector, MemoryPeer, MemoryServer};
pub use registry::{Callback, Subscription};
pub use rooms::RoomMembership;
