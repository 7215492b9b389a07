//! Read models derived from channel events.

pub mod presence;

pub use presence::PresenceTracker;
