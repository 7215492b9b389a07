//! Shared types for the CMS admin client: wire protocol, identity models and
//! the API error envelope.

pub mod models;
pub mod protocol;
pub mod error;

pub use models::*;
pub use protocol::*;
pub use error::*;
