//! # hearth-shared
//!
//! Types shared by the Hearth messaging store and server: identifiers,
//! closed enums, domain models and the JSON wire protocol.

pub mod constants;
pub mod error;
pub mod models;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
