//! Core types and traits for the meshbus publish/subscribe bus.
//!
//! This crate defines the data structures shared by the wire codec, the
//! connection manager, and the membership registry. It contains no I/O.

pub mod config;
pub mod envelope;
pub mod error;
pub mod member;

pub use config::BusConfig;
pub use envelope::Envelope;
pub use error::{BusError, BusResult};
pub use member::{Member, MemberCore, MemberKey, MemberSnapshot, MemberStatus, StatusObserver};
