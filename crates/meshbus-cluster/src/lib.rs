//! Membership, dispatch, and routing for the meshbus message bus.
//!
//! The [`MembershipRegistry`] is the shared directory of members and their
//! topic subscriptions. The [`ClusterService`] ties it to the wire layer:
//! outbound messages are wrapped into envelopes and sent to every member
//! registered for the topic, inbound envelopes are fanned out to local
//! subscribers through the [`Dispatcher`].

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod local;
pub mod registry;
pub mod service;

pub use config::load_config;
pub use dispatcher::{Dispatcher, Subscription};
pub use error::{ClusterError, ClusterResult};
pub use local::LocalMember;
pub use registry::{MembershipEvent, MembershipRegistry, UpsertOutcome};
pub use service::ClusterService;
