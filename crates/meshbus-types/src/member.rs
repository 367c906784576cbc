//! Member identity, status state machine, and the shared per-member state.
//!
//! Every participant on the bus is a [`Member`]. The data all members carry
//! (sequence, status, tags, public key) lives in a [`MemberCore`], which
//! applies status transitions and sequence increments under a single lock so
//! that a status change is never observed without its sequence bump.

use crate::envelope::Envelope;
use crate::error::{BusError, BusResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::RwLock;

/// Canonical member identity: `a.b.c.d:commandPort:dataPort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MemberKey {
    /// IPv4 address of the member.
    pub ip: Ipv4Addr,
    /// Port the member accepts command connections on (also used for gossip).
    pub command_port: u16,
    /// Port the member advertises for data.
    pub data_port: u16,
}

impl MemberKey {
    /// Build a key from its parts.
    pub fn new(ip: Ipv4Addr, command_port: u16, data_port: u16) -> Self {
        Self {
            ip,
            command_port,
            data_port,
        }
    }

    /// Socket address of the command endpoint.
    pub fn command_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::from((self.ip, self.command_port))
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.ip, self.command_port, self.data_port)
    }
}

impl FromStr for MemberKey {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| BusError::InvalidMemberKey {
            key: s.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = s.split(':');
        let (Some(ip), Some(command), Some(data), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid("expected ip:commandPort:dataPort"));
        };

        let ip = ip
            .parse::<Ipv4Addr>()
            .map_err(|_| invalid("bad IPv4 address"))?;
        let command_port = command
            .parse::<u16>()
            .map_err(|_| invalid("bad command port"))?;
        let data_port = data.parse::<u16>().map_err(|_| invalid("bad data port"))?;

        Ok(Self::new(ip, command_port, data_port))
    }
}

impl TryFrom<String> for MemberKey {
    type Error = BusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MemberKey> for String {
    fn from(key: MemberKey) -> Self {
        key.to_string()
    }
}

/// Connection status of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    /// Learned about but never successfully contacted.
    #[default]
    Unknown,
    /// Transport established and confirmed.
    Alive,
    /// Transport closed by the peer, or the peer departed.
    Left,
    /// Unreachable: the connection manager exhausted its retries.
    Failed,
}

impl MemberStatus {
    /// Whether messages routed to a member in this state can be delivered.
    pub fn is_reachable(self) -> bool {
        matches!(self, Self::Alive)
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Alive => write!(f, "alive"),
            Self::Left => write!(f, "left"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A point-in-time copy of a member's state.
///
/// Gossip carries snapshots between processes; [`MemberCore::merge`] applies
/// them with last-writer-wins by sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSnapshot {
    pub key: MemberKey,
    pub sequence: u64,
    pub status: MemberStatus,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub public_key: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct MemberState {
    sequence: u64,
    status: MemberStatus,
    tags: HashMap<String, String>,
    public_key: Option<Vec<u8>>,
}

/// State shared by every member implementation.
#[derive(Debug)]
pub struct MemberCore {
    key: MemberKey,
    state: RwLock<MemberState>,
}

impl MemberCore {
    /// A fresh member in the `Unknown` state with sequence 0.
    pub fn new(key: MemberKey) -> Self {
        Self {
            key,
            state: RwLock::new(MemberState::default()),
        }
    }

    /// Rebuild a member from a gossiped snapshot.
    pub fn from_snapshot(snapshot: MemberSnapshot) -> Self {
        Self {
            key: snapshot.key,
            state: RwLock::new(MemberState {
                sequence: snapshot.sequence,
                status: snapshot.status,
                tags: snapshot.tags,
                public_key: snapshot.public_key,
            }),
        }
    }

    pub fn key(&self) -> &MemberKey {
        &self.key
    }

    pub fn sequence(&self) -> u64 {
        self.state.read().unwrap_or_else(|e| e.into_inner()).sequence
    }

    pub fn status(&self) -> MemberStatus {
        self.state.read().unwrap_or_else(|e| e.into_inner()).status
    }

    pub fn tags(&self) -> HashMap<String, String> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .tags
            .clone()
    }

    pub fn public_key(&self) -> Option<Vec<u8>> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .public_key
            .clone()
    }

    /// Copy the current state out.
    pub fn snapshot(&self) -> MemberSnapshot {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        MemberSnapshot {
            key: self.key,
            sequence: state.sequence,
            status: state.status,
            tags: state.tags.clone(),
            public_key: state.public_key.clone(),
        }
    }

    /// Move to `status`, bumping the sequence in the same critical section.
    ///
    /// Returns the new sequence, or `None` when the member is already in
    /// `status` (no transition happened).
    pub fn transition(&self, status: MemberStatus) -> Option<u64> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.status == status {
            return None;
        }
        state.status = status;
        state.sequence += 1;
        Some(state.sequence)
    }

    /// Set a metadata tag. Counts as a locally originated update.
    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) -> u64 {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.tags.insert(key.into(), value.into());
        state.sequence += 1;
        state.sequence
    }

    pub fn set_public_key(&self, public_key: Option<Vec<u8>>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.public_key = public_key;
    }

    /// Apply a snapshot if it is strictly newer than the stored state.
    ///
    /// Equal sequences keep the existing state. Returns whether anything
    /// changed.
    pub fn merge(&self, snapshot: &MemberSnapshot) -> bool {
        if snapshot.key != self.key {
            return false;
        }
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if snapshot.sequence <= state.sequence {
            return false;
        }
        state.sequence = snapshot.sequence;
        state.status = snapshot.status;
        state.tags = snapshot.tags.clone();
        state.public_key = snapshot.public_key.clone();
        true
    }
}

/// A participant on the bus.
///
/// Implementations differ only in how [`Member::send`] reaches the member:
/// the local process dispatches in memory, remote peers write to a socket.
pub trait Member: Send + Sync + fmt::Debug {
    /// Shared identity and state.
    fn core(&self) -> &MemberCore;

    /// Route an envelope to this member. Best effort; see [`BusError::SendDropped`].
    fn send(&self, envelope: &Envelope) -> BusResult<()>;

    /// Release any transport resources. Must be idempotent.
    fn shutdown(&self) {}

    fn key(&self) -> &MemberKey {
        self.core().key()
    }

    fn status(&self) -> MemberStatus {
        self.core().status()
    }

    fn sequence(&self) -> u64 {
        self.core().sequence()
    }
}

/// Receives status changes originated by a member's connection lifecycle.
///
/// The membership registry implements this; connection managers depend only
/// on the trait.
pub trait StatusObserver: Send + Sync {
    fn update_status(&self, key: &MemberKey, status: MemberStatus);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> MemberKey {
        "192.168.1.1:55200:55201".parse().unwrap()
    }

    #[test]
    fn test_key_roundtrip() {
        let key = key();
        assert_eq!(key.ip, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(key.command_port, 55200);
        assert_eq!(key.data_port, 55201);
        assert_eq!(key.to_string(), "192.168.1.1:55200:55201");
    }

    #[test]
    fn test_key_rejects_malformed() {
        assert!("192.168.1.1:55200".parse::<MemberKey>().is_err());
        assert!("192.168.1.1:55200:1:2".parse::<MemberKey>().is_err());
        assert!("192.168.1.300:1:2".parse::<MemberKey>().is_err());
        assert!("10.0.0.1:70000:1".parse::<MemberKey>().is_err());
    }

    #[test]
    fn test_transition_bumps_sequence() {
        let core = MemberCore::new(key());
        assert_eq!(core.status(), MemberStatus::Unknown);
        assert_eq!(core.transition(MemberStatus::Alive), Some(1));
        assert_eq!(core.transition(MemberStatus::Alive), None);
        assert_eq!(core.transition(MemberStatus::Left), Some(2));
        assert_eq!(core.sequence(), 2);
    }

    #[test]
    fn test_merge_discards_stale_and_equal() {
        let core = MemberCore::new(key());
        core.transition(MemberStatus::Alive);
        core.set_tag("role", "worker");
        assert_eq!(core.sequence(), 2);

        let mut stale = core.snapshot();
        stale.status = MemberStatus::Left;
        stale.tags.clear();
        assert!(!core.merge(&stale));
        stale.sequence = 1;
        assert!(!core.merge(&stale));
        assert_eq!(core.status(), MemberStatus::Alive);
        assert_eq!(core.tags().get("role").map(String::as_str), Some("worker"));

        stale.sequence = 3;
        assert!(core.merge(&stale));
        assert_eq!(core.status(), MemberStatus::Left);
        assert!(core.tags().is_empty());
    }

    #[test]
    fn test_merge_ignores_other_member() {
        let core = MemberCore::new(key());
        let other = MemberCore::new("10.0.0.1:1:2".parse().unwrap());
        let mut snapshot = other.snapshot();
        snapshot.sequence = 10;
        assert!(!core.merge(&snapshot));
        assert_eq!(core.sequence(), 0);
    }
}
