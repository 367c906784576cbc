//! Membership registry — the directory of known members and their topics.
//!
//! Two sharded maps: the directory (identity → member) and the topic index
//! (topic → set of identities). Every identity in the topic index exists in
//! the directory:
//!
//! - `register_topic` holds the member's directory entry while it adds the
//!   identity to the topic set
//! - `remove` takes the member out of the directory first, then strips the
//!   identity from every topic set
//!
//! Topic locks are never held while a directory lock is acquired, and no lock
//! is held across I/O.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use meshbus_types::{Member, MemberKey, MemberSnapshot, MemberStatus, StatusObserver};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the membership event channel.
const EVENT_CAPACITY: usize = 256;

/// A change to the membership directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A member was added to the directory.
    Joined(MemberKey),
    /// A member's status changed.
    StatusChanged {
        key: MemberKey,
        status: MemberStatus,
        sequence: u64,
    },
    /// A member was evicted.
    Removed(MemberKey),
}

/// Result of [`MembershipRegistry::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The member was not known and has been added.
    Inserted,
    /// The incoming state had a higher sequence and was merged.
    Updated,
    /// The incoming state was not newer; nothing changed.
    Stale,
}

/// Shared directory of members and topic subscriptions.
pub struct MembershipRegistry {
    directory: DashMap<MemberKey, Arc<dyn Member>>,
    topics: DashMap<String, HashSet<MemberKey>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl MembershipRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            directory: DashMap::new(),
            topics: DashMap::new(),
            events,
        }
    }

    /// Insert a member, or merge its state into the existing entry.
    ///
    /// An existing entry keeps its identity (and its connection); only a
    /// strictly higher sequence overwrites status and tags.
    pub fn upsert(&self, member: Arc<dyn Member>) -> UpsertOutcome {
        let key = *member.key();
        let snapshot = member.core().snapshot();

        let outcome = match self.directory.entry(key) {
            Entry::Occupied(existing) => {
                if existing.get().core().merge(&snapshot) {
                    UpsertOutcome::Updated
                } else {
                    UpsertOutcome::Stale
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(member);
                UpsertOutcome::Inserted
            }
        };

        match outcome {
            UpsertOutcome::Inserted => {
                info!(member = %key, status = %snapshot.status, "Member joined");
                self.emit(MembershipEvent::Joined(key));
            }
            UpsertOutcome::Updated => {
                debug!(member = %key, sequence = snapshot.sequence, "Member updated");
                self.emit(MembershipEvent::StatusChanged {
                    key,
                    status: snapshot.status,
                    sequence: snapshot.sequence,
                });
            }
            UpsertOutcome::Stale => {
                debug!(member = %key, sequence = snapshot.sequence, "Ignoring stale member state");
            }
        }
        outcome
    }

    /// Install `member` as the instance behind its identity.
    ///
    /// Topic subscriptions stay with the identity. Newer state held by the
    /// previous instance is carried over, and that instance is shut down and
    /// returned.
    pub fn replace(&self, member: Arc<dyn Member>) -> Option<Arc<dyn Member>> {
        let key = *member.key();
        let previous = match self.directory.entry(key) {
            Entry::Occupied(mut existing) => {
                if same_instance(existing.get(), &member) {
                    return None;
                }
                member.core().merge(&existing.get().core().snapshot());
                Some(existing.insert(member))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(member);
                None
            }
        };

        match &previous {
            Some(previous) => {
                debug!(member = %key, "Replaced member instance");
                previous.shutdown();
            }
            None => {
                info!(member = %key, "Member joined");
                self.emit(MembershipEvent::Joined(key));
            }
        }
        previous
    }

    /// Merge gossiped state into a known member.
    ///
    /// Returns false for unknown members and for snapshots that are not newer.
    pub fn merge_snapshot(&self, snapshot: &MemberSnapshot) -> bool {
        let Some(member) = self.get(&snapshot.key) else {
            return false;
        };
        if !member.core().merge(snapshot) {
            return false;
        }
        self.emit(MembershipEvent::StatusChanged {
            key: snapshot.key,
            status: snapshot.status,
            sequence: snapshot.sequence,
        });
        true
    }

    /// Move a member to `status`, bumping its sequence.
    ///
    /// Returns false when the member is unknown or already in `status`.
    pub fn update_status(&self, key: &MemberKey, status: MemberStatus) -> bool {
        let Some(member) = self.get(key) else {
            debug!(member = %key, %status, "Status update for unknown member");
            return false;
        };
        match member.core().transition(status) {
            Some(sequence) => {
                self.emit(MembershipEvent::StatusChanged {
                    key: *key,
                    status,
                    sequence,
                });
                true
            }
            None => false,
        }
    }

    /// Subscribe `member` to `topic`. Idempotent.
    ///
    /// Adds the member to the directory first if it is not there yet.
    pub fn register_topic(&self, topic: &str, member: Arc<dyn Member>) {
        let key = *member.key();
        let joined;
        {
            // Holding the directory entry keeps a concurrent remove() from
            // interleaving between the two inserts.
            let entry = self.directory.entry(key);
            joined = matches!(entry, Entry::Vacant(_));
            let _member = entry.or_insert(member);

            let added = self
                .topics
                .entry(topic.to_string())
                .or_default()
                .insert(key);
            if added {
                debug!(member = %key, topic, "Registered member for topic");
            }
        }
        if joined {
            self.emit(MembershipEvent::Joined(key));
        }
    }

    /// Unsubscribe a member from `topic`. Returns whether it was subscribed.
    pub fn unregister_topic(&self, topic: &str, key: &MemberKey) -> bool {
        let removed = self
            .topics
            .get_mut(topic)
            .map(|mut members| members.remove(key))
            .unwrap_or(false);
        self.topics.remove_if(topic, |_, members| members.is_empty());
        if removed {
            debug!(member = %key, topic, "Unregistered member from topic");
        }
        removed
    }

    /// Evict a member from the directory and every topic.
    ///
    /// The member's transport is shut down.
    pub fn remove(&self, key: &MemberKey) -> Option<Arc<dyn Member>> {
        let (_, member) = self.directory.remove(key)?;
        for mut members in self.topics.iter_mut() {
            members.value_mut().remove(key);
        }
        self.topics.retain(|_, members| !members.is_empty());

        member.shutdown();
        info!(member = %key, "Member removed");
        self.emit(MembershipEvent::Removed(*key));
        Some(member)
    }

    pub fn get(&self, key: &MemberKey) -> Option<Arc<dyn Member>> {
        self.directory.get(key).map(|m| Arc::clone(m.value()))
    }

    pub fn contains(&self, key: &MemberKey) -> bool {
        self.directory.contains_key(key)
    }

    /// All known members, in no particular order.
    pub fn list_members(&self) -> Vec<Arc<dyn Member>> {
        self.directory
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Members subscribed to `topic`. Empty for unknown topics.
    pub fn get_registered_members(&self, topic: &str) -> Vec<Arc<dyn Member>> {
        let keys: Vec<MemberKey> = match self.topics.get(topic) {
            Some(members) => members.iter().copied().collect(),
            None => return Vec::new(),
        };
        keys.iter().filter_map(|key| self.get(key)).collect()
    }

    /// Members currently `Alive`.
    pub fn active_members(&self) -> Vec<Arc<dyn Member>> {
        self.directory
            .iter()
            .filter(|entry| entry.value().status().is_reachable())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Topics a member is subscribed to, sorted.
    pub fn topics_for(&self, key: &MemberKey) -> Vec<String> {
        let mut topics: Vec<String> = self
            .topics
            .iter()
            .filter(|entry| entry.value().contains(key))
            .map(|entry| entry.key().clone())
            .collect();
        topics.sort();
        topics
    }

    /// Known topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.directory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directory.is_empty()
    }

    /// Receive membership changes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: MembershipEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

impl Default for MembershipRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn same_instance(a: &Arc<dyn Member>, b: &Arc<dyn Member>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Reports from connection managers. The reporter has usually applied the
/// transition to its own state already; when the stored instance is a
/// different one, the transition is applied to it here.
impl StatusObserver for MembershipRegistry {
    fn update_status(&self, key: &MemberKey, status: MemberStatus) {
        let Some(member) = self.get(key) else {
            warn!(member = %key, %status, "Status report for unknown member");
            return;
        };
        let current = member.core().snapshot();
        let sequence = if current.status == status {
            current.sequence
        } else {
            match member.core().transition(status) {
                Some(sequence) => sequence,
                None => return,
            }
        };
        info!(member = %key, %status, sequence, "Member status changed");
        self.emit(MembershipEvent::StatusChanged {
            key: *key,
            status,
            sequence,
        });
    }
}

impl std::fmt::Debug for MembershipRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipRegistry")
            .field("members", &self.directory.len())
            .field("topics", &self.topics.len())
            .finish()
    }
}
