//! ClusterService — a running bus node.
//!
//! Owns the membership registry, the payload codecs, the local dispatcher,
//! and the inbound listener. Outbound messages are encoded, wrapped into an
//! [`Envelope`] stamped with the local identity, and sent to every member
//! registered for the topic (including this process, when it listens).

use crate::dispatcher::{Dispatcher, Subscription};
use crate::error::{ClusterError, ClusterResult};
use crate::local::LocalMember;
use crate::registry::MembershipRegistry;
use chrono::Timelike;
use dashmap::DashMap;
use meshbus_types::{BusConfig, BusError, Envelope, Member, MemberKey, StatusObserver};
use meshbus_wire::{CodecRegistry, EnvelopeHandler, EnvelopeListener, RemoteMember};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A bus node: local member, listener, and connections to peers.
pub struct ClusterService {
    config: BusConfig,
    local: Arc<LocalMember>,
    registry: Arc<MembershipRegistry>,
    codecs: Arc<CodecRegistry>,
    dispatcher: Arc<Dispatcher>,
    peers: DashMap<MemberKey, Arc<RemoteMember>>,
    listener: Arc<EnvelopeListener>,
    shut_down: AtomicBool,
}

impl ClusterService {
    /// Bind the command listener and register the local member.
    ///
    /// With `command_port = 0` the OS picks the port, and the local identity
    /// carries the bound port.
    pub async fn start(config: BusConfig) -> ClusterResult<Arc<Self>> {
        let dispatcher = Arc::new(Dispatcher::new());
        let bind_addr = SocketAddr::from((config.address, config.command_port));
        let handler: Arc<dyn EnvelopeHandler> = dispatcher.clone();
        let listener = EnvelopeListener::start(bind_addr, handler)
            .await
            .map_err(|e| ClusterError::Startup(format!("cannot listen on {bind_addr}: {e}")))?;

        let local_key = MemberKey::new(
            config.address,
            listener.local_addr().port(),
            config.data_port,
        );
        let local = Arc::new(LocalMember::new(
            local_key,
            config.tags.clone(),
            Arc::clone(&dispatcher),
        ));

        let registry = Arc::new(MembershipRegistry::new());
        registry.upsert(local.clone());
        info!(member = %local_key, "Bus node started");

        Ok(Arc::new(Self {
            config,
            local,
            registry,
            codecs: Arc::new(CodecRegistry::new()),
            dispatcher,
            peers: DashMap::new(),
            listener,
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn local_key(&self) -> MemberKey {
        *self.local.key()
    }

    /// Address the command listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &Arc<MembershipRegistry> {
        &self.registry
    }

    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.codecs
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Register a serde message type under the identifier peers use for it.
    pub fn register_message<T>(&self, class_name: &str)
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.codecs.register::<T>(class_name);
    }

    /// Connect to a peer and track it in the registry.
    ///
    /// For a known peer this restarts its connect cycle if it is not running.
    pub fn add_peer(&self, key: MemberKey) -> ClusterResult<Arc<RemoteMember>> {
        self.ensure_running()?;
        if key == self.local_key() {
            return Err(BusError::Config(format!("{key} is the local member")).into());
        }

        let peer = match self.peers.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                let peer = Arc::clone(existing.get());
                if peer.reconnect() {
                    debug!(member = %key, "Restarted connect cycle");
                }
                return Ok(peer);
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let observer: Arc<dyn StatusObserver> = self.registry.clone();
                let inbound: Arc<dyn EnvelopeHandler> = self.dispatcher.clone();
                let peer = Arc::new(
                    RemoteMember::new(key, self.config.connection.clone(), observer)
                        .with_inbound(inbound),
                );
                vacant.insert(Arc::clone(&peer));
                peer
            }
        };

        // In the directory before connecting, so no status report is lost.
        // An entry learned earlier keeps its topics under the new instance.
        if self.registry.replace(peer.clone()).is_some() {
            debug!(member = %key, "Took over existing directory entry");
        }
        peer.connect_in_background();
        info!(member = %key, "Added peer");
        Ok(peer)
    }

    /// Evict a peer: shut its connection down and drop its subscriptions.
    pub fn remove_peer(&self, key: &MemberKey) -> bool {
        let known = self.peers.remove(key).is_some();
        self.registry.remove(key).is_some() || known
    }

    /// Record that a peer subscribes to `topic`, so publishes reach it.
    pub fn add_remote_listener(&self, topic: &str, key: MemberKey) -> ClusterResult<()> {
        let peer = match self.peers.get(&key) {
            Some(peer) => Arc::clone(peer.value()),
            None => self.add_peer(key)?,
        };
        self.registry.register_topic(topic, peer);
        Ok(())
    }

    /// Subscribe this process to `topic`.
    pub fn add_listener(&self, topic: &str) -> Subscription {
        self.registry.register_topic(topic, self.local.clone());
        self.dispatcher.subscribe(topic)
    }

    /// Subscribe this process to one partition of `topic`.
    pub fn add_partition_listener(&self, topic: &str, partition: &str) -> Subscription {
        self.registry.register_topic(topic, self.local.clone());
        self.dispatcher.subscribe_partition(topic, partition)
    }

    /// Stop receiving `topic` locally. Open subscriptions end.
    pub fn remove_listener(&self, topic: &str) -> bool {
        self.dispatcher.close_topic(topic);
        self.registry.unregister_topic(topic, &self.local_key())
    }

    /// Send a message to every member subscribed to `topic`.
    ///
    /// Returns how many members accepted it. Members without a live channel
    /// are skipped.
    pub fn publish<T: 'static>(&self, topic: &str, message: &T) -> ClusterResult<usize> {
        self.publish_partition(topic, "", message)
    }

    pub fn publish_partition<T: 'static>(
        &self,
        topic: &str,
        partition: &str,
        message: &T,
    ) -> ClusterResult<usize> {
        let (class_name, payload) = self.codecs.encode(message)?;
        let envelope = Envelope::new(self.local_key(), topic, class_name, payload)
            .with_partition(partition)
            .with_timestamp(milliseconds_since_midnight());
        self.publish_envelope(&envelope)
    }

    /// Route a pre-built envelope (e.g. one carrying a key) by its topic.
    pub fn publish_envelope(&self, envelope: &Envelope) -> ClusterResult<usize> {
        self.ensure_running()?;
        let members = self.registry.get_registered_members(&envelope.topic);
        let mut delivered = 0;
        for member in &members {
            match member.send(envelope) {
                Ok(()) => delivered += 1,
                Err(BusError::SendDropped { member }) => {
                    debug!(%member, topic = %envelope.topic, "Send dropped, no channel");
                }
                Err(e) => {
                    warn!(member = %member.key(), topic = %envelope.topic, "Send failed: {}", e);
                }
            }
        }
        debug!(
            topic = %envelope.topic,
            class_name = %envelope.class_name,
            subscribers = members.len(),
            delivered,
            "Published envelope"
        );
        Ok(delivered)
    }

    /// Decode an envelope's payload with the registered codec.
    pub fn decode<T: 'static>(&self, envelope: &Envelope) -> ClusterResult<T> {
        Ok(self.codecs.decode(&envelope.class_name, &envelope.payload)?)
    }

    /// Stop listening and close every peer connection. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(member = %self.local_key(), "Shutting down bus node");
        self.listener.shutdown();
        for peer in self.peers.iter() {
            peer.value().shutdown();
        }
    }

    fn ensure_running(&self) -> ClusterResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BusError::ShuttingDown.into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for ClusterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterService")
            .field("local", &self.local_key())
            .field("peers", &self.peers.len())
            .field("registry", &self.registry)
            .finish()
    }
}

/// Local wall-clock time of day in milliseconds.
fn milliseconds_since_midnight() -> i32 {
    let now = chrono::Local::now();
    // Leap seconds report up to 1999 ms.
    let millis = now.timestamp_subsec_millis().min(999);
    (now.num_seconds_from_midnight() * 1000 + millis) as i32
}
