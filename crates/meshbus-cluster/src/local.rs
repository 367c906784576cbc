//! The local process as a member of the bus.

use crate::dispatcher::Dispatcher;
use meshbus_types::{BusResult, Envelope, Member, MemberCore, MemberKey, MemberStatus};
use std::collections::HashMap;
use std::sync::Arc;

/// This process. Sends are delivered in memory to local subscribers.
pub struct LocalMember {
    core: MemberCore,
    dispatcher: Arc<Dispatcher>,
}

impl LocalMember {
    /// The local member is `Alive` from construction.
    pub fn new(key: MemberKey, tags: HashMap<String, String>, dispatcher: Arc<Dispatcher>) -> Self {
        let core = MemberCore::new(key);
        for (name, value) in tags {
            core.set_tag(name, value);
        }
        core.transition(MemberStatus::Alive);
        Self { core, dispatcher }
    }
}

impl Member for LocalMember {
    fn core(&self) -> &MemberCore {
        &self.core
    }

    fn send(&self, envelope: &Envelope) -> BusResult<()> {
        self.dispatcher.dispatch(envelope.clone());
        Ok(())
    }
}

impl std::fmt::Debug for LocalMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMember")
            .field("key", self.core.key())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_reaches_local_subscribers() {
        let dispatcher = Arc::new(Dispatcher::new());
        let local = LocalMember::new(
            "127.0.0.1:55200:55201".parse().unwrap(),
            HashMap::from([("role".to_string(), "worker".to_string())]),
            Arc::clone(&dispatcher),
        );
        assert_eq!(local.status(), MemberStatus::Alive);
        assert_eq!(local.core().tags().len(), 1);

        let mut sub = dispatcher.subscribe("t");
        let envelope = Envelope::new(*local.key(), "t", "Msg", vec![9]);
        local.send(&envelope).unwrap();
        assert_eq!(*sub.recv().await.unwrap(), envelope);
    }
}
