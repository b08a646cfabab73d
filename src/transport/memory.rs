//! In-process fanout transport over `tokio::sync::broadcast`.
//!
//! One `MemoryMedium` stands in for the shared network; any number of
//! `MemoryTopic` channels bind to it by topic id. Link loss and recovery can
//! be injected for tests via `drop_link` / `restore_link`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::debug;

use super::{TopicId, TransportChannel, TransportError, TransportEvent};

const LOG_TARGET: &str = "whist_core::transport::memory";

/// Capacity of each topic's frame channel. Slow receivers that fall behind
/// will observe `RecvError::Lagged`.
const TOPIC_CAPACITY: usize = 1024;
const EVENT_CAPACITY: usize = 64;

struct TopicHub {
    frames: broadcast::Sender<Vec<u8>>,
    events: broadcast::Sender<TransportEvent>,
}

struct MediumState {
    topics: HashMap<TopicId, Arc<TopicHub>>,
}

/// The shared fanout medium. Cloneable; every channel bound to the same
/// medium and topic sees every publish.
#[derive(Clone)]
pub struct MemoryMedium {
    state: Arc<Mutex<MediumState>>,
    down: Arc<AtomicBool>,
}

impl Default for MemoryMedium {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MediumState {
                topics: HashMap::new(),
            })),
            down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bind a channel to `topic`, creating the hub on first use.
    pub fn channel(&self, topic: TopicId) -> MemoryTopic {
        let hub = {
            let mut state = self.state.lock().expect("memory medium poisoned");
            Arc::clone(state.topics.entry(topic).or_insert_with(|| {
                let (frames, _) = broadcast::channel(TOPIC_CAPACITY);
                let (events, _) = broadcast::channel(EVENT_CAPACITY);
                Arc::new(TopicHub { frames, events })
            }))
        };
        MemoryTopic {
            topic,
            hub,
            down: Arc::clone(&self.down),
            connected: AtomicBool::new(false),
        }
    }

    /// Simulate loss of the underlying link. All bound channels report
    /// `Dropped`; publishes fail until `restore_link`.
    pub fn drop_link(&self, reason: &str) {
        self.down.store(true, Ordering::SeqCst);
        let state = self.state.lock().expect("memory medium poisoned");
        for hub in state.topics.values() {
            let _ = hub.events.send(TransportEvent::Dropped {
                reason: reason.to_string(),
            });
        }
        debug!(target: LOG_TARGET, %reason, "link dropped");
    }

    /// Bring the link back. Bound channels report `Recovered`, modeling the
    /// automatic reconnection a real transport performs.
    pub fn restore_link(&self) {
        self.down.store(false, Ordering::SeqCst);
        let state = self.state.lock().expect("memory medium poisoned");
        for hub in state.topics.values() {
            let _ = hub.events.send(TransportEvent::Recovered);
        }
        debug!(target: LOG_TARGET, "link restored");
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }
}

/// One binding of the medium to a topic.
pub struct MemoryTopic {
    topic: TopicId,
    hub: Arc<TopicHub>,
    down: Arc<AtomicBool>,
    connected: AtomicBool,
}

impl TransportChannel for MemoryTopic {
    fn topic(&self) -> TopicId {
        self.topic
    }

    fn connect(&self) -> Result<(), TransportError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(TransportError::LinkDown("medium down".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.hub.events.send(TransportEvent::Connected);
        Ok(())
    }

    fn publish(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(TransportError::LinkDown("medium down".into()));
        }
        // send() errs only when no receiver is subscribed; a topic nobody
        // listens on swallows the frame, same as a real fanout exchange.
        let _ = self.hub.frames.send(bytes);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.hub.frames.subscribe()
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.hub.events.subscribe()
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn publish_reaches_every_subscriber_on_the_topic() {
        let medium = MemoryMedium::new();
        let topic = Uuid::new_v4();
        let a = medium.channel(topic);
        let b = medium.channel(topic);
        a.connect().unwrap();
        b.connect().unwrap();

        let mut rx_a = a.subscribe();
        let mut rx_b = b.subscribe();
        a.publish(b"hello".to_vec()).unwrap();

        assert_eq!(rx_a.recv().await.unwrap(), b"hello");
        assert_eq!(rx_b.recv().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let medium = MemoryMedium::new();
        let a = medium.channel(Uuid::new_v4());
        let b = medium.channel(Uuid::new_v4());
        a.connect().unwrap();
        b.connect().unwrap();

        let mut rx_b = b.subscribe();
        a.publish(b"hello".to_vec()).unwrap();
        assert!(matches!(
            rx_b.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn dropped_link_fails_publish_and_reports_events() {
        let medium = MemoryMedium::new();
        let topic = Uuid::new_v4();
        let chan = medium.channel(topic);
        chan.connect().unwrap();
        let mut events = chan.events();

        medium.drop_link("cable pulled");
        assert!(matches!(
            chan.publish(b"x".to_vec()),
            Err(TransportError::LinkDown(_))
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Dropped { .. }
        ));

        medium.restore_link();
        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Recovered
        ));
        chan.publish(b"x".to_vec()).unwrap();
    }

    #[test]
    fn publish_before_connect_is_rejected() {
        let medium = MemoryMedium::new();
        let chan = medium.channel(Uuid::new_v4());
        assert!(matches!(
            chan.publish(b"x".to_vec()),
            Err(TransportError::NotConnected)
        ));
    }
}
