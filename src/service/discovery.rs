//! Client-side discovery: who is currently inviting us?
//!
//! On a fixed interval (or an explicit `refresh_now`), the invitation source
//! is re-queried and diffed against the held peer list; new entries fire
//! peer-found, vanished entries fire peer-lost, and changed identities are
//! treated as lost-then-found. Peers flagged auto-reconnect are reconnected
//! immediately after being re-found.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ServiceEvent, ServiceInner};
use crate::transport::TopicId;

const LOG_TARGET: &str = "whist_core::service::discovery";

/// One open invitation observed on the discovery medium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    pub device_name: String,
    pub player_uuid: Option<Uuid>,
    pub player_name: String,
    pub topic: TopicId,
}

impl Invitation {
    fn same_identity(&self, other: &Invitation) -> bool {
        self.player_uuid == other.player_uuid
            && self.player_name == other.player_name
            && self.topic == other.topic
    }
}

/// Abstract "find/lose peer" contract; the radio-level discovery internals
/// live behind it.
pub trait InvitationSource: Send + Sync {
    fn current_invitations(&self) -> Vec<Invitation>;
}

/// A mutable in-memory invitation list, for tests and manual wiring.
#[derive(Default)]
pub struct StaticInvitations {
    entries: Mutex<Vec<Invitation>>,
}

impl StaticInvitations {
    pub fn set(&self, entries: Vec<Invitation>) {
        *self.entries.lock().expect("invitation list poisoned") = entries;
    }
}

impl InvitationSource for StaticInvitations {
    fn current_invitations(&self) -> Vec<Invitation> {
        self.entries.lock().expect("invitation list poisoned").clone()
    }
}

/// Re-queries the invitation source and reconciles the peer list.
pub(crate) fn refresh(inner: &Arc<ServiceInner>) {
    let Some(source) = &inner.invitations else {
        return;
    };
    let current = source.current_invitations();

    let mut known = inner
        .known_invitations
        .lock()
        .expect("invitation map poisoned");

    let mut found: Vec<Invitation> = Vec::new();
    let mut lost: Vec<String> = Vec::new();

    for invitation in &current {
        match known.get(&invitation.device_name) {
            None => found.push(invitation.clone()),
            Some(existing) if !existing.same_identity(invitation) => {
                // Changed identity: treated as lost + found.
                lost.push(invitation.device_name.clone());
                found.push(invitation.clone());
            }
            Some(_) => {}
        }
    }
    for device in known.keys() {
        if !current.iter().any(|inv| &inv.device_name == device) {
            lost.push(device.clone());
        }
    }

    for device in &lost {
        known.remove(device);
        let armed = {
            let mut peers = inner.peers.lock().expect("peer map poisoned");
            peers
                .remove(device)
                .map(|peer| peer.auto_reconnect())
                .unwrap_or(false)
        };
        if armed {
            inner
                .reconnect_armed
                .lock()
                .expect("reconnect map poisoned")
                .insert(device.clone(), true);
        }
        debug!(target: LOG_TARGET, %device, "invitation lost");
        let _ = inner.events_tx.send(ServiceEvent::PeerLost {
            device_name: device.clone(),
        });
    }

    for invitation in found {
        known.insert(invitation.device_name.clone(), invitation.clone());
        {
            let mut peers = inner.peers.lock().expect("peer map poisoned");
            peers
                .entry(invitation.device_name.clone())
                .or_insert_with(|| inner.make_peer(&invitation.device_name));
        }
        debug!(target: LOG_TARGET, device = %invitation.device_name, "invitation found");
        let _ = inner.events_tx.send(ServiceEvent::PeerFound {
            device_name: invitation.device_name.clone(),
            player_uuid: invitation.player_uuid,
            player_name: Some(invitation.player_name.clone()),
        });

        let rearm = inner
            .reconnect_armed
            .lock()
            .expect("reconnect map poisoned")
            .remove(&invitation.device_name)
            .is_some();
        if rearm {
            if let Err(err) = reconnect(inner, &invitation.device_name) {
                warn!(
                    target: LOG_TARGET,
                    device = %invitation.device_name,
                    error = %err,
                    "auto-reconnect failed"
                );
            }
        }
    }
}

fn reconnect(inner: &Arc<ServiceInner>, device: &str) -> Result<(), crate::session::SessionError> {
    let config = inner.service_config();
    let mut peers = inner.peers.lock().expect("peer map poisoned");
    let peer = peers
        .entry(device.to_string())
        .or_insert_with(|| inner.make_peer(device));
    peer.connect(
        config.player_uuid,
        config.player_name.clone().unwrap_or_default(),
        Value::Null,
        true,
        config.connect_timeout,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ConnectionService, ServiceConfig};
    use crate::session::PeerState;
    use crate::test_utils::recv_event;
    use crate::transport::MemoryMedium;
    use std::time::Duration;

    fn invitation(device: &str, topic: TopicId) -> Invitation {
        Invitation {
            device_name: device.into(),
            player_uuid: Some(Uuid::new_v4()),
            player_name: "Host".into(),
            topic,
        }
    }

    #[tokio::test]
    async fn new_and_vanished_invitations_fire_found_and_lost() {
        let medium = MemoryMedium::new();
        let topic = Uuid::new_v4();
        let invitations = Arc::new(StaticInvitations::default());
        let mut config = ServiceConfig::new("marc-phone");
        config.discovery_interval = Duration::from_millis(20);
        let (client, _rx) = ConnectionService::client(
            Arc::new(medium.channel(topic)),
            config,
            Arc::clone(&invitations) as Arc<dyn InvitationSource>,
        )
        .unwrap();

        let mut events = client.subscribe_events();
        invitations.set(vec![invitation("host-ipad", topic)]);
        client.refresh_now();

        let mut saw_found = false;
        for _ in 0..4 {
            if let Some(ServiceEvent::PeerFound { device_name, .. }) = recv_event(&mut events).await
            {
                assert_eq!(device_name, "host-ipad");
                saw_found = true;
                break;
            }
        }
        assert!(saw_found);
        assert_eq!(
            client.peer_state("host-ipad"),
            Some(PeerState::NotConnected)
        );

        invitations.set(Vec::new());
        client.refresh_now();
        let mut saw_lost = false;
        for _ in 0..4 {
            if let Some(ServiceEvent::PeerLost { device_name }) = recv_event(&mut events).await {
                assert_eq!(device_name, "host-ipad");
                saw_lost = true;
                break;
            }
        }
        assert!(saw_lost);
        assert_eq!(client.peer_state("host-ipad"), None);
    }

    #[tokio::test]
    async fn changed_identity_is_lost_then_found() {
        let medium = MemoryMedium::new();
        let topic = Uuid::new_v4();
        let invitations = Arc::new(StaticInvitations::default());
        let mut config = ServiceConfig::new("marc-phone");
        config.discovery_interval = Duration::from_secs(3600);
        let (client, _rx) = ConnectionService::client(
            Arc::new(medium.channel(topic)),
            config,
            Arc::clone(&invitations) as Arc<dyn InvitationSource>,
        )
        .unwrap();
        let mut events = client.subscribe_events();

        let first = invitation("host-ipad", topic);
        invitations.set(vec![first.clone()]);
        client.refresh_now();
        while let Some(event) = recv_event(&mut events).await {
            if matches!(event, ServiceEvent::PeerFound { .. }) {
                break;
            }
        }

        let mut changed = first;
        changed.player_name = "Other".into();
        invitations.set(vec![changed]);
        client.refresh_now();

        let mut order = Vec::new();
        for _ in 0..4 {
            match recv_event(&mut events).await {
                Some(ServiceEvent::PeerLost { .. }) => order.push("lost"),
                Some(ServiceEvent::PeerFound { .. }) => {
                    order.push("found");
                    break;
                }
                Some(_) => {}
                None => break,
            }
        }
        assert_eq!(order, vec!["lost", "found"]);
    }
}
