//! The per-endpoint session peer state machine.
//!
//! A peer wraps one remote device over the shared transport channel. Its
//! session UUID tags every frame of one connection attempt; frames bearing a
//! stale session UUID are ignored by the routing layer.

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    ConnectRequestContent, ConnectResponseContent, DisconnectContent, Frame, FrameKind,
    SessionError,
};
use crate::transport::TransportChannel;
use std::sync::Arc;

const LOG_TARGET: &str = "whist_core::session::peer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Server,
    Client,
}

/// Connection state of one peer.
///
/// `Reconnecting` is the auto-reconnect-armed flavour of `NotConnected`;
/// `Recovering` means the transport dropped underneath a live session and is
/// expected to come back without losing game state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    NotConnected,
    Reconnecting,
    Connecting,
    Connected,
    Recovering,
}

impl PeerState {
    pub fn is_connected(self) -> bool {
        matches!(self, PeerState::Connected)
    }

    pub fn counts_as_disconnected(self) -> bool {
        matches!(self, PeerState::NotConnected | PeerState::Reconnecting)
    }
}

/// One state transition, reported exactly once per effective change.
#[derive(Debug, Clone)]
pub struct PeerStateChange {
    pub device_name: String,
    pub from: PeerState,
    pub to: PeerState,
    pub reason: Option<String>,
}

pub struct SessionPeer {
    role: PeerRole,
    local_device_name: String,
    device_name: String,
    channel: Arc<dyn TransportChannel>,
    notifier: mpsc::UnboundedSender<PeerStateChange>,

    state: PeerState,
    session_uuid: Option<Uuid>,
    player_uuid: Option<Uuid>,
    player_name: Option<String>,
    auto_reconnect: bool,
    requested_reconnect: bool,
    last_reason: Option<String>,
    connect_deadline: Option<Instant>,
}

impl SessionPeer {
    pub fn new(
        role: PeerRole,
        local_device_name: impl Into<String>,
        device_name: impl Into<String>,
        channel: Arc<dyn TransportChannel>,
        notifier: mpsc::UnboundedSender<PeerStateChange>,
    ) -> Self {
        Self {
            role,
            local_device_name: local_device_name.into(),
            device_name: device_name.into(),
            channel,
            notifier,
            state: PeerState::NotConnected,
            session_uuid: None,
            player_uuid: None,
            player_name: None,
            auto_reconnect: false,
            requested_reconnect: false,
            last_reason: None,
            connect_deadline: None,
        }
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn session_uuid(&self) -> Option<Uuid> {
        self.session_uuid
    }

    pub fn player_uuid(&self) -> Option<Uuid> {
        self.player_uuid
    }

    pub fn player_name(&self) -> Option<&str> {
        self.player_name.as_deref()
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    pub fn last_reason(&self) -> Option<&str> {
        self.last_reason.as_deref()
    }

    /// Moves to `new` and notifies the owner, once per effective change.
    fn set_state(&mut self, new: PeerState, reason: Option<String>) -> bool {
        if self.state == new {
            return false;
        }
        let change = PeerStateChange {
            device_name: self.device_name.clone(),
            from: self.state,
            to: new,
            reason: reason.clone(),
        };
        self.state = new;
        if reason.is_some() {
            self.last_reason = reason;
        }
        let _ = self.notifier.send(change);
        true
    }

    /// Initiates a connection to the remote device. Client role only.
    ///
    /// Allocates a fresh session UUID for the attempt and publishes the
    /// connect request on the shared topic.
    pub fn connect(
        &mut self,
        player_uuid: Option<Uuid>,
        player_name: impl Into<String>,
        context: Value,
        reconnect: bool,
        connect_timeout: Duration,
    ) -> Result<(), SessionError> {
        if self.role != PeerRole::Client {
            return Err(SessionError::RoleViolation { role: self.role });
        }
        let session = Uuid::new_v4();
        self.session_uuid = Some(session);
        self.requested_reconnect = reconnect;

        let name = player_name.into();
        let frame = Frame {
            kind: FrameKind::ConnectRequest,
            from_device_name: self.local_device_name.clone(),
            // No established session yet; the new session rides in content.
            match_session_uuids: Vec::new(),
            content: serde_json::to_value(ConnectRequestContent {
                session_uuid: session,
                player_uuid,
                player_name: name,
                context,
                reconnect,
            })
            .expect("connect request content is serializable"),
        };
        self.channel.publish(frame.to_bytes()?)?;
        self.connect_deadline = Some(Instant::now() + connect_timeout);
        self.set_state(PeerState::Connecting, None);
        Ok(())
    }

    /// Accepts an inbound connect request. Server role only; the acceptance
    /// predicate has already passed at this point.
    pub fn accept_connect(&mut self, request: &ConnectRequestContent) -> Result<(), SessionError> {
        if self.role != PeerRole::Server {
            return Err(SessionError::RoleViolation { role: self.role });
        }
        self.session_uuid = Some(request.session_uuid);
        self.player_uuid = request.player_uuid;
        self.player_name = Some(request.player_name.clone());
        self.auto_reconnect = request.reconnect;
        self.send_connect_response(request.session_uuid, true, None)?;
        self.set_state(PeerState::Connected, None);
        Ok(())
    }

    /// Rejects an inbound connect request with a reason; state is untouched.
    pub fn reject_connect(
        &mut self,
        request: &ConnectRequestContent,
        reason: impl Into<String>,
    ) -> Result<(), SessionError> {
        if self.role != PeerRole::Server {
            return Err(SessionError::RoleViolation { role: self.role });
        }
        self.send_connect_response(request.session_uuid, false, Some(reason.into()))
    }

    fn send_connect_response(
        &self,
        session: Uuid,
        accepted: bool,
        reason: Option<String>,
    ) -> Result<(), SessionError> {
        let frame = Frame {
            kind: FrameKind::ConnectResponse,
            from_device_name: self.local_device_name.clone(),
            match_session_uuids: vec![session],
            content: serde_json::to_value(ConnectResponseContent { accepted, reason })
                .expect("connect response content is serializable"),
        };
        self.channel.publish(frame.to_bytes()?)?;
        Ok(())
    }

    /// Handles the server's reply to our connect request. Client role only.
    pub fn handle_connect_response(
        &mut self,
        response: &ConnectResponseContent,
    ) -> Result<(), SessionError> {
        if self.role != PeerRole::Client {
            return Err(SessionError::RoleViolation { role: self.role });
        }
        self.connect_deadline = None;
        if response.accepted {
            self.auto_reconnect = self.requested_reconnect;
            self.set_state(PeerState::Connected, None);
        } else {
            debug!(
                target: LOG_TARGET,
                device = %self.device_name,
                reason = ?response.reason,
                "connect request rejected"
            );
            self.session_uuid = None;
            self.set_state(PeerState::NotConnected, response.reason.clone());
        }
        Ok(())
    }

    /// Tears the session down. Best-effort sends a disconnect frame when the
    /// peer is connected; with `reflect_state_change` the local state flips
    /// immediately, independent of whether the network send succeeded.
    ///
    /// Idempotent: a second call past the first effective transition changes
    /// nothing and fires no notification.
    pub fn disconnect(&mut self, reason: impl Into<String>, reconnect: bool, reflect_state_change: bool) {
        let reason = reason.into();
        if self.state.is_connected() {
            if let Some(session) = self.session_uuid {
                let frame = Frame {
                    kind: FrameKind::Disconnect,
                    from_device_name: self.local_device_name.clone(),
                    match_session_uuids: vec![session],
                    content: serde_json::to_value(DisconnectContent {
                        reason: reason.clone(),
                    })
                    .expect("disconnect content is serializable"),
                };
                match frame.to_bytes() {
                    Ok(bytes) => {
                        if let Err(err) = self.channel.publish(bytes) {
                            warn!(
                                target: LOG_TARGET,
                                device = %self.device_name,
                                error = %err,
                                "disconnect frame not delivered"
                            );
                        }
                    }
                    Err(err) => warn!(target: LOG_TARGET, error = %err, "disconnect frame encode failed"),
                }
            }
        }
        if !reconnect {
            self.auto_reconnect = false;
        }
        if reflect_state_change {
            let target = if reconnect && self.auto_reconnect {
                PeerState::Reconnecting
            } else {
                PeerState::NotConnected
            };
            self.session_uuid = None;
            self.connect_deadline = None;
            self.set_state(target, Some(reason));
        }
    }

    /// The remote side sent a disconnect frame for our session.
    pub fn handle_remote_disconnect(&mut self, content: &DisconnectContent) {
        let target = if self.auto_reconnect {
            PeerState::Reconnecting
        } else {
            PeerState::NotConnected
        };
        self.session_uuid = None;
        self.set_state(target, Some(content.reason.clone()));
    }

    /// Underlying-medium failure: a live session recovers, anything else
    /// falls back to not-connected.
    pub fn transport_dropped(&mut self, reason: &str) {
        match self.state {
            PeerState::Connected => {
                self.set_state(PeerState::Recovering, Some(reason.to_string()));
            }
            PeerState::Connecting | PeerState::Recovering => {
                self.session_uuid = None;
                self.set_state(PeerState::NotConnected, Some(reason.to_string()));
            }
            PeerState::NotConnected | PeerState::Reconnecting => {}
        }
    }

    /// The transport came back; a recovering session resumes where it was.
    pub fn transport_recovered(&mut self) {
        if self.state == PeerState::Recovering {
            self.set_state(PeerState::Connected, None);
        }
    }

    /// True when a connect attempt has outlived its timeout.
    pub fn connect_timed_out(&self, now: Instant) -> bool {
        self.state == PeerState::Connecting
            && self.connect_deadline.map(|d| now >= d).unwrap_or(false)
    }

    /// Abandons a timed-out connect attempt.
    pub fn expire_connect(&mut self) {
        if self.state == PeerState::Connecting {
            self.session_uuid = None;
            self.connect_deadline = None;
            self.set_state(
                PeerState::NotConnected,
                Some("Connect attempt timed out".to_string()),
            );
        }
    }
}

impl Drop for SessionPeer {
    fn drop(&mut self) {
        if self.state.is_connected() {
            self.disconnect("Connection closed", false, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryMedium;

    fn peer_pair(role: PeerRole) -> (SessionPeer, mpsc::UnboundedReceiver<PeerStateChange>) {
        let medium = MemoryMedium::new();
        let channel = Arc::new(medium.channel(Uuid::new_v4()));
        channel.connect().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionPeer::new(role, "local", "remote", channel, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PeerStateChange>) -> Vec<PeerStateChange> {
        let mut changes = Vec::new();
        while let Ok(change) = rx.try_recv() {
            changes.push(change);
        }
        changes
    }

    #[test]
    fn connect_is_client_only() {
        let (mut peer, _rx) = peer_pair(PeerRole::Server);
        let err = peer
            .connect(None, "Marc", Value::Null, false, Duration::from_secs(15))
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::RoleViolation {
                role: PeerRole::Server
            }
        ));
    }

    #[test]
    fn client_path_never_skips_connecting() {
        let (mut peer, mut rx) = peer_pair(PeerRole::Client);
        peer.connect(None, "Marc", Value::Null, true, Duration::from_secs(15))
            .unwrap();
        peer.handle_connect_response(&ConnectResponseContent {
            accepted: true,
            reason: None,
        })
        .unwrap();

        let states: Vec<PeerState> = drain(&mut rx).into_iter().map(|c| c.to).collect();
        assert_eq!(states, vec![PeerState::Connecting, PeerState::Connected]);
        assert!(peer.auto_reconnect());
    }

    #[test]
    fn rejected_connect_falls_back_to_not_connected() {
        let (mut peer, mut rx) = peer_pair(PeerRole::Client);
        peer.connect(None, "Marc", Value::Null, false, Duration::from_secs(15))
            .unwrap();
        peer.handle_connect_response(&ConnectResponseContent {
            accepted: false,
            reason: Some("table full".into()),
        })
        .unwrap();

        let changes = drain(&mut rx);
        assert_eq!(changes.last().unwrap().to, PeerState::NotConnected);
        assert_eq!(changes.last().unwrap().reason.as_deref(), Some("table full"));
        assert!(peer.session_uuid().is_none());
    }

    #[test]
    fn double_disconnect_notifies_exactly_once() {
        let (mut peer, mut rx) = peer_pair(PeerRole::Client);
        peer.connect(None, "Marc", Value::Null, false, Duration::from_secs(15))
            .unwrap();
        peer.handle_connect_response(&ConnectResponseContent {
            accepted: true,
            reason: None,
        })
        .unwrap();
        drain(&mut rx);

        peer.disconnect("bye", false, true);
        peer.disconnect("bye", false, true);

        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to, PeerState::NotConnected);
    }

    #[test]
    fn transport_drop_moves_connected_peer_to_recovering() {
        let (mut peer, mut rx) = peer_pair(PeerRole::Client);
        peer.connect(None, "Marc", Value::Null, false, Duration::from_secs(15))
            .unwrap();
        peer.handle_connect_response(&ConnectResponseContent {
            accepted: true,
            reason: None,
        })
        .unwrap();
        drain(&mut rx);

        peer.transport_dropped("link lost");
        assert_eq!(peer.state(), PeerState::Recovering);
        peer.transport_recovered();
        assert_eq!(peer.state(), PeerState::Connected);

        let states: Vec<PeerState> = drain(&mut rx).into_iter().map(|c| c.to).collect();
        assert_eq!(states, vec![PeerState::Recovering, PeerState::Connected]);
    }

    #[test]
    fn transport_drop_while_connecting_resets_session() {
        let (mut peer, _rx) = peer_pair(PeerRole::Client);
        peer.connect(None, "Marc", Value::Null, false, Duration::from_secs(15))
            .unwrap();
        peer.transport_dropped("link lost");
        assert_eq!(peer.state(), PeerState::NotConnected);
        assert!(peer.session_uuid().is_none());
    }

    #[test]
    fn connect_attempt_expires_after_deadline() {
        let (mut peer, _rx) = peer_pair(PeerRole::Client);
        peer.connect(None, "Marc", Value::Null, false, Duration::from_millis(0))
            .unwrap();
        assert!(peer.connect_timed_out(Instant::now()));
        peer.expire_connect();
        assert_eq!(peer.state(), PeerState::NotConnected);
        assert_eq!(peer.last_reason(), Some("Connect attempt timed out"));
    }

    #[test]
    fn server_accept_replies_and_connects() {
        let (mut peer, mut rx) = peer_pair(PeerRole::Server);
        let request = ConnectRequestContent {
            session_uuid: Uuid::new_v4(),
            player_uuid: Some(Uuid::new_v4()),
            player_name: "Marc".into(),
            context: Value::Null,
            reconnect: true,
        };
        peer.accept_connect(&request).unwrap();
        assert_eq!(peer.state(), PeerState::Connected);
        assert_eq!(peer.session_uuid(), Some(request.session_uuid));
        assert_eq!(peer.player_name(), Some("Marc"));
        assert!(peer.auto_reconnect());
        assert_eq!(drain(&mut rx).len(), 1);
    }
}
