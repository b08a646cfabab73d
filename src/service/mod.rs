//! Connection service: owns the peers sharing one fanout topic.
//!
//! Routes inbound frames to the right peer by (device name, session UUID),
//! creates peers on demand for initial connect requests, and fans broadcast
//! sends out in a single transport publish carrying the session filter list.

pub mod discovery;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::session::{
    ConnectRequestContent, DataContent, Frame, FrameKind, PeerRole, PeerState, PeerStateChange,
    SessionError, SessionPeer,
};
use crate::transport::{TransportChannel, TransportEvent};

pub use discovery::{Invitation, InvitationSource, StaticInvitations};

const LOG_TARGET: &str = "whist_core::service";
const EVENT_CAPACITY: usize = 256;

/// Reason used when a fresh connect request displaces a live session for the
/// same device.
pub const REASON_NEW_CONNECTION: &str = "New connection received";

/// Typed peer lifecycle events, replacing delegate fan-out.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    PeerFound {
        device_name: String,
        player_uuid: Option<Uuid>,
        player_name: Option<String>,
    },
    PeerLost {
        device_name: String,
    },
    PeerStateChanged {
        device_name: String,
        from: PeerState,
        to: PeerState,
        reason: Option<String>,
    },
}

/// One parsed application message handed upward for queueing.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub descriptor: String,
    pub payload: Value,
    pub from_device: String,
}

/// Server-side predicate deciding whether an inbound connect request is
/// accepted; the `Err` string becomes the negative response reason.
pub trait ConnectAcceptor: Send + Sync {
    fn accept(&self, device_name: &str, request: &ConnectRequestContent) -> Result<(), String>;
}

pub struct AcceptAll;

impl ConnectAcceptor for AcceptAll {
    fn accept(&self, _device_name: &str, _request: &ConnectRequestContent) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub device_name: String,
    pub player_uuid: Option<Uuid>,
    pub player_name: Option<String>,
    pub connect_timeout: Duration,
    pub discovery_interval: Duration,
}

impl ServiceConfig {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            player_uuid: None,
            player_name: None,
            connect_timeout: Duration::from_secs(15),
            discovery_interval: Duration::from_secs(10),
        }
    }

    pub fn with_player(mut self, player_uuid: Uuid, player_name: impl Into<String>) -> Self {
        self.player_uuid = Some(player_uuid);
        self.player_name = Some(player_name.into());
        self
    }
}

/// Summary of one owned peer, for diagnostics and UI lists.
#[derive(Debug, Clone)]
pub struct PeerSummary {
    pub device_name: String,
    pub state: PeerState,
    pub player_uuid: Option<Uuid>,
    pub player_name: Option<String>,
    pub auto_reconnect: bool,
}

pub(crate) struct ServiceInner {
    role: PeerRole,
    config: ServiceConfig,
    channel: Arc<dyn TransportChannel>,
    pub(crate) peers: Mutex<HashMap<String, SessionPeer>>,
    state_tx: mpsc::UnboundedSender<PeerStateChange>,
    pub(crate) events_tx: broadcast::Sender<ServiceEvent>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    acceptor: Option<Arc<dyn ConnectAcceptor>>,
    pub(crate) invitations: Option<Arc<dyn InvitationSource>>,
    pub(crate) known_invitations: Mutex<HashMap<String, Invitation>>,
    pub(crate) reconnect_armed: Mutex<HashMap<String, bool>>,
    channel_recovering: AtomicBool,
}

pub struct ConnectionService {
    inner: Arc<ServiceInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    refresh_tx: mpsc::UnboundedSender<()>,
    stop: CancellationToken,
}

impl ConnectionService {
    /// Starts a server-role service: accepts connect requests validated by
    /// `acceptor` and manages the sessions they open.
    pub fn server(
        channel: Arc<dyn TransportChannel>,
        config: ServiceConfig,
        acceptor: Arc<dyn ConnectAcceptor>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InboundMessage>), SessionError> {
        Self::start(PeerRole::Server, channel, config, Some(acceptor), None)
    }

    /// Starts a client-role service: initiates connects and periodically
    /// re-discovers who is currently inviting us.
    pub fn client(
        channel: Arc<dyn TransportChannel>,
        config: ServiceConfig,
        invitations: Arc<dyn InvitationSource>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InboundMessage>), SessionError> {
        Self::start(PeerRole::Client, channel, config, None, Some(invitations))
    }

    fn start(
        role: PeerRole,
        channel: Arc<dyn TransportChannel>,
        config: ServiceConfig,
        acceptor: Option<Arc<dyn ConnectAcceptor>>,
        invitations: Option<Arc<dyn InvitationSource>>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InboundMessage>), SessionError> {
        channel.connect()?;
        // Subscribe before the worker is spawned: a frame published in the
        // gap would otherwise never reach the broadcast receiver.
        let frames = channel.subscribe();
        let transport_events = channel.events();
        let (state_tx, state_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ServiceInner {
            role,
            config,
            channel,
            peers: Mutex::new(HashMap::new()),
            state_tx,
            events_tx,
            inbound_tx,
            acceptor,
            invitations,
            known_invitations: Mutex::new(HashMap::new()),
            reconnect_armed: Mutex::new(HashMap::new()),
            channel_recovering: AtomicBool::new(false),
        });

        let stop = CancellationToken::new();
        let worker = spawn_worker(
            role,
            run_worker(
                Arc::clone(&inner),
                frames,
                transport_events,
                state_rx,
                refresh_rx,
                stop.clone(),
            ),
        );

        Ok((
            Self {
                inner,
                worker: Mutex::new(Some(worker)),
                refresh_tx,
                stop,
            },
            inbound_rx,
        ))
    }

    pub fn role(&self) -> PeerRole {
        self.inner.role
    }

    pub fn device_name(&self) -> &str {
        &self.inner.config.device_name
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn events_stream(&self) -> BroadcastStream<ServiceEvent> {
        BroadcastStream::new(self.subscribe_events())
    }

    /// Initiates a connection to `device_name`. Client role only; the peer is
    /// created on demand if discovery has not already produced one.
    pub fn connect_to(
        &self,
        device_name: &str,
        context: Value,
        reconnect: bool,
    ) -> Result<(), SessionError> {
        if self.inner.role != PeerRole::Client {
            return Err(SessionError::RoleViolation {
                role: self.inner.role,
            });
        }
        let config = &self.inner.config;
        let mut peers = self.inner.peers.lock().expect("peer map poisoned");
        let peer = peers
            .entry(device_name.to_string())
            .or_insert_with(|| self.inner.make_peer(device_name));
        peer.connect(
            config.player_uuid,
            config.player_name.clone().unwrap_or_default(),
            context,
            reconnect,
            config.connect_timeout,
        )
    }

    /// Unicast to one peer's session via a single `Data` frame.
    pub fn send_to(
        &self,
        device_name: &str,
        descriptor: &str,
        payload: Value,
    ) -> Result<(), SessionError> {
        let session = {
            let peers = self.inner.peers.lock().expect("peer map poisoned");
            let peer = peers.get(device_name).ok_or(SessionError::NoSession)?;
            if !peer.state().is_connected() {
                return Err(SessionError::NoSession);
            }
            peer.session_uuid().ok_or(SessionError::NoSession)?
        };
        self.inner
            .publish_data(FrameKind::Data, vec![session], descriptor, payload)
    }

    /// Broadcast to every connected peer matching the optional player filter,
    /// in one transport publish; returns how many sessions were addressed.
    pub fn broadcast(
        &self,
        descriptor: &str,
        payload: Value,
        to_players: Option<&[Uuid]>,
    ) -> Result<usize, SessionError> {
        let sessions: Vec<Uuid> = {
            let peers = self.inner.peers.lock().expect("peer map poisoned");
            peers
                .values()
                .filter(|peer| peer.state().is_connected())
                .filter(|peer| match to_players {
                    Some(targets) => peer
                        .player_uuid()
                        .map(|uuid| targets.contains(&uuid))
                        .unwrap_or(false),
                    None => true,
                })
                .filter_map(|peer| peer.session_uuid())
                .collect()
        };
        if sessions.is_empty() {
            return Ok(0);
        }
        let addressed = sessions.len();
        self.inner
            .publish_data(FrameKind::Broadcast, sessions, descriptor, payload)?;
        Ok(addressed)
    }

    pub fn disconnect_peer(&self, device_name: &str, reason: &str, reconnect: bool) {
        let mut peers = self.inner.peers.lock().expect("peer map poisoned");
        if let Some(peer) = peers.get_mut(device_name) {
            peer.disconnect(reason, reconnect, true);
        }
    }

    pub fn peer_state(&self, device_name: &str) -> Option<PeerState> {
        let peers = self.inner.peers.lock().expect("peer map poisoned");
        peers.get(device_name).map(|peer| peer.state())
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        let peers = self.inner.peers.lock().expect("peer map poisoned");
        peers
            .values()
            .map(|peer| PeerSummary {
                device_name: peer.device_name().to_string(),
                state: peer.state(),
                player_uuid: peer.player_uuid(),
                player_name: peer.player_name().map(str::to_string),
                auto_reconnect: peer.auto_reconnect(),
            })
            .collect()
    }

    /// Forces a discovery refresh ahead of the interval (client role).
    pub fn refresh_now(&self) {
        let _ = self.refresh_tx.send(());
    }

    /// Detaches every peer with `reason`, stops the worker, and releases the
    /// topic binding.
    pub async fn shutdown(&self, reason: &str) {
        {
            let mut peers = self.inner.peers.lock().expect("peer map poisoned");
            for peer in peers.values_mut() {
                peer.disconnect(reason, false, true);
            }
            peers.clear();
        }
        self.stop.cancel();
        let handle = self.worker.lock().expect("worker handle poisoned").take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(target: LOG_TARGET, error = %err, "failed to join service worker");
            }
        }
        self.inner.channel.disconnect();
        info!(target: LOG_TARGET, role = ?self.inner.role, "connection service stopped");
    }
}

impl Drop for ConnectionService {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Ok(mut guard) = self.worker.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

impl ServiceInner {
    pub(crate) fn service_config(&self) -> &ServiceConfig {
        &self.config
    }

    pub(crate) fn make_peer(&self, device_name: &str) -> SessionPeer {
        // The peer role mirrors the service role: a server service owns
        // server-role peers (they answer connects), and vice versa.
        SessionPeer::new(
            self.role,
            self.config.device_name.clone(),
            device_name,
            Arc::clone(&self.channel),
            self.state_tx.clone(),
        )
    }

    fn publish_data(
        &self,
        kind: FrameKind,
        sessions: Vec<Uuid>,
        descriptor: &str,
        payload: Value,
    ) -> Result<(), SessionError> {
        let frame = Frame {
            kind,
            from_device_name: self.config.device_name.clone(),
            match_session_uuids: sessions,
            content: serde_json::to_value(DataContent {
                descriptor: descriptor.to_string(),
                payload,
            })
            .expect("data content is serializable"),
        };
        self.channel.publish(frame.to_bytes()?)?;
        Ok(())
    }

    fn handle_frame(&self, bytes: &[u8]) {
        let frame = match Frame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(target: LOG_TARGET, error = %err, "dropping malformed frame");
                return;
            }
        };
        if frame.from_device_name == self.config.device_name {
            return; // our own fanout echo
        }
        match frame.kind {
            FrameKind::ConnectRequest => self.handle_connect_request(&frame),
            FrameKind::ConnectResponse => self.handle_connect_response(&frame),
            FrameKind::Disconnect => self.handle_disconnect(&frame),
            FrameKind::Data | FrameKind::Broadcast => self.handle_data(&frame),
        }
    }

    fn handle_connect_request(&self, frame: &Frame) {
        if self.role != PeerRole::Server {
            // A client receiving a connect request means a mis-wired role on
            // the far side; this is a programmer error, not a network fault.
            error!(
                target: LOG_TARGET,
                from = %frame.from_device_name,
                "client-role service received a connect request; dropping"
            );
            debug_assert!(false, "connect request routed to a client-role service");
            return;
        }
        let request = match frame.connect_request() {
            Ok(request) => request,
            Err(err) => {
                debug!(target: LOG_TARGET, error = %err, "dropping malformed connect request");
                return;
            }
        };
        let device = frame.from_device_name.clone();

        let mut peers = self.peers.lock().expect("peer map poisoned");
        let newly_found = !peers.contains_key(&device);
        let peer = peers
            .entry(device.clone())
            .or_insert_with(|| self.make_peer(&device));

        // A fresh session for a device we already hold displaces the old one.
        if peer.state().is_connected() && peer.session_uuid() != Some(request.session_uuid) {
            peer.disconnect(REASON_NEW_CONNECTION, false, true);
        }

        let verdict = match &self.acceptor {
            Some(acceptor) => acceptor.accept(&device, &request),
            None => Ok(()),
        };
        let result = match verdict {
            Ok(()) => peer.accept_connect(&request),
            Err(reason) => {
                info!(target: LOG_TARGET, %device, %reason, "connect request rejected");
                peer.reject_connect(&request, reason)
            }
        };
        if let Err(err) = result {
            warn!(target: LOG_TARGET, %device, error = %err, "connect response not delivered");
        }
        let (player_uuid, player_name) = (
            peer.player_uuid(),
            peer.player_name().map(str::to_string),
        );
        drop(peers);
        if newly_found {
            let _ = self.events_tx.send(ServiceEvent::PeerFound {
                device_name: device,
                player_uuid,
                player_name,
            });
        }
    }

    fn handle_connect_response(&self, frame: &Frame) {
        if self.role != PeerRole::Client {
            error!(
                target: LOG_TARGET,
                from = %frame.from_device_name,
                "server-role service received a connect response; dropping"
            );
            debug_assert!(false, "connect response routed to a server-role service");
            return;
        }
        let response = match frame.connect_response() {
            Ok(response) => response,
            Err(err) => {
                debug!(target: LOG_TARGET, error = %err, "dropping malformed connect response");
                return;
            }
        };
        let mut peers = self.peers.lock().expect("peer map poisoned");
        let Some(peer) = peers.get_mut(&frame.from_device_name) else {
            debug!(
                target: LOG_TARGET,
                from = %frame.from_device_name,
                "connect response for unknown peer"
            );
            return;
        };
        let Some(session) = peer.session_uuid() else {
            return;
        };
        if !frame.addressed_to(session) {
            debug!(target: LOG_TARGET, "connect response for a stale session; dropping");
            return;
        }
        if let Err(err) = peer.handle_connect_response(&response) {
            warn!(target: LOG_TARGET, error = %err, "connect response mishandled");
        }
    }

    fn handle_disconnect(&self, frame: &Frame) {
        let content = match frame.disconnect() {
            Ok(content) => content,
            Err(err) => {
                debug!(target: LOG_TARGET, error = %err, "dropping malformed disconnect");
                return;
            }
        };
        let mut peers = self.peers.lock().expect("peer map poisoned");
        if let Some(peer) = peers.get_mut(&frame.from_device_name) {
            match peer.session_uuid() {
                Some(session) if frame.addressed_to(session) => {
                    peer.handle_remote_disconnect(&content);
                }
                _ => debug!(target: LOG_TARGET, "disconnect for a stale session; dropping"),
            }
        }
    }

    fn handle_data(&self, frame: &Frame) {
        let routed = {
            let peers = self.peers.lock().expect("peer map poisoned");
            match peers.get(&frame.from_device_name) {
                Some(peer) => match peer.session_uuid() {
                    Some(session) if frame.addressed_to(session) => true,
                    _ => false,
                },
                None => false,
            }
        };
        if !routed {
            debug!(
                target: LOG_TARGET,
                from = %frame.from_device_name,
                "data frame with no resolvable session; dropping"
            );
            return;
        }
        match frame.data() {
            Ok(content) => {
                let _ = self.inbound_tx.send(InboundMessage {
                    descriptor: content.descriptor,
                    payload: content.payload,
                    from_device: frame.from_device_name.clone(),
                });
            }
            Err(err) => debug!(target: LOG_TARGET, error = %err, "dropping malformed data frame"),
        }
    }

    fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {}
            TransportEvent::Dropped { reason } => {
                // Single-flight: a recovery already in progress absorbs any
                // further drop reports.
                if self.channel_recovering.swap(true, Ordering::SeqCst) {
                    debug!(target: LOG_TARGET, "channel recovery already in flight");
                    return;
                }
                info!(target: LOG_TARGET, %reason, "transport dropped; peers recovering");
                let mut peers = self.peers.lock().expect("peer map poisoned");
                for peer in peers.values_mut() {
                    peer.transport_dropped(&reason);
                }
            }
            TransportEvent::Recovered => {
                if !self.channel_recovering.swap(false, Ordering::SeqCst) {
                    return;
                }
                info!(target: LOG_TARGET, "transport recovered; resuming peers");
                let mut peers = self.peers.lock().expect("peer map poisoned");
                for peer in peers.values_mut() {
                    peer.transport_recovered();
                }
            }
        }
    }

    fn expire_stale_connects(&self) {
        let now = Instant::now();
        let mut peers = self.peers.lock().expect("peer map poisoned");
        for peer in peers.values_mut() {
            if peer.connect_timed_out(now) {
                peer.expire_connect();
            }
        }
    }
}

/// Names the worker task when the runtime supports it, and otherwise wraps
/// it in a span so its log lines stay attributable.
fn spawn_worker(
    role: PeerRole,
    future: impl std::future::Future<Output = ()> + Send + 'static,
) -> JoinHandle<()> {
    let name = format!("connection-service-{role:?}");
    #[cfg(tokio_unstable)]
    {
        tokio::task::Builder::new()
            .name(&name)
            .spawn(future)
            .expect("failed to spawn service worker")
    }
    #[cfg(not(tokio_unstable))]
    {
        use tracing::Instrument;
        let span = tracing::info_span!("service_worker", %name);
        tokio::spawn(future.instrument(span))
    }
}

async fn run_worker(
    inner: Arc<ServiceInner>,
    mut frames: broadcast::Receiver<Vec<u8>>,
    mut transport_events: broadcast::Receiver<TransportEvent>,
    mut state_rx: mpsc::UnboundedReceiver<PeerStateChange>,
    mut refresh_rx: mpsc::UnboundedReceiver<()>,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(inner.config.discovery_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            frame = frames.recv() => match frame {
                Ok(bytes) => inner.handle_frame(&bytes),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(target: LOG_TARGET, missed, "frame receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = transport_events.recv() => match event {
                Ok(event) => inner.handle_transport_event(event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            change = state_rx.recv() => match change {
                Some(change) => {
                    let _ = inner.events_tx.send(ServiceEvent::PeerStateChanged {
                        device_name: change.device_name,
                        from: change.from,
                        to: change.to,
                        reason: change.reason,
                    });
                }
                None => break,
            },
            _ = ticker.tick() => {
                inner.expire_stale_connects();
                if inner.role == PeerRole::Client {
                    discovery::refresh(&inner);
                }
            }
            notice = refresh_rx.recv() => match notice {
                Some(()) => {
                    if inner.role == PeerRole::Client {
                        discovery::refresh(&inner);
                    }
                }
                None => break,
            },
        }
    }
}
