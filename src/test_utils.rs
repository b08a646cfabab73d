//! Shared helpers for async tests.

use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use crate::service::ServiceEvent;
use crate::session::PeerState;

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

/// Installs the test tracing subscriber once; run with `RUST_LOG=debug` to
/// see worker activity in failing tests.
pub fn init_tracing() {
    Lazy::force(&TRACING);
}

const EVENT_WINDOW: Duration = Duration::from_secs(2);

/// Next service event, or `None` if nothing arrives within the window.
pub async fn recv_event(rx: &mut broadcast::Receiver<ServiceEvent>) -> Option<ServiceEvent> {
    loop {
        match tokio::time::timeout(EVENT_WINDOW, rx.recv()).await {
            Ok(Ok(event)) => return Some(event),
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
        }
    }
}

/// Awaits the `PeerStateChanged` that moves `device` to `target`.
pub async fn wait_for_state(
    rx: &mut broadcast::Receiver<ServiceEvent>,
    device: &str,
    target: PeerState,
) {
    loop {
        match recv_event(rx).await {
            Some(ServiceEvent::PeerStateChanged {
                device_name, to, ..
            }) if device_name == device && to == target => return,
            Some(_) => {}
            None => panic!("peer `{device}` never reached {target:?}"),
        }
    }
}
