//! Idle connection detection.
//!
//! After half the idle window without inbound traffic an authenticated
//! session gets a ping. If the other half passes with no traffic either,
//! the connection is closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use jid::Jid;
use minidom::Element;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::session::ClientSession;
use crate::stanza::{ns, IqType, Stanza};

static PING_IDS: AtomicU64 = AtomicU64::new(0);

/// Watch `session` until it closes, `cancel` fires, or it goes idle.
pub fn spawn_idle_monitor(
    session: &Arc<ClientSession>,
    idle: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(monitor(Arc::downgrade(session), idle, cancel))
}

async fn monitor(session: Weak<ClientSession>, idle: Duration, cancel: CancellationToken) {
    let half = idle / 2;
    let mut pinged = false;

    loop {
        let wait = {
            let Some(session) = session.upgrade() else {
                return;
            };
            if session.is_closed() {
                return;
            }

            let quiet = session.idle_for();
            if quiet >= idle {
                info!(stream_id = %session.stream_id(), ?quiet, "Closing idle connection");
                session.connection().close().await;
                return;
            }
            if quiet >= half {
                if !pinged && session.is_authenticated() {
                    send_ping(&session);
                }
                pinged = true;
                idle - quiet
            } else {
                pinged = false;
                half - quiet
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

fn send_ping(session: &ClientSession) {
    let id = format!("idle-ping-{}", PING_IDS.fetch_add(1, Ordering::Relaxed));
    let mut ping = Stanza::iq(
        IqType::Get,
        &id,
        Some(Element::builder("ping", ns::PING).build()),
    )
    .with_to(session.address());
    if let Ok(server) = Jid::new(session.server_domain()) {
        ping = ping.with_from(server);
    }
    debug!(stream_id = %session.stream_id(), id = %id, "Pinging quiet client");
    session.process(ping);
}
