// DDP for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

use std::sync::Arc;

use tokio::sync::mpsc;

use ddp_core::comms::TransportPollResult;

use crate::retry::SessionRetryPolicy;

use super::{session_debug, session_warn, Session};

/// Drives the session. It must be running for the session to work: it owns
/// the dial/redial cycle, polls the transport, and wakes the outbound
/// queue.
#[must_use = "The session event loop must be started for the session to work"]
pub struct SessionEventLoop {
    session: Arc<Session>,
    retry: SessionRetryPolicy,
}

impl SessionEventLoop {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        let retry = SessionRetryPolicy::new(session.config.reconnect_interval);
        Self { session, retry }
    }

    /// Run the event loop on a tokio task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::task::spawn(self.run())
    }

    /// Run the event loop until the session is dropped by every other
    /// holder. While the connection is not desired the loop sleeps on the
    /// desire watch; a lost connection with `auto_reconnect` set redials
    /// after the configured interval.
    pub async fn run(self) {
        let session = self.session;
        loop {
            // Park until someone wants a connection.
            if !session.connection_desired() {
                let mut desired = session.desired_watch();
                let result = desired.wait_for(|d| *d).await;
                match result {
                    Ok(_) => {}
                    // All senders gone: the session is being torn down.
                    Err(_) => return,
                }
            }

            session.set_connecting();
            let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
            let transport = session
                .connector
                .connect(&session.config.endpoint, outgoing_rx)
                .await;

            let mut transport = match transport {
                Ok(transport) => transport,
                Err(err) => {
                    session_warn!(session, "Failed to connect: {err}");
                    session.on_transport_closed(&err.to_string());
                    if !Self::pause_before_redial(&session, &self.retry).await {
                        session.request_disconnect();
                    }
                    continue;
                }
            };

            session_debug!(session, "Transport established, opening handshake");
            session.on_transport_open(outgoing_tx);

            // Active: poll the transport, drain the queue, watch for a
            // user-requested disconnect.
            let mut closing = false;
            let reason = loop {
                let mut desired = session.desired_watch();
                tokio::select! {
                    result = transport.poll() => match result {
                        TransportPollResult::IncomingFrame(frame) => session.handle_inbound(frame),
                        TransportPollResult::OutgoingMessageSent => {}
                        TransportPollResult::Closed(reason) => break reason,
                    },
                    _ = session.queue.wait() => session.pump_queue(),
                    r = desired.wait_for(|d| !*d), if !closing => {
                        if r.is_ok() {
                            session_debug!(session, "Disconnect requested");
                        }
                        closing = true;
                        // Dropping the sender makes the transport close
                        // cleanly on its next poll.
                        session.drop_outgoing();
                    }
                }
            };
            session.on_transport_closed(&reason);

            if session.connection_desired() {
                if !Self::pause_before_redial(&session, &self.retry).await {
                    session.request_disconnect();
                }
            }
        }
    }

    /// Sleep out the reconnect interval. Returns `false` when automatic
    /// reconnects are off (the caller parks the session instead), `true`
    /// to redial. An explicit `reconnect()` (or a reachability-regained
    /// nudge) cuts the pause short; an explicit `disconnect()` abandons it.
    async fn pause_before_redial(session: &Arc<Session>, retry: &SessionRetryPolicy) -> bool {
        if !session.config.auto_reconnect {
            return false;
        }
        // A nudge stored before the disconnect is stale; only one arriving
        // during the pause may cut it short.
        let _ = futures::FutureExt::now_or_never(session.reconnect_nudged());
        let mut desired = session.desired_watch();
        tokio::select! {
            _ = tokio::time::sleep(retry.next_delay()) => {}
            _ = desired.wait_for(|d| !*d) => {}
            _ = session.reconnect_nudged() => {}
        }
        session.connection_desired()
    }
}
