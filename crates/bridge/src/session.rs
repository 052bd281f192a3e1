//! Bridge Session: owns one SIP leg and one WebRTC leg for a single call,
//! plus the four packet pumps wiring them together, and guarantees that
//! teardown closes every owned resource exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use bridge_protocol::CorrelationToken;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::rtp_relay::RtpRelay;
use crate::sip::{Dialog, SipTransport};
use crate::webrtc_peer::WebRtcPeer;

/// Matches the read-deadline used by the RTP relay and WebRTC media pumps,
/// so a writer task exits within the same bound those pumps give teardown.
const READ_DEADLINE: Duration = Duration::from_millis(100);

pub struct SipLeg {
    pub dialog: Dialog,
    pub transport: Arc<SipTransport>,
    pub audio_relay: Arc<RtpRelay>,
    pub video_relay: Arc<RtpRelay>,
}

pub struct RtcLeg {
    pub peer: WebRtcPeer,
}

pub struct BridgeSession {
    pub token: CorrelationToken,
    pub remote_sip_user: String,
    sip_leg: Mutex<Option<SipLeg>>,
    rtc_leg: Mutex<Option<RtcLeg>>,
    running: AtomicBool,
    /// One writer task per forwarding direction; joined by `teardown` so it
    /// only returns once every pump has observably stopped.
    pump_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeSession {
    /// Wires the four packet pumps between `sip_leg` and `rtc_leg` and
    /// returns the assembled, running session. Call sites register the
    /// result in the [`crate::registry::SessionRegistry`] immediately after.
    pub async fn establish(
        token: CorrelationToken,
        remote_sip_user: String,
        sip_leg: SipLeg,
        rtc_leg: RtcLeg,
    ) -> Arc<Self> {
        let audio_relay = Arc::clone(&sip_leg.audio_relay);
        let video_relay = Arc::clone(&sip_leg.video_relay);

        let session = Arc::new(Self {
            token,
            remote_sip_user,
            sip_leg: Mutex::new(None),
            rtc_leg: Mutex::new(None),
            running: AtomicBool::new(true),
            pump_tasks: Mutex::new(Vec::new()),
        });

        let mut pump_tasks = Vec::with_capacity(4);

        // SIP relay inbound -> local WebRTC egress track. Each direction is
        // fed through an mpsc channel into a single dedicated writer task,
        // so packets are written in the order the read pump received them
        // instead of racing across one detached task per packet.
        {
            let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
            let weak = Arc::downgrade(&session);
            pump_tasks.push(tokio::spawn(async move {
                loop {
                    let Some(session) = weak.upgrade() else { return };
                    if !session.running.load(Ordering::SeqCst) {
                        return;
                    }
                    drop(session);

                    match tokio::time::timeout(READ_DEADLINE, rx.recv()).await {
                        Err(_elapsed) => continue,
                        Ok(None) => return,
                        Ok(Some(bytes)) => {
                            let Some(session) = weak.upgrade() else { return };
                            if let Some(rtc) = session.rtc_leg.lock().await.as_ref()
                                && let Err(e) = rtc.peer.write_audio(&bytes).await
                            {
                                tracing::warn!("failed to forward audio to WebRTC peer: {e}");
                            }
                        }
                    }
                }
            }));
            audio_relay.set_write_handler(move |bytes| {
                let _ = tx.send(bytes.to_vec());
            });
        }
        {
            let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
            let weak = Arc::downgrade(&session);
            pump_tasks.push(tokio::spawn(async move {
                loop {
                    let Some(session) = weak.upgrade() else { return };
                    if !session.running.load(Ordering::SeqCst) {
                        return;
                    }
                    drop(session);

                    match tokio::time::timeout(READ_DEADLINE, rx.recv()).await {
                        Err(_elapsed) => continue,
                        Ok(None) => return,
                        Ok(Some(bytes)) => {
                            let Some(session) = weak.upgrade() else { return };
                            if let Some(rtc) = session.rtc_leg.lock().await.as_ref()
                                && let Err(e) = rtc.peer.write_video(&bytes).await
                            {
                                tracing::warn!("failed to forward video to WebRTC peer: {e}");
                            }
                        }
                    }
                }
            }));
            video_relay.set_write_handler(move |bytes| {
                let _ = tx.send(bytes.to_vec());
            });
        }

        // WebRTC remote track -> SIP relay outbound.
        {
            let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
            let weak = Arc::downgrade(&session);
            pump_tasks.push(tokio::spawn(async move {
                loop {
                    let Some(session) = weak.upgrade() else { return };
                    if !session.running.load(Ordering::SeqCst) {
                        return;
                    }
                    drop(session);

                    match tokio::time::timeout(READ_DEADLINE, rx.recv()).await {
                        Err(_elapsed) => continue,
                        Ok(None) => return,
                        Ok(Some(bytes)) => {
                            let Some(session) = weak.upgrade() else { return };
                            if let Some(sip) = session.sip_leg.lock().await.as_ref()
                                && let Err(e) = sip.audio_relay.write(&bytes).await
                            {
                                tracing::warn!("failed to forward audio to SIP relay: {e}");
                            }
                        }
                    }
                }
            }));
            rtc_leg
                .peer
                .set_audio_write_handler(move |bytes| {
                    let _ = tx.send(bytes.to_vec());
                })
                .await;
        }
        {
            let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
            let weak = Arc::downgrade(&session);
            pump_tasks.push(tokio::spawn(async move {
                loop {
                    let Some(session) = weak.upgrade() else { return };
                    if !session.running.load(Ordering::SeqCst) {
                        return;
                    }
                    drop(session);

                    match tokio::time::timeout(READ_DEADLINE, rx.recv()).await {
                        Err(_elapsed) => continue,
                        Ok(None) => return,
                        Ok(Some(bytes)) => {
                            let Some(session) = weak.upgrade() else { return };
                            if let Some(sip) = session.sip_leg.lock().await.as_ref()
                                && let Err(e) = sip.video_relay.write(&bytes).await
                            {
                                tracing::warn!("failed to forward video to SIP relay: {e}");
                            }
                        }
                    }
                }
            }));
            rtc_leg
                .peer
                .set_video_write_handler(move |bytes| {
                    let _ = tx.send(bytes.to_vec());
                })
                .await;
        }

        *session.sip_leg.lock().await = Some(sip_leg);
        *session.rtc_leg.lock().await = Some(rtc_leg);
        *session.pump_tasks.lock().await = pump_tasks;

        session
    }

    /// Closes every owned resource. Idempotent: the second call on an
    /// already-torn-down session returns `Ok(())` having done nothing, so
    /// callers in the HTTP handler distinguish "not found" purely by
    /// whether the token was still in the registry. Does not return until
    /// every pump has observably exited (bounded by one read-deadline
    /// interval), so a caller that gets `Ok(())` back knows teardown is
    /// complete, not merely requested.
    pub async fn teardown(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        if let Some(rtc) = self.rtc_leg.lock().await.take() {
            rtc.peer.close();
        }

        if let Some(sip) = self.sip_leg.lock().await.take() {
            sip.transport.stop_watching(&sip.dialog.call_id);
            if let Err(e) = sip.transport.bye(&sip.dialog).await {
                tracing::warn!(token = %self.token, "BYE during teardown failed: {e}");
            }
            sip.audio_relay.close();
            sip.video_relay.close();
        }

        for handle in self.pump_tasks.lock().await.drain(..) {
            if let Err(e) = handle.await {
                tracing::warn!(token = %self.token, "pump task panicked during teardown: {e}");
            }
        }

        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Tears down every active session, used on process shutdown. Errors from
/// individual sessions are logged, not propagated — shutdown proceeds
/// regardless.
pub async fn teardown_all(registry: &crate::registry::SessionRegistry) {
    for token in registry.all_tokens() {
        if let Some(session) = registry.remove(&token)
            && let Err(e) = session.teardown().await
        {
            tracing::error!(%token, "error tearing down session during shutdown: {e}");
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// A session with no real network resources, for registry-level tests
    /// that only need a distinct `Arc<BridgeSession>` identity.
    pub fn dummy_session() -> Arc<BridgeSession> {
        Arc::new(BridgeSession {
            token: CorrelationToken::new("test"),
            remote_sip_user: "test".to_string(),
            sip_leg: Mutex::new(None),
            rtc_leg: Mutex::new(None),
            running: AtomicBool::new(true),
            pump_tasks: Mutex::new(Vec::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let session = test_support::dummy_session();
        assert!(session.teardown().await.is_ok());
        assert!(!session.is_running());
        assert!(session.teardown().await.is_ok());
    }
}
