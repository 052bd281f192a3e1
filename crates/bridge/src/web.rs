//! HTTP surface: `/CALL`, `/BYE`, `/healthz`. Thin JSON façade over the
//! bridging state machine — the handlers here own request validation,
//! resource-allocation ordering, and rollback on partial failure; the
//! actual SIP/WebRTC work lives in [`crate::session`].

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use bridge_protocol::{
    BridgeConfig, ByeRequest, ByeResponse, CallRequest, CallResponse, CorrelationToken,
    HealthResponse,
};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::error::BridgeError;
use crate::registry::SessionRegistry;
use crate::rtp_relay::RtpRelay;
use crate::session::{BridgeSession, RtcLeg, SipLeg};
use crate::sip::{Registrar, SipTransport, build_sip_offer};
use crate::webrtc_peer::WebRtcPeer;

pub struct AppState {
    pub config: BridgeConfig,
    pub registry: Arc<SessionRegistry>,
    pub registrar: Arc<Registrar>,
    pub sip_transport: Arc<SipTransport>,
    pub local_ip: IpAddr,
    pub started_at: Instant,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/CALL", post(call_handler))
        .route("/BYE", post(bye_handler))
        .route("/healthz", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn call_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CallRequest>,
) -> Result<Json<CallResponse>, BridgeError> {
    if req.api_key != state.config.api_key {
        return Err(BridgeError::Unauthorized);
    }

    let token = CorrelationToken::new(req.endpoint_id.clone());
    if state.registry.get(&token).is_some() {
        return Err(BridgeError::BadRequest(format!(
            "endpoint {} already has an active call",
            req.endpoint_id
        )));
    }

    let binding = state.registrar.lookup(&req.endpoint_id).ok_or_else(|| {
        BridgeError::SipFailure(format!("endpoint {} is not registered", req.endpoint_id))
    })?;

    let span = tracing::info_span!("call", token = %token);
    let _enter = span.enter();

    let (rtc_peer, answer_sdp) = WebRtcPeer::new_call(&state.config.ice.stun_urls, &req.offer)
        .await
        .map_err(|e| BridgeError::RtcFailure(e.to_string()))?;
    tracing::info!("WebRTC leg established");

    let (sip_leg, termination_rx) = match establish_sip_leg(&state, &req, binding.source).await {
        Ok(v) => v,
        Err(e) => {
            rtc_peer.close();
            return Err(e);
        }
    };
    tracing::info!("SIP leg established");

    let session = BridgeSession::establish(
        token.clone(),
        req.endpoint_id.clone(),
        sip_leg,
        RtcLeg { peer: rtc_peer },
    )
    .await;

    if !state.registry.insert_if_absent(token.clone(), Arc::clone(&session)) {
        let _ = session.teardown().await;
        return Err(BridgeError::BadRequest(format!(
            "endpoint {} already has an active call",
            req.endpoint_id
        )));
    }
    tracing::info!("bridge session registered");

    spawn_termination_watcher(Arc::clone(&state), token, termination_rx);

    Ok(Json(CallResponse { sdp: answer_sdp }))
}

/// Allocates both RTP relays, builds the SIP offer, and sends the INVITE.
/// Closes whatever it already allocated before returning an error so a
/// failed `CALL` never leaks a UDP socket.
async fn establish_sip_leg(
    state: &AppState,
    req: &CallRequest,
    target: SocketAddr,
) -> Result<(SipLeg, mpsc::UnboundedReceiver<()>), BridgeError> {
    let audio_relay = RtpRelay::new("audio", state.local_ip)
        .await
        .map_err(|e| BridgeError::ResourceExhausted(e.to_string()))?;
    let video_relay = match RtpRelay::new("video", state.local_ip).await {
        Ok(relay) => relay,
        Err(e) => {
            audio_relay.close();
            return Err(BridgeError::ResourceExhausted(e.to_string()));
        }
    };

    let offer = match build_sip_offer(
        &req.offer,
        state.local_ip,
        audio_relay.local_port(),
        video_relay.local_port(),
    ) {
        Ok(sdp) => sdp,
        Err(e) => {
            audio_relay.close();
            video_relay.close();
            return Err(BridgeError::RtcFailure(e.to_string()));
        }
    };

    let (dialog, _doorbell_answer) = match state
        .sip_transport
        .invite(target, &req.endpoint_id, &offer)
        .await
    {
        Ok(v) => v,
        Err(e) => {
            audio_relay.close();
            video_relay.close();
            return Err(BridgeError::SipFailure(e.to_string()));
        }
    };

    let termination_rx = state.sip_transport.watch_termination(&dialog.call_id);

    Ok((
        SipLeg {
            dialog,
            transport: Arc::clone(&state.sip_transport),
            audio_relay: Arc::new(audio_relay),
            video_relay: Arc::new(video_relay),
        },
        termination_rx,
    ))
}

/// Auto-tears-down the bridge session if the doorbell hangs up first.
fn spawn_termination_watcher(
    state: Arc<AppState>,
    token: CorrelationToken,
    mut rx: mpsc::UnboundedReceiver<()>,
) {
    tokio::spawn(async move {
        if rx.recv().await.is_some()
            && let Some(session) = state.registry.remove(&token)
        {
            tracing::info!(%token, "remote SIP BYE observed, tearing down bridge session");
            if let Err(e) = session.teardown().await {
                tracing::warn!(%token, "error tearing down session after remote BYE: {e}");
            }
        }
    });
}

async fn bye_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ByeRequest>,
) -> Result<Json<ByeResponse>, BridgeError> {
    if req.api_key != state.config.api_key {
        return Err(BridgeError::Unauthorized);
    }

    let token = CorrelationToken::new(req.endpoint_id.clone());
    let session = state
        .registry
        .remove(&token)
        .ok_or_else(|| BridgeError::NotFound(req.endpoint_id.clone()))?;

    session.teardown().await.map_err(BridgeError::Internal)?;
    tracing::info!(%token, "bridge session torn down via BYE");
    Ok(Json(ByeResponse::default()))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_calls: state.registry.len(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}
