//! WebRTC Peer: browser-facing leg of a bridge session. Pins the browser to
//! PCMU audio and H.264 video (no transcoding happens anywhere in this
//! bridge, so both ends must speak the same codecs byte-for-byte), then
//! pumps raw RTP packets between the browser's tracks and whatever callback
//! the Bridge Session wires up (in practice, the SIP-side RTP relays).

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use sdp::description::common::Attribute;
use sdp::description::session::SessionDescription;
use tokio::sync::Mutex;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::{Marshal, Unmarshal};

const MIME_TYPE_PCMU: &str = "audio/PCMU";
const PCMU_PAYLOAD_TYPE: u8 = 0;
const H264_PAYLOAD_TYPE: u8 = 99;
const H264_FMTP: &str = "profile-level-id=42000a;packetization-mode=0";
const RTCP_READ_DEADLINE: Duration = Duration::from_millis(100);

type PacketHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// The browser-facing leg of one bridge session.
pub struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
    audio_track: Arc<TrackLocalStaticRTP>,
    video_track: Arc<TrackLocalStaticRTP>,
    audio_write_handler: Arc<Mutex<Option<PacketHandler>>>,
    video_write_handler: Arc<Mutex<Option<PacketHandler>>>,
    shutdown: Arc<AtomicBool>,
}

impl WebRtcPeer {
    /// Negotiates a new call: builds the peer connection, pins the browser's
    /// offer to PCMU/H.264, completes non-trickle ICE gathering, and returns
    /// the peer plus the final SDP answer to send back over HTTP.
    pub async fn new_call(stun_urls: &[String], browser_offer_sdp: &str) -> Result<(Self, String)> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_PCMU.to_string(),
                    clock_rate: 8000,
                    channels: 1,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                payload_type: PCMU_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: webrtc::api::media_engine::MIME_TYPE_H264.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: H264_FMTP.to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: H264_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if stun_urls.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: stun_urls.to_vec(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            match state {
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                    tracing::warn!(?state, "WebRTC peer connection state");
                }
                _ => tracing::info!(?state, "WebRTC peer connection state"),
            }
            Box::pin(async {})
        }));

        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_string(),
                clock_rate: 8000,
                channels: 1,
                ..Default::default()
            },
            "pion-audio".to_string(),
            "doorbell-bridge".to_string(),
        ));
        let video_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: webrtc::api::media_engine::MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                sdp_fmtp_line: H264_FMTP.to_string(),
                ..Default::default()
            },
            "pion-video".to_string(),
            "doorbell-bridge".to_string(),
        ));

        let audio_sender = peer_connection
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("failed to add local audio track")?;
        let video_sender = peer_connection
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("failed to add local video track")?;

        let shutdown = Arc::new(AtomicBool::new(false));
        spawn_rtcp_drain("audio", audio_sender, Arc::clone(&shutdown));
        spawn_rtcp_drain("video", video_sender, Arc::clone(&shutdown));

        let audio_write_handler: Arc<Mutex<Option<PacketHandler>>> = Arc::new(Mutex::new(None));
        let video_write_handler: Arc<Mutex<Option<PacketHandler>>> = Arc::new(Mutex::new(None));

        let on_track_audio = Arc::clone(&audio_write_handler);
        let on_track_video = Arc::clone(&video_write_handler);
        let on_track_shutdown = Arc::clone(&shutdown);
        peer_connection.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let kind = track.kind();
            let handler_slot = match kind {
                webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Audio => Arc::clone(&on_track_audio),
                webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Video => Arc::clone(&on_track_video),
                _ => return Box::pin(async {}),
            };
            let shutdown = Arc::clone(&on_track_shutdown);
            Box::pin(async move {
                spawn_media_bridge(track, handler_slot, shutdown);
            })
        }));

        let pinned_offer = pin_codecs(browser_offer_sdp).context("failed to codec-pin browser offer")?;
        let offer = RTCSessionDescription::offer(pinned_offer).context("invalid browser SDP offer")?;
        peer_connection
            .set_remote_description(offer)
            .await
            .context("failed to set remote description")?;

        let answer = peer_connection
            .create_answer(None)
            .await
            .context("failed to create SDP answer")?;

        let mut gather_complete = peer_connection.gathering_complete_promise().await;
        peer_connection
            .set_local_description(answer)
            .await
            .context("failed to set local description")?;
        let _ = gather_complete.recv().await;

        let final_sdp = peer_connection
            .local_description()
            .await
            .ok_or_else(|| anyhow!("no local description after ICE gathering completed"))?
            .sdp;

        Ok((
            Self {
                peer_connection,
                audio_track,
                video_track,
                audio_write_handler,
                video_write_handler,
                shutdown,
            },
            final_sdp,
        ))
    }

    pub async fn set_audio_write_handler<F>(&self, handler: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        *self.audio_write_handler.lock().await = Some(Arc::new(handler));
    }

    pub async fn set_video_write_handler<F>(&self, handler: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        *self.video_write_handler.lock().await = Some(Arc::new(handler));
    }

    /// Forwards a raw RTP packet (header + payload, as received from the SIP
    /// audio relay) onto the local egress audio track.
    pub async fn write_audio(&self, rtp_packet: &[u8]) -> Result<()> {
        write_rtp_bytes(&self.audio_track, rtp_packet).await
    }

    pub async fn write_video(&self, rtp_packet: &[u8]) -> Result<()> {
        write_rtp_bytes(&self.video_track, rtp_packet).await
    }

    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let pc = Arc::clone(&self.peer_connection);
        tokio::spawn(async move {
            if let Err(e) = pc.close().await {
                tracing::warn!("error closing WebRTC peer connection: {e}");
            }
        });
    }
}

async fn write_rtp_bytes(track: &TrackLocalStaticRTP, raw: &[u8]) -> Result<()> {
    let mut buf = raw;
    let packet = webrtc::rtp::packet::Packet::unmarshal(&mut buf).context("failed to parse RTP packet")?;
    track.write_rtp(&packet).await.context("failed to write RTP packet to local track")?;
    Ok(())
}

fn spawn_rtcp_drain(name: &'static str, sender: Arc<RTCRtpSender>, shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            match tokio::time::timeout(RTCP_READ_DEADLINE, sender.read_rtcp()).await {
                Err(_elapsed) => continue,
                Ok(Err(_closed)) => break,
                Ok(Ok(_packets)) => continue,
            }
        }
        tracing::debug!(relay = name, "RTCP drain pump exited");
    });
}

fn spawn_media_bridge(
    track: Arc<TrackRemote>,
    handler_slot: Arc<Mutex<Option<PacketHandler>>>,
    shutdown: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            match tokio::time::timeout(RTCP_READ_DEADLINE, track.read_rtp()).await {
                Err(_elapsed) => continue,
                Ok(Err(_closed)) => return,
                Ok(Ok((packet, _attrs))) => {
                    let handler = handler_slot.lock().await.clone();
                    if let Some(handler) = handler
                        && let Ok(bytes) = packet.marshal()
                    {
                        handler(&bytes);
                    }
                }
            }
        }
    });
}

/// Rewrites every audio `m=` line in `offer_sdp` to advertise only PCMU
/// (payload type 0), keeping exactly the first `rtpmap:*PCMU*` attribute and
/// dropping any other `rtpmap:` attribute, while preserving every
/// non-rtpmap attribute in its original order.
fn pin_codecs(offer_sdp: &str) -> Result<String> {
    let mut reader = Cursor::new(offer_sdp.as_bytes());
    let mut session = SessionDescription::unmarshal(&mut reader).context("failed to parse SDP offer")?;

    for media in session.media_descriptions.iter_mut() {
        if media.media_name.media != "audio" {
            continue;
        }
        media.media_name.formats = vec!["0".to_string()];

        let mut kept_pcmu_rtpmap = false;
        let mut rewritten = Vec::with_capacity(media.attributes.len());
        for attr in media.attributes.drain(..) {
            if attr.key == "rtpmap" {
                let is_pcmu = attr
                    .value
                    .as_deref()
                    .map(|v| v.to_ascii_uppercase().contains("PCMU"))
                    .unwrap_or(false);
                if is_pcmu && !kept_pcmu_rtpmap {
                    kept_pcmu_rtpmap = true;
                    rewritten.push(Attribute::new("rtpmap".to_string(), Some("0 PCMU/8000".to_string())));
                }
                continue;
            }
            rewritten.push(attr);
        }
        if !kept_pcmu_rtpmap {
            rewritten.insert(0, Attribute::new("rtpmap".to_string(), Some("0 PCMU/8000".to_string())));
        }
        media.attributes = rewritten;
    }

    Ok(session.marshal())
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER_WITH_OPUS_AND_PCMU: &str = "v=0\r\n\
o=- 1234 1 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 0 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=sendrecv\r\n\
a=mid:0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 99 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:99 H264/90000\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=sendrecv\r\n";

    #[test]
    fn pins_audio_to_pcmu_only() {
        let pinned = pin_codecs(OFFER_WITH_OPUS_AND_PCMU).unwrap();
        let mut reader = Cursor::new(pinned.as_bytes());
        let session = SessionDescription::unmarshal(&mut reader).unwrap();

        let audio = session
            .media_descriptions
            .iter()
            .find(|m| m.media_name.media == "audio")
            .unwrap();
        assert_eq!(audio.media_name.formats, vec!["0".to_string()]);

        let rtpmaps: Vec<_> = audio
            .attributes
            .iter()
            .filter(|a| a.key == "rtpmap")
            .collect();
        assert_eq!(rtpmaps.len(), 1);
        assert!(rtpmaps[0].value.as_deref().unwrap().contains("PCMU"));

        // non-rtpmap attributes (sendrecv, mid) survive the rewrite.
        assert!(audio.attributes.iter().any(|a| a.key == "sendrecv"));
        assert!(audio.attributes.iter().any(|a| a.key == "mid"));
    }

    #[test]
    fn video_m_line_untouched() {
        let pinned = pin_codecs(OFFER_WITH_OPUS_AND_PCMU).unwrap();
        let mut reader = Cursor::new(pinned.as_bytes());
        let session = SessionDescription::unmarshal(&mut reader).unwrap();

        let video = session
            .media_descriptions
            .iter()
            .find(|m| m.media_name.media == "video")
            .unwrap();
        assert_eq!(video.media_name.formats, vec!["99".to_string(), "96".to_string()]);
    }

    #[test]
    fn pinning_is_idempotent() {
        let once = pin_codecs(OFFER_WITH_OPUS_AND_PCMU).unwrap();
        let twice = pin_codecs(&once).unwrap();

        let mut r1 = Cursor::new(once.as_bytes());
        let s1 = SessionDescription::unmarshal(&mut r1).unwrap();
        let mut r2 = Cursor::new(twice.as_bytes());
        let s2 = SessionDescription::unmarshal(&mut r2).unwrap();

        let audio1 = s1.media_descriptions.iter().find(|m| m.media_name.media == "audio").unwrap();
        let audio2 = s2.media_descriptions.iter().find(|m| m.media_name.media == "audio").unwrap();
        assert_eq!(audio1.media_name.formats, audio2.media_name.formats);
        let rtpmaps2: Vec<_> = audio2.attributes.iter().filter(|a| a.key == "rtpmap").collect();
        assert_eq!(rtpmaps2.len(), 1);
    }
}
