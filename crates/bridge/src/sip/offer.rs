//! Builds the SDP offer sent over SIP to the doorbell. Reuses the browser's
//! origin (session ID/version) so both legs describe the same logical
//! session while substituting our RTP relays' local address and ports.

use std::io::Cursor;
use std::net::IpAddr;

use anyhow::{Context, Result};
use sdp::description::common::{Address, ConnectionInformation};
use sdp::description::media::MediaDescription;
use sdp::description::session::SessionDescription;

const AUDIO_PAYLOAD_TYPE: u8 = 0;
const VIDEO_PAYLOAD_TYPE: u8 = 99;
const VIDEO_FMTP: &str = "profile-level-id=42000a;packetization-mode=0";

pub fn build_sip_offer(
    browser_offer_sdp: &str,
    local_ip: IpAddr,
    audio_port: u16,
    video_port: u16,
) -> Result<String> {
    let mut reader = Cursor::new(browser_offer_sdp.as_bytes());
    let browser = SessionDescription::unmarshal(&mut reader)
        .context("failed to parse browser offer while building the SIP offer")?;

    let mut session = SessionDescription::new_jsep_session_description(false);
    session.origin.session_id = browser.origin.session_id;
    session.origin.session_version = browser.origin.session_version;
    session.origin.address_type = "IP4".to_string();
    session.origin.unicast_address = local_ip.to_string();
    session.session_name = "Pion".to_string();

    let audio = audio_media_description(local_ip, audio_port);
    let video = video_media_description(local_ip, video_port);

    Ok(session.with_media(audio).with_media(video).marshal())
}

fn audio_media_description(local_ip: IpAddr, port: u16) -> MediaDescription {
    let mut media = MediaDescription::new_jsep_media_description("audio".to_string(), vec![])
        .with_codec(AUDIO_PAYLOAD_TYPE, "PCMU".to_string(), 8000, 0, String::new())
        .with_value_attribute("ptime".to_string(), "20".to_string())
        .with_value_attribute("maxptime".to_string(), "150".to_string())
        .with_property_attribute("sendrecv".to_string());
    media.media_name.protos = vec!["RTP".to_string(), "AVP".to_string()];
    media.media_name.port.value = port as isize;
    media.connection_information = Some(connection_information(local_ip));
    media
}

fn video_media_description(local_ip: IpAddr, port: u16) -> MediaDescription {
    let mut media = MediaDescription::new_jsep_media_description("video".to_string(), vec![])
        .with_codec(VIDEO_PAYLOAD_TYPE, "H264".to_string(), 90000, 0, VIDEO_FMTP.to_string())
        .with_property_attribute("sendrecv".to_string());
    media.media_name.protos = vec!["RTP".to_string(), "AVP".to_string()];
    media.media_name.port.value = port as isize;
    media.connection_information = Some(connection_information(local_ip));
    media
}

fn connection_information(local_ip: IpAddr) -> ConnectionInformation {
    ConnectionInformation {
        network_type: "IN".to_string(),
        address_type: "IP4".to_string(),
        address: Some(Address {
            address: local_ip.to_string(),
            ttl: None,
            range: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const BROWSER_OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 0 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:0 PCMU/8000\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 99 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:99 H264/90000\r\n";

    fn local_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9))
    }

    #[test]
    fn carries_browser_session_id_and_version() {
        let offer = build_sip_offer(BROWSER_OFFER, local_ip(), 40000, 40002).unwrap();
        let mut reader = Cursor::new(offer.as_bytes());
        let session = SessionDescription::unmarshal(&mut reader).unwrap();
        assert_eq!(session.origin.session_id, 4611731400430051336);
        assert_eq!(session.origin.session_version, 2);
        assert_eq!(session.origin.unicast_address, "10.0.0.9");
    }

    #[test]
    fn advertises_pcmu_and_h264_at_relay_ports() {
        let offer = build_sip_offer(BROWSER_OFFER, local_ip(), 40000, 40002).unwrap();
        let mut reader = Cursor::new(offer.as_bytes());
        let session = SessionDescription::unmarshal(&mut reader).unwrap();

        let audio = session.media_descriptions.iter().find(|m| m.media_name.media == "audio").unwrap();
        assert_eq!(audio.media_name.formats, vec!["0".to_string()]);
        assert_eq!(audio.media_name.port.value, 40000);
        assert!(audio.attributes.iter().any(|a| a.key == "rtpmap" && a.value.as_deref() == Some("0 PCMU/8000")));
        assert!(audio.attributes.iter().any(|a| a.key == "ptime"));

        let video = session.media_descriptions.iter().find(|m| m.media_name.media == "video").unwrap();
        assert_eq!(video.media_name.formats, vec!["99".to_string()]);
        assert_eq!(video.media_name.port.value, 40002);
        assert!(
            video
                .attributes
                .iter()
                .any(|a| a.key == "fmtp" && a.value.as_deref() == Some("99 profile-level-id=42000a;packetization-mode=0"))
        );
    }
}
