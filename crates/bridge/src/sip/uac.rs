//! SIP transport: one UDP socket shared between the Registrar (handling
//! inbound REGISTER) and the UAC (sending outbound INVITE/BYE and matching
//! their responses). Both directions share the socket because real SIP
//! devices expect requests and responses for a dialog to come from the same
//! port the REGISTER went to.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::message::{SipMessage, SipMethod, SipRequest, SipResponse, parse, parse_cseq, parse_tag};
use super::registrar::Registrar;

const INVITE_TIMEOUT: Duration = Duration::from_secs(8);
const BYE_TIMEOUT: Duration = Duration::from_secs(4);
const MAX_DATAGRAM: usize = 4096;

/// State of one established call leg to the doorbell, enough to build ACK
/// and BYE without re-deriving dialog identifiers.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
    pub target: SocketAddr,
    pub local_contact: String,
    pub remote_uri: String,
}

pub struct SipTransport {
    socket: Arc<UdpSocket>,
    registrar: Arc<Registrar>,
    default_ttl: Duration,
    local_contact_host: String,
    local_contact_port: u16,
    user_agent: String,
    cseq: AtomicU32,
    pending: DashMap<(String, u32), oneshot::Sender<SipResponse>>,
    /// Call-ID -> sender notified when the remote sends BYE for that dialog.
    terminations: DashMap<String, tokio::sync::mpsc::UnboundedSender<()>>,
}

impl SipTransport {
    pub async fn bind(
        bind_addr: SocketAddr,
        registrar: Arc<Registrar>,
        default_ttl: Duration,
        local_contact_host: String,
        local_contact_port: u16,
        user_agent: String,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind SIP UDP socket on {bind_addr}"))?;
        tracing::info!(%bind_addr, "SIP transport bound");

        let transport = Arc::new(Self {
            socket: Arc::new(socket),
            registrar,
            default_ttl,
            local_contact_host,
            local_contact_port,
            user_agent,
            cseq: AtomicU32::new(1),
            pending: DashMap::new(),
            terminations: DashMap::new(),
        });

        spawn_recv_loop(Arc::clone(&transport));
        Ok(transport)
    }

    pub fn local_contact(&self) -> String {
        format!(
            "<sip:doorbell@{}:{}>",
            self.local_contact_host, self.local_contact_port
        )
    }

    fn next_cseq(&self) -> u32 {
        self.cseq.fetch_add(1, Ordering::SeqCst)
    }

    /// Registers a channel to be notified (once) when the remote terminates
    /// the dialog identified by `call_id` with a BYE.
    pub fn watch_termination(&self, call_id: &str) -> tokio::sync::mpsc::UnboundedReceiver<()> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.terminations.insert(call_id.to_string(), tx);
        rx
    }

    pub fn stop_watching(&self, call_id: &str) {
        self.terminations.remove(call_id);
    }

    /// Sends an INVITE carrying `sdp_offer` to `target`, waits for the final
    /// response, and on 2xx sends the matching ACK. Returns the dialog and
    /// the answer SDP body.
    pub async fn invite(&self, target: SocketAddr, to_user: &str, sdp_offer: &str) -> Result<(Dialog, String)> {
        let call_id = format!("{}@{}", Uuid::new_v4(), self.local_contact_host);
        let local_tag = Uuid::new_v4().simple().to_string();
        let cseq = self.next_cseq();
        let branch = format!("z9hG4bK{}", Uuid::new_v4().simple());

        let mut req = SipRequest::new(SipMethod::Invite, format!("sip:{to_user}@{target}"));
        req.headers.push(
            "Via",
            format!(
                "SIP/2.0/UDP {}:{};branch={branch}",
                self.local_contact_host, self.local_contact_port
            ),
        );
        req.headers
            .push("From", format!("<sip:doorbell-bridge@{}>;tag={local_tag}", self.local_contact_host));
        req.headers.push("To", format!("<sip:{to_user}@{target}>"));
        req.headers.push("Call-ID", &call_id);
        req.headers.push("CSeq", format!("{cseq} INVITE"));
        req.headers.push("Contact", self.local_contact());
        req.headers.push("User-Agent", &self.user_agent);
        req.headers.push("Content-Type", "application/sdp");
        let req = req.with_body(sdp_offer);

        let resp = self.send_and_wait(&call_id, cseq, target, req, INVITE_TIMEOUT).await?;

        if !resp.is_success() {
            return Err(anyhow!(
                "INVITE rejected: {} {}",
                resp.status_code,
                resp.reason
            ));
        }

        let remote_tag = resp
            .headers
            .get("To")
            .and_then(parse_tag)
            .ok_or_else(|| anyhow!("2xx response missing To tag"))?
            .to_string();

        let dialog = Dialog {
            call_id: call_id.clone(),
            local_tag,
            remote_tag,
            target,
            local_contact: self.local_contact(),
            remote_uri: format!("sip:{to_user}@{target}"),
        };

        self.send_ack(&dialog, cseq).await?;

        Ok((dialog, resp.body))
    }

    /// ACK reuses the INVITE's CSeq number per RFC 3261 — it is not a new
    /// transaction.
    async fn send_ack(&self, dialog: &Dialog, invite_cseq: u32) -> Result<()> {
        let mut req = SipRequest::new(SipMethod::Ack, dialog.remote_uri.clone());
        req.headers.push(
            "Via",
            format!(
                "SIP/2.0/UDP {}:{};branch=z9hG4bK{}",
                self.local_contact_host,
                self.local_contact_port,
                Uuid::new_v4().simple()
            ),
        );
        req.headers
            .push("From", format!("<sip:doorbell-bridge@{}>;tag={}", self.local_contact_host, dialog.local_tag));
        req.headers
            .push("To", format!("{};tag={}", dialog.remote_uri, dialog.remote_tag));
        req.headers.push("Call-ID", &dialog.call_id);
        req.headers.push("CSeq", format!("{invite_cseq} ACK"));
        let datagram = req.serialize();
        self.socket
            .send_to(datagram.as_bytes(), dialog.target)
            .await
            .context("failed to send ACK")?;
        Ok(())
    }

    /// Sends BYE to tear down an established dialog and waits for the 200 OK.
    pub async fn bye(&self, dialog: &Dialog) -> Result<()> {
        let cseq = self.next_cseq();
        let mut req = SipRequest::new(SipMethod::Bye, dialog.remote_uri.clone());
        req.headers.push(
            "Via",
            format!(
                "SIP/2.0/UDP {}:{};branch=z9hG4bK{}",
                self.local_contact_host,
                self.local_contact_port,
                Uuid::new_v4().simple()
            ),
        );
        req.headers
            .push("From", format!("<sip:doorbell-bridge@{}>;tag={}", self.local_contact_host, dialog.local_tag));
        req.headers
            .push("To", format!("{};tag={}", dialog.remote_uri, dialog.remote_tag));
        req.headers.push("Call-ID", &dialog.call_id);
        req.headers.push("CSeq", format!("{cseq} BYE"));

        let resp = self
            .send_and_wait(&dialog.call_id, cseq, dialog.target, req, BYE_TIMEOUT)
            .await?;
        if !resp.is_success() {
            return Err(anyhow!("BYE rejected: {} {}", resp.status_code, resp.reason));
        }
        self.terminations.remove(&dialog.call_id);
        Ok(())
    }

    async fn send_and_wait(
        &self,
        call_id: &str,
        cseq: u32,
        target: SocketAddr,
        req: SipRequest,
        timeout: Duration,
    ) -> Result<SipResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert((call_id.to_string(), cseq), tx);

        let datagram = req.serialize();
        self.socket
            .send_to(datagram.as_bytes(), target)
            .await
            .with_context(|| format!("failed to send {:?} to {target}", req.method))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_canceled)) => Err(anyhow!("SIP transaction canceled before a response arrived")),
            Err(_elapsed) => {
                self.pending.remove(&(call_id.to_string(), cseq));
                Err(anyhow!("timed out waiting for response to {:?}", req.method))
            }
        }
    }
}

fn spawn_recv_loop(transport: Arc<SipTransport>) {
    tokio::spawn(async move {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (n, source) = match transport.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("SIP UDP read error: {e}");
                    continue;
                }
            };
            let Ok(text) = std::str::from_utf8(&buf[..n]) else {
                tracing::warn!(%source, "dropping non-UTF8 SIP datagram");
                continue;
            };
            let msg = match parse(text) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(%source, "failed to parse SIP datagram: {e}");
                    continue;
                }
            };

            match msg {
                SipMessage::Request(req) if req.method == SipMethod::Register => {
                    let resp = transport
                        .registrar
                        .handle_register(&req, source, transport.default_ttl);
                    let datagram = resp.serialize();
                    if let Err(e) = transport.socket.send_to(datagram.as_bytes(), source).await {
                        tracing::warn!(%source, "failed to send REGISTER response: {e}");
                    }
                }
                SipMessage::Request(req) if req.method == SipMethod::Bye => {
                    if let Some(call_id) = req.headers.get("Call-ID").map(str::to_string) {
                        tracing::info!(%call_id, %source, "remote BYE received, dialog terminated");
                        if let Some(sender) = transport.terminations.get(&call_id) {
                            let _ = sender.send(());
                        }
                    }
                    let mut resp = SipResponse::new(200, "OK");
                    for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
                        if let Some(v) = req.headers.get(name) {
                            resp.headers.push(name, v);
                        }
                    }
                    let datagram = resp.serialize();
                    let _ = transport.socket.send_to(datagram.as_bytes(), source).await;
                }
                SipMessage::Request(req) => {
                    tracing::debug!(method = ?req.method, %source, "ignoring unsupported SIP request");
                }
                SipMessage::Response(resp) => {
                    let Some(call_id) = resp.headers.get("Call-ID").map(str::to_string) else {
                        continue;
                    };
                    let Some((cseq, _method)) = resp.headers.get("CSeq").and_then(parse_cseq) else {
                        continue;
                    };
                    if resp.is_provisional() {
                        tracing::debug!(%call_id, status = resp.status_code, "provisional response, waiting for final");
                        continue;
                    }
                    if let Some((_, sender)) = transport.pending.remove(&(call_id, cseq)) {
                        let _ = sender.send(resp);
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    async fn make_transport(port: u16) -> Arc<SipTransport> {
        let registrar = Registrar::new();
        SipTransport::bind(
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port),
            registrar,
            Duration::from_secs(60),
            "127.0.0.1".to_string(),
            port,
            "doorbell".to_string(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn invite_times_out_with_no_responder() {
        let transport = make_transport(0).await;
        let local_addr = transport.socket.local_addr().unwrap();
        // Nobody is listening on this throwaway port, so the INVITE sits
        // unanswered and the call should time out rather than hang forever.
        let unreachable = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), local_addr.port() ^ 1);
        let result = tokio::time::timeout(
            Duration::from_millis(500),
            transport.invite(unreachable, "doorbell", "v=0\r\n"),
        )
        .await;
        // We expect our own timeout wrapper to fire first; the important
        // thing is invite() doesn't panic and eventually resolves.
        assert!(result.is_err() || result.unwrap().is_err());
    }

    #[tokio::test]
    async fn register_then_lookup_round_trip() {
        let registrar = Registrar::new();
        let transport = SipTransport::bind(
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0),
            Arc::clone(&registrar),
            Duration::from_secs(60),
            "127.0.0.1".to_string(),
            5088,
            "doorbell".to_string(),
        )
        .await
        .unwrap();
        let addr = transport.socket.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let register = "REGISTER sip:sipstacks.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bK1\r\n\
            From: <sip:doorbell@sipstacks.com>;tag=a\r\n\
            To: <sip:doorbell@sipstacks.com>\r\n\
            Call-ID: reg1@10.0.0.5\r\n\
            CSeq: 1 REGISTER\r\n\
            Contact: <sip:doorbell@192.168.1.9:5060>\r\n\
            Content-Length: 0\r\n\r\n";
        client.send_to(register.as_bytes(), addr).await.unwrap();

        let mut buf = [0u8; 1024];
        let (n, _) = tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let resp_text = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(resp_text.starts_with("SIP/2.0 200"));
        assert!(registrar.lookup("doorbell").is_some());
    }
}
