use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::time::Duration;

const READ_DEADLINE: Duration = Duration::from_millis(100);
const MAX_PACKET_SIZE: usize = 1500;

type WriteHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// One UDP socket dedicated to a single media stream (audio or video) of a
/// single call. Learns the remote peer's address from the first packet it
/// receives and refuses to relay packets from anywhere else afterward.
pub struct RtpRelay {
    name: &'static str,
    socket: Arc<UdpSocket>,
    local_port: u16,
    shutdown: Arc<AtomicBool>,
    learned_remote: Arc<std::sync::Mutex<Option<SocketAddr>>>,
    handler: Arc<std::sync::Mutex<Option<WriteHandler>>>,
}

impl RtpRelay {
    /// Binds an ephemeral UDP port on `bind_ip` and spawns the read pump.
    pub async fn new(name: &'static str, bind_ip: IpAddr) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0))
            .await
            .with_context(|| format!("{name} relay: failed to bind UDP socket on {bind_ip}"))?;
        let local_port = socket.local_addr()?.port();
        let socket = Arc::new(socket);
        let shutdown = Arc::new(AtomicBool::new(false));
        let learned_remote = Arc::new(std::sync::Mutex::new(None));
        let handler: Arc<std::sync::Mutex<Option<WriteHandler>>> =
            Arc::new(std::sync::Mutex::new(None));

        spawn_read_pump(
            name,
            Arc::clone(&socket),
            Arc::clone(&shutdown),
            Arc::clone(&learned_remote),
            Arc::clone(&handler),
        );

        tracing::debug!(relay = name, port = local_port, %bind_ip, "RTP relay bound");

        Ok(Self {
            name,
            socket,
            local_port,
            shutdown,
            learned_remote,
            handler,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Replaces the handler invoked for every inbound packet admitted by the
    /// source-address check. Runs inline on the read pump; must not block.
    pub fn set_write_handler<F>(&self, handler: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(handler));
    }

    /// Sends `payload` to the learned remote address. Returns `Ok(0)` with no
    /// error if no remote has been learned yet (packet silently dropped).
    pub async fn write(&self, payload: &[u8]) -> Result<usize> {
        let remote = *self
            .learned_remote
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let Some(remote) = remote else {
            return Ok(0);
        };
        let n = self.socket.send_to(payload, remote).await.with_context(|| {
            format!("{} relay: failed to send {} bytes to {remote}", self.name, payload.len())
        })?;
        Ok(n)
    }

    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Drop for RtpRelay {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_read_pump(
    name: &'static str,
    socket: Arc<UdpSocket>,
    shutdown: Arc<AtomicBool>,
    learned_remote: Arc<std::sync::Mutex<Option<SocketAddr>>>,
    handler: Arc<std::sync::Mutex<Option<WriteHandler>>>,
) {
    tokio::spawn(async move {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        loop {
            if shutdown.load(Ordering::SeqCst) {
                tracing::debug!(relay = name, "read pump exiting (shutdown)");
                return;
            }

            match tokio::time::timeout(READ_DEADLINE, socket.recv_from(&mut buf)).await {
                Err(_elapsed) => continue, // read deadline, benign
                Ok(Err(e)) => {
                    tracing::warn!(relay = name, "UDP read error: {e}");
                    continue;
                }
                Ok(Ok((n, src))) => {
                    let admitted = {
                        let mut remote = learned_remote.lock().unwrap_or_else(|e| e.into_inner());
                        match *remote {
                            None => {
                                tracing::info!(relay = name, %src, "learned remote address");
                                *remote = Some(src);
                                true
                            }
                            Some(known) if known == src => true,
                            Some(known) => {
                                tracing::warn!(
                                    relay = name,
                                    %src,
                                    %known,
                                    "dropping packet from unexpected source"
                                );
                                false
                            }
                        }
                    };

                    if !admitted {
                        continue;
                    }

                    let handler = handler.lock().unwrap_or_else(|e| e.into_inner()).clone();
                    if let Some(handler) = handler {
                        handler(&buf[..n]);
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn learns_remote_from_first_packet() {
        let relay = RtpRelay::new("test-audio", IpAddr::from([127, 0, 0, 1]))
            .await
            .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = SocketAddr::new(IpAddr::from([127, 0, 0, 1]), relay.local_port());

        let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        relay.set_write_handler(move |data| {
            received_clone.lock().unwrap().push(data.to_vec());
        });

        sender.send_to(b"hello", relay_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(received.lock().unwrap().as_slice(), &[b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn drops_packets_from_unexpected_source() {
        let relay = RtpRelay::new("test-video", IpAddr::from([127, 0, 0, 1]))
            .await
            .unwrap();
        let relay_addr = SocketAddr::new(IpAddr::from([127, 0, 0, 1]), relay.local_port());

        let sender_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        relay.set_write_handler(move |data| {
            received_clone.lock().unwrap().push(data.to_vec());
        });

        sender_a.send_to(b"first", relay_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        sender_b.send_to(b"second", relay_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let got = received.lock().unwrap();
        assert_eq!(got.as_slice(), &[b"first".to_vec()]);
    }

    #[tokio::test]
    async fn write_before_learning_remote_is_noop() {
        let relay = RtpRelay::new("test-noop", IpAddr::from([127, 0, 0, 1]))
            .await
            .unwrap();
        let n = relay.write(b"nobody home").await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn write_after_learning_reaches_sender() {
        let relay = RtpRelay::new("test-echo", IpAddr::from([127, 0, 0, 1]))
            .await
            .unwrap();
        let relay_addr = SocketAddr::new(IpAddr::from([127, 0, 0, 1]), relay.local_port());

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"hi", relay_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let n = relay.write(b"reply").await.unwrap();
        assert_eq!(n, 5);

        let mut buf = [0u8; 16];
        let (n, _) = tokio::time::timeout(Duration::from_millis(500), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"reply");
    }

    #[tokio::test]
    async fn close_stops_read_pump_within_one_deadline() {
        let relay = RtpRelay::new("test-close", IpAddr::from([127, 0, 0, 1]))
            .await
            .unwrap();
        relay.close();
        tokio::time::sleep(READ_DEADLINE * 2).await;
        // No direct observable state beyond not panicking; the real guarantee
        // (pump task exits) is covered by bridge session teardown timing tests.
    }
}
