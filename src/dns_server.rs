//! DNS listeners: UDP and TCP on the same serve address.
//!
//! Every datagram / connection is handled on its own task. UDP replies that
//! exceed the client's advertised payload size are emptied and flagged TC so
//! the client retries over TCP.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::handler::{client_identity, Handler};

/// Payload cap for EDNS clients; above this we truncate rather than risk
/// fragmentation.
const MAX_UDP_PAYLOAD: u16 = 1232;

pub struct DnsServer {
    handler: Arc<Handler>,
}

impl DnsServer {
    pub fn new(handler: Arc<Handler>) -> Self {
        Self { handler }
    }

    /// Bind and serve until the shutdown signal flips. Listener tasks are
    /// aborted on shutdown; in-flight queries finish on their own tasks
    /// within the request deadline.
    pub async fn run(&self, addr: &str, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let udp_socket = Arc::new(
            UdpSocket::bind(addr)
                .await
                .with_context(|| format!("bind udp {addr}"))?,
        );
        let tcp_listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind tcp {addr}"))?;
        info!("dns server listening on {addr} (udp+tcp)");

        let udp_task = {
            let socket = udp_socket.clone();
            let handler = self.handler.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    let (size, src) = match socket.recv_from(&mut buf).await {
                        Ok(received) => received,
                        Err(e) => {
                            error!("udp recv failed: {e}");
                            continue;
                        }
                    };
                    let wire = buf[..size].to_vec();
                    let socket = socket.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        let Ok(req) = Message::from_vec(&wire) else {
                            debug!("dropping unparseable udp query from {src}");
                            return;
                        };
                        let client = client_identity(&req, Some(src.ip()));
                        let resp = handler.handle(&req, &client).await;
                        if let Some(wire) = encode_udp_response(&resp, &req) {
                            let _ = socket.send_to(&wire, src).await;
                        }
                    });
                }
            })
        };

        let tcp_task = {
            let handler = self.handler.clone();
            tokio::spawn(async move {
                loop {
                    let (stream, src) = match tcp_listener.accept().await {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("tcp accept failed: {e}");
                            continue;
                        }
                    };
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        serve_tcp_client(stream, src, handler).await;
                    });
                }
            })
        };

        // 等待退出信号，随后停止接收新查询
        let _ = shutdown.changed().await;
        udp_task.abort();
        tcp_task.abort();
        info!("dns listeners closed");
        Ok(())
    }
}

async fn serve_tcp_client(
    mut stream: tokio::net::TcpStream,
    src: SocketAddr,
    handler: Arc<Handler>,
) {
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut wire = vec![0u8; len];
        if stream.read_exact(&mut wire).await.is_err() {
            return;
        }

        let Ok(req) = Message::from_vec(&wire) else {
            debug!("dropping unparseable tcp query from {src}");
            return;
        };
        let client = client_identity(&req, Some(src.ip()));
        let resp = handler.handle(&req, &client).await;

        let Ok(wire) = resp.to_vec() else {
            return;
        };
        if stream
            .write_all(&(wire.len() as u16).to_be_bytes())
            .await
            .is_err()
            || stream.write_all(&wire).await.is_err()
        {
            return;
        }
    }
}

/// Encode for UDP, truncating (empty sections + TC) when the reply exceeds
/// what the client can take: 512 bytes for plain clients, the advertised
/// EDNS size capped at 1232 otherwise.
fn encode_udp_response(resp: &Message, req: &Message) -> Option<Vec<u8>> {
    let limit = req
        .extensions()
        .as_ref()
        .map(|edns| edns.max_payload().clamp(512, MAX_UDP_PAYLOAD))
        .unwrap_or(512) as usize;

    let wire = resp.to_vec().ok()?;
    if wire.len() <= limit {
        return Some(wire);
    }

    let mut truncated = resp.clone();
    truncated.take_answers();
    truncated.take_name_servers();
    truncated.take_additionals();
    truncated.set_truncated(true);
    truncated.to_vec().ok()
}
