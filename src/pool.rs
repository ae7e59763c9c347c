//! Per-upstream TCP / TLS connection pool.
//!
//! Bounded by `max_active` concurrently borrowed connections; up to
//! `max_idle` healthy connections are kept for reuse until their idle
//! deadline passes. A borrowed connection is either released back (clean) or
//! discarded (tainted by an I/O error).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use crate::bootstrap::Bootstrap;

/// A pooled stream: plain TCP or TLS over TCP.
pub enum DnsStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl DnsStream {
    /// Write one length-prefixed DNS message.
    pub async fn write_frame(&mut self, payload: &[u8]) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(payload.len() + 2);
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(payload);
        match self {
            DnsStream::Tcp(s) => s.write_all(&buf).await,
            DnsStream::Tls(s) => s.write_all(&buf).await,
        }
    }

    /// Read one length-prefixed DNS message.
    pub async fn read_frame(&mut self) -> std::io::Result<Vec<u8>> {
        let mut len_buf = [0u8; 2];
        match self {
            DnsStream::Tcp(s) => s.read_exact(&mut len_buf).await?,
            DnsStream::Tls(s) => s.read_exact(&mut len_buf).await?,
        };
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        match self {
            DnsStream::Tcp(s) => s.read_exact(&mut payload).await?,
            DnsStream::Tls(s) => s.read_exact(&mut payload).await?,
        };
        Ok(payload)
    }
}

/// Everything needed to establish one upstream connection.
pub struct Dialer {
    pub host: String,
    pub port: u16,
    /// TLS connector plus SNI (the configured hostname, not the resolved IP).
    pub tls: Option<(TlsConnector, ServerName<'static>)>,
    /// SOCKS5 proxy endpoint (`host:port`).
    pub socks: Option<String>,
    /// Resolves the configured hostname when it is not a literal IP.
    pub bootstrap: Option<Arc<Bootstrap>>,
    pub timeout: Duration,
}

impl Dialer {
    async fn dial(&self) -> anyhow::Result<DnsStream> {
        let ip: IpAddr = match &self.bootstrap {
            Some(bootstrap) => bootstrap.lookup_ip(&self.host).await,
            // 无 bootstrap 时地址必须是字面 IP，解析失败则用 0.0.0.0 快速失败
            None => self
                .host
                .parse()
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        };
        let addr = SocketAddr::new(ip, self.port);
        debug!("dialing {}:{} via {}", self.host, self.port, addr);

        let tcp = match &self.socks {
            Some(proxy) => {
                let stream = timeout(self.timeout, Socks5Stream::connect(proxy.as_str(), addr))
                    .await
                    .context("socks connect timed out")??;
                stream.into_inner()
            }
            None => timeout(self.timeout, TcpStream::connect(addr))
                .await
                .context("connect timed out")??,
        };

        match &self.tls {
            Some((connector, server_name)) => {
                let tls = timeout(self.timeout, connector.connect(server_name.clone(), tcp))
                    .await
                    .context("tls handshake timed out")??;
                Ok(DnsStream::Tls(Box::new(tls)))
            }
            None => Ok(DnsStream::Tcp(tcp)),
        }
    }
}

/// Build a TLS connector over the webpki root set.
pub fn tls_connector() -> anyhow::Result<TlsConnector> {
    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(root_store)
    .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

struct IdleConn {
    stream: DnsStream,
    expires_at: Instant,
}

/// A borrowed connection. Holding it occupies one `max_active` slot until it
/// is handed back through `release` or `discard`.
pub struct PooledConn {
    pub stream: DnsStream,
    _permit: OwnedSemaphorePermit,
}

pub struct ConnPool {
    dialer: Dialer,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConn>>,
    max_idle: usize,
    idle_timeout: Duration,
}

impl ConnPool {
    pub fn new(dialer: Dialer, max_active: usize, max_idle: usize, idle_timeout: Duration) -> Self {
        Self {
            dialer,
            permits: Arc::new(Semaphore::new(max_active.max(1))),
            idle: Mutex::new(Vec::new()),
            max_idle,
            idle_timeout,
        }
    }

    /// Borrow a connection: an unexpired idle one if available, otherwise a
    /// fresh dial. Blocks on the active cap, bounded by the dial timeout.
    pub async fn get(&self) -> anyhow::Result<PooledConn> {
        let permit = timeout(self.dialer.timeout, self.permits.clone().acquire_owned())
            .await
            .context("waiting for a free connection slot timed out")?
            .expect("pool semaphore closed");

        let now = Instant::now();
        {
            let mut idle = self.idle.lock().unwrap();
            while let Some(conn) = idle.pop() {
                if conn.expires_at > now {
                    return Ok(PooledConn {
                        stream: conn.stream,
                        _permit: permit,
                    });
                }
                // 过期连接直接丢弃
            }
        }

        let stream = self.dialer.dial().await?;
        Ok(PooledConn {
            stream,
            _permit: permit,
        })
    }

    /// Hand a healthy connection back for reuse.
    pub fn release(&self, conn: PooledConn) {
        let mut idle = self.idle.lock().unwrap();
        if idle.len() < self.max_idle {
            idle.push(IdleConn {
                stream: conn.stream,
                expires_at: Instant::now() + self.idle_timeout,
            });
        }
        // Dropping `conn` frees its active permit either way.
    }

    /// Drop a tainted connection; it never re-enters the pool.
    pub fn discard(&self, conn: PooledConn) {
        drop(conn);
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    loop {
                        let mut len_buf = [0u8; 2];
                        if stream.read_exact(&mut len_buf).await.is_err() {
                            return;
                        }
                        let len = u16::from_be_bytes(len_buf) as usize;
                        let mut payload = vec![0u8; len];
                        if stream.read_exact(&mut payload).await.is_err() {
                            return;
                        }
                        let mut out = len_buf.to_vec();
                        out.extend_from_slice(&payload);
                        if stream.write_all(&out).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    fn pool_for(addr: SocketAddr, max_idle: usize) -> ConnPool {
        ConnPool::new(
            Dialer {
                host: addr.ip().to_string(),
                port: addr.port(),
                tls: None,
                socks: None,
                bootstrap: None,
                timeout: Duration::from_secs(2),
            },
            4,
            max_idle,
            Duration::from_secs(20),
        )
    }

    #[tokio::test]
    async fn frame_round_trip_and_reuse() {
        let addr = echo_server().await;
        let pool = pool_for(addr, 4);

        let mut conn = pool.get().await.unwrap();
        conn.stream.write_frame(b"hello").await.unwrap();
        assert_eq!(conn.stream.read_frame().await.unwrap(), b"hello");
        pool.release(conn);
        assert_eq!(pool.idle_len(), 1);

        // The released connection is borrowed again instead of re-dialing.
        let mut conn = pool.get().await.unwrap();
        assert_eq!(pool.idle_len(), 0);
        conn.stream.write_frame(b"again").await.unwrap();
        assert_eq!(conn.stream.read_frame().await.unwrap(), b"again");
        pool.discard(conn);
        assert_eq!(pool.idle_len(), 0);
    }

    #[tokio::test]
    async fn idle_cap_is_enforced() {
        let addr = echo_server().await;
        let pool = pool_for(addr, 1);

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle_len(), 1);
    }

    #[tokio::test]
    async fn unresolvable_host_fails_fast() {
        let pool = ConnPool::new(
            Dialer {
                host: "not-an-ip.invalid".to_string(),
                port: 1,
                tls: None,
                socks: None,
                bootstrap: None,
                timeout: Duration::from_millis(300),
            },
            1,
            1,
            Duration::from_secs(1),
        );
        assert!(pool.get().await.is_err());
    }
}
