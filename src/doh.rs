//! DNS-over-HTTPS client.
//!
//! RFC 8484 GET exchange: the wire query travels base64url-encoded in the
//! `dns` parameter with the message id zeroed for cache friendliness. The
//! HTTP client resolves the server hostname through the bootstrap resolver
//! and can be routed through a SOCKS5 proxy.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hickory_proto::op::Message;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::header;

use crate::bootstrap::Bootstrap;

pub const DOH_MEDIA_TYPE: &str = "application/dns-message";

pub struct DohClient {
    server: String,
    client: reqwest::Client,
}

impl DohClient {
    /// `server` is the full endpoint URL, e.g. `https://dns.google/dns-query`.
    pub fn new(
        server: String,
        timeout: Duration,
        bootstrap: Option<Arc<Bootstrap>>,
        socks: Option<&str>,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout);
        if let Some(bootstrap) = bootstrap {
            builder = builder.dns_resolver(Arc::new(BootstrapResolver(bootstrap)));
        }
        if let Some(proxy) = socks {
            // socks5:// 而非 socks5h://，域名仍由 bootstrap 本地解析
            builder = builder
                .proxy(reqwest::Proxy::all(format!("socks5://{proxy}"))?);
        }
        Ok(Self {
            server,
            client: builder.build().context("build doh http client")?,
        })
    }

    pub async fn exchange(&self, req: &Message) -> anyhow::Result<(Message, Duration)> {
        let begin = Instant::now();
        let orig_id = req.id();

        let mut wire_req = req.clone();
        wire_req.set_id(0);
        let wire = wire_req.to_vec().context("encode doh query")?;
        let encoded = URL_SAFE_NO_PAD.encode(&wire);

        let resp = self
            .client
            .get(format!("{}?dns={}", self.server, encoded))
            .header(header::ACCEPT, DOH_MEDIA_TYPE)
            .header(
                header::USER_AGENT,
                concat!("splitdns/", env!("CARGO_PKG_VERSION")),
            )
            .send()
            .await?;

        let status = resp.status();
        let body = resp.bytes().await?;
        if status != reqwest::StatusCode::OK {
            anyhow::bail!(
                "doh query failed ({status}): {}",
                String::from_utf8_lossy(&body)
            );
        }

        let mut msg = Message::from_vec(&body).context("decode doh response")?;
        msg.set_id(orig_id);
        Ok((msg, begin.elapsed()))
    }

    pub fn server(&self) -> &str {
        &self.server
    }
}

/// Feeds bootstrap lookups into reqwest's connector so DoH hostnames never
/// go through the system resolver.
struct BootstrapResolver(Arc<Bootstrap>);

impl Resolve for BootstrapResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let bootstrap = self.0.clone();
        Box::pin(async move {
            let ip = bootstrap.lookup_ip(name.as_str()).await;
            let addrs: Addrs = Box::new(std::iter::once(SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}
