//! An upstream DNS server: one address, one transport, one trust class.
//!
//! Primary upstreams serve the trusted address zone; their answers are
//! rejected when they fall outside the CIDR membership set. Non-primary
//! ("freedom") upstreams may be tunneled through SOCKS5 and must use a
//! stream transport so responses cannot be forged by a bit-flipping
//! middlebox.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RData;
use rustls::pki_types::ServerName;
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

use crate::bootstrap::Bootstrap;
use crate::doh::DohClient;
use crate::ipset::{self, IpSet};
use crate::pool::{tls_connector, ConnPool, Dialer};
use crate::rules::{self, Rule};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Proto {
    Udp,
    Tcp,
    TcpTls,
    Https,
}

impl Proto {
    fn default_port(&self) -> u16 {
        match self {
            Proto::Udp | Proto::Tcp => 53,
            Proto::TcpTls => 853,
            Proto::Https => 443,
        }
    }
}

/// Shared answer-validation inputs: the primary-zone CIDR set and the
/// blacklist forcing certain names off the primary path.
#[derive(Clone)]
pub struct ValidationPolicy {
    pub ipset: Arc<IpSet>,
    pub blacklist: Arc<Vec<Rule>>,
}

/// Connection limits and plumbing handed to every upstream at startup.
#[derive(Clone)]
pub struct TransportOptions {
    pub timeout: Duration,
    pub socks_proxy: Option<String>,
    pub max_active: usize,
    pub max_idle: usize,
}

#[derive(Deserialize, Default)]
pub struct Upstream {
    #[serde(default)]
    pub is_primary: bool,
    pub address: String,
    #[serde(default)]
    pub use_socks: bool,
    #[serde(default, rename = "match")]
    pub match_patterns: Vec<String>,

    #[serde(skip)]
    proto: Option<Proto>,
    #[serde(skip)]
    host: String,
    #[serde(skip)]
    port: u16,
    #[serde(skip)]
    match_rules: Vec<Rule>,
    #[serde(skip)]
    policy: Option<ValidationPolicy>,
    #[serde(skip)]
    pool: Option<ConnPool>,
    #[serde(skip)]
    doh: Option<DohClient>,
    #[serde(skip)]
    bootstrap: Option<Arc<Bootstrap>>,
    #[serde(skip)]
    timeout: Duration,
}

impl Upstream {
    /// Parse the address and prepare the match rules. Called exactly once at
    /// config load; calling it twice is a programming error.
    pub fn init(&mut self) -> anyhow::Result<()> {
        assert!(
            self.proto.is_none(),
            "upstream {} initialized twice",
            self.address
        );

        let url = Url::parse(&self.address)
            .with_context(|| format!("invalid upstream address {:?}", self.address))?;
        let proto = match url.scheme() {
            "udp" => Proto::Udp,
            "tcp" => Proto::Tcp,
            "tcp-tls" => Proto::TcpTls,
            "https" | "http" => Proto::Https,
            other => anyhow::bail!("unsupported scheme {other:?} in {:?}", self.address),
        };
        let host = url
            .host_str()
            .with_context(|| format!("no host in upstream address {:?}", self.address))?
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();
        self.port = url.port().unwrap_or(proto.default_port());
        self.host = host;
        self.proto = Some(proto);
        self.match_rules = rules::parse_rules(&self.match_patterns);
        Ok(())
    }

    /// Enforce the configuration invariants.
    pub fn validate(&self, socks_configured: bool) -> anyhow::Result<()> {
        let proto = self.proto();
        if !self.is_primary && proto == Proto::Udp {
            anyhow::bail!(
                "non-primary upstream {} must use tcp(-tls)/https, plain udp is forgeable",
                self.address
            );
        }
        if self.is_primary && self.use_socks {
            anyhow::bail!("primary upstream {} must not use the socks proxy", self.address);
        }
        if self.use_socks && !socks_configured {
            anyhow::bail!(
                "upstream {} requests socks but no socks_proxy is configured",
                self.address
            );
        }
        if self.is_primary && proto != Proto::Udp {
            warn!("primary upstream {} would answer faster over udp", self.address);
        }
        Ok(())
    }

    pub fn set_policy(&mut self, policy: ValidationPolicy) {
        self.policy = Some(policy);
    }

    /// Build the transport: a connection pool for stream protocols, a DoH
    /// client for https. The bootstrap resolver turns the configured
    /// hostname into an address at dial time.
    pub fn init_transport(
        &mut self,
        bootstrap: Option<Arc<Bootstrap>>,
        opts: &TransportOptions,
    ) -> anyhow::Result<()> {
        self.timeout = opts.timeout;
        let socks = if self.use_socks {
            opts.socks_proxy.clone()
        } else {
            None
        };

        match self.proto() {
            Proto::Udp => {
                self.bootstrap = bootstrap;
            }
            Proto::Tcp | Proto::TcpTls => {
                let tls = if self.proto() == Proto::TcpTls {
                    let server_name = ServerName::try_from(self.host.clone())
                        .map_err(|_| anyhow::anyhow!("invalid sni host {:?}", self.host))?;
                    Some((tls_connector()?, server_name))
                } else {
                    None
                };
                let dialer = Dialer {
                    host: self.host.clone(),
                    port: self.port,
                    tls,
                    socks,
                    bootstrap,
                    timeout: opts.timeout,
                };
                // 空闲超时放宽到十倍查询超时，复用握手成本高的连接
                self.pool = Some(ConnPool::new(
                    dialer,
                    opts.max_active,
                    opts.max_idle,
                    opts.timeout * 10,
                ));
            }
            Proto::Https => {
                self.doh = Some(DohClient::new(
                    self.address.clone(),
                    opts.timeout,
                    bootstrap,
                    socks.as_deref(),
                )?);
            }
        }
        Ok(())
    }

    pub fn proto(&self) -> Proto {
        self.proto.expect("upstream not initialized")
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn has_match_rules(&self) -> bool {
        !self.match_rules.is_empty()
    }

    /// Whether this upstream's match rules claim the domain.
    pub fn is_match(&self, domain: &str) -> bool {
        rules::has_matched_rule(&self.match_rules, domain)
    }

    /// Per-answer trust policy over the response.
    ///
    /// Private-range addresses are always acceptable (primaries may serve
    /// LAN names). A blacklisted name answered with a primary-zone address
    /// is rejected, as is a primary upstream handing out addresses outside
    /// its zone. A primary with no answers is only trusted for NXDOMAIN.
    pub fn is_valid_msg(&self, resp: &Message) -> bool {
        let Some(policy) = &self.policy else {
            return true;
        };
        let domain = resp
            .queries()
            .first()
            .map(|q| q.name().to_string().to_lowercase())
            .unwrap_or_default();
        let in_blacklist = rules::has_matched_rule(&policy.blacklist, &domain);

        for answer in resp.answers() {
            let ip = match answer.data() {
                Some(RData::A(a)) => IpAddr::V4(a.0),
                Some(RData::AAAA(aaaa)) => IpAddr::V6(aaaa.0),
                _ => continue,
            };
            if ipset::is_private(ip) {
                continue;
            }
            let ip_is_primary = policy.ipset.contains(ip);
            if in_blacklist && ip_is_primary {
                debug!(
                    "{}: rejecting blacklisted {domain} resolved inside the primary zone ({ip})",
                    self.address
                );
                return false;
            }
            if self.is_primary && !ip_is_primary {
                debug!(
                    "{}: rejecting {domain} -> {ip}, outside the primary zone",
                    self.address
                );
                return false;
            }
        }

        if self.is_primary && resp.answers().is_empty() {
            return resp.response_code() == ResponseCode::NXDomain;
        }
        true
    }

    /// Issue the query through the configured transport. The response comes
    /// back with the caller's id and with upstream EDNS state removed.
    pub async fn exchange(&self, req: &Message) -> anyhow::Result<(Message, Duration)> {
        let begin = Instant::now();
        let (mut resp, rtt) = match self.proto() {
            Proto::Udp => (self.exchange_udp(req).await?, begin.elapsed()),
            Proto::Tcp | Proto::TcpTls => (self.exchange_pooled(req).await?, begin.elapsed()),
            Proto::Https => {
                self.doh
                    .as_ref()
                    .context("doh client not initialized")?
                    .exchange(req)
                    .await?
            }
        };
        // 不把上游的 OPT 泄漏给客户端或缓存
        *resp.extensions_mut() = None;
        resp.set_id(req.id());
        Ok((resp, rtt))
    }

    async fn exchange_udp(&self, req: &Message) -> anyhow::Result<Message> {
        let ip: IpAddr = match &self.bootstrap {
            Some(bootstrap) => bootstrap.lookup_ip(&self.host).await,
            None => self
                .host
                .parse()
                .with_context(|| format!("udp upstream host {:?} is not an ip", self.host))?,
        };
        let target = SocketAddr::new(ip, self.port);
        let bind_addr: SocketAddr = if target.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };

        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(target).await?;
        socket.send(&req.to_vec()?).await?;

        let mut buf = vec![0u8; 4096];
        let len = timeout(self.timeout, socket.recv(&mut buf))
            .await
            .context("udp exchange timed out")??;
        buf.truncate(len);
        Ok(Message::from_vec(&buf)?)
    }

    async fn exchange_pooled(&self, req: &Message) -> anyhow::Result<Message> {
        let pool = self.pool.as_ref().context("connection pool not initialized")?;
        let mut conn = pool.get().await?;

        let wire = req.to_vec()?;
        let io = timeout(self.timeout, async {
            conn.stream.write_frame(&wire).await?;
            conn.stream.read_frame().await
        })
        .await;

        match io {
            Ok(Ok(payload)) => {
                pool.release(conn);
                Ok(Message::from_vec(&payload)?)
            }
            Ok(Err(e)) => {
                pool.discard(conn);
                Err(e).context("stream exchange failed")
            }
            Err(_) => {
                pool.discard(conn);
                anyhow::bail!("stream exchange timed out")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::str::FromStr;

    fn upstream(address: &str, is_primary: bool) -> Upstream {
        let mut up = Upstream {
            is_primary,
            address: address.to_string(),
            ..Default::default()
        };
        up.init().unwrap();
        up
    }

    fn policy(blacklist: &[&str]) -> ValidationPolicy {
        ValidationPolicy {
            ipset: Arc::new(IpSet::from_networks(vec!["1.0.0.0/8".parse().unwrap()])),
            blacklist: Arc::new(rules::parse_rules(
                &blacklist.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            )),
        }
    }

    fn answered(name: &str, ip: &str) -> Message {
        let mut msg = Message::new();
        let owner = Name::from_str(name).unwrap();
        msg.add_query(Query::query(owner.clone(), RecordType::A));
        let rdata = match ip.parse::<IpAddr>().unwrap() {
            IpAddr::V4(v4) => RData::A(A(v4)),
            IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
        };
        msg.add_answer(Record::from_rdata(owner, 300, rdata));
        msg
    }

    #[test]
    fn address_parsing_and_default_ports() {
        let up = upstream("udp://223.5.5.5:53", true);
        assert_eq!(up.proto(), Proto::Udp);
        assert_eq!(up.host(), "223.5.5.5");
        assert_eq!(up.port, 53);

        let up = upstream("tcp-tls://dns.example:853", false);
        assert_eq!(up.proto(), Proto::TcpTls);

        let up = upstream("tcp-tls://dns.example", false);
        assert_eq!(up.port, 853);

        let up = upstream("https://dns.example/dns-query", false);
        assert_eq!(up.proto(), Proto::Https);
        assert_eq!(up.port, 443);
    }

    #[test]
    fn invalid_addresses_are_rejected() {
        let mut up = Upstream {
            address: "223.5.5.5:53".to_string(),
            ..Default::default()
        };
        assert!(up.init().is_err());

        let mut up = Upstream {
            address: "quic://dns.example".to_string(),
            ..Default::default()
        };
        assert!(up.init().is_err());
    }

    #[test]
    #[should_panic(expected = "initialized twice")]
    fn double_init_panics() {
        let mut up = upstream("udp://223.5.5.5", true);
        up.init().unwrap();
    }

    #[test]
    fn validate_enforces_class_invariants() {
        // Non-primary over plain udp is forgeable.
        assert!(upstream("udp://8.8.8.8", false).validate(false).is_err());
        // Primary must not route through the proxy.
        let mut up = upstream("udp://223.5.5.5", true);
        up.use_socks = true;
        assert!(up.validate(true).is_err());
        // Socks requested without a proxy configured.
        let mut up = upstream("tcp-tls://8.8.8.8", false);
        up.use_socks = true;
        assert!(up.validate(false).is_err());
        assert!(up.validate(true).is_ok());
        // The happy paths.
        assert!(upstream("udp://223.5.5.5", true).validate(false).is_ok());
        assert!(upstream("https://dns.google/dns-query", false)
            .validate(false)
            .is_ok());
    }

    #[test]
    fn private_addresses_are_always_valid() {
        for ip in ["10.0.0.1", "172.16.0.1", "192.168.1.1", "fd00::1"] {
            let mut up = upstream("udp://223.5.5.5", true);
            up.set_policy(policy(&[]));
            assert!(up.is_valid_msg(&answered("example.lan.", ip)), "{ip}");
        }
    }

    #[test]
    fn primary_rejects_foreign_zone_addresses() {
        let mut up = upstream("udp://223.5.5.5", true);
        up.set_policy(policy(&[]));
        assert!(!up.is_valid_msg(&answered("example.com.", "8.8.8.8")));
        assert!(up.is_valid_msg(&answered("example.com.", "1.0.0.1")));
    }

    #[test]
    fn freedom_accepts_any_public_address() {
        let mut up = upstream("tcp-tls://8.8.8.8", false);
        up.set_policy(policy(&[]));
        assert!(up.is_valid_msg(&answered("example.com.", "8.8.8.8")));
        assert!(up.is_valid_msg(&answered("example.com.", "1.0.0.1")));
    }

    #[test]
    fn blacklist_forces_names_off_the_primary_path() {
        let mut up = upstream("udp://223.5.5.5", true);
        up.set_policy(policy(&[".bing.com"]));
        // A primary-zone answer for a blacklisted name smells like poisoning.
        assert!(!up.is_valid_msg(&answered("www.bing.com.", "1.2.3.4")));
        // The same answer for a non-blacklisted name is fine.
        assert!(up.is_valid_msg(&answered("www.other.com.", "1.2.3.4")));
    }

    #[test]
    fn primary_empty_answer_only_counts_for_nxdomain() {
        let mut up = upstream("udp://223.5.5.5", true);
        up.set_policy(policy(&[]));

        let mut empty = Message::new();
        empty.add_query(Query::query(
            Name::from_str("example.com.").unwrap(),
            RecordType::A,
        ));
        assert!(!up.is_valid_msg(&empty));

        let mut nx = empty.clone();
        nx.set_response_code(ResponseCode::NXDomain);
        assert!(up.is_valid_msg(&nx));

        // Freedom upstreams may legitimately answer with nothing.
        let mut freedom = upstream("tcp-tls://8.8.8.8", false);
        freedom.set_policy(policy(&[]));
        assert!(freedom.is_valid_msg(&empty));
    }

    #[test]
    fn match_rules_route_zones() {
        let mut up = Upstream {
            address: "tcp://10.0.0.2:53".to_string(),
            match_patterns: vec![".onion.".to_string()],
            ..Default::default()
        };
        up.init().unwrap();
        assert!(up.has_match_rules());
        assert!(up.is_match("abc.onion."));
        assert!(!up.is_match("example.com."));
    }
}
