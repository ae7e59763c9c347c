//! Bootstrap resolver: turns upstream hostnames into addresses without
//! recursion by querying a fixed set of literal-IP endpoints.
//!
//! Built on the same handler/upstream machinery as the main pipeline, but
//! with the any-result strategy, no cache and no statistics, which breaks
//! the hostname-lookup cycle.

use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use tracing::{debug, warn};

use crate::config::Strategy;
use crate::handler::Handler;
use crate::upstream::Upstream;

pub struct Bootstrap {
    handler: Handler,
}

impl Bootstrap {
    pub fn new(upstreams: Vec<Arc<Upstream>>, timeout: Duration) -> Self {
        Self {
            handler: Handler::new(Strategy::AnyResult, upstreams, None, None, timeout),
        }
    }

    /// Resolve `host` to an address. Literal IPs pass through untouched; on
    /// any failure the unspecified address is returned so the caller's dial
    /// fails fast instead of hanging.
    pub async fn lookup_ip(&self, host: &str) -> IpAddr {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return ip;
        }

        let mut fqdn = host.to_string();
        if !fqdn.ends_with('.') {
            fqdn.push('.');
        }
        let name = match Name::from_str(&fqdn) {
            Ok(name) => name,
            Err(e) => {
                warn!("bootstrap: invalid host {host:?}: {e}");
                return IpAddr::V4(Ipv4Addr::UNSPECIFIED);
            }
        };

        let mut query = Message::new();
        query.set_id(rand::random());
        query.set_recursion_desired(true);
        query.add_query(Query::query(name, RecordType::A));

        let resp = self.handler.exchange(&query).await;

        // 取最后一个 A 记录，通常是备用地址，存活率更高
        let mut ip = None;
        for answer in resp.answers() {
            if let Some(RData::A(a)) = answer.data() {
                ip = Some(IpAddr::V4(a.0));
            }
        }
        match ip {
            Some(ip) => {
                debug!("bootstrap: {host} -> {ip}");
                ip
            }
            None => {
                warn!("bootstrap: no ipv4 address for {host}, dial will fail fast");
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::TransportOptions;
    use hickory_proto::op::MessageType;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::Record;
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn literal_ips_pass_through() {
        let bootstrap = Bootstrap::new(Vec::new(), Duration::from_millis(100));
        assert_eq!(
            bootstrap.lookup_ip("223.5.5.5").await,
            "223.5.5.5".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            bootstrap.lookup_ip("2001:da8::1").await,
            "2001:da8::1".parse::<IpAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn failure_yields_the_unspecified_address() {
        // No endpoints configured: the inner race produces SERVFAIL.
        let bootstrap = Bootstrap::new(Vec::new(), Duration::from_millis(100));
        assert_eq!(
            bootstrap.lookup_ip("dns.example").await,
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );
    }

    #[tokio::test]
    async fn resolves_hostnames_through_the_endpoint() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((size, src)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let Ok(req) = Message::from_vec(&buf[..size]) else {
                    continue;
                };
                let mut resp = Message::new();
                resp.set_id(req.id());
                resp.set_message_type(MessageType::Response);
                resp.add_queries(req.queries().to_vec());
                let q = req.queries()[0].name().clone();
                resp.add_answer(Record::from_rdata(q.clone(), 60, RData::A(A::new(1, 2, 3, 4))));
                // 多个 A 记录时取最后一个
                resp.add_answer(Record::from_rdata(q, 60, RData::A(A::new(5, 6, 7, 8))));
                let _ = socket.send_to(&resp.to_vec().unwrap(), src).await;
            }
        });

        let mut up: Upstream =
            serde_json::from_value(serde_json::json!({"address": format!("udp://{addr}")}))
                .unwrap();
        up.init().unwrap();
        up.init_transport(
            None,
            &TransportOptions {
                timeout: Duration::from_secs(1),
                socks_proxy: None,
                max_active: 2,
                max_idle: 1,
            },
        )
        .unwrap();

        let bootstrap = Bootstrap::new(vec![Arc::new(up)], Duration::from_secs(1));
        assert_eq!(
            bootstrap.lookup_ip("dns.example").await,
            "5.6.7.8".parse::<IpAddr>().unwrap()
        );
    }
}
