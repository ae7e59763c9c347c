//! The request pipeline and the racing engine.
//!
//! A request is scrubbed of ECS, checked against the cache, routed to the
//! matching upstream subset and raced according to the configured strategy.
//! Valid answers are merged and deduplicated; when everything fails a stale
//! cache entry (if any) beats a SERVFAIL.

use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};
use hickory_proto::rr::{RData, Record};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::cache::{self, CacheLookup, CachedMsg, DnsCache};
use crate::config::Strategy;
use crate::stats::Stats;
use crate::upstream::Upstream;

pub struct Handler {
    strategy: Strategy,
    common_upstreams: Vec<Arc<Upstream>>,
    special_upstreams: Vec<Arc<Upstream>>,
    cache: Option<DnsCache>,
    stats: Option<Arc<Stats>>,
    timeout: Duration,
}

impl Handler {
    pub fn new(
        strategy: Strategy,
        upstreams: Vec<Arc<Upstream>>,
        cache: Option<DnsCache>,
        stats: Option<Arc<Stats>>,
        timeout: Duration,
    ) -> Self {
        let (special_upstreams, common_upstreams) = upstreams
            .into_iter()
            .partition(|up| up.has_match_rules());
        Self {
            strategy,
            common_upstreams,
            special_upstreams,
            cache,
            stats,
            timeout,
        }
    }

    /// Route: upstreams whose match rules claim the question, else the
    /// common set.
    fn matched_upstreams(&self, req: &Message) -> Vec<Arc<Upstream>> {
        let Some(q) = req.queries().first() else {
            return self.common_upstreams.clone();
        };
        let domain = q.name().to_string().to_lowercase();
        let matched: Vec<Arc<Upstream>> = self
            .special_upstreams
            .iter()
            .filter(|up| up.is_match(&domain))
            .cloned()
            .collect();
        if matched.is_empty() {
            self.common_upstreams.clone()
        } else {
            matched
        }
    }

    /// Full pipeline entry point. Never fails: the caller always gets a
    /// reply message, worst case a SERVFAIL.
    pub async fn handle(&self, req: &Message, client: &str) -> Message {
        if let Some(stats) = &self.stats {
            stats.record_query();
            let domain = req
                .queries()
                .first()
                .map(|q| q.name().to_string())
                .unwrap_or_default();
            stats.record_client_query(client, &domain);
        }

        let mut req = req.clone();
        strip_ecs(&mut req);

        let cache_key = self.cache.as_ref().and_then(|_| cache::request_key(&req));
        let mut stale: Option<CachedMsg> = None;
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            match cache.get(key) {
                CacheLookup::Fresh(entry) => {
                    if let Some(stats) = &self.stats {
                        stats.record_cache_hit();
                    }
                    let mut resp = cache::replay(&entry, &req, None);
                    set_reply(&mut resp, &req);
                    return resp;
                }
                CacheLookup::Stale(entry) => {
                    stale = Some(entry);
                    if let Some(stats) = &self.stats {
                        stats.record_cache_miss();
                    }
                }
                CacheLookup::Miss => {
                    if let Some(stats) = &self.stats {
                        stats.record_cache_miss();
                    }
                }
            }
        }

        let mut resp = self.exchange(&req).await;

        if resp.response_code() == ResponseCode::ServFail {
            if let Some(stats) = &self.stats {
                stats.record_failed();
            }
            if let Some(entry) = stale {
                // 上游全挂时，陈旧结果好过 SERVFAIL
                let mut resp = cache::replay(&entry, &req, Some(cache::STALE_SERVE_TTL));
                set_reply(&mut resp, &req);
                return resp;
            }
        }

        set_reply(&mut resp, &req);

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if cache::should_cache(&resp) && cache::validate_response(&req, &resp) {
                cache.store(key.clone(), &resp);
            }
        }
        resp
    }

    /// Race the matched upstreams and merge whatever survived validation.
    /// Used directly by the bootstrap resolver, which needs no cache.
    pub async fn exchange(&self, req: &Message) -> Message {
        let mut req = req.clone();
        strip_ecs(&mut req);

        let upstreams = self.matched_upstreams(&req);
        let msgs = match self.strategy {
            Strategy::Fullest => self.race_fullest(&req, upstreams).await,
            Strategy::Fastest => self.race_fastest(&req, upstreams).await,
            Strategy::AnyResult => self.race_any(&req, upstreams).await,
        };

        match merge_messages(msgs) {
            Some(resp) => resp,
            None => {
                let mut resp = Message::new();
                resp.set_response_code(ResponseCode::ServFail);
                resp
            }
        }
    }

    /// Wait for every upstream; keep all validated messages.
    fn race_fullest<'a>(
        &'a self,
        req: &'a Message,
        upstreams: Vec<Arc<Upstream>>,
    ) -> Pin<Box<dyn Future<Output = Vec<Option<Message>>> + Send + 'a>> {
        Box::pin(async move {
            let mut handles = Vec::with_capacity(upstreams.len());
            for up in upstreams {
                let req = req.clone();
                let stats = self.stats.clone();
                handles.push(tokio::spawn(race_tasks::race_fullest_task(up, req, stats)));
            }
            let mut msgs = Vec::with_capacity(handles.len());
            for handle in handles {
                msgs.push(handle.await.unwrap_or(None));
            }
            msgs
        })
    }

    /// Exit as soon as the primary/freedom split is decided: all done, one
    /// answer from each class, or a primary that either produced a valid
    /// answer or was outvoted by an already-valid freedom answer.
    async fn race_fastest(
        &self,
        req: &Message,
        upstreams: Vec<Arc<Upstream>>,
    ) -> Vec<Option<Message>> {
        let n = upstreams.len();
        if n == 0 {
            return Vec::new();
        }

        let state = Arc::new(Mutex::new(race_tasks::RaceFastestState {
            msgs: vec![None; n],
            finished_count: 0,
            finished: false,
            primary_index: Vec::new(),
            freedom_index: Vec::new(),
        }));
        let notify = Arc::new(Notify::new());

        for (j, up) in upstreams.into_iter().enumerate() {
            let req = req.clone();
            let stats = self.stats.clone();
            let state = state.clone();
            let notify = notify.clone();
            tokio::spawn(race_tasks::race_fastest_task(
                up, req, stats, state, notify, j, n,
            ));
        }

        let _ = tokio::time::timeout(self.race_deadline(), notify.notified()).await;
        let mut st = state.lock().unwrap();
        st.finished = true;
        std::mem::take(&mut st.msgs)
    }

    /// First successful response wins, validation skipped. Bootstrap only.
    async fn race_any(&self, req: &Message, upstreams: Vec<Arc<Upstream>>) -> Vec<Option<Message>> {
        let n = upstreams.len();
        if n == 0 {
            return Vec::new();
        }

        let state = Arc::new(Mutex::new(race_tasks::RaceAnyState {
            msgs: vec![None; n],
            finished_count: 0,
            finished: false,
        }));
        let notify = Arc::new(Notify::new());

        for (j, up) in upstreams.into_iter().enumerate() {
            let req = req.clone();
            let stats = self.stats.clone();
            let state = state.clone();
            let notify = notify.clone();
            tokio::spawn(race_tasks::race_any_task(up, req, stats, state, notify, j, n));
        }

        let _ = tokio::time::timeout(self.race_deadline(), notify.notified()).await;
        let mut st = state.lock().unwrap();
        st.finished = true;
        std::mem::take(&mut st.msgs)
    }

    fn race_deadline(&self) -> Duration {
        // 传输层各自有超时，这里只兜底
        self.timeout + Duration::from_millis(500)
    }
}

// Pulled into a submodule on the compiler's own advice: rustc cannot prove
// these spawned futures `Send` while their hidden types are resolved in the
// same scope that defines the `race_fullest`/`race_fastest`/`race_any`
// opaque return types above.
mod race_tasks {
    use std::sync::{Arc, Mutex};

    use hickory_proto::op::Message;
    use tokio::sync::Notify;

    use crate::stats::Stats;
    use crate::upstream::Upstream;

    use super::exchange_once;

    pub(super) async fn race_fullest_task(
        up: Arc<Upstream>,
        req: Message,
        stats: Option<Arc<Stats>>,
    ) -> Option<Message> {
        match exchange_once(&up, &req, stats.as_deref()).await {
            Some(msg) if up.is_valid_msg(&msg) => Some(msg),
            _ => None,
        }
    }

    pub(super) struct RaceFastestState {
        pub msgs: Vec<Option<Message>>,
        pub finished_count: usize,
        pub finished: bool,
        pub primary_index: Vec<usize>,
        pub freedom_index: Vec<usize>,
    }

    pub(super) async fn race_fastest_task(
        up: Arc<Upstream>,
        req: Message,
        stats: Option<Arc<Stats>>,
        state: Arc<Mutex<RaceFastestState>>,
        notify: Arc<Notify>,
        j: usize,
        n: usize,
    ) {
        let result = exchange_once(&up, &req, stats.as_deref()).await;

        let mut st = state.lock().unwrap();
        st.finished_count += 1;
        if st.finished {
            // 竞速已经结束，迟到结果直接丢弃
            return;
        }

        if let Some(msg) = result {
            if up.is_valid_msg(&msg) {
                if up.is_primary {
                    st.primary_index.push(j);
                } else {
                    st.freedom_index.push(j);
                }
                st.msgs[j] = Some(msg);
            } else if up.is_primary {
                // 主上游给了可疑地址：计数但不记入结果，以自由组为准
                st.primary_index.push(j);
            }
        }

        let primary_settled = !st.primary_index.is_empty()
            && (st.msgs[st.primary_index[0]].is_some() || !st.freedom_index.is_empty());
        if st.finished_count == n
            || (!st.primary_index.is_empty() && !st.freedom_index.is_empty())
            || primary_settled
        {
            st.finished = true;
            notify.notify_one();
        }
    }

    pub(super) struct RaceAnyState {
        pub msgs: Vec<Option<Message>>,
        pub finished_count: usize,
        pub finished: bool,
    }

    pub(super) async fn race_any_task(
        up: Arc<Upstream>,
        req: Message,
        stats: Option<Arc<Stats>>,
        state: Arc<Mutex<RaceAnyState>>,
        notify: Arc<Notify>,
        j: usize,
        n: usize,
    ) {
        let result = exchange_once(&up, &req, stats.as_deref()).await;

        let mut st = state.lock().unwrap();
        st.finished_count += 1;
        if st.finished {
            return;
        }
        let ok = result.is_some();
        if ok {
            st.msgs[j] = result;
        }
        if ok || st.finished_count == n {
            st.finished = true;
            notify.notify_one();
        }
    }
}

async fn exchange_once(
    up: &Arc<Upstream>,
    req: &Message,
    stats: Option<&Stats>,
) -> Option<Message> {
    let result = up.exchange(req).await;
    if let Some(stats) = stats {
        stats.record_upstream_query(up.address(), result.is_err());
    }
    match result {
        Ok((msg, rtt)) => {
            debug!("{} answered in {rtt:?}", up.address());
            Some(msg)
        }
        Err(e) => {
            let question = req
                .queries()
                .first()
                .map(|q| q.name().to_string())
                .unwrap_or_default();
            warn!("upstream {} failed for {question}: {e:#}", up.address());
            None
        }
    }
}

/// Concatenate the answers of every kept message into the first one and
/// deduplicate. `None` when no upstream produced anything.
fn merge_messages(msgs: Vec<Option<Message>>) -> Option<Message> {
    let mut res: Option<Message> = None;
    for msg in msgs.into_iter().flatten() {
        match &mut res {
            None => res = Some(msg),
            Some(base) => {
                for answer in msg.answers() {
                    base.add_answer(answer.clone());
                }
            }
        }
    }
    if let Some(res) = &mut res {
        let answers = res.take_answers();
        for answer in unique_answers(answers) {
            res.add_answer(answer);
        }
    }
    res
}

/// Deduplicate by `(owner, rrtype, canonical rdata)`, keeping first-arrival
/// order. Idempotent.
pub fn unique_answers(answers: Vec<Record>) -> Vec<Record> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(answers.len());
    for answer in answers {
        let key = format!(
            "{}|{}|{}",
            answer.name().to_string().to_lowercase(),
            answer.record_type(),
            rdata_key(&answer)
        );
        if seen.insert(key) {
            unique.push(answer);
        }
    }
    unique
}

/// Type-specific rdata canonicalization for the dedup key.
fn rdata_key(record: &Record) -> String {
    match record.data() {
        Some(RData::A(a)) => a.0.to_string(),
        Some(RData::AAAA(aaaa)) => aaaa.0.to_string(),
        Some(RData::CNAME(cname)) => cname.0.to_string().to_lowercase(),
        Some(RData::NS(ns)) => ns.0.to_string().to_lowercase(),
        Some(RData::PTR(ptr)) => ptr.0.to_string().to_lowercase(),
        Some(RData::MX(mx)) => format!("{}|{}", mx.preference(), mx.exchange()),
        Some(RData::SRV(srv)) => format!(
            "{}|{}|{}|{}",
            srv.priority(),
            srv.weight(),
            srv.port(),
            srv.target()
        ),
        Some(RData::TXT(txt)) => txt
            .txt_data()
            .iter()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect::<Vec<_>>()
            .join(""),
        Some(RData::SOA(soa)) => format!("{}|{}", soa.mname(), soa.rname()),
        Some(other) => format!("{other:?}"),
        None => String::new(),
    }
}

/// Remove the EDNS Client Subnet option; the cache is a single shared
/// tenant and upstreams must not see per-client subnets. The rest of the
/// OPT record, including the DO bit, is preserved.
pub fn strip_ecs(req: &mut Message) -> bool {
    if let Some(edns) = req.extensions_mut().as_mut() {
        if edns.option(EdnsCode::Subnet).is_some() {
            edns.options_mut().remove(EdnsCode::Subnet);
            return true;
        }
    }
    false
}

/// Recover the address carried by an EDNS Client Subnet option. `ClientSubnet`
/// exposes no accessor for it, so this goes through its wire encoding.
fn client_subnet_address(subnet: &ClientSubnet) -> Option<IpAddr> {
    let bytes: Vec<u8> = subnet.try_into().ok()?;
    if bytes.len() < 4 {
        return None;
    }
    let family = u16::from_be_bytes([bytes[0], bytes[1]]);
    let addr_bytes = &bytes[4..];
    match family {
        1 => {
            let mut octets = [0u8; 4];
            let n = addr_bytes.len().min(4);
            octets[..n].copy_from_slice(&addr_bytes[..n]);
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        2 => {
            let mut octets = [0u8; 16];
            let n = addr_bytes.len().min(16);
            octets[..n].copy_from_slice(&addr_bytes[..n]);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Client identity for statistics: the ECS address when the request carries
/// one, else the transport peer address.
pub fn client_identity(req: &Message, peer: Option<IpAddr>) -> String {
    if let Some(edns) = req.extensions() {
        if let Some(EdnsOption::Subnet(subnet)) = edns.option(EdnsCode::Subnet) {
            if let Some(addr) = client_subnet_address(subnet) {
                return addr.to_string();
            }
        }
    }
    peer.map(|ip| ip.to_string()).unwrap_or_default()
}

/// Turn `resp` into a reply to `req`: copy the id, mark as response, echo
/// RD, set RA and carry the question over when missing.
pub fn set_reply(resp: &mut Message, req: &Message) {
    resp.set_id(req.id());
    resp.set_message_type(MessageType::Response);
    resp.set_op_code(req.op_code());
    resp.set_recursion_desired(req.recursion_desired());
    resp.set_recursion_available(true);
    if resp.queries().is_empty() {
        resp.add_queries(req.queries().to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Edns, Query};
    use hickory_proto::rr::rdata::{A, CNAME, MX};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn a_record(owner: &str, ip: [u8; 4]) -> Record {
        Record::from_rdata(name(owner), 60, RData::A(A::new(ip[0], ip[1], ip[2], ip[3])))
    }

    #[test]
    fn dedup_is_idempotent_and_order_preserving() {
        let answers = vec![
            a_record("a.com.", [1, 2, 3, 4]),
            a_record("a.com.", [1, 2, 3, 4]),
            a_record("a.com.", [5, 6, 7, 8]),
            a_record("b.com.", [1, 2, 3, 4]),
        ];
        let once = unique_answers(answers);
        assert_eq!(once.len(), 3);
        assert_eq!(once[0].name().to_string(), "a.com.");
        let twice = unique_answers(once.clone());
        assert_eq!(
            once.iter().map(ToString::to_string).collect::<Vec<_>>(),
            twice.iter().map(ToString::to_string).collect::<Vec<_>>()
        );
    }

    #[test]
    fn dedup_distinguishes_owner_type_and_rdata() {
        let answers = vec![
            a_record("a.com.", [1, 2, 3, 4]),
            Record::from_rdata(name("a.com."), 60, RData::CNAME(CNAME(name("b.com.")))),
            Record::from_rdata(name("a.com."), 60, RData::MX(MX::new(10, name("mx.a.com.")))),
            Record::from_rdata(name("a.com."), 60, RData::MX(MX::new(20, name("mx.a.com.")))),
        ];
        assert_eq!(unique_answers(answers).len(), 4);
    }

    #[test]
    fn merge_concatenates_and_dedups() {
        let mut first = Message::new();
        first.add_query(Query::query(name("a.com."), RecordType::A));
        first.add_answer(a_record("a.com.", [1, 2, 3, 4]));

        let mut second = Message::new();
        second.add_answer(a_record("a.com.", [1, 2, 3, 4]));
        second.add_answer(a_record("a.com.", [5, 6, 7, 8]));

        let merged = merge_messages(vec![Some(first), None, Some(second)]).unwrap();
        assert_eq!(merged.answers().len(), 2);
        assert_eq!(merged.queries().len(), 1);
    }

    #[test]
    fn merge_of_nothing_is_none() {
        assert!(merge_messages(vec![None, None]).is_none());
        assert!(merge_messages(Vec::new()).is_none());
    }

    #[test]
    fn ecs_is_stripped_but_do_survives() {
        let mut req = Message::new();
        req.add_query(Query::query(name("a.com."), RecordType::A));
        {
            let edns = req.extensions_mut().get_or_insert_with(Edns::new);
            edns.set_dnssec_ok(true);
            edns.options_mut().insert(EdnsOption::Subnet(
                ClientSubnet::from_str("192.0.2.0/24").unwrap(),
            ));
        }

        assert!(strip_ecs(&mut req));
        let edns = req.extensions().as_ref().unwrap();
        assert!(edns.option(EdnsCode::Subnet).is_none());
        assert!(edns.dnssec_ok());
        // A second pass finds nothing to remove.
        assert!(!strip_ecs(&mut req));
    }

    #[test]
    fn client_identity_prefers_ecs() {
        let mut req = Message::new();
        req.extensions_mut()
            .get_or_insert_with(Edns::new)
            .options_mut()
            .insert(EdnsOption::Subnet(
                ClientSubnet::from_str("192.0.2.0/24").unwrap(),
            ));
        let peer = Some("10.0.0.9".parse().unwrap());
        assert_eq!(client_identity(&req, peer), "192.0.2.0");

        let plain = Message::new();
        assert_eq!(client_identity(&plain, peer), "10.0.0.9");
        assert_eq!(client_identity(&plain, None), "");
    }

    fn failing_upstream() -> Arc<Upstream> {
        // 指向必然拒绝连接的端口
        let mut up: Upstream =
            serde_json::from_value(serde_json::json!({"address": "tcp://127.0.0.1:1"})).unwrap();
        up.init().unwrap();
        up.init_transport(
            None,
            &crate::upstream::TransportOptions {
                timeout: Duration::from_millis(200),
                socks_proxy: None,
                max_active: 2,
                max_idle: 1,
            },
        )
        .unwrap();
        Arc::new(up)
    }

    #[tokio::test]
    async fn total_failure_yields_servfail() {
        let handler = Handler::new(
            Strategy::Fastest,
            vec![failing_upstream()],
            None,
            None,
            Duration::from_millis(200),
        );
        let mut req = Message::new();
        req.set_id(42);
        req.add_query(Query::query(name("down.example."), RecordType::A));

        let resp = handler.handle(&req, "").await;
        assert_eq!(resp.response_code(), ResponseCode::ServFail);
        assert_eq!(resp.id(), 42);
        assert_eq!(resp.queries().len(), 1);
    }

    #[tokio::test]
    async fn stale_entry_beats_servfail() {
        let cache = crate::cache::DnsCache::new();
        let handle = cache.clone();
        let handler = Handler::new(
            Strategy::Fastest,
            vec![failing_upstream()],
            Some(cache),
            None,
            Duration::from_millis(200),
        );

        let mut req = Message::new();
        req.set_id(77);
        req.add_query(Query::query(name("stale.example."), RecordType::A));

        let mut cached = question_with_answer("stale.example.", [9, 9, 9, 9]);
        set_reply(&mut cached, &req);
        handle.insert_for_test(
            crate::cache::request_key(&req).unwrap(),
            cached,
            chrono::Utc::now() - chrono::Duration::seconds(10),
        );

        let resp = handler.handle(&req, "").await;
        assert_eq!(resp.id(), 77);
        assert_eq!(resp.answers().len(), 1);
        assert_eq!(resp.answers()[0].ttl(), crate::cache::STALE_SERVE_TTL);
        assert_eq!(resp.response_code(), ResponseCode::NoError);
    }

    fn question_with_answer(qname: &str, ip: [u8; 4]) -> Message {
        let mut msg = Message::new();
        msg.add_query(Query::query(name(qname), RecordType::A));
        msg.add_answer(a_record(qname, ip));
        msg
    }

    #[test]
    fn set_reply_copies_id_and_question() {
        let mut req = Message::new();
        req.set_id(0x1234);
        req.set_recursion_desired(true);
        req.add_query(Query::query(name("a.com."), RecordType::A));

        let mut resp = Message::new();
        resp.set_response_code(ResponseCode::ServFail);
        set_reply(&mut resp, &req);

        assert_eq!(resp.id(), 0x1234);
        assert_eq!(resp.message_type(), MessageType::Response);
        assert!(resp.recursion_available());
        assert!(resp.recursion_desired());
        assert_eq!(resp.queries().len(), 1);
    }
}
