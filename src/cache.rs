//! Response cache.
//!
//! Keyed by question name, qtype and the DNSSEC OK bit; ECS never reaches
//! the key because the pipeline strips it before the probe. Entries stay in
//! the store past their DNS expiry for a stale window so an upstream outage
//! can be bridged with a short-TTL stale answer instead of SERVFAIL.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hickory_proto::op::{Edns, Message, ResponseCode};
use hickory_proto::rr::dnssec::rdata::DNSSECRData;
use hickory_proto::rr::{RData, Record, RecordType};
use moka::{sync::Cache, Expiry};
use tracing::{debug, warn};

/// Served TTL floor / ceiling for stored answers.
const MIN_TTL: u32 = 60;
const MAX_TTL: u32 = 3600;
/// How long an entry outlives its DNS expiry inside the store.
const STALE_WINDOW: Duration = Duration::from_secs(3600);
/// TTL stamped on answers served from a stale entry.
pub const STALE_SERVE_TTL: u32 = 12;

const MAX_ENTRIES: u64 = 50_000;
/// TTLs above this are suspicious but tolerated.
const TTL_WARN_THRESHOLD: u32 = 7 * 24 * 3600;

#[derive(Clone)]
pub struct CachedMsg {
    pub msg: Message,
    /// DNS-visible expiry; the store keeps the entry around longer.
    pub expires: DateTime<Utc>,
    store_ttl: Duration,
}

pub enum CacheLookup {
    Fresh(CachedMsg),
    Stale(CachedMsg),
    Miss,
}

struct PerEntryExpiry;

impl Expiry<String, CachedMsg> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedMsg,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.store_ttl)
    }
}

#[derive(Clone)]
pub struct DnsCache {
    inner: Cache<String, CachedMsg>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(MAX_ENTRIES)
                .expire_after(PerEntryExpiry)
                .build(),
        }
    }

    pub fn get(&self, key: &str) -> CacheLookup {
        match self.inner.get(key) {
            Some(entry) if entry.expires > Utc::now() => CacheLookup::Fresh(entry),
            Some(entry) => CacheLookup::Stale(entry),
            None => CacheLookup::Miss,
        }
    }

    /// Store a validated, cacheable response.
    pub fn store(&self, key: String, resp: &Message) {
        let dns_ttl = response_ttl(resp);
        let entry = CachedMsg {
            msg: resp.clone(),
            expires: Utc::now() + chrono::Duration::seconds(dns_ttl.as_secs() as i64),
            store_ttl: dns_ttl + STALE_WINDOW,
        };
        self.inner.insert(key, entry);
    }

    pub fn len(&self) -> u64 {
        self.inner.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, key: String, msg: Message, expires: DateTime<Utc>) {
        self.inner.insert(
            key,
            CachedMsg {
                msg,
                expires,
                store_ttl: STALE_WINDOW,
            },
        );
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache fingerprint: canonical question name, qtype and the DO bit. The DO
/// bit keeps DNSSEC-annotated and plain answers in separate slots.
pub fn request_key(req: &Message) -> Option<String> {
    let q = req.queries().first()?;
    let dnssec = match req.extensions() {
        Some(edns) if edns.dnssec_ok() => "DO",
        _ => "",
    };
    Some(format!(
        "{}#{}#{}",
        q.name().to_string().to_lowercase(),
        u16::from(q.query_type()),
        dnssec
    ))
}

/// Store TTL: minimum answer TTL (60 if there are no answers), clamped to
/// [60 s, 3600 s].
pub fn response_ttl(resp: &Message) -> Duration {
    let ttl = resp
        .answers()
        .iter()
        .map(Record::ttl)
        .min()
        .unwrap_or(MIN_TTL)
        .clamp(MIN_TTL, MAX_TTL);
    Duration::from_secs(ttl as u64)
}

/// Only successful and name-error responses are worth keeping; server
/// failures and format errors must never be cached.
pub fn should_cache(resp: &Message) -> bool {
    matches!(
        resp.response_code(),
        ResponseCode::NoError | ResponseCode::NXDomain
    )
}

/// Anti-poisoning validation, required to pass before every store.
///
/// The question must echo the request; every answer owner must sit on the
/// CNAME chain rooted at the requested name. A CNAME for a foreign owner
/// rejects the message, other foreign-owner records only log (some servers
/// legitimately return glue).
pub fn validate_response(req: &Message, resp: &Message) -> bool {
    let (Some(req_q), Some(resp_q)) = (req.queries().first(), resp.queries().first()) else {
        // 无问题段的响应跳过校验
        return true;
    };

    if req_q.name() != resp_q.name() {
        debug!(
            "response validation failed: name mismatch {} vs {}",
            req_q.name(),
            resp_q.name()
        );
        return false;
    }
    if req_q.query_type() != resp_q.query_type() {
        debug!(
            "response validation failed: qtype mismatch {} vs {}",
            req_q.query_type(),
            resp_q.query_type()
        );
        return false;
    }
    if req_q.query_class() != resp_q.query_class() {
        debug!("response validation failed: qclass mismatch");
        return false;
    }

    let requested = req_q.name().to_string().to_lowercase();
    let mut valid_owners: HashSet<String> = HashSet::new();
    valid_owners.insert(requested.clone());
    for answer in resp.answers() {
        if let Some(RData::CNAME(target)) = answer.data() {
            valid_owners.insert(target.0.to_string().to_lowercase());
        }
    }

    for answer in resp.answers() {
        let owner = answer.name().to_string().to_lowercase();
        if !valid_owners.contains(&owner) {
            if answer.record_type() == RecordType::CNAME {
                debug!(
                    "response validation failed: CNAME for foreign owner {owner}, requested {requested}"
                );
                return false;
            }
            warn!(
                "answer owner {owner} not on the CNAME chain of {requested} (type {})",
                answer.record_type()
            );
        }
        if answer.ttl() > TTL_WARN_THRESHOLD {
            warn!("suspiciously high TTL {} for {owner}", answer.ttl());
        }
    }
    true
}

/// Rebuild a cached message for a new client: every RR TTL becomes the
/// remaining lifetime (or the stale TTL override), expired RRSIGs are
/// dropped and the OPT record is reconstructed to mirror the client's EDNS
/// parameters. Reply flags and id are the pipeline's job.
pub fn replay(entry: &CachedMsg, req: &Message, ttl_override: Option<u32>) -> Message {
    let mut resp = entry.msg.clone();
    let now = Utc::now();
    let remaining =
        ttl_override.unwrap_or_else(|| (entry.expires - now).num_seconds().max(0) as u32);
    let now_epoch = now.timestamp();

    let answers = resp.take_answers();
    for mut record in answers {
        if rrsig_expired(&record, now_epoch) {
            continue;
        }
        record.set_ttl(remaining);
        resp.add_answer(record);
    }
    let authorities = resp.take_name_servers();
    for mut record in authorities {
        if rrsig_expired(&record, now_epoch) {
            continue;
        }
        record.set_ttl(remaining);
        resp.add_name_server(record);
    }
    let additionals = resp.take_additionals();
    for mut record in additionals {
        record.set_ttl(remaining);
        resp.add_additional(record);
    }

    match req.extensions() {
        Some(req_edns) => {
            let mut edns = Edns::new();
            edns.set_max_payload(req_edns.max_payload().max(512));
            edns.set_dnssec_ok(req_edns.dnssec_ok());
            edns.set_version(0);
            resp.set_edns(edns);
        }
        None => {
            *resp.extensions_mut() = None;
        }
    }
    resp
}

fn rrsig_expired(record: &Record, now_epoch: i64) -> bool {
    if let Some(RData::DNSSEC(DNSSECRData::RRSIG(sig))) = record.data() {
        return (sig.sig_expiration() as i64) < now_epoch;
    }
    false
}
