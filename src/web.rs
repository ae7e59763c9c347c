//! HTTP surface: the stats API and the DoH endpoint.
//!
//! The DoH endpoint is a thin frame around the pipeline: decode the GET
//! `dns` parameter, run the handler, return wire bytes. It only exists when
//! `doh_server` is configured, optionally behind HTTP Basic auth.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use hickory_proto::op::Message;
use serde_json::json;
use tracing::debug;

use crate::config::DohServerConfig;
use crate::doh::DOH_MEDIA_TYPE;
use crate::handler::Handler;
use crate::stats::Stats;

pub struct WebState {
    pub handler: Arc<Handler>,
    pub stats: Arc<Stats>,
    pub doh: Option<DohServerConfig>,
}

pub fn router(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/api/stats", get(get_stats))
        .route("/api/stats/reset", post(reset_stats))
        .route("/api/version", get(get_version))
        .route("/dns-query", get(doh_query))
        .with_state(state)
}

async fn get_stats(State(state): State<Arc<WebState>>) -> Response {
    Json(state.stats.snapshot()).into_response()
}

async fn reset_stats(State(state): State<Arc<WebState>>) -> Response {
    state.stats.reset();
    Json(json!({"ok": true})).into_response()
}

async fn get_version() -> Response {
    Json(json!({"version": env!("CARGO_PKG_VERSION")})).into_response()
}

async fn doh_query(
    State(state): State<Arc<WebState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let Some(doh) = &state.doh else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if !doh.username.is_empty()
        && !doh.password.is_empty()
        && !basic_auth_ok(&headers, &doh.username, &doh.password)
    {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, r#"Basic realm="dns""#)],
        )
            .into_response();
    }

    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if accept != DOH_MEDIA_TYPE {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("unsupported media type: {accept}"),
        )
            .into_response();
    }

    let Some(encoded) = params.get("dns") else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let wire = match URL_SAFE_NO_PAD.decode(encoded) {
        Ok(wire) => wire,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let req = match Message::from_vec(&wire) {
        Ok(req) => req,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    state.stats.record_doh_query();
    let client = http_client_ip(&headers, connect_info.map(|ConnectInfo(addr)| addr));
    debug!("doh query from {client}");

    let resp = state.handler.handle(&req, &client).await;
    match resp.to_vec() {
        Ok(wire) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, DOH_MEDIA_TYPE)],
            wire,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn basic_auth_ok(headers: &HeaderMap, username: &str, password: &str) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    match decoded.split_once(':') {
        Some((user, pass)) => user == username && pass == password,
        None => false,
    }
}

/// Real client address behind proxies: X-Forwarded-For first hop, then
/// X-Real-IP, then the socket peer.
fn http_client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(xff) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = xff.split(',').next() {
            let first = first.trim();
            if first.parse::<std::net::IpAddr>().is_ok() {
                return first.to_string();
            }
        }
    }
    if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if xri.parse::<std::net::IpAddr>().is_ok() {
            return xri.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}
