//! Resolving the client key for an HTTP request.
//!
//! The lifecycle core only sees an opaque key; which part of the request
//! it comes from is a deployment choice.

use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::HeaderMap;
use std::net::SocketAddr;

pub const SESSION_COOKIE: &str = "instance_session";
const FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum IdentityMode {
    /// Peer IP address (or first `X-Forwarded-For` hop behind a proxy).
    Address,
    /// Random session id kept in a cookie, issued on create.
    Cookie,
    /// Bearer token supplied by an upstream auth layer.
    Token,
}

#[derive(Debug, Clone)]
pub struct ClientIdentifier {
    mode: IdentityMode,
    trust_proxy: bool,
}

/// A resolved client key, plus a cookie to hand back if one was minted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub key: String,
    pub set_cookie: Option<String>,
}

impl ClientIdentifier {
    pub fn new(mode: IdentityMode, trust_proxy: bool) -> Self {
        Self { mode, trust_proxy }
    }

    /// Resolve the key of an existing client, if the request carries one.
    pub fn identify(&self, headers: &HeaderMap, peer: SocketAddr) -> Option<String> {
        match self.mode {
            IdentityMode::Address => Some(self.client_address(headers, peer)),
            IdentityMode::Cookie => cookie_value(headers, SESSION_COOKIE),
            IdentityMode::Token => bearer_token(headers),
        }
    }

    /// Like [`identify`](Self::identify), but in cookie mode a client
    /// without a session gets a fresh one.
    pub fn identify_or_mint(&self, headers: &HeaderMap, peer: SocketAddr) -> Option<Identity> {
        if let Some(key) = self.identify(headers, peer) {
            return Some(Identity {
                key,
                set_cookie: None,
            });
        }
        match self.mode {
            IdentityMode::Cookie => {
                let key = uuid::Uuid::new_v4().to_string();
                let set_cookie = format!(
                    "{}={}; Path=/; HttpOnly; SameSite=Lax",
                    SESSION_COOKIE, key
                );
                Some(Identity {
                    key,
                    set_cookie: Some(set_cookie),
                })
            }
            IdentityMode::Address | IdentityMode::Token => None,
        }
    }

    /// Address used for verification, independent of identity mode.
    pub fn client_address(&self, headers: &HeaderMap, peer: SocketAddr) -> String {
        if self.trust_proxy {
            let forwarded = headers
                .get(FORWARDED_FOR)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(addr) = forwarded {
                return addr.to_string();
            }
        }
        peer.ip().to_string()
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
        .filter(|v| !v.is_empty())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> SocketAddr {
        "192.0.2.10:51000".parse().unwrap()
    }

    #[test]
    fn test_address_mode_uses_peer_ip() {
        let id = ClientIdentifier::new(IdentityMode::Address, false);
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR, HeaderValue::from_static("203.0.113.5"));
        assert_eq!(id.identify(&headers, peer()).unwrap(), "192.0.2.10");
    }

    #[test]
    fn test_address_mode_trusts_forwarded_for_behind_proxy() {
        let id = ClientIdentifier::new(IdentityMode::Address, true);
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR,
            HeaderValue::from_static("203.0.113.5, 10.0.0.1"),
        );
        assert_eq!(id.identify(&headers, peer()).unwrap(), "203.0.113.5");
        assert_eq!(
            id.identify(&HeaderMap::new(), peer()).unwrap(),
            "192.0.2.10"
        );
    }

    #[test]
    fn test_cookie_mode_reads_session() {
        let id = ClientIdentifier::new(IdentityMode::Cookie, false);
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; instance_session=abc-123"),
        );
        assert_eq!(id.identify(&headers, peer()).unwrap(), "abc-123");
    }

    #[test]
    fn test_cookie_mode_mints_session() {
        let id = ClientIdentifier::new(IdentityMode::Cookie, false);
        assert!(id.identify(&HeaderMap::new(), peer()).is_none());

        let minted = id.identify_or_mint(&HeaderMap::new(), peer()).unwrap();
        let cookie = minted.set_cookie.unwrap();
        assert!(cookie.starts_with(&format!("{}={}", SESSION_COOKIE, minted.key)));
    }

    #[test]
    fn test_token_mode() {
        let id = ClientIdentifier::new(IdentityMode::Token, false);
        let mut headers = HeaderMap::new();
        assert!(id.identify_or_mint(&headers, peer()).is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer team-42"));
        assert_eq!(id.identify(&headers, peer()).unwrap(), "team-42");

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        assert!(id.identify(&headers, peer()).is_none());
    }
}
