use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::header::COOKIE;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue};
use rand::Rng;

use crate::config_parser::IdentityConfig;
use crate::error::{Error, ErrorDetails};

/// Response header telling the browser a fresh identifier cookie was issued
pub const COOKIE_SET_HEADER: &str = "x-cookie-set";

/// Response header carrying the caller's cookie identifier
pub const USER_ID_HEADER: &str = "x-user-id";

const UNKNOWN_CLIENT: &str = "unknown";
const ID_SUFFIX_LEN: usize = 13;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Everything about the caller that can identify them for quota purposes
#[derive(Debug, Clone)]
pub struct RequestIdentity {
    cookies: HashMap<String, String>,
    client_ip: String,
}

impl<S> FromRequestParts<S> for RequestIdentity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Self::from_headers(&parts.headers, peer))
    }
}

impl RequestIdentity {
    pub fn from_headers(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        let mut cookies = HashMap::new();
        for value in headers.get_all(COOKIE) {
            if let Ok(value) = value.to_str() {
                cookies.extend(parse_cookie_header(value));
            }
        }
        Self {
            cookies,
            client_ip: client_ip(headers, peer),
        }
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    /// Identifier used to key quota records: the cookie when present, else the client IP
    pub fn quota_identifier(&self, config: &IdentityConfig) -> String {
        match self.cookie(&config.cookie_name) {
            Some(id) => id.to_string(),
            None => self.client_ip.clone(),
        }
    }

    /// The cookie identifier, or a freshly generated one with the `Set-Cookie` value to send back.
    ///
    /// A freshly issued identifier has no usage yet. Quota lookups for this request still go
    /// through [`Self::quota_identifier`].
    pub fn user_id_or_issue(
        &self,
        config: &IdentityConfig,
    ) -> Result<(String, Option<HeaderValue>), Error> {
        if let Some(id) = self.cookie(&config.cookie_name) {
            return Ok((id.to_string(), None));
        }
        let id = generate_user_id();
        let set_cookie = build_set_cookie(config, &id)?;
        Ok((id, Some(set_cookie)))
    }
}

/// Parse a `Cookie` header into name/value pairs.
///
/// Values are percent-decoded. Pairs with an empty name, an empty value, or a value that does not
/// decode are skipped.
pub fn parse_cookie_header(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            if name.is_empty() || value.is_empty() {
                return None;
            }
            Some((name.to_string(), percent_decode(value)?))
        })
        .collect()
}

fn percent_decode(value: &str) -> Option<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            if !hex.iter().all(u8::is_ascii_hexdigit) {
                return None;
            }
            let hex = std::str::from_utf8(hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// `{unix millis}-{random base36}`. Unique enough for usage tracking, not a secret.
pub fn generate_user_id() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| BASE36[rng.random_range(0..BASE36.len())] as char)
        .collect();
    format!("{}-{suffix}", chrono::Utc::now().timestamp_millis())
}

pub fn build_set_cookie(config: &IdentityConfig, id: &str) -> Result<HeaderValue, Error> {
    let mut cookie = format!(
        "{}={id}; HttpOnly; SameSite=Strict; Path=/; Max-Age={}",
        config.cookie_name, config.cookie_max_age_secs
    );
    if config.secure_cookie {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie).map_err(|e| {
        Error::new(ErrorDetails::InternalError {
            message: format!("Failed to build identifier cookie: {e}"),
        })
    })
}

/// Best guess at the caller's address: first `x-forwarded-for` hop, then `x-vercel-ip`,
/// then the socket peer, then `"unknown"`.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let vercel = headers
        .get("x-vercel-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = vercel {
        return ip.to_string();
    }

    match peer {
        Some(addr) => addr.ip().to_string(),
        None => UNKNOWN_CLIENT.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_parse_cookie_header() {
        let cookies = parse_cookie_header("theme=dark; santa_user_id=abc%2D123 ; empty=; =nameless");
        assert_eq!(cookies.get("theme").map(String::as_str), Some("dark"));
        assert_eq!(cookies.get("santa_user_id").map(String::as_str), Some("abc-123"));
        assert!(!cookies.contains_key("empty"));
        assert_eq!(cookies.len(), 2);
    }

    #[test]
    fn test_parse_cookie_header_skips_bad_escapes() {
        let cookies = parse_cookie_header("a=%zz; b=%4; c=ok%20go; d=%+1; e=%-1");
        assert!(!cookies.contains_key("a"));
        assert!(!cookies.contains_key("b"));
        assert!(!cookies.contains_key("d"));
        assert!(!cookies.contains_key("e"));
        assert_eq!(cookies.get("c").map(String::as_str), Some("ok go"));
    }

    #[test]
    fn test_value_may_contain_equals() {
        let cookies = parse_cookie_header("token=a=b");
        assert_eq!(cookies.get("token").map(String::as_str), Some("a=b"));
    }

    #[test]
    fn test_generate_user_id_shape() {
        let id = generate_user_id();
        let (millis, suffix) = id.split_once('-').unwrap();
        assert!(millis.parse::<i64>().unwrap() > 0);
        assert_eq!(suffix.len(), ID_SUFFIX_LEN);
        assert!(suffix.bytes().all(|b| BASE36.contains(&b)));
        assert_ne!(generate_user_id(), id);
    }

    #[test]
    fn test_build_set_cookie() {
        let mut config = IdentityConfig::default();
        let cookie = build_set_cookie(&config, "42-abc").unwrap();
        assert_eq!(
            cookie.to_str().unwrap(),
            "santa_user_id=42-abc; HttpOnly; SameSite=Strict; Path=/; Max-Age=31536000"
        );

        config.secure_cookie = true;
        let cookie = build_set_cookie(&config, "42-abc").unwrap();
        assert!(cookie.to_str().unwrap().ends_with("; Secure"));
    }

    #[test]
    fn test_client_ip_precedence() {
        let peer: SocketAddr = "10.0.0.9:5555".parse().unwrap();

        let h = headers(&[
            ("x-forwarded-for", " 203.0.113.7 , 10.0.0.1"),
            ("x-vercel-ip", "198.51.100.2"),
        ]);
        assert_eq!(client_ip(&h, Some(peer)), "203.0.113.7");

        let h = headers(&[("x-vercel-ip", "198.51.100.2")]);
        assert_eq!(client_ip(&h, Some(peer)), "198.51.100.2");

        assert_eq!(client_ip(&HeaderMap::new(), Some(peer)), "10.0.0.9");
        assert_eq!(client_ip(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn test_quota_identifier_prefers_cookie() {
        let config = IdentityConfig::default();
        let with_cookie = RequestIdentity::from_headers(
            &headers(&[
                ("cookie", "santa_user_id=1700000000000-xyz"),
                ("x-forwarded-for", "203.0.113.7"),
            ]),
            None,
        );
        assert_eq!(with_cookie.quota_identifier(&config), "1700000000000-xyz");

        let without_cookie =
            RequestIdentity::from_headers(&headers(&[("x-forwarded-for", "203.0.113.7")]), None);
        assert_eq!(without_cookie.quota_identifier(&config), "203.0.113.7");
    }

    #[test]
    fn test_user_id_or_issue() {
        let config = IdentityConfig::default();

        let known = RequestIdentity::from_headers(&headers(&[("cookie", "santa_user_id=abc")]), None);
        let (id, set_cookie) = known.user_id_or_issue(&config).unwrap();
        assert_eq!(id, "abc");
        assert!(set_cookie.is_none());

        let fresh = RequestIdentity::from_headers(&HeaderMap::new(), None);
        let (id, set_cookie) = fresh.user_id_or_issue(&config).unwrap();
        let set_cookie = set_cookie.unwrap();
        assert!(set_cookie
            .to_str()
            .unwrap()
            .starts_with(&format!("santa_user_id={id};")));
    }

    #[test]
    fn test_cookies_across_multiple_headers() {
        let identity = RequestIdentity::from_headers(
            &headers(&[("cookie", "a=1"), ("cookie", "santa_user_id=two")]),
            None,
        );
        assert_eq!(identity.cookie("a"), Some("1"));
        assert_eq!(identity.cookie("santa_user_id"), Some("two"));
    }
}
