//! Team identity extraction from the routing cookie
//!
//! A request belongs to a team when it carries a cookie whose value is
//! `<prefix><team>`, e.g. `balancer=t-team42`. Anything else is treated as
//! "no team" and never produces an error.

use crate::config::BalancerConfig;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use hyper::header::{HeaderMap, COOKIE};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Longest team name accepted (a DNS label)
const MAX_TEAM_LEN: usize = 63;

/// Marker in front of signed cookie values
const SIGNED_PREFIX: &str = "s:";

/// Identifier of a tenant, safe to embed in hostnames, headers and URLs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TeamId(String);

impl TeamId {
    /// Validate a bare team name: 1 to 63 ASCII letters, digits or `-`.
    ///
    /// The name becomes part of the upstream hostname, a container name and a
    /// redirect query string, so it has to be a valid DNS label. A cookie like
    /// `t-team_1` therefore carries no team and gets the plain landing redirect.
    pub fn parse(name: &str) -> Option<Self> {
        if name.is_empty() || name.len() > MAX_TEAM_LEN {
            return None;
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return None;
        }
        Some(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TeamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Extracts the team a request belongs to
#[derive(Clone)]
pub struct TeamIdentity {
    cookie_name: String,
    prefix: String,
    secret: Option<Vec<u8>>,
}

impl TeamIdentity {
    pub fn new(cookie_name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            prefix: prefix.into(),
            secret: None,
        }
    }

    /// Only accept cookies signed with `secret`
    pub fn with_secret(mut self, secret: impl AsRef<[u8]>) -> Self {
        self.secret = Some(secret.as_ref().to_vec());
        self
    }

    pub fn from_config(config: &BalancerConfig) -> Self {
        let identity = Self::new(&config.cookie_name, &config.team_prefix);
        match &config.cookie_secret {
            Some(secret) => identity.with_secret(secret),
            None => identity,
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Find the team in the request's cookies
    pub fn extract(&self, headers: &HeaderMap) -> Option<TeamId> {
        let raw = find_cookie(headers, &self.cookie_name)?;
        let decoded = urlencoding::decode(raw).ok()?;
        let credential = match &self.secret {
            Some(secret) => unsign(&decoded, secret)?,
            None => decoded.as_ref(),
        };
        self.team_from_credential(credential)
    }

    /// Parse a credential value of the form `<prefix><team>`
    pub fn team_from_credential(&self, credential: &str) -> Option<TeamId> {
        TeamId::parse(credential.strip_prefix(&self.prefix)?)
    }

    /// Cookie value that identifies `team`, signed when a secret is set
    pub fn credential_for(&self, team: &TeamId) -> String {
        let value = format!("{}{}", self.prefix, team);
        match &self.secret {
            Some(secret) => urlencoding::encode(&sign(&value, secret)).into_owned(),
            None => value,
        }
    }
}

/// First cookie named `name` across all Cookie headers
fn find_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|header| header.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"'))
}

fn mac_for(secret: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length")
}

fn sign(value: &str, secret: &[u8]) -> String {
    let mut mac = mac_for(secret);
    mac.update(value.as_bytes());
    let signature = STANDARD_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{}{}.{}", SIGNED_PREFIX, value, signature)
}

/// Verify `s:<value>.<signature>` and return the value
fn unsign<'a>(signed: &'a str, secret: &[u8]) -> Option<&'a str> {
    let (value, signature) = signed.strip_prefix(SIGNED_PREFIX)?.rsplit_once('.')?;
    let signature = STANDARD_NO_PAD.decode(signature).ok()?;
    let mut mac = mac_for(secret);
    mac.update(value.as_bytes());
    mac.verify_slice(&signature).ok()?;
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn headers_with_cookie(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(cookie).unwrap());
        headers
    }

    fn identity() -> TeamIdentity {
        TeamIdentity::new("balancer", "t-")
    }

    #[test]
    fn test_team_id_validation() {
        assert_eq!(TeamId::parse("team42").unwrap().as_str(), "team42");
        assert!(TeamId::parse("restarting-instance").is_some());
        assert!(TeamId::parse("").is_none());
        assert!(TeamId::parse("evil.example.com").is_none());
        assert!(TeamId::parse("a b").is_none());
        assert!(TeamId::parse("team/../x").is_none());
        assert!(TeamId::parse(&"a".repeat(63)).is_some());
        assert!(TeamId::parse(&"a".repeat(64)).is_none());
    }

    #[test]
    fn test_underscore_team_is_absent() {
        assert!(TeamId::parse("team_1").is_none());
        assert!(identity().extract(&headers_with_cookie("balancer=t-team_1")).is_none());
    }

    #[test]
    fn test_extract_team() {
        let team = identity().extract(&headers_with_cookie("balancer=t-team42"));
        assert_eq!(team.unwrap().as_str(), "team42");
    }

    #[test]
    fn test_extract_among_other_cookies() {
        let headers = headers_with_cookie("token=abc; balancer=t-team-x; language=en");
        assert_eq!(identity().extract(&headers).unwrap().as_str(), "team-x");
    }

    #[test]
    fn test_extract_across_multiple_cookie_headers() {
        let mut headers = HeaderMap::new();
        headers.append(COOKIE, HeaderValue::from_static("token=abc"));
        headers.append(COOKIE, HeaderValue::from_static("balancer=t-second"));
        assert_eq!(identity().extract(&headers).unwrap().as_str(), "second");
    }

    #[test]
    fn test_missing_or_malformed_credentials_are_absent() {
        let identity = identity();
        assert!(identity.extract(&HeaderMap::new()).is_none());
        assert!(identity.extract(&headers_with_cookie("other=t-team42")).is_none());
        assert!(identity.extract(&headers_with_cookie("balancer=team42")).is_none());
        assert!(identity.extract(&headers_with_cookie("balancer=t-")).is_none());
        assert!(identity.extract(&headers_with_cookie("balancer=")).is_none());
        assert!(identity.extract(&headers_with_cookie("balancers=t-team42")).is_none());
    }

    #[test]
    fn test_percent_encoded_value() {
        let headers = headers_with_cookie("balancer=t%2Dteam42");
        assert_eq!(identity().extract(&headers).unwrap().as_str(), "team42");
    }

    #[test]
    fn test_signed_credential_round_trip() {
        let identity = identity().with_secret("s3cret");
        let team = TeamId::parse("team42").unwrap();
        let credential = identity.credential_for(&team);
        assert!(credential.starts_with("s%3At-team42."));

        let headers = headers_with_cookie(&format!("balancer={}", credential));
        assert_eq!(identity.extract(&headers), Some(team));
    }

    #[test]
    fn test_signed_mode_rejects_plain_and_tampered_values() {
        let identity = identity().with_secret("s3cret");
        assert!(identity.extract(&headers_with_cookie("balancer=t-team42")).is_none());

        let forged = TeamIdentity::new("balancer", "t-")
            .with_secret("other")
            .credential_for(&TeamId::parse("team42").unwrap());
        let headers = headers_with_cookie(&format!("balancer={}", forged));
        assert!(identity.extract(&headers).is_none());

        let valid = identity.credential_for(&TeamId::parse("team42").unwrap());
        let swapped = valid.replace("team42", "team43");
        let headers = headers_with_cookie(&format!("balancer={}", swapped));
        assert!(identity.extract(&headers).is_none());
    }

    #[test]
    fn test_plain_credential_for() {
        let team = TeamId::parse("team42").unwrap();
        assert_eq!(identity().credential_for(&team), "t-team42");
    }
}
