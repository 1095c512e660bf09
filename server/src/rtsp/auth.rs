use crate::error::ProxyError;
use crate::rtsp::message::{canonical_url, Request};
use base64::{engine::general_purpose, Engine as _};
use std::collections::HashMap;

/// Credential state for one upstream connection. The realm is single-shot:
/// a challenge can be consumed once, and a second 401 after that is fatal.
#[derive(Debug)]
pub struct Authenticator {
    username: String,
    password: String,
    realm: Option<String>,
    nonce: Option<String>,
}

impl Authenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            realm: None,
            nonce: None,
        }
    }

    /// Absorbs a `WWW-Authenticate` challenge. `Digest realm=.., nonce=..`
    /// selects digest mode, `Basic realm=..` basic mode.
    pub fn consume_challenge(&mut self, header_value: &str) -> Result<(), ProxyError> {
        if self.realm.is_some() {
            return Err(ProxyError::Unauthorized);
        }
        if self.username.is_empty() {
            return Err(ProxyError::Unauthorized);
        }

        let (scheme, params_text) = match header_value.trim().split_once(char::is_whitespace) {
            Some((scheme, rest)) => (scheme, rest),
            None => (header_value.trim(), ""),
        };
        if !scheme.eq_ignore_ascii_case("digest") && !scheme.eq_ignore_ascii_case("basic") {
            return Err(ProxyError::Unauthorized);
        }

        let params = parse_parameters(params_text);
        let realm = params.get("realm").ok_or(ProxyError::Unauthorized)?;
        self.realm = Some(realm.clone());
        self.nonce = params.get("nonce").cloned();
        Ok(())
    }

    /// Adds an `Authorization` header once a challenge has been consumed.
    /// Before that, requests go out unauthenticated and the 401 retry path
    /// picks up the challenge.
    pub fn apply(&self, request: &mut Request) {
        let Some(realm) = &self.realm else {
            return;
        };
        if self.username.is_empty() {
            return;
        }

        let uri = canonical_url(&request.url);
        let header = match &self.nonce {
            Some(nonce) => {
                let ha1 = md5_hex(&format!("{}:{}:{}", self.username, realm, self.password));
                let ha2 = md5_hex(&format!("{}:{}", request.method, uri));
                let response = md5_hex(&format!("{ha1}:{nonce}:{ha2}"));
                format!(
                    "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
                    self.username, realm, nonce, uri, response
                )
            }
            None => {
                let raw = format!("{}:{}", self.username, self.password);
                format!("Basic {}", general_purpose::STANDARD.encode(raw.as_bytes()))
            }
        };
        request.headers.set("Authorization", header);
    }
}

// Splits `key="value", key=value` challenge parameters, honoring quotes.
fn parse_parameters(params: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in params.chars() {
        if ch == '"' {
            in_quotes = !in_quotes;
            current.push(ch);
            continue;
        }
        if ch == ',' && !in_quotes {
            consume_param(&mut map, &mut current);
            continue;
        }
        current.push(ch);
    }
    consume_param(&mut map, &mut current);
    map
}

fn consume_param(map: &mut HashMap<String, String>, buffer: &mut String) {
    let trimmed = buffer.trim().to_string();
    buffer.clear();
    if trimmed.is_empty() {
        return;
    }
    let mut parts = trimmed.splitn(2, '=');
    let key = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    let mut value = parts.next().unwrap_or("").trim().to_string();
    if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
        value = value[1..value.len() - 1].to_string();
    }
    if !key.is_empty() {
        map.insert(key, value);
    }
}

fn md5_hex(input: &str) -> String {
    let digest = md5::compute(input.as_bytes());
    digest.0.iter().map(|b| format!("{:02x}", b)).collect()
}
