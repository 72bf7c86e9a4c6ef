//! Digest authentication for session requests
//!
//! When a request is challenged with 401/407 the session asks the
//! application's [`AuthHandler`] for credentials, answers the challenge with
//! an RFC 2617 MD5 digest and re-sends the request once. A second challenge
//! for the same realm that is not marked `stale` means the credentials were
//! wrong, and the request fails instead of looping.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::errors::{SessionError, SessionResult};
use crate::message::{SipRequest, SipResponse};

/// Username/password pair for one realm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }
}

/// Application-side credential lookup
pub trait AuthHandler: Send + Sync {
    /// Return credentials for `realm`, or an error to give up
    fn credentials(&self, realm: &str) -> SessionResult<Credentials>;
}

impl<F> AuthHandler for F
where
    F: Fn(&str) -> SessionResult<Credentials> + Send + Sync,
{
    fn credentials(&self, realm: &str) -> SessionResult<Credentials> {
        self(realm)
    }
}

/// Parsed `Digest` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
struct DigestChallenge {
    realm: String,
    nonce: String,
    opaque: Option<String>,
    algorithm: Option<String>,
    qop_auth: bool,
    stale: bool,
    proxy: bool,
}

impl DigestChallenge {
    fn parse(value: &str, proxy: bool) -> Option<Self> {
        let rest = value.trim();
        let (scheme, params) = rest.split_once(char::is_whitespace)?;
        if !scheme.eq_ignore_ascii_case("Digest") {
            return None;
        }

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut algorithm = None;
        let mut qop_auth = false;
        let mut stale = false;

        for (name, value) in split_params(params) {
            match name.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "algorithm" => algorithm = Some(value),
                "qop" => qop_auth = value.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")),
                "stale" => stale = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        if let Some(alg) = &algorithm {
            if !alg.eq_ignore_ascii_case("MD5") {
                warn!("unsupported digest algorithm {}", alg);
                return None;
            }
        }

        Some(Self {
            realm: realm?,
            nonce: nonce?,
            opaque,
            algorithm,
            qop_auth,
            stale,
            proxy,
        })
    }
}

/// Split `a="x, y", b=z` into name/value pairs, honouring quotes
fn split_params(params: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    let push = |item: &str, out: &mut Vec<(String, String)>| {
        if let Some((name, value)) = item.split_once('=') {
            out.push((name.trim().to_string(), value.trim().trim_matches('"').to_string()));
        }
    };

    for c in params.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => {
                push(&current, &mut out);
                current.clear();
            }
            _ => current.push(c),
        }
    }
    push(&current, &mut out);
    out
}

fn md5_hex(input: &str) -> String {
    hex::encode(md5::compute(input.as_bytes()).0)
}

/// RFC 2617 digest `response` value
pub(crate) fn digest_response(
    credentials: &Credentials,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<(&str, &str)>,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", credentials.username, realm, credentials.password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    match qop {
        Some((nc, cnonce)) => md5_hex(&format!("{}:{}:{}:{}:auth:{}", ha1, nonce, nc, cnonce, ha2)),
        None => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

#[derive(Debug, Clone)]
struct ChallengeAnswer {
    challenge: DigestChallenge,
    credentials: Credentials,
    nonce_count: u32,
}

/// Per-session challenge state
pub struct Authenticator {
    handler: Arc<dyn AuthHandler>,
    answers: Vec<ChallengeAnswer>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("realms", &self.answers.iter().map(|a| &a.challenge.realm).collect::<Vec<_>>())
            .finish()
    }
}

impl Authenticator {
    pub fn new(handler: Arc<dyn AuthHandler>) -> Self {
        Self { handler, answers: Vec::new() }
    }

    /// Absorb the challenges of a 401/407 response
    ///
    /// Fails when the response carries no usable digest challenge, when the
    /// handler refuses, or when a realm we already answered is challenged
    /// again without `stale=true`.
    pub fn on_challenge(&mut self, response: &SipResponse) -> SessionResult<()> {
        let (header, proxy) = match response.status {
            401 => ("WWW-Authenticate", false),
            407 => ("Proxy-Authenticate", true),
            other => {
                return Err(SessionError::invalid_argument(format!("{} is not a challenge", other)));
            }
        };

        let challenges: Vec<DigestChallenge> = response
            .headers_named(header)
            .filter_map(|v| DigestChallenge::parse(v, proxy))
            .collect();
        if challenges.is_empty() {
            return Err(SessionError::authentication("no digest challenge in response"));
        }

        for challenge in challenges {
            let existing = self
                .answers
                .iter_mut()
                .find(|a| a.challenge.realm == challenge.realm && a.challenge.proxy == proxy);

            match existing {
                Some(answer) if challenge.stale => {
                    debug!(realm = %challenge.realm, "stale nonce, refreshing challenge");
                    answer.challenge = challenge;
                    answer.nonce_count = 0;
                }
                Some(_) => {
                    return Err(SessionError::authentication(format!(
                        "credentials rejected for realm {}",
                        challenge.realm
                    )));
                }
                None => {
                    let credentials = self.handler.credentials(&challenge.realm)?;
                    debug!(realm = %challenge.realm, user = %credentials.username, "answering challenge");
                    self.answers.push(ChallengeAnswer { challenge, credentials, nonce_count: 0 });
                }
            }
        }

        Ok(())
    }

    /// Whether any challenge has been answered
    pub fn has_answers(&self) -> bool {
        !self.answers.is_empty()
    }

    /// Add Authorization/Proxy-Authorization headers to `request`
    pub fn authorize(&mut self, request: &mut SipRequest) {
        request
            .headers
            .retain(|h| !h.name.eq_ignore_ascii_case("Authorization") && !h.name.eq_ignore_ascii_case("Proxy-Authorization"));

        for answer in &mut self.answers {
            answer.nonce_count += 1;
            let c = &answer.challenge;
            let nc = format!("{:08x}", answer.nonce_count);
            let cnonce = format!("{:016x}", rand::random::<u64>());
            let qop = c.qop_auth.then(|| (nc.as_str(), cnonce.as_str()));

            let response = digest_response(
                &answer.credentials,
                &c.realm,
                &c.nonce,
                request.method.as_str(),
                &request.uri,
                qop,
            );

            let mut value = format!(
                "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
                answer.credentials.username, c.realm, c.nonce, request.uri, response
            );
            if let Some(alg) = &c.algorithm {
                value.push_str(&format!(", algorithm={}", alg));
            }
            if let Some(opaque) = &c.opaque {
                value.push_str(&format!(", opaque=\"{}\"", opaque));
            }
            if c.qop_auth {
                value.push_str(&format!(", qop=auth, nc={}, cnonce=\"{}\"", nc, cnonce));
            }

            let name = if c.proxy { "Proxy-Authorization" } else { "Authorization" };
            request.headers.push(crate::message::Header::new(name, value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Method, NameAddr};

    #[test]
    fn test_rfc2617_digest_vector() {
        let creds = Credentials::new("Mufasa", "Circle Of Life");
        let response = digest_response(
            &creds,
            "testrealm@host.com",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "GET",
            "/dir/index.html",
            Some(("00000001", "0a4f113b")),
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    fn challenge(stale: bool) -> SipResponse {
        let req = SipRequest::new(
            Method::Invite,
            "sip:bob@example.com",
            "auth-call",
            1,
            NameAddr::new("sip:alice@example.com").with_tag("a"),
            NameAddr::new("sip:bob@example.com"),
        );
        SipResponse::for_request(&req, 401, "Unauthorized").with_header(
            "WWW-Authenticate",
            format!(
                "Digest realm=\"example.com\", nonce=\"abc\", qop=\"auth,auth-int\", stale={}",
                if stale { "true" } else { "false" }
            ),
        )
    }

    #[test]
    fn test_challenge_answered_once() {
        let handler: Arc<dyn AuthHandler> = Arc::new(|realm: &str| {
            assert_eq!(realm, "example.com");
            Ok(Credentials::new("alice", "secret"))
        });
        let mut auth = Authenticator::new(handler);

        auth.on_challenge(&challenge(false)).unwrap();
        assert!(auth.has_answers());

        let mut req = SipRequest::new(
            Method::Invite,
            "sip:bob@example.com",
            "auth-call",
            2,
            NameAddr::new("sip:alice@example.com").with_tag("a"),
            NameAddr::new("sip:bob@example.com"),
        );
        auth.authorize(&mut req);
        let value = req.header("Authorization").unwrap();
        assert!(value.starts_with("Digest username=\"alice\""));
        assert!(value.contains("qop=auth, nc=00000001"));

        // Same realm again without stale: credentials were wrong
        assert!(matches!(
            auth.on_challenge(&challenge(false)),
            Err(SessionError::Authentication { .. })
        ));
        // A stale nonce is refreshed instead
        auth.on_challenge(&challenge(true)).unwrap();
    }

    #[test]
    fn test_non_digest_challenge_rejected() {
        let handler: Arc<dyn AuthHandler> = Arc::new(|_: &str| Ok(Credentials::new("a", "b")));
        let mut auth = Authenticator::new(handler);
        let mut resp = challenge(false);
        resp.headers[0].value = "Basic realm=\"x\"".into();
        assert!(auth.on_challenge(&resp).is_err());
    }
}
