//
use openssl::sha::sha256;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::acc::AccountInner;
use crate::api::{
    ApiAuth, ApiChallenge, ApiEmptyObject, ApiEmptyString, ApiIdentifier, ApiProblem,
    AuthorizationStatus, ChallengeStatus,
};
use crate::jwt::key_authorization;
use crate::order::poll::{Poll, PollPolicy};
use crate::req::HttpClient;
use crate::util::{base64url, links, read_json, retry_after};
use crate::{Error, Result};

/// The kind of challenge, as in the `type` of the challenge object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChallengeType {
    Http01,
    Dns01,
    TlsAlpn01,
    /// Any type this library has no name for.
    Other(String),
}

impl ChallengeType {
    pub fn as_str(&self) -> &str {
        match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::Dns01 => "dns-01",
            ChallengeType::TlsAlpn01 => "tls-alpn-01",
            ChallengeType::Other(s) => s,
        }
    }
}

impl From<&str> for ChallengeType {
    fn from(s: &str) -> Self {
        match s {
            "http-01" => ChallengeType::Http01,
            "dns-01" => ChallengeType::Dns01,
            "tls-alpn-01" => ChallengeType::TlsAlpn01,
            other => ChallengeType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything needed to publish the proof for a challenge.
///
/// Handed to a [`ChallengeResolver`].
///
/// [`ChallengeResolver`]: trait.ChallengeResolver.html
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeProof {
    pub challenge_type: ChallengeType,
    /// The identifier being authorized, wildcard prefix stripped.
    pub identifier: ApiIdentifier,
    pub token: String,
    /// RFC 7638 thumbprint of the account key.
    pub thumbprint: String,
    /// `token.thumbprint`
    pub key_authorization: String,
}

impl ChallengeProof {
    /// Where an http-01 proof is served, the body being the key authorization.
    ///
    /// ```text
    /// http://<domain>/.well-known/acme-challenge/<token>
    /// ```
    pub fn http_path(&self) -> String {
        format!("/.well-known/acme-challenge/{}", self.token)
    }

    /// Name of the dns-01 `TXT` record.
    pub fn dns_record_name(&self) -> String {
        format!("_acme-challenge.{}", self.identifier.value)
    }

    /// Value of the dns-01 `TXT` record.
    pub fn dns_txt_value(&self) -> String {
        base64url(&sha256(self.key_authorization.as_bytes()))
    }

    /// Contents of the acmeIdentifier extension of a tls-alpn-01 certificate.
    pub fn tls_alpn_digest(&self) -> [u8; 32] {
        sha256(self.key_authorization.as_bytes())
    }
}

/// Publishes challenge proofs where the CA can see them.
///
/// Implemented by the host application, for instance by writing a file into a
/// web root or by talking to a DNS provider.
pub trait ChallengeResolver {
    /// Make the proof visible. Return only once the CA can observe it.
    fn present(&self, proof: &ChallengeProof) -> Result<()>;

    /// Remove the proof again. Called after the authorization settled, also
    /// when it failed.
    fn cleanup(&self, proof: &ChallengeProof) -> Result<()>;
}

/// An authorization ([ownership proof]) for an identifier.
///
/// Each authorization for an order must be progressed to a valid state before
/// the ACME API will issue a certificate.
///
/// Authorizations may or may not be required depending on previous orders
/// against the same ACME account. The ACME API decides if the authorization
/// is needed.
///
/// [ownership proof]: ../index.html#domain-ownership
#[derive(Debug, Clone)]
pub struct Auth<H: HttpClient> {
    inner: Arc<AccountInner<H>>,
    api_auth: ApiAuth,
    url: String,
    retry_after: Option<Duration>,
}

impl<H: HttpClient> Auth<H> {
    /// POST-as-GET the authorization.
    pub(crate) fn fetch(inner: &Arc<AccountInner<H>>, url: &str) -> Result<Self> {
        let (api_auth, retry_after) = fetch_auth(inner, url)?;
        Ok(Auth {
            inner: inner.clone(),
            api_auth,
            url: url.into(),
            retry_after,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The identifier as the ACME API reports it. For wildcards the `*.` is
    /// not part of the value, see [`is_wildcard`].
    ///
    /// [`is_wildcard`]: #method.is_wildcard
    pub fn identifier(&self) -> &ApiIdentifier {
        &self.api_auth.identifier
    }

    pub fn status(&self) -> AuthorizationStatus {
        self.api_auth.status
    }

    pub fn is_wildcard(&self) -> bool {
        self.api_auth.wildcard()
    }

    /// Whether we actually need to do the authorization. This might not be needed if we have
    /// proven ownership of the identifier recently in a previous order.
    pub fn need_challenge(&self) -> bool {
        !self.api_auth.is_status_valid()
    }

    /// `Retry-After` of the last fetch.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// All challenges offered, in the order the ACME API listed them.
    pub fn challenges(&self) -> Vec<Challenge<H>> {
        self.api_auth
            .challenges
            .iter()
            .map(|c| self.make_challenge(c))
            .collect()
    }

    /// The challenge of the given type, if it was offered.
    pub fn challenge(&self, challenge_type: &ChallengeType) -> Option<Challenge<H>> {
        self.api_auth
            .challenge(challenge_type.as_str())
            .map(|c| self.make_challenge(c))
    }

    pub fn http_challenge(&self) -> Option<Challenge<H>> {
        self.challenge(&ChallengeType::Http01)
    }

    pub fn dns_challenge(&self) -> Option<Challenge<H>> {
        self.challenge(&ChallengeType::Dns01)
    }

    pub fn tls_alpn_challenge(&self) -> Option<Challenge<H>> {
        self.challenge(&ChallengeType::TlsAlpn01)
    }

    fn make_challenge(&self, api_challenge: &ApiChallenge) -> Challenge<H> {
        Challenge {
            inner: self.inner.clone(),
            api_challenge: api_challenge.clone(),
            identifier: self.api_auth.identifier.clone(),
            up: None,
        }
    }

    /// Fetch the authorization again (POST-as-GET).
    pub fn refresh(&mut self) -> Result<()> {
        let (api_auth, retry_after) = fetch_auth(&self.inner, &self.url)?;
        self.api_auth = api_auth;
        self.retry_after = retry_after;
        Ok(())
    }

    /// Poll until the status is no longer `pending`.
    ///
    /// A settled `invalid` is returned as a status, not as an error. Running
    /// out of attempts is [`Error::Timeout`]; the last snapshot stays.
    ///
    /// [`Error::Timeout`]: ../enum.Error.html#variant.Timeout
    pub fn poll_until_settled(&mut self, policy: &PollPolicy) -> Result<AuthorizationStatus> {
        let what = format!("authorization {}", self.url);
        policy.run(&what, || {
            self.refresh()?;
            if self.api_auth.is_status_pending() {
                Ok(Poll::Pending(self.retry_after))
            } else {
                Ok(Poll::Settled)
            }
        })?;
        Ok(self.status())
    }

    /// Drive the authorization to a settled state using a challenge of
    /// `challenge_type`.
    ///
    /// The resolver presents the proof, then the challenge is accepted and
    /// the authorization polled. The resolver always gets to clean up, also
    /// when presenting failed half way. The first error wins.
    ///
    /// Already `valid` authorizations return right away, as do other
    /// settled states.
    pub fn authorize<R>(
        &mut self,
        resolver: &R,
        challenge_type: &ChallengeType,
        policy: &PollPolicy,
    ) -> Result<AuthorizationStatus>
    where
        R: ChallengeResolver + ?Sized,
    {
        if !self.api_auth.is_status_pending() {
            debug!("Authorization {} already {:?}", self.url, self.status());
            return Ok(self.status());
        }

        let mut challenge = self.challenge(challenge_type).ok_or_else(|| {
            Error::Validation(format!(
                "No {} challenge offered for {}",
                challenge_type, self.api_auth.identifier.value
            ))
        })?;

        if !challenge.need_validate() {
            // accepted in an earlier run, only the waiting is left
            return self.poll_until_settled(policy);
        }

        let proof = challenge.proof()?;
        let result = resolver
            .present(&proof)
            .and_then(|_| challenge.accept())
            .and_then(|_| self.poll_until_settled(policy));
        let cleanup = resolver.cleanup(&proof);

        let status = result?;
        cleanup?;
        Ok(status)
    }

    /// Give up the authorization, for instance when the identifier is no
    /// longer controlled.
    pub fn deactivate(&mut self) -> Result<()> {
        let body = serde_json::json!({ "status": "deactivated" });
        let res = self.inner.transport.call(&self.url, &body)?;
        self.retry_after = retry_after(&res);
        self.api_auth = read_json(res)?;
        Ok(())
    }

    /// The first error reported on any challenge.
    pub fn error(&self) -> Option<&ApiProblem> {
        self.api_auth
            .challenges
            .iter()
            .filter_map(|c| c.error.as_ref())
            .next()
    }

    /// Access the underlying JSON object for debugging.
    pub fn api_auth(&self) -> &ApiAuth {
        &self.api_auth
    }
}

fn fetch_auth<H: HttpClient>(
    inner: &Arc<AccountInner<H>>,
    url: &str,
) -> Result<(ApiAuth, Option<Duration>)> {
    let res = inner.transport.call(url, &ApiEmptyString)?;
    let retry_after = retry_after(&res);
    Ok((read_json(res)?, retry_after))
}

/// A challenge as obtained from the [`Auth`].
///
/// [`Auth`]: struct.Auth.html
#[derive(Debug, Clone)]
pub struct Challenge<H: HttpClient> {
    inner: Arc<AccountInner<H>>,
    api_challenge: ApiChallenge,
    identifier: ApiIdentifier,
    up: Option<String>,
}

impl<H: HttpClient> Challenge<H> {
    pub fn challenge_type(&self) -> ChallengeType {
        self.api_challenge._type.as_str().into()
    }

    pub fn url(&self) -> &str {
        &self.api_challenge.url
    }

    pub fn status(&self) -> ChallengeStatus {
        self.api_challenge.status
    }

    pub fn token(&self) -> &str {
        &self.api_challenge.token
    }

    pub fn error(&self) -> Option<&ApiProblem> {
        self.api_challenge.error.as_ref()
    }

    /// Check whether this challenge really needs validation. It might already been
    /// done in a previous order for the same account.
    pub fn need_validate(&self) -> bool {
        self.api_challenge.is_status_pending()
    }

    /// `token.thumbprint` with the current account key.
    pub fn key_authorization(&self) -> Result<String> {
        let acme_key = self.inner.transport.acme_key();
        key_authorization(&self.api_challenge.token, acme_key.key(), false)
    }

    /// The http-01 file contents.
    pub fn http_proof(&self) -> Result<String> {
        self.key_authorization()
    }

    /// The dns-01 `TXT` record value.
    pub fn dns_proof(&self) -> Result<String> {
        let acme_key = self.inner.transport.acme_key();
        key_authorization(&self.api_challenge.token, acme_key.key(), true)
    }

    /// The tls-alpn-01 acmeIdentifier extension value.
    pub fn tls_alpn_proof(&self) -> Result<[u8; 32]> {
        Ok(sha256(self.key_authorization()?.as_bytes()))
    }

    pub fn proof(&self) -> Result<ChallengeProof> {
        let acme_key = self.inner.transport.acme_key();
        let mut identifier = self.identifier.clone();
        if let Some(base) = identifier.value.strip_prefix("*.") {
            identifier.value = base.to_string();
        }
        Ok(ChallengeProof {
            challenge_type: self.challenge_type(),
            identifier,
            token: self.api_challenge.token.clone(),
            thumbprint: acme_key.key().thumbprint()?,
            key_authorization: key_authorization(&self.api_challenge.token, acme_key.key(), false)?,
        })
    }

    /// Tell the ACME API the proof is in place and it may validate.
    ///
    /// Only call this once the proof is visible to the CA.
    pub fn accept(&mut self) -> Result<()> {
        debug!("Accept challenge {}", self.api_challenge.url);
        let res = self
            .inner
            .transport
            .call(&self.api_challenge.url, &ApiEmptyObject)?;
        self.up = links(&res, "up").into_iter().next();
        self.api_challenge = read_json(res)?;
        Ok(())
    }

    /// The authorization URL from `Link: <..>;rel="up"` of the last accept.
    pub fn up_link(&self) -> Option<&str> {
        self.up.as_deref()
    }

    /// Access the underlying JSON object for debugging.
    pub fn api_challenge(&self) -> &ApiChallenge {
        &self.api_challenge
    }
}
