#![warn(clippy::all)]
//! acme-core is the protocol core of an ACME ([RFC 8555]) client for services such as
//! [Let's Encrypt](https://letsencrypt.org/).
//!
//! It speaks the wire protocol: directory discovery, replay nonces, JWS signed requests,
//! accounts, orders, authorizations, challenges, finalization, certificate download and
//! revocation. Storing keys and certificates, generating CSRs and presenting challenge
//! responses are left to the caller.
//!
//! ```toml
//! [dependencies]
//! acme-core = "0.1"
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use acme_core::order::{ChallengeProof, ChallengeResolver, ChallengeType, PollPolicy};
//! use acme_core::{AccountKey, Directory, DirectoryUrl, Error, Identifier, UReq};
//!
//! struct Webroot;
//!
//! impl ChallengeResolver for Webroot {
//!     fn present(&self, proof: &ChallengeProof) -> Result<(), Error> {
//!         // Place proof.key_authorization at proof.http_path() on your web server.
//!         Ok(())
//!     }
//!     fn cleanup(&self, proof: &ChallengeProof) -> Result<(), Error> {
//!         Ok(())
//!     }
//! }
//!
//! fn request_cert(key_pem: &[u8], csr_der: &[u8]) -> Result<Vec<u8>, Error> {
//!     // Use DirectoryUrl::LetsEncryptStaging for dev/testing.
//!     let dir = Directory::from_url(UReq::new(), DirectoryUrl::LetsEncrypt)?;
//!
//!     // Creates the account, or returns the existing one for the same key.
//!     let key = AccountKey::from_pem(key_pem)?;
//!     let acc = dir.create_account(key, &["mailto:admin@example.com"], true, None)?;
//!
//!     let mut ord = acc.new_order(&[Identifier::dns("example.com")])?;
//!
//!     // Present, accept and poll every authorization of the order.
//!     let policy = PollPolicy::default();
//!     ord.authorize_all(&Webroot, &ChallengeType::Http01, &policy)?;
//!
//!     // The CSR is built by the caller, this crate never sees the certificate key.
//!     ord.finalize(csr_der)?;
//!     ord.poll_until_settled(&policy)?;
//!
//!     let chain = ord.download_certificate()?;
//!     Ok(chain.into_bytes())
//! }
//! ```
//!
//! ## Domain ownership
//!
//! Before issuing, the CA wants proof of control over each identifier. That means placing a
//! file on a web server (`http-01`), a TXT record in DNS (`dns-01`) or a certificate on the
//! TLS port (`tls-alpn-01`). The core computes the proofs, see [`ChallengeProof`]. Putting
//! them in place is the job of a [`ChallengeResolver`] supplied by the caller.
//!
//! [`ChallengeProof`]: order/struct.ChallengeProof.html
//! [`ChallengeResolver`]: order/trait.ChallengeResolver.html
//!
//! ## Concurrency
//!
//! An [`Account`] is cheap to clone and can be shared between threads. All clones use the
//! same signing key and the same nonce cache, which never hands out one nonce twice.
//! Authorizations of an order can be driven in parallel.
//!
//! ## Errors
//!
//! Problem documents from the server surface as [`Error::Problem`], to be matched on
//! [`ProblemType`]. A resource that settles as `invalid` is not an error, its status is
//! returned. Only a `badNonce` is retried, and only once.
//!
//! ## Rate limits
//!
//! Let's Encrypt has [rate limits]. A `rateLimited` problem carries the server's
//! `Retry-After` in [`ApiProblem::retry_after`]. Nothing is retried on the caller's behalf.
//!
//! [RFC 8555]: https://tools.ietf.org/html/rfc8555
//! [rate limits]: https://letsencrypt.org/docs/rate-limits/
//! [`Account`]: struct.Account.html
//! [`Error::Problem`]: enum.Error.html#variant.Problem
//! [`ProblemType`]: api/enum.ProblemType.html
//! [`ApiProblem::retry_after`]: api/struct.ApiProblem.html#structfield.retry_after
//!
#[macro_use]
extern crate log;

mod acc;
mod cert;
mod dir;
mod error;
mod jwt;
mod req;
mod trans;
mod ureq;
mod util;

pub mod api;
pub mod order;

#[cfg(test)]
mod test;

pub use crate::acc::{Account, AccountKey, ExternalAccountBinding, JwsAlg};
pub use crate::api::{
    AccountStatus, ApiIdentifier as Identifier, ApiProblem, AuthorizationStatus, ChallengeStatus,
    OrderStatus, ProblemType,
};
pub use crate::cert::{CertificateChain, RevocationReason};
pub use crate::dir::{Directory, DirectoryUrl};
pub use crate::error::{Error, Result};
pub use crate::order::{
    Auth, CancelToken, Challenge, ChallengeProof, ChallengeResolver, ChallengeType, Order,
    PollPolicy,
};
pub use crate::req::{HttpClient, HttpResponse};
pub use crate::ureq::UReq;
