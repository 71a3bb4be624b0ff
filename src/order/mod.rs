//! Order life cycle.
//!
//! An order goes through a life cycle of different states that require various actions by
//! the user. The [`Order`] façade wraps the actual [`ApiOrder`] and only lets it move
//! forward through the states the ACME API defines:
//!
//! ```text
//! pending --(all authorizations valid)--> ready
//! ready   --(finalize)--> processing
//! processing --> valid | invalid
//! ```
//!
//! 1. First prove ownership:
//!    * [`Order`] -> [`Auth`]* -> [`Challenge`], or [`Order::authorize_all`] with a
//!      [`ChallengeResolver`].
//! 2. Then submit a CSR and download the cert.
//!    * [`Order::finalize`] -> [`Order::poll_until_settled`] -> [`Order::download_certificate`]
//!
//! \* Possibly multiple auths.
//!
//! [`ApiOrder`]: ../api/struct.ApiOrder.html
//! [`Order`]: struct.Order.html
//! [`Auth`]: struct.Auth.html
//! [`Challenge`]: struct.Challenge.html
//! [`ChallengeResolver`]: trait.ChallengeResolver.html
//! [`Order::authorize_all`]: struct.Order.html#method.authorize_all
//! [`Order::finalize`]: struct.Order.html#method.finalize
//! [`Order::poll_until_settled`]: struct.Order.html#method.poll_until_settled
//! [`Order::download_certificate`]: struct.Order.html#method.download_certificate
use std::sync::Arc;
use std::time::Duration;

use crate::acc::AccountInner;
use crate::api::{
    ApiEmptyString, ApiFinalize, ApiIdentifier, ApiOrder, ApiProblem, AuthorizationStatus,
    OrderStatus,
};
use crate::cert::{download, CertificateChain};
use crate::req::HttpClient;
use crate::util::{base64url, read_json, retry_after};
use crate::{Error, Result};

mod auth;
mod poll;

pub use self::auth::{Auth, Challenge, ChallengeProof, ChallengeResolver, ChallengeType};
pub use self::poll::{CancelToken, PollPolicy};

use self::poll::Poll;

/// An order for a certificate, created by [`Account::new_order`].
///
/// An order is created for one or many identifiers. All identifiers in the order must have
/// authorizations ([confirmed ownership]) before the order can progress to submitting a
/// [CSR].
///
/// The struct holds the last snapshot fetched. Nothing is fetched behind your back; use
/// [`refresh`] or one of the polling calls.
///
/// [`Account::new_order`]: ../struct.Account.html#method.new_order
/// [confirmed ownership]: ../index.html#domain-ownership
/// [CSR]: https://en.wikipedia.org/wiki/Certificate_signing_request
/// [`refresh`]: #method.refresh
#[derive(Debug, Clone)]
pub struct Order<H: HttpClient> {
    inner: Arc<AccountInner<H>>,
    api_order: ApiOrder,
    url: String,
    retry_after: Option<Duration>,
}

impl<H: HttpClient> Order<H> {
    pub(crate) fn new(inner: &Arc<AccountInner<H>>, api_order: ApiOrder, url: String) -> Self {
        Order {
            inner: inner.clone(),
            api_order,
            url,
            retry_after: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> OrderStatus {
        self.api_order.status
    }

    pub fn identifiers(&self) -> &[ApiIdentifier] {
        &self.api_order.identifiers
    }

    pub fn authorization_urls(&self) -> &[String] {
        &self.api_order.authorizations
    }

    /// Only there once the order is `valid`.
    pub fn certificate_url(&self) -> Option<&str> {
        self.api_order.certificate.as_deref()
    }

    /// Why the order went `invalid`.
    pub fn error(&self) -> Option<&ApiProblem> {
        self.api_order.error.as_ref()
    }

    /// `Retry-After` of the last fetch.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Refresh the order state against the ACME API (POST-as-GET).
    ///
    /// A response moving the order backwards, or out of a terminal state, is
    /// rejected with [`Error::Protocol`] and the current snapshot is kept.
    ///
    /// [`Error::Protocol`]: ../enum.Error.html#variant.Protocol
    pub fn refresh(&mut self) -> Result<()> {
        let res = self.inner.transport.call(&self.url, &ApiEmptyString)?;
        let retry_after = retry_after(&res);
        let api_order: ApiOrder = read_json(res)?;
        self.apply(api_order)?;
        self.retry_after = retry_after;
        Ok(())
    }

    fn apply(&mut self, api_order: ApiOrder) -> Result<()> {
        let (from, to) = (self.api_order.status, api_order.status);
        if !from.can_advance_to(to) {
            return Err(Error::Protocol(format!(
                "Order {} can't go from {:?} to {:?}",
                self.url, from, to
            )));
        }
        if from != to {
            debug!("Order {} is {:?}", self.url, to);
        }
        self.api_order = api_order;
        Ok(())
    }

    /// Fetch the authorizations. There is one per identifier.
    ///
    /// If the order includes identifiers that have been authorized before, this
    /// list might contain a mix of already valid and not yet valid auths.
    pub fn authorizations(&self) -> Result<Vec<Auth<H>>> {
        self.api_order
            .authorizations
            .iter()
            .map(|url| Auth::fetch(&self.inner, url))
            .collect()
    }

    /// Authorize every identifier of the order with `resolver`, one after
    /// the other.
    ///
    /// Stops at the first authorization that settles as anything but
    /// `valid`. Once all are valid, the order is polled until it leaves
    /// `pending`. Returns the order status.
    pub fn authorize_all<R>(
        &mut self,
        resolver: &R,
        challenge_type: &ChallengeType,
        policy: &PollPolicy,
    ) -> Result<OrderStatus>
    where
        R: ChallengeResolver + ?Sized,
    {
        for mut auth in self.authorizations()? {
            let status = auth.authorize(resolver, challenge_type, policy)?;
            if status != AuthorizationStatus::Valid {
                debug!("Authorization {} settled {:?}", auth.url(), status);
                self.refresh()?;
                return Ok(self.status());
            }
        }
        self.poll_while(policy, OrderStatus::Pending)?;
        Ok(self.status())
    }

    /// Submit the CSR (DER). The order must be `ready`.
    ///
    /// This does not wait for the certificate. The order moves to
    /// `processing`, follow up with [`poll_until_settled`].
    ///
    /// [`poll_until_settled`]: #method.poll_until_settled
    pub fn finalize(&mut self, csr_der: &[u8]) -> Result<()> {
        if self.status() != OrderStatus::Ready {
            return Err(Error::Validation(format!(
                "Order must be ready to finalize, not {:?}",
                self.status()
            )));
        }
        if csr_der.is_empty() {
            return Err(Error::Validation("Empty CSR".into()));
        }
        let finalize = ApiFinalize {
            csr: base64url(csr_der),
        };
        let res = self
            .inner
            .transport
            .call(&self.api_order.finalize, &finalize)?;
        let retry_after = retry_after(&res);
        let api_order: ApiOrder = read_json(res)?;
        self.apply(api_order)?;
        self.retry_after = retry_after;
        Ok(())
    }

    /// Poll until the order leaves `processing`.
    ///
    /// `valid` means the certificate can be downloaded. A settled `invalid`
    /// is returned as a status, see [`error`].
    ///
    /// [`error`]: #method.error
    pub fn poll_until_settled(&mut self, policy: &PollPolicy) -> Result<OrderStatus> {
        self.poll_while(policy, OrderStatus::Processing)?;
        Ok(self.status())
    }

    fn poll_while(&mut self, policy: &PollPolicy, status: OrderStatus) -> Result<()> {
        if self.status() != status {
            return Ok(());
        }
        let what = format!("order {}", self.url);
        policy.run(&what, || {
            self.refresh()?;
            if self.status() == status {
                Ok(Poll::Pending(self.retry_after))
            } else {
                Ok(Poll::Settled)
            }
        })
    }

    /// Download the issued certificate chain. The order must be `valid`.
    pub fn download_certificate(&self) -> Result<CertificateChain> {
        if self.status() != OrderStatus::Valid {
            return Err(Error::Validation(format!(
                "Order must be valid to download, not {:?}",
                self.status()
            )));
        }
        let url = self
            .certificate_url()
            .ok_or_else(|| Error::Validation("Valid order without certificate URL".into()))?;
        download(&self.inner.transport, url)
    }

    /// Access the underlying JSON object for debugging.
    pub fn api_order(&self) -> &ApiOrder {
        &self.api_order
    }
}
