//
use std::collections::HashSet;
use std::sync::Arc;

use crate::api::{
    AccountStatus, ApiAccount, ApiDirectory, ApiEmptyString, ApiIdentifier, ApiNewOrder, ApiOrder,
};
use crate::cert::{download, revocation, CertificateChain, RevocationReason};
use crate::jwt::key_change_jws;
use crate::order::{Auth, Order};
use crate::req::HttpClient;
use crate::trans::Transport;
use crate::util::{expect_header, read_json};
use crate::{Error, Result};

mod akey;

pub use self::akey::{AccountKey, JwsAlg};
pub(crate) use self::akey::AcmeKey;
pub use crate::jwt::ExternalAccountBinding;

#[derive(Debug)]
pub(crate) struct AccountInner<H: HttpClient> {
    pub transport: Transport<H>,
    pub api_directory: ApiDirectory,
}

/// Account with an ACME provider.
///
/// Accounts are created using [`Directory::create_account`] and are
/// identified by the account URL the ACME API hands out. That URL is the key
/// id used to sign every later request.
///
/// Cloning is cheap and clones share the signing key and nonce cache, so
/// authorizations of the same order can be driven from different threads.
///
/// [`Directory::create_account`]: struct.Directory.html#method.create_account
#[derive(Clone, Debug)]
pub struct Account<H: HttpClient> {
    inner: Arc<AccountInner<H>>,
    url: String,
    api_account: ApiAccount,
}

impl<H: HttpClient> Account<H> {
    pub(crate) fn new(
        transport: Transport<H>,
        url: String,
        api_account: ApiAccount,
        api_directory: ApiDirectory,
    ) -> Result<Self> {
        check_account(&api_account)?;
        Ok(Account {
            inner: Arc::new(AccountInner {
                transport,
                api_directory,
            }),
            url,
            api_account,
        })
    }

    /// The account URL, also the key id of signed requests.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> AccountStatus {
        // checked to be there when the snapshot was taken
        self.api_account.status.unwrap_or(AccountStatus::Valid)
    }

    pub fn contacts(&self) -> &[String] {
        self.api_account.contacts()
    }

    pub fn terms_of_service_agreed(&self) -> bool {
        self.api_account.termsOfServiceAgreed()
    }

    /// The key currently signing requests for this account.
    pub fn key(&self) -> AccountKey {
        self.inner.transport.acme_key().key().clone()
    }

    /// Fetch the account again (POST-as-GET).
    pub fn refresh(&mut self) -> Result<()> {
        self.update(&ApiEmptyString)
    }

    /// Replace the contact URLs of the account.
    pub fn update_contacts(&mut self, contacts: &[&str]) -> Result<()> {
        if let Some(c) = contacts.iter().find(|c| !c.contains(':')) {
            return Err(Error::Validation(format!("Contact is not a URL: {}", c)));
        }
        let acc = ApiAccount {
            contact: Some(contacts.iter().map(|c| c.to_string()).collect()),
            ..Default::default()
        };
        self.update(&acc)
    }

    /// Deactivate the account. There is no way back, the ACME API refuses
    /// any further request signed by it.
    pub fn deactivate(&mut self) -> Result<()> {
        let acc = ApiAccount {
            status: Some(AccountStatus::Deactivated),
            ..Default::default()
        };
        self.update(&acc)
    }

    fn update<T: serde::Serialize + ?Sized>(&mut self, body: &T) -> Result<()> {
        let res = self.inner.transport.call(&self.url, body)?;
        let api_account: ApiAccount = read_json(res)?;
        check_account(&api_account)?;
        self.api_account = api_account;
        Ok(())
    }

    /// Replace the account key with `new_key`.
    ///
    /// The request is signed twice: an inner JWS by the new key, wrapped in
    /// an outer JWS by the old one. After success every clone of this
    /// account signs with the new key.
    pub fn roll_key(&mut self, new_key: AccountKey) -> Result<()> {
        let key_change_url = &self.inner.api_directory.keyChange;
        let old_key = self.key();
        // inner first, it is the payload of the outer
        let inner = key_change_jws(key_change_url, &self.url, &old_key, &new_key)?;
        self.inner.transport.call(key_change_url, &inner)?;
        debug!("Rolled account key for {}", self.url);
        self.inner.transport.replace_key(new_key);
        Ok(())
    }

    /// Create a new order to issue a certificate for this account.
    ///
    /// Identifiers must be non-empty and unique by type and value. Every
    /// call creates a new order with the ACME API provider, even when the
    /// identifiers are exactly the same as before.
    pub fn new_order(&self, identifiers: &[ApiIdentifier]) -> Result<Order<H>> {
        check_identifiers(identifiers)?;
        let order = ApiNewOrder {
            identifiers: identifiers.to_vec(),
            ..Default::default()
        };

        let new_order_url = &self.inner.api_directory.newOrder;

        let res = self.inner.transport.call(new_order_url, &order)?;
        let order_url = expect_header(&res, "location")?;
        let api_order: ApiOrder = read_json(res)?;
        debug!("New order {} is {:?}", order_url, api_order.status);

        Ok(Order::new(&self.inner, api_order, order_url))
    }

    /// Get an existing order by its URL.
    pub fn order(&self, order_url: &str) -> Result<Order<H>> {
        let res = self.inner.transport.call(order_url, &ApiEmptyString)?;
        let api_order: ApiOrder = read_json(res)?;
        Ok(Order::new(&self.inner, api_order, order_url.to_string()))
    }

    /// Get an authorization by its URL.
    pub fn authorization(&self, auth_url: &str) -> Result<Auth<H>> {
        Auth::fetch(&self.inner, auth_url)
    }

    /// Download a certificate by URL, such as one of the
    /// [`alternates`](struct.CertificateChain.html#method.alternates).
    pub fn certificate(&self, certificate_url: &str) -> Result<CertificateChain> {
        download(&self.inner.transport, certificate_url)
    }

    /// Revoke a certificate issued to this account.
    pub fn revoke_certificate(
        &self,
        certificate_der: &[u8],
        reason: Option<RevocationReason>,
    ) -> Result<()> {
        let revoke = revocation(certificate_der, reason)?;
        self.inner
            .transport
            .call(&self.inner.api_directory.revokeCert, &revoke)?;
        Ok(())
    }

    /// Access the underlying JSON object for debugging.
    pub fn api_account(&self) -> &ApiAccount {
        &self.api_account
    }
}

fn check_account(api_account: &ApiAccount) -> Result<()> {
    if api_account.status.is_none() {
        return Err(Error::Protocol("Account without status".into()));
    }
    Ok(())
}

fn check_identifiers(identifiers: &[ApiIdentifier]) -> Result<()> {
    if identifiers.is_empty() {
        return Err(Error::Validation("An order needs at least one identifier".into()));
    }
    let mut seen = HashSet::new();
    for id in identifiers {
        if id.value.is_empty() || id._type.is_empty() {
            return Err(Error::Validation(format!("Empty identifier: {:?}", id)));
        }
        if !seen.insert((&id._type, &id.value)) {
            return Err(Error::Validation(format!(
                "Duplicate identifier: {} {}",
                id._type, id.value
            )));
        }
    }
    Ok(())
}
