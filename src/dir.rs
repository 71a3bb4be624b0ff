//
use std::sync::Arc;

use crate::acc::{AccountKey, ExternalAccountBinding};
use crate::api::{ApiAccount, ApiDirectory};
use crate::cert::{revocation, RevocationReason};
use crate::req::{HttpClient, HttpResponse};
use crate::trans::{NonceManager, Transport};
use crate::util::{expect_header, read_json};
use crate::{Account, Error, Result};

const LETSENCRYPT: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Enumeration of known ACME API directories.
#[derive(Debug, Clone)]
pub enum DirectoryUrl<'a> {
    /// The main Let's Encrypt directory. Not appropriate for testing and dev.
    LetsEncrypt,
    /// The staging Let's Encrypt directory. Use for testing and dev. Doesn't issue
    /// "valid" certificates. The root signing certificate is not supposed
    /// to be in any trust chains.
    LetsEncryptStaging,
    /// Provide an arbitrary director URL to connect to.
    Other(&'a str),
}

impl<'a> DirectoryUrl<'a> {
    fn to_url(&self) -> &str {
        match self {
            DirectoryUrl::LetsEncrypt => LETSENCRYPT,
            DirectoryUrl::LetsEncryptStaging => LETSENCRYPT_STAGING,
            DirectoryUrl::Other(s) => s,
        }
    }
}

/// Entry point for accessing an ACME API.
///
/// Holds the endpoint URLs and CA metadata as fetched, and the nonce cache
/// shared by every account created through it. The directory is never
/// fetched again behind your back, see [`refresh`].
///
/// [`refresh`]: #method.refresh
#[derive(Clone, Debug)]
pub struct Directory<H: HttpClient> {
    client: H,
    url: String,
    nonces: Arc<NonceManager<H>>,
    api_directory: ApiDirectory,
}

impl<H: HttpClient> Directory<H> {
    /// Fetch the directory (unsigned GET) using the given HTTP client.
    pub fn from_url(client: H, url: DirectoryUrl) -> Result<Directory<H>> {
        let url = url.to_url().to_string();
        let api_directory = fetch(&client, &url)?;
        let nonces = Arc::new(NonceManager::new(client.clone(), &api_directory.newNonce));
        Ok(Directory {
            client,
            url,
            nonces,
            api_directory,
        })
    }

    /// Like `from_url`, with a default constructed client.
    pub fn from_url_with_default(url: DirectoryUrl) -> Result<Directory<H>>
    where
        H: Default,
    {
        Self::from_url(Default::default(), url)
    }

    /// Fetch the directory again.
    ///
    /// Accounts created before keep using what they had.
    pub fn refresh(&mut self) -> Result<()> {
        let api_directory = fetch(&self.client, &self.url)?;
        if api_directory.newNonce != self.api_directory.newNonce {
            self.nonces = Arc::new(NonceManager::new(self.client.clone(), &api_directory.newNonce));
        }
        self.api_directory = api_directory;
        Ok(())
    }

    /// Create an account for `key`, or get the existing one.
    ///
    /// The ACME API answers with the already existing account if the key is
    /// known. That is not an error, the same account is returned.
    ///
    /// `contacts` are URLs such as `mailto:admin@example.com`.
    ///
    /// An [`ExternalAccountBinding`] must be given if the CA says
    /// [`external_account_required`].
    ///
    /// [`ExternalAccountBinding`]: struct.ExternalAccountBinding.html
    /// [`external_account_required`]: #method.external_account_required
    pub fn create_account(
        &self,
        key: AccountKey,
        contacts: &[&str],
        agree_terms_of_service: bool,
        eab: Option<&ExternalAccountBinding>,
    ) -> Result<Account<H>> {
        if self.external_account_required() && eab.is_none() {
            return Err(Error::Validation(
                "The CA requires an external account binding".into(),
            ));
        }
        if let Some(c) = contacts.iter().find(|c| !c.contains(':')) {
            return Err(Error::Validation(format!("Contact is not a URL: {}", c)));
        }

        let new_account_url = &self.api_directory.newAccount;
        let eab_jws = match eab {
            Some(eab) => Some(serde_json::to_value(eab.jws(new_account_url, &key)?)?),
            None => None,
        };
        let acc = ApiAccount {
            contact: Some(contacts.iter().map(|c| c.to_string()).collect()),
            termsOfServiceAgreed: Some(agree_terms_of_service),
            externalAccountBinding: eab_jws,
            ..Default::default()
        };
        self.new_account_call(key, &acc)
    }

    /// Look up the account of `key` without creating one.
    ///
    /// Fails with an `accountDoesNotExist` problem if there is none.
    pub fn find_account(&self, key: AccountKey) -> Result<Account<H>> {
        let acc = ApiAccount {
            onlyReturnExisting: Some(true),
            ..Default::default()
        };
        self.new_account_call(key, &acc)
    }

    fn new_account_call(&self, key: AccountKey, acc: &ApiAccount) -> Result<Account<H>> {
        let transport = Transport::new(&self.nonces, self.client.clone(), key);
        let res = transport.call_jwk(&self.api_directory.newAccount, acc)?;
        let kid = expect_header(&res, "location")?;
        debug!("Key id is: {} ({})", kid, res.status());
        // fill in the server returned key id
        transport.set_key_id(kid.clone());

        let api_account: ApiAccount = read_json(res)?;

        Account::new(transport, kid, api_account, self.api_directory.clone())
    }

    /// Revoke a certificate using the certificate's own key pair.
    ///
    /// For when the account that ordered it is not available. The request
    /// carries the public key of `certificate_key` instead of an account key id.
    pub fn revoke_certificate_with_key(
        &self,
        certificate_der: &[u8],
        certificate_key: AccountKey,
        reason: Option<RevocationReason>,
    ) -> Result<()> {
        let revoke = revocation(certificate_der, reason)?;
        let transport = Transport::new(&self.nonces, self.client.clone(), certificate_key);
        transport.call_jwk(&self.api_directory.revokeCert, &revoke)?;
        Ok(())
    }

    /// The URL the directory was fetched from.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn terms_of_service(&self) -> Option<&str> {
        self.api_directory
            .meta
            .as_ref()
            .and_then(|m| m.termsOfService.as_deref())
    }

    pub fn website(&self) -> Option<&str> {
        self.api_directory.meta.as_ref().and_then(|m| m.website.as_deref())
    }

    /// Hostnames the CA recognizes in CAA records.
    pub fn caa_identities(&self) -> &[String] {
        self.api_directory
            .meta
            .as_ref()
            .and_then(|m| m.caaIdentities.as_deref())
            .unwrap_or(&[])
    }

    /// Defaults to `false` when the CA doesn't say.
    pub fn external_account_required(&self) -> bool {
        self.api_directory
            .meta
            .as_ref()
            .map(|m| m.externalAccountRequired())
            .unwrap_or(false)
    }

    /// Legacy pre-authorization endpoint. Exposed only; there is no
    /// pre-authorization flow.
    pub fn new_authz(&self) -> Option<&str> {
        self.api_directory.newAuthz.as_deref()
    }

    /// Access the underlying JSON object for debugging.
    pub fn api_directory(&self) -> &ApiDirectory {
        &self.api_directory
    }
}

fn fetch<H: HttpClient>(client: &H, url: &str) -> Result<ApiDirectory> {
    debug!("Fetch directory {}", url);
    let res = client.get(url)?.handle_errors()?;
    read_json(res)
}
