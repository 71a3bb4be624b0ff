use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sha::sha256;
use openssl::sign::Signer;
use serde::{Deserialize, Serialize};

use crate::acc::{AccountKey, AcmeKey};
use crate::util::{base64url, base64url_decode};
use crate::{Error, Result};

#[derive(Debug, Serialize, Deserialize, Default)]
pub(crate) struct JwsProtected {
    alg: String,
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl JwsProtected {
    fn new_jwk(key: &AccountKey, url: &str, nonce: Option<String>) -> Result<Self> {
        Ok(JwsProtected {
            alg: key.alg().as_str().into(),
            url: url.into(),
            nonce,
            jwk: Some(key.jwk()?),
            ..Default::default()
        })
    }
    fn new_kid(key: &AcmeKey, url: &str, nonce: String) -> Result<Self> {
        Ok(JwsProtected {
            alg: key.key().alg().as_str().into(),
            url: url.into(),
            nonce: Some(nonce),
            kid: Some(key.key_id()?.into()),
            ..Default::default()
        })
    }
}

/// Public key as JWK.
///
/// LEXICAL ORDER OF FIELDS MATTER! Serialized as is, this is the input of
/// the RFC 7638 thumbprint.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub(crate) enum Jwk {
    Ec {
        crv: String,
        kty: String,
        x: String,
        y: String,
    },
    Rsa {
        e: String,
        kty: String,
        n: String,
    },
}

/// Flattened JWS, the body of every signed request.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Jws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

/// Signed with the account key id. For all calls after newAccount.
pub(crate) fn jws_with_kid<T: Serialize + ?Sized>(
    url: &str,
    nonce: String,
    key: &AcmeKey,
    payload: &T,
) -> Result<Jws> {
    let protected = JwsProtected::new_kid(key, url, nonce)?;
    jws_with(&protected, key.key(), payload)
}

/// Signed with the full public key. For newAccount, and for revocations
/// signed by the certificate key.
pub(crate) fn jws_with_jwk<T: Serialize + ?Sized>(
    url: &str,
    nonce: String,
    key: &AccountKey,
    payload: &T,
) -> Result<Jws> {
    let protected = JwsProtected::new_jwk(key, url, Some(nonce))?;
    jws_with(&protected, key, payload)
}

fn encode_parts<T: Serialize + ?Sized>(protected: &JwsProtected, payload: &T) -> Result<(String, String)> {
    let protected = {
        let pro_json = serde_json::to_string(protected)?;
        base64url(pro_json.as_bytes())
    };
    let payload = {
        let pay_json = serde_json::to_string(payload)?;
        if pay_json == "\"\"" {
            // This is a special case produced by ApiEmptyString and should
            // not be further base64url encoded. POST-as-GET.
            "".to_string()
        } else {
            base64url(pay_json.as_bytes())
        }
    };
    Ok((protected, payload))
}

fn jws_with<T: Serialize + ?Sized>(protected: &JwsProtected, key: &AccountKey, payload: &T) -> Result<Jws> {
    let (protected, payload) = encode_parts(protected, payload)?;
    let to_sign = format!("{}.{}", protected, payload);
    let signature = base64url(&key.sign(to_sign.as_bytes())?);
    Ok(Jws {
        protected,
        payload,
        signature,
    })
}

/// Inner JWS of a key rollover: the new key signs the account URL and the
/// old key. It has no nonce, the outer JWS carries it.
pub(crate) fn key_change_jws(
    key_change_url: &str,
    account_url: &str,
    old_key: &AccountKey,
    new_key: &AccountKey,
) -> Result<Jws> {
    let protected = JwsProtected::new_jwk(new_key, key_change_url, None)?;
    let payload = crate::api::ApiKeyChange {
        account: account_url.into(),
        oldKey: serde_json::to_value(old_key.jwk()?)?,
    };
    jws_with(&protected, new_key, &payload)
}

/// Credentials from a CA that requires binding new ACME accounts to an
/// existing account in its own system.
#[derive(Clone)]
pub struct ExternalAccountBinding {
    key_id: String,
    hmac_key: Vec<u8>,
}

impl ExternalAccountBinding {
    /// `hmac_key` as handed out by the CA: base64url.
    pub fn new(key_id: &str, hmac_key: &str) -> Result<Self> {
        let hmac_key = base64url_decode(hmac_key)?;
        if key_id.is_empty() || hmac_key.is_empty() {
            return Err(Error::Validation("Empty external account binding".into()));
        }
        Ok(ExternalAccountBinding {
            key_id: key_id.into(),
            hmac_key,
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// HS256 JWS over the account JWK, for the newAccount payload.
    pub(crate) fn jws(&self, new_account_url: &str, account_key: &AccountKey) -> Result<Jws> {
        let protected = JwsProtected {
            alg: "HS256".into(),
            url: new_account_url.into(),
            kid: Some(self.key_id.clone()),
            ..Default::default()
        };
        let (protected, payload) = encode_parts(&protected, &account_key.jwk()?)?;
        let to_sign = format!("{}.{}", protected, payload);
        let mac_key = PKey::hmac(&self.hmac_key)?;
        let mut signer = Signer::new(MessageDigest::sha256(), &mac_key)?;
        signer.update(to_sign.as_bytes())?;
        let signature = base64url(&signer.sign_to_vec()?);
        Ok(Jws {
            protected,
            payload,
            signature,
        })
    }
}

impl std::fmt::Debug for ExternalAccountBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalAccountBinding")
            .field("key_id", &self.key_id)
            .finish()
    }
}

pub(crate) fn key_authorization(token: &str, key: &AccountKey, extra_sha256: bool) -> Result<String> {
    let key_auth = format!("{}.{}", token, key.thumbprint()?);
    if extra_sha256 {
        Ok(base64url(&sha256(key_auth.as_bytes())))
    } else {
        Ok(key_auth)
    }
}
