use openssl::bn::{BigNum, BigNumContext};
use openssl::ecdsa::EcdsaSig;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, Private};
use openssl::sign::Signer;
use std::fmt;

use crate::jwt::Jwk;
use crate::util::base64url;
use crate::{Error, Result};

const MIN_RSA_BITS: u32 = 2048;

/// JWS signature algorithms supported for account and certificate keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JwsAlg {
    /// ECDSA P-256 with SHA-256.
    ES256,
    /// ECDSA P-384 with SHA-384.
    ES384,
    /// RSASSA-PKCS1-v1_5 with SHA-256.
    RS256,
}

impl JwsAlg {
    pub fn as_str(self) -> &'static str {
        match self {
            JwsAlg::ES256 => "ES256",
            JwsAlg::ES384 => "ES384",
            JwsAlg::RS256 => "RS256",
        }
    }

    /// The curve, and width of one signature/coordinate half in bytes.
    fn ec_params(self) -> Option<(Nid, usize)> {
        match self {
            JwsAlg::ES256 => Some((Nid::X9_62_PRIME256V1, 32)),
            JwsAlg::ES384 => Some((Nid::SECP384R1, 48)),
            JwsAlg::RS256 => None,
        }
    }
}

/// Key pair signing requests to the ACME API.
///
/// The key belongs to the caller. This is a cheap, reference counted handle;
/// the library never changes or stores it.
#[derive(Clone)]
pub struct AccountKey {
    pkey: PKey<Private>,
    alg: JwsAlg,
}

impl AccountKey {
    /// Wrap a key, picking the algorithm from its type and curve.
    ///
    /// EC keys on P-256 and P-384, and RSA keys of at least 2048 bits, are
    /// supported.
    pub fn from_pkey(pkey: PKey<Private>) -> Result<Self> {
        let alg = match pkey.id() {
            Id::EC => {
                let ec = pkey.ec_key()?;
                match ec.group().curve_name() {
                    Some(Nid::X9_62_PRIME256V1) => JwsAlg::ES256,
                    Some(Nid::SECP384R1) => JwsAlg::ES384,
                    other => {
                        return Err(Error::Signing(format!("Unsupported EC curve: {:?}", other)));
                    }
                }
            }
            Id::RSA => {
                let bits = pkey.rsa()?.size() * 8;
                if bits < MIN_RSA_BITS {
                    return Err(Error::Signing(format!(
                        "RSA key of {} bits, at least {} required",
                        bits, MIN_RSA_BITS
                    )));
                }
                JwsAlg::RS256
            }
            other => return Err(Error::Signing(format!("Unsupported key type: {:?}", other))),
        };
        Ok(AccountKey { pkey, alg })
    }

    /// Wrap a key that must sign with `alg`.
    ///
    /// Fails if the key's type or curve doesn't fit the algorithm.
    pub fn with_alg(pkey: PKey<Private>, alg: JwsAlg) -> Result<Self> {
        let key = AccountKey::from_pkey(pkey)?;
        if key.alg != alg {
            return Err(Error::Signing(format!(
                "Key is usable for {}, not {}",
                key.alg.as_str(),
                alg.as_str()
            )));
        }
        Ok(key)
    }

    /// Read a PEM encoded private key.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let pkey = PKey::private_key_from_pem(pem)?;
        AccountKey::from_pkey(pkey)
    }

    pub fn alg(&self) -> JwsAlg {
        self.alg
    }

    /// RFC 7638 thumbprint of the public key, base64url encoded.
    pub fn thumbprint(&self) -> Result<String> {
        let jwk = self.jwk()?;
        let jwk_json = serde_json::to_string(&jwk)?;
        Ok(base64url(&openssl::sha::sha256(jwk_json.as_bytes())))
    }

    pub(crate) fn jwk(&self) -> Result<Jwk> {
        match self.alg.ec_params() {
            Some((_, width)) => {
                let ec = self.pkey.ec_key()?;
                let mut ctx = BigNumContext::new()?;
                let mut x = BigNum::new()?;
                let mut y = BigNum::new()?;
                ec.public_key()
                    .affine_coordinates_gfp(ec.group(), &mut x, &mut y, &mut ctx)?;
                let crv = match self.alg {
                    JwsAlg::ES384 => "P-384",
                    _ => "P-256",
                };
                Ok(Jwk::Ec {
                    crv: crv.into(),
                    kty: "EC".into(),
                    x: base64url(&x.to_vec_padded(width as i32)?),
                    y: base64url(&y.to_vec_padded(width as i32)?),
                })
            }
            None => {
                let rsa = self.pkey.rsa()?;
                Ok(Jwk::Rsa {
                    e: base64url(&rsa.e().to_vec()),
                    kty: "RSA".into(),
                    n: base64url(&rsa.n().to_vec()),
                })
            }
        }
    }

    /// Sign `data`, producing the JWS signature bytes.
    pub(crate) fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.alg.ec_params() {
            Some((nid, width)) => {
                let ec = self.pkey.ec_key()?;
                if ec.group().curve_name() != Some(nid) {
                    return Err(Error::Signing(format!(
                        "Key curve does not match {}",
                        self.alg.as_str()
                    )));
                }
                let digest = match self.alg {
                    JwsAlg::ES384 => openssl::sha::sha384(data).to_vec(),
                    _ => openssl::sha::sha256(data).to_vec(),
                };
                let sig = EcdsaSig::sign(&digest, &ec)?;
                // JWS wants fixed width r || s, not DER
                let mut v = sig.r().to_vec_padded(width as i32)?;
                v.extend_from_slice(&sig.s().to_vec_padded(width as i32)?);
                Ok(v)
            }
            None => {
                let mut signer = Signer::new(MessageDigest::sha256(), &self.pkey)?;
                signer.update(data)?;
                Ok(signer.sign_to_vec()?)
            }
        }
    }
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountKey({})", self.alg.as_str())
    }
}

/// The signing key, and the key id once the account exists.
#[derive(Clone, Debug)]
pub(crate) struct AcmeKey {
    key: AccountKey,
    /// set once we contacted the ACME API to figure out the key id
    key_id: Option<String>,
}

impl AcmeKey {
    pub(crate) fn new(key: AccountKey) -> Self {
        AcmeKey { key, key_id: None }
    }

    pub(crate) fn key(&self) -> &AccountKey {
        &self.key
    }

    pub(crate) fn key_id(&self) -> Result<&str> {
        self.key_id
            .as_deref()
            .ok_or_else(|| Error::Signing("No key id, the account is not created yet".into()))
    }

    pub(crate) fn set_key_id(&mut self, kid: String) {
        self.key_id = Some(kid)
    }

    /// Same key id, different key. Used after a key rollover.
    pub(crate) fn replace_key(&mut self, key: AccountKey) {
        self.key = key;
    }
}
