use crate::api::{ApiEmptyString, ApiRevocation};
use crate::req::{HttpClient, HttpResponse};
use crate::trans::Transport;
use crate::util::{base64url, links};
use crate::{Error, Result};

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

/// Certificate chain as issued.
///
/// The bytes are kept exactly as the ACME API delivered them, normally
/// `application/pem-certificate-chain` with the leaf first. Nothing is
/// reordered or validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain {
    bytes: Vec<u8>,
    content_type: Option<String>,
    alternates: Vec<String>,
}

impl CertificateChain {
    pub(crate) fn new(bytes: Vec<u8>, content_type: Option<String>, alternates: Vec<String>) -> Self {
        CertificateChain {
            bytes,
            content_type,
            alternates,
        }
    }

    /// The raw response body.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// URLs of alternate chains offered through `Link: <..>;rel="alternate"`.
    ///
    /// Fetch them with [`Account::certificate`].
    ///
    /// [`Account::certificate`]: struct.Account.html#method.certificate
    pub fn alternates(&self) -> &[String] {
        &self.alternates
    }

    /// Each `CERTIFICATE` PEM block, in delivery order.
    pub fn pem_certificates(&self) -> Result<Vec<&str>> {
        let text = std::str::from_utf8(&self.bytes)
            .map_err(|e| Error::Protocol(format!("Certificate chain is not PEM: {}", e)))?;
        let mut blocks = vec![];
        let mut rest = text;
        while let Some(start) = rest.find(PEM_BEGIN) {
            let from_start = &rest[start..];
            let end = from_start.find(PEM_END).ok_or_else(|| {
                Error::Protocol("Unterminated PEM block in certificate chain".into())
            })? + PEM_END.len();
            blocks.push(&from_start[..end]);
            rest = &from_start[end..];
        }
        Ok(blocks)
    }

    /// The first PEM block, which is the issued certificate.
    pub fn leaf_pem(&self) -> Result<&str> {
        self.pem_certificates()?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Protocol("No certificate in chain".into()))
    }
}

/// RFC 5280 CRLReason codes accepted on revocation.
///
/// Code 7 is unused in RFC 5280 and has no variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationReason {
    Unspecified,
    KeyCompromise,
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
    RemoveFromCrl,
    PrivilegeWithdrawn,
    AaCompromise,
}

impl RevocationReason {
    pub fn code(self) -> u8 {
        match self {
            RevocationReason::Unspecified => 0,
            RevocationReason::KeyCompromise => 1,
            RevocationReason::CaCompromise => 2,
            RevocationReason::AffiliationChanged => 3,
            RevocationReason::Superseded => 4,
            RevocationReason::CessationOfOperation => 5,
            RevocationReason::CertificateHold => 6,
            RevocationReason::RemoveFromCrl => 8,
            RevocationReason::PrivilegeWithdrawn => 9,
            RevocationReason::AaCompromise => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        use RevocationReason::*;
        [
            Unspecified,
            KeyCompromise,
            CaCompromise,
            AffiliationChanged,
            Superseded,
            CessationOfOperation,
            CertificateHold,
            RemoveFromCrl,
            PrivilegeWithdrawn,
            AaCompromise,
        ]
        .iter()
        .copied()
        .find(|r| r.code() == code)
    }
}

/// The revokeCert payload.
pub(crate) fn revocation(
    certificate_der: &[u8],
    reason: Option<RevocationReason>,
) -> Result<ApiRevocation> {
    if certificate_der.is_empty() {
        return Err(Error::Validation("Empty certificate".into()));
    }
    Ok(ApiRevocation {
        certificate: base64url(certificate_der),
        reason: reason.map(RevocationReason::code),
    })
}

/// POST-as-GET a certificate URL.
pub(crate) fn download<H: HttpClient>(transport: &Transport<H>, url: &str) -> Result<CertificateChain> {
    debug!("Download certificate {}", url);
    let res = transport.call(url, &ApiEmptyString)?;
    let content_type = res.header("content-type").map(|c| c.to_string());
    let alternates = links(&res, "alternate");
    let bytes = res.body()?;
    if bytes.is_empty() {
        return Err(Error::Protocol(format!("Empty certificate from {}", url)));
    }
    Ok(CertificateChain::new(bytes, content_type, alternates))
}
