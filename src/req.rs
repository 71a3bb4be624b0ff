//! The HTTP transport the ACME client runs on.
//!
//! The client only needs three verbs and a way to read the response. Plug in
//! another HTTP stack by implementing [`HttpClient`]; [`UReq`] is the default.
//!
//! [`UReq`]: ../struct.UReq.html
use crate::api::ApiProblem;
use crate::util;
use crate::{Error, Result};

/// Blocking HTTP client.
///
/// Implementations return `Ok` for every response the server produced,
/// including 4xx and 5xx. `Err` is reserved for connection/TLS failures and
/// should be [`Error::Transport`].
///
/// [`Error::Transport`]: ../enum.Error.html#variant.Transport
pub trait HttpClient: Clone {
    type Response: HttpResponse;

    fn get(&self, url: &str) -> Result<Self::Response>;

    fn head(&self, url: &str) -> Result<Self::Response>;

    /// POST with `content-type: application/jose+json`.
    fn post(&self, url: &str, body: &str) -> Result<Self::Response>;
}

/// Response produced by an [`HttpClient`].
pub trait HttpResponse: Sized {
    fn status(&self) -> u16;

    /// First value of the header. Names are case insensitive.
    fn header(&self, name: &str) -> Option<&str>;

    /// All values of a repeated header, such as `Link`.
    fn headers_all(&self, name: &str) -> Vec<&str> {
        self.header(name).into_iter().collect()
    }

    fn body(self) -> Result<Vec<u8>>;

    /// Turn 4xx/5xx responses into [`Error::Problem`].
    ///
    /// Bodies that are not `application/problem+json` become an `about:blank`
    /// problem carrying the HTTP status and the body text.
    ///
    /// [`Error::Problem`]: ../enum.Error.html#variant.Problem
    fn handle_errors(self) -> Result<Self> {
        // ok responses pass through
        let status = self.status();
        if status < 400 {
            return Ok(self);
        }

        let retry_after = util::retry_after(&self);
        let is_problem = self
            .header("content-type")
            .map(|c| c.starts_with("application/problem+json"))
            .unwrap_or(false);
        let body = self.body()?;

        let mut problem = if is_problem {
            // if we were sent a problem+json, deserialize it
            serde_json::from_slice::<ApiProblem>(&body).map_err(|e| {
                Error::Protocol(format!(
                    "Failed to deserialize application/problem+json ({}) body: {}",
                    e,
                    String::from_utf8_lossy(&body)
                ))
            })?
        } else {
            // some other problem
            ApiProblem {
                _type: "about:blank".into(),
                detail: Some(format!(
                    "{} body: {}",
                    status,
                    String::from_utf8_lossy(&body)
                )),
                ..Default::default()
            }
        };

        if problem.status.is_none() {
            problem.status = Some(status);
        }
        problem.retry_after = retry_after;

        Err(Error::Problem(problem))
    }
}
