use std::io::Read;
use std::time::Duration;

use crate::req::{HttpClient, HttpResponse};
use crate::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// [`HttpClient`] on top of [ureq](https://docs.rs/ureq).
///
/// Connections are pooled in the wrapped agent and released when the last
/// clone is dropped.
///
/// [`HttpClient`]: trait.HttpClient.html
#[derive(Clone, Debug)]
pub struct UReq {
    agent: ::ureq::Agent,
}

impl Default for UReq {
    fn default() -> Self {
        UReq::with_timeout(DEFAULT_TIMEOUT)
    }
}

impl UReq {
    /// Client with 30 second connect/read/write timeouts.
    pub fn new() -> Self {
        UReq::default()
    }

    /// Client with the given connect/read/write timeouts.
    pub fn with_timeout(timeout: Duration) -> Self {
        let agent = ::ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .user_agent(concat!("acme-core/", env!("CARGO_PKG_VERSION")))
            .build();
        UReq { agent }
    }

    fn finish(res: std::result::Result<::ureq::Response, ::ureq::Error>) -> Result<::ureq::Response> {
        match res {
            Ok(res) => Ok(res),
            // error statuses are handled by HttpResponse::handle_errors
            Err(::ureq::Error::Status(_, res)) => Ok(res),
            Err(e) => Err(Error::Transport(e.to_string())),
        }
    }
}

impl HttpClient for UReq {
    type Response = ::ureq::Response;

    fn get(&self, url: &str) -> Result<Self::Response> {
        trace!("GET {}", url);
        Self::finish(self.agent.get(url).call())
    }

    fn head(&self, url: &str) -> Result<Self::Response> {
        trace!("HEAD {}", url);
        Self::finish(self.agent.head(url).call())
    }

    fn post(&self, url: &str, body: &str) -> Result<Self::Response> {
        trace!("POST {} {}", url, body);
        let req = self
            .agent
            .post(url)
            .set("content-type", "application/jose+json");
        Self::finish(req.send_string(body))
    }
}

impl HttpResponse for ::ureq::Response {
    fn status(&self) -> u16 {
        ::ureq::Response::status(self)
    }

    fn header(&self, name: &str) -> Option<&str> {
        ::ureq::Response::header(self, name)
    }

    fn headers_all(&self, name: &str) -> Vec<&str> {
        self.all(name)
    }

    fn body(self) -> Result<Vec<u8>> {
        let mut res_body = vec![];
        let mut read = self.into_reader();
        // letsencrypt sometimes closes the TLS abruptly causing io error
        // even though we did capture the body.
        if let Err(e) = read.read_to_end(&mut res_body) {
            if res_body.is_empty() {
                return Err(e.into());
            }
            debug!("Ignoring error after reading body: {}", e);
        }
        Ok(res_body)
    }
}
