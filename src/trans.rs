use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::acc::{AccountKey, AcmeKey};
use crate::jwt::*;
use crate::req::{HttpClient, HttpResponse};
use crate::{Error, Result};

const REPLAY_NONCE: &str = "replay-nonce";

/// JWS payload and nonce handling for requests to the API.
///
/// Setup is:
///
/// 1. `Transport::new()`
/// 2. `call_jwk()` against newAccount url
/// 3. `set_key_id` from the returned `Location` header.
/// 4. `call()` for all calls after that.
#[derive(Debug)]
pub(crate) struct Transport<H: HttpClient> {
    acme_key: RwLock<AcmeKey>,
    client: H,
    nonces: Arc<NonceManager<H>>,
}

impl<H: HttpClient> Transport<H> {
    pub fn new(nonces: &Arc<NonceManager<H>>, client: H, key: AccountKey) -> Self {
        Transport {
            acme_key: RwLock::new(AcmeKey::new(key)),
            client,
            nonces: nonces.clone(),
        }
    }

    /// Update the key id once it is known (part of setting up the transport).
    pub fn set_key_id(&self, kid: String) {
        self.write_key().set_key_id(kid);
    }

    /// Swap in the key that replaced the current one.
    pub fn replace_key(&self, key: AccountKey) {
        self.write_key().replace_key(key);
    }

    /// The key used in the transport
    pub fn acme_key(&self) -> AcmeKey {
        self.acme_key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write_key(&self) -> std::sync::RwLockWriteGuard<'_, AcmeKey> {
        self.acme_key.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make call using the full jwk. Only for the first newAccount request.
    pub fn call_jwk<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<H::Response> {
        let key = self.acme_key();
        self.do_call(url, |nonce| jws_with_jwk(url, nonce, key.key(), body))
    }

    /// Make call using the key id
    pub fn call<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<H::Response> {
        let key = self.acme_key();
        self.do_call(url, |nonce| jws_with_kid(url, nonce, &key, body))
    }

    /// Sign each attempt with `make_body` and post it.
    ///
    /// A `badNonce` answer is retried exactly once with a fresh nonce. A
    /// second `badNonce` is returned to the caller.
    fn do_call<F: Fn(String) -> Result<Jws>>(&self, url: &str, make_body: F) -> Result<H::Response> {
        let mut retried = false;
        loop {
            // Either the nonce of a previous response, or a new one.
            let nonce = self.nonces.acquire()?;

            // Sign the body.
            let jws = make_body(nonce)?;
            let body = serde_json::to_string(&jws)?;

            debug!("Call endpoint {}", url);

            // Post it to the URL
            let response = self.client.post(url, &body)?;

            // Regardless of the request being a success or not, there might be
            // a nonce in the response.
            self.nonces.observe(&response);

            match response.handle_errors() {
                Err(Error::Problem(problem)) if problem.is_bad_nonce() && !retried => {
                    debug!("Retrying on bad nonce: {}", problem);
                    retried = true;
                }
                result => return result,
            }
        }
    }
}

/// Holds at most one unused nonce.
///
/// `acquire` hands out the cached nonce, or fetches a new one from the
/// newNonce endpoint, and the handed out value is never cached again.
#[derive(Debug)]
pub(crate) struct NonceManager<H: HttpClient> {
    nonce_url: String,
    client: H,
    cached: Mutex<Option<String>>,
}

impl<H: HttpClient> NonceManager<H> {
    pub fn new(client: H, nonce_url: &str) -> Self {
        NonceManager {
            nonce_url: nonce_url.into(),
            client,
            cached: Mutex::new(None),
        }
    }

    /// Keep the nonce of a response. Last write wins.
    pub fn observe(&self, res: &impl HttpResponse) {
        if let Some(nonce) = res.header(REPLAY_NONCE) {
            trace!("Extract nonce");
            *self.lock() = Some(nonce.to_string());
        }
    }

    /// Take the cached nonce or fetch a new one.
    ///
    /// The lock is held through the fetch so two callers can never leave
    /// with the same value.
    pub fn acquire(&self) -> Result<String> {
        let mut cached = self.lock();
        if let Some(nonce) = cached.take() {
            trace!("Use previous nonce");
            return Ok(nonce);
        }
        debug!("Request new nonce");
        let res = self.client.head(&self.nonce_url)?;
        match res.header(REPLAY_NONCE) {
            Some(nonce) => Ok(nonce.to_string()),
            None => Err(Error::Protocol(format!(
                "No Replay-Nonce header from {} ({})",
                self.nonce_url,
                res.status()
            ))),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.cached.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
