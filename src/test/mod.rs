//! In-process ACME server for the tests.
//!
//! Issues sequential nonces and refuses reused ones, verifies every JWS
//! signature against the account key, and moves orders and authorizations
//! forward the way a CA would. Behaviour can be bent per test, see the
//! methods on [`TestServer`].
#![allow(clippy::trivial_regex)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::{Future, Stream};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, Server};
use lazy_static::lazy_static;
use openssl::bn::BigNum;
use openssl::ec::{Asn1Flag, EcGroup, EcKey};
use openssl::ecdsa::EcdsaSig;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::{Signer, Verifier};
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Req, X509ReqBuilder};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::order::{ChallengeProof, ChallengeResolver};
use crate::util::{base64url, base64url_decode};
use crate::*;

pub const EAB_KID: &str = "kid-test-1";
/// base64url of `secret-hmac-key`
pub const EAB_HMAC_KEY: &str = "c2VjcmV0LWhtYWMta2V5";

const CHALLENGE_TYPES: &[&str] = &["http-01", "tls-alpn-01", "dns-01"];

lazy_static! {
    static ref RE_URL: regex::Regex = regex::Regex::new("<URL>").unwrap();
    static ref RE_EAR: regex::Regex = regex::Regex::new("<EAR>").unwrap();
    static ref RE_RESOURCE: regex::Regex =
        regex::Regex::new(r"^/acme/(acct|order|authz|finalize|cert)/(\d+)(/alt)?$").unwrap();
    static ref RE_CHALL: regex::Regex = regex::Regex::new(r"^/acme/chall/(\d+)/([a-z0-9-]+)$").unwrap();
    static ref EC_GROUP_P256: EcGroup = ec_group(Nid::X9_62_PRIME256V1);
    static ref EC_GROUP_P384: EcGroup = ec_group(Nid::SECP384R1);
}

fn ec_group(nid: Nid) -> EcGroup {
    let mut g = EcGroup::from_curve_name(nid).expect("EcGroup");
    // this is required for openssl 1.0.x (but not 1.1.x)
    g.set_asn1_flag(Asn1Flag::NAMED_CURVE);
    g
}

pub fn create_p256_key() -> PKey<Private> {
    let pri_key_ec = EcKey::generate(&*EC_GROUP_P256).expect("EcKey");
    PKey::from_ec_key(pri_key_ec).expect("from_ec_key")
}

pub fn create_p384_key() -> PKey<Private> {
    let pri_key_ec = EcKey::generate(&*EC_GROUP_P384).expect("EcKey");
    PKey::from_ec_key(pri_key_ec).expect("from_ec_key")
}

pub fn create_rsa_key() -> PKey<Private> {
    let pri_key_rsa = Rsa::generate(2048).expect("Rsa::generate");
    PKey::from_rsa(pri_key_rsa).expect("from_rsa")
}

/// DER CSR for `domains` with a throwaway key.
pub fn create_csr(domains: &[&str]) -> Vec<u8> {
    let pkey = create_p256_key();
    let mut req_bld = X509ReqBuilder::new().expect("X509ReqBuilder");
    req_bld.set_pubkey(&pkey).expect("set_pubkey");

    // all domains as alt names
    let ext = {
        let ctx = req_bld.x509v3_context(None);
        let mut an = SubjectAlternativeName::new();
        for d in domains {
            an.dns(d);
        }
        an.build(&ctx).expect("SubjectAlternativeName::build")
    };
    let mut stack = Stack::new().expect("Stack::new");
    stack.push(ext).expect("Stack::push");
    req_bld.add_extensions(&stack).expect("add_extensions");

    req_bld.sign(&pkey, MessageDigest::sha256()).expect("csr_sign");
    req_bld.build().to_der().expect("to_der")
}

/// A fresh P-256 account on the test server.
pub fn account(server: &TestServer) -> Result<Account<UReq>> {
    let dir = Directory::from_url(UReq::new(), DirectoryUrl::Other(&server.dir_url))?;
    let key = AccountKey::from_pkey(create_p256_key())?;
    dir.create_account(key, &["mailto:foo@bar.com"], true, None)
}

/// Resolver remembering what it was asked to do.
#[derive(Default)]
pub struct RecordingResolver {
    presented: Mutex<Vec<ChallengeProof>>,
    cleaned: Mutex<Vec<ChallengeProof>>,
    fail_present: bool,
    fail_cleanup: bool,
}

impl RecordingResolver {
    pub fn failing_present() -> Self {
        RecordingResolver {
            fail_present: true,
            ..Default::default()
        }
    }

    pub fn failing_cleanup() -> Self {
        RecordingResolver {
            fail_cleanup: true,
            ..Default::default()
        }
    }

    pub fn presented(&self) -> Vec<ChallengeProof> {
        self.presented.lock().unwrap().clone()
    }

    pub fn cleaned(&self) -> Vec<ChallengeProof> {
        self.cleaned.lock().unwrap().clone()
    }
}

impl ChallengeResolver for RecordingResolver {
    fn present(&self, proof: &ChallengeProof) -> Result<()> {
        self.presented.lock().unwrap().push(proof.clone());
        if self.fail_present {
            return Err(Error::Transport("dns provider down".into()));
        }
        Ok(())
    }

    fn cleanup(&self, proof: &ChallengeProof) -> Result<()> {
        self.cleaned.lock().unwrap().push(proof.clone());
        if self.fail_cleanup {
            return Err(Error::Transport("dns provider down".into()));
        }
        Ok(())
    }
}

struct AccountRec {
    jwk: Value,
    contact: Vec<String>,
    status: &'static str,
    tos: bool,
}

struct OrderRec {
    account: usize,
    identifiers: Vec<Value>,
    authzs: Vec<usize>,
    status: &'static str,
    polls_left: u32,
}

struct AuthzRec {
    identifier: Value,
    wildcard: bool,
    status: &'static str,
    accepted: Option<String>,
    polls_left: u32,
}

/// What the server saw and what it is told to do.
#[derive(Default)]
pub struct ServerState {
    url: String,
    next_nonce: u64,
    nonces: HashSet<String>,
    pub nonce_fetches: usize,
    /// Reused or unknown nonces.
    pub duplicate_nonces: usize,
    pub directory_fetches: usize,
    requests: Vec<String>,
    bad_nonce: HashMap<String, usize>,
    rate_limited: HashMap<String, usize>,
    external_account_required: bool,
    pub eab_verified: usize,
    accounts: Vec<AccountRec>,
    pub key_changes: usize,
    orders: Vec<OrderRec>,
    authzs: Vec<AuthzRec>,
    pub challenges_accepted: usize,
    revoked: HashSet<String>,
    pub revoked_by_kid: usize,
    pub revoked_by_jwk: usize,
    fail_challenges: bool,
    hold_authorizations: bool,
    hold_orders: bool,
    regress_orders: bool,
}

/// A request that passed the JWS checks.
struct Signed {
    payload: Option<Value>,
    account: Option<usize>,
    jwk: Value,
}

type Res = Response<Body>;

fn problem(status: u16, kind: &str, detail: &str) -> Res {
    let body = json!({
        "type": format!("urn:ietf:params:acme:error:{}", kind),
        "detail": detail,
        "status": status,
    });
    Response::builder()
        .status(status)
        .header("content-type", "application/problem+json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn json_res(status: u16, body: &Value, location: Option<String>) -> Res {
    let mut b = Response::builder();
    b.status(status).header("content-type", "application/json");
    if let Some(location) = location {
        b.header("location", location);
    }
    b.body(Body::from(body.to_string())).unwrap()
}

fn decode_json(b64: &str) -> Option<Value> {
    serde_json::from_slice(&base64url_decode(b64).ok()?).ok()
}

fn pem(content: &str) -> String {
    format!(
        "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
        STANDARD.encode(content)
    )
}

fn verify_signature(alg: &str, jwk: &Value, input: &[u8], sig: &[u8]) -> bool {
    verify_signature_inner(alg, jwk, input, sig).unwrap_or(false)
}

fn verify_signature_inner(
    alg: &str,
    jwk: &Value,
    input: &[u8],
    sig: &[u8],
) -> std::result::Result<bool, Box<dyn std::error::Error>> {
    let param = |name: &str| -> std::result::Result<BigNum, Box<dyn std::error::Error>> {
        let v = jwk[name].as_str().ok_or("missing jwk member")?;
        Ok(BigNum::from_slice(&base64url_decode(v)?)?)
    };
    let (nid, width, digest) = match alg {
        "ES256" => (Nid::X9_62_PRIME256V1, 32, openssl::sha::sha256(input).to_vec()),
        "ES384" => (Nid::SECP384R1, 48, openssl::sha::sha384(input).to_vec()),
        "RS256" => {
            let rsa = Rsa::from_public_components(param("n")?, param("e")?)?;
            let pkey = PKey::from_rsa(rsa)?;
            let mut verifier = Verifier::new(MessageDigest::sha256(), &pkey)?;
            verifier.update(input)?;
            return Ok(verifier.verify(sig)?);
        }
        _ => return Ok(false),
    };
    if sig.len() != 2 * width {
        return Ok(false);
    }
    let group = EcGroup::from_curve_name(nid)?;
    let (x, y) = (param("x")?, param("y")?);
    let key = EcKey::from_public_key_affine_coordinates(&group, &x, &y)?;
    let r = BigNum::from_slice(&sig[..width])?;
    let s = BigNum::from_slice(&sig[width..])?;
    let sig = EcdsaSig::from_private_components(r, s)?;
    Ok(sig.verify(&digest, &key)?)
}

fn take_injection(map: &mut HashMap<String, usize>, path: &str) -> bool {
    match map.get_mut(path) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

impl ServerState {
    /// POSTs seen for `path`, including refused ones.
    pub fn requests_to(&self, path: &str) -> usize {
        self.requests.iter().filter(|p| *p == path).count()
    }

    fn path(&self, p: &str) -> String {
        format!("{}{}", self.url, p)
    }

    fn new_nonce(&mut self) -> String {
        self.next_nonce += 1;
        let nonce = format!("nonce-{:06}", self.next_nonce);
        self.nonces.insert(nonce.clone());
        nonce
    }

    fn directory(&self) -> Res {
        const BODY: &str = r#"{
        "keyChange": "<URL>/acme/key-change",
        "newAccount": "<URL>/acme/new-acct",
        "newNonce": "<URL>/acme/new-nonce",
        "newOrder": "<URL>/acme/new-order",
        "revokeCert": "<URL>/acme/revoke-cert",
        "meta": {
            "caaIdentities": [
            "testdir.org"
            ],
            "termsOfService": "https://testdir.org/tos.pdf",
            "website": "https://testdir.org",
            "externalAccountRequired": <EAR>
        }
        }"#;
        let ear = if self.external_account_required { "true" } else { "false" };
        let body = RE_URL.replace_all(BODY, &self.url[..]).to_string();
        let body = RE_EAR.replace_all(&body, ear).to_string();
        Response::new(Body::from(body))
    }

    fn post(&mut self, path: &str, content_type: Option<&str>, body: &[u8]) -> Res {
        self.requests.push(path.to_string());
        if content_type != Some("application/jose+json") {
            return problem(415, "malformed", "expected application/jose+json");
        }
        let jws: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(_) => return problem(400, "malformed", "body is not JSON"),
        };
        let signed = match self.verify_request(path, &jws) {
            Ok(s) => s,
            Err(res) => return res,
        };
        if take_injection(&mut self.bad_nonce, path) {
            return problem(400, "badNonce", "injected bad nonce");
        }
        if take_injection(&mut self.rate_limited, path) {
            let mut res = problem(429, "rateLimited", "slow down");
            res.headers_mut()
                .insert("retry-after", HeaderValue::from_static("5"));
            return res;
        }

        match path {
            "/acme/new-acct" => return self.new_account(signed),
            "/acme/key-change" => return self.key_change(signed),
            "/acme/new-order" => return self.new_order(signed),
            "/acme/revoke-cert" => return self.revoke(signed),
            _ => {}
        }
        if let Some(caps) = RE_CHALL.captures(path) {
            let id: usize = caps[1].parse().unwrap_or(0);
            return self.challenge(id, &caps[2], signed);
        }
        if let Some(caps) = RE_RESOURCE.captures(path) {
            let id: usize = caps[2].parse().unwrap_or(0);
            return match (&caps[1], caps.get(3).is_some()) {
                ("acct", false) => self.account(id, signed),
                ("order", false) => self.order(id, signed),
                ("authz", false) => self.authz(id, signed),
                ("finalize", false) => self.finalize(id, signed),
                ("cert", alt) => self.certificate(id, alt, signed),
                _ => problem(404, "malformed", "no such resource"),
            };
        }
        problem(404, "malformed", "no such resource")
    }

    fn verify_request(&mut self, path: &str, jws: &Value) -> std::result::Result<Signed, Res> {
        let (protected_b64, payload_b64, sig_b64) = match (
            jws["protected"].as_str(),
            jws["payload"].as_str(),
            jws["signature"].as_str(),
        ) {
            (Some(p), Some(l), Some(s)) => (p, l, s),
            _ => return Err(problem(400, "malformed", "not a flattened JWS")),
        };
        let protected = decode_json(protected_b64)
            .ok_or_else(|| problem(400, "malformed", "bad protected header"))?;

        let nonce = protected["nonce"].as_str().unwrap_or("");
        if !self.nonces.remove(nonce) {
            self.duplicate_nonces += 1;
            return Err(problem(400, "badNonce", "unknown or reused nonce"));
        }
        if protected["url"] != Value::String(self.path(path)) {
            return Err(problem(400, "malformed", "url mismatch"));
        }

        let (jwk, account) = if let Some(kid) = protected["kid"].as_str() {
            let id = self
                .account_id(kid)
                .ok_or_else(|| problem(400, "accountDoesNotExist", "unknown kid"))?;
            let acc = &self.accounts[id - 1];
            if acc.status != "valid" {
                return Err(problem(401, "unauthorized", "account is not valid"));
            }
            (acc.jwk.clone(), Some(id))
        } else if protected["jwk"].is_object() {
            if path != "/acme/new-acct" && path != "/acme/revoke-cert" {
                return Err(problem(400, "malformed", "jwk only allowed for new account"));
            }
            (protected["jwk"].clone(), None)
        } else {
            return Err(problem(400, "malformed", "no jwk or kid"));
        };

        let alg = protected["alg"].as_str().unwrap_or("");
        let sig = base64url_decode(sig_b64).unwrap_or_default();
        let input = format!("{}.{}", protected_b64, payload_b64);
        if !verify_signature(alg, &jwk, input.as_bytes(), &sig) {
            return Err(problem(400, "malformed", "JWS signature does not verify"));
        }

        let payload = if payload_b64.is_empty() {
            None
        } else {
            Some(decode_json(payload_b64).ok_or_else(|| problem(400, "malformed", "bad payload"))?)
        };
        Ok(Signed {
            payload,
            account,
            jwk,
        })
    }

    fn account_id(&self, url: &str) -> Option<usize> {
        let id: usize = url
            .strip_prefix(&self.path("/acme/acct/"))?
            .parse()
            .ok()?;
        if id >= 1 && id <= self.accounts.len() {
            Some(id)
        } else {
            None
        }
    }

    fn account_res(&self, id: usize, status: u16) -> Res {
        let acc = &self.accounts[id - 1];
        let body = json!({
            "status": acc.status,
            "contact": acc.contact,
            "termsOfServiceAgreed": acc.tos,
            "orders": self.path(&format!("/acme/acct/{}/orders", id)),
        });
        json_res(status, &body, Some(self.path(&format!("/acme/acct/{}", id))))
    }

    fn new_account(&mut self, signed: Signed) -> Res {
        if signed.account.is_some() {
            return problem(400, "malformed", "newAccount must be signed with jwk");
        }
        if let Some(i) = self.accounts.iter().position(|a| a.jwk == signed.jwk) {
            return self.account_res(i + 1, 200);
        }
        let payload = signed.payload.unwrap_or_else(|| json!({}));
        if payload["onlyReturnExisting"] == true {
            return problem(400, "accountDoesNotExist", "no account for this key");
        }
        if self.external_account_required {
            if !self.verify_eab(&payload["externalAccountBinding"], &signed.jwk) {
                return problem(400, "externalAccountRequired", "bad or missing binding");
            }
            self.eab_verified += 1;
        }
        let contact: Vec<String> = payload["contact"]
            .as_array()
            .map(|c| c.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        self.accounts.push(AccountRec {
            jwk: signed.jwk,
            contact,
            status: "valid",
            tos: payload["termsOfServiceAgreed"] == true,
        });
        self.account_res(self.accounts.len(), 201)
    }

    fn verify_eab(&self, eab: &Value, jwk: &Value) -> bool {
        let (protected_b64, payload_b64, sig_b64) = match (
            eab["protected"].as_str(),
            eab["payload"].as_str(),
            eab["signature"].as_str(),
        ) {
            (Some(p), Some(l), Some(s)) => (p, l, s),
            _ => return false,
        };
        let protected = match decode_json(protected_b64) {
            Some(p) => p,
            None => return false,
        };
        if protected["alg"] != "HS256"
            || protected["kid"] != EAB_KID
            || protected["url"] != Value::String(self.path("/acme/new-acct"))
            || protected.get("nonce").is_some()
        {
            return false;
        }
        if decode_json(payload_b64).as_ref() != Some(jwk) {
            return false;
        }
        let key = PKey::hmac(&base64url_decode(EAB_HMAC_KEY).unwrap()).unwrap();
        let mut signer = Signer::new(MessageDigest::sha256(), &key).unwrap();
        signer
            .update(format!("{}.{}", protected_b64, payload_b64).as_bytes())
            .unwrap();
        base64url_decode(sig_b64).ok() == signer.sign_to_vec().ok()
    }

    fn account(&mut self, id: usize, signed: Signed) -> Res {
        if signed.account != Some(id) {
            return problem(403, "unauthorized", "not your account");
        }
        if let Some(payload) = signed.payload {
            let acc = &mut self.accounts[id - 1];
            if let Some(contact) = payload["contact"].as_array() {
                acc.contact = contact
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect();
            }
            if payload["status"] == "deactivated" {
                acc.status = "deactivated";
            }
        }
        self.account_res(id, 200)
    }

    fn key_change(&mut self, signed: Signed) -> Res {
        let id = match signed.account {
            Some(id) => id,
            None => return problem(400, "malformed", "keyChange must be signed with kid"),
        };
        let inner = match signed.payload {
            Some(p) => p,
            None => return problem(400, "malformed", "no inner JWS"),
        };
        let (protected_b64, payload_b64, sig_b64) = match (
            inner["protected"].as_str(),
            inner["payload"].as_str(),
            inner["signature"].as_str(),
        ) {
            (Some(p), Some(l), Some(s)) => (p, l, s),
            _ => return problem(400, "malformed", "inner is not a flattened JWS"),
        };
        let protected = match decode_json(protected_b64) {
            Some(p) => p,
            None => return problem(400, "malformed", "bad inner header"),
        };
        if protected.get("nonce").is_some()
            || protected["url"] != Value::String(self.path("/acme/key-change"))
        {
            return problem(400, "malformed", "bad inner header");
        }
        let new_jwk = protected["jwk"].clone();
        let input = format!("{}.{}", protected_b64, payload_b64);
        let sig = base64url_decode(sig_b64).unwrap_or_default();
        let alg = protected["alg"].as_str().unwrap_or("");
        if !verify_signature(alg, &new_jwk, input.as_bytes(), &sig) {
            return problem(400, "malformed", "inner signature does not verify");
        }
        let payload = decode_json(payload_b64).unwrap_or(Value::Null);
        if payload["account"] != Value::String(self.path(&format!("/acme/acct/{}", id)))
            || payload["oldKey"] != self.accounts[id - 1].jwk
        {
            return problem(400, "malformed", "inner payload mismatch");
        }
        if self.accounts.iter().any(|a| a.jwk == new_jwk) {
            return problem(409, "malformed", "key in use");
        }
        self.accounts[id - 1].jwk = new_jwk;
        self.key_changes += 1;
        self.account_res(id, 200)
    }

    fn new_order(&mut self, signed: Signed) -> Res {
        let account = match signed.account {
            Some(a) => a,
            None => return problem(400, "malformed", "kid required"),
        };
        let identifiers = signed
            .payload
            .as_ref()
            .and_then(|p| p["identifiers"].as_array().cloned())
            .unwrap_or_default();
        if identifiers.is_empty() {
            return problem(400, "malformed", "no identifiers");
        }
        let mut authzs = vec![];
        for ident in &identifiers {
            let value = ident["value"].as_str().unwrap_or("");
            let (value, wildcard) = match value.strip_prefix("*.") {
                Some(base) => (base, true),
                None => (value, false),
            };
            self.authzs.push(AuthzRec {
                identifier: json!({ "type": ident["type"], "value": value }),
                wildcard,
                status: "pending",
                accepted: None,
                polls_left: 1,
            });
            authzs.push(self.authzs.len());
        }
        self.orders.push(OrderRec {
            account,
            identifiers,
            authzs,
            status: "pending",
            polls_left: 1,
        });
        let id = self.orders.len();
        let body = self.order_json(id, None);
        json_res(201, &body, Some(self.path(&format!("/acme/order/{}", id))))
    }

    fn order_json(&self, id: usize, status_override: Option<&str>) -> Value {
        let o = &self.orders[id - 1];
        let authorizations: Vec<String> = o
            .authzs
            .iter()
            .map(|a| self.path(&format!("/acme/authz/{}", a)))
            .collect();
        let finalize = self.path(&format!("/acme/finalize/{}", id));
        let mut body = json!({
            "status": status_override.unwrap_or(o.status),
            "expires": "2019-01-09T08:26:43.570360537Z",
            "identifiers": o.identifiers,
            "authorizations": authorizations,
            "finalize": finalize,
        });
        if o.status == "valid" {
            body["certificate"] = json!(self.path(&format!("/acme/cert/{}", id)));
        }
        if o.status == "invalid" {
            body["error"] = json!({
                "type": "urn:ietf:params:acme:error:unauthorized",
                "detail": "an authorization failed",
                "status": 403,
            });
        }
        body
    }

    /// Move the order along, returns the Retry-After to send.
    fn settle_order(&mut self, id: usize) -> Option<&'static str> {
        let statuses: Vec<&str> = self.orders[id - 1]
            .authzs
            .iter()
            .map(|a| self.authzs[a - 1].status)
            .collect();
        let hold = self.hold_orders;
        let o = &mut self.orders[id - 1];
        let current = o.status;
        match current {
            "pending" if statuses.iter().any(|s| *s == "invalid") => o.status = "invalid",
            "pending" if statuses.iter().all(|s| *s == "valid") => o.status = "ready",
            "processing" if hold => {}
            "processing" if o.polls_left > 0 => {
                o.polls_left -= 1;
                return Some("0");
            }
            "processing" => o.status = "valid",
            _ => {}
        }
        None
    }

    fn own_order(&self, id: usize, signed: &Signed) -> Option<Res> {
        if id == 0 || id > self.orders.len() {
            return Some(problem(404, "malformed", "no such order"));
        }
        if signed.account != Some(self.orders[id - 1].account) {
            return Some(problem(403, "unauthorized", "not your order"));
        }
        None
    }

    fn order(&mut self, id: usize, signed: Signed) -> Res {
        if let Some(res) = self.own_order(id, &signed) {
            return res;
        }
        let retry_after = self.settle_order(id);
        let regress = self.regress_orders && self.orders[id - 1].status == "ready";
        let body = self.order_json(id, if regress { Some("pending") } else { None });
        let mut res = json_res(200, &body, None);
        if let Some(r) = retry_after {
            res.headers_mut()
                .insert("retry-after", HeaderValue::from_static(r));
        }
        res
    }

    fn finalize(&mut self, id: usize, signed: Signed) -> Res {
        if let Some(res) = self.own_order(id, &signed) {
            return res;
        }
        self.settle_order(id);
        if self.orders[id - 1].status != "ready" {
            return problem(403, "orderNotReady", "order is not ready");
        }
        let csr = signed
            .payload
            .as_ref()
            .and_then(|p| p["csr"].as_str())
            .and_then(|c| base64url_decode(c).ok())
            .unwrap_or_default();
        if X509Req::from_der(&csr).is_err() {
            return problem(400, "badCSR", "CSR does not parse");
        }
        self.orders[id - 1].status = "processing";
        let body = self.order_json(id, None);
        json_res(200, &body, Some(self.path(&format!("/acme/order/{}", id))))
    }

    fn certificate(&mut self, id: usize, alt: bool, signed: Signed) -> Res {
        if let Some(res) = self.own_order(id, &signed) {
            return res;
        }
        if self.orders[id - 1].status != "valid" {
            return problem(403, "unauthorized", "no certificate yet");
        }
        let intermediate = if alt { "alternate intermediate" } else { "intermediate" };
        let body = format!("{}{}", pem(&format!("leaf certificate {}", id)), pem(intermediate));
        let mut b = Response::builder();
        b.status(200)
            .header("content-type", "application/pem-certificate-chain");
        if !alt {
            let link = format!("<{}>;rel=\"alternate\"", self.path(&format!("/acme/cert/{}/alt", id)));
            b.header("link", link);
        }
        b.body(Body::from(body)).unwrap()
    }

    fn challenge_json(&self, authz_id: usize, t: &str) -> Value {
        let a = &self.authzs[authz_id - 1];
        let accepted = a.accepted.as_deref() == Some(t);
        let status = match (accepted, a.status) {
            (true, "valid") => "valid",
            (true, "invalid") => "invalid",
            (true, _) => "processing",
            _ => "pending",
        };
        let url = self.path(&format!("/acme/chall/{}/{}", authz_id, t));
        let token = base64url(format!("token {} {}", authz_id, t).as_bytes());
        let mut body = json!({
            "type": t,
            "status": status,
            "url": url,
            "token": token,
        });
        if status == "invalid" {
            body["error"] = json!({
                "type": "urn:ietf:params:acme:error:dns",
                "detail": "DNS problem: NXDOMAIN looking up TXT",
                "status": 400,
            });
        }
        body
    }

    fn authz(&mut self, id: usize, signed: Signed) -> Res {
        if id == 0 || id > self.authzs.len() {
            return problem(404, "malformed", "no such authorization");
        }
        let (fail, hold) = (self.fail_challenges, self.hold_authorizations);
        let mut retry_after = None;
        {
            let a = &mut self.authzs[id - 1];
            match signed.payload {
                Some(p) if p["status"] == "deactivated" => a.status = "deactivated",
                Some(_) => return problem(400, "malformed", "unexpected payload"),
                None if a.status == "pending" && a.accepted.is_some() => {
                    if hold || a.polls_left > 0 {
                        a.polls_left = a.polls_left.saturating_sub(1);
                        retry_after = Some("0");
                    } else if fail {
                        a.status = "invalid";
                    } else {
                        a.status = "valid";
                    }
                }
                None => {}
            }
        }
        let a = &self.authzs[id - 1];
        let challenges: Vec<Value> = CHALLENGE_TYPES
            .iter()
            .map(|t| self.challenge_json(id, t))
            .collect();
        let mut body = json!({
            "identifier": a.identifier,
            "status": a.status,
            "expires": "2019-01-09T08:26:43Z",
            "challenges": challenges,
        });
        if a.wildcard {
            body["wildcard"] = json!(true);
        }
        let mut res = json_res(200, &body, None);
        if let Some(r) = retry_after {
            res.headers_mut()
                .insert("retry-after", HeaderValue::from_static(r));
        }
        res
    }

    fn challenge(&mut self, authz_id: usize, t: &str, signed: Signed) -> Res {
        if authz_id == 0 || authz_id > self.authzs.len() || !CHALLENGE_TYPES.contains(&t) {
            return problem(404, "malformed", "no such challenge");
        }
        if signed.payload != Some(json!({})) {
            return problem(400, "malformed", "challenge wants an empty object");
        }
        let a = &mut self.authzs[authz_id - 1];
        if a.status == "pending" && a.accepted.is_none() {
            a.accepted = Some(t.to_string());
            self.challenges_accepted += 1;
        }
        let body = self.challenge_json(authz_id, t);
        let mut res = json_res(200, &body, None);
        let up = format!("<{}>;rel=\"up\"", self.path(&format!("/acme/authz/{}", authz_id)));
        res.headers_mut()
            .insert("link", HeaderValue::from_str(&up).unwrap());
        res
    }

    fn revoke(&mut self, signed: Signed) -> Res {
        let payload = signed.payload.unwrap_or(Value::Null);
        let certificate = match payload["certificate"].as_str() {
            Some(c) => c.to_string(),
            None => return problem(400, "malformed", "no certificate"),
        };
        if let Some(reason) = payload["reason"].as_u64() {
            if reason == 7 || reason > 10 {
                return problem(400, "badRevocationReason", "bad reason");
            }
        }
        if !self.revoked.insert(certificate) {
            return problem(400, "alreadyRevoked", "certificate already revoked");
        }
        if signed.account.is_some() {
            self.revoked_by_kid += 1;
        } else {
            self.revoked_by_jwk += 1;
        }
        Response::builder().status(200).body(Body::empty()).unwrap()
    }
}

fn route_request(
    state: &Mutex<ServerState>,
    method: &Method,
    path: &str,
    content_type: Option<&str>,
    body: &[u8],
) -> Res {
    let mut st = state.lock().unwrap();
    let mut res = match (method, path) {
        (&Method::GET, "/directory") => {
            st.directory_fetches += 1;
            st.directory()
        }
        (&Method::GET, "/bad-directory") => json_res(200, &json!({ "hello": "world" }), None),
        (&Method::HEAD, "/acme/new-nonce") | (&Method::GET, "/acme/new-nonce") => {
            st.nonce_fetches += 1;
            Response::builder()
                .status(200)
                .header("cache-control", "no-store")
                .body(Body::empty())
                .unwrap()
        }
        (&Method::POST, _) => st.post(path, content_type, body),
        (_, _) => {
            return Response::builder()
                .status(404)
                .body(Body::from("not found"))
                .unwrap()
        }
    };
    let nonce = st.new_nonce();
    res.headers_mut()
        .insert("replay-nonce", HeaderValue::from_str(&nonce).unwrap());
    res
}

pub struct TestServer {
    pub url: String,
    pub dir_url: String,
    state: Arc<Mutex<ServerState>>,
    shutdown: Option<futures::sync::oneshot::Sender<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            tx.send(()).ok();
        }
    }
}

impl TestServer {
    pub fn path(&self, p: &str) -> String {
        format!("{}{}", self.url, p)
    }

    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    /// Answer the next `times` requests to `path` with `badNonce`.
    pub fn inject_bad_nonce(&self, path: &str, times: usize) {
        self.state().bad_nonce.insert(path.into(), times);
    }

    /// Answer the next `times` requests to `path` with `rateLimited`.
    pub fn inject_rate_limited(&self, path: &str, times: usize) {
        self.state().rate_limited.insert(path.into(), times);
    }

    pub fn require_external_account(&self) {
        self.state().external_account_required = true;
    }

    /// Accepted challenges end up invalid.
    pub fn fail_challenges(&self) {
        self.state().fail_challenges = true;
    }

    /// Accepted authorizations stay pending.
    pub fn hold_authorizations(&self) {
        self.state().hold_authorizations = true;
    }

    /// Finalized orders stay processing, without Retry-After.
    pub fn hold_orders(&self) {
        self.state().hold_orders = true;
    }

    /// Ready orders are reported as pending.
    pub fn regress_orders(&self) {
        self.state().regress_orders = true;
    }
}

pub fn with_directory_server() -> TestServer {
    let _ = env_logger::try_init();

    let tcp = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = tcp.local_addr().unwrap().port();

    let url = format!("http://127.0.0.1:{}", port);
    let dir_url = format!("{}/directory", url);

    let state = Arc::new(Mutex::new(ServerState {
        url: url.clone(),
        ..Default::default()
    }));

    let state2 = state.clone();
    let make_service = move || {
        let state = state2.clone();
        service_fn(move |req: Request<Body>| {
            let state = state.clone();
            let (parts, body) = req.into_parts();
            body.concat2().map(move |chunk| {
                let content_type = parts
                    .headers
                    .get("content-type")
                    .and_then(|v| v.to_str().ok());
                route_request(&state, &parts.method, parts.uri.path(), content_type, &chunk[..])
            })
        })
    };
    let server = Server::from_tcp(tcp).unwrap().serve(make_service);

    let (tx, rx) = futures::sync::oneshot::channel::<()>();

    let graceful = server
        .with_graceful_shutdown(rx)
        .map_err(|err| eprintln!("server error: {}", err));

    thread::spawn(move || {
        hyper::rt::run(graceful);
    });

    TestServer {
        url,
        dir_url,
        state,
        shutdown: Some(tx),
    }
}

#[test]
pub fn test_make_directory() {
    let server = with_directory_server();
    let res = ::ureq::get(&server.dir_url).call().unwrap();
    assert_eq!(res.status(), 200);
    assert!(res.header("replay-nonce").is_some());
}

#[test]
fn test_end_to_end() -> Result<()> {
    let server = with_directory_server();
    let dir = Directory::from_url(UReq::new(), DirectoryUrl::Other(&server.dir_url))?;
    let key = AccountKey::from_pkey(create_p256_key())?;
    let acc = dir.create_account(key, &["mailto:a@example.com"], true, None)?;
    assert_eq!(acc.status(), AccountStatus::Valid);
    assert_eq!(acc.contacts(), &["mailto:a@example.com".to_string()]);

    let mut ord = acc.new_order(&[Identifier::dns("example.com")])?;
    assert_eq!(ord.status(), OrderStatus::Pending);
    assert_eq!(ord.authorization_urls().len(), 1);

    let policy = PollPolicy::default();
    let resolver = RecordingResolver::default();
    let status = ord.authorize_all(&resolver, &ChallengeType::Http01, &policy)?;
    assert_eq!(status, OrderStatus::Ready);
    assert_eq!(resolver.cleaned().len(), 1);

    ord.finalize(&create_csr(&["example.com"]))?;
    assert_eq!(ord.status(), OrderStatus::Processing);
    assert_eq!(ord.poll_until_settled(&policy)?, OrderStatus::Valid);

    let chain = ord.download_certificate()?;
    assert!(!chain.bytes().is_empty());
    let blocks = chain.pem_certificates()?;
    assert_eq!(blocks[0], chain.leaf_pem()?);
    assert_eq!(blocks[0], pem("leaf certificate 1").trim_end());

    // same leaf on the alternate chain
    let alt = acc.certificate(&chain.alternates()[0])?;
    assert_eq!(alt.leaf_pem()?, chain.leaf_pem()?);
    assert_ne!(alt.bytes(), chain.bytes());

    let leaf_der = STANDARD.encode("leaf certificate 1").into_bytes();
    acc.revoke_certificate(&leaf_der, Some(RevocationReason::Superseded))?;
    let res = acc.revoke_certificate(&leaf_der, None);
    assert!(res.unwrap_err().is_problem(ProblemType::AlreadyRevoked));

    assert_eq!(server.state().duplicate_nonces, 0);
    Ok(())
}

#[test]
fn test_concurrent_authorizations_never_share_a_nonce() -> Result<()> {
    let server = with_directory_server();
    let acc = account(&server)?;
    let ids: Vec<_> = (0..6)
        .map(|i| Identifier::dns(format!("host{}.example.com", i)))
        .collect();
    let mut ord = acc.new_order(&ids)?;
    let resolver = Arc::new(RecordingResolver::default());
    let policy = PollPolicy::new(10, Duration::from_millis(1), Duration::from_millis(10));

    let handles: Vec<_> = ord
        .authorizations()?
        .into_iter()
        .map(|mut auth| {
            let resolver = resolver.clone();
            let policy = policy.clone();
            thread::spawn(move || auth.authorize(&*resolver, &ChallengeType::Dns01, &policy))
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap()?, AuthorizationStatus::Valid);
    }

    assert_eq!(server.state().duplicate_nonces, 0);
    assert_eq!(resolver.cleaned().len(), 6);
    ord.refresh()?;
    assert_eq!(ord.status(), OrderStatus::Ready);
    Ok(())
}

#[test]
fn test_rate_limited_surfaces_retry_after() -> Result<()> {
    let server = with_directory_server();
    let acc = account(&server)?;
    server.inject_rate_limited("/acme/new-order", 1);
    let err = acc
        .new_order(&[Identifier::dns("example.com")])
        .unwrap_err();
    assert!(err.is_problem(ProblemType::RateLimited));
    assert_eq!(err.problem().unwrap().retry_after, Some(Duration::from_secs(5)));
    assert_eq!(err.problem().unwrap().status, Some(429));
    // not retried
    assert_eq!(server.state().requests_to("/acme/new-order"), 1);
    acc.new_order(&[Identifier::dns("example.com")])?;
    Ok(())
}

#[test]
fn test_other_key_types() -> Result<()> {
    let server = with_directory_server();
    let dir = Directory::from_url(UReq::new(), DirectoryUrl::Other(&server.dir_url))?;
    for pkey in vec![create_p384_key(), create_rsa_key()] {
        let acc = dir.create_account(AccountKey::from_pkey(pkey)?, &[], true, None)?;
        let ord = acc.new_order(&[Identifier::dns("example.com")])?;
        assert_eq!(ord.status(), OrderStatus::Pending);
    }
    Ok(())
}

#[test]
fn test_revoke_with_certificate_key() -> Result<()> {
    let server = with_directory_server();
    let dir = Directory::from_url(UReq::new(), DirectoryUrl::Other(&server.dir_url))?;
    let cert_key = AccountKey::from_pkey(create_p384_key())?;
    dir.revoke_certificate_with_key(b"some cert", cert_key.clone(), Some(RevocationReason::KeyCompromise))?;
    assert_eq!(server.state().revoked_by_jwk, 1);
    let res = dir.revoke_certificate_with_key(b"some cert", cert_key, None);
    assert!(res.unwrap_err().is_problem(ProblemType::AlreadyRevoked));
    Ok(())
}
