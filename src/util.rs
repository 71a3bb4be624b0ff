use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::req::HttpResponse;
use crate::{Error, Result};

pub(crate) fn base64url<T: ?Sized + AsRef<[u8]>>(input: &T) -> String {
    URL_SAFE_NO_PAD.encode(input)
}

pub(crate) fn base64url_decode(input: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(input.trim_end_matches('='))
        .map_err(|e| Error::Validation(format!("bad base64url: {}", e)))
}

pub(crate) fn read_json<T: DeserializeOwned>(res: impl HttpResponse) -> Result<T> {
    let res_body = res.body()?;
    debug!("{}", String::from_utf8_lossy(&res_body));
    serde_json::from_slice(&res_body)
        .map_err(|e| Error::Protocol(format!("Unexpected response body: {}", e)))
}

pub(crate) fn expect_header(res: &impl HttpResponse, name: &str) -> Result<String> {
    res.header(name)
        .map(|h| h.to_string())
        .ok_or_else(|| Error::Protocol(format!("Missing header: {}", name)))
}

/// `Retry-After` of a response, if present and parseable.
pub(crate) fn retry_after(res: &impl HttpResponse) -> Option<Duration> {
    res.header("retry-after")
        .and_then(|v| parse_retry_after(v, time::get_time()))
}

/// Parse a `Retry-After` value, either delta-seconds or an HTTP-date.
///
/// Dates in the past give a zero duration.
pub(crate) fn parse_retry_after(value: &str, now: time::Timespec) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    // IMF-fixdate: Sun, 06 Nov 1994 08:49:37 GMT
    let tm = time::strptime(value, "%a, %d %b %Y %H:%M:%S GMT").ok()?;
    let millis = (tm.to_timespec() - now).num_milliseconds();
    Some(Duration::from_millis(millis.max(0) as u64))
}

/// URLs of `Link` headers with the given `rel`.
///
/// `Link: <https://example.com/acme/authz/1234>;rel="up"`
pub(crate) fn links(res: &impl HttpResponse, rel: &str) -> Vec<String> {
    res.headers_all("link")
        .into_iter()
        .flat_map(|h| h.split(','))
        .filter_map(|link| {
            let mut parts = link.split(';');
            let url = parts.next()?.trim();
            let url = url.strip_prefix('<')?.strip_suffix('>')?;
            let matches = parts.any(|p| {
                let p = p.trim();
                p.strip_prefix("rel=")
                    .map(|r| r.trim_matches('"') == rel)
                    .unwrap_or(false)
            });
            if matches {
                Some(url.to_string())
            } else {
                None
            }
        })
        .collect()
}
