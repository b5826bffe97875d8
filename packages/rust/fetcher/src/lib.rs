//! Link content fetcher.
//!
//! Fetches a batch of URLs sequentially and returns the raw bodies as
//! [`ByteStream`]s. A URL that fails (network error, non-2xx status, blocked
//! host) is reported as a [`FetchFailure`] and the rest of the batch carries on,
//! unless the fetcher is configured to fail fast.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use reqwest::redirect::Policy;
use tracing::{debug, info, instrument, warn};
use url::Url;

use webrag_shared::{ByteStream, FetchConfig, FetchFailure, RagError, Result, content_hash};

// ---------------------------------------------------------------------------
// FetchBatch
// ---------------------------------------------------------------------------

/// Outcome of fetching a list of URLs.
#[derive(Debug, Clone, Default)]
pub struct FetchBatch {
    /// One stream per successfully fetched URL, in request order.
    pub streams: Vec<ByteStream>,
    /// URLs that could not be fetched, in request order.
    pub failures: Vec<FetchFailure>,
}

// ---------------------------------------------------------------------------
// LinkContentFetcher
// ---------------------------------------------------------------------------

/// HTTP fetcher for a list of links.
pub struct LinkContentFetcher {
    config: FetchConfig,
    client: Client,
}

impl LinkContentFetcher {
    /// Create a new fetcher with the given configuration.
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(redirect_policy(config.max_redirects, config.allow_private_hosts))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    /// Fetch every URL in `urls`, one after another.
    ///
    /// Duplicate URLs (ignoring fragments) are fetched once. With
    /// `fail_fast` set, the first failure aborts the batch with
    /// [`RagError::Fetch`]; otherwise failures are collected in the result.
    #[instrument(skip_all, fields(urls = urls.len()))]
    pub async fn fetch(&self, urls: &[Url]) -> Result<FetchBatch> {
        let mut seen = HashSet::new();
        let mut batch = FetchBatch::default();

        for url in urls {
            if !seen.insert(normalize_url(url)) {
                debug!(%url, "duplicate URL in batch, skipping");
                continue;
            }

            match self.fetch_one(url).await {
                Ok(stream) => batch.streams.push(stream),
                Err(failure) => {
                    if self.config.fail_fast {
                        return Err(failure.into());
                    }
                    warn!(url = %failure.url, error = %failure.message, "fetch failed, skipping URL");
                    batch.failures.push(failure);
                }
            }
        }

        info!(
            fetched = batch.streams.len(),
            failed = batch.failures.len(),
            "fetch batch completed"
        );

        Ok(batch)
    }

    /// Fetch a single URL.
    async fn fetch_one(&self, url: &Url) -> std::result::Result<ByteStream, FetchFailure> {
        let fail = |message: String| FetchFailure {
            url: url.to_string(),
            message,
        };

        if !self.config.allow_private_hosts && is_ssrf_target(url) {
            return Err(fail("blocked: non-HTTP scheme or private/loopback host".into()));
        }

        debug!(%url, "fetching");

        let response = self.client.get(url.as_str()).send().await.map_err(|e| {
            if e.is_timeout() {
                fail(format!("timed out after {}s", self.config.timeout_secs))
            } else {
                fail(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(fail(format!("HTTP {status}")));
        }

        let final_url = response.url().to_string();
        let content_type_header = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        let content_type = content_type_header.map(media_type);
        let charset = content_type_header.and_then(charset_param);

        let data = response
            .bytes()
            .await
            .map_err(|e| fail(format!("body read failed: {e}")))?
            .to_vec();

        Ok(ByteStream {
            url: final_url,
            status: status.as_u16(),
            content_type,
            charset,
            content_hash: content_hash(&data),
            data,
            fetched_at: Utc::now(),
        })
    }
}

/// Strip parameters from a `Content-Type` value (`text/html; charset=utf-8` → `text/html`).
fn media_type(header: &str) -> String {
    header
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// `charset` parameter of a `Content-Type` value, unquoted.
fn charset_param(header: &str) -> Option<String> {
    header.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_string())
            .filter(|v| !v.is_empty())
    })
}

/// Normalize a URL for deduplication (strip fragment, trailing slash).
fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let mut s = normalized.to_string();
    // Remove trailing slash for consistency (except root path)
    if s.ends_with('/') && s.matches('/').count() > 3 {
        s.pop();
    }
    s
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Follow at most `max` redirects, re-checking every hop against the SSRF guard.
fn redirect_policy(max: usize, allow_private_hosts: bool) -> Policy {
    Policy::custom(move |attempt| {
        if attempt.previous().len() > max {
            attempt.error(format!("too many redirects (max {max})"))
        } else if !allow_private_hosts && is_ssrf_target(attempt.url()) {
            let message = format!("blocked redirect to {}", attempt.url());
            attempt.error(message)
        } else {
            attempt.follow()
        }
    })
}

/// Check if a URL targets a potentially dangerous resource.
fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_private_ip(&IpAddr::V4(v4)),
            None => {
                let first = v6.segments()[0];
                v6.is_loopback()
                    || v6.is_unspecified()
                    || v6.is_multicast()
                    // fc00::/7 (unique local)
                    || (first & 0xfe00) == 0xfc00
                    // fe80::/10 (link-local)
                    || (first & 0xffc0) == 0xfe80
            }
        },
    }
}
