use std::net::IpAddr;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use siphon_core::error::AppError;
use siphon_core::job::JobSpec;
use siphon_core::models::{SourceCursor, SourcePage, SourceRecord};
use siphon_core::traits::ExtractionClient;
use url::Url;

const DEFAULT_PAGE_SIZE: u32 = 100;

/// Client for cursor-paginated JSON APIs.
///
/// Each page is fetched with `GET {url}?offset=..&limit=..[&cursor=..]` and
/// must answer `{"records": [...], "next_cursor": "..." | null}`.
///
/// By default, SSRF protection is **enabled**: requests to private/reserved
/// IP ranges are blocked. Use [`allow_private_urls`](Self::allow_private_urls)
/// to disable this (e.g., for CLI usage where the user controls the machine).
#[derive(Clone)]
pub struct HttpPageClient {
    client: Client,
    timeout_secs: u64,
    ssrf_protection: bool,
}

/// `params` of a spec whose source is `http`.
#[derive(Debug, Clone, Deserialize)]
struct HttpParams {
    url: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    page_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct PageBody {
    #[serde(default)]
    records: Vec<serde_json::Value>,
    #[serde(default)]
    next_cursor: Option<String>,
}

impl HttpPageClient {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let timeout_secs = timeout.as_secs();
        let client = Client::builder()
            .user_agent(concat!("Siphon/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            timeout_secs,
            ssrf_protection: true,
        })
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }
}

impl ExtractionClient for HttpPageClient {
    async fn fetch_page(
        &self,
        spec: &JobSpec,
        cursor: &SourceCursor,
    ) -> Result<SourcePage, AppError> {
        let params: HttpParams = serde_json::from_value(spec.params.clone())
            .map_err(|e| AppError::fatal(format!("Invalid http source params: {e}")))?;
        let url = page_url(&params, cursor)?;

        if self.ssrf_protection {
            validate_url(&url).await?;
        }

        let mut request = self.client.get(url.as_str());
        if let Some(token) = &params.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout_secs)
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {e}"))
            } else {
                AppError::HttpError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &body));
        }

        let body: PageBody = response.json().await.map_err(|e| AppError::SourceError {
            message: format!("Malformed page body: {e}"),
            status_code: Some(status.as_u16()),
            retryable: false,
        })?;

        Ok(into_page(body, cursor.offset))
    }
}

fn page_url(params: &HttpParams, cursor: &SourceCursor) -> Result<Url, AppError> {
    let mut url = Url::parse(&params.url)
        .map_err(|e| AppError::fatal(format!("Invalid source URL '{}': {e}", params.url)))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("offset", &cursor.offset.to_string());
        query.append_pair(
            "limit",
            &params.page_size.unwrap_or(DEFAULT_PAGE_SIZE).to_string(),
        );
        if let Some(token) = &cursor.token {
            query.append_pair("cursor", token);
        }
    }
    Ok(url)
}

/// 429 and 5xx are worth retrying; any other failure status is final.
fn status_error(status_code: u16, body: &str) -> AppError {
    if status_code == 429 {
        return AppError::RateLimitExceeded;
    }
    let message = if body.trim().is_empty() {
        format!("HTTP {status_code}")
    } else {
        format!("HTTP {status_code}: {}", body.trim())
    };
    AppError::SourceError {
        message,
        status_code: Some(status_code),
        retryable: status_code >= 500,
    }
}

fn into_page(body: PageBody, offset: u64) -> SourcePage {
    let records: Vec<SourceRecord> = body
        .records
        .into_iter()
        .enumerate()
        .map(|(i, data)| {
            let external_id = record_id(&data).unwrap_or_else(|| (offset + i as u64).to_string());
            SourceRecord::new(external_id, data)
        })
        .collect();

    match body.next_cursor {
        // An empty page that still points further would never advance.
        Some(_) if records.is_empty() => {
            tracing::warn!(%offset, "Source returned an empty page with a cursor, stopping");
            SourcePage::last(records)
        }
        Some(token) => SourcePage::more(records, Some(token)),
        None => SourcePage::last(records),
    }
}

fn record_id(data: &serde_json::Value) -> Option<String> {
    match data.get("id")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Reject non-http(s) schemes and hosts that resolve to private/reserved IPs.
async fn validate_url(url: &Url) -> Result<(), AppError> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::HttpError(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| AppError::HttpError("URL has no host".to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(AppError::HttpError(format!(
                "SSRF blocked: {host} resolves to private/reserved IP"
            )));
        }
        return Ok(());
    }

    let port = url.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AppError::NetworkError(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::NetworkError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    if let Some(blocked) = addrs.iter().find(|a| is_private_ip(a.ip())) {
        return Err(AppError::HttpError(format!(
            "SSRF blocked: {host} resolves to private/reserved IP {}",
            blocked.ip()
        )));
    }

    Ok(())
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // includes cloud metadata
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xFFC0) == 0xFE80 // fe80::/10
                || (v6.segments()[0] & 0xFE00) == 0xFC00 // fc00::/7
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}
