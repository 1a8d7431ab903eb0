use std::time::Duration;

use serde::Deserialize;
use siphon_core::error::AppError;
use siphon_core::job::JobSpec;
use siphon_core::models::{SourceCursor, SourcePage, SourceRecord};
use siphon_core::traits::ExtractionClient;

/// Deterministic stand-in for a third-party user directory.
///
/// Serves `records` users named `user_1..=user_{records}` in pages of
/// `page_size`, after validating the API token. Useful for demos and for
/// exercising the engine end to end without network access.
#[derive(Debug, Clone, Default)]
pub struct FixtureClient;

#[derive(Debug, Clone, Deserialize)]
struct FixtureParams {
    #[serde(default)]
    token: String,
    #[serde(default = "default_records")]
    records: u64,
    #[serde(default = "default_page_size")]
    page_size: u64,
    #[serde(default)]
    latency_ms: u64,
}

fn default_records() -> u64 {
    20
}

fn default_page_size() -> u64 {
    10
}

impl FixtureClient {
    pub fn new() -> Self {
        Self
    }
}

/// Tokens longer than 10 characters are accepted unless they start with
/// `invalid`.
pub fn is_valid_token(token: &str) -> bool {
    token.len() > 10 && !token.starts_with("invalid")
}

fn user(n: u64) -> SourceRecord {
    SourceRecord::new(
        format!("user_{n}"),
        serde_json::json!({
            "email": format!("user{n}@example.com"),
            "first_name": format!("FirstName{n}"),
            "last_name": format!("LastName{n}"),
            "additional_data": {
                "phone": format!("+1-555-{:04}", 1000 + n),
                "company": format!("Company {n}"),
                "created_date": "2023-01-01",
            },
        }),
    )
}

impl ExtractionClient for FixtureClient {
    async fn fetch_page(
        &self,
        spec: &JobSpec,
        cursor: &SourceCursor,
    ) -> Result<SourcePage, AppError> {
        let params: FixtureParams = serde_json::from_value(spec.params.clone())
            .map_err(|e| AppError::fatal(format!("Invalid fixture source params: {e}")))?;

        if !is_valid_token(&params.token) {
            return Err(AppError::fatal("Invalid API token"));
        }

        if params.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(params.latency_ms)).await;
        }

        let start = cursor.offset.min(params.records);
        let end = start
            .saturating_add(params.page_size.max(1))
            .min(params.records);
        let records = (start..end).map(|i| user(i + 1)).collect();

        if end >= params.records {
            Ok(SourcePage::last(records))
        } else {
            Ok(SourcePage::more(records, None))
        }
    }
}
