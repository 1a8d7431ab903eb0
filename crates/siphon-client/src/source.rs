use std::fmt;
use std::str::FromStr;

use siphon_core::error::AppError;
use siphon_core::job::JobSpec;
use siphon_core::models::{SourceCursor, SourcePage};
use siphon_core::traits::ExtractionClient;

use crate::fixture::FixtureClient;
use crate::http::HttpPageClient;

/// Source kinds understood by [`SourceClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Http,
    Fixture,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Http => "http",
            SourceKind::Fixture => "fixture",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(SourceKind::Http),
            "fixture" => Ok(SourceKind::Fixture),
            other => Err(AppError::UnsupportedSource(other.to_string())),
        }
    }
}

/// Routes each spec to the client for its `source`.
#[derive(Clone)]
pub struct SourceClient {
    http: HttpPageClient,
    fixture: FixtureClient,
}

impl SourceClient {
    pub fn new(http: HttpPageClient) -> Self {
        Self {
            http,
            fixture: FixtureClient::new(),
        }
    }
}

impl ExtractionClient for SourceClient {
    async fn fetch_page(
        &self,
        spec: &JobSpec,
        cursor: &SourceCursor,
    ) -> Result<SourcePage, AppError> {
        match spec.source.parse::<SourceKind>()? {
            SourceKind::Http => self.http.fetch_page(spec, cursor).await,
            SourceKind::Fixture => self.fixture.fetch_page(spec, cursor).await,
        }
    }
}
