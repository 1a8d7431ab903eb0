use std::future::Future;

use crate::error::AppError;
use crate::job::JobSpec;
use crate::models::{SourceCursor, SourcePage};

/// Pulls pages of records from a third-party source.
///
/// Implementations must be able to seek by `cursor.offset` alone: a resumed
/// job starts with no token and the number of records already stored.
/// Errors are classified with [`AppError::is_retryable`].
pub trait ExtractionClient: Send + Sync + Clone + 'static {
    fn fetch_page(
        &self,
        spec: &JobSpec,
        cursor: &SourceCursor,
    ) -> impl Future<Output = Result<SourcePage, AppError>> + Send;
}
