pub mod fixture;
pub mod http;
pub mod source;

pub use fixture::FixtureClient;
pub use http::HttpPageClient;
pub use source::{SourceClient, SourceKind};
