mod cache;
mod domain_filter;
mod extractor;
mod fetcher;
mod rate_limit;

pub use cache::ResponseCache;
pub use domain_filter::{DefaultPolicy, DomainFilter, DomainFilterConfig, FilterStatus};
pub use extractor::{ExtractedContent, ExtractionMetadata, QualityMetrics, extract};
pub use fetcher::{FetchResponse, FetcherStats, HttpFetcher, HttpFetcherConfig, extract_domain};
pub use rate_limit::{DomainStats, DomainStatsSnapshot, RateLimitConfig};
