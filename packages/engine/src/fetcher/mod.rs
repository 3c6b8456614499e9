pub mod http;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CrawlError;

/// One successful HTTP response as seen by the Crawler and the Seed Loader
/// (§4.4, §4.5). Deliberately a plain struct rather than a raw
/// `reqwest::Response` so both components, and their test doubles, can share
/// one vocabulary (Design Note §9 "dynamic dispatch over integrations").
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status_code: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub cache_status: Option<String>,
    pub body: String,
    pub response_time_ms: i64,
}

impl FetchedPage {
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.to_ascii_lowercase().contains("text/html"))
            .unwrap_or(false)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Capability the Crawler and Seed Loader both depend on: "fetch a URL, get
/// a page back or a classified [`CrawlError`]" (§4.4, §4.5 implementation
/// notes — `SeedSource`/Crawler share one `PageFetcher` trait so tests can
/// substitute [`memory::InMemoryFetcher`] for either).
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedPage, CrawlError>;
}
