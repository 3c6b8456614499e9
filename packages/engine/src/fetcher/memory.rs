use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{CrawlError, CrawlErrorKind};

use super::{FetchedPage, PageFetcher};

/// A canned outcome for one registered URL. `FetchedPage` itself is not
/// `Clone`-free of concern (it's just data), but `CrawlError` carries an
/// `anyhow::Error` which isn't `Clone`, so failures are stored as a bare
/// kind and rebuilt on each call.
#[derive(Clone)]
enum Canned {
    Page(FetchedPage),
    Error(CrawlErrorKind),
}

/// In-memory [`PageFetcher`] double (§2 "Test tooling"): `#[tokio::test]`s
/// register exact responses per URL instead of reaching the network, the
/// way `intelligent-crawler`'s `MockStorage` stands in for a database in its
/// own unit tests. A URL with no registered response fails with
/// [`CrawlErrorKind::Dns`] — close enough to "unreachable" for fallback
/// paths (§4.5 step 5) to exercise naturally without extra setup.
#[derive(Default)]
pub struct InMemoryFetcher {
    responses: Mutex<HashMap<String, Canned>>,
    calls: Mutex<Vec<String>>,
}

impl InMemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: impl Into<String>, page: FetchedPage) -> Self {
        self.responses.lock().unwrap().insert(url.into(), Canned::Page(page));
        self
    }

    pub fn register_page(&self, url: impl Into<String>, page: FetchedPage) {
        self.responses.lock().unwrap().insert(url.into(), Canned::Page(page));
    }

    pub fn register_error(&self, url: impl Into<String>, kind: CrawlErrorKind) {
        self.responses.lock().unwrap().insert(url.into(), Canned::Error(kind));
    }

    /// URLs fetched so far, in call order — lets tests assert on crawl
    /// sequencing without a live server.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageFetcher for InMemoryFetcher {
    async fn fetch(&self, url: &str, _timeout: Duration) -> Result<FetchedPage, CrawlError> {
        self.calls.lock().unwrap().push(url.to_string());

        match self.responses.lock().unwrap().get(url) {
            Some(Canned::Page(page)) => Ok(page.clone()),
            Some(Canned::Error(kind)) => Err(CrawlError {
                kind: *kind,
                status: None,
                source: anyhow::anyhow!("registered failure for {url}"),
            }),
            None => Err(CrawlError {
                kind: CrawlErrorKind::Dns,
                status: None,
                source: anyhow::anyhow!("no fake response registered for {url}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unregistered_url_fails_as_dns_error() {
        let fetcher = InMemoryFetcher::new();
        let err = fetcher.fetch("https://example.com/", Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.kind, CrawlErrorKind::Dns);
    }

    #[tokio::test]
    async fn registered_page_is_returned_and_call_is_recorded() {
        let fetcher = InMemoryFetcher::new();
        fetcher.register_page(
            "https://example.com/",
            FetchedPage {
                status_code: 200,
                final_url: "https://example.com/".to_string(),
                content_type: Some("text/html".to_string()),
                cache_status: Some("HIT".to_string()),
                body: "<html></html>".to_string(),
                response_time_ms: 12,
            },
        );

        let page = fetcher.fetch("https://example.com/", Duration::from_secs(5)).await.unwrap();
        assert_eq!(page.status_code, 200);
        assert_eq!(fetcher.calls(), vec!["https://example.com/".to_string()]);
    }
}
