use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use scraper::{Html, Selector};
use url::Url;

use crate::domain::normalise_domain;
use crate::error::{CrawlError, CrawlErrorKind};
use crate::fetcher::{FetchedPage, PageFetcher};

/// Cache-status values that mean "not yet warm" — a second pass is worth
/// taking (§4.4 step 2).
const COLD_CACHE_STATUSES: [&str; 3] = ["MISS", "EXPIRED", "BYPASS"];

/// Result of probing one page: everything the Worker Pool needs to call
/// `Complete`/`Fail` plus any newly discovered URLs (§4.4).
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub status_code: i32,
    pub response_time_ms: i32,
    pub cache_status: Option<String>,
    pub second_response_time_ms: Option<i32>,
    pub second_cache_status: Option<String>,
    pub content_type: Option<String>,
    pub discovered_links: Vec<String>,
}

/// A status code outside 2xx/3xx is not a transport error, so it is not a
/// `CrawlError` — the Worker Pool decides retryability from `status_code`
/// via [`CrawlErrorKind::is_retryable`]. This only flags it for callers who
/// want the error-kind taxonomy alongside the raw number.
pub fn classify_status(status: u16) -> Option<CrawlErrorKind> {
    match status {
        200..=399 => None,
        400..=499 => Some(CrawlErrorKind::Http4xx),
        _ => Some(CrawlErrorKind::Http5xx),
    }
}

/// Single-page, two-pass probe (§4.4). Holds no state of its own beyond the
/// fetcher it was built with, so one instance is shared across every worker.
pub struct Crawler {
    fetcher: Arc<dyn PageFetcher>,
}

impl Crawler {
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self { fetcher }
    }

    /// Probes `url`. `find_links` gates link extraction; `probe_timeout` is
    /// the per-request deadline (§5 "every outbound HTTP call carries a
    /// deadline").
    pub async fn probe(
        &self,
        url: &str,
        find_links: bool,
        probe_timeout: Duration,
    ) -> Result<ProbeOutcome, CrawlError> {
        let first = self.fetcher.fetch(url, probe_timeout).await?;

        let (second_response_time_ms, second_cache_status) = if needs_warm_verification(&first) {
            match self.fetcher.fetch(&first.final_url, probe_timeout).await {
                Ok(second) => (Some(second.response_time_ms as i32), second.cache_status.clone()),
                Err(_) => (None, None),
            }
        } else {
            (None, None)
        };

        let discovered_links = if find_links && first.is_success() && first.is_html() {
            extract_same_domain_links(&first.body, &first.final_url)
        } else {
            Vec::new()
        };

        Ok(ProbeOutcome {
            status_code: first.status_code as i32,
            response_time_ms: first.response_time_ms as i32,
            cache_status: first.cache_status,
            second_response_time_ms,
            second_cache_status,
            content_type: first.content_type,
            discovered_links,
        })
    }
}

fn needs_warm_verification(page: &FetchedPage) -> bool {
    page.is_success()
        && page
            .cache_status
            .as_deref()
            .map(|status| COLD_CACHE_STATUSES.contains(&status.to_ascii_uppercase().as_str()))
            .unwrap_or(false)
}

/// Extracts `<a href>` targets, resolves them against `base_url`, keeps only
/// same-domain entries, strips fragments, lower-cases the host, and
/// deduplicates in-memory for this single response (§4.4 step 3).
///
/// "Same-registered-domain" is approximated here as "same normalised host"
/// (scheme/port/`www.` stripped) rather than full public-suffix-list eTLD+1
/// matching — this repository's stack carries no PSL crate, and the
/// teacher's own `simple_scraper::extract_links` makes the same
/// simplification (direct `url.domain()` comparison).
fn extract_same_domain_links(body: &str, base_url: &str) -> Vec<String> {
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };
    let base_domain = base.domain().map(normalise_domain).unwrap_or_default();
    if base_domain.is_empty() {
        return Vec::new();
    }

    let document = Html::parse_document(body);
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let Ok(mut resolved) = base.join(href) else {
            continue;
        };

        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        let link_domain = resolved.domain().map(normalise_domain).unwrap_or_default();
        if link_domain != base_domain {
            continue;
        }

        resolved.set_fragment(None);
        let normalised = resolved.to_string();
        if seen.insert(normalised.clone()) {
            links.push(normalised);
        }
    }

    links
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::memory::InMemoryFetcher;

    fn html_page(body: &str, final_url: &str, cache_status: Option<&str>) -> FetchedPage {
        FetchedPage {
            status_code: 200,
            final_url: final_url.to_string(),
            content_type: Some("text/html; charset=utf-8".to_string()),
            cache_status: cache_status.map(|s| s.to_string()),
            body: body.to_string(),
            response_time_ms: 40,
        }
    }

    #[tokio::test]
    async fn probe_runs_second_pass_only_when_cache_is_cold() {
        let fetcher = InMemoryFetcher::new();
        fetcher.register_page("https://example.com/", html_page("<html></html>", "https://example.com/", Some("MISS")));
        let crawler = Crawler::new(Arc::new(fetcher));

        let outcome = crawler.probe("https://example.com/", false, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome.status_code, 200);
        assert_eq!(outcome.cache_status.as_deref(), Some("MISS"));
        // second fetch target ("https://example.com/") has no distinct
        // registration beyond the first, so the in-memory fetcher answers
        // the same canned page again — second-pass fields are populated.
        assert!(outcome.second_response_time_ms.is_some());
    }

    #[tokio::test]
    async fn probe_skips_second_pass_on_warm_cache() {
        let fetcher = InMemoryFetcher::new();
        fetcher.register_page("https://example.com/", html_page("<html></html>", "https://example.com/", Some("HIT")));
        let crawler = Crawler::new(Arc::new(fetcher));

        let outcome = crawler.probe("https://example.com/", false, Duration::from_secs(5)).await.unwrap();
        assert!(outcome.second_response_time_ms.is_none());
    }

    #[test]
    fn extract_same_domain_links_filters_foreign_hosts_and_fragments() {
        let body = r#"
            <html><body>
                <a href="/about">About</a>
                <a href="https://example.com/contact#team">Contact</a>
                <a href="https://other.com/page">Other</a>
                <a href="mailto:hi@example.com">Mail</a>
            </body></html>
        "#;
        let mut links = extract_same_domain_links(body, "https://example.com/");
        links.sort();
        assert_eq!(
            links,
            vec!["https://example.com/about".to_string(), "https://example.com/contact".to_string()]
        );
    }

    #[test]
    fn classify_status_splits_4xx_and_5xx() {
        assert_eq!(classify_status(200), None);
        assert_eq!(classify_status(404), Some(CrawlErrorKind::Http4xx));
        assert_eq!(classify_status(503), Some(CrawlErrorKind::Http5xx));
    }
}
