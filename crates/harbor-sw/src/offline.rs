//! Offline page synthesizer.

use harbor_net::Response;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use url::Url;

use crate::cache::{CacheEntry, CacheKey};
use crate::now_millis;

const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// The fallback document served for navigations when neither the cache nor
/// the network can answer.
#[derive(Debug, Clone, PartialEq)]
pub struct OfflinePage {
    /// URL the document is stored under.
    pub url: Url,
    /// Rendered HTML.
    pub html: String,
}

impl OfflinePage {
    /// Render the offline document for an application.
    pub fn synthesize(app_name: &str, url: Url) -> Self {
        let name = escape_html(app_name);
        let html = format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>{name} - Offline</title>
  <style>
    body {{ font-family: system-ui, sans-serif; margin: 0; min-height: 100vh;
           display: flex; align-items: center; justify-content: center;
           background: #f5f5f5; color: #333; }}
    main {{ text-align: center; padding: 2rem; }}
    h1 {{ font-size: 1.5rem; margin-bottom: 0.5rem; }}
    button {{ margin-top: 1rem; padding: 0.5rem 1.5rem; border: 0;
             border-radius: 4px; background: #1a73e8; color: #fff; cursor: pointer; }}
  </style>
</head>
<body>
  <main>
    <h1>You're offline</h1>
    <p>{name} can't reach the network right now. Pages you have already visited are still available.</p>
    <button onclick="window.location.reload()">Try again</button>
  </main>
</body>
</html>
"#
        );
        Self { url, html }
    }

    /// Cache key the document is stored under.
    pub fn key(&self) -> CacheKey {
        CacheKey::get(&self.url)
    }

    fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(HTML_CONTENT_TYPE),
        );
        headers
    }

    /// Entry for seeding a cache generation.
    pub fn to_entry(&self) -> CacheEntry {
        CacheEntry {
            url: self.url.clone(),
            status: StatusCode::OK,
            headers: Self::headers(),
            body: self.html.clone().into(),
            cached_at: now_millis(),
        }
    }

    /// Response served straight from the synthesizer.
    pub fn to_response(&self) -> Response {
        Response::synthesized(
            self.url.clone(),
            StatusCode::OK,
            HTML_CONTENT_TYPE,
            self.html.clone(),
        )
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
