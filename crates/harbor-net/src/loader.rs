//! reqwest-backed network loader.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace};
use url::{Origin, Url};

use crate::{Fetcher, NetError, Request, RequestMode, Response, ResponseType};

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Default timeout, used when a request does not carry its own.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Origin of the hosted application; decides basic vs cors/opaque responses.
    pub origin: Option<Url>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: "Harbor/1.0".to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
            origin: None,
        }
    }
}

/// Resource loader for fetching URLs.
pub struct ResourceLoader {
    client: Client,
    config: LoaderConfig,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(origin = ?config.origin.as_ref().map(Url::as_str), "ResourceLoader initialized");

        Ok(Self { client, config })
    }

    /// Classify a response the way fetch does, relative to the configured origin.
    fn response_type(&self, request: &Request, final_url: &Url) -> ResponseType {
        let same_origin = match self.config.origin {
            Some(ref origin) => origin.origin() == final_url.origin(),
            // Without a configured origin, the request's own origin is the reference.
            None => request.url.origin() == final_url.origin(),
        };
        if same_origin && !matches!(final_url.origin(), Origin::Opaque(_)) {
            ResponseType::Basic
        } else if request.mode == RequestMode::NoCors {
            ResponseType::Opaque
        } else {
            ResponseType::Cors
        }
    }

    async fn send(&self, request: Request) -> Result<Response, NetError> {
        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }
        req_builder = req_builder.header("Accept-Language", &self.config.accept_language);

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        req_builder = req_builder.timeout(timeout);

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(timeout)
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let redirected = url != request.url;

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(timeout)
            } else {
                NetError::HttpError(e)
            }
        })?;

        trace!(
            request = ?request.id,
            url = %url,
            status = %status,
            body_len = body.len(),
            redirected,
            "Response received"
        );

        let response_type = self.response_type(&request, &url);
        let mut response = Response::new(url, status, headers, body).with_type(response_type);
        response.redirected = redirected;
        Ok(response)
    }
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        if !matches!(request.url.scheme(), "http" | "https") {
            return Err(NetError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                request.url.scheme()
            )));
        }
        debug!(url = %request.url, method = %request.method, "Fetching resource");
        self.send(request).await
    }
}
