//! Brandfetch company source.
//!
//! Looks up brand data and logos by domain. Quota usage reported in
//! response headers is logged so operators can see consumption before the
//! hard limit hits.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::{
    model::PartialCompany,
    outcome::EnrichOutcome,
    source::{BoxFuture, CompanySource},
};

/// Company enrichment via the Brandfetch API.
pub struct BrandfetchSource {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl BrandfetchSource {
    /// Creates the source with a global API key.
    pub fn new(api_key: String, base_url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { api_key, base_url, client }
    }

    async fn get_json(&self, url: &str) -> std::result::Result<Value, EnrichOutcome<PartialCompany>> {
        let response = match self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!(url = %url, "brandfetch request timed out");
                return Err(EnrichOutcome::Failed("request timeout".to_string()));
            },
            Err(e) => {
                error!(url = %url, error = %e, "brandfetch request failed");
                return Err(EnrichOutcome::Failed(e.to_string()));
            },
        };

        match response.status().as_u16() {
            404 => return Err(EnrichOutcome::NotFound),
            429 => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);
                warn!(?retry_after, "brandfetch rate limit exceeded");
                return Err(EnrichOutcome::RateLimited { retry_after });
            },
            200..=299 => {},
            status => {
                return Err(EnrichOutcome::Failed(format!("HTTP {status}")));
            },
        }

        log_quota_usage(response.headers());

        response
            .json::<Value>()
            .await
            .map_err(|e| EnrichOutcome::Failed(format!("invalid response body: {e}")))
    }
}

/// Picks the first icon-type logo URL out of the logos payload.
fn primary_logo(logos: &Value) -> Option<String> {
    let logos = logos.as_array()?;
    for logo in logos {
        if logo.get("type").and_then(Value::as_str) != Some("icon") {
            continue;
        }
        let formats = logo.get("formats").and_then(Value::as_array)?;
        for format in formats {
            if let Some(src) = format.get("src").and_then(Value::as_str) {
                return Some(src.to_string());
            }
        }
    }
    None
}

/// Logs API quota usage from Brandfetch response headers.
fn log_quota_usage(headers: &reqwest::header::HeaderMap) {
    let quota = headers
        .get("x-api-key-quota")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let usage = headers
        .get("x-api-key-approximate-usage")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    if let (Some(quota), Some(usage)) = (quota, usage) {
        if quota > 0 {
            let pct = (usage as f64 / quota as f64) * 100.0;
            if pct > 80.0 {
                warn!(usage, quota, usage_pct = pct, "brandfetch API usage high");
            } else {
                debug!(usage, quota, usage_pct = pct, "brandfetch API usage");
            }
        }
    }
}

impl CompanySource for BrandfetchSource {
    fn name(&self) -> &'static str {
        "brandfetch"
    }

    fn priority(&self) -> u32 {
        100
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn fetch<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, EnrichOutcome<PartialCompany>> {
        Box::pin(async move {
            let brand = match self.get_json(&format!("{}/brands/{domain}", self.base_url)).await {
                Ok(value) => value,
                Err(outcome) => return outcome,
            };

            // Logos live on a second endpoint; its failure must not void
            // the brand data we already have.
            let logo_url = match self
                .get_json(&format!("{}/brands/{domain}/logos", self.base_url))
                .await
            {
                Ok(logos) => primary_logo(&logos),
                Err(_) => None,
            };

            let mut brand_info = std::collections::BTreeMap::new();
            for (from, to) in [
                ("description", "description"),
                ("industry", "industry"),
                ("yearFounded", "year_founded"),
            ] {
                if let Some(value) = brand.get(from) {
                    if !value.is_null() {
                        brand_info.insert(to.to_string(), value.clone());
                    }
                }
            }
            if let Some(links) = brand.get("links").and_then(Value::as_array) {
                if !links.is_empty() {
                    brand_info.insert("links".to_string(), json!(links));
                }
            }

            EnrichOutcome::Found(PartialCompany {
                name: brand.get("name").and_then(Value::as_str).map(str::to_string),
                logo_url,
                brand_info,
                raw: brand,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn source(server: &MockServer) -> BrandfetchSource {
        BrandfetchSource::new("bf_key".into(), server.uri(), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn found_brand_with_logo() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/brands/acme.io"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "Acme Inc",
                "description": "Rocket-powered products",
                "industry": "Manufacturing",
                "yearFounded": 1999
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/brands/acme.io/logos"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"type": "logo", "formats": [{"src": "https://cdn/banner.png"}]},
                {"type": "icon", "formats": [{"src": "https://cdn/icon.png"}]}
            ])))
            .mount(&server)
            .await;

        let outcome = source(&server).fetch("acme.io").await;
        let EnrichOutcome::Found(partial) = outcome else {
            panic!("expected Found, got {outcome:?}");
        };
        assert_eq!(partial.name.as_deref(), Some("Acme Inc"));
        assert_eq!(partial.logo_url.as_deref(), Some("https://cdn/icon.png"));
        assert_eq!(partial.brand_info.get("industry"), Some(&json!("Manufacturing")));
        assert_eq!(partial.brand_info.get("year_founded"), Some(&json!(1999)));
    }

    #[tokio::test]
    async fn unknown_domain_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/brands/nowhere.test"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let outcome = source(&server).fetch("nowhere.test").await;
        assert_eq!(outcome, EnrichOutcome::NotFound);
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/brands/acme.io"))
            .respond_with(ResponseTemplate::new(429).append_header("Retry-After", "120"))
            .mount(&server)
            .await;

        let outcome = source(&server).fetch("acme.io").await;
        assert_eq!(
            outcome,
            EnrichOutcome::RateLimited { retry_after: Some(Duration::from_secs(120)) }
        );
    }

    #[tokio::test]
    async fn server_error_is_failed_not_panic() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/brands/acme.io"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let outcome = source(&server).fetch("acme.io").await;
        assert!(matches!(outcome, EnrichOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn logo_endpoint_failure_keeps_brand_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/brands/acme.io"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "Acme Inc"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/brands/acme.io/logos"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let outcome = source(&server).fetch("acme.io").await;
        let EnrichOutcome::Found(partial) = outcome else {
            panic!("expected Found, got {outcome:?}");
        };
        assert_eq!(partial.name.as_deref(), Some("Acme Inc"));
        assert_eq!(partial.logo_url, None);
    }
}
