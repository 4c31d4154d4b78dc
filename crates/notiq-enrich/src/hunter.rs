//! Hunter person source.
//!
//! Finds person data by email via the Hunter People Find API. Emails leave
//! the system here, so the blender only calls this source for tenants whose
//! tier permits it and who configured their own API key. Hunter answers 451
//! for people who claimed data removal; that outcome is never cached and
//! never retried.

use std::{collections::BTreeMap, time::Duration};

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::{
    model::PartialPerson,
    outcome::EnrichOutcome,
    source::{BoxFuture, PersonSource},
};

/// Person enrichment via the Hunter API.
pub struct HunterSource {
    base_url: String,
    client: reqwest::Client,
}

impl HunterSource {
    /// Creates the source. API keys are per-tenant and arrive per call.
    pub fn new(base_url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { base_url, client }
    }
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Builds a full LinkedIn URL from a handle, passing through full URLs.
fn linkedin_url(handle: &str) -> String {
    if handle.starts_with("http") {
        handle.to_string()
    } else {
        format!("https://linkedin.com/in/{handle}")
    }
}

fn location_of(data: &Value) -> Option<String> {
    if let Some(location) = non_empty(data.get("location")) {
        return Some(location);
    }

    let geo = data.get("geo")?;
    let mut parts = Vec::new();
    if let Some(city) = non_empty(geo.get("city")) {
        parts.push(city);
    }
    if let Some(state) = non_empty(geo.get("state")) {
        parts.push(state);
    }
    if parts.is_empty() {
        if let Some(country) = non_empty(geo.get("country")) {
            parts.push(country);
        }
    }

    if parts.is_empty() { None } else { Some(parts.join(", ")) }
}

fn normalize(data: Value) -> PartialPerson {
    let name = data.get("name").cloned().unwrap_or(Value::Null);
    let employment = data.get("employment").cloned().unwrap_or(Value::Null);

    let mut social_handles = BTreeMap::new();
    if let Some(linkedin) = non_empty(data.get("linkedin")) {
        social_handles.insert("linkedin".to_string(), linkedin_url(&linkedin));
    }
    if let Some(twitter) = non_empty(data.get("twitter")) {
        social_handles.insert("twitter".to_string(), twitter);
    }
    if let Some(github) = non_empty(data.get("github")) {
        social_handles.insert("github".to_string(), github);
    }

    PartialPerson {
        first_name: non_empty(name.get("givenName")).or_else(|| non_empty(data.get("first_name"))),
        last_name: non_empty(name.get("familyName")).or_else(|| non_empty(data.get("last_name"))),
        position: non_empty(employment.get("title")).or_else(|| non_empty(data.get("position"))),
        seniority: non_empty(employment.get("seniority"))
            .or_else(|| non_empty(data.get("seniority"))),
        social_handles,
        location: location_of(&data),
        raw: data,
    }
}

impl PersonSource for HunterSource {
    fn name(&self) -> &'static str {
        "hunter"
    }

    fn priority(&self) -> u32 {
        100
    }

    fn is_available(&self) -> bool {
        true
    }

    fn fetch<'a>(
        &'a self,
        email: &'a str,
        api_key: &'a str,
    ) -> BoxFuture<'a, EnrichOutcome<PartialPerson>> {
        Box::pin(async move {
            if api_key.is_empty() {
                return EnrichOutcome::Failed("hunter API key not provided".to_string());
            }

            let response = match self
                .client
                .get(format!("{}/people/find", self.base_url))
                .query(&[("email", email), ("api_key", api_key)])
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) if e.is_timeout() => {
                    warn!("hunter request timed out");
                    return EnrichOutcome::Failed("request timeout".to_string());
                },
                Err(e) => {
                    error!(error = %e, "hunter request failed");
                    return EnrichOutcome::Failed(e.to_string());
                },
            };

            match response.status().as_u16() {
                404 => return EnrichOutcome::NotFound,
                451 => {
                    debug!("hunter reported a privacy removal claim");
                    return EnrichOutcome::PrivacyClaimed;
                },
                429 => {
                    let retry_after = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(Duration::from_secs);
                    warn!(?retry_after, "hunter rate limit exceeded");
                    return EnrichOutcome::RateLimited { retry_after };
                },
                200..=299 => {},
                status => return EnrichOutcome::Failed(format!("HTTP {status}")),
            }

            let body: Value = match response.json().await {
                Ok(body) => body,
                Err(e) => return EnrichOutcome::Failed(format!("invalid response body: {e}")),
            };

            let data = body.get("data").cloned().unwrap_or(Value::Null);
            if data.is_null() {
                return EnrichOutcome::NotFound;
            }

            EnrichOutcome::Found(normalize(data))
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        matchers::{method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn source(server: &MockServer) -> HunterSource {
        HunterSource::new(server.uri(), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn found_person_is_normalized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/people/find"))
            .and(query_param("email", "jane@acme.io"))
            .and(query_param("api_key", "hk_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "name": {"givenName": "Jane", "familyName": "Doe"},
                    "employment": {"title": "VP Engineering", "seniority": "executive"},
                    "linkedin": "janedoe",
                    "geo": {"city": "Berlin", "country": "Germany"}
                }
            })))
            .mount(&server)
            .await;

        let outcome = source(&server).fetch("jane@acme.io", "hk_1").await;
        let EnrichOutcome::Found(person) = outcome else {
            panic!("expected Found, got {outcome:?}");
        };
        assert_eq!(person.first_name.as_deref(), Some("Jane"));
        assert_eq!(person.position.as_deref(), Some("VP Engineering"));
        assert_eq!(person.seniority.as_deref(), Some("executive"));
        assert_eq!(
            person.social_handles.get("linkedin").map(String::as_str),
            Some("https://linkedin.com/in/janedoe")
        );
        assert_eq!(person.location.as_deref(), Some("Berlin"));
    }

    #[tokio::test]
    async fn missing_person_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/people/find"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let outcome = source(&server).fetch("nobody@acme.io", "hk_1").await;
        assert_eq!(outcome, EnrichOutcome::NotFound);
    }

    #[tokio::test]
    async fn privacy_claim_is_tagged() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/people/find"))
            .respond_with(ResponseTemplate::new(451))
            .mount(&server)
            .await;

        let outcome = source(&server).fetch("private@acme.io", "hk_1").await;
        assert_eq!(outcome, EnrichOutcome::PrivacyClaimed);
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/people/find"))
            .respond_with(ResponseTemplate::new(429).append_header("Retry-After", "30"))
            .mount(&server)
            .await;

        let outcome = source(&server).fetch("jane@acme.io", "hk_1").await;
        assert_eq!(
            outcome,
            EnrichOutcome::RateLimited { retry_after: Some(Duration::from_secs(30)) }
        );
    }

    #[tokio::test]
    async fn null_data_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/people/find"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": null})))
            .mount(&server)
            .await;

        let outcome = source(&server).fetch("jane@acme.io", "hk_1").await;
        assert_eq!(outcome, EnrichOutcome::NotFound);
    }
}
