// HTTP document source talking to the court-records lookup service

use crate::errors::AdapterError;
use crate::models::{CaseFields, SearchCriterion};
use crate::source::{DocumentSource, DocumentSourceFactory, FetchOutcome, WindDown};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, instrument, warn};

const LOOKUP_PATH: &str = "/v1/lookups";

/// One HTTP session with the lookup service
pub struct HttpDocumentSource {
    client: Client,
    lookup_url: String,
}

impl HttpDocumentSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AdapterError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdapterError::Transient(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            lookup_url: format!("{}{}", base_url.trim_end_matches('/'), LOOKUP_PATH),
        })
    }

    fn classify_error_status(status: StatusCode, body: &str) -> AdapterError {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return AdapterError::Transient(format!("HTTP {}", status.as_u16()));
        }
        if status == StatusCode::UNPROCESSABLE_ENTITY && body.to_ascii_lowercase().contains("captcha") {
            return AdapterError::Captcha(format!("HTTP {}", status.as_u16()));
        }
        AdapterError::Rejected(format!("HTTP {}: {}", status.as_u16(), truncate(body, 200)))
    }
}

fn truncate(body: &str, max: usize) -> &str {
    match body.char_indices().nth(max) {
        Some((index, _)) => &body[..index],
        None => body,
    }
}

#[async_trait]
impl DocumentSource for HttpDocumentSource {
    #[instrument(skip(self, criterion, wind_down), fields(mode = %criterion.mode()))]
    async fn fetch(
        &self,
        criterion: &SearchCriterion,
        wind_down: &WindDown,
    ) -> Result<FetchOutcome, AdapterError> {
        if wind_down.is_requested() {
            return Err(AdapterError::Transient(
                "soft time limit reached before lookup".to_string(),
            ));
        }

        let response = self
            .client
            .post(&self.lookup_url)
            .json(criterion)
            .send()
            .await
            .map_err(|e| AdapterError::Transient(format!("Lookup request failed: {}", e)))?;

        let status = response.status();
        debug!(status = status.as_u16(), "Lookup responded");

        if status == StatusCode::NOT_FOUND {
            return Ok(FetchOutcome::NotFound);
        }

        if status.is_success() {
            let fields: CaseFields = response.json().await.map_err(|e| {
                AdapterError::Transient(format!("Malformed lookup response: {}", e))
            })?;
            return Ok(FetchOutcome::Found(fields));
        }

        let body = response.text().await.unwrap_or_default();
        let err = Self::classify_error_status(status, &body);
        warn!(status = status.as_u16(), error = %err, "Lookup failed");
        Err(err)
    }
}

/// Opens a new HTTP client, and so a new connection pool, per session
pub struct HttpDocumentSourceFactory {
    base_url: String,
    timeout: Duration,
}

impl HttpDocumentSourceFactory {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl DocumentSourceFactory for HttpDocumentSourceFactory {
    async fn create(&self) -> Result<Box<dyn DocumentSource>, AdapterError> {
        Ok(Box::new(HttpDocumentSource::new(&self.base_url, self.timeout)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn criterion() -> SearchCriterion {
        SearchCriterion::docket("11001310300320190012300").unwrap()
    }

    async fn source_for(server: &MockServer) -> HttpDocumentSource {
        HttpDocumentSource::new(&server.uri(), Duration::from_secs(5)).unwrap()
    }

    async fn mount_status(server: &MockServer, status: u16, body: serde_json::Value) {
        Mock::given(method("POST"))
            .and(path(LOOKUP_PATH))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_found_case_is_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LOOKUP_PATH))
            .and(body_json(json!({"mode": "docket", "number": "11001310300320190012300"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "case_number": "11001310300320190012300",
                "court": "Juzgado 3 Civil del Circuito",
                "last_action_date": "2026-03-14",
                "status": "active"
            })))
            .mount(&server)
            .await;

        let outcome = source_for(&server)
            .await
            .fetch(&criterion(), &WindDown::never())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            FetchOutcome::Found(CaseFields {
                case_number: "11001310300320190012300".to_string(),
                court: "Juzgado 3 Civil del Circuito".to_string(),
                last_action_date: NaiveDate::from_ymd_opt(2026, 3, 14),
                status: Some("active".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn test_404_is_not_found() {
        let server = MockServer::start().await;
        mount_status(&server, 404, json!({})).await;

        let outcome = source_for(&server)
            .await
            .fetch(&criterion(), &WindDown::never())
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_error_statuses_are_classified() {
        let cases = [
            (503, json!({}), "transient"),
            (429, json!({}), "transient"),
            (422, json!({"error": "captcha_required"}), "captcha"),
            (400, json!({"error": "bad criterion"}), "rejected"),
        ];

        for (status, body, expected) in cases {
            let server = MockServer::start().await;
            mount_status(&server, status, body).await;

            let err = source_for(&server)
                .await
                .fetch(&criterion(), &WindDown::never())
                .await
                .unwrap_err();

            let kind = match err {
                AdapterError::Transient(_) => "transient",
                AdapterError::Captcha(_) => "captcha",
                AdapterError::Rejected(_) => "rejected",
            };
            assert_eq!(kind, expected, "status {}", status);
        }
    }

    #[tokio::test]
    async fn test_wind_down_before_lookup_skips_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (trigger, wind_down) = WindDown::channel();
        trigger.fire();

        let err = source_for(&server)
            .await
            .fetch(&criterion(), &wind_down)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("juzgado", 3), "juz");
        assert_eq!(truncate("año", 10), "año");
        assert_eq!(truncate("ñandú", 2), "ña");
    }
}
