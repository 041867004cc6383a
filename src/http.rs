//! HTTP/GQL client: signed POSTs to the GraphQL endpoint, exponential
//! backoff, and token-expiry invalidation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::header::USER_AGENT;
use serde_json::Value;

use crate::auth::AuthState;
use crate::constants::{GqlOperation, BACKOFF_MAX, CLIENT_ANDROID_APP, GQL_URL};
use crate::error::{MinerError, Result};
use crate::models::gql::{GqlRequest, GqlResponse};
use crate::ui::CloseSignal;
use crate::utils::{mask_proxy_url, ExponentialBackoff};

/// One shared HTTP session for all callers.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    auth: Arc<AuthState>,
    close: CloseSignal,
}

impl HttpClient {
    pub fn new(auth: Arc<AuthState>, close: CloseSignal, proxy_url: Option<&str>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .gzip(true);
        if let Some(url) = proxy_url.filter(|u| !u.is_empty()) {
            match reqwest::Proxy::all(url) {
                Ok(proxy) => {
                    builder = builder.proxy(proxy);
                    tracing::info!("HTTP client using proxy: {}", mask_proxy_url(url));
                }
                Err(_) => {
                    tracing::warn!("Invalid proxy URL, ignoring: {}", mask_proxy_url(url));
                }
            }
        }
        Ok(Self {
            client: builder.build()?,
            auth,
            close,
        })
    }

    pub fn auth(&self) -> &Arc<AuthState> {
        &self.auth
    }

    pub fn raw(&self) -> &reqwest::Client {
        &self.client
    }

    /// Execute a request with exponential backoff (0.5s doubling, 3 min cap).
    ///
    /// Retries on network errors and status >= 500. TLS verification
    /// failures are fatal and surface immediately. 4xx is returned to the
    /// caller. `invalidate_after` aborts with `RequestInvalid` once the
    /// deadline passes; a set close signal aborts with `ExitRequest`.
    pub async fn execute(
        &self,
        builder: reqwest::RequestBuilder,
        invalidate_after: Option<DateTime<Utc>>,
    ) -> Result<reqwest::Response> {
        let mut backoff = ExponentialBackoff::new(BACKOFF_MAX);
        loop {
            if self.close.is_closed() {
                return Err(MinerError::ExitRequest);
            }
            if let Some(deadline) = invalidate_after {
                if Utc::now() >= deadline {
                    return Err(MinerError::RequestInvalid);
                }
            }
            let attempt = match builder.try_clone() {
                Some(clone) => clone,
                // streaming bodies can't be retried; fall back to one shot
                None => return Ok(builder.send().await?),
            };
            match self.close.guard(attempt.send()).await? {
                Ok(response) => {
                    let status = response.status();
                    if status.as_u16() < 500 {
                        return Ok(response);
                    }
                    tracing::warn!("Server error {status}, retrying");
                }
                Err(e) => {
                    if is_tls_failure(&e) {
                        return Err(e.into());
                    }
                    // only genuine network conditions are worth a retry;
                    // anything else (bad URL, body, redirect chain) propagates
                    if !(e.is_connect() || e.is_timeout()) {
                        return Err(e.into());
                    }
                    if backoff.steps() > 0 {
                        tracing::warn!("Connection problem, retrying: {e}");
                    }
                }
            }
            let delay = backoff.next_delay();
            self.close.guard(tokio::time::sleep(delay)).await?;
        }
    }

    /// GET a page as text, with the given user agent.
    pub async fn get_text(&self, url: &str, user_agent: &str) -> Result<String> {
        let (_, body) = self.get_page(url, user_agent).await?;
        Ok(body)
    }

    /// GET a page, returning the status code alongside the body so callers
    /// can branch on 4xx without treating it as a transport failure.
    pub async fn get_page(&self, url: &str, user_agent: &str) -> Result<(u16, String)> {
        let response = self
            .execute(self.client.get(url).header(USER_AGENT, user_agent), None)
            .await?;
        let status = response.status().as_u16();
        Ok((status, response.text().await?))
    }

    /// POST a base64 spade payload; returns the response status code.
    pub async fn spade_post(&self, url: &str, payload: &str) -> Result<u16> {
        let builder = self
            .client
            .post(url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header(USER_AGENT, CLIENT_ANDROID_APP.user_agent)
            .header("Client-Id", CLIENT_ANDROID_APP.client_id)
            .body(format!("data={payload}"));
        let response = self.execute(builder, None).await?;
        Ok(response.status().as_u16())
    }

    /// Execute one GQL operation and return its `data` object.
    pub async fn gql(&self, operation: &GqlOperation, variables: Option<Value>) -> Result<Value> {
        let mut results = self
            .gql_batch(vec![GqlRequest::new(operation, variables)])
            .await?;
        results
            .pop()
            .ok_or_else(|| MinerError::miner("empty GQL response batch"))
    }

    /// Execute a batch of GQL operations and return their `data` objects in
    /// order. A transient backend error in any response retries the whole
    /// batch; any other GQL error is fatal.
    pub async fn gql_batch(&self, requests: Vec<GqlRequest>) -> Result<Vec<Value>> {
        let body = if requests.len() == 1 {
            serde_json::to_value(&requests[0])?
        } else {
            serde_json::to_value(&requests)?
        };
        let mut backoff = ExponentialBackoff::new(std::time::Duration::from_secs(60));
        loop {
            let headers = self.auth.gql_headers();
            tracing::debug!("GQL request: {body}");
            let response = self
                .execute(
                    self.client.post(GQL_URL).headers(headers).json(&body),
                    None,
                )
                .await?;
            let raw: Value = response.json().await?;
            tracing::debug!("GQL response: {raw}");

            let responses: Vec<Value> = match raw {
                Value::Array(list) => list,
                single => vec![single],
            };
            let mut force_retry = false;
            let mut data = Vec::with_capacity(responses.len());
            for response_json in &responses {
                let parsed: GqlResponse = serde_json::from_value(response_json.clone())?;
                if parsed.has_errors() {
                    if parsed.is_retriable() {
                        force_retry = true;
                        break;
                    }
                    return Err(MinerError::miner(format!(
                        "GQL error: {}",
                        response_json
                            .get("errors")
                            .cloned()
                            .unwrap_or(Value::Null)
                    )));
                }
                data.push(parsed.data.unwrap_or(Value::Null));
            }
            if !force_retry {
                return Ok(data);
            }
            let delay = backoff.next_delay();
            tracing::warn!("Transient GQL backend error, retrying in {delay:?}");
            self.close.guard(tokio::time::sleep(delay)).await?;
        }
    }
}

/// TLS verification failures must not be retried.
fn is_tls_failure(error: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(e) = source {
        let text = e.to_string();
        if text.contains("certificate") || text.contains("Certificate") {
            return true;
        }
        source = e.source();
    }
    false
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::gql_operations;

    fn test_client() -> HttpClient {
        let auth = Arc::new(AuthState::for_test(
            12345678,
            "testuser",
            "test_token_12345",
            "abcdef1234567890abcdef1234567890",
        ));
        HttpClient::new(auth, CloseSignal::new(), None).unwrap()
    }

    #[test]
    fn test_client_builds_without_proxy() {
        let _client = test_client();
    }

    #[test]
    fn test_client_ignores_invalid_proxy() {
        let auth = Arc::new(AuthState::for_test(1, "u", "t", "d"));
        let client = HttpClient::new(auth, CloseSignal::new(), Some("not a url"));
        assert!(client.is_ok());
    }

    #[test]
    fn test_single_op_serializes_as_object() {
        let requests = vec![GqlRequest::new(&gql_operations::INVENTORY, None)];
        let body = serde_json::to_value(&requests[0]).unwrap();
        assert!(body.is_object());
        assert_eq!(body["operationName"], "Inventory");
    }

    #[test]
    fn test_batch_serializes_as_array() {
        let requests = vec![
            GqlRequest::new(&gql_operations::CAMPAIGN_DETAILS, None),
            GqlRequest::new(&gql_operations::CAMPAIGN_DETAILS, None),
        ];
        let body = serde_json::to_value(&requests).unwrap();
        assert!(body.is_array());
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_execute_aborts_when_closed() {
        let auth = Arc::new(AuthState::for_test(1, "u", "t", "d"));
        let close = CloseSignal::new();
        let client = HttpClient::new(auth, close.clone(), None).unwrap();
        close.request_close();
        let result = client
            .execute(client.raw().get("http://127.0.0.1:1/unreachable"), None)
            .await;
        assert!(matches!(result, Err(MinerError::ExitRequest)));
    }

    #[tokio::test]
    async fn test_execute_fails_fast_past_invalidate_deadline() {
        let client = test_client();
        let past = Utc::now() - chrono::Duration::seconds(1);
        let result = client
            .execute(
                client.raw().get("http://127.0.0.1:1/unreachable"),
                Some(past),
            )
            .await;
        assert!(matches!(result, Err(MinerError::RequestInvalid)));
    }
}
