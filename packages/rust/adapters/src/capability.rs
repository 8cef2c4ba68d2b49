//! HTTP stage capability: POST the stage input, the JSON response is the output.

use std::time::Duration;

use async_trait::async_trait;
use courier_shared::{Result, StageInput};
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::StageCapability;
use crate::http::{build_client, classify_send_error, parse_endpoint, read_json};

pub struct HttpCapability {
    name: String,
    url: Url,
    client: Client,
}

impl HttpCapability {
    /// `timeout` is the client-side backstop; the executor applies the
    /// stage deadline on top of it.
    pub fn new(name: impl Into<String>, url: &str, timeout: Duration) -> Result<Self> {
        let name = name.into();
        let url = parse_endpoint(&format!("stage {name}"), url)?;
        Ok(Self {
            name,
            url,
            client: build_client(timeout)?,
        })
    }
}

#[async_trait]
impl StageCapability for HttpCapability {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, input: &StageInput) -> Result<serde_json::Value> {
        debug!(stage = %self.name, item = %input.item_key, "invoking http capability");
        let response = self
            .client
            .post(self.url.as_str())
            .json(input)
            .send()
            .await
            .map_err(|e| classify_send_error(&self.url, e))?;
        read_json(&self.url, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_shared::{CourierError, ItemKey};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn input() -> StageInput {
        StageInput {
            item_key: ItemKey::new("twitter", "tweet-1"),
            stage_name: "translate".into(),
            ordinal: 1,
            raw: json!({"content_text": "hello"}),
            payload: Vec::new(),
        }
    }

    #[tokio::test]
    async fn posts_input_and_returns_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/translate"))
            .and(body_partial_json(json!({"item_key": "twitter:tweet-1", "ordinal": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "hola"})))
            .expect(1)
            .mount(&server)
            .await;

        let cap = HttpCapability::new(
            "translate",
            &format!("{}/translate", server.uri()),
            Duration::from_secs(5),
        )
        .unwrap();
        let output = cap.invoke(&input()).await.expect("invoke");
        assert_eq!(output, json!({"text": "hola"}));
    }

    #[tokio::test]
    async fn rate_limit_is_retryable_and_bad_request_is_not() {
        let server = MockServer::start().await;
        Mock::given(path("/limited"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        Mock::given(path("/rejected"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let limited = HttpCapability::new(
            "a",
            &format!("{}/limited", server.uri()),
            Duration::from_secs(5),
        )
        .unwrap();
        let err = limited.invoke(&input()).await.unwrap_err();
        assert!(err.is_retryable());

        let rejected = HttpCapability::new(
            "b",
            &format!("{}/rejected", server.uri()),
            Duration::from_secs(5),
        )
        .unwrap();
        let err = rejected.invoke(&input()).await.unwrap_err();
        assert!(matches!(err, CourierError::Permanent(_)));
    }
}
