//! Webhook destination: POST the finished item as JSON.
//!
//! Request body: `{"item": <FinishedItem>, "reply_to": <ref or null>}`.
//! A `message_id` field in the JSON response (string or number) is kept as
//! the external ref so later replies can thread under it.

use std::time::Duration;

use async_trait::async_trait;
use courier_shared::{DeliveryContext, FinishedItem, Result};
use reqwest::Client;
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::DestinationAdapter;
use crate::http::{build_client, classify_send_error, parse_endpoint, read_json};

pub struct WebhookDestination {
    id: String,
    url: Url,
    client: Client,
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    item: &'a FinishedItem,
    reply_to: Option<&'a str>,
}

impl WebhookDestination {
    pub fn new(id: impl Into<String>, url: &str, timeout: Duration) -> Result<Self> {
        let id = id.into();
        let url = parse_endpoint(&format!("destination {id}"), url)?;
        Ok(Self {
            id,
            url,
            client: build_client(timeout)?,
        })
    }
}

#[async_trait]
impl DestinationAdapter for WebhookDestination {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(
        &self,
        item: &FinishedItem,
        context: &DeliveryContext,
    ) -> Result<Option<String>> {
        debug!(destination = %self.id, item = %item.key, reply_to = ?context.reply_to, "sending webhook");
        let body = WebhookBody {
            item,
            reply_to: context.reply_to.as_deref(),
        };
        let response = self
            .client
            .post(self.url.as_str())
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_send_error(&self.url, e))?;
        let reply = read_json(&self.url, response).await?;

        Ok(match reply.get("message_id") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_shared::ItemKey;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn finished() -> FinishedItem {
        FinishedItem {
            key: ItemKey::new("twitter", "tweet-2"),
            source_name: "twitter".into(),
            source_key: "tweet-2".into(),
            discovered_at: Utc::now(),
            raw: json!({"content_text": "reply"}),
            payload: Vec::new(),
        }
    }

    #[tokio::test]
    async fn returns_message_id_and_forwards_reply_to() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .and(body_partial_json(json!({"reply_to": "msg-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message_id": 42})))
            .expect(1)
            .mount(&server)
            .await;

        let dest = WebhookDestination::new(
            "chat-a",
            &format!("{}/send", server.uri()),
            Duration::from_secs(5),
        )
        .unwrap();
        let context = DeliveryContext {
            reply_to: Some("msg-1".into()),
        };
        let external = dest.send(&finished(), &context).await.expect("send");
        assert_eq!(external.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn empty_response_has_no_ref() {
        let server = MockServer::start().await;
        Mock::given(path("/send"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let dest = WebhookDestination::new(
            "chat-a",
            &format!("{}/send", server.uri()),
            Duration::from_secs(5),
        )
        .unwrap();
        let external = dest
            .send(&finished(), &DeliveryContext::default())
            .await
            .expect("send");
        assert!(external.is_none());
    }

    #[tokio::test]
    async fn missing_chat_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(path("/send"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dest = WebhookDestination::new(
            "chat-a",
            &format!("{}/send", server.uri()),
            Duration::from_secs(5),
        )
        .unwrap();
        let err = dest
            .send(&finished(), &DeliveryContext::default())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
