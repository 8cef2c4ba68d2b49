//! JSON Feed 1.1 source.
//!
//! One `DiscoveredItem` per `items[]` entry: `id` becomes the source key,
//! the whole entry is the raw content, and the `_reply_to` extension (the
//! id of another entry) becomes the parent key. `next_url` pages are
//! followed lazily, up to [`MAX_PAGES`].

use std::time::Duration;

use courier_shared::{CourierError, DiscoveredItem, Result};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::SourceAdapter;
use crate::http::{build_client, classify_send_error, parse_endpoint, read_json};

/// Upper bound on `next_url` hops per discovery pass.
const MAX_PAGES: u32 = 10;

/// Fetches a JSON Feed document over HTTP.
pub struct JsonFeedSource {
    name: String,
    url: Url,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct FeedPage {
    #[serde(default)]
    items: Vec<serde_json::Value>,
    #[serde(default)]
    next_url: Option<String>,
}

impl JsonFeedSource {
    pub fn new(name: impl Into<String>, url: &str) -> Result<Self> {
        let name = name.into();
        let url = parse_endpoint(&format!("source {name}"), url)?;
        Ok(Self {
            name,
            url,
            client: build_client(Duration::from_secs(30))?,
        })
    }

    async fn fetch_page(&self, url: &Url) -> Result<FeedPage> {
        debug!(source = %self.name, %url, "fetching feed page");
        let response = self
            .client
            .get(url.as_str())
            .header("Accept", "application/feed+json, application/json")
            .send()
            .await
            .map_err(|e| classify_send_error(url, e))?;
        let body = read_json(url, response).await?;
        serde_json::from_value(body)
            .map_err(|e| CourierError::parse(format!("{url}: not a JSON Feed document: {e}")))
    }

    /// One unfold step: fetch `next` and work out where to go after it.
    async fn next_page(
        &self,
        next: Option<Url>,
        fetched: u32,
    ) -> Result<Option<(Vec<serde_json::Value>, (Option<Url>, u32))>> {
        let Some(url) = next else {
            return Ok(None);
        };
        let page = self.fetch_page(&url).await?;
        let following = match page.next_url.as_deref() {
            Some(raw) if fetched + 1 < MAX_PAGES => Some(
                url.join(raw)
                    .map_err(|e| CourierError::parse(format!("bad next_url '{raw}': {e}")))?,
            ),
            _ => None,
        };
        Ok(Some((page.items, (following, fetched + 1))))
    }

    fn to_discovered(&self, entry: serde_json::Value) -> Result<DiscoveredItem> {
        let source_key = match entry.get("id") {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => {
                return Err(CourierError::parse(format!(
                    "source {}: feed item without an id",
                    self.name
                )));
            }
        };
        let parent_key = match entry.get("_reply_to") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        Ok(DiscoveredItem {
            source_name: self.name.clone(),
            source_key,
            raw: entry,
            parent_key,
        })
    }
}

impl SourceAdapter for JsonFeedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn discover(&self) -> BoxStream<'_, Result<DiscoveredItem>> {
        stream::try_unfold((Some(self.url.clone()), 0u32), move |(next, fetched)| {
            self.next_page(next, fetched)
        })
        .map_ok(move |entries| stream::iter(entries.into_iter().map(move |e| self.to_discovered(e))))
        .try_flatten()
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn discovers_items_across_pages() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/feed.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "version": "https://jsonfeed.org/version/1.1",
                "title": "timeline",
                "items": [
                    {"id": "tweet-1", "content_text": "first"},
                    {"id": "tweet-2", "content_text": "reply", "_reply_to": "tweet-1"}
                ],
                "next_url": "/feed-2.json"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed-2.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "version": "https://jsonfeed.org/version/1.1",
                "items": [{"id": 3, "content_text": "numeric id"}]
            })))
            .mount(&server)
            .await;

        let source =
            JsonFeedSource::new("twitter", &format!("{}/feed.json", server.uri())).unwrap();
        let items: Vec<DiscoveredItem> = source.discover().try_collect().await.expect("discover");

        let keys: Vec<&str> = items.iter().map(|i| i.source_key.as_str()).collect();
        assert_eq!(keys, vec!["tweet-1", "tweet-2", "3"]);
        assert_eq!(items[1].parent_key.as_deref(), Some("tweet-1"));
        assert_eq!(items[0].raw["content_text"], "first");
        assert_eq!(items[0].key().as_str(), "twitter:tweet-1");
    }

    #[tokio::test]
    async fn server_error_surfaces_as_transient() {
        let server = MockServer::start().await;
        Mock::given(path("/feed.json"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let source =
            JsonFeedSource::new("twitter", &format!("{}/feed.json", server.uri())).unwrap();
        let results: Vec<Result<DiscoveredItem>> = source.discover().collect().await;
        assert_eq!(results.len(), 1);
        let err = results.into_iter().next().unwrap().unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn item_without_id_is_an_error_element() {
        let server = MockServer::start().await;
        Mock::given(path("/feed.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"content_text": "anonymous"}, {"id": "ok"}]
            })))
            .mount(&server)
            .await;

        let source =
            JsonFeedSource::new("twitter", &format!("{}/feed.json", server.uri())).unwrap();
        let results: Vec<Result<DiscoveredItem>> = source.discover().collect().await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert_eq!(results[1].as_ref().unwrap().source_key, "ok");
    }
}
