mod types;

use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode, Url};
use thiserror::Error;
use tracing::debug;

pub use crate::metadata::types::{EventDocument, Identity, ScheduledEvent};
use crate::metadata::types::{EventApproval, InstanceDocument};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("request failed")]
    Request(#[from] reqwest::Error),
    #[error("expected HTTP status 200, got {0}")]
    UnexpectedStatus(StatusCode),
    #[error("instance document has no compute name")]
    MissingInstanceName,
}

/// Where the engine reads scheduled events from, and approves them to.
pub trait MetadataSource: Send + Sync {
    fn fetch_events(&self) -> impl Future<Output = Result<EventDocument, MetadataError>> + Send;

    fn fetch_identity(&self) -> impl Future<Output = Result<Identity, MetadataError>> + Send;

    fn approve(&self, event_id: &str) -> impl Future<Output = Result<(), MetadataError>> + Send;
}

#[derive(Clone, Debug)]
pub struct MetadataConfig {
    pub scheduled_events_url: Url,
    pub instance_url: Url,
    pub timeout: Duration,
}

/// Talks to the instance metadata service over HTTP.
#[derive(Clone)]
pub struct MetadataClient {
    client: Client,
    scheduled_events_url: Url,
    instance_url: Url,
}

impl MetadataClient {
    pub fn try_new(config: &MetadataConfig) -> Result<Self, MetadataError> {
        let mut headers = HeaderMap::new();
        headers.insert("Metadata", HeaderValue::from_static("true"));

        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            scheduled_events_url: config.scheduled_events_url.clone(),
            instance_url: config.instance_url.clone(),
        })
    }
}

impl MetadataSource for MetadataClient {
    async fn fetch_events(&self) -> Result<EventDocument, MetadataError> {
        debug!(url = %self.scheduled_events_url, "fetching scheduled events");
        let response = self
            .client
            .get(self.scheduled_events_url.clone())
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(MetadataError::UnexpectedStatus(response.status()));
        }

        Ok(response.json().await?)
    }

    async fn fetch_identity(&self) -> Result<Identity, MetadataError> {
        debug!(url = %self.instance_url, "fetching instance metadata");
        let response = self.client.get(self.instance_url.clone()).send().await?;
        if response.status() != StatusCode::OK {
            return Err(MetadataError::UnexpectedStatus(response.status()));
        }

        let document: InstanceDocument = response.json().await?;
        if document.compute.name.is_empty() {
            return Err(MetadataError::MissingInstanceName);
        }

        Ok(Identity::new(document.compute.name))
    }

    async fn approve(&self, event_id: &str) -> Result<(), MetadataError> {
        let response = self
            .client
            .post(self.scheduled_events_url.clone())
            .json(&EventApproval::for_event(event_id))
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(MetadataError::UnexpectedStatus(response.status()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    async fn setup() -> (MockServer, MetadataClient) {
        let server = MockServer::start().await;
        let base = Url::parse(&server.uri()).unwrap();
        let client = MetadataClient::try_new(&MetadataConfig {
            scheduled_events_url: base.join("/metadata/scheduledevents").unwrap(),
            instance_url: base.join("/metadata/instance").unwrap(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();

        (server, client)
    }

    #[tokio::test]
    async fn should_fetch_events_with_metadata_header() {
        let (server, client) = setup().await;

        Mock::given(method("GET"))
            .and(path("/metadata/scheduledevents"))
            .and(header("Metadata", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "DocumentIncarnation": 5,
                "Events": [{
                    "EventId": "e1",
                    "EventType": "Reboot",
                    "ResourceType": "VirtualMachine",
                    "Resources": ["node-a"],
                    "EventStatus": "Scheduled",
                    "NotBefore": "",
                    "EventSource": "Platform",
                    "Description": "Host maintenance"
                }]
            })))
            .mount(&server)
            .await;

        let document = client.fetch_events().await.unwrap();
        assert_eq!(document.document_incarnation, 5);
        assert_eq!(document.events[0].id, "e1");
        assert_eq!(document.events[0].resources, vec!["node-a".to_owned()]);
    }

    #[tokio::test]
    async fn should_reject_non_200() {
        let (server, client) = setup().await;

        Mock::given(method("GET"))
            .and(path("/metadata/scheduledevents"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = client.fetch_events().await;
        assert_matches!(
            result,
            Err(MetadataError::UnexpectedStatus(StatusCode::SERVICE_UNAVAILABLE))
        );
    }

    #[tokio::test]
    async fn should_fail_on_malformed_document() {
        let (server, client) = setup().await;

        Mock::given(method("GET"))
            .and(path("/metadata/scheduledevents"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        assert_matches!(client.fetch_events().await, Err(MetadataError::Request(_)));
    }

    #[tokio::test]
    async fn should_fetch_identity() {
        let (server, client) = setup().await;

        Mock::given(method("GET"))
            .and(path("/metadata/instance"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "compute": { "name": "vmss_3", "location": "westeurope" }
            })))
            .mount(&server)
            .await;

        let identity = client.fetch_identity().await.unwrap();
        assert_eq!(identity, Identity::new("vmss_3"));
    }

    #[tokio::test]
    async fn should_reject_identity_without_name() {
        let (server, client) = setup().await;

        Mock::given(method("GET"))
            .and(path("/metadata/instance"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "compute": {} })))
            .mount(&server)
            .await;

        assert_matches!(
            client.fetch_identity().await,
            Err(MetadataError::MissingInstanceName)
        );
    }

    #[tokio::test]
    async fn should_post_approval() {
        let (server, client) = setup().await;

        Mock::given(method("POST"))
            .and(path("/metadata/scheduledevents"))
            .and(header("Metadata", "true"))
            .and(body_json(json!({ "StartRequests": [{ "EventId": "e1" }] })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client.approve("e1").await.unwrap();
    }
}
