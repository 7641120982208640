use std::time::Duration;

use reqwest::{Client, Url};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

pub const MESSAGE_PLACEHOLDER: &str = "{message}";

const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
enum NotificationError {
    #[error("request failed")]
    Request(#[from] reqwest::Error),
    #[error("sink responded with {0}")]
    UnexpectedStatus(reqwest::StatusCode),
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    username: &'a str,
    text: &'a str,
}

/// Fans a message out to every configured webhook. Delivery is best effort.
#[derive(Clone)]
pub struct Notifier {
    client: Client,
    sinks: Vec<Url>,
    template: String,
}

impl Default for Notifier {
    fn default() -> Self {
        Self {
            client: Client::new(),
            sinks: Vec::new(),
            template: String::from(MESSAGE_PLACEHOLDER),
        }
    }
}

impl Notifier {
    pub fn new(sinks: Vec<Url>, template: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(NOTIFICATION_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            client,
            sinks,
            template: template.into(),
        }
    }

    pub fn render(&self, message: &str) -> String {
        if self.template.contains(MESSAGE_PLACEHOLDER) {
            self.template.replace(MESSAGE_PLACEHOLDER, message)
        } else {
            format!("{} {}", self.template, message)
        }
    }

    pub async fn send(&self, message: &str) {
        if self.sinks.is_empty() {
            return;
        }

        let text = self.render(message);
        for sink in &self.sinks {
            match self.send_to(sink, &text).await {
                Ok(()) => debug!(sink = %redacted(sink), "notification sent"),
                Err(err) => error!(sink = %redacted(sink), ?err, "unable to send notification"),
            }
        }
    }

    async fn send_to(&self, sink: &Url, text: &str) -> Result<(), NotificationError> {
        let payload = WebhookPayload {
            username: env!("CARGO_PKG_NAME"),
            text,
        };

        let response = self.client.post(sink.clone()).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(NotificationError::UnexpectedStatus(response.status()));
        }

        Ok(())
    }
}

// webhook paths usually carry the secret
fn redacted(url: &Url) -> String {
    format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[test]
    fn should_render_template() {
        let notifier = Notifier::new(Vec::new(), "[prod] {message}");
        assert_eq!(notifier.render("draining"), "[prod] draining");

        let notifier = Notifier::default();
        assert_eq!(notifier.render("draining"), "draining");

        let notifier = Notifier::new(Vec::new(), "[prod]");
        assert_eq!(notifier.render("draining"), "[prod] draining");
    }

    #[tokio::test]
    async fn should_post_to_every_sink() {
        let server = MockServer::start().await;
        let base = Url::parse(&server.uri()).unwrap();

        Mock::given(method("POST"))
            .and(path("/hooks/a"))
            .and(body_json(json!({
                "username": "scheduled-events-drain",
                "text": "[test] hello",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/hooks/b"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = Notifier::new(
            vec![
                base.join("/hooks/b").unwrap(),
                base.join("/hooks/a").unwrap(),
            ],
            "[test] {message}",
        );

        // the failing sink must not keep the other one from being notified
        notifier.send("hello").await;
    }
}
