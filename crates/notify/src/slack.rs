use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::{NotificationError, NotificationEvent, Notifier};

const SLACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct SlackPayload<'a> {
    text: &'a str,
    username: &'a str,
    icon_emoji: &'a str,
}

/// Posts events to a Slack incoming webhook.
pub struct SlackNotifier {
    http: reqwest::Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Result<Self, NotificationError> {
        let webhook_url = webhook_url.into();
        if webhook_url.trim().is_empty() {
            return Err(NotificationError::Config("empty Slack webhook URL".into()));
        }
        let http = reqwest::Client::builder().timeout(SLACK_TIMEOUT).build()?;
        Ok(Self { http, webhook_url })
    }
}

#[async_trait::async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &str { "slack" }

    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotificationError> {
        let text = event.message();
        let payload = SlackPayload { text: &text, username: "NodeReaper", icon_emoji: ":wastebasket:" };
        let resp = self.http.post(&self.webhook_url).json(&payload).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), %body, "slack webhook rejected payload");
            return Err(NotificationError::Rejected { status: status.as_u16(), body });
        }
        info!(node = %event.node.name, kind = ?event.kind, "sent Slack notification");
        Ok(())
    }
}
