//! Webhook notifier — POSTs a JSON completion notice to the task's channel.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::error::NotifyError;
use crate::notify::Notifier;
use crate::queue::model::DelegatedTask;
use crate::queue::state::TaskStatus;

/// Body of the completion notice.
#[derive(Debug, Serialize)]
struct Notice<'a> {
    task_id: String,
    status: TaskStatus,
    description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_id: Option<&'a str>,
}

/// Delivers notices over HTTP to the endpoint in `task.notify_channel`.
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, task: &DelegatedTask) -> Result<(), NotifyError> {
        let url = task.notify_channel.as_deref().ok_or(NotifyError::NoChannel)?;

        let notice = Notice {
            task_id: task.id.to_string(),
            status: task.status,
            description: &task.description,
            result: task.result.as_ref(),
            error: task.error.as_deref(),
            group_id: task.group_id.as_deref(),
        };

        let response = self
            .client
            .post(url)
            .json(&notice)
            .send()
            .await
            .map_err(|e| NotifyError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifyError::Rejected {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn terminal_task(notify_channel: Option<&str>) -> DelegatedTask {
        DelegatedTask {
            id: Uuid::new_v4(),
            description: "t".into(),
            context: None,
            status: TaskStatus::Completed,
            priority: 5,
            group_id: None,
            depends_on: Vec::new(),
            claimed_by: None,
            claimed_at: None,
            started_at: None,
            completed_at: Some(Utc::now()),
            available_at: None,
            retry_count: 0,
            max_retries: 3,
            result: Some(serde_json::json!({"ok": true})),
            error: None,
            notify_channel: notify_channel.map(String::from),
            notification_sent: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn missing_channel_is_rejected() {
        let notifier = WebhookNotifier::new();
        let err = notifier.notify(&terminal_task(None)).await.unwrap_err();
        assert!(matches!(err, NotifyError::NoChannel));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_http_error() {
        let notifier = WebhookNotifier::new();
        // Loopback discard port: refused fast, no real traffic leaves the host
        let task = terminal_task(Some("http://127.0.0.1:9/notify"));
        let err = notifier.notify(&task).await.unwrap_err();
        assert!(matches!(err, NotifyError::Http(_)));
    }

    #[test]
    fn notice_serializes_status_snake_case() {
        let task = terminal_task(Some("http://example.invalid"));
        let notice = Notice {
            task_id: task.id.to_string(),
            status: task.status,
            description: &task.description,
            result: task.result.as_ref(),
            error: None,
            group_id: None,
        };
        let json = serde_json::to_string(&notice).unwrap();
        assert!(json.contains("\"status\":\"completed\""));
        assert!(!json.contains("\"error\""));
    }
}
