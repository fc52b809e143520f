//! Notification senders used by the worker

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use oncall_coordination::notify::{
    DeliveryReport, NotificationPayload, NotificationSender, NotifyError,
};

use crate::config::NotifyConfig;

/// Posts each page to an HTTP endpoint owned by the notification provider
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

/// Optional body of a 2xx response
#[derive(Debug, Deserialize)]
struct WebhookAck {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, config: &NotifyConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| NotifyError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
            token: config.webhook_token.clone(),
        })
    }
}

/// JSON body sent for one user
pub fn webhook_body(user_id: &str, payload: &NotificationPayload) -> serde_json::Value {
    json!({
        "userId": user_id,
        "incidentId": payload.incident_id,
        "title": payload.title,
        "message": payload.message,
        "escalationStep": payload.step,
        "channels": payload.channels.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
    })
}

/// Map a 2xx response body to a delivery report; an empty or foreign body counts as delivered
fn ack_report(body: &str) -> DeliveryReport {
    match serde_json::from_str::<WebhookAck>(body) {
        Ok(WebhookAck { success: false, error }) => {
            DeliveryReport::failed(error.unwrap_or_else(|| "provider reported failure".to_string()))
        }
        _ => DeliveryReport::delivered(),
    }
}

#[async_trait]
impl NotificationSender for WebhookNotifier {
    async fn send_user_notification(
        &self,
        user_id: &str,
        payload: &NotificationPayload,
    ) -> Result<DeliveryReport, NotifyError> {
        let mut request = self.client.post(&self.url).json(&webhook_body(user_id, payload));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status.is_success() {
            return Ok(ack_report(&body));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(NotifyError::NoContact(user_id.to_string()));
        }
        if status.is_client_error() {
            return Err(NotifyError::Rejected(format!("HTTP {status}: {body}")));
        }
        Err(NotifyError::Transport(format!("HTTP {status}: {body}")))
    }
}

/// Logs pages instead of sending them
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSender for LogNotifier {
    async fn send_user_notification(
        &self,
        user_id: &str,
        payload: &NotificationPayload,
    ) -> Result<DeliveryReport, NotifyError> {
        tracing::info!(
            user_id = %user_id,
            incident_id = %payload.incident_id,
            step = payload.step,
            "Page (no webhook configured): {}",
            payload.message
        );
        Ok(DeliveryReport::delivered())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oncall_coordination::NotificationChannel;

    fn payload() -> NotificationPayload {
        NotificationPayload {
            incident_id: "inc-42".into(),
            title: "Checkout 5xx".into(),
            message: "Escalation step 2: Checkout 5xx".into(),
            step: 1,
            channels: vec![NotificationChannel::Sms, NotificationChannel::Push],
        }
    }

    #[test]
    fn test_webhook_body_shape() {
        let body = webhook_body("u-7", &payload());
        assert_eq!(body["userId"], "u-7");
        assert_eq!(body["incidentId"], "inc-42");
        assert_eq!(body["escalationStep"], 1);
        assert_eq!(body["channels"], json!(["SMS", "PUSH"]));
    }

    #[test]
    fn test_ack_parsing() {
        assert!(ack_report("").success);
        assert!(ack_report("ok").success);
        assert!(ack_report(r#"{"success": true}"#).success);

        let failed = ack_report(r#"{"success": false, "error": "unverified phone"}"#);
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("unverified phone"));
    }

    #[test]
    fn test_webhook_notifier_builds() {
        let config = NotifyConfig {
            webhook_token: Some("secret".into()),
            ..Default::default()
        };
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/page", &config).unwrap();
        assert_eq!(notifier.token.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let config = NotifyConfig {
            timeout_secs: 1,
            ..Default::default()
        };
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/page", &config).unwrap();
        let err = notifier
            .send_user_notification("u-1", &payload())
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Transport(_)));
    }

    #[tokio::test]
    async fn test_log_notifier_always_delivers() {
        let report = LogNotifier
            .send_user_notification("u-1", &payload())
            .await
            .unwrap();
        assert!(report.success);
    }
}
