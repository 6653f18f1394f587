// Outbound mail collaborator.
//
// Delivery itself is external; the engine only defines the seam and fans
// requests out through it. A relay endpoint can be configured; without one,
// sends are logged and acknowledged so development setups keep working.

use async_trait::async_trait;
use serde_json::json;

use crate::errors::{EngineError, EngineResult};

pub const WELCOME_SUBJECT: &str = "Welcome to Noble Clarity Engine";

pub fn welcome_body() -> String {
    "<div style=\"font-family: Arial, sans-serif; max-width: 600px; margin: 0 auto; padding: 20px; color: #333;\">\
        <h1 style=\"color: #2563EB;\">Welcome to the Engine!</h1>\
        <p>Hi there,</p>\
        <p>Your account has been successfully created. You can now access your Financial Intelligence Dashboard anytime.</p>\
        <p><strong>Next Steps:</strong></p>\
        <ul>\
            <li>Explore the Dashboard</li>\
            <li>Set up your financial goals</li>\
            <li>Ask the AI Coach for advice</li>\
        </ul>\
        <p>If you have any questions, feel free to reply to this email.</p>\
        <br>\
        <p>Cheers,</p>\
        <p>The Noble World Team</p>\
    </div>"
        .to_string()
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> EngineResult<()>;
}

/// Forwards each send to a configured HTTP relay.
pub struct RelayMailer {
    client: reqwest::Client,
    endpoint: String,
    from: String,
}

impl RelayMailer {
    pub fn new(endpoint: String, from: String) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| EngineError::Configuration(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            from,
        })
    }
}

#[async_trait]
impl MailTransport for RelayMailer {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> EngineResult<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({
                "from": self.from,
                "to": to,
                "subject": subject,
                "html": html_body,
            }))
            .send()
            .await
            .map_err(|e| EngineError::UpstreamProvider(format!("mail relay unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::UpstreamProvider(format!(
                "mail relay returned {status}: {body}"
            )));
        }
        tracing::info!(to, subject, "mail sent");
        Ok(())
    }
}

/// Fallback when no relay is configured: log and acknowledge.
pub struct LoggingMailer;

#[async_trait]
impl MailTransport for LoggingMailer {
    async fn send(&self, to: &str, subject: &str, _html_body: &str) -> EngineResult<()> {
        tracing::info!(to, subject, "mail relay not configured; logging send only");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relay_mailer_posts_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/send")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "to": "ada@example.com",
                "subject": WELCOME_SUBJECT,
            })))
            .with_status(200)
            .create_async()
            .await;

        let mailer = RelayMailer::new(format!("{}/send", server.url()), "noreply@example.com".into())
            .unwrap();
        mailer
            .send("ada@example.com", WELCOME_SUBJECT, &welcome_body())
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_relay_failure_is_upstream_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/send")
            .with_status(500)
            .create_async()
            .await;

        let mailer = RelayMailer::new(format!("{}/send", server.url()), "noreply@example.com".into())
            .unwrap();
        let err = mailer.send("x@example.com", "s", "b").await.unwrap_err();
        assert!(matches!(err, EngineError::UpstreamProvider(_)));
    }

    #[tokio::test]
    async fn test_logging_mailer_always_succeeds() {
        LoggingMailer.send("a@b.c", "s", "b").await.unwrap();
    }
}
