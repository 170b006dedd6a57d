//! SMTP dispatcher — async lettre transport with STARTTLS.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use lettermill_core::config::SmtpConfig;
use lettermill_core::error::{LettermillError, Result};
use lettermill_core::traits::EmailDispatcher;

/// Outbound SMTP mailer. One instance per process; the transport pools
/// connections internally.
pub struct SmtpMailer {
    config: SmtpConfig,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Result<Self> {
        let creds = Credentials::new(config.username.clone(), config.password.clone());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| LettermillError::Dispatch(format!("SMTP relay: {e}")))?
            .port(config.port)
            .credentials(creds)
            .build();
        Ok(Self { config, transport })
    }
}

#[async_trait]
impl EmailDispatcher for SmtpMailer {
    async fn send(&self, from: &str, to: &str, subject: &str, html: &str) -> Result<String> {
        let from_mailbox: Mailbox = from
            .parse()
            .map_err(|e| LettermillError::Dispatch(format!("Invalid from: {e}")))?;
        let to_mailbox: Mailbox = to
            .parse()
            .map_err(|e| LettermillError::Dispatch(format!("Invalid to: {e}")))?;

        let message_id = format!("<{}@lettermill>", uuid::Uuid::new_v4());
        let email = Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(subject)
            .message_id(Some(message_id.clone()))
            .header(ContentType::TEXT_HTML)
            .body(html.to_string())
            .map_err(|e| LettermillError::Dispatch(format!("Build email: {e}")))?;

        let timeout = std::time::Duration::from_secs(self.config.send_timeout_secs);
        match tokio::time::timeout(timeout, self.transport.send(email)).await {
            Ok(Ok(_)) => {
                tracing::info!("📤 Email sent to: {to}");
                Ok(message_id)
            }
            Ok(Err(e)) => Err(LettermillError::Dispatch(format!("SMTP send: {e}"))),
            Err(_) => Err(LettermillError::Dispatch(format!(
                "SMTP send timed out after {}s",
                self.config.send_timeout_secs
            ))),
        }
    }
}
