use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::SmtpConfig;
use crate::errors::{ConfigError, DeliveryError};
use crate::utils::notifier::DeliveryChannel;

const SMTP_TIMEOUT_SECS: u64 = 30;

/// Plain-text mail from the configured account to the recipient.
pub struct SmtpChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl SmtpChannel {
    pub fn new(config: &SmtpConfig) -> Result<Self, ConfigError> {
        let from: Mailbox = config
            .user
            .parse()
            .map_err(|e: lettre::address::AddressError| ConfigError::Invalid("SMTP_USER", e.to_string()))?;
        let to: Mailbox = config
            .recipient
            .parse()
            .map_err(|e: lettre::address::AddressError| ConfigError::Invalid("SMTP_RECIPIENT", e.to_string()))?;

        let builder = if config.tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| ConfigError::Invalid("SMTP_HOST", e.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };
        let transport = builder
            .port(config.port)
            .credentials(Credentials::new(config.user.clone(), config.password.clone()))
            .timeout(Some(Duration::from_secs(SMTP_TIMEOUT_SECS)))
            .build();

        Ok(Self { transport, from, to })
    }
}

#[async_trait]
impl DeliveryChannel for SmtpChannel {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn deliver(&self, title: &str, content: &str) -> Result<(), DeliveryError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(title)
            .header(ContentType::TEXT_PLAIN)
            .body(content.to_string())
            .map_err(|e| DeliveryError::Rejected(e.to_string()))?;

        match self.transport.send(message).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let code = e.status().and_then(|c| c.to_string().parse::<u16>().ok());
                classify_smtp_failure(code, &e.to_string())
            }
        }
    }
}

/// Maps an SMTP failure onto the retry policy.
///
/// Some providers answer QUIT with a garbage `\x00\x00\x00` reply after the message was accepted;
/// that and explicit "queued as <id>" replies count as delivered.
fn classify_smtp_failure(code: Option<u16>, message: &str) -> Result<(), DeliveryError> {
    let lower = message.to_ascii_lowercase();
    let queued = lower.contains("queued as") && !lower.contains("not queued");
    if lower.contains("\\x00\\x00\\x00") || message.contains("\0\0\0") || queued {
        return Ok(());
    }
    match code {
        Some(530 | 534 | 535) => Err(DeliveryError::Auth(message.to_string())),
        Some(c) if c >= 500 => Err(DeliveryError::Rejected(message.to_string())),
        _ => Err(DeliveryError::Transient(message.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_credentials_are_not_transient() {
        let outcome = classify_smtp_failure(Some(535), "535 Login Fail. Please enter your authorization code");
        assert!(matches!(outcome, Err(DeliveryError::Auth(_))));
    }

    #[test]
    fn connection_problems_are_transient() {
        assert!(matches!(
            classify_smtp_failure(None, "Connection error: connection reset by peer"),
            Err(DeliveryError::Transient(_))
        ));
        assert!(matches!(classify_smtp_failure(Some(421), "421 try later"), Err(DeliveryError::Transient(_))));
    }

    #[test]
    fn accepted_despite_error_counts_as_sent() {
        assert!(classify_smtp_failure(None, r"response error: b'\x00\x00\x00'").is_ok());
        assert!(classify_smtp_failure(Some(550), "550 Ok: queued as 1234").is_ok());
        assert!(matches!(
            classify_smtp_failure(Some(451), "transient error (451): 4.3.0 message not queued, try again later"),
            Err(DeliveryError::Transient(_))
        ));
    }

    #[test]
    fn permanent_rejection_is_reported() {
        assert!(matches!(
            classify_smtp_failure(Some(554), "554 message looks like spam"),
            Err(DeliveryError::Rejected(_))
        ));
    }

    #[test]
    fn invalid_addresses_fail_closed() {
        let config = SmtpConfig {
            host: "smtp.example.com".into(),
            port: 25,
            tls: false,
            user: "not an address".into(),
            password: "pw".into(),
            recipient: "me@example.com".into(),
        };
        assert!(matches!(SmtpChannel::new(&config), Err(ConfigError::Invalid("SMTP_USER", _))));
    }
}
