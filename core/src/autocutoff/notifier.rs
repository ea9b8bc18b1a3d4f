//! At-risk-of-liquidation email alert (spec.md §4.12 step 4).
//!
//! The alert notifier is a black-box external collaborator (spec.md §1
//! non-goal: "Email SMTP transport (alert notifier uses it as a black
//! box)"). [`LettreAlertNotifier`] is the one real implementation; tests
//! and `oms-admin` dry-runs use [`RecordingAlertNotifier`].

use crate::config::EmailConfig;
use crate::core::{EngineError, InfraError, UserType};
use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait AlertNotifier: Send + Sync {
    /// Sends the "at risk of liquidation" alert for one user. Implementations
    /// retry transiently failed sends internally (spec.md §4.12 step 4:
    /// "send one email alert ... with small retry/backoff"); the final
    /// `Err` means every retry was exhausted.
    async fn send_alert(
        &self,
        user_type: UserType,
        user_id: &str,
        margin_level: Decimal,
    ) -> Result<(), EngineError>;
}

/// Real SMTP sender, grounded in `original_source/.../autocutoff/notifier.py`
/// (one templated alert email per at-risk user, bounded retry).
pub struct LettreAlertNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    recipients: Vec<Mailbox>,
    max_attempts: u32,
}

impl LettreAlertNotifier {
    pub fn new(config: &EmailConfig) -> Result<Self, EngineError> {
        let host = config
            .smtp_host
            .clone()
            .ok_or_else(|| EngineError::Infra(InfraError::Email("EMAIL_SMTP_HOST not configured".to_string())))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&host)
            .map_err(|e| EngineError::Infra(InfraError::Email(e.to_string())))?
            .port(config.smtp_port);

        if let (Some(user), Some(password)) = (&config.smtp_user, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }

        let from: Mailbox = config
            .from_address
            .parse()
            .map_err(|e| EngineError::Infra(InfraError::Email(format!("invalid from_address: {e}"))))?;

        let recipients = config
            .alert_recipients
            .iter()
            .map(|addr| {
                addr.parse::<Mailbox>()
                    .map_err(|e| EngineError::Infra(InfraError::Email(format!("invalid recipient {addr}: {e}"))))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            transport: builder.build(),
            from,
            recipients,
            max_attempts: 3,
        })
    }

    fn build_message(&self, user_type: UserType, user_id: &str, margin_level: Decimal) -> Result<Vec<Message>, EngineError> {
        let subject = format!("Margin alert: {user_type}:{user_id} at {margin_level}%");
        let body = format!(
            "Account {user_type}:{user_id} has dropped to a margin level of {margin_level}%.\n\
             This is below the account's auto-cutoff threshold; forced liquidation begins at \
             the configured auto-liquidation level if the level does not recover.",
        );

        self.recipients
            .iter()
            .map(|to| {
                Message::builder()
                    .from(self.from.clone())
                    .to(to.clone())
                    .subject(subject.clone())
                    .body(body.clone())
                    .map_err(|e| EngineError::Infra(InfraError::Email(e.to_string())))
            })
            .collect()
    }
}

#[async_trait]
impl AlertNotifier for LettreAlertNotifier {
    async fn send_alert(
        &self,
        user_type: UserType,
        user_id: &str,
        margin_level: Decimal,
    ) -> Result<(), EngineError> {
        let messages = self.build_message(user_type, user_id, margin_level)?;

        let mut attempt = 0u32;
        let mut delay = Duration::from_millis(250);
        loop {
            attempt += 1;
            let mut failed = false;
            for message in &messages {
                if let Err(e) = self.transport.send(message.clone()).await {
                    warn!(error = %e, attempt, user_id, "autocutoff alert email send failed");
                    failed = true;
                    break;
                }
            }
            if !failed {
                debug!(user_id, %margin_level, "autocutoff alert email sent");
                return Ok(());
            }
            if attempt >= self.max_attempts {
                return Err(EngineError::Infra(InfraError::Email(format!(
                    "failed to send alert after {attempt} attempts"
                ))));
            }
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
}

/// In-memory sink for tests and `oms-admin` dry-runs.
#[derive(Default)]
pub struct RecordingAlertNotifier {
    pub sent: tokio::sync::Mutex<Vec<(UserType, String, Decimal)>>,
}

#[async_trait]
impl AlertNotifier for RecordingAlertNotifier {
    async fn send_alert(
        &self,
        user_type: UserType,
        user_id: &str,
        margin_level: Decimal,
    ) -> Result<(), EngineError> {
        self.sent
            .lock()
            .await
            .push((user_type, user_id.to_string(), margin_level));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn recording_notifier_captures_alert() {
        let notifier = RecordingAlertNotifier::default();
        notifier
            .send_alert(UserType::Live, "42", dec!(35))
            .await
            .unwrap();
        let sent = notifier.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "42");
    }
}
