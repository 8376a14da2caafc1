//! Mail submitters about failures and finished files

use crate::broker::Delivery;
use crate::config::NotifyConfig;
use crate::error::{StageError, StageResult};
use crate::service::{Stage, StageContext};
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use sda_common::messages::{InfoError, IngestionCompletion, SchemaName};
use std::sync::Arc;
use tracing::{info, instrument, warn};

const ERROR_TEMPLATE: &str = "Dear {user},

Processing of your submitted file {filepath} failed:

    {reason}

Please correct the problem and upload the file again.
";

const READY_TEMPLATE: &str = "Dear {user},

Your submitted file {filepath} has been archived and backed up.
";

/// Outgoing mail
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: String) -> StageResult<()>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &NotifyConfig) -> anyhow::Result<Self> {
        let from: Mailbox = config.from.parse()?;
        let transport = match (&config.user, &config.password) {
            (Some(user), Some(password)) => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
                .port(config.port)
                .credentials(Credentials::new(user.clone(), password.clone()))
                .build(),
            _ => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
                .port(config.port)
                .build(),
        };
        Ok(Self { transport, from })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, body: String) -> StageResult<()> {
        let to: Mailbox = to
            .parse()
            .map_err(|e| StageError::BadMessage(format!("recipient {to}: {e}")))?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| StageError::PermanentData(format!("mail not built: {e}")))?;
        self.transport
            .send(message)
            .await
            .map_err(|e| StageError::Notification(e.to_string()))?;
        Ok(())
    }
}

fn render(template: &str, user: &str, filepath: &str, reason: &str) -> String {
    template
        .replace("{user}", user)
        .replace("{filepath}", filepath)
        .replace("{reason}", reason)
}

pub struct Notify {
    mailer: Arc<dyn Mailer>,
    error_subject: String,
    ready_subject: String,
}

impl Notify {
    pub fn new(mailer: Arc<dyn Mailer>, config: &NotifyConfig) -> Self {
        Self {
            mailer,
            error_subject: config.errorsubject.clone(),
            ready_subject: config.readysubject.clone(),
        }
    }

    /// Subject, recipient and body for a delivery
    fn compose(&self, ctx: &StageContext, delivery: &Delivery) -> StageResult<(String, String, String)> {
        let value: serde_json::Value = serde_json::from_slice(&delivery.body)
            .map_err(|e| StageError::BadMessage(format!("not JSON: {e}")))?;

        if value.get("original-message").is_some() {
            let error: InfoError = ctx.decode(SchemaName::InfoError, delivery)?;
            let original = error
                .original_bytes()
                .ok()
                .and_then(|b| serde_json::from_slice::<serde_json::Value>(&b).ok());
            let field = |name: &str| {
                original
                    .as_ref()
                    .and_then(|o| o.get(name))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            let user = field("user");
            let body = render(ERROR_TEMPLATE, &user, &field("filepath"), &error.reason);
            Ok((self.error_subject.clone(), user, body))
        } else {
            let done: IngestionCompletion = ctx.decode(SchemaName::IngestionCompletion, delivery)?;
            let body = render(READY_TEMPLATE, &done.user, &done.filepath, "");
            Ok((self.ready_subject.clone(), done.user, body))
        }
    }
}

#[async_trait]
impl Stage for Notify {
    fn name(&self) -> &'static str {
        "notify"
    }

    #[instrument(name = "notify", skip_all)]
    async fn handle(&self, ctx: &StageContext, delivery: &Delivery) -> StageResult<()> {
        let (subject, recipient, body) = self.compose(ctx, delivery)?;
        if !recipient.contains('@') {
            warn!(user = %recipient, "User is not an email address, notification skipped");
            return Ok(());
        }
        self.mailer.send(&recipient, &subject, body).await?;
        info!(%recipient, %subject, "Notification sent");
        Ok(())
    }
}
