use anyhow::Context;
use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::AsyncSmtpTransport;
use lettre::AsyncTransport;
use lettre::Message;
use lettre::Tokio1Executor;
use secrecy::ExposeSecret;

use crate::configuration::EmailClientSettings;
use crate::configuration::SmtpTls;

/// Delivers one fully built MIME message. How it gets there (TLS, auth, SMTP
/// dialogue) is the implementation's business.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// The `From` mailbox. Fails if the transport is missing host, credentials
    /// or a usable sender address, in which case nothing should be sent.
    fn sender(&self) -> Result<Mailbox, anyhow::Error>;

    /// Send `message` to every address in its envelope.
    async fn send(
        &self,
        message: Message,
    ) -> Result<(), anyhow::Error>;
}

/// SMTP implementation of `MailTransport`, backed by a pooled lettre
/// transport. Establishing a connection is expensive, so a single client
/// should be built at startup and shared.
pub struct EmailClient {
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    sender: Result<Mailbox, String>,
    missing: Vec<&'static str>,
}

impl EmailClient {
    /// Fails only if the TLS parameters for `host` cannot be built. Missing
    /// host or credentials are tolerated here and reported by `sender`.
    pub fn from_settings(cfg: &EmailClientSettings) -> Result<Self, anyhow::Error> {
        let missing = cfg.missing_fields();
        let sender = cfg
            .sender_address()
            .parse::<Mailbox>()
            .map_err(|e| format!("invalid sender address {:?}: {e}", cfg.sender_address()));

        if !missing.is_empty() {
            tracing::warn!(
                missing = ?missing,
                "SMTP transport is not configured; dispatch will be refused"
            );
            return Ok(Self {
                transport: None,
                sender,
                missing,
            });
        }

        let builder = match cfg.tls {
            SmtpTls::Wrapper => AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host)
                .context("could not build TLS parameters for SMTP host")?,
            SmtpTls::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)
                .context("could not build STARTTLS parameters for SMTP host")?,
            SmtpTls::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&cfg.host),
        };

        let transport = builder
            .port(cfg.port)
            .credentials(Credentials::new(
                cfg.username.clone(),
                cfg.password.expose_secret().clone(),
            ))
            .timeout(Some(cfg.timeout()))
            .build();

        Ok(Self {
            transport: Some(transport),
            sender,
            missing,
        })
    }
}

#[async_trait]
impl MailTransport for EmailClient {
    fn sender(&self) -> Result<Mailbox, anyhow::Error> {
        if !self.missing.is_empty() {
            anyhow::bail!(
                "SMTP transport is not configured; missing {}",
                self.missing.join(", ")
            );
        }
        self.sender.clone().map_err(|e| anyhow::anyhow!(e))
    }

    #[tracing::instrument(name = "Sending message over SMTP", skip_all)]
    async fn send(
        &self,
        message: Message,
    ) -> Result<(), anyhow::Error> {
        let transport = self
            .transport
            .as_ref()
            .context("SMTP transport is not configured")?;
        let response = transport.send(message).await?;
        if !response.is_positive() {
            anyhow::bail!("SMTP server rejected the message: {:?}", response.code());
        }
        Ok(())
    }
}
