/// `scripting/mail.rs` — SMTP delivery behind the `emailHostSMTP` global
///
/// A `MailHost` names an SMTP relay and optional credentials. With
/// credentials the connection is upgraded with STARTTLS and authenticated,
/// and the credential user is the sender. Without them the relay is reached
/// in plain text and sending fails for lack of a sender.
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    Message, SmtpTransport, Transport,
};

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),

    #[error("Email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("Email build error: {0}")]
    Build(String),

    #[error("No sender: emailHostSMTP needs auth with a user")]
    MissingSender,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpAuth {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct MailHost {
    host: String,
    auth: Option<SmtpAuth>,
}

impl MailHost {
    pub fn new(host: impl Into<String>, auth: Option<SmtpAuth>) -> Self {
        Self {
            host: host.into(),
            auth,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Content type defaults to `text/plain`.
    pub fn message(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        content_type: Option<&str>,
    ) -> Result<Message, MailError> {
        let auth = self.auth.as_ref().ok_or(MailError::MissingSender)?;
        let from: Mailbox = auth.user.parse()?;
        let content_type = match content_type {
            Some(raw) => ContentType::parse(raw).map_err(|e| MailError::Build(e.to_string()))?,
            None => ContentType::TEXT_PLAIN,
        };
        Message::builder()
            .from(from)
            .to(to.parse()?)
            .subject(subject)
            .header(content_type)
            .body(body.to_string())
            .map_err(|e| MailError::Build(e.to_string()))
    }

    fn transport(&self) -> Result<SmtpTransport, MailError> {
        let transport = match &self.auth {
            Some(auth) => SmtpTransport::starttls_relay(&self.host)?
                .credentials(Credentials::new(auth.user.clone(), auth.password.clone()))
                .build(),
            None => SmtpTransport::builder_dangerous(&self.host).build(),
        };
        Ok(transport)
    }

    pub fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        content_type: Option<&str>,
    ) -> Result<(), MailError> {
        let message = self.message(to, subject, body, content_type)?;
        self.transport()?.send(&message)?;
        log::info!("[script] Mail '{}' sent to {} via {}", subject, to, self.host);
        Ok(())
    }
}
