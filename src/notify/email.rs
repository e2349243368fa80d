// src/notify/email.rs
use std::sync::Arc;

use anyhow::{Context, Result};
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::{authentication::Credentials, AsyncSmtpTransport};
use lettre::{AsyncTransport, Tokio1Executor};

use super::registry::{ParamSpec, ProviderDescriptor, ProviderParams};
use super::Provider;
use crate::error::ProviderConfigError;

const PARAMS: &[ParamSpec] = &[
    ParamSpec::required("smtp_host", "SMTP relay host"),
    ParamSpec::optional("smtp_port", None, "Port; defaults to the TLS mode's standard port"),
    ParamSpec::optional("tls", Some("starttls"), "starttls | tls | none"),
    ParamSpec::optional("username", None, "SMTP login"),
    ParamSpec::optional("password", None, "SMTP password").secret(),
    ParamSpec::required("from", "Sender address"),
    ParamSpec::required("to", "Recipient address(es), comma separated"),
    ParamSpec::optional("subject_prefix", Some("[Moodle] "), "Prepended to every subject"),
];

pub fn descriptor() -> ProviderDescriptor {
    ProviderDescriptor {
        name: "email",
        description: "Sends a plain-text email over SMTP",
        params: PARAMS,
        build,
    }
}

fn build(p: &ProviderParams) -> Result<Arc<dyn Provider>, ProviderConfigError> {
    let host = p.require("smtp_host")?;
    let tls = p.get("tls").unwrap_or("starttls").to_ascii_lowercase();
    let mut builder = match tls.as_str() {
        "starttls" => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| p.invalid("smtp_host", e.to_string()))?,
        "tls" => AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .map_err(|e| p.invalid("smtp_host", e.to_string()))?,
        "none" => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
        other => return Err(p.invalid("tls", format!("unknown mode `{other}`"))),
    };
    if let Some(port) = p.get("smtp_port") {
        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| p.invalid("smtp_port", "expected a port number"))?;
        builder = builder.port(port);
    }
    match (p.get("username"), p.get("password")) {
        (Some(user), Some(pass)) => {
            builder = builder.credentials(Credentials::new(user.to_string(), pass.to_string()));
        }
        (None, None) => {}
        _ => {
            return Err(p.invalid("username", "username and password must be set together"));
        }
    }

    let from: Mailbox = p
        .require("from")?
        .parse()
        .map_err(|e: lettre::address::AddressError| p.invalid("from", e.to_string()))?;
    let to = p
        .list("to")
        .iter()
        .map(|a| a.parse::<Mailbox>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| p.invalid("to", e.to_string()))?;
    if to.is_empty() {
        return Err(ProviderConfigError::MissingParam {
            provider: p.provider().to_string(),
            param: "to".into(),
        });
    }

    Ok(Arc::new(EmailSender {
        mailer: builder.build(),
        from,
        to,
        subject_prefix: p.get("subject_prefix").unwrap_or_default().to_string(),
    }))
}

pub struct EmailSender {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
    subject_prefix: String,
}

impl EmailSender {
    fn compose(&self, subject: &str, message: &str, summary: Option<&str>) -> Result<Message> {
        let body = match summary {
            Some(s) => format!("Summary: {s}\n\n{message}\n"),
            None => format!("{message}\n"),
        };
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(format!("{}{}", self.subject_prefix, subject))
            .header(header::ContentType::TEXT_PLAIN);
        for rcpt in &self.to {
            builder = builder.to(rcpt.clone());
        }
        builder.body(body).context("build email")
    }
}

#[async_trait::async_trait]
impl Provider for EmailSender {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, subject: &str, message: &str, summary: Option<&str>) -> Result<bool> {
        let msg = self.compose(subject, message, summary)?;
        let rsp = self.mailer.send(msg).await.context("send email")?;
        Ok(rsp.is_positive())
    }
}
