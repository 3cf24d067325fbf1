use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::exec::{CommandRunner, CommandSpec, RunnerError};
use crate::security::input::validate_email;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error(transparent)]
    Command(#[from] RunnerError),
}

/// A message handed to the local MTA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

fn has_line_break(value: &str) -> bool {
    value.contains('\r') || value.contains('\n')
}

impl OutboundMessage {
    /// Addresses must be valid and no header may smuggle in extra lines.
    pub fn validate(&self) -> Result<(), TransportError> {
        validate_email(&self.from).map_err(|e| TransportError::InvalidMessage(e.to_string()))?;
        validate_email(&self.to).map_err(|e| TransportError::InvalidMessage(e.to_string()))?;
        if has_line_break(&self.subject) {
            return Err(TransportError::InvalidMessage(
                "subject contains a line break".to_string(),
            ));
        }
        for (name, value) in &self.headers {
            let name_ok = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-');
            if !name_ok || has_line_break(value) {
                return Err(TransportError::InvalidMessage(format!(
                    "malformed header: {}",
                    name
                )));
            }
        }
        Ok(())
    }

    /// RFC 5322 text with CRLF-free line endings, as `sendmail -t` expects.
    pub fn to_rfc822(&self) -> String {
        let mut out = format!(
            "From: {}\nTo: {}\nSubject: {}\n",
            self.from, self.to, self.subject
        );
        for (name, value) in &self.headers {
            out.push_str(&format!("{}: {}\n", name, value));
        }
        out.push('\n');
        out.push_str(&self.body);
        if !self.body.ends_with('\n') {
            out.push('\n');
        }
        out
    }
}

/// Something that can deliver a message or report why it could not.
pub trait MailTransport: Send + Sync {
    fn send(
        &self,
        message: &OutboundMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Delivers through `sendmail -t -i`, the message on stdin.
#[derive(Debug, Clone)]
pub struct SendmailTransport {
    runner: CommandRunner,
}

impl SendmailTransport {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }
}

impl MailTransport for SendmailTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        message.validate()?;
        let spec = CommandSpec::new("sendmail")
            .args(["-t", "-i", "-f"])
            .arg(message.from.as_str())
            .stdin(message.to_rfc822());
        self.runner.run_checked(&spec).await?;
        debug!(from = %message.from, to = %message.to, "Handed message to MTA");
        Ok(())
    }
}
