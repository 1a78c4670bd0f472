//! Message rendering on top of `lettre`'s RFC 5322 builder.
//!
//! `lettre` owns the MIME layout, transfer encodings, RFC 2047 encoded words
//! and header folding. This module only decides what goes into a
//! notification and refuses input that could never render legally.

use std::{error::Error as StdError, time::SystemTime};

use chrono::{DateTime, Utc};
use lettre::{
    Address,
    message::{
        Mailbox, Message as MimeMessage, MultiPart, SinglePart,
        header::{Header, HeaderName, HeaderValue},
    },
};
use ulid::Ulid;

use super::error::{ClientError, Result};

/// Longest line RFC 5322 allows, excluding the CRLF.
const MAX_LINE_LENGTH: usize = 998;

/// A fully rendered message, ready for `DATA`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The `Message-ID` header value, including angle brackets.
    pub message_id: String,
    pub content: String,
}

macro_rules! text_header {
    ($(#[$attr:meta])* $type:ident, $name:literal) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        struct $type(String);

        impl Header for $type {
            fn name() -> HeaderName {
                HeaderName::new_from_ascii_str($name)
            }

            fn parse(s: &str) -> std::result::Result<Self, Box<dyn StdError + Send + Sync>> {
                Ok(Self(s.to_string()))
            }

            fn display(&self) -> HeaderValue {
                HeaderValue::new(Self::name(), self.0.clone())
            }
        }
    };
}

text_header!(
    /// Names the software that produced the message.
    XMailer,
    "X-Mailer"
);

text_header!(
    /// Ties every attempt of one logical send together.
    XEmailId,
    "X-Email-ID"
);

/// Builder for notification messages.
///
/// A message with both a text and an HTML body is sent as
/// `multipart/alternative` with the text part first.
///
/// # Examples
///
/// ```
/// use courier_smtp::client::MessageBuilder;
///
/// let message = MessageBuilder::new()
///     .from("appointments@clinic.example")
///     .from_name("Clinic")
///     .to("patient@example.com")
///     .subject("Your appointment")
///     .text("See you on Tuesday.")
///     .build()
///     .unwrap();
///
/// assert!(message.content.contains("Subject: Your appointment\r\n"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    from: Option<String>,
    from_name: Option<String>,
    to: Vec<String>,
    subject: Option<String>,
    mailer: Option<String>,
    email_id: Option<String>,
    text: Option<String>,
    html: Option<String>,
    message_id: Option<String>,
    date: Option<DateTime<Utc>>,
}

impl MessageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the sender address.
    #[must_use]
    pub fn from(mut self, email: impl Into<String>) -> Self {
        self.from = Some(email.into());
        self
    }

    /// Sets the display name shown alongside the sender address.
    #[must_use]
    pub fn from_name(mut self, name: impl Into<String>) -> Self {
        self.from_name = Some(name.into());
        self
    }

    /// Adds a recipient to the To header.
    #[must_use]
    pub fn to(mut self, email: impl Into<String>) -> Self {
        self.to.push(email.into());
        self
    }

    /// Adds multiple recipients to the To header.
    #[must_use]
    pub fn to_multiple(mut self, emails: &[impl AsRef<str>]) -> Self {
        for email in emails {
            self.to.push(email.as_ref().to_string());
        }
        self
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Sets the `X-Mailer` header.
    #[must_use]
    pub fn mailer(mut self, mailer: impl Into<String>) -> Self {
        self.mailer = Some(mailer.into());
        self
    }

    /// Sets the `X-Email-ID` header.
    #[must_use]
    pub fn email_id(mut self, id: impl Into<String>) -> Self {
        self.email_id = Some(id.into());
        self
    }

    /// Sets the plain text body.
    #[must_use]
    pub fn text(mut self, content: impl Into<String>) -> Self {
        self.text = Some(content.into());
        self
    }

    /// Sets the HTML body.
    #[must_use]
    pub fn html(mut self, content: impl Into<String>) -> Self {
        self.html = Some(content.into());
        self
    }

    /// Overrides the generated `Message-ID`. Angle brackets are added when
    /// missing.
    #[must_use]
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Overrides the `Date` header, which otherwise is the time of `build`.
    #[must_use]
    pub const fn date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    /// Renders the message.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::BuilderError`] if the sender or every recipient
    /// is missing, an address is malformed, or a header value contains a
    /// line break or a word too long to fit on one line.
    pub fn build(self) -> Result<Message> {
        let from = self
            .from
            .as_deref()
            .ok_or_else(|| ClientError::BuilderError("Missing sender address".to_string()))?;
        let from_address = parse_address(from)?;

        if self.to.is_empty() {
            return Err(ClientError::BuilderError("No recipients".to_string()));
        }

        let message_id = match self.message_id {
            Some(id) if id.starts_with('<') => id,
            Some(id) => format!("<{id}>"),
            None => format!("<{}@{}>", Ulid::new(), from_address.domain()),
        };
        check_header_value("Message-ID", &message_id)?;

        let name = match self.from_name {
            Some(name) if !name.trim().is_empty() => {
                check_header_value("From", &name)?;
                Some(name)
            }
            _ => None,
        };

        let date = self.date.unwrap_or_else(Utc::now);
        let mut builder = MimeMessage::builder()
            .from(Mailbox::new(name, from_address))
            .date(SystemTime::from(date))
            .message_id(Some(message_id.clone()));

        for to in &self.to {
            builder = builder.to(Mailbox::new(None, parse_address(to)?));
        }

        if let Some(subject) = self.subject {
            check_header_value("Subject", &subject)?;
            builder = builder.subject(subject);
        }
        if let Some(mailer) = self.mailer {
            check_header_value("X-Mailer", &mailer)?;
            builder = builder.header(XMailer(mailer));
        }
        if let Some(email_id) = self.email_id {
            check_header_value("X-Email-ID", &email_id)?;
            builder = builder.header(XEmailId(email_id));
        }

        let message = match (self.text, self.html) {
            (Some(text), Some(html)) => {
                builder.multipart(MultiPart::alternative_plain_html(text, html))
            }
            (None, Some(html)) => builder.singlepart(SinglePart::html(html)),
            (text, None) => builder.singlepart(SinglePart::plain(text.unwrap_or_default())),
        }?;

        let content = String::from_utf8(message.formatted())
            .map_err(|e| ClientError::BuilderError(format!("Rendered message is not UTF-8: {e}")))?;

        Ok(Message {
            message_id,
            content,
        })
    }
}

/// Syntactic check on an envelope address. The relay has the final say.
#[must_use]
pub fn is_valid_address(address: &str) -> bool {
    address.parse::<Address>().is_ok()
}

fn parse_address(address: &str) -> Result<Address> {
    address
        .parse()
        .map_err(|e| ClientError::BuilderError(format!("Invalid address '{address}': {e}")))
}

/// Rejects values that would smuggle in extra headers, and ASCII words
/// that cannot be folded under the line limit.
fn check_header_value(name: &str, value: &str) -> Result<()> {
    if value.contains(['\r', '\n']) {
        return Err(ClientError::BuilderError(format!(
            "Header '{name}' contains a line break"
        )));
    }

    let limit = MAX_LINE_LENGTH - name.len() - 2;
    if value
        .split_whitespace()
        .any(|word| word.is_ascii() && word.len() > limit)
    {
        return Err(ClientError::BuilderError(format!(
            "Header '{name}' contains a word longer than {limit} characters"
        )));
    }

    Ok(())
}
