//! SMTP reply parsing and representation.

use std::fmt;

use super::error::{ClientError, Result};

/// A single line of an SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    /// The three digit reply code.
    pub code: u16,
    /// Whether this is the last line of a multi-line reply (`250 ` vs `250-`).
    pub is_last: bool,
    /// The text following the code and separator.
    pub message: String,
}

/// A complete, possibly multi-line, SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// The reply text with lines joined by newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    /// 2xx
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// 3xx, e.g. `354` after `DATA` or `334` during `AUTH`.
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    /// 4xx
    #[must_use]
    pub const fn is_temporary_error(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    /// 5xx
    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.is_temporary_error() || self.is_permanent_error()
    }

    /// Converts an error reply into a [`ClientError::SmtpError`].
    #[must_use]
    pub fn into_error(self) -> ClientError {
        if self.is_error() {
            ClientError::SmtpError {
                code: self.code,
                message: self.message(),
            }
        } else {
            ClientError::UnexpectedResponse {
                code: self.code,
                message: self.message(),
            }
        }
    }

    /// Parses a single reply line (without its line terminator).
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the line doesn't match SMTP format.
    pub fn parse_line(line: &str) -> Result<ResponseLine> {
        let Some(code_str) = line.get(..3) else {
            return Err(ClientError::ParseError(format!(
                "Response line too short: '{line}'"
            )));
        };

        let code = code_str
            .parse::<u16>()
            .map_err(|_| ClientError::ParseError(format!("Invalid status code: '{code_str}'")))?;

        let is_last = match line[3..].chars().next() {
            None | Some(' ') => true,
            Some('-') => false,
            Some(c) => {
                return Err(ClientError::ParseError(format!(
                    "Invalid separator character: '{c}'"
                )));
            }
        };

        let message = line.get(4..).unwrap_or_default().to_string();

        Ok(ResponseLine {
            code,
            is_last,
            message,
        })
    }

    /// Parses a complete reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes consumed, or `None` when the
    /// buffer does not yet hold a complete reply.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the reply is malformed.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut consumed = 0;
        let mut lines = Vec::new();
        let mut first_code = None;

        while let Some(newline) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + newline];
            consumed += newline + 1;

            let line = std::str::from_utf8(raw)?.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }

            let parsed = Self::parse_line(line)?;
            match first_code {
                Some(code) if code != parsed.code => {
                    return Err(ClientError::ParseError(format!(
                        "Status code mismatch in multi-line response: expected {code}, got {}",
                        parsed.code
                    )));
                }
                Some(_) => {}
                None => first_code = Some(parsed.code),
            }

            lines.push(parsed.message);

            if parsed.is_last {
                return Ok(first_code.map(|code| (Self::new(code, lines), consumed)));
            }
        }

        Ok(None)
    }
}

impl fmt::Display for Response {
    /// Formats the reply the way it appeared on the wire, one line per line
    /// of text, without the continuation markers.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lines.as_slice() {
            [] => write!(f, "{}", self.code),
            lines => {
                for (i, line) in lines.iter().enumerate() {
                    if i > 0 {
                        f.write_str("\n")?;
                    }
                    write!(f, "{} {line}", self.code)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_line() {
        let line = ResponseLine {
            code: 220,
            is_last: true,
            message: "smtp.example.com ESMTP".to_string(),
        };
        assert_eq!(
            Response::parse_line("220 smtp.example.com ESMTP").unwrap(),
            line
        );
    }

    #[test]
    fn test_parse_bare_code() {
        let line = Response::parse_line("250").unwrap();
        assert_eq!(line.code, 250);
        assert!(line.is_last);
        assert!(line.message.is_empty());
    }

    #[test]
    fn test_parse_invalid_separator() {
        assert!(Response::parse_line("250+OK").is_err());
        assert!(Response::parse_line("2x0 OK").is_err());
        assert!(Response::parse_line("25").is_err());
    }

    #[test]
    fn test_parse_multi_line_response() {
        let data = b"250-smtp.example.com\r\n250-AUTH PLAIN LOGIN\r\n250 STARTTLS\r\n";
        let (response, consumed) = Response::parse_response(data).unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(
            response.lines,
            vec!["smtp.example.com", "AUTH PLAIN LOGIN", "STARTTLS"]
        );
        assert_eq!(consumed, data.len());
    }

    #[test]
    fn test_parse_leaves_trailing_bytes() {
        let data = b"250 OK\r\n221 Bye\r\n";
        let (response, consumed) = Response::parse_response(data).unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(consumed, 8);
    }

    #[test]
    fn test_parse_incomplete_response() {
        let data = b"250-smtp.example.com\r\n250-SIZE";
        assert!(Response::parse_response(data).unwrap().is_none());
    }

    #[test]
    fn test_parse_code_mismatch() {
        let data = b"250-smtp.example.com\r\n251 OK\r\n";
        assert!(Response::parse_response(data).is_err());
    }

    #[test]
    fn test_classification() {
        assert!(Response::new(250, vec!["OK".to_string()]).is_success());
        assert!(Response::new(354, vec![]).is_intermediate());
        assert!(Response::new(451, vec![]).is_temporary_error());
        assert!(Response::new(550, vec![]).is_permanent_error());
        assert!(Response::new(550, vec![]).is_error());
    }

    #[test]
    fn test_into_error() {
        let err = Response::new(452, vec!["Insufficient storage".to_string()]).into_error();
        assert_eq!(err.code(), Some(452));
        assert!(matches!(err, ClientError::SmtpError { .. }));

        let err = Response::new(220, vec!["hello".to_string()]).into_error();
        assert!(matches!(err, ClientError::UnexpectedResponse { code: 220, .. }));
    }

    #[test]
    fn test_display() {
        let response = Response::new(250, vec!["2.0.0 OK: queued as 7F3A".to_string()]);
        assert_eq!(response.to_string(), "250 2.0.0 OK: queued as 7F3A");
    }
}
