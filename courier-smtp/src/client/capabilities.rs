//! ESMTP extensions advertised in the EHLO reply.

use super::response::Response;

/// SASL mechanisms the client knows how to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    Plain,
    Login,
}

impl AuthMechanism {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

/// What the relay said it supports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub starttls: bool,
    pub auth: Vec<String>,
    pub size: Option<usize>,
    pub pipelining: bool,
}

impl Capabilities {
    /// Parses the EHLO reply. The first line is the relay's greeting and
    /// carries no extension.
    #[must_use]
    pub fn from_ehlo(response: &Response) -> Self {
        let mut caps = Self::default();

        for line in response.lines.iter().skip(1) {
            let mut parts = line.split_whitespace();
            let Some(keyword) = parts.next() else {
                continue;
            };

            match keyword.to_ascii_uppercase().as_str() {
                "STARTTLS" => caps.starttls = true,
                "PIPELINING" => caps.pipelining = true,
                "SIZE" => caps.size = parts.next().and_then(|s| s.parse().ok()),
                "AUTH" => {
                    for mechanism in parts.map(str::to_ascii_uppercase) {
                        if !caps.auth.contains(&mechanism) {
                            caps.auth.push(mechanism);
                        }
                    }
                }
                _ => {}
            }
        }

        caps
    }

    /// Picks the mechanism to authenticate with, preferring `PLAIN`.
    #[must_use]
    pub fn preferred_auth(&self) -> Option<AuthMechanism> {
        [AuthMechanism::Plain, AuthMechanism::Login]
            .into_iter()
            .find(|m| self.auth.iter().any(|offered| offered == m.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn ehlo(lines: &[&str]) -> Response {
        Response::new(250, lines.iter().map(ToString::to_string).collect())
    }

    #[test]
    fn test_parse_extensions() {
        let caps = Capabilities::from_ehlo(&ehlo(&[
            "relay.example.com Hello",
            "PIPELINING",
            "SIZE 35882577",
            "AUTH LOGIN PLAIN XOAUTH2",
            "starttls",
        ]));

        assert!(caps.starttls);
        assert!(caps.pipelining);
        assert_eq!(caps.size, Some(35_882_577));
        assert_eq!(caps.auth, vec!["LOGIN", "PLAIN", "XOAUTH2"]);
        assert_eq!(caps.preferred_auth(), Some(AuthMechanism::Plain));
    }

    #[test]
    fn test_greeting_line_is_not_an_extension() {
        let caps = Capabilities::from_ehlo(&ehlo(&["STARTTLS"]));
        assert!(!caps.starttls);
    }

    #[test]
    fn test_login_only() {
        let caps = Capabilities::from_ehlo(&ehlo(&["relay", "AUTH LOGIN"]));
        assert_eq!(caps.preferred_auth(), Some(AuthMechanism::Login));
    }

    #[test]
    fn test_no_supported_auth() {
        let caps = Capabilities::from_ehlo(&ehlo(&["relay", "AUTH CRAM-MD5"]));
        assert_eq!(caps.preferred_auth(), None);
    }
}
