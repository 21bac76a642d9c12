//! SMTP reply parsing and representation.

use super::error::{ClientError, Result};

/// A single line of an SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    /// The SMTP status code (e.g., 220, 250, 550).
    pub code: u16,
    /// Whether this is the last line in a multi-line reply.
    pub is_last: bool,
    /// The text following the status code and separator.
    pub message: String,
}

/// A complete, possibly multi-line, SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The SMTP status code.
    pub code: u16,
    /// The text of every line, without code or separator.
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

    /// The reply as it appeared on the wire, minus the CRLFs.
    ///
    /// ```text
    /// 550-5.1.1 The email account that you tried to reach does not exist.
    /// 550 5.1.1 Please try double-checking the recipient's address.
    /// ```
    #[must_use]
    pub fn reply(&self) -> String {
        let last = self.lines.len().saturating_sub(1);
        if self.lines.is_empty() {
            return self.code.to_string();
        }

        self.lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let separator = if i == last { ' ' } else { '-' };
                format!("{}{separator}{line}", self.code)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The RFC 3463 enhanced status code from the first line, if present.
    #[must_use]
    pub fn enhanced_code(&self) -> Option<&str> {
        let first = self.lines.first()?.split_whitespace().next()?;
        let mut parts = first.split('.');
        let class = parts.next()?;
        let valid = matches!(class, "2" | "4" | "5")
            && parts.clone().count() == 2
            && parts.all(|p| !p.is_empty() && p.len() <= 3 && p.bytes().all(|b| b.is_ascii_digit()));

        valid.then_some(first)
    }

    /// EHLO keywords advertised by the server (every line after the first).
    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().skip(1).map(String::as_str)
    }

    /// Whether an EHLO reply advertised the given extension keyword.
    #[must_use]
    pub fn has_extension(&self, keyword: &str) -> bool {
        self.extensions().any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|kw| kw.eq_ignore_ascii_case(keyword))
        })
    }

    /// Returns `true` for 2xx replies.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// Returns `true` for 3xx replies (e.g. 354 after DATA, 334 during AUTH).
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    /// Returns `true` for 4xx replies.
    #[must_use]
    pub const fn is_temporary_error(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    /// Returns `true` for 5xx replies.
    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.is_temporary_error() || self.is_permanent_error()
    }

    /// Parses a single reply line.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the line doesn't match SMTP format.
    pub fn parse_line(line: &str) -> Result<ResponseLine> {
        let code = line
            .get(..3)
            .filter(|code| code.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| ClientError::ParseError(format!("Invalid reply line: '{line}'")))?;

        let is_last = match line.as_bytes().get(3) {
            None | Some(b' ') => true,
            Some(b'-') => false,
            Some(c) => {
                return Err(ClientError::ParseError(format!(
                    "Invalid separator character: '{}'",
                    char::from(*c)
                )));
            }
        };

        Ok(ResponseLine {
            code,
            is_last,
            message: line.get(4..).unwrap_or_default().to_string(),
        })
    }

    /// Parses a complete reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes consumed, or `None` when
    /// more data is needed.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the reply is malformed.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut consumed = 0;
        let mut lines = Vec::new();
        let mut code = None;

        while let Some(end) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + end];
            consumed += end + 1;

            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }

            let parsed = Self::parse_line(std::str::from_utf8(raw)?)?;
            match code {
                Some(expected) if expected != parsed.code => {
                    return Err(ClientError::ParseError(format!(
                        "Status code mismatch in multi-line reply: expected {expected}, got {}",
                        parsed.code
                    )));
                }
                _ => code = Some(parsed.code),
            }

            lines.push(parsed.message);

            if parsed.is_last {
                return Ok(code.map(|code| (Self::new(code, lines), consumed)));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parse_single_line() {
        let line = ResponseLine {
            code: 220,
            is_last: true,
            message: "mx.example.com ESMTP".to_string(),
        };
        assert_eq!(Response::parse_line("220 mx.example.com ESMTP").unwrap(), line);
    }

    #[test]
    fn parse_continuation_marker() {
        let line = Response::parse_line("250-mx.example.com").unwrap();
        assert!(!line.is_last);
        assert_eq!(line.message, "mx.example.com");
    }

    #[test]
    fn bare_code_is_a_complete_line() {
        let line = Response::parse_line("250").unwrap();
        assert!(line.is_last);
        assert!(line.message.is_empty());
    }

    #[test]
    fn reject_garbage() {
        assert!(Response::parse_line("25").is_err());
        assert!(Response::parse_line("abc hello").is_err());
        assert!(Response::parse_line("250_nope").is_err());
    }

    #[test]
    fn parse_multi_line_reply() {
        let data = b"250-mx.example.com\r\n250-SIZE 10000000\r\n250 STARTTLS\r\n";
        let (response, consumed) = Response::parse_response(data).unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(
            response.lines,
            vec!["mx.example.com", "SIZE 10000000", "STARTTLS"]
        );
        assert_eq!(consumed, data.len());
        assert!(response.has_extension("starttls"));
        assert!(response.has_extension("SIZE"));
        assert!(!response.has_extension("AUTH"));
    }

    #[test]
    fn leaves_trailing_bytes_unconsumed() {
        let data = b"250 OK\r\n354 go";
        let (response, consumed) = Response::parse_response(data).unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(consumed, 8);
    }

    #[test]
    fn incomplete_reply_needs_more_data() {
        assert!(
            Response::parse_response(b"250-mx.example.com\r\n250-SIZE")
                .unwrap()
                .is_none()
        );
        assert!(Response::parse_response(b"").unwrap().is_none());
    }

    #[test]
    fn mismatched_codes_are_rejected() {
        assert!(Response::parse_response(b"250-one\r\n550 two\r\n").is_err());
    }

    #[test]
    fn reply_round_trips_wire_form() {
        let response = Response::new(
            550,
            vec!["5.1.1 User unknown".to_string(), "5.1.1 bad".to_string()],
        );
        assert_eq!(response.reply(), "550-5.1.1 User unknown\n550 5.1.1 bad");
        assert_eq!(response.enhanced_code(), Some("5.1.1"));
    }

    #[test]
    fn enhanced_code_requires_status_shape() {
        let plain = Response::new(250, vec!["OK queued".to_string()]);
        assert_eq!(plain.enhanced_code(), None);

        let version = Response::new(220, vec!["1.2.3 ready".to_string()]);
        assert_eq!(version.enhanced_code(), None);
    }

    #[test]
    fn classification_helpers() {
        assert!(Response::new(250, vec![]).is_success());
        assert!(Response::new(354, vec![]).is_intermediate());
        assert!(Response::new(451, vec![]).is_temporary_error());
        assert!(Response::new(550, vec![]).is_permanent_error());
        assert!(Response::new(550, vec![]).is_error());
        assert!(!Response::new(250, vec![]).is_error());
    }
}
