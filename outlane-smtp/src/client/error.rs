//! Error types for the SMTP client.

use std::io;

use thiserror::Error;

use super::response::Response;

/// Errors that can occur when talking to a remote SMTP server.
#[derive(Error, Debug)]
pub enum ClientError {
    /// IO error occurred during network operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to parse an SMTP response from the server.
    #[error("Failed to parse SMTP response: {0}")]
    ParseError(String),

    /// The server answered a command with a code the client cannot continue from.
    #[error("Unexpected SMTP status code: {code} - {message}")]
    UnexpectedResponse { code: u16, message: String },

    /// The TLS handshake (implicit or after STARTTLS) failed.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// The server refused the supplied credentials.
    #[error("Authentication failed: {code} - {message}")]
    AuthError { code: u16, message: String },

    /// Connection was closed unexpectedly.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// UTF-8 decoding error.
    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
}

impl ClientError {
    /// Wraps a reply the client could not continue from, keeping its wire form.
    #[must_use]
    pub fn unexpected(response: &Response) -> Self {
        Self::UnexpectedResponse {
            code: response.code,
            message: response.reply().get(4..).unwrap_or_default().to_string(),
        }
    }

    /// Returns `true` for failures that happened while negotiating TLS.
    ///
    /// These are the only failures after which retrying the same host in
    /// plaintext has a chance of succeeding.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::TlsError(_))
    }

    /// The SMTP reply carried by this error, if the server produced one.
    #[must_use]
    pub fn reply(&self) -> Option<String> {
        match self {
            Self::UnexpectedResponse { code, message } | Self::AuthError { code, message } => {
                Some(format!("{code} {message}"))
            }
            _ => None,
        }
    }
}

/// Specialized `Result` type for SMTP client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_errors_are_distinguished() {
        assert!(ClientError::TlsError("handshake eof".into()).is_tls());
        assert!(!ClientError::ConnectionClosed.is_tls());
        assert!(
            !ClientError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")).is_tls()
        );
    }

    #[test]
    fn reply_is_only_available_for_server_answers() {
        let auth = ClientError::AuthError {
            code: 535,
            message: "5.7.8 Authentication credentials invalid".into(),
        };
        assert_eq!(
            auth.reply().as_deref(),
            Some("535 5.7.8 Authentication credentials invalid")
        );
        assert_eq!(ClientError::ConnectionClosed.reply(), None);
    }

    #[test]
    fn unexpected_keeps_every_line_of_the_reply() {
        let response = Response::new(
            550,
            vec!["5.1.1 No such user".to_string(), "5.1.1 Try again".to_string()],
        );
        assert_eq!(
            ClientError::unexpected(&response).reply().as_deref(),
            Some("550 5.1.1 No such user\n550 5.1.1 Try again")
        );
    }
}
