use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

/// SASL mechanisms the client can authenticate with.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mechanism {
    #[default]
    Plain,
    Login,
}

impl Mechanism {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

/// The RFC 4616 initial response: `base64("\0user\0pass")`.
pub(super) fn plain_response(user: &str, pass: &str) -> String {
    STANDARD.encode(format!("\0{user}\0{pass}"))
}

pub(super) fn encode(value: &str) -> String {
    STANDARD.encode(value)
}
