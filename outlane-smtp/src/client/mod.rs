//! Outbound SMTP client.
//!
//! [`SmtpClient`] is a thin, stateful session: each command method sends one
//! line and returns the parsed [`Response`], leaving policy (which replies
//! are fatal, when to fall back from EHLO to HELO) to the caller. Timeouts
//! are likewise applied by the caller around each step.
//!
//! ```no_run
//! use outlane_smtp::client::SmtpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SmtpClient::connect("192.0.2.10:25".parse()?, None, "mx.example.com").await?;
//! client.read_greeting().await?;
//! client.ehlo("mta.example.net").await?;
//! if client.supports("STARTTLS") {
//!     client.starttls().await?;
//!     client.ehlo("mta.example.net").await?;
//! }
//! client.mail_from("sender@example.net", None).await?;
//! client.rcpt_to("user@example.com").await?;
//! client.data().await?;
//! client.send_data("Subject: Hi\r\n\r\nHello\r\n").await?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod data;
mod error;
mod response;
mod smtp_client;
mod tls;

pub use auth::Mechanism;
pub use data::DotStuffer;
pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
pub use smtp_client::SmtpClient;
