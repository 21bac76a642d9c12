pub mod client;

pub use client::{ClientError, Mechanism, Response, SmtpClient};
