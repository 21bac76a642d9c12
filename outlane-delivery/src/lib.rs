//! Zone delivery engine for outbound mail
//!
//! Each configured zone runs a [`Lane`] of [`Sender`] workers. A worker:
//! - checks a delivery out of the queue authority
//! - waits for the zone's throttle
//! - resolves the route and negotiates a session (pool binding, STARTTLS
//!   with plaintext fallback, smart host AUTH)
//! - streams headers and body
//! - reports RELEASE, DEFER or RELEASE + BOUNCE back to the authority

pub mod binder;
pub mod body;
pub mod classifier;
pub mod config;
pub mod dns;
mod error;
pub mod hooks;
pub mod lane;
pub mod negotiator;
pub mod notice;
mod received;
mod response;
pub mod route;
pub mod sender;
pub mod signer;
pub mod throttle;

pub use body::{Body, BodyError, BodySource, FileBodySource, MemoryBodySource};
pub use classifier::{Action, Classification, MAX_DEFERRALS, classify, retry_delay};
pub use config::{
    AuthConfig, BounceConfig, ConfigError, DeliveryConfig, Interval, MailerDaemon, PoolAddress,
    SmtpTimeouts, Throttle, ZoneConfig,
};
pub use dns::{DnsConfig, DnsError, DnsResolver, Exchange, MailResolver};
pub use error::{DeliveryError, SenderError};
pub use hooks::{ConnectOptions, DeliveryHooks, NoHooks, Veto};
pub use lane::Lane;
pub use negotiator::{Negotiator, Session};
pub use notice::{BounceNotice, BounceNotifier, LogNotifier};
pub use received::received_header;
pub use response::format_smtp_response;
pub use route::RouteResolver;
pub use sender::{CloseHandle, Sender, Services, idle_backoff};
pub use signer::{NoopSigner, Signer, sign_delivery};
pub use throttle::{Admission, ThrottleGate};
