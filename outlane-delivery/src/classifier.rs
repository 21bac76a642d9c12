//! Bounce classification
//!
//! Maps a failure response to a bounce category and decides whether the
//! delivery is retried later or rejected for good.

use std::{fmt, sync::LazyLock, time::Duration};

use regex::{Regex, RegexBuilder};

/// Deferrals allowed before a transient failure is escalated to a reject.
pub const MAX_DEFERRALS: u32 = 6;

/// Upper bound of the retry delay, in minutes.
const MAX_DELAY_MINUTES: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Retry later.
    Defer,
    /// Give up and notify the sender.
    Reject,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Defer => "defer",
            Self::Reject => "reject",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: &'static str,
    pub action: Action,
    pub message: &'static str,
}

struct Rule {
    category: &'static str,
    action: Action,
    message: &'static str,
    pattern: &'static str,
}

/// Checked in order; the first match wins.
const RULES: &[Rule] = &[
    Rule {
        category: "dns",
        action: Action::Defer,
        message: "Could not find a mail server for the recipient domain",
        pattern: r"can'?t find an mx|no mx records?|domain (name )?not found|nxdomain",
    },
    Rule {
        category: "connection-failure",
        action: Action::Defer,
        message: "Could not connect to the recipient's mail server",
        pattern: r"can'?t connect|connection (refused|reset|closed|timed out)|timed out|broken pipe|network is unreachable|no route to host|closed unexpectedly|io error|tls error",
    },
    Rule {
        category: "auth-failure",
        action: Action::Defer,
        message: "The smart host refused the zone's credentials",
        pattern: r"^authentication failed",
    },
    Rule {
        category: "greylisted",
        action: Action::Defer,
        message: "The recipient's server asked to try again later",
        pattern: r"greylist|graylist|try again later|^4\d\d[\s\-]+4\.7\.\d",
    },
    Rule {
        category: "quota-exceeded",
        action: Action::Defer,
        message: "The recipient's mailbox is full",
        pattern: r"quota|mailbox (is )?full|insufficient (system )?storage|\b[45]\.2\.2\b",
    },
    Rule {
        category: "spam-rejected",
        action: Action::Reject,
        message: "The message was rejected as spam",
        pattern: r"spam|junk|blacklist|blocklist|dnsbl|\brbl\b|reputation|blocked",
    },
    Rule {
        category: "mailbox-unavailable",
        action: Action::Reject,
        message: "The recipient's mailbox does not exist",
        pattern: r"user unknown|unknown user|no such (user|mailbox|recipient)|mailbox (not found|unavailable|does not exist)|recipient (address )?rejected|(address|account|user) does not exist|invalid recipient|\b5\.1\.[0-2]\b",
    },
    Rule {
        category: "message-too-large",
        action: Action::Reject,
        message: "The message exceeds the recipient's size limit",
        pattern: r"message (size )?(exceeds|too (big|large))|size limit|\b5\.3\.4\b",
    },
    Rule {
        category: "policy-rejected",
        action: Action::Reject,
        message: "The message was refused by the recipient's policy",
        pattern: r"policy|not authori[sz]ed|relay(ing)? (access )?denied|\b5\.7\.\d{1,3}\b",
    },
];

static COMPILED: LazyLock<Vec<(&'static Rule, Regex)>> = LazyLock::new(|| {
    RULES
        .iter()
        .filter_map(|rule| {
            RegexBuilder::new(rule.pattern)
                .case_insensitive(true)
                .build()
                .ok()
                .map(|regex| (rule, regex))
        })
        .collect()
});

/// A 4xx reply code, or a 4.x.x enhanced status right after the reply code.
static TRANSIENT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^\s*(4\d\d\b|\d{3}[\s\-]+4\.\d{1,3}\.\d{1,3}\b)").ok()
});

fn is_transient(response: &str) -> bool {
    TRANSIENT
        .as_ref()
        .is_some_and(|regex| regex.is_match(response))
}

const GENERIC_4XX: Classification = Classification {
    category: "generic-4xx",
    action: Action::Defer,
    message: "The recipient's server reported a temporary failure",
};

const GENERIC_5XX: Classification = Classification {
    category: "generic-5xx",
    action: Action::Reject,
    message: "The recipient's server reported a permanent failure",
};

const UNKNOWN: Classification = Classification {
    category: "unknown",
    action: Action::Defer,
    message: "Unrecognised failure",
};

/// The category and intrinsic action of `response`, ignoring retry history.
///
/// A reply the server marked as temporary is never an intrinsic reject, even
/// when its text matches a permanent category.
#[must_use]
pub fn category(response: &str) -> Classification {
    if let Some((rule, _)) = COMPILED.iter().find(|(_, regex)| regex.is_match(response)) {
        let action = if is_transient(response) {
            Action::Defer
        } else {
            rule.action
        };

        return Classification {
            category: rule.category,
            action,
            message: rule.message,
        };
    }

    match response.trim_start().as_bytes() {
        [b'4', b'0'..=b'9', b'0'..=b'9', ..] => GENERIC_4XX,
        [b'5', b'0'..=b'9', b'0'..=b'9', ..] => GENERIC_5XX,
        _ => UNKNOWN,
    }
}

/// Classifies a failure for a delivery that has already been deferred
/// `deferred_count` times.
///
/// Categories that are intrinsically permanent reject at once. Everything
/// else is deferred until it has been deferred more than [`MAX_DEFERRALS`]
/// times, and rejected after that.
#[must_use]
pub fn classify(response: &str, deferred_count: u32) -> Classification {
    let mut classification = category(response);
    if deferred_count > MAX_DEFERRALS {
        classification.action = Action::Reject;
    }
    classification
}

/// Retry delay for the next attempt: `min(5^(n+1), 1024)` minutes.
#[must_use]
pub fn retry_delay(deferred_count: u32) -> Duration {
    let minutes = deferred_count
        .checked_add(1)
        .and_then(|exp| 5u64.checked_pow(exp))
        .map_or(MAX_DELAY_MINUTES, |minutes| minutes.min(MAX_DELAY_MINUTES));

    Duration::from_secs(minutes * 60)
}
