//! Single-line rendering of SMTP replies for logs and bounce notifications

use std::sync::LazyLock;

use regex::Regex;

/// Reply code, separator and optional enhanced status code at a line start.
static REPLY_PREFIX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?m)^\d{3}[\s\-]+([\d\.]+\s*)?").ok());

static WHITESPACE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\s+").ok());

/// Flattens a possibly multi-line reply into one line.
///
/// The first reply prefix (`550-5.1.1 `) is kept, every later one is replaced
/// by a space and runs of whitespace are collapsed.
///
/// ```
/// use outlane_delivery::format_smtp_response;
///
/// assert_eq!(
///     format_smtp_response("550-5.1.1 User unknown\n550 5.1.1 bad"),
///     "550-5.1.1 User unknown bad"
/// );
/// ```
#[must_use]
pub fn format_smtp_response(reply: &str) -> String {
    let joined = REPLY_PREFIX.as_ref().map_or_else(
        || reply.to_string(),
        |prefix| {
            let (head, rest) = prefix
                .find(reply)
                .filter(|found| found.start() == 0)
                .map_or(("", reply), |found| reply.split_at(found.end()));
            format!("{head}{}", prefix.replace_all(rest, " "))
        },
    );

    WHITESPACE
        .as_ref()
        .map_or_else(
            || joined.split_whitespace().collect::<Vec<_>>().join(" "),
            |whitespace| whitespace.replace_all(&joined, " ").into_owned(),
        )
        .trim()
        .to_string()
}
