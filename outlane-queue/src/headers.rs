//! Ordered, mutable message header list.

use serde::{Deserialize, Serialize};

/// One header as it appears in the message, possibly folded over several lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderLine {
    /// Lowercased header name, used for lookups.
    pub key: String,
    /// The full header text including the name, without the trailing CRLF.
    pub line: String,
}

impl HeaderLine {
    /// The header value: everything after the first colon, unfolded and trimmed.
    #[must_use]
    pub fn value(&self) -> String {
        let value = self
            .line
            .split_once(':')
            .map_or("", |(_, value)| value);

        value
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Message headers in wire order.
///
/// Headers are kept as raw lines so that signatures computed over them stay
/// valid. New trace headers (`Received`, `DKIM-Signature`) are prepended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers {
    lines: Vec<HeaderLine>,
}

impl Headers {
    #[must_use]
    pub const fn new() -> Self {
        Self { lines: Vec::new() }
    }

    /// Parses a raw header block.
    ///
    /// Parsing stops at the first empty line. Continuation lines (starting
    /// with whitespace) are folded into the preceding header.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut headers = Self::new();

        for line in raw.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                break;
            }

            if line.starts_with([' ', '\t']) {
                if let Some(last) = headers.lines.last_mut() {
                    last.line.push_str("\r\n");
                    last.line.push_str(line);
                }
                continue;
            }

            if let Some((key, _)) = line.split_once(':') {
                headers.lines.push(HeaderLine {
                    key: key.trim().to_ascii_lowercase(),
                    line: line.to_string(),
                });
            }
        }

        headers
    }

    /// Appends `Key: value`.
    pub fn add(&mut self, key: &str, value: &str) {
        self.lines.push(HeaderLine {
            key: key.to_ascii_lowercase(),
            line: format!("{key}: {value}"),
        });
    }

    /// Inserts an already formatted header line at `index` (clamped to the
    /// end of the list). Index 0 prepends.
    pub fn add_formatted(&mut self, key: &str, line: &str, index: usize) {
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        let index = index.min(self.lines.len());
        self.lines.insert(
            index,
            HeaderLine {
                key: key.to_ascii_lowercase(),
                line,
            },
        );
    }

    /// Removes every header named `key`.
    pub fn remove(&mut self, key: &str) {
        self.lines.retain(|header| !header.key.eq_ignore_ascii_case(key));
    }

    /// The value of the first header named `key`.
    #[must_use]
    pub fn get_first(&self, key: &str) -> Option<String> {
        self.lines
            .iter()
            .find(|header| header.key.eq_ignore_ascii_case(key))
            .map(HeaderLine::value)
    }

    /// The values of every header named `key`, in order.
    #[must_use]
    pub fn get_all(&self, key: &str) -> Vec<String> {
        self.lines
            .iter()
            .filter(|header| header.key.eq_ignore_ascii_case(key))
            .map(HeaderLine::value)
            .collect()
    }

    #[must_use]
    pub fn count(&self, key: &str) -> usize {
        self.lines
            .iter()
            .filter(|header| header.key.eq_ignore_ascii_case(key))
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderLine> {
        self.lines.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The header block as sent on the wire: every line CRLF terminated,
    /// followed by the empty separator line.
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.lines.iter().map(|h| h.line.len() + 2).sum::<usize>() + 2);
        for header in &self.lines {
            out.extend_from_slice(header.line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a HeaderLine;
    type IntoIter = std::slice::Iter<'a, HeaderLine>;

    fn into_iter(self) -> Self::IntoIter {
        self.lines.iter()
    }
}
