//! Encoding of message content for the DATA phase (RFC 5321 §4.5.2).

/// Incrementally transforms message bytes into their DATA wire form.
///
/// Line endings are normalised to CRLF and any line starting with `.` gets
/// an extra leading `.`. Input may be fed in arbitrarily split chunks.
#[derive(Debug)]
pub struct DotStuffer {
    at_line_start: bool,
    last_was_cr: bool,
}

impl Default for DotStuffer {
    fn default() -> Self {
        Self {
            at_line_start: true,
            last_was_cr: false,
        }
    }
}

impl DotStuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the encoded form of `chunk` to `out`.
    pub fn encode(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        out.reserve(chunk.len() + chunk.len() / 32);

        for &byte in chunk {
            match byte {
                b'\n' => {
                    if !self.last_was_cr {
                        out.push(b'\r');
                    }
                    out.push(b'\n');
                    self.at_line_start = true;
                    self.last_was_cr = false;
                }
                _ => {
                    if self.at_line_start && byte == b'.' {
                        out.push(b'.');
                    }
                    out.push(byte);
                    self.at_line_start = false;
                    self.last_was_cr = byte == b'\r';
                }
            }
        }
    }

    /// Terminates the content, adding a final line break if needed and the
    /// `.` end-of-data marker.
    pub fn finish(self, out: &mut Vec<u8>) {
        if self.last_was_cr {
            out.push(b'\n');
        } else if !self.at_line_start {
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b".\r\n");
    }
}
