//! Helpers for the raw JSON string slices `serde-json-core` hands out.
//!
//! Borrowed string fields come back exactly as they appear on the wire, escapes included.
//! Action payloads are JSON documents embedded in a string, so they have to be un-escaped
//! before they can be parsed themselves.

use crate::Error;

/// Decodes the JSON escapes in `raw` into `buf` and returns the decoded text.
pub fn unescape<'b>(raw: &str, buf: &'b mut [u8]) -> Result<&'b str, Error> {
    let mut out = Writer { buf, len: 0 };
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c)?;
            continue;
        }

        let decoded = match chars.next().ok_or(Error::InvalidEscape)? {
            '"' => '"',
            '\\' => '\\',
            '/' => '/',
            'b' => '\u{8}',
            'f' => '\u{c}',
            'n' => '\n',
            'r' => '\r',
            't' => '\t',
            'u' => {
                let mut code = 0u32;
                for _ in 0..4 {
                    let digit = chars
                        .next()
                        .and_then(|d| d.to_digit(16))
                        .ok_or(Error::InvalidEscape)?;
                    code = code << 4 | digit;
                }
                char::from_u32(code).ok_or(Error::InvalidEscape)?
            }
            _ => return Err(Error::InvalidEscape),
        };
        out.push(decoded)?;
    }

    let Writer { buf, len } = out;
    let buf: &'b [u8] = buf;
    core::str::from_utf8(&buf[..len]).map_err(|_| Error::InvalidEscape)
}

struct Writer<'b> {
    buf: &'b mut [u8],
    len: usize,
}

impl Writer<'_> {
    fn push(&mut self, c: char) -> Result<(), Error> {
        let width = c.len_utf8();
        let end = self.len + width;
        if end > self.buf.len() {
            return Err(Error::BufferFull);
        }
        c.encode_utf8(&mut self.buf[self.len..end]);
        self.len = end;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_copied() {
        let mut buf = [0u8; 16];
        assert_eq!(unescape("hello", &mut buf), Ok("hello"));
    }

    #[test]
    fn embedded_document() {
        let mut buf = [0u8; 64];
        let raw = r#"{\"url\":\"http:\/\/host\/fw.bin\"}"#;
        assert_eq!(
            unescape(raw, &mut buf),
            Ok(r#"{"url":"http://host/fw.bin"}"#)
        );
    }

    #[test]
    fn unicode_escape() {
        let mut buf = [0u8; 16];
        assert_eq!(unescape(r"\u00b0C", &mut buf), Ok("°C"));
    }

    #[test]
    fn rejects_dangling_backslash() {
        let mut buf = [0u8; 16];
        assert_eq!(unescape("abc\\", &mut buf), Err(Error::InvalidEscape));
        assert_eq!(unescape(r"\q", &mut buf), Err(Error::InvalidEscape));
        assert_eq!(unescape(r"\u12", &mut buf), Err(Error::InvalidEscape));
    }

    #[test]
    fn output_must_fit() {
        let mut buf = [0u8; 4];
        assert_eq!(unescape("too long", &mut buf), Err(Error::BufferFull));
    }
}
