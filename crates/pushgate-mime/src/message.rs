//! Parsed message structure and the DATA-transcript parser.

use crate::content_type::ContentType;
use crate::encoding::{decode_base64_lenient, decode_quoted_printable};
use crate::error::{Error, Result};
use crate::header::Headers;
use std::fmt;

/// Transfer encoding types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEncoding {
    /// 7-bit ASCII.
    SevenBit,
    /// 8-bit binary.
    EightBit,
    /// Base64 encoding.
    Base64,
    /// Quoted-Printable encoding.
    QuotedPrintable,
    /// Binary (no encoding).
    Binary,
}

impl TransferEncoding {
    /// Parses transfer encoding from a header value.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "8bit" => Self::EightBit,
            "base64" => Self::Base64,
            "quoted-printable" => Self::QuotedPrintable,
            "binary" => Self::Binary,
            _ => Self::SevenBit, // Default (includes "7bit")
        }
    }
}

impl fmt::Display for TransferEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SevenBit => write!(f, "7bit"),
            Self::EightBit => write!(f, "8bit"),
            Self::Base64 => write!(f, "base64"),
            Self::QuotedPrintable => write!(f, "quoted-printable"),
            Self::Binary => write!(f, "binary"),
        }
    }
}

/// Content disposition of a body part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    /// Displayed inline (the default).
    #[default]
    Inline,
    /// Attached file.
    Attachment,
}

/// A decoded body part.
#[derive(Debug, Clone)]
pub struct Part {
    /// Content type of the part.
    pub content_type: ContentType,
    /// How the part is meant to be presented.
    pub disposition: Disposition,
    /// Declared filename for attachment parts.
    pub filename: Option<String>,
    /// Decoded body bytes.
    pub body: Vec<u8>,
}

impl Part {
    /// Returns true if this is an inline text/plain part.
    #[must_use]
    pub fn is_text(&self) -> bool {
        self.disposition == Disposition::Inline && self.content_type.is_text_plain()
    }

    /// Returns the body as UTF-8 text, replacing invalid sequences.
    #[must_use]
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A parsed mail message: header block plus ordered body parts.
///
/// A bare single-part message is represented as exactly one `text/plain`
/// part holding the raw body verbatim.
#[derive(Debug, Clone)]
pub struct Message {
    /// Message headers.
    pub headers: Headers,
    /// Ordered body parts.
    pub parts: Vec<Part>,
}

impl Message {
    /// Parses a raw DATA transcript into a structured message.
    ///
    /// The header block is split from the body at the first blank line and
    /// unfolded. Multipart bodies are recursively split on the declared
    /// boundary; each part's transfer encoding is decoded before storage.
    ///
    /// # Errors
    ///
    /// Returns an error when a declared multipart structure is missing its
    /// boundary, when no boundary delimiter appears in the body, or when an
    /// encoded body fails to decode.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let (header_text, body) = split_header_body(raw);
        let headers = Headers::parse(&header_text);

        let content_type = match headers.get("Content-Type") {
            Some(value) => ContentType::parse(value)?,
            None => ContentType::text_plain(),
        };

        let parts = if content_type.is_multipart() {
            let boundary = content_type.boundary().ok_or(Error::MissingBoundary)?;
            parse_multipart(body, boundary)?
        } else {
            let encoding = headers
                .get("Content-Transfer-Encoding")
                .map_or(TransferEncoding::SevenBit, TransferEncoding::parse);
            let (disposition, filename) = headers
                .get("Content-Disposition")
                .map_or((Disposition::Inline, None), parse_disposition);
            vec![Part {
                content_type,
                disposition,
                filename,
                body: decode_body(body, encoding)?,
            }]
        };

        Ok(Self { headers, parts })
    }

    /// Gets the Subject header.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.headers.get("Subject")
    }

    /// Returns the first inline text/plain part.
    #[must_use]
    pub fn text_part(&self) -> Option<&Part> {
        self.parts.iter().find(|p| p.is_text())
    }

    /// Returns the first attachment part.
    #[must_use]
    pub fn attachment(&self) -> Option<&Part> {
        self.parts
            .iter()
            .find(|p| p.disposition == Disposition::Attachment)
    }
}

/// Splits a transcript at the first blank line.
///
/// Both CRLF and bare-LF conventions are accepted; the body keeps its raw
/// bytes untouched.
fn split_header_body(raw: &[u8]) -> (String, &[u8]) {
    let crlf = find(raw, b"\r\n\r\n");
    let lf = find(raw, b"\n\n");

    match (crlf, lf) {
        (Some(c), Some(l)) if c + 2 <= l + 1 => split_at(raw, c + 2, c + 4),
        (Some(c), None) => split_at(raw, c + 2, c + 4),
        (_, Some(l)) => split_at(raw, l + 1, l + 2),
        (None, None) => (String::from_utf8_lossy(raw).into_owned(), &[]),
    }
}

fn split_at(raw: &[u8], header_end: usize, body_start: usize) -> (String, &[u8]) {
    (
        String::from_utf8_lossy(&raw[..header_end]).into_owned(),
        &raw[body_start..],
    )
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Splits a multipart body on its boundary and parses each segment.
///
/// Nested multipart segments are recursed into and their parts flattened
/// into the result, preserving order.
fn parse_multipart(body: &[u8], boundary: &str) -> Result<Vec<Part>> {
    let delimiter = format!("--{boundary}");
    let terminator = format!("--{boundary}--");

    let mut parts = Vec::new();
    let mut segment: Option<Vec<u8>> = None;

    for line in split_lines(body) {
        let text = String::from_utf8_lossy(line);
        let trimmed = text.trim_end();

        if trimmed == terminator {
            if let Some(seg) = segment.take() {
                parse_segment(&seg, &mut parts)?;
            }
            break;
        }

        if trimmed == delimiter {
            if let Some(seg) = segment.take() {
                parse_segment(&seg, &mut parts)?;
            }
            segment = Some(Vec::new());
            continue;
        }

        if let Some(seg) = segment.as_mut() {
            seg.extend_from_slice(line);
            seg.extend_from_slice(b"\r\n");
        }
    }

    // A multipart body without a single delimiter line is malformed.
    if parts.is_empty() && segment.is_none() {
        return Err(Error::InvalidMultipart(format!(
            "boundary {boundary:?} not found in body"
        )));
    }

    if let Some(seg) = segment {
        parse_segment(&seg, &mut parts)?;
    }

    Ok(parts)
}

/// Parses one segment between boundary delimiters into body parts.
fn parse_segment(segment: &[u8], parts: &mut Vec<Part>) -> Result<()> {
    let (header_text, body) = split_header_body(segment);
    let headers = Headers::parse(&header_text);

    let content_type = match headers.get("Content-Type") {
        Some(value) => ContentType::parse(value)?,
        None => ContentType::text_plain(),
    };

    if content_type.is_multipart() {
        let boundary = content_type.boundary().ok_or(Error::MissingBoundary)?;
        parts.extend(parse_multipart(body, boundary)?);
        return Ok(());
    }

    let encoding = headers
        .get("Content-Transfer-Encoding")
        .map_or(TransferEncoding::SevenBit, TransferEncoding::parse);
    let (disposition, filename) = headers
        .get("Content-Disposition")
        .map_or((Disposition::Inline, None), parse_disposition);

    parts.push(Part {
        content_type,
        disposition,
        filename,
        body: decode_body(trim_trailing_crlf(body), encoding)?,
    });
    Ok(())
}

/// Decodes a body per its declared transfer encoding.
fn decode_body(body: &[u8], encoding: TransferEncoding) -> Result<Vec<u8>> {
    match encoding {
        TransferEncoding::Base64 => decode_base64_lenient(&String::from_utf8_lossy(body)),
        TransferEncoding::QuotedPrintable => {
            decode_quoted_printable(&String::from_utf8_lossy(body))
        }
        _ => Ok(body.to_vec()),
    }
}

/// Parses a Content-Disposition value into kind and filename.
fn parse_disposition(value: &str) -> (Disposition, Option<String>) {
    let mut pieces = value.split(';');
    let kind = pieces.next().map_or("", str::trim);

    let disposition = if kind.eq_ignore_ascii_case("attachment") {
        Disposition::Attachment
    } else {
        Disposition::Inline
    };

    let filename = pieces.find_map(|param| {
        let (key, val) = param.trim().split_once('=')?;
        if key.trim().eq_ignore_ascii_case("filename") {
            Some(val.trim().trim_matches('"').to_string())
        } else {
            None
        }
    });

    (disposition, filename)
}

/// Splits bytes into lines, tolerating CRLF and bare LF, stripping the
/// terminators.
fn split_lines(body: &[u8]) -> impl Iterator<Item = &[u8]> {
    body.split(|&b| b == b'\n').map(|line| {
        if line.ends_with(b"\r") {
            &line[..line.len() - 1]
        } else {
            line
        }
    })
}

/// The final line of a segment ends with the CRLF that precedes the next
/// boundary delimiter; that CRLF belongs to the delimiter, not the body.
fn trim_trailing_crlf(body: &[u8]) -> &[u8] {
    if body.ends_with(b"\r\n") {
        &body[..body.len() - 2]
    } else if body.ends_with(b"\n") {
        &body[..body.len() - 1]
    } else {
        body
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::encoding::encode_base64;

    #[test]
    fn test_parse_bare_message_verbatim() {
        let raw = b"Subject: Test email\r\n\r\nThe quick brown fox jumps over the brown lazy dog.\r\n";
        let message = Message::parse(raw).unwrap();

        assert_eq!(message.subject(), Some("Test email"));
        assert_eq!(message.parts.len(), 1);
        let part = &message.parts[0];
        assert!(part.is_text());
        assert_eq!(
            part.body,
            b"The quick brown fox jumps over the brown lazy dog.\r\n"
        );
    }

    #[test]
    fn test_parse_headerless_body() {
        // No blank line at all: everything is headers, body is empty.
        let message = Message::parse(b"Subject: only\r\n").unwrap();
        assert_eq!(message.subject(), Some("only"));
        assert_eq!(message.parts[0].body, b"");
    }

    #[test]
    fn test_parse_bare_lf_message() {
        let raw = b"From: <lance@bikeleague.org>\nSubject: Test email\n\nThe wheels on the bike go round and round!\n";
        let message = Message::parse(raw).unwrap();

        assert_eq!(message.headers.get("From"), Some("<lance@bikeleague.org>"));
        assert_eq!(
            message.parts[0].body,
            b"The wheels on the bike go round and round!\n"
        );
    }

    #[test]
    fn test_parse_multipart_with_attachment() {
        let payload: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46];
        let raw = format!(
            "Subject: Test email\r\n\
             Content-Type: multipart/mixed; boundary=\"sep\"\r\n\
             \r\n\
             --sep\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             This email contains an attached image.\r\n\
             --sep\r\n\
             Content-Type: application/octet-stream\r\n\
             Content-Transfer-Encoding: base64\r\n\
             Content-Disposition: attachment; filename=BBridge.jpg\r\n\
             \r\n\
             {}\r\n\
             --sep--\r\n",
            encode_base64(payload)
        );

        let message = Message::parse(raw.as_bytes()).unwrap();
        assert_eq!(message.parts.len(), 2);

        let text = message.text_part().unwrap();
        assert_eq!(text.body, b"This email contains an attached image.");

        let attachment = message.attachment().unwrap();
        assert_eq!(attachment.disposition, Disposition::Attachment);
        assert_eq!(attachment.filename.as_deref(), Some("BBridge.jpg"));
        // Round trip: decoded bytes equal the pre-encoded payload exactly.
        assert_eq!(attachment.body, payload);
    }

    #[test]
    fn test_parse_multipart_quoted_filename() {
        let raw = b"Content-Type: multipart/mixed; boundary=b\r\n\
                    \r\n\
                    --b\r\n\
                    Content-Disposition: attachment; filename=\"two words.txt\"\r\n\
                    \r\n\
                    data\r\n\
                    --b--\r\n";
        let message = Message::parse(raw).unwrap();
        assert_eq!(
            message.attachment().unwrap().filename.as_deref(),
            Some("two words.txt")
        );
    }

    #[test]
    fn test_parse_nested_multipart_flattens() {
        let raw = b"Content-Type: multipart/mixed; boundary=outer\r\n\
                    \r\n\
                    --outer\r\n\
                    Content-Type: multipart/alternative; boundary=inner\r\n\
                    \r\n\
                    --inner\r\n\
                    Content-Type: text/plain\r\n\
                    \r\n\
                    plain body\r\n\
                    --inner\r\n\
                    Content-Type: text/html\r\n\
                    \r\n\
                    <p>html body</p>\r\n\
                    --inner--\r\n\
                    --outer--\r\n";
        let message = Message::parse(raw).unwrap();
        assert_eq!(message.parts.len(), 2);
        assert_eq!(message.text_part().unwrap().body, b"plain body");
    }

    #[test]
    fn test_parse_quoted_printable_part() {
        let raw = b"Content-Type: multipart/mixed; boundary=b\r\n\
                    \r\n\
                    --b\r\n\
                    Content-Type: text/plain\r\n\
                    Content-Transfer-Encoding: quoted-printable\r\n\
                    \r\n\
                    caf=C3=A9\r\n\
                    --b--\r\n";
        let message = Message::parse(raw).unwrap();
        assert_eq!(message.parts[0].body_text(), "café");
    }

    #[test]
    fn test_parse_missing_boundary_parameter() {
        let raw = b"Content-Type: multipart/mixed\r\n\r\nbody\r\n";
        assert!(matches!(
            Message::parse(raw),
            Err(Error::MissingBoundary)
        ));
    }

    #[test]
    fn test_parse_boundary_absent_from_body() {
        let raw = b"Content-Type: multipart/mixed; boundary=nope\r\n\r\nno delimiters here\r\n";
        assert!(matches!(
            Message::parse(raw),
            Err(Error::InvalidMultipart(_))
        ));
    }

    #[test]
    fn test_parse_bad_base64_part() {
        let raw = b"Content-Type: multipart/mixed; boundary=b\r\n\
                    \r\n\
                    --b\r\n\
                    Content-Transfer-Encoding: base64\r\n\
                    \r\n\
                    @@not base64@@\r\n\
                    --b--\r\n";
        assert!(matches!(Message::parse(raw), Err(Error::Base64Decode(_))));
    }

    #[test]
    fn test_transfer_encoding_parse() {
        assert_eq!(TransferEncoding::parse("7bit"), TransferEncoding::SevenBit);
        assert_eq!(TransferEncoding::parse("BASE64"), TransferEncoding::Base64);
        assert_eq!(
            TransferEncoding::parse("quoted-printable"),
            TransferEncoding::QuotedPrintable
        );
    }
}
