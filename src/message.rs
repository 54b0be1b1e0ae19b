//! Header inspection and mutation on raw message bytes.

use mailparse::{
    MailAddr, MailHeader, MailHeaderMap, ParsedContentDisposition, ParsedContentType, ParsedMail,
};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

/// Header carrying the archive id.
pub const AID: &str = "X-Archiver-ID";

/// Bodies shorter than this are refused as malformed.
pub const MIN_SIZE: usize = 8;

/// Headers that must occur at most once.
const CHECK_HEADERS: [&str; 7] = [
    "from",
    "to",
    "cc",
    "subject",
    "date",
    "message-id",
    "x-archiver-id",
];

/// Headers feeding the placeholder message id.
const HASH_HEADERS: [&str; 5] = ["message-id", "from", "to", "cc", "subject"];

/// The `(year, sequence)` pair a backend assigns to an archived message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArchiveId {
    pub year: i32,
    pub sequence: u64,
}

impl ArchiveId {
    pub fn new(year: i32, sequence: u64) -> Self {
        Self { year, sequence }
    }
}

impl fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.year, self.sequence)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid X-Archiver-ID value {0:?}")]
pub struct BadArchiveId(String);

impl FromStr for ArchiveId {
    type Err = BadArchiveId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || BadArchiveId(s.to_string());
        let (year, sequence) = s.trim().split_once('-').ok_or_else(bad)?;
        Ok(Self {
            year: year.trim().parse().map_err(|_| bad())?,
            sequence: sequence.trim().parse().map_err(|_| bad())?,
        })
    }
}

/// An attachment found while walking the MIME parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
}

/// Returns the first header that should be unique but occurs twice.
pub fn duplicate_header(headers: &[MailHeader]) -> Option<String> {
    let mut seen = Vec::new();
    for header in headers {
        let key = header.get_key().trim().to_lowercase();
        if CHECK_HEADERS.contains(&key.as_str()) {
            if seen.contains(&key) {
                return Some(key);
            }
            seen.push(key);
        }
    }
    None
}

/// The Message-ID header, or a digest of the identifying headers when absent.
pub fn message_id(headers: &[MailHeader]) -> String {
    if let Some(mid) = headers.get_first_value("Message-ID")
        && !mid.trim().is_empty()
    {
        return mid.trim().to_string();
    }

    let mut hasher = Sha256::new();
    for name in HASH_HEADERS {
        hasher.update(headers.get_first_value(name).unwrap_or_default().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Addresses listed in a header: `Ok(None)` when the header is absent.
pub fn header_addresses(
    headers: &[MailHeader],
    name: &str,
) -> Result<Option<Vec<String>>, mailparse::MailParseError> {
    let Some(header) = headers.get_first_header(name) else {
        return Ok(None);
    };
    let mut out = Vec::new();
    for addr in mailparse::addrparse_header(header)?.iter() {
        match addr {
            MailAddr::Single(single) => out.push(single.addr.clone()),
            MailAddr::Group(group) => out.extend(group.addrs.iter().map(|s| s.addr.clone())),
        }
    }
    Ok(Some(out))
}

/// Unix timestamp of the Date header, if it parses.
pub fn header_date(headers: &[MailHeader]) -> Option<i64> {
    headers
        .get_first_value("Date")
        .and_then(|date| mailparse::dateparse(&date).ok())
}

/// Byte range of every header field (continuation lines included), keyed by
/// lower-cased name, plus the offset where the header block ends.
fn header_fields(data: &[u8]) -> (Vec<(String, Range<usize>)>, usize) {
    let mut fields: Vec<(String, Range<usize>)> = Vec::new();
    let mut pos = 0;

    while let Some(rest) = data.get(pos..).filter(|r| !r.is_empty()) {
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .map_or(data.len(), |i| pos + i + 1);
        let line = rest.get(..end - pos).unwrap_or_default();

        if line == b"\n" || line == b"\r\n" {
            return (fields, pos);
        }
        if matches!(line.first(), Some(b' ' | b'\t')) {
            if let Some((_, range)) = fields.last_mut() {
                range.end = end;
            }
        } else {
            let name = line
                .split(|&b| b == b':')
                .next()
                .map(|n| String::from_utf8_lossy(n).trim().to_lowercase())
                .unwrap_or_default();
            fields.push((name, pos..end));
        }
        pos = end;
    }

    (fields, data.len())
}

/// Line ending used by the message, taken from its first line.
fn line_ending(data: &[u8]) -> &'static [u8] {
    match data.iter().position(|&b| b == b'\n') {
        Some(i) if i > 0 && data.get(i - 1) == Some(&b'\r') => b"\r\n",
        Some(_) => b"\n",
        None => b"\r\n",
    }
}

/// Rebuilds `data` without the given ranges, inserting `insert` at `at`.
fn splice(data: &[u8], remove: &[Range<usize>], at: usize, insert: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + insert.len());
    let mut pos = 0;
    let mut inserted = false;

    for range in remove {
        if !inserted && at <= range.start {
            out.extend_from_slice(data.get(pos..at).unwrap_or_default());
            out.extend_from_slice(insert);
            pos = at;
            inserted = true;
        }
        out.extend_from_slice(data.get(pos..range.start).unwrap_or_default());
        pos = range.end;
    }
    if !inserted {
        out.extend_from_slice(data.get(pos..at).unwrap_or_default());
        out.extend_from_slice(insert);
        pos = at;
    }
    out.extend_from_slice(data.get(pos..).unwrap_or_default());
    out
}

/// Sets `name` to `value`: the first occurrence is overwritten in place, any
/// other is dropped; without one the header is appended to the header block.
pub fn set_header(data: &[u8], name: &str, value: &str) -> Vec<u8> {
    let key = name.to_lowercase();
    let (fields, header_end) = header_fields(data);
    let eol = line_ending(data);

    let mut field = format!("{name}: {value}").into_bytes();
    field.extend_from_slice(eol);

    let occurrences: Vec<Range<usize>> = fields
        .into_iter()
        .filter(|(n, _)| *n == key)
        .map(|(_, range)| range)
        .collect();

    match occurrences.first() {
        Some(first) => splice(data, &occurrences, first.start, &field),
        None => {
            // headers without a final line break
            if header_end > 0 && !data.get(..header_end).unwrap_or_default().ends_with(b"\n") {
                let mut prefixed = eol.to_vec();
                prefixed.extend_from_slice(&field);
                return splice(data, &[], header_end, &prefixed);
            }
            splice(data, &[], header_end, &field)
        }
    }
}

/// Drops every occurrence of `name` from the header block.
pub fn remove_header(data: &[u8], name: &str) -> Vec<u8> {
    let key = name.to_lowercase();
    let (fields, _) = header_fields(data);
    let occurrences: Vec<Range<usize>> = fields
        .into_iter()
        .filter(|(n, _)| *n == key)
        .map(|(_, range)| range)
        .collect();
    let at = occurrences.first().map_or(0, |r| r.start);
    splice(data, &occurrences, at, b"")
}

/// Attachment named by a part's Content-Type or Content-Disposition parameters.
fn inspect(ctype: &ParsedContentType, disposition: &ParsedContentDisposition) -> Option<Attachment> {
    let param = |key: &str| {
        disposition
            .params
            .get(key)
            .or_else(|| ctype.params.get(key))
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    };
    let name = param("name").or_else(|| param("filename"))?.to_string();
    log::debug!("Found attachment: {name} - {}", ctype.mimetype);
    Some(Attachment {
        name,
        content_type: ctype.mimetype.clone(),
    })
}

fn collect_attachments(part: &ParsedMail, found: &mut Vec<Attachment>) {
    if part.subparts.is_empty() {
        found.extend(inspect(&part.ctype, &part.get_content_disposition()));
        return;
    }
    for subpart in &part.subparts {
        collect_attachments(subpart, found);
    }
}

/// Enumerates attachments. When the MIME structure does not parse, only the
/// top-level headers are inspected.
pub fn attachments(data: &[u8]) -> Vec<Attachment> {
    let mut found = Vec::new();
    match mailparse::parse_mail(data) {
        Ok(mail) => collect_attachments(&mail, &mut found),
        Err(e) => {
            log::warn!("Error in multipart splitting: {e}");
            if let Ok((headers, _)) = mailparse::parse_headers(data) {
                let ctype = mailparse::parse_content_type(
                    &headers.get_first_value("Content-Type").unwrap_or_default(),
                );
                let disposition = mailparse::parse_content_disposition(
                    &headers
                        .get_first_value("Content-Disposition")
                        .unwrap_or_default(),
                );
                found.extend(inspect(&ctype, &disposition));
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailparse::parse_headers;
    use rstest::rstest;
    use testresult::TestResult;

    const SIMPLE: &[u8] =
        b"Subject: hi\r\nFrom: a@x\r\nTo: b@y\r\nMessage-ID: <1>\r\n\r\nhello";

    #[rstest]
    #[case("2024-1", Some(ArchiveId::new(2024, 1)))]
    #[case(" 2006-34017 ", Some(ArchiveId::new(2006, 34017)))]
    #[case("2024", None)]
    #[case("year-1", None)]
    #[case("2024-", None)]
    fn test_parse_archive_id(#[case] input: &str, #[case] expected: Option<ArchiveId>) {
        assert_eq!(input.parse::<ArchiveId>().ok(), expected);
    }

    #[test]
    fn test_archive_id_display() {
        assert_eq!(ArchiveId::new(2024, 1).to_string(), "2024-1");
    }

    #[rstest]
    #[case(SIMPLE, None)]
    #[case(b"Message-ID: <1>\r\nmessage-id: <2>\r\n\r\nbody", Some("message-id"))]
    #[case(b"Received: a\r\nReceived: b\r\n\r\nbody", None)]
    #[case(b"X-Archiver-ID: 1-1\r\nX-Archiver-ID: 1-2\r\n\r\nbody", Some("x-archiver-id"))]
    fn test_duplicate_header(#[case] data: &[u8], #[case] expected: Option<&str>) -> TestResult {
        let (headers, _) = parse_headers(data)?;
        assert_eq!(duplicate_header(&headers).as_deref(), expected);
        Ok(())
    }

    #[test]
    fn test_message_id_placeholder_is_stable() -> TestResult {
        let (headers, _) = parse_headers(SIMPLE)?;
        assert_eq!(message_id(&headers), "<1>");

        let data = b"Subject: hi\r\nFrom: a@x\r\n\r\nhello";
        let (headers, _) = parse_headers(data)?;
        let first = message_id(&headers);
        assert_eq!(first.len(), 64);
        assert_eq!(first, message_id(&parse_headers(data)?.0));

        let (other, _) = parse_headers(b"Subject: bye\r\nFrom: a@x\r\n\r\nhello")?;
        assert_ne!(first, message_id(&other));
        Ok(())
    }

    #[test]
    fn test_header_addresses() -> TestResult {
        let (headers, _) = parse_headers(
            b"From: Alice <alice@example.org>\r\nTo: bob@example.org, Team: carol@example.org;\r\n\r\n",
        )?;
        assert_eq!(
            header_addresses(&headers, "From")?,
            Some(vec!["alice@example.org".to_string()])
        );
        assert_eq!(
            header_addresses(&headers, "To")?,
            Some(vec![
                "bob@example.org".to_string(),
                "carol@example.org".to_string()
            ])
        );
        assert_eq!(header_addresses(&headers, "Cc")?, None);
        Ok(())
    }

    #[test]
    fn test_set_header_appends() {
        assert_eq!(
            set_header(SIMPLE, AID, "2024-1"),
            b"Subject: hi\r\nFrom: a@x\r\nTo: b@y\r\nMessage-ID: <1>\r\nX-Archiver-ID: 2024-1\r\n\r\nhello"
        );
        assert_eq!(
            set_header(b"Subject: hi\n\nhello", AID, "1-2"),
            b"Subject: hi\nX-Archiver-ID: 1-2\n\nhello"
        );
        assert_eq!(
            set_header(b"Subject: hi", AID, "1-2"),
            b"Subject: hi\r\nX-Archiver-ID: 1-2\r\n"
        );
    }

    #[test]
    fn test_set_header_overwrites_single_occurrence() {
        let data = b"Subject: hi\r\nx-archiver-id: 1999-7\r\n  folded\r\nTo: b@y\r\n\r\nX-Archiver-ID: body";
        assert_eq!(
            set_header(data, AID, "2024-1"),
            b"Subject: hi\r\nX-Archiver-ID: 2024-1\r\nTo: b@y\r\n\r\nX-Archiver-ID: body"
        );
        let data = b"X-Archiver-ID: 1-1\r\nSubject: hi\r\nX-Archiver-ID: 1-2\r\n\r\nbody";
        assert_eq!(
            set_header(data, AID, "2024-1"),
            b"X-Archiver-ID: 2024-1\r\nSubject: hi\r\n\r\nbody"
        );
    }

    #[test]
    fn test_remove_header() {
        let data = b"X-Archiver-ID: 1-1\r\nSubject: hi\r\nX-Archiver-ID: 1-2\r\n\r\nX-Archiver-ID: body";
        assert_eq!(
            remove_header(data, AID),
            b"Subject: hi\r\n\r\nX-Archiver-ID: body"
        );
        assert_eq!(remove_header(SIMPLE, AID), SIMPLE);
    }

    #[test]
    fn test_attachments_single_part() {
        let data = b"Content-Type: application/pdf; name=\"report.pdf\"\r\n\r\n%PDF";
        assert_eq!(
            attachments(data),
            vec![Attachment {
                name: "report.pdf".into(),
                content_type: "application/pdf".into()
            }]
        );
        assert!(attachments(SIMPLE).is_empty());
    }

    #[test]
    fn test_attachments_multipart() {
        let data = b"Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
\r\n\
preamble\r\n\
--XYZ\r\n\
Content-Type: text/plain\r\n\
\r\n\
hello\r\n\
--XYZ\r\n\
Content-Type: application/octet-stream\r\n\
Content-Disposition: attachment; filename=data.bin\r\n\
\r\n\
binary\r\n\
--XYZ\r\n\
Content-Type: multipart/alternative; boundary=inner\r\n\
\r\n\
--inner\r\n\
Content-Type: image/png; name=logo.png\r\n\
\r\n\
png\r\n\
--inner--\r\n\
--XYZ--\r\n\
epilogue\r\n";
        assert_eq!(
            attachments(data),
            vec![
                Attachment {
                    name: "data.bin".into(),
                    content_type: "application/octet-stream".into()
                },
                Attachment {
                    name: "logo.png".into(),
                    content_type: "image/png".into()
                },
            ]
        );
    }

    #[test]
    fn test_attachments_tolerate_broken_parts() {
        let data = b"Content-Type: multipart/mixed; boundary=B\r\n\
\r\n\
--B\r\n\
Content-Type: text/plain; name=\r\n\
\r\n\
empty name\r\n\
--B\r\n\
Content-Type: text/plain; name=\"notes.txt\"\r\n\
\r\n\
notes\r\n\
--B--\r\n";
        assert_eq!(
            attachments(data),
            vec![Attachment {
                name: "notes.txt".into(),
                content_type: "text/plain".into()
            }]
        );
    }

    #[test]
    fn test_attachments_encoded_filename() {
        let data = b"Content-Type: multipart/mixed; boundary=B\r\n\
\r\n\
--B\r\n\
Content-Type: text/plain\r\n\
\r\n\
see attached\r\n\
--B\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename*=UTF-8''r%C3%A9sum%C3%A9.pdf\r\n\
\r\n\
%PDF\r\n\
--B--\r\n";
        assert_eq!(
            attachments(data),
            vec![Attachment {
                name: "r\u{e9}sum\u{e9}.pdf".into(),
                content_type: "application/pdf".into()
            }]
        );
    }

    #[test]
    fn test_attachments_from_disposition_only() {
        let data = b"Content-Type: application/octet-stream\r\n\
Content-Disposition: attachment; filename=\"annual report.txt\"\r\n\
\r\n\
data";
        assert_eq!(
            attachments(data),
            vec![Attachment {
                name: "annual report.txt".into(),
                content_type: "application/octet-stream".into()
            }]
        );
    }
}
