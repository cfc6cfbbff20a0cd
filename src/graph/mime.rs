//-
// Copyright (c) 2025, Jason Lingle
//
// This file is part of Graphgate.
//
// Graphgate is free software: you can  redistribute it and/or modify it under
// the terms  of the GNU General  Public License as published  by the Free
// Software Foundation, either version 3 of  the License, or (at your option)
// any later version.
//
// Graphgate is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY;  without even the  implied warranty of  MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Graphgate. If not, see <http://www.gnu.org/licenses/>.

//! A minimal MIME reader for the chunked-upload send path.
//!
//! Graph's raw-MIME `sendMail` endpoint takes the message bit-for-bit, so
//! the small-message path never comes here. Large messages must be
//! decomposed into a draft (subject, body, recipients) plus individual
//! attachments for upload sessions, which requires just enough MIME
//! understanding: header unfolding, one content-type parameter parser, a
//! multipart walk, and base64/quoted-printable transfer decoding.
//!
//! A part is an attachment when its disposition says so, or when it has a
//! Content-ID and no disposition (an inline image). The first text/html
//! part becomes the HTML body, else the first text/plain part becomes the
//! text body.

use lazy_static::lazy_static;
use regex::Regex;

use crate::support::error::Error;

const MAX_MULTIPART_DEPTH: u8 = 8;

#[derive(Debug, Clone, Default)]
pub struct Message {
    pub subject: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    /// True when `body` is HTML.
    pub html: bool,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub content_id: Option<String>,
    pub data: Vec<u8>,
}

lazy_static! {
    static ref RX_PARAM: Regex = Regex::new(
        r#"(?i);\s*([a-z0-9_-]+)\s*=\s*(?:"([^"]*)"|([^;\s]+))"#
    )
    .unwrap();
    static ref RX_ADDR: Regex = Regex::new(
        r"<([^<>\s]+@[^<>\s]+)>|([A-Za-z0-9._%+=-]+@[A-Za-z0-9.-]+)"
    )
    .unwrap();
}

impl Message {
    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        let (header_block, body) = split_message(raw);
        let headers = parse_headers(header_block);

        let mut message = Message {
            subject: header(&headers, "Subject").unwrap_or("").to_owned(),
            to: addresses(header(&headers, "To").unwrap_or("")),
            cc: addresses(header(&headers, "Cc").unwrap_or("")),
            bcc: addresses(header(&headers, "Bcc").unwrap_or("")),
            ..Message::default()
        };
        let mut text_body = None::<String>;
        let mut html_body = None::<String>;

        walk(
            &headers,
            body,
            &mut message,
            &mut text_body,
            &mut html_body,
            0,
        )?;

        if let Some(html) = html_body {
            message.html = true;
            message.body = html;
        } else {
            message.body = text_body.unwrap_or_default();
        }
        Ok(message)
    }
}

/// Split a message or part into its header block and body.
fn split_message(raw: &[u8]) -> (&[u8], &[u8]) {
    let mut ix = 0;
    while let Some(eol) = memchr::memchr(b'\n', &raw[ix..]) {
        let line_start = ix;
        ix += eol + 1;
        let line = &raw[line_start..ix];
        if b"\r\n" == line || b"\n" == line {
            return (&raw[..line_start], &raw[ix..]);
        }
    }
    (raw, &[])
}

/// Parse a header block into (name, value) pairs, unfolding continuation
/// lines.
fn parse_headers(block: &[u8]) -> Vec<(String, String)> {
    let mut headers = Vec::<(String, String)>::new();
    for raw_line in block.split(|&b| b'\n' == b) {
        let line = String::from_utf8_lossy(
            raw_line.strip_suffix(b"\r").unwrap_or(raw_line),
        );
        if line.is_empty() {
            continue;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(&mut (_, ref mut value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
        } else if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_owned(), value.trim().to_owned()));
        }
    }
    headers
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|&&(ref n, _)| n.eq_ignore_ascii_case(name))
        .map(|&(_, ref v)| v.as_str())
}

/// Extract the value of a `name=value` parameter from a structured header.
fn mime_param(value: &str, name: &str) -> Option<String> {
    for cap in RX_PARAM.captures_iter(value) {
        if cap.get(1).unwrap().as_str().eq_ignore_ascii_case(name) {
            return cap
                .get(2)
                .or_else(|| cap.get(3))
                .map(|m| m.as_str().to_owned());
        }
    }
    None
}

fn addresses(value: &str) -> Vec<String> {
    RX_ADDR
        .captures_iter(value)
        .filter_map(|cap| cap.get(1).or_else(|| cap.get(2)))
        .map(|m| m.as_str().to_owned())
        .collect()
}

fn content_type(headers: &[(String, String)]) -> String {
    header(headers, "Content-Type")
        .unwrap_or("text/plain")
        .split(';')
        .next()
        .unwrap_or("text/plain")
        .trim()
        .to_ascii_lowercase()
}

fn walk(
    headers: &[(String, String)],
    body: &[u8],
    message: &mut Message,
    text_body: &mut Option<String>,
    html_body: &mut Option<String>,
    depth: u8,
) -> Result<(), Error> {
    if depth > MAX_MULTIPART_DEPTH {
        return Err(Error::BadMime("multipart nesting too deep"));
    }

    let ctype = content_type(headers);
    if ctype.starts_with("multipart/") {
        let ct_header = header(headers, "Content-Type").unwrap_or("");
        let boundary = mime_param(ct_header, "boundary")
            .ok_or(Error::BadMime("multipart part without a boundary"))?;
        for part in split_multipart(body, &boundary) {
            let (part_headers, part_body) = split_message(part);
            let part_headers = parse_headers(part_headers);
            walk(
                &part_headers,
                part_body,
                message,
                text_body,
                html_body,
                depth + 1,
            )?;
        }
        return Ok(());
    }

    let disposition = header(headers, "Content-Disposition")
        .map(|d| {
            d.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
        })
        .unwrap_or_default();
    let content_id = header(headers, "Content-ID")
        .map(|id| id.trim().trim_matches(|c| '<' == c || '>' == c).to_owned());
    let data = decode_transfer(
        header(headers, "Content-Transfer-Encoding").unwrap_or(""),
        body,
    );

    if "attachment" == disposition
        || (disposition.is_empty() && content_id.is_some())
    {
        let name = header(headers, "Content-Disposition")
            .and_then(|d| mime_param(d, "filename"))
            .or_else(|| {
                header(headers, "Content-Type")
                    .and_then(|ct| mime_param(ct, "name"))
            })
            .or_else(|| content_id.clone())
            .unwrap_or_else(|| "attachment".to_owned());
        message.attachments.push(Attachment {
            name,
            content_type: ctype,
            content_id,
            data,
        });
    } else if "text/html" == ctype {
        if html_body.is_none() {
            *html_body = Some(String::from_utf8_lossy(&data).into_owned());
        }
    } else if ctype.starts_with("text/") {
        if text_body.is_none() {
            *text_body = Some(String::from_utf8_lossy(&data).into_owned());
        }
    }

    Ok(())
}

/// Split a multipart body into its parts, excluding preamble and epilogue.
fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delimiter = format!("--{boundary}");
    let mut parts = Vec::new();
    let mut current_start = None::<usize>;
    let mut ix = 0;

    while ix <= body.len() {
        let eol = memchr::memchr(b'\n', &body[ix..])
            .map(|e| ix + e + 1)
            .unwrap_or(body.len());
        let line = &body[ix..eol];
        let trimmed = trim_line(line);

        if trimmed == delimiter.as_bytes()
            || trimmed == format!("{delimiter}--").as_bytes()
        {
            if let Some(start) = current_start {
                // The CRLF before the delimiter belongs to the delimiter.
                let mut end = ix;
                if end > start && b'\n' == body[end - 1] {
                    end -= 1;
                    if end > start && b'\r' == body[end - 1] {
                        end -= 1;
                    }
                }
                parts.push(&body[start..end]);
            }
            current_start = if trimmed.ends_with(b"--") {
                None
            } else {
                Some(eol)
            };
        }

        if eol >= body.len() {
            break;
        }
        ix = eol;
    }

    parts
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn decode_transfer(encoding: &str, body: &[u8]) -> Vec<u8> {
    match encoding.trim().to_ascii_lowercase().as_str() {
        "base64" => {
            let compact: Vec<u8> = body
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            base64::decode(&compact).unwrap_or_else(|_| body.to_vec())
        },
        "quoted-printable" => decode_quoted_printable(body),
        _ => body.to_vec(),
    }
}

fn decode_quoted_printable(data: &[u8]) -> Vec<u8> {
    fn hex(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'A'..=b'F' => Some(b - b'A' + 10),
            b'a'..=b'f' => Some(b - b'a' + 10),
            _ => None,
        }
    }

    let mut out = Vec::with_capacity(data.len());
    let mut ix = 0;
    while ix < data.len() {
        if b'=' == data[ix] {
            // Soft line break or an encoded octet.
            if data[ix + 1..].starts_with(b"\r\n") {
                ix += 3;
                continue;
            }
            if data[ix + 1..].starts_with(b"\n") {
                ix += 2;
                continue;
            }
            if let (Some(&hi), Some(&lo)) =
                (data.get(ix + 1), data.get(ix + 2))
            {
                if let (Some(hi), Some(lo)) = (hex(hi), hex(lo)) {
                    out.push((hi << 4) | lo);
                    ix += 3;
                    continue;
                }
            }
        }
        out.push(data[ix]);
        ix += 1;
    }
    out
}
