//! Splitting a script's stdout into a header block and a body.

use crate::error::CgiError;
use bytes::{Bytes, BytesMut};
use hyper::{
    header::{self, HeaderName, HeaderValue},
    Body, HeaderMap, Response, StatusCode,
};
use log::{debug, warn};

/// Scripts get this much room for their header block.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Framing belongs to the server, not the script.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    *name == header::CONNECTION || *name == header::TRANSFER_ENCODING || name.as_str() == "keep-alive"
}

/// Status and headers of a script response, validated and normalized.
#[derive(Debug, Clone)]
pub struct CgiHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// `Content-Length` as declared by the script. Kept out of `headers`:
    /// the body is relayed as a stream and only checked against it.
    pub content_length: Option<u64>,
}

impl CgiHead {
    pub fn into_response(self, body: Body) -> Response<Body> {
        let mut res = Response::new(body);
        *res.status_mut() = self.status;
        *res.headers_mut() = self.headers;
        res
    }
}

#[derive(Default)]
struct HeadBuilder {
    status: Option<StatusCode>,
    headers: HeaderMap,
    content_length: Option<u64>,
}

impl HeadBuilder {
    fn apply(&mut self, name: &str, value: &[u8]) -> Result<(), CgiError> {
        let malformed = || {
            CgiError::InvalidHeaderSyntax(format!(
                "{}: {}",
                name,
                String::from_utf8_lossy(value)
            ))
        };

        if name.eq_ignore_ascii_case("status") {
            let code = value
                .split(|b| *b == b' ')
                .find(|part| !part.is_empty())
                .ok_or_else(malformed)?;
            let status = StatusCode::from_bytes(code).map_err(|_| malformed())?;
            if self.status.replace(status).is_some() {
                debug!("script sent more than one Status header, keeping the last");
            }
            return Ok(());
        }

        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| malformed())?;
        let value = HeaderValue::from_bytes(value).map_err(|_| malformed())?;

        if is_hop_by_hop(&name) {
            debug!("dropping hop-by-hop header {} from script", name);
            return Ok(());
        }
        if name == header::CONTENT_LENGTH {
            let len = value
                .to_str()
                .ok()
                .and_then(|len| len.parse::<u64>().ok())
                .ok_or_else(malformed)?;
            self.content_length = Some(len);
            return Ok(());
        }
        if name == header::CONTENT_TYPE && self.headers.contains_key(header::CONTENT_TYPE) {
            warn!("script sent Content-Type twice, ignoring {:?}", value);
            return Ok(());
        }

        self.headers.append(name, value);
        Ok(())
    }

    fn finish(mut self) -> CgiHead {
        let status = match self.status {
            Some(status) => status,
            None if self.headers.contains_key(header::LOCATION) => StatusCode::FOUND,
            None => StatusCode::OK,
        };
        if !self.headers.contains_key(header::CONTENT_TYPE) {
            self.headers
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        }
        CgiHead {
            status,
            headers: self.headers,
            content_length: self.content_length,
        }
    }
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| *b != b' ' && *b != b'\t')
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| *b != b' ' && *b != b'\t')
        .map_or(start, |pos| pos + 1);
    &bytes[start..end]
}

/// Line-by-line parsing, used when httparse refuses the block. Lines without
/// a colon, or with a name or value hyper won't accept, are logged and
/// skipped.
fn parse_lenient(block: &[u8], head: &mut HeadBuilder) {
    for line in block.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let result = match line.iter().position(|b| *b == b':') {
            Some(colon) => {
                let name = String::from_utf8_lossy(trim(&line[..colon])).into_owned();
                head.apply(&name, trim(&line[colon + 1..]))
            }
            None => Err(CgiError::InvalidHeaderSyntax(
                String::from_utf8_lossy(line).into_owned(),
            )),
        };
        if let Err(err) = result {
            warn!("skipping header line: {}", err);
        }
    }
}

/// Parses a complete header block, including its terminating blank line.
pub fn parse_head(block: &[u8]) -> CgiHead {
    let mut head = HeadBuilder::default();
    let mut parsed = [httparse::EMPTY_HEADER; 64];

    match httparse::parse_headers(block, &mut parsed) {
        Ok(httparse::Status::Complete((_, headers))) => {
            for header in headers.iter() {
                if let Err(err) = head.apply(header.name, trim(header.value)) {
                    warn!("skipping header line: {}", err);
                }
            }
        }
        _ => parse_lenient(block, &mut head),
    }

    head.finish()
}

/// Position just past the first blank line, accepting `\n` and `\r\n`
/// line endings (also mixed).
fn find_boundary(buf: &[u8], from: usize) -> Option<usize> {
    let mut line_start = from;
    for (i, b) in buf.iter().enumerate().skip(from) {
        if *b == b'\n' {
            let line = &buf[line_start..i];
            if line.is_empty() || line == b"\r" {
                return Some(i + 1);
            }
            line_start = i + 1;
        }
    }
    None
}

/// Incremental header/body splitter fed with stdout reads.
#[derive(Debug, Default)]
pub struct HeadParser {
    buf: BytesMut,
    /// Start of the first line not yet known to be non-blank.
    scanned: usize,
}

impl HeadParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds more output. Returns the parsed head and whatever body bytes
    /// came along in the same reads once the blank line shows up.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<(CgiHead, Bytes)>, CgiError> {
        self.buf.extend_from_slice(chunk);

        match find_boundary(&self.buf, self.scanned) {
            Some(end) => {
                let head = parse_head(&self.buf[..end]);
                let _ = self.buf.split_to(end);
                let rest = std::mem::take(&mut self.buf).freeze();
                Ok(Some((head, rest)))
            }
            None if self.buf.len() > MAX_HEAD_SIZE => Err(CgiError::InvalidHeaderSyntax(
                format!("no blank line within {} bytes", MAX_HEAD_SIZE),
            )),
            None => {
                self.scanned = self
                    .buf
                    .iter()
                    .rposition(|b| *b == b'\n')
                    .map_or(0, |pos| pos + 1);
                Ok(None)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Output that ended without a blank line is served as a body with
    /// default headers.
    pub fn into_unterminated(self) -> (CgiHead, Bytes) {
        (HeadBuilder::default().finish(), self.buf.freeze())
    }
}
