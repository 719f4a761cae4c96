//! HTTP/1.x request and response framing using httparse.
//!
//! The relay connection carries raw HTTP bytes with no framing of its own, so
//! both ends must know exactly where one message stops. These parsers accumulate
//! bytes, report how many bytes of each chunk belong to the current message, and
//! say when the message is complete.

use thiserror::Error;
use tracing::debug;

/// Maximum number of headers to parse
const MAX_HEADERS: usize = 100;

/// Default limit for the request line/status line plus headers
pub const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;

/// Default limit for a public request body
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Longest chunk-size or trailer line accepted in a chunked body
const MAX_CHUNK_LINE: usize = 4096;

/// HTTP framing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Malformed HTTP message: {0}")]
    Malformed(String),

    #[error("Header block exceeds {limit} bytes")]
    HeadersTooLarge { limit: usize },

    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("Invalid Content-Length header: {0}")]
    InvalidContentLength(String),

    #[error("Chunked request bodies are not supported")]
    ChunkedRequestUnsupported,

    #[error("Invalid chunk in chunked body")]
    InvalidChunk,
}

/// Result of parsing an HTTP request
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    /// HTTP method (GET, POST, etc.)
    pub method: String,
    /// Request target as it appears on the request line
    pub path: String,
    /// HTTP minor version
    pub version: u8,
    /// Request headers
    pub headers: Vec<(String, String)>,
    /// Total bytes consumed by the request line and headers (including \r\n\r\n)
    pub header_len: usize,
    /// Declared body length, None if the header is absent
    pub content_length: Option<usize>,
}

impl ParsedRequest {
    /// Body length the request is framed with (absent Content-Length means 0)
    pub fn body_len(&self) -> usize {
        self.content_length.unwrap_or(0)
    }
}

/// Result of parsing an HTTP response
#[derive(Debug, Clone)]
pub struct ParsedResponse {
    /// HTTP status code
    pub status: u16,
    /// HTTP minor version
    pub version: u8,
    /// Reason phrase
    pub reason: String,
    /// Response headers
    pub headers: Vec<(String, String)>,
    /// Total bytes consumed by the status line and headers (including \r\n\r\n)
    pub header_len: usize,
    /// Expected body length (from Content-Length), None if unknown
    pub content_length: Option<usize>,
    /// Whether using chunked transfer encoding
    pub is_chunked: bool,
    /// Whether this response has no body (101, 204, 304, or a reply to HEAD)
    pub no_body: bool,
}

/// Incremental HTTP request framer
///
/// Requests are framed by `Content-Length` only; chunked request bodies are
/// rejected.
#[derive(Debug)]
pub struct HttpRequestParser {
    /// Bytes of the current request
    buffer: Vec<u8>,
    /// Parsed request (once headers are complete)
    parsed: Option<ParsedRequest>,
    /// Body bytes received so far
    body_received: usize,
    /// Whether the request is fully received
    complete: bool,
    max_header_bytes: usize,
    max_body_bytes: usize,
}

impl HttpRequestParser {
    /// Create a new request parser
    pub fn new() -> Self {
        Self::with_max_header_bytes(DEFAULT_MAX_HEADER_BYTES)
    }

    pub fn with_max_header_bytes(max_header_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            parsed: None,
            body_received: 0,
            complete: false,
            max_header_bytes,
            max_body_bytes: usize::MAX,
        }
    }

    /// Reject requests declaring a body larger than `max_body_bytes`
    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Feed data to the parser.
    ///
    /// Returns the number of bytes of `data` that belong to the current
    /// request. Anything past that belongs to the next message.
    pub fn feed(&mut self, data: &[u8]) -> Result<usize, ParseError> {
        if self.complete {
            return Ok(0);
        }

        if let Some(content_length) = self.parsed.as_ref().map(ParsedRequest::body_len) {
            let take = (content_length - self.body_received).min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            self.body_received += take;
            self.complete = self.body_received >= content_length;
            return Ok(take);
        }

        let before = self.buffer.len();
        self.buffer.extend_from_slice(data);

        let Some(parsed) = Self::try_parse_headers(&self.buffer)? else {
            if self.buffer.len() > self.max_header_bytes {
                return Err(ParseError::HeadersTooLarge {
                    limit: self.max_header_bytes,
                });
            }
            return Ok(data.len());
        };

        if parsed.header_len > self.max_header_bytes {
            return Err(ParseError::HeadersTooLarge {
                limit: self.max_header_bytes,
            });
        }

        if parsed.body_len() > self.max_body_bytes {
            return Err(ParseError::BodyTooLarge {
                limit: self.max_body_bytes,
            });
        }

        debug!(
            "Parsed HTTP request: {} {} (content_length={:?})",
            parsed.method, parsed.path, parsed.content_length
        );

        let message_len = parsed.header_len + parsed.body_len();
        if self.buffer.len() >= message_len {
            self.buffer.truncate(message_len);
            self.complete = true;
        }
        self.body_received = self.buffer.len() - parsed.header_len;
        self.parsed = Some(parsed);

        Ok(self.buffer.len() - before)
    }

    /// Check if request is complete
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Get parsed request (if headers are complete)
    pub fn parsed(&self) -> Option<&ParsedRequest> {
        self.parsed.as_ref()
    }

    /// Bytes buffered so far for the current request
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Take the complete request out of the parser, leaving it ready for the next one
    pub fn take_request(&mut self) -> Option<(ParsedRequest, Vec<u8>)> {
        if !self.complete {
            return None;
        }
        let parsed = self.parsed.take()?;
        let bytes = std::mem::take(&mut self.buffer);
        self.reset();
        Some((parsed, bytes))
    }

    /// Try to parse headers from buffer
    fn try_parse_headers(buffer: &[u8]) -> Result<Option<ParsedRequest>, ParseError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let header_len = match req.parse(buffer) {
            Ok(httparse::Status::Complete(header_len)) => header_len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(ParseError::Malformed(e.to_string())),
        };

        let method = req.method.unwrap_or("").to_string();
        let path = req.path.unwrap_or("").to_string();
        let version = req.version.unwrap_or(1);

        let mut parsed_headers = Vec::new();
        let mut content_length = None;

        for header in req.headers.iter() {
            let name = header.name.to_string();
            let value = String::from_utf8_lossy(header.value).to_string();

            if name.eq_ignore_ascii_case("content-length") {
                content_length = Some(parse_content_length(&value)?);
            }
            if name.eq_ignore_ascii_case("transfer-encoding")
                && value.to_ascii_lowercase().contains("chunked")
            {
                return Err(ParseError::ChunkedRequestUnsupported);
            }

            parsed_headers.push((name, value));
        }

        Ok(Some(ParsedRequest {
            method,
            path,
            version,
            headers: parsed_headers,
            header_len,
            content_length,
        }))
    }

    /// Reset parser for a new request
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.parsed = None;
        self.body_received = 0;
        self.complete = false;
    }
}

impl Default for HttpRequestParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Incremental HTTP response framer
///
/// Interim `1xx` responses (other than `101`) are kept in the buffer ahead of
/// the final response, which is the one [`Self::parsed`] describes.
#[derive(Debug)]
pub struct HttpResponseParser {
    /// Bytes of the current response, interim responses included
    buffer: Vec<u8>,
    /// Offset of the final response's status line in `buffer`
    head_start: usize,
    /// Parsed final response (once its headers are complete)
    parsed: Option<ParsedResponse>,
    /// Body bytes received so far
    body_received: usize,
    /// Whether the response is fully received
    complete: bool,
    /// Chunked body scanner
    chunked_state: ChunkedState,
    /// Whether this response has unknown length (no Content-Length, not chunked)
    has_unknown_length: bool,
    /// Whether the request was HEAD (response carries headers only)
    head_request: bool,
    max_header_bytes: usize,
}

impl HttpResponseParser {
    /// Create a new response parser
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            head_start: 0,
            parsed: None,
            body_received: 0,
            complete: false,
            chunked_state: ChunkedState::default(),
            has_unknown_length: false,
            head_request: false,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
        }
    }

    /// Create a parser for the response to a request with the given method
    pub fn for_method(method: &str) -> Self {
        let mut parser = Self::new();
        parser.head_request = method.eq_ignore_ascii_case("HEAD");
        parser
    }

    /// Feed data to the parser.
    ///
    /// Returns the number of bytes of `data` that belong to the current
    /// response.
    pub fn feed(&mut self, data: &[u8]) -> Result<usize, ParseError> {
        if self.complete {
            return Ok(0);
        }

        if self.parsed.is_some() {
            return self.consume_body(data);
        }

        self.buffer.extend_from_slice(data);

        loop {
            let head = &self.buffer[self.head_start..];
            let Some(parsed) = Self::try_parse_headers(head, self.head_request)? else {
                if head.len() > self.max_header_bytes {
                    return Err(ParseError::HeadersTooLarge {
                        limit: self.max_header_bytes,
                    });
                }
                return Ok(data.len());
            };

            if is_interim(parsed.status) {
                debug!("Interim HTTP response: {} {}", parsed.status, parsed.reason);
                self.head_start += parsed.header_len;
                continue;
            }

            debug!(
                "Parsed HTTP response: {} {} (content_length={:?}, chunked={}, no_body={})",
                parsed.status, parsed.reason, parsed.content_length, parsed.is_chunked, parsed.no_body
            );

            // Body bytes that arrived together with the headers
            let body = self.buffer.split_off(self.head_start + parsed.header_len);
            self.has_unknown_length =
                !parsed.no_body && !parsed.is_chunked && parsed.content_length.is_none();
            self.parsed = Some(parsed);

            let consumed_body = self.consume_body(&body)?;
            return Ok(data.len() - (body.len() - consumed_body));
        }
    }

    fn consume_body(&mut self, data: &[u8]) -> Result<usize, ParseError> {
        let Some(parsed) = self.parsed.as_ref() else {
            return Ok(0);
        };
        let (no_body, is_chunked, content_length) =
            (parsed.no_body, parsed.is_chunked, parsed.content_length);

        let consumed = if no_body {
            0
        } else if is_chunked {
            self.chunked_state.advance(data)?
        } else if let Some(content_length) = content_length {
            (content_length - self.body_received).min(data.len())
        } else {
            data.len()
        };

        self.buffer.extend_from_slice(&data[..consumed]);
        self.body_received += consumed;

        self.complete = if no_body {
            true
        } else if is_chunked {
            self.chunked_state.is_done()
        } else if let Some(content_length) = content_length {
            self.body_received >= content_length
        } else {
            false
        };

        Ok(consumed)
    }

    /// Check if response is complete
    ///
    /// A response without any length information only completes through
    /// [`Self::mark_complete`], once the sender has closed the connection.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Check if response has unknown length (no Content-Length, not chunked)
    pub fn has_unknown_length(&self) -> bool {
        self.has_unknown_length
    }

    /// Mark response as complete (e.g., when connection closes)
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    /// Whether any byte of the response has been seen
    pub fn has_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Get parsed response (if headers are complete)
    pub fn parsed(&self) -> Option<&ParsedResponse> {
        self.parsed.as_ref()
    }

    /// Get body bytes received
    pub fn body_received(&self) -> usize {
        self.body_received
    }

    /// Get the accumulated body data
    pub fn body_data(&self) -> Option<&[u8]> {
        self.parsed
            .as_ref()
            .map(|p| &self.buffer[self.head_start + p.header_len..])
    }

    /// Raw bytes of the response received so far
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the parser, returning the raw response bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Consume the parser, returning the response framed by length
    ///
    /// A close-delimited response gets `Content-Length` and `Connection: close`
    /// in place of its own `Connection` header, so it can travel over a
    /// connection that stays open. Other responses are returned unchanged.
    pub fn into_framed_bytes(self) -> Vec<u8> {
        if !self.has_unknown_length {
            return self.buffer;
        }
        let Some(header_len) = self.parsed.as_ref().map(|p| p.header_len) else {
            return self.buffer;
        };

        let head_end = self.head_start + header_len;
        let body = &self.buffer[head_end..];
        let mut framed = Vec::with_capacity(self.buffer.len() + 48);
        framed.extend_from_slice(&self.buffer[..self.head_start]);

        for line in self.buffer[self.head_start..head_end].split_inclusive(|b| *b == b'\n') {
            if trim_line(line).is_empty() {
                break;
            }
            if is_header(line, "connection") {
                continue;
            }
            framed.extend_from_slice(line);
        }

        framed.extend_from_slice(
            format!(
                "Content-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            )
            .as_bytes(),
        );
        framed.extend_from_slice(body);
        framed
    }

    /// Try to parse headers from buffer
    fn try_parse_headers(
        buffer: &[u8],
        head_request: bool,
    ) -> Result<Option<ParsedResponse>, ParseError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);

        let header_len = match resp.parse(buffer) {
            Ok(httparse::Status::Complete(header_len)) => header_len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(ParseError::Malformed(e.to_string())),
        };

        let status = resp.code.unwrap_or(0);
        let version = resp.version.unwrap_or(1);
        let reason = resp.reason.unwrap_or("").to_string();

        let mut parsed_headers = Vec::new();
        let mut content_length = None;
        let mut is_chunked = false;

        for header in resp.headers.iter() {
            let name = header.name.to_string();
            let value = String::from_utf8_lossy(header.value).to_string();

            if name.eq_ignore_ascii_case("content-length") {
                content_length = Some(parse_content_length(&value)?);
            }
            if name.eq_ignore_ascii_case("transfer-encoding")
                && value.to_ascii_lowercase().contains("chunked")
            {
                is_chunked = true;
            }

            parsed_headers.push((name, value));
        }

        // Transfer-Encoding wins over Content-Length (RFC 7230 §3.3.3)
        if is_chunked {
            content_length = None;
        }

        let no_body = head_request || matches!(status, 101 | 204 | 304);

        Ok(Some(ParsedResponse {
            status,
            version,
            reason,
            headers: parsed_headers,
            header_len,
            content_length,
            is_chunked,
            no_body,
        }))
    }

    /// Reset parser for a new response
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.head_start = 0;
        self.parsed = None;
        self.body_received = 0;
        self.complete = false;
        self.chunked_state = ChunkedState::default();
        self.has_unknown_length = false;
    }
}

impl Default for HttpResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// `1xx` responses that precede the final response on the same exchange
fn is_interim(status: u16) -> bool {
    (100..200).contains(&status) && status != 101
}

/// Whether a raw header line carries the header `name`
fn is_header(line: &[u8], name: &str) -> bool {
    line.split(|b| *b == b':')
        .next()
        .is_some_and(|field| field.eq_ignore_ascii_case(name.as_bytes()))
}

fn parse_content_length(value: &str) -> Result<usize, ParseError> {
    value
        .trim()
        .parse()
        .map_err(|_| ParseError::InvalidContentLength(value.to_string()))
}

/// Where the chunked scanner is inside the body
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum ChunkPhase {
    /// Reading a chunk-size line
    #[default]
    Size,
    /// Inside chunk data, bytes remaining
    Data(usize),
    /// CRLF after chunk data, bytes remaining
    DataEnd(u8),
    /// Trailer section after the last chunk
    Trailer,
    Done,
}

/// Incremental scanner for chunked transfer encoding
///
/// Only finds the end of the body; chunk data is passed through untouched.
#[derive(Debug, Default)]
struct ChunkedState {
    phase: ChunkPhase,
    /// Partial size or trailer line
    line: Vec<u8>,
}

impl ChunkedState {
    fn is_done(&self) -> bool {
        self.phase == ChunkPhase::Done
    }

    /// Scan `data`, returning how many bytes belong to the body
    fn advance(&mut self, data: &[u8]) -> Result<usize, ParseError> {
        let mut rest = data;

        while !rest.is_empty() && self.phase != ChunkPhase::Done {
            match self.phase {
                ChunkPhase::Size | ChunkPhase::Trailer => {
                    let Some(newline) = rest.iter().position(|b| *b == b'\n') else {
                        self.line.extend_from_slice(rest);
                        rest = &[];
                        if self.line.len() > MAX_CHUNK_LINE {
                            return Err(ParseError::InvalidChunk);
                        }
                        break;
                    };
                    self.line.extend_from_slice(&rest[..=newline]);
                    rest = &rest[newline + 1..];

                    let line = trim_line(&self.line);
                    self.phase = if self.phase == ChunkPhase::Size {
                        match parse_chunk_size(line)? {
                            0 => ChunkPhase::Trailer,
                            size => ChunkPhase::Data(size),
                        }
                    } else if line.is_empty() {
                        ChunkPhase::Done
                    } else {
                        ChunkPhase::Trailer
                    };
                    self.line.clear();
                }
                ChunkPhase::Data(remaining) => {
                    let take = remaining.min(rest.len());
                    rest = &rest[take..];
                    self.phase = if remaining == take {
                        ChunkPhase::DataEnd(2)
                    } else {
                        ChunkPhase::Data(remaining - take)
                    };
                }
                ChunkPhase::DataEnd(remaining) => {
                    let take = usize::from(remaining).min(rest.len());
                    rest = &rest[take..];
                    self.phase = if usize::from(remaining) == take {
                        ChunkPhase::Size
                    } else {
                        ChunkPhase::DataEnd(remaining - take as u8)
                    };
                }
                ChunkPhase::Done => break,
            }
        }

        Ok(data.len() - rest.len())
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    // Chunk extensions follow ';'
    let size = line.split(|b| *b == b';').next().unwrap_or(line);
    let size = std::str::from_utf8(size).map_err(|_| ParseError::InvalidChunk)?;
    usize::from_str_radix(size.trim(), 16).map_err(|_| ParseError::InvalidChunk)
}
