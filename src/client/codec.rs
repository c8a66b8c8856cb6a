//! HTTP/1.1 client message codec.
//!
//! Frames one exchange at a time over a [`tokio_util::codec::Framed`]
//! transport: the encoder writes a request head followed by entity frames
//! (sized or chunked, with the chunked terminator), and the decoder yields
//! the response head, body chunks, and an end-of-message marker carrying
//! whether the connection may be reused afterwards.
//!
//! The decoder re-arms itself after each message, so a connection kept in
//! the pool carries its codec along for the next exchange.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};

/// Maximum accepted size for a response head before parsing fails.
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Maximum accepted size for a single chunk-size or trailer line.
const MAX_LINE_SIZE: usize = 4096;

/// Maximum number of response headers accepted.
const MAX_HEADERS: usize = 64;

/// A frame written to the transport for one request.
#[derive(Debug)]
pub(crate) enum RequestFrame {
    /// Request line and headers.
    Head(RequestHead),
    /// A slice of the request entity.
    Data(Bytes),
    /// Entity finished; writes the chunked terminator when applicable.
    End,
}

/// The request line and headers, plus how the entity will be framed.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) target: String,
    pub(crate) headers: HeaderMap,
    pub(crate) body: RequestBodyKind,
}

/// Entity framing for an outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestBodyKind {
    /// No entity at all.
    None,
    /// Entity with a known length, sent with a `Content-Length` header.
    Sized(u64),
    /// Entity of unknown length, sent with chunked transfer encoding.
    Chunked,
}

/// A frame read from the transport for one response.
#[derive(Debug)]
pub(crate) enum ResponseFrame {
    /// Status line and headers.
    Head(ResponseHead),
    /// A slice of the response body.
    Data(Bytes),
    /// Response finished; `reuse` reports whether the connection survives.
    End {
        /// Whether the connection may carry another exchange.
        reuse: bool,
    },
}

/// Status, version and headers of a decoded response.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Head,
    Body(BodyCodec),
}

#[derive(Debug, Clone, Copy)]
enum BodyCodec {
    /// Body fully consumed (or absent); emit `End` next.
    Done,
    Length(u64),
    Chunked(ChunkPhase),
    /// Body delimited by connection close.
    Eof,
}

#[derive(Debug, Clone, Copy)]
enum ChunkPhase {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
}

/// Client-side HTTP/1.1 codec state for one connection.
#[derive(Debug)]
pub(crate) struct Http1Codec {
    chunked_write: bool,
    head_request: bool,
    decode: DecodeState,
    reuse: bool,
}

impl Http1Codec {
    pub(crate) fn new() -> Self {
        Self {
            chunked_write: false,
            head_request: false,
            decode: DecodeState::Head,
            reuse: false,
        }
    }

    fn parse_head(&mut self, src: &mut BytesMut) -> io::Result<Option<ResponseFrame>> {
        loop {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut parsed = httparse::Response::new(&mut headers);

            let len = match parsed
                .parse(src)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            {
                httparse::Status::Complete(len) => len,
                httparse::Status::Partial => {
                    if src.len() > MAX_HEAD_SIZE {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "response head too large",
                        ));
                    }
                    return Ok(None);
                }
            };

            let status = parsed
                .code
                .and_then(|code| StatusCode::from_u16(code).ok())
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "invalid response status")
                })?;
            let version = match parsed.version {
                Some(0) => Version::HTTP_10,
                Some(1) => Version::HTTP_11,
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unsupported HTTP version",
                    ));
                }
            };

            let mut map = HeaderMap::with_capacity(parsed.headers.len());
            for h in parsed.headers.iter() {
                let name = HeaderName::from_bytes(h.name.as_bytes())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                let value = HeaderValue::from_bytes(h.value)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                map.append(name, value);
            }

            src.advance(len);

            // Interim responses carry no body and precede the real one.
            if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
                tracing::trace!(status = %status, "skipping interim response");
                continue;
            }

            let body = self.response_body(status, &map)?;
            self.reuse = match version {
                Version::HTTP_11 => !connection_header_has(&map, "close"),
                Version::HTTP_10 => connection_header_has(&map, "keep-alive"),
                _ => false,
            };
            if matches!(body, BodyCodec::Eof) {
                self.reuse = false;
            }

            self.decode = DecodeState::Body(body);
            return Ok(Some(ResponseFrame::Head(ResponseHead {
                status,
                version,
                headers: map,
            })));
        }
    }

    fn response_body(&self, status: StatusCode, headers: &HeaderMap) -> io::Result<BodyCodec> {
        if self.head_request
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return Ok(BodyCodec::Done);
        }

        if transfer_encoding_is_chunked(headers) {
            return Ok(BodyCodec::Chunked(ChunkPhase::Size));
        }

        if let Some(len) = content_length(headers)? {
            return Ok(if len == 0 {
                BodyCodec::Done
            } else {
                BodyCodec::Length(len)
            });
        }

        Ok(BodyCodec::Eof)
    }

    fn decode_chunked(
        &mut self,
        mut phase: ChunkPhase,
        src: &mut BytesMut,
    ) -> io::Result<Option<ResponseFrame>> {
        loop {
            match phase {
                ChunkPhase::Size => {
                    let Some(pos) = find_crlf(src)? else {
                        self.decode = DecodeState::Body(BodyCodec::Chunked(phase));
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&src[..pos])?;
                    src.advance(pos + 2);
                    phase = if size == 0 {
                        ChunkPhase::Trailer
                    } else {
                        ChunkPhase::Data(size)
                    };
                }
                ChunkPhase::Data(remaining) => {
                    if src.is_empty() {
                        self.decode = DecodeState::Body(BodyCodec::Chunked(phase));
                        return Ok(None);
                    }
                    let take = src.len().min(remaining as usize);
                    let data = src.split_to(take).freeze();
                    let remaining = remaining - take as u64;
                    phase = if remaining == 0 {
                        ChunkPhase::DataEnd
                    } else {
                        ChunkPhase::Data(remaining)
                    };
                    self.decode = DecodeState::Body(BodyCodec::Chunked(phase));
                    return Ok(Some(ResponseFrame::Data(data)));
                }
                ChunkPhase::DataEnd => {
                    if src.len() < 2 {
                        self.decode = DecodeState::Body(BodyCodec::Chunked(phase));
                        return Ok(None);
                    }
                    if &src[..2] != b"\r\n" {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "missing chunk delimiter",
                        ));
                    }
                    src.advance(2);
                    phase = ChunkPhase::Size;
                }
                ChunkPhase::Trailer => {
                    let Some(pos) = find_crlf(src)? else {
                        self.decode = DecodeState::Body(BodyCodec::Chunked(phase));
                        return Ok(None);
                    };
                    src.advance(pos + 2);
                    if pos == 0 {
                        self.decode = DecodeState::Head;
                        return Ok(Some(ResponseFrame::End { reuse: self.reuse }));
                    }
                    // trailer line skipped
                }
            }
        }
    }
}

impl tokio_util::codec::Encoder<RequestFrame> for Http1Codec {
    type Error = io::Error;

    fn encode(&mut self, item: RequestFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RequestFrame::Head(head) => {
                self.chunked_write = head.body == RequestBodyKind::Chunked;
                self.head_request = head.method == Method::HEAD;

                dst.reserve(head.target.len() + 256);
                dst.extend_from_slice(head.method.as_str().as_bytes());
                dst.extend_from_slice(b" ");
                dst.extend_from_slice(head.target.as_bytes());
                dst.extend_from_slice(b" HTTP/1.1\r\n");
                for (name, value) in head.headers.iter() {
                    dst.extend_from_slice(name.as_str().as_bytes());
                    dst.extend_from_slice(b": ");
                    dst.extend_from_slice(value.as_bytes());
                    dst.extend_from_slice(b"\r\n");
                }
                dst.extend_from_slice(b"\r\n");
            }
            RequestFrame::Data(data) => {
                if self.chunked_write {
                    // An empty chunk would read as the terminator.
                    if data.is_empty() {
                        return Ok(());
                    }
                    dst.reserve(data.len() + 20);
                    dst.extend_from_slice(format!("{:X}\r\n", data.len()).as_bytes());
                    dst.extend_from_slice(&data);
                    dst.extend_from_slice(b"\r\n");
                } else {
                    dst.extend_from_slice(&data);
                }
            }
            RequestFrame::End => {
                if self.chunked_write {
                    dst.extend_from_slice(b"0\r\n\r\n");
                    self.chunked_write = false;
                }
            }
        }

        Ok(())
    }
}

impl tokio_util::codec::Decoder for Http1Codec {
    type Item = ResponseFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode {
            DecodeState::Head => self.parse_head(src),
            DecodeState::Body(BodyCodec::Done) => {
                self.decode = DecodeState::Head;
                Ok(Some(ResponseFrame::End { reuse: self.reuse }))
            }
            DecodeState::Body(BodyCodec::Length(remaining)) => {
                if src.is_empty() {
                    return Ok(None);
                }
                let take = src.len().min(remaining as usize);
                let data = src.split_to(take).freeze();
                let remaining = remaining - take as u64;
                self.decode = DecodeState::Body(if remaining == 0 {
                    BodyCodec::Done
                } else {
                    BodyCodec::Length(remaining)
                });
                Ok(Some(ResponseFrame::Data(data)))
            }
            DecodeState::Body(BodyCodec::Chunked(phase)) => self.decode_chunked(phase, src),
            DecodeState::Body(BodyCodec::Eof) => {
                if src.is_empty() {
                    return Ok(None);
                }
                let data = src.split_to(src.len()).freeze();
                Ok(Some(ResponseFrame::Data(data)))
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        match self.decode {
            DecodeState::Head => {
                if src.is_empty() {
                    Ok(None)
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed during response head",
                    ))
                }
            }
            // Close is how an unframed body ends.
            DecodeState::Body(BodyCodec::Eof) => {
                self.decode = DecodeState::Head;
                Ok(Some(ResponseFrame::End { reuse: false }))
            }
            DecodeState::Body(_) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during response body",
            )),
        }
    }
}

fn find_crlf(src: &BytesMut) -> io::Result<Option<usize>> {
    match src.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => Ok(Some(pos)),
        None if src.len() > MAX_LINE_SIZE => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk framing line too long",
        )),
        None => Ok(None),
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let digits = match line.iter().position(|&b| b == b';') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let digits = std::str::from_utf8(digits)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))?
        .trim();
    u64::from_str_radix(digits, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))
}

fn transfer_encoding_is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
}

fn connection_header_has(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

fn content_length(headers: &HeaderMap) -> io::Result<Option<u64>> {
    let mut length = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "invalid content-length")
            })?;
        match length {
            None => length = Some(parsed),
            Some(existing) if existing == parsed => {}
            Some(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "conflicting content-length",
                ));
            }
        }
    }
    Ok(length)
}
