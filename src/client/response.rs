//! The response surface handed back to callers.
//!
//! A response exposes the status line and headers immediately; its body is a
//! blocking reader over chunks that keep arriving from the transport.
//! Compressed bodies (`Content-Encoding: gzip` or `deflate`) are decoded
//! transparently, in which case the encoding and length headers are removed
//! since they no longer describe what the reader yields.

use std::fmt;
use std::io::{self, Read};

use flate2::read::{GzDecoder, ZlibDecoder};
use http::{HeaderMap, StatusCode, Version, header};

use super::body::BodyReader;
use super::codec::ResponseHead;

/// A response to an executed request.
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: ResponseBody,
}

impl Response {
    pub(crate) fn new(head: ResponseHead, reader: BodyReader) -> Self {
        let ResponseHead {
            status,
            version,
            mut headers,
        } = head;

        let encoding = headers
            .get(header::CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .map(str::to_ascii_lowercase);

        let decode = match encoding.as_deref() {
            Some("gzip") | Some("x-gzip") => {
                headers.remove(header::CONTENT_ENCODING);
                headers.remove(header::CONTENT_LENGTH);
                Decode::Gzip(GzDecoder::new(reader))
            }
            Some("deflate") => {
                headers.remove(header::CONTENT_ENCODING);
                headers.remove(header::CONTENT_LENGTH);
                Decode::Deflate(ZlibDecoder::new(reader))
            }
            _ => Decode::Plain(reader),
        };

        Self {
            status,
            version,
            headers,
            body: ResponseBody { decode },
        }
    }

    /// The response status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The protocol version the server answered with.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The response body.
    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    /// Consume the response, keeping only the body.
    pub fn into_body(self) -> ResponseBody {
        self.body
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .finish()
    }
}

enum Decode {
    Plain(BodyReader),
    Gzip(GzDecoder<BodyReader>),
    Deflate(ZlibDecoder<BodyReader>),
}

/// A blocking reader over the response body.
///
/// Reads block until the transport delivers more of the body, and return
/// `Ok(0)` once the body ended normally. A transport failure mid-body
/// surfaces as an I/O error from `read`.
pub struct ResponseBody {
    decode: Decode,
}

impl ResponseBody {
    /// Stop reading and release anything still queued.
    ///
    /// Idempotent; further reads report the body as closed.
    pub fn close(&mut self) {
        match &mut self.decode {
            Decode::Plain(reader) => reader.close(),
            Decode::Gzip(decoder) => decoder.get_mut().close(),
            Decode::Deflate(decoder) => decoder.get_mut().close(),
        }
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.decode {
            Decode::Plain(reader) => reader.read(buf),
            Decode::Gzip(decoder) => decoder.read(buf),
            Decode::Deflate(decoder) => decoder.read(buf),
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let decode = match self.decode {
            Decode::Plain(_) => "identity",
            Decode::Gzip(_) => "gzip",
            Decode::Deflate(_) => "deflate",
        };
        f.debug_struct("ResponseBody").field("decode", &decode).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write as _;

    use bytes::Bytes;
    use http::HeaderValue;

    use crate::client::body;

    fn head(headers: &[(&'static str, &'static str)]) -> ResponseHead {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                header::HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }
        ResponseHead {
            status: StatusCode::OK,
            version: Version::HTTP_11,
            headers: map,
        }
    }

    fn gzipped(data: &[u8]) -> Bytes {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    #[test]
    fn plain_bodies_pass_through() {
        let (sink, reader) = body::channel();
        sink.publish(Bytes::from_static(b"plain text"));
        sink.complete(None);

        let mut response = Response::new(head(&[("content-length", "10")]), reader);
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(header::CONTENT_LENGTH));

        let mut out = String::new();
        response.body_mut().read_to_string(&mut out).unwrap();
        assert_eq!(out, "plain text");
    }

    #[test]
    fn gzip_bodies_are_decoded() {
        let (sink, reader) = body::channel();
        sink.publish(gzipped(b"compressed payload"));
        sink.complete(None);

        let mut response = Response::new(head(&[("content-encoding", "gzip")]), reader);
        assert!(!response.headers().contains_key(header::CONTENT_ENCODING));

        let mut out = String::new();
        response.body_mut().read_to_string(&mut out).unwrap();
        assert_eq!(out, "compressed payload");
    }

    #[test]
    fn deflate_bodies_are_decoded() {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"deflated").unwrap();
        let payload = Bytes::from(encoder.finish().unwrap());

        let (sink, reader) = body::channel();
        sink.publish(payload);
        sink.complete(None);

        let mut response = Response::new(head(&[("content-encoding", "deflate")]), reader);
        let mut out = String::new();
        response.body_mut().read_to_string(&mut out).unwrap();
        assert_eq!(out, "deflated");
    }

    #[test]
    fn unknown_encodings_are_left_alone() {
        let (sink, reader) = body::channel();
        sink.publish(Bytes::from_static(b"br-bytes"));
        sink.complete(None);

        let mut response = Response::new(head(&[("content-encoding", "br")]), reader);
        assert!(response.headers().contains_key(header::CONTENT_ENCODING));

        let mut out = Vec::new();
        response.body_mut().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"br-bytes");
    }

    #[test]
    fn closed_bodies_stop_reading() {
        let (sink, reader) = body::channel();
        sink.publish(Bytes::from_static(b"pending"));

        let mut response = Response::new(head(&[]), reader);
        response.body_mut().close();

        let mut buf = [0u8; 4];
        assert!(response.body_mut().read(&mut buf).is_err());
        drop(sink);
    }
}
