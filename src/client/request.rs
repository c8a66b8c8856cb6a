//! The request view consumed by the connector.
//!
//! A request is a method, a target URI, ordered multi-valued headers, and an
//! optional entity. Entities either carry their bytes up front (known
//! length) or stream from a caller-supplied reader; a streaming entity
//! without a known length is sent with chunked transfer encoding.

use std::fmt;
use std::io::Read;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};

use super::Error;

/// The entity attached to a request.
pub enum Entity {
    /// No entity at all.
    Empty,

    /// An entity fully buffered in memory; its length is known.
    Full(Bytes),

    /// An entity produced by a blocking reader.
    ///
    /// The reader runs on the client's blocking pool, never on an event-loop
    /// thread, so it may itself perform blocking I/O. When `length` is
    /// `None` the entity is sent with chunked transfer encoding.
    Streaming {
        /// Source of the entity bytes, drained to end-of-stream.
        reader: Box<dyn Read + Send + 'static>,
        /// Entity length when known in advance.
        length: Option<u64>,
    },
}

impl Entity {
    /// Whether the request carries an entity.
    pub fn is_empty(&self) -> bool {
        matches!(self, Entity::Empty)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Empty => f.debug_struct("Entity::Empty").finish(),
            Entity::Full(bytes) => f
                .debug_struct("Entity::Full")
                .field("length", &bytes.len())
                .finish(),
            Entity::Streaming { length, .. } => f
                .debug_struct("Entity::Streaming")
                .field("length", length)
                .finish(),
        }
    }
}

/// A request to execute.
#[derive(Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    entity: Entity,
}

impl Request {
    /// Create a request with the given method and URI and no entity.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            entity: Entity::Empty,
        }
    }

    /// Create a GET request.
    pub fn get<U>(uri: U) -> Result<Self, Error>
    where
        U: TryInto<Uri>,
    {
        Self::with_method(Method::GET, uri)
    }

    /// Create a POST request.
    pub fn post<U>(uri: U) -> Result<Self, Error>
    where
        U: TryInto<Uri>,
    {
        Self::with_method(Method::POST, uri)
    }

    /// Create a PUT request.
    pub fn put<U>(uri: U) -> Result<Self, Error>
    where
        U: TryInto<Uri>,
    {
        Self::with_method(Method::PUT, uri)
    }

    /// Create a DELETE request.
    pub fn delete<U>(uri: U) -> Result<Self, Error>
    where
        U: TryInto<Uri>,
    {
        Self::with_method(Method::DELETE, uri)
    }

    /// Create a HEAD request.
    pub fn head<U>(uri: U) -> Result<Self, Error>
    where
        U: TryInto<Uri>,
    {
        Self::with_method(Method::HEAD, uri)
    }

    fn with_method<U>(method: Method, uri: U) -> Result<Self, Error>
    where
        U: TryInto<Uri>,
    {
        let uri = uri
            .try_into()
            .map_err(|_| Error::Protocol("invalid request URI".into()))?;
        Ok(Self::new(method, uri))
    }

    /// Append a header, keeping any values already present for the name.
    pub fn header<K, V>(mut self, name: K, value: V) -> Result<Self, Error>
    where
        K: TryInto<HeaderName>,
        V: TryInto<HeaderValue>,
    {
        let name = name
            .try_into()
            .map_err(|_| Error::Protocol("invalid header name".into()))?;
        let value = value
            .try_into()
            .map_err(|_| Error::Protocol("invalid header value".into()))?;
        self.headers.append(name, value);
        Ok(self)
    }

    /// Attach an entity.
    pub fn entity(mut self, entity: Entity) -> Self {
        self.entity = entity;
        self
    }

    /// Attach a fully buffered entity.
    pub fn body(self, body: impl Into<Bytes>) -> Self {
        self.entity(Entity::Full(body.into()))
    }

    /// Attach a streaming entity read from `reader` on the blocking pool.
    pub fn streaming(self, reader: impl Read + Send + 'static, length: Option<u64>) -> Self {
        self.entity(Entity::Streaming {
            reader: Box::new(reader),
            length,
        })
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request URI.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub(crate) fn into_parts(self) -> (Method, Uri, HeaderMap, Entity) {
        (self.method, self.uri, self.headers, self.entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_parse_uris() {
        let request = Request::get("http://example.com/x?q=1").unwrap();
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.uri().path(), "/x");

        assert!(Request::get("not a uri").is_err());
    }

    #[test]
    fn headers_keep_multiple_values_in_order() {
        let request = Request::get("http://example.com/")
            .unwrap()
            .header("accept", "text/plain")
            .unwrap()
            .header("accept", "text/html")
            .unwrap();

        let values: Vec<_> = request.headers().get_all("accept").iter().collect();
        assert_eq!(values, ["text/plain", "text/html"]);
    }

    #[test]
    fn invalid_header_names_are_rejected() {
        let outcome = Request::get("http://example.com/")
            .unwrap()
            .header("bad name", "value");
        assert!(matches!(outcome, Err(Error::Protocol(_))));
    }

    #[test]
    fn entities_report_presence() {
        assert!(Request::get("http://example.com/").unwrap().entity.is_empty());

        let request = Request::post("http://example.com/").unwrap().body("data");
        assert!(!request.entity.is_empty());
    }
}
