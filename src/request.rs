use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use hyper::{body::HttpBody, header, Body, HeaderMap, Method, Request, Uri, Version};
use std::{io, net::SocketAddr};

/// How the bytes of a request body are framed on their way in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body and no declared length.
    Empty,
    /// Exactly this many bytes, as declared by `Content-Length`.
    Length(u64),
    /// Raw `Transfer-Encoding: chunked` framing still present.
    Chunked,
    /// Already unframed, runs until end of stream.
    Unframed,
}

pub struct RequestBody {
    pub framing: Framing,
    pub stream: BoxStream<'static, io::Result<Bytes>>,
}

impl RequestBody {
    pub fn new<S>(framing: Framing, stream: S) -> Self
    where
        S: futures::Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        RequestBody {
            framing,
            stream: stream.boxed(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Framing::Empty, stream::empty())
    }

    pub fn from_bytes(framing: Framing, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self::new(framing, stream::once(async move { Ok(data) }))
    }
}

/// Request metadata the core needs; immutable once dispatched.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub remote_addr: SocketAddr,
}

impl RequestHead {
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Raw, undecoded query component.
    pub fn query(&self) -> &str {
        self.uri.query().unwrap_or_default()
    }
}

pub struct CgiRequest {
    pub head: RequestHead,
    pub body: RequestBody,
}

impl CgiRequest {
    /// Hyper strips chunked framing itself, so a body without
    /// `Content-Length` arrives here already unframed.
    pub fn from_hyper(req: Request<Body>, remote_addr: SocketAddr) -> Self {
        let (parts, body) = req.into_parts();

        let declared = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|val| val.to_str().ok())
            .and_then(|val| val.trim().parse::<u64>().ok());

        let framing = match (declared, HttpBody::size_hint(&body).exact()) {
            (Some(len), _) => Framing::Length(len),
            (None, Some(0)) => Framing::Empty,
            (None, _) => Framing::Unframed,
        };

        let stream = body.map(|chunk| {
            chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err))
        });

        CgiRequest {
            head: RequestHead {
                method: parts.method,
                uri: parts.uri,
                version: parts.version,
                headers: parts.headers,
                remote_addr,
            },
            body: RequestBody::new(framing, stream),
        }
    }
}
