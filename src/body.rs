//! Request body normalization: whatever framing the client used, the script
//! sees a flat byte stream.

use crate::{
    config::ChunkedBodyMode,
    error::CgiError,
    request::{Framing, RequestBody},
};
use bytes::{Buf, Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::{codec::Decoder, io::StreamReader};

/// A chunk-size line longer than this is treated as garbage.
const MAX_CHUNK_LINE: usize = 4096;

/// Body length as announced to the script through `CONTENT_LENGTH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    Empty,
    Exact(u64),
    Streaming,
}

pub type BodyStream = BoxStream<'static, Result<Bytes, CgiError>>;

pub struct PreparedBody {
    pub length: BodyLength,
    pub stream: BodyStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

/// Incremental decoder for `Transfer-Encoding: chunked`.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    decoded: u64,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder {
            state: ChunkState::Size,
            decoded: 0,
        }
    }

    /// True once the terminal zero-length chunk and its trailers are consumed.
    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Total payload bytes produced so far.
    pub fn decoded(&self) -> u64 {
        self.decoded
    }
}

impl Decoder for ChunkedDecoder {
    type Item = Bytes;
    type Error = CgiError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CgiError> {
        loop {
            match self.state {
                ChunkState::Size => match httparse::parse_chunk_size(&src[..]) {
                    Ok(httparse::Status::Complete((consumed, 0))) => {
                        src.advance(consumed);
                        self.state = ChunkState::Trailers;
                    }
                    Ok(httparse::Status::Complete((consumed, size))) => {
                        src.advance(consumed);
                        self.state = ChunkState::Data(size);
                    }
                    Ok(httparse::Status::Partial) if src.len() > MAX_CHUNK_LINE => {
                        return Err(CgiError::MalformedBody("chunk size line too long".into()));
                    }
                    Ok(httparse::Status::Partial) => return Ok(None),
                    Err(_) => {
                        return Err(CgiError::MalformedBody("invalid chunk size line".into()));
                    }
                },
                ChunkState::Data(remaining) => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(src.len() as u64) as usize;
                    let chunk = src.split_to(take).freeze();
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    };
                    self.decoded += take as u64;
                    return Ok(Some(chunk));
                }
                ChunkState::DataEnd => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    if &src[..2] != b"\r\n" {
                        return Err(CgiError::MalformedBody(
                            "chunk data not followed by CRLF".into(),
                        ));
                    }
                    src.advance(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    let line_end = match src.windows(2).position(|w| w == b"\r\n") {
                        Some(pos) => pos,
                        None if src.len() > MAX_CHUNK_LINE => {
                            return Err(CgiError::MalformedBody("trailer line too long".into()));
                        }
                        None => return Ok(None),
                    };
                    src.advance(line_end + 2);
                    if line_end == 0 {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CgiError> {
        match self.decode(src)? {
            Some(chunk) => Ok(Some(chunk)),
            None if self.is_done() => Ok(None),
            None => Err(CgiError::MalformedBody("chunked body ended early".into())),
        }
    }
}

async fn next_chunk<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    decoder: &mut ChunkedDecoder,
) -> Result<Option<Bytes>, CgiError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(chunk) = decoder.decode(buf)? {
            return Ok(Some(chunk));
        }
        if decoder.is_done() {
            return Ok(None);
        }
        if reader.read_buf(buf).await? == 0 {
            return decoder.decode_eof(buf);
        }
    }
}

/// Decodes a chunked byte source, stopping right after the terminal chunk
/// so nothing past the body is read.
pub fn decode_chunked<R>(reader: R) -> BodyStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let state = (reader, BytesMut::with_capacity(8 * 1024), ChunkedDecoder::new());
    stream::try_unfold(state, |(mut reader, mut buf, mut decoder)| async move {
        let next = next_chunk(&mut reader, &mut buf, &mut decoder).await;
        next.map(|chunk| chunk.map(|chunk| (chunk, (reader, buf, decoder))))
    })
    .boxed()
}

/// Yields exactly `len` bytes and fails if the source runs dry first.
fn exact_length(source: BoxStream<'static, std::io::Result<Bytes>>, len: u64) -> BodyStream {
    stream::try_unfold((source, len), move |(mut source, remaining)| async move {
        if remaining == 0 {
            return Ok(None);
        }
        match source.next().await {
            Some(Ok(mut chunk)) => {
                if chunk.len() as u64 > remaining {
                    chunk.truncate(remaining as usize);
                }
                let left = remaining - chunk.len() as u64;
                Ok(Some((chunk, (source, left))))
            }
            Some(Err(err)) => Err(CgiError::Io(err)),
            None => Err(CgiError::MalformedBody(format!(
                "body ended {} bytes short of Content-Length {}",
                remaining, len
            ))),
        }
    })
    .boxed()
}

/// Fails the stream once more than `limit` bytes have gone through.
fn capped(source: BodyStream, limit: u64) -> BodyStream {
    let mut seen = 0u64;
    source
        .and_then(move |chunk| {
            seen += chunk.len() as u64;
            let over = seen > limit;
            async move {
                if over {
                    Err(CgiError::BodyTooLarge { limit })
                } else {
                    Ok(chunk)
                }
            }
        })
        .boxed()
}

pub struct BodyTransfer {
    mode: ChunkedBodyMode,
    max_size: u64,
}

impl BodyTransfer {
    pub fn new(mode: ChunkedBodyMode, max_size: u64) -> Self {
        BodyTransfer { mode, max_size }
    }

    /// Normalizes the body. With [`ChunkedBodyMode::Buffer`] a body of unknown
    /// length is read completely here, before any process exists.
    pub async fn prepare(&self, body: RequestBody) -> Result<PreparedBody, CgiError> {
        let unframed = match body.framing {
            Framing::Empty => {
                return Ok(PreparedBody {
                    length: BodyLength::Empty,
                    stream: stream::empty().boxed(),
                })
            }
            Framing::Length(len) if len > self.max_size => {
                return Err(CgiError::BodyTooLarge {
                    limit: self.max_size,
                })
            }
            Framing::Length(len) => {
                return Ok(PreparedBody {
                    length: BodyLength::Exact(len),
                    stream: exact_length(body.stream, len),
                })
            }
            Framing::Chunked => decode_chunked(StreamReader::new(body.stream)),
            Framing::Unframed => body.stream.map_err(CgiError::Io).boxed(),
        };
        let unframed = capped(unframed, self.max_size);

        match self.mode {
            ChunkedBodyMode::Stream => Ok(PreparedBody {
                length: BodyLength::Streaming,
                stream: unframed,
            }),
            ChunkedBodyMode::Buffer => {
                let data = unframed
                    .try_fold(BytesMut::new(), |mut acc, chunk| async move {
                        acc.extend_from_slice(&chunk);
                        Ok(acc)
                    })
                    .await?
                    .freeze();
                Ok(PreparedBody {
                    length: BodyLength::Exact(data.len() as u64),
                    stream: stream::once(async move { Ok(data) }).boxed(),
                })
            }
        }
    }
}
