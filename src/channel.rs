//! The transport seam.
//!
//! The engine never touches sockets itself; it drives a [`Channel`]
//! implementation that owns the raw connection and its event loop.

use std::collections::VecDeque;
use std::fs::File;
use std::future::Future;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::request::{BodyGenerator, BodyStream, FileRegion, GeneratedChunk};

/// Stable identifier of a channel for the registry side tables.
pub type ChannelId = u64;

/// One established connection, owned by an event loop.
///
/// Contract notes:
/// - `write_headers` / `write_body` resolve once the write has been
///   handed to the transport, reporting transport failures as
///   `io::Error`. A TLS-engine fault on a TLS channel is reported
///   as [`io::ErrorKind::InvalidData`].
/// - `close` is idempotent.
/// - Chunked body pulls happen on the transfer machinery's thread,
///   never on the response event path.
pub trait Channel: Send + Sync + 'static {
    fn id(&self) -> ChannelId;

    fn write_headers(
        &self,
        head: &crate::encode::WireRequest,
    ) -> impl Future<Output = io::Result<()>> + Send;

    fn write_body(&self, payload: BodyPayload) -> impl Future<Output = io::Result<()>> + Send;

    /// Still connected (may be mid-shutdown).
    fn is_open(&self) -> bool;

    /// Connected and usable for a new write.
    fn is_active(&self) -> bool;

    fn close(&self);

    fn is_tls(&self) -> bool;

    /// Resume a paused chunked transfer after a generator fed more data.
    fn resume_transfer(&self);

    /// Discard the remainder of the current response body.
    fn drain(&self);

    /// Switch the read path from HTTP response parsing
    /// to WebSocket frame interpretation.
    fn upgrade_to_websocket(&self);
}

/// Body handed to [`Channel::write_body`].
pub enum BodyPayload {
    /// Entire body known up front.
    Full(Bytes),
    /// Pulled chunk by chunk with `Transfer-Encoding: chunked`.
    Chunked(ChunkedInput),
    /// Zero-copy file transfer; only valid on plaintext channels.
    FileRegion(FileRegion),
}

impl std::fmt::Debug for BodyPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full(b) => write!(f, "Full({} bytes)", b.len()),
            Self::Chunked(_) => f.write_str("Chunked"),
            Self::FileRegion(region) => write!(f, "FileRegion({region:?})"),
        }
    }
}

/// One pulled chunk of a [`ChunkedInput`].
#[derive(Debug)]
pub enum InputChunk {
    Data(Bytes),
    /// No data available yet; the producer will call
    /// [`Channel::resume_transfer`] when there is.
    Pending,
    End,
}

/// Chunk producers the transfer machinery can pull from.
pub enum ChunkedInput {
    Stream(Arc<dyn BodyStream>),
    Generator(Arc<dyn BodyGenerator>),
    Multipart(MultipartChunks),
    File(ChunkedFile),
}

impl ChunkedInput {
    /// Pull the next chunk. `Pending` can only come from a generator.
    pub fn read_chunk(&self) -> io::Result<InputChunk> {
        match self {
            Self::Stream(stream) => Ok(match stream.next_chunk() {
                Some(data) => InputChunk::Data(data),
                None => InputChunk::End,
            }),
            Self::Generator(generator) => Ok(match generator.poll_chunk() {
                GeneratedChunk::Data(data) => InputChunk::Data(data),
                GeneratedChunk::Pending => InputChunk::Pending,
                GeneratedChunk::End => InputChunk::End,
            }),
            Self::Multipart(chunks) => Ok(chunks.pop()),
            Self::File(file) => file.read_chunk(),
        }
    }
}

/// Pre-encoded multipart chunks, drained front to back.
pub struct MultipartChunks {
    chunks: Mutex<VecDeque<Bytes>>,
}

impl MultipartChunks {
    pub fn new(chunks: Vec<Bytes>) -> Self {
        Self {
            chunks: Mutex::new(chunks.into()),
        }
    }

    fn pop(&self) -> InputChunk {
        match self.chunks.lock().pop_front() {
            Some(data) => InputChunk::Data(data),
            None => InputChunk::End,
        }
    }
}

const FILE_CHUNK_SIZE: usize = 8 * 1024;

/// Chunked file reader, used instead of zero-copy when the channel
/// is TLS (the TLS engine needs the plaintext in user space).
pub struct ChunkedFile {
    state: Mutex<ChunkedFileState>,
}

struct ChunkedFileState {
    file: Option<File>,
    region: FileRegion,
    remaining: Option<u64>,
}

impl ChunkedFile {
    pub fn new(region: FileRegion) -> Self {
        Self {
            state: Mutex::new(ChunkedFileState {
                file: None,
                remaining: region.length,
                region,
            }),
        }
    }

    fn read_chunk(&self) -> io::Result<InputChunk> {
        let mut state = self.state.lock();
        if state.remaining == Some(0) {
            return Ok(InputChunk::End);
        }
        if state.file.is_none() {
            let mut file = File::open(&state.region.path)?;
            if state.region.offset > 0 {
                file.seek(SeekFrom::Start(state.region.offset))?;
            }
            state.file = Some(file);
        }
        let limit = state
            .remaining
            .map_or(FILE_CHUNK_SIZE, |r| r.min(FILE_CHUNK_SIZE as u64) as usize);
        let mut buf = vec![0u8; limit];
        let file = state.file.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "chunked file handle missing")
        })?;
        let n = file.read(&mut buf)?;
        if n == 0 {
            return Ok(InputChunk::End);
        }
        if let Some(remaining) = state.remaining.as_mut() {
            *remaining -= n as u64;
        }
        buf.truncate(n);
        Ok(InputChunk::Data(Bytes::from(buf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn multipart_chunks_drain_in_order() {
        let chunks = MultipartChunks::new(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert!(matches!(chunks.pop(), InputChunk::Data(d) if d.as_ref() == b"a"));
        assert!(matches!(chunks.pop(), InputChunk::Data(d) if d.as_ref() == b"b"));
        assert!(matches!(chunks.pop(), InputChunk::End));
    }

    #[test]
    fn chunked_file_respects_offset_and_length() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();

        let file = ChunkedFile::new(FileRegion {
            path: tmp.path().to_path_buf(),
            offset: 2,
            length: Some(5),
        });

        let mut collected = Vec::new();
        loop {
            match file.read_chunk().unwrap() {
                InputChunk::Data(data) => collected.extend_from_slice(&data),
                InputChunk::End => break,
                InputChunk::Pending => unreachable!("files never report pending"),
            }
        }
        assert_eq!(collected, b"23456");
    }
}
