use bytes::BytesMut;
use gather_core::wire::{Frame, WireDecoder, DEFAULT_MAX_CHUNK};
use gather_core::ChannelError;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::Decoder;

/// Reader half of a remote session.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Pulls frames off the byte stream coming back from the execution context.
///
/// Frames are only read when asked for, so a slow consumer leaves bytes in the
/// pipe and eventually blocks the remote writer. A failed read consumes nothing;
/// calling [`TransferChannel::next_frame`] again retries it.
pub struct TransferChannel<R> {
    reader: R,
    buf: BytesMut,
    decoder: WireDecoder,
    read_chunk: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin> TransferChannel<R> {
    pub fn new(reader: R) -> Self {
        Self::with_read_chunk(reader, DEFAULT_MAX_CHUNK)
    }

    pub fn with_read_chunk(reader: R, read_chunk: usize) -> Self {
        let read_chunk = read_chunk.max(512);
        Self {
            reader,
            buf: BytesMut::with_capacity(read_chunk),
            decoder: WireDecoder::with_max_chunk(read_chunk),
            read_chunk,
            eof: false,
        }
    }

    /// Next frame, or `None` once the stream ended cleanly between records.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, ChannelError> {
        loop {
            if self.eof {
                return self.decoder.decode_eof(&mut self.buf);
            }
            if let Some(frame) = self.decoder.decode(&mut self.buf)? {
                return Ok(Some(frame));
            }
            self.buf.reserve(self.read_chunk);
            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                self.eof = true;
            }
        }
    }

    /// True while a file record has started but not ended.
    pub fn in_file(&self) -> bool {
        self.decoder.in_file()
    }
}
