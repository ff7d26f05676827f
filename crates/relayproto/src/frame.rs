use bytes::Buf;
use bytes::Bytes;
use bytes::BytesMut;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::ConnId;

pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// One routed message: connection id plus an opaque JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub conn: ConnId,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(conn: ConnId, payload: impl Into<Bytes>) -> Self {
        Self {
            conn,
            payload: payload.into(),
        }
    }

    pub fn control(payload: impl Into<Bytes>) -> Self {
        Self::new(ConnId::CONTROL, payload)
    }
}

#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    max_frame_len: usize,
}

impl<R> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max.max(ConnId::LEN);
        self
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Read one routed envelope.
    ///
    /// Returns:
    /// - `Ok(Some(env))` for a complete frame,
    /// - `Ok(None)` on clean EOF between frames.
    pub async fn read_envelope(&mut self) -> std::io::Result<Option<Envelope>> {
        loop {
            if self.buf.len() >= 4 {
                let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                    as usize;
                if len > self.max_frame_len {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "frame too large",
                    ));
                }
                if len < ConnId::LEN {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "frame shorter than connection id",
                    ));
                }

                if self.buf.len() >= 4 + len {
                    self.buf.advance(4);
                    let mut body = self.buf.split_to(len);
                    let mut cid = [0u8; 8];
                    cid.copy_from_slice(&body[..ConnId::LEN]);
                    body.advance(ConnId::LEN);
                    return Ok(Some(Envelope {
                        conn: ConnId::from_be_bytes(cid),
                        payload: body.freeze(),
                    }));
                }
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "eof while reading frame",
                ));
            }
        }
    }
}

#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Write the id header and the body without concatenating them first.
    pub async fn write_envelope(&mut self, env: &Envelope) -> std::io::Result<()> {
        let len = ConnId::LEN + env.payload.len();
        let len_u32: u32 = len
            .try_into()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too big"))?;

        self.inner.write_all(&len_u32.to_be_bytes()).await?;
        self.inner.write_all(&env.conn.to_be_bytes()).await?;
        if !env.payload.is_empty() {
            self.inner.write_all(&env.payload).await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush().await
    }
}
