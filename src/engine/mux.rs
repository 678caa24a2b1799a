//! Minimal stream-multiplexing session.
//!
//! The agent tunnel needs many short-lived logical streams over the single
//! attached connection of the helper container. Frames are length-prefixed:
//! `u32 payload length | u32 stream id | u8 kind | payload`, all integers
//! big-endian. The engine is always the server side; the helper opens
//! streams, one per agent request.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::{CmdletError, Result};

const KIND_OPEN: u8 = 0;
const KIND_DATA: u8 = 1;
const KIND_CLOSE: u8 = 2;

/// Upper bound on one frame's payload; anything larger is a protocol error.
const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Server side of a multiplexing session over one byte transport.
pub struct MuxServer;

impl MuxServer {
    /// Layer the session over `transport` and return the sequence of inbound
    /// logical streams. The session ends when the transport closes; pending
    /// streams then read EOF.
    pub fn serve<T>(transport: T) -> mpsc::Receiver<MuxStream>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(write_half)));
        let (accept_tx, accept_rx) = mpsc::channel(16);
        tokio::spawn(read_loop(read_half, writer, accept_tx));
        accept_rx
    }
}

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// One logical stream. Reads arrive from the session's read loop; writes
/// serialize onto the shared transport through the session's write lock.
pub struct MuxStream {
    id: u32,
    incoming: mpsc::Receiver<Bytes>,
    writer: SharedWriter,
    closed: bool,
}

impl MuxStream {
    /// Next inbound payload, or `None` once the stream (or the whole
    /// session) is closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.incoming.recv().await
    }

    /// Send one payload to the peer half of this stream.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, self.id, KIND_DATA, payload).await
    }

    /// Tell the peer this stream is done. Safe to call more than once.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, self.id, KIND_CLOSE, &[]).await
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

async fn read_loop<R>(mut reader: R, writer: SharedWriter, accept_tx: mpsc::Sender<MuxStream>)
where
    R: AsyncRead + Send + Unpin,
{
    let mut streams: HashMap<u32, mpsc::Sender<Bytes>> = HashMap::new();
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "Multiplexed session read failed");
                break;
            }
        };
        match frame.kind {
            KIND_OPEN => {
                let (data_tx, data_rx) = mpsc::channel(16);
                streams.insert(frame.id, data_tx);
                let stream = MuxStream {
                    id: frame.id,
                    incoming: data_rx,
                    writer: writer.clone(),
                    closed: false,
                };
                if accept_tx.send(stream).await.is_err() {
                    // Nobody is accepting anymore; the session is over.
                    break;
                }
            }
            KIND_DATA => {
                let gone = match streams.get(&frame.id) {
                    Some(data_tx) => data_tx.send(frame.payload).await.is_err(),
                    None => {
                        debug!(stream = frame.id, "Data for unknown stream dropped");
                        false
                    }
                };
                if gone {
                    streams.remove(&frame.id);
                }
            }
            KIND_CLOSE => {
                streams.remove(&frame.id);
            }
            other => {
                warn!(kind = other, "Unknown frame kind; closing session");
                break;
            }
        }
    }
}

#[derive(Debug)]
struct Frame {
    id: u32,
    kind: u8,
    payload: Bytes,
}

async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 9];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let kind = header[8];
    if len > MAX_FRAME_BYTES {
        return Err(CmdletError::Session(format!(
            "multiplexed frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte limit"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame {
        id,
        kind,
        payload: payload.into(),
    }))
}

async fn write_frame<W>(writer: &mut W, id: u32, kind: u8, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&id.to_be_bytes()).await?;
    writer.write_all(&[kind]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
