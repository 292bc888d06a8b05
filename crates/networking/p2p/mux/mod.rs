pub mod select;

use crate::rlpx::{
    error::RLPxError,
    frame::{Frame, FrameCodec},
};
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
};
use tokio_util::codec::Framed;
use tracing::debug;

/// Per-stream read buffer cap.
pub const DEFAULT_MAX_READ_BUFFER: usize = 4 * 1024 * 1024;
/// Inbound streams nobody has claimed yet before the connection aborts.
pub const DEFAULT_MAX_EARLY_STREAMS: usize = 10;

/// All multiplexed traffic rides frames with this message code.
const MUX_FRAME_CODE: u8 = 0x00;

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("Transport error: {0}")]
    Transport(#[from] RLPxError),
    #[error("Stream was reset")]
    StreamReset,
    #[error("Stream is closed for writing")]
    StreamClosed,
    #[error("Per-stream read buffer overflow")]
    ReadBufferOverflow,
    #[error("Too many unclaimed early streams")]
    TooManyEarlyStreams,
    #[error("Invalid mux message: {0}")]
    InvalidMessage(String),
    #[error("Protocol negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("Multiplexer terminated")]
    Terminated,
}

/// Message types. Initiator-encoded variants are used by the side that
/// opened the stream, receiver-encoded by the other one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MsgType {
    NewStream = 0,
    MsgReceiver = 1,
    MsgInitiator = 2,
    CloseReceiver = 3,
    CloseInitiator = 4,
    ResetReceiver = 5,
    ResetInitiator = 6,
}

impl MsgType {
    fn from_bits(bits: u64) -> Result<Self, MuxError> {
        match bits {
            0 => Ok(Self::NewStream),
            1 => Ok(Self::MsgReceiver),
            2 => Ok(Self::MsgInitiator),
            3 => Ok(Self::CloseReceiver),
            4 => Ok(Self::CloseInitiator),
            5 => Ok(Self::ResetReceiver),
            6 => Ok(Self::ResetInitiator),
            other => Err(MuxError::InvalidMessage(format!(
                "unknown message type {other}"
            ))),
        }
    }
}

pub fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            return;
        }
    }
}

/// Returns the decoded value and the bytes consumed.
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize), MuxError> {
    let mut value: u64 = 0;
    for (index, byte) in buf.iter().enumerate() {
        if index >= 10 {
            break;
        }
        value |= u64::from(byte & 0x7f) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok((value, index + 1));
        }
    }
    Err(MuxError::InvalidMessage("truncated varint".to_string()))
}

/// Key of a stream in the local table: the id plus who opened it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct StreamKey {
    id: u64,
    local_initiator: bool,
}

#[derive(Debug)]
enum MuxCommand {
    OpenStream {
        name: Option<String>,
        reply: oneshot::Sender<MuxStream>,
    },
    Send {
        key: StreamKey,
        data: Bytes,
        done: oneshot::Sender<Result<(), MuxError>>,
    },
    Close {
        key: StreamKey,
    },
    Reset {
        key: StreamKey,
    },
}

#[derive(Debug)]
struct StreamState {
    read_tx: mpsc::UnboundedSender<Bytes>,
    buffered: Arc<AtomicUsize>,
    local_write_open: bool,
    remote_write_open: bool,
}

/// Handle for opening new streams on a running multiplexer.
#[derive(Debug, Clone)]
pub struct MuxHandle {
    command_tx: mpsc::Sender<MuxCommand>,
}

impl MuxHandle {
    pub async fn open_stream(&self, name: Option<String>) -> Result<MuxStream, MuxError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(MuxCommand::OpenStream { name, reply })
            .await
            .map_err(|_| MuxError::Terminated)?;
        rx.await.map_err(|_| MuxError::Terminated)
    }
}

/// Write side of a stream, cheap to clone and hand to writer tasks.
#[derive(Debug, Clone)]
pub struct MuxStreamWriter {
    key: StreamKey,
    command_tx: mpsc::Sender<MuxCommand>,
}

impl MuxStreamWriter {
    pub async fn write(&self, data: Bytes) -> Result<(), MuxError> {
        let (done, rx) = oneshot::channel();
        self.command_tx
            .send(MuxCommand::Send {
                key: self.key,
                data,
                done,
            })
            .await
            .map_err(|_| MuxError::Terminated)?;
        rx.await.map_err(|_| MuxError::Terminated)?
    }

    /// Half-closes the write side.
    pub async fn close(&self) {
        let _ = self
            .command_tx
            .send(MuxCommand::Close { key: self.key })
            .await;
    }

    pub async fn reset(&self) {
        let _ = self
            .command_tx
            .send(MuxCommand::Reset { key: self.key })
            .await;
    }
}

/// One logical stream over the shared frame transport. Reads yield whole
/// mux messages; writes block until the frame layer drains.
#[derive(Debug)]
pub struct MuxStream {
    key: StreamKey,
    name: Option<String>,
    read_rx: mpsc::UnboundedReceiver<Bytes>,
    buffered: Arc<AtomicUsize>,
    command_tx: mpsc::Sender<MuxCommand>,
    line_buffer: BytesMut,
}

impl MuxStream {
    pub fn id(&self) -> u64 {
        self.key.id
    }

    /// Early protocol name carried by the opening message, if any.
    pub fn protocol_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn writer(&self) -> MuxStreamWriter {
        MuxStreamWriter {
            key: self.key,
            command_tx: self.command_tx.clone(),
        }
    }

    pub async fn write(&self, data: Bytes) -> Result<(), MuxError> {
        self.writer().write(data).await
    }

    /// Next whole message, or `None` once the remote side closed or reset.
    pub async fn read(&mut self) -> Option<Bytes> {
        let data = self.read_rx.recv().await?;
        self.buffered.fetch_sub(data.len(), Ordering::Relaxed);
        Some(data)
    }

    /// Reads a `\n`-terminated token, buffering partial lines across
    /// messages.
    pub async fn read_line(&mut self) -> Result<String, MuxError> {
        loop {
            if let Some(position) = self.line_buffer.iter().position(|byte| *byte == b'\n') {
                let line = self.line_buffer.split_to(position + 1);
                let token = std::str::from_utf8(&line[..position])
                    .map_err(|_| MuxError::InvalidMessage("non-utf8 token".to_string()))?;
                return Ok(token.to_string());
            }
            match self.read().await {
                Some(data) => self.line_buffer.extend_from_slice(&data),
                None => return Err(MuxError::StreamReset),
            }
        }
    }

    pub async fn write_line(&self, token: &str) -> Result<(), MuxError> {
        let mut data = Vec::with_capacity(token.len() + 1);
        data.extend_from_slice(token.as_bytes());
        data.push(b'\n');
        self.write(Bytes::from(data)).await
    }

    /// Half-closes the write side.
    pub async fn close(&self) {
        self.writer().close().await
    }

    pub async fn reset(&self) {
        self.writer().reset().await
    }
}

/// Interleaves independent streams over one authenticated frame transport.
/// Runs as a task owning the framed connection; handles and streams talk to
/// it over channels.
pub struct Multiplexer<S> {
    framed: Framed<S, FrameCodec>,
    command_rx: mpsc::Receiver<MuxCommand>,
    command_tx: mpsc::Sender<MuxCommand>,
    inbound_tx: mpsc::Sender<MuxStream>,
    streams: HashMap<StreamKey, StreamState>,
    next_stream_id: u64,
    max_read_buffer: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Multiplexer<S> {
    /// Wraps a framed transport. Returns the multiplexer future plus the
    /// handle for opening streams and the queue of inbound ones.
    pub fn new(framed: Framed<S, FrameCodec>) -> (Self, MuxHandle, mpsc::Receiver<MuxStream>) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(DEFAULT_MAX_EARLY_STREAMS);
        let mux = Self {
            framed,
            command_rx,
            command_tx: command_tx.clone(),
            inbound_tx,
            streams: HashMap::new(),
            next_stream_id: 0,
            max_read_buffer: DEFAULT_MAX_READ_BUFFER,
        };
        (mux, MuxHandle { command_tx }, inbound_rx)
    }

    pub async fn run(mut self) -> Result<(), MuxError> {
        loop {
            tokio::select! {
                frame = self.framed.next() => match frame {
                    None => return Ok(()),
                    Some(Err(err)) => return Err(err.into()),
                    Some(Ok(frame)) => self.handle_frame(frame).await?,
                },
                command = self.command_rx.recv() => match command {
                    None => return Ok(()),
                    Some(command) => self.handle_command(command).await?,
                },
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), MuxError> {
        let mut payload = &frame.payload[..];
        while !payload.is_empty() {
            let (header, consumed) = decode_varint(payload)?;
            payload = &payload[consumed..];
            let (length, consumed) = decode_varint(payload)?;
            payload = &payload[consumed..];
            let length = length as usize;
            if payload.len() < length {
                return Err(MuxError::InvalidMessage(
                    "message length exceeds frame".to_string(),
                ));
            }
            let (data, rest) = payload.split_at(length);
            payload = rest;

            let id = header >> 3;
            let msg_type = MsgType::from_bits(header & 0x07)?;
            self.dispatch(id, msg_type, Bytes::copy_from_slice(data))
                .await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, id: u64, msg_type: MsgType, data: Bytes) -> Result<(), MuxError> {
        // Initiator-encoded types come from the remote opener and refer to
        // its id space; receiver-encoded ones refer to ours.
        let key = match msg_type {
            MsgType::NewStream
            | MsgType::MsgInitiator
            | MsgType::CloseInitiator
            | MsgType::ResetInitiator => StreamKey {
                id,
                local_initiator: false,
            },
            MsgType::MsgReceiver | MsgType::CloseReceiver | MsgType::ResetReceiver => StreamKey {
                id,
                local_initiator: true,
            },
        };

        match msg_type {
            MsgType::NewStream => {
                let name = if data.is_empty() {
                    None
                } else {
                    Some(
                        String::from_utf8(data.to_vec())
                            .map_err(|_| MuxError::InvalidMessage("non-utf8 name".to_string()))?,
                    )
                };
                let stream = self.register_stream(key, name);
                if self.inbound_tx.try_send(stream).is_err() {
                    return Err(MuxError::TooManyEarlyStreams);
                }
            }
            MsgType::MsgInitiator | MsgType::MsgReceiver => {
                let overflow = match self.streams.get(&key) {
                    Some(state) if state.remote_write_open => {
                        let buffered =
                            state.buffered.fetch_add(data.len(), Ordering::Relaxed) + data.len();
                        if buffered > self.max_read_buffer {
                            true
                        } else {
                            // A failed delivery means the reader is gone.
                            state.read_tx.send(data).is_err()
                        }
                    }
                    _ => {
                        debug!(id, "Data for unknown or half-closed stream, dropping");
                        return Ok(());
                    }
                };
                if overflow {
                    self.send_reset(key).await?;
                    self.streams.remove(&key);
                }
            }
            MsgType::CloseInitiator | MsgType::CloseReceiver => {
                let mut gone = false;
                if let Some(state) = self.streams.get_mut(&key) {
                    state.remote_write_open = false;
                    // Dropping the sender ends the reader after it drains.
                    let (closed_tx, _) = mpsc::unbounded_channel();
                    state.read_tx = closed_tx;
                    gone = !state.local_write_open;
                }
                if gone {
                    self.streams.remove(&key);
                }
            }
            MsgType::ResetInitiator | MsgType::ResetReceiver => {
                self.streams.remove(&key);
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: MuxCommand) -> Result<(), MuxError> {
        match command {
            MuxCommand::OpenStream { name, reply } => {
                let key = StreamKey {
                    id: self.next_stream_id,
                    local_initiator: true,
                };
                self.next_stream_id += 1;
                let stream = self.register_stream(key, name.clone());
                let payload = name.map(String::into_bytes).unwrap_or_default();
                self.send_message(key.id, MsgType::NewStream, &payload)
                    .await?;
                let _ = reply.send(stream);
            }
            MuxCommand::Send { key, data, done } => {
                let writable = self
                    .streams
                    .get(&key)
                    .map(|state| state.local_write_open)
                    .unwrap_or(false);
                if !writable {
                    let _ = done.send(Err(MuxError::StreamClosed));
                    return Ok(());
                }
                let msg_type = if key.local_initiator {
                    MsgType::MsgInitiator
                } else {
                    MsgType::MsgReceiver
                };
                let result = self.send_message(key.id, msg_type, &data).await;
                let _ = done.send(result);
            }
            MuxCommand::Close { key } => {
                let gone = match self.streams.get_mut(&key) {
                    Some(state) if state.local_write_open => {
                        state.local_write_open = false;
                        Some(!state.remote_write_open)
                    }
                    _ => None,
                };
                if let Some(fully_closed) = gone {
                    let msg_type = if key.local_initiator {
                        MsgType::CloseInitiator
                    } else {
                        MsgType::CloseReceiver
                    };
                    self.send_message(key.id, msg_type, &[]).await?;
                    if fully_closed {
                        self.streams.remove(&key);
                    }
                }
            }
            MuxCommand::Reset { key } => {
                if self.streams.remove(&key).is_some() {
                    self.send_reset(key).await?;
                }
            }
        }
        Ok(())
    }

    fn register_stream(&mut self, key: StreamKey, name: Option<String>) -> MuxStream {
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        self.streams.insert(
            key,
            StreamState {
                read_tx,
                buffered: buffered.clone(),
                local_write_open: true,
                remote_write_open: true,
            },
        );
        MuxStream {
            key,
            name,
            read_rx,
            buffered,
            command_tx: self.command_tx.clone(),
            line_buffer: BytesMut::new(),
        }
    }

    async fn send_reset(&mut self, key: StreamKey) -> Result<(), MuxError> {
        let msg_type = if key.local_initiator {
            MsgType::ResetInitiator
        } else {
            MsgType::ResetReceiver
        };
        self.send_message(key.id, msg_type, &[]).await
    }

    async fn send_message(
        &mut self,
        id: u64,
        msg_type: MsgType,
        data: &[u8],
    ) -> Result<(), MuxError> {
        let mut payload = Vec::with_capacity(data.len() + 12);
        encode_varint(id << 3 | msg_type as u64, &mut payload);
        encode_varint(data.len() as u64, &mut payload);
        payload.extend_from_slice(data);
        self.framed
            .send(Frame {
                code: MUX_FRAME_CODE,
                payload: Bytes::from(payload),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rlpx::handshake::Handshake;
    use ethrune_crypto::secp::{pk2id, public_key};
    use rand::rngs::OsRng;
    use secp256k1::SecretKey;
    use tokio::io::DuplexStream;

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            encode_varint(value, &mut buf);
            let (decoded, consumed) = decode_varint(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, buf.len());
        }
        assert!(decode_varint(&[0x80]).is_err());
    }

    async fn paired_muxes() -> (
        MuxHandle,
        mpsc::Receiver<MuxStream>,
        MuxHandle,
        mpsc::Receiver<MuxStream>,
    ) {
        let (a_side, b_side): (DuplexStream, DuplexStream) = tokio::io::duplex(64 * 1024);

        let initiator_key = SecretKey::new(&mut OsRng);
        let responder_key = SecretKey::new(&mut OsRng);
        let responder_id = pk2id(&public_key(&responder_key));
        let mut initiator = Handshake::new(initiator_key, true);
        let mut responder = Handshake::new(responder_key, true);
        let auth = initiator.encode_auth(responder_id).unwrap();
        responder.decode_auth(&auth).unwrap();
        let ack = responder.encode_ack().unwrap();
        initiator.decode_ack(&ack).unwrap();

        let a_codec = FrameCodec::new(initiator.derive_secrets(true).unwrap()).unwrap();
        let b_codec = FrameCodec::new(responder.derive_secrets(false).unwrap()).unwrap();

        let (a_mux, a_handle, a_inbound) = Multiplexer::new(Framed::new(a_side, a_codec));
        let (b_mux, b_handle, b_inbound) = Multiplexer::new(Framed::new(b_side, b_codec));
        tokio::spawn(a_mux.run());
        tokio::spawn(b_mux.run());
        (a_handle, a_inbound, b_handle, b_inbound)
    }

    #[tokio::test]
    async fn stream_carries_data_both_ways() {
        let (a_handle, _a_inbound, _b_handle, mut b_inbound) = paired_muxes().await;

        let mut dialer = a_handle.open_stream(Some("/test/1.0.0".into())).await.unwrap();
        dialer.write(Bytes::from_static(b"hello")).await.unwrap();

        let mut listener = b_inbound.recv().await.expect("inbound stream");
        assert_eq!(listener.protocol_name(), Some("/test/1.0.0"));
        assert_eq!(listener.read().await.unwrap(), Bytes::from_static(b"hello"));

        listener.write(Bytes::from_static(b"world")).await.unwrap();
        assert_eq!(dialer.read().await.unwrap(), Bytes::from_static(b"world"));
    }

    #[tokio::test]
    async fn streams_interleave_independently() {
        let (a_handle, _a_inbound, _b_handle, mut b_inbound) = paired_muxes().await;

        let first = a_handle.open_stream(None).await.unwrap();
        let second = a_handle.open_stream(None).await.unwrap();
        first.write(Bytes::from_static(b"one")).await.unwrap();
        second.write(Bytes::from_static(b"two")).await.unwrap();
        first.write(Bytes::from_static(b"three")).await.unwrap();

        let mut stream_1 = b_inbound.recv().await.unwrap();
        let mut stream_2 = b_inbound.recv().await.unwrap();
        assert_eq!(stream_1.read().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(stream_2.read().await.unwrap(), Bytes::from_static(b"two"));
        assert_eq!(stream_1.read().await.unwrap(), Bytes::from_static(b"three"));
    }

    #[tokio::test]
    async fn close_ends_reads_but_allows_writes_back() {
        let (a_handle, _a_inbound, _b_handle, mut b_inbound) = paired_muxes().await;

        let mut dialer = a_handle.open_stream(None).await.unwrap();
        dialer.write(Bytes::from_static(b"last words")).await.unwrap();
        dialer.close().await;

        let mut listener = b_inbound.recv().await.unwrap();
        assert_eq!(
            listener.read().await.unwrap(),
            Bytes::from_static(b"last words")
        );
        assert!(listener.read().await.is_none());

        // Half-closed: the other direction still flows.
        listener.write(Bytes::from_static(b"reply")).await.unwrap();
        assert_eq!(dialer.read().await.unwrap(), Bytes::from_static(b"reply"));
    }

    #[tokio::test]
    async fn reset_tears_the_stream_down() {
        let (a_handle, _a_inbound, _b_handle, mut b_inbound) = paired_muxes().await;

        let dialer = a_handle.open_stream(None).await.unwrap();
        dialer.write(Bytes::from_static(b"x")).await.unwrap();
        let mut listener = b_inbound.recv().await.unwrap();
        assert_eq!(listener.read().await.unwrap(), Bytes::from_static(b"x"));

        dialer.reset().await;
        assert!(listener.read().await.is_none());
        // Writing into a reset stream errors out.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(listener.write(Bytes::from_static(b"y")).await.is_err());
    }
}
