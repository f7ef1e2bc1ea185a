//! One connection per byte pipe: the preface handshake, the single-reader
//! frame loop, the mutex-serialized writer, the shared codec instances, and
//! the stream table.

use crate::flags::{DataFlags, Flags, HeadersFlags, PingFlags, SettingsFlags};
use crate::frame::{Frame, FrameReadError};
use crate::hpack::{self, Indexing};
use crate::response::Response;
use crate::stream::{FlowGate, Stream, StreamError, StreamState, DEFAULT_WINDOW_SIZE};
use crate::types::*;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use enum_map::{enum_map, EnumMap};
use log::{debug, error, trace, warn};
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};

pub const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("connection preface mismatch")]
    PrefaceMismatch,
    #[error(transparent)]
    Frame(#[from] FrameDecodeError),
    #[error(transparent)]
    Hpack(#[from] hpack::HpackError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("stream {0} is gone")]
    StreamGone(StreamId),
    #[error("connection is closed")]
    Closed,
}

impl From<FrameReadError> for ConnectionError {
    fn from(err: FrameReadError) -> Self {
        match err {
            FrameReadError::Io(err) => Self::Io(err),
            FrameReadError::Decode(err) => Self::Frame(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ConnectionState {
    New = 0,
    Open = 1,
    Closed = 2,
}

/// A complete inbound request, handed to the server's dispatch hook when a
/// stream half-closes from the remote side.
#[derive(Debug)]
pub struct RequestParts {
    pub stream: StreamId,
    pub headers: Headers,
    pub body: Bytes,
}

pub(crate) type RequestHook = Arc<dyn Fn(Connection, RequestParts) + Send + Sync>;

enum Role {
    Client,
    Server,
}

struct WriteState {
    sink: Box<dyn AsyncWrite + Send + Unpin>,
    /// Living under the write mutex linearizes its dynamic-table updates
    /// with the blocks that carry them.
    encoder: hpack::Encoder,
}

struct ConnectionInner {
    writer: Mutex<WriteState>,
    streams: DashMap<StreamId, Stream>,
    /// The peer's advertised settings, protocol defaults until it speaks.
    settings: RwLock<EnumMap<SettingsParameter, u32>>,
    state: AtomicU8,
    send_gate: Arc<FlowGate>,
    next_stream_id: AtomicU32,
    highest_remote_stream: AtomicU32,
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

fn default_settings() -> EnumMap<SettingsParameter, u32> {
    enum_map! {
        SettingsParameter::HeaderTableSize => 4096,
        SettingsParameter::EnablePush => 1,
        SettingsParameter::MaxConcurrentStreams => u32::MAX,
        SettingsParameter::InitialWindowSize => 65_535,
        SettingsParameter::MaxFrameSize => 16_384,
        SettingsParameter::MaxHeaderListSize => u32::MAX,
    }
}

impl Connection {
    /// Client-side start: emit the preface and our settings, then run the
    /// read loop in a background task.
    pub async fn client<S>(socket: S) -> Result<Self, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(socket, &Role::Client, None).await
    }

    /// Server-side start: verify the peer's preface, emit our settings as
    /// the first frame, then run the read loop.
    pub(crate) async fn server<S>(socket: S, hook: RequestHook) -> Result<Self, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(socket, &Role::Server, Some(hook)).await
    }

    async fn start<S>(
        socket: S,
        role: &Role,
        hook: Option<RequestHook>,
    ) -> Result<Self, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(socket);

        if matches!(role, Role::Server) {
            let mut preface = [0u8; PREFACE.len()];
            reader
                .read_exact(&mut preface)
                .await
                .map_err(|_| ConnectionError::PrefaceMismatch)?;
            if &preface != PREFACE {
                return Err(ConnectionError::PrefaceMismatch);
            }
        }

        let connection = Self {
            inner: Arc::new(ConnectionInner {
                writer: Mutex::new(WriteState {
                    sink: Box::new(writer),
                    encoder: hpack::Encoder::default(),
                }),
                streams: DashMap::new(),
                settings: RwLock::new(default_settings()),
                state: AtomicU8::new(ConnectionState::New as u8),
                send_gate: Arc::new(FlowGate::new(DEFAULT_WINDOW_SIZE)),
                next_stream_id: AtomicU32::new(1),
                highest_remote_stream: AtomicU32::new(0),
            }),
        };

        match role {
            Role::Client => {
                connection.write_raw(PREFACE).await?;
                connection
                    .write_frame(&Frame::from(vec![
                        (SettingsParameter::EnablePush, 0),
                        (SettingsParameter::MaxFrameSize, 4 * 1024 * 1024),
                        (SettingsParameter::MaxHeaderListSize, 4 * 1024 * 1024),
                    ]))
                    .await?;
            }
            Role::Server => {
                connection
                    .write_frame(&Frame::Settings {
                        flags: SettingsFlags::empty(),
                        params: Vec::new(),
                    })
                    .await?;
            }
        }
        connection.set_state(ConnectionState::Open);

        tokio::spawn(connection.clone().run(reader, hook));
        Ok(connection)
    }

    async fn run<R>(self, mut reader: R, hook: Option<RequestHook>)
    where
        R: AsyncRead + Send + Unpin,
    {
        match self.read_loop(&mut reader, hook.as_ref()).await {
            Ok(()) => trace!("connection closed by peer"),
            Err(err) => {
                error!("connection error: {err}");
                let code = match &err {
                    ConnectionError::Hpack(_) => ErrorType::CompressionError,
                    ConnectionError::Frame(
                        FrameDecodeError::PayloadTooLong(_) | FrameDecodeError::BadPingLength(_),
                    ) => ErrorType::FrameSizeError,
                    ConnectionError::Frame(_) => ErrorType::ProtocolError,
                    _ => ErrorType::InternalError,
                };
                let goaway = Frame::GoAway {
                    last_stream: self.inner.highest_remote_stream.load(Ordering::SeqCst),
                    error: code,
                    debug: Bytes::new(),
                };
                self.write_frame(&goaway).await.ok();
            }
        }
        self.shutdown();
    }

    async fn read_loop<R>(
        &self,
        reader: &mut R,
        hook: Option<&RequestHook>,
    ) -> Result<(), ConnectionError>
    where
        R: AsyncRead + Send + Unpin,
    {
        // the loop is the only reader, so the decoder needs no lock
        let mut decoder = hpack::Decoder::default();
        let mut recv_window = DEFAULT_WINDOW_SIZE;

        while let Some((frame, wire_len)) = Frame::read_from(reader).await? {
            trace!(
                "recv {:?} stream={} len={}",
                frame.frame_type(),
                frame.stream_id(),
                wire_len
            );

            let stream_id = frame.stream_id();
            if stream_id == CONNECTION_STREAM {
                self.handle_connection_frame(frame).await?;
                continue;
            }
            self.inner
                .highest_remote_stream
                .fetch_max(stream_id, Ordering::SeqCst);

            // connection-scope inbound accounting, same policy as per-stream
            if matches!(frame, Frame::Data { .. }) {
                recv_window = recv_window.saturating_sub(wire_len as u32);
                if recv_window < DEFAULT_WINDOW_SIZE / 2 {
                    let increment = DEFAULT_WINDOW_SIZE - recv_window;
                    recv_window = DEFAULT_WINDOW_SIZE;
                    self.write_frame(&Frame::WindowUpdate {
                        stream: CONNECTION_STREAM,
                        increment,
                    })
                    .await?;
                }
            }

            // frames that cannot open a stream are dropped when it is gone
            if !self.inner.streams.contains_key(&stream_id)
                && matches!(
                    frame,
                    Frame::WindowUpdate { .. } | Frame::ResetStream { .. } | Frame::Priority { .. }
                )
            {
                continue;
            }

            // hold the table entry only for the synchronous part; every
            // write below happens after the guard is gone
            let outcome = {
                let mut entry = self
                    .inner
                    .streams
                    .entry(stream_id)
                    .or_insert_with(|| self.new_stream(stream_id));
                let stream = entry.value_mut();
                match stream.receive(frame, wire_len, &mut decoder) {
                    Ok(received) => {
                        let closed = stream.state() == StreamState::Closed;
                        if closed {
                            stream.complete();
                        }
                        let request = if received.request_ready && hook.is_some() {
                            Some(RequestParts {
                                stream: stream_id,
                                headers: stream.headers.clone(),
                                body: stream.body.take().map(BytesMut::freeze).unwrap_or_default(),
                            })
                        } else {
                            None
                        };
                        Ok((received.replies, closed, request))
                    }
                    Err(err) => Err(err),
                }
            };

            match outcome {
                Ok((replies, closed, request)) => {
                    for reply in replies {
                        self.write_frame(&reply).await?;
                    }
                    if closed {
                        self.inner.streams.remove(&stream_id);
                    }
                    if let (Some(request), Some(hook)) = (request, hook) {
                        (**hook)(self.clone(), request);
                    }
                }
                // header-block corruption poisons the shared decoder state
                Err(crate::stream::ReceiveError::Hpack(err)) => return Err(err.into()),
                Err(crate::stream::ReceiveError::Stream(err)) => {
                    warn!("resetting stream {stream_id}: {err}");
                    let code = match err {
                        StreamError::InvalidTransition {
                            state: StreamState::Closed,
                            ..
                        } => ErrorType::StreamClosed,
                        StreamError::InvalidTransition { .. } => ErrorType::ProtocolError,
                    };
                    self.write_frame(&Frame::ResetStream {
                        stream: stream_id,
                        error: code,
                    })
                    .await?;
                    self.inner.streams.remove(&stream_id);
                }
            }
        }
        Ok(())
    }

    async fn handle_connection_frame(&self, frame: Frame) -> Result<(), ConnectionError> {
        match frame {
            Frame::Settings { flags, params } => {
                if flags.contains(SettingsFlags::ACK) {
                    return Ok(());
                }
                self.apply_settings(&params).await;
                self.write_frame(&Frame::settings_ack()).await
            }
            Frame::Ping { flags, data } => {
                if flags.contains(PingFlags::ACK) {
                    Ok(())
                } else {
                    self.write_frame(&Frame::ping_ack(data)).await
                }
            }
            Frame::GoAway { error, debug, .. } => {
                error!("go away: {error:?}");
                if !debug.is_empty() {
                    if let Ok(text) = std::str::from_utf8(&debug) {
                        debug!("go away debug: {text}");
                    }
                }
                Ok(())
            }
            Frame::WindowUpdate { increment, .. } => {
                self.inner.send_gate.release(increment);
                Ok(())
            }
            other => {
                warn!(
                    "ignoring {:?} on the connection stream",
                    other.frame_type()
                );
                Ok(())
            }
        }
    }

    async fn apply_settings(&self, params: &[(SettingsParameter, u32)]) {
        {
            let mut settings = self.inner.settings.write().expect("settings lock");
            for (param, value) in params {
                settings[*param] = *value;
            }
        }
        for (param, value) in params {
            if *param == SettingsParameter::HeaderTableSize {
                // resize the encoder table; the matching update directive
                // leads the next header block we emit
                let mut writer = self.inner.writer.lock().await;
                writer.encoder.set_max_table_size(*value as usize);
            }
        }
    }

    fn new_stream(&self, id: StreamId) -> Stream {
        let settings = self.inner.settings.read().expect("settings lock");
        Stream::new(
            id,
            settings[SettingsParameter::InitialWindowSize],
            DEFAULT_WINDOW_SIZE,
            settings[SettingsParameter::EnablePush] != 0,
        )
    }

    /// Allocate the next client-initiated (odd) stream id and register the
    /// stream with a completion channel for the response.
    pub(crate) fn open_stream(&self) -> (StreamId, oneshot::Receiver<Response>) {
        let id = self.inner.next_stream_id.fetch_add(2, Ordering::SeqCst);
        let mut stream = self.new_stream(id);
        let (tx, rx) = oneshot::channel();
        stream.completion = Some(tx);
        self.inner.streams.insert(id, stream);
        (id, rx)
    }

    pub(crate) fn remove_stream(&self, id: StreamId) {
        self.inner.streams.remove(&id);
    }

    /// Encode and emit a HEADERS frame. The state transition happens before
    /// the block is encoded so a refused send never desyncs the encoder's
    /// dynamic table from what the peer has seen.
    pub(crate) async fn write_headers(
        &self,
        stream: StreamId,
        headers: &Headers,
        flags: HeadersFlags,
        indexing: Indexing,
    ) -> Result<(), ConnectionError> {
        if self.state() == ConnectionState::Closed {
            return Ok(());
        }
        let mut writer = self.inner.writer.lock().await;
        self.with_stream(stream, |s| {
            s.send_event(FrameType::Headers, Flags::from(flags))
        })??;
        let fragment = writer.encoder.encode(headers, indexing);
        let frame = Frame::Headers {
            stream,
            flags,
            fragment,
        };
        let encoded = frame.encode()?;
        trace!("send Headers stream={stream} flags={flags:?}");
        writer.sink.write_all(&encoded).await?;
        writer.sink.flush().await?;
        Ok(())
    }

    /// Emit a body as DATA frames. Chunks stay under the smallest frame
    /// size any peer may enforce, and each chunk waits for stream and
    /// connection send credit before it goes out; a chunk larger than the
    /// initial window could never be granted in one piece.
    pub(crate) async fn write_data(
        &self,
        stream: StreamId,
        flags: DataFlags,
        data: Bytes,
    ) -> Result<(), ConnectionError> {
        const CHUNK: usize = 16_384;
        let gate = self.with_stream(stream, |s| s.send_gate.clone())?;
        let mut offset = 0;
        loop {
            let end = data.len().min(offset + CHUNK);
            let chunk = data.slice(offset..end);
            let last = end == data.len();
            let len = chunk.len() as u32;
            if len > 0 {
                gate.acquire(len).await;
                self.inner.send_gate.acquire(len).await;
            }
            let frame = Frame::Data {
                stream,
                flags: if last {
                    flags
                } else {
                    flags - DataFlags::END_STREAM
                },
                data: chunk,
            };
            self.with_stream(stream, |s| s.send(&frame))??;
            self.write_frame(&frame).await?;
            if last {
                return Ok(());
            }
            offset = end;
        }
    }

    pub(crate) async fn write_frame(&self, frame: &Frame) -> Result<(), ConnectionError> {
        // writes are no-ops once the connection is gone
        if self.state() == ConnectionState::Closed {
            return Ok(());
        }
        let encoded = frame.encode()?;
        let mut writer = self.inner.writer.lock().await;
        trace!(
            "send {:?} stream={} len={}",
            frame.frame_type(),
            frame.stream_id(),
            encoded.len() - crate::frame::FRAME_HEADER_SIZE
        );
        writer.sink.write_all(&encoded).await?;
        writer.sink.flush().await?;
        Ok(())
    }

    async fn write_raw(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let mut writer = self.inner.writer.lock().await;
        writer.sink.write_all(bytes).await?;
        writer.sink.flush().await?;
        Ok(())
    }

    fn with_stream<T>(
        &self,
        id: StreamId,
        f: impl FnOnce(&mut Stream) -> T,
    ) -> Result<T, ConnectionError> {
        let mut entry = self
            .inner
            .streams
            .get_mut(&id)
            .ok_or(ConnectionError::StreamGone(id))?;
        Ok(f(entry.value_mut()))
    }

    fn state(&self) -> ConnectionState {
        match self.inner.state.load(Ordering::SeqCst) {
            0 => ConnectionState::New,
            1 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state.store(state as u8, Ordering::SeqCst);
    }

    /// Tear down: mark closed and drop every stream. Dropping a stream
    /// drops its completion sender, which wakes any caller still waiting.
    fn shutdown(&self) {
        self.set_state(ConnectionState::Closed);
        self.inner.streams.clear();
    }
}
