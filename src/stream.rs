//! Per-stream state: the seven-state lifecycle, merged received headers,
//! the body buffer, and flow-control windows.

use crate::flags::Flags;
use crate::frame::Frame;
use crate::hpack;
use crate::response::Response;
use crate::types::*;
use bytes::BytesMut;
use log::trace;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Notify};

pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("{frame:?} frame not allowed on stream {stream} in {state:?}")]
    InvalidTransition {
        stream: StreamId,
        frame: FrameType,
        state: StreamState,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum ReceiveError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Hpack(#[from] hpack::HpackError),
}

/// Send credit shared between the stream owner and the connection writer.
/// `acquire` parks until the window covers the requested amount; the
/// connection reader releases credit on WINDOW_UPDATE receipt.
#[derive(Debug)]
pub struct FlowGate {
    available: Mutex<u32>,
    notify: Notify,
}

impl FlowGate {
    #[must_use]
    pub fn new(initial: u32) -> Self {
        Self {
            available: Mutex::new(initial),
            notify: Notify::new(),
        }
    }

    pub async fn acquire(&self, amount: u32) {
        loop {
            let notified = self.notify.notified();
            {
                let mut available = self.available.lock().expect("flow gate lock");
                if *available >= amount {
                    *available -= amount;
                    return;
                }
            }
            notified.await;
        }
    }

    pub fn release(&self, amount: u32) {
        let mut available = self.available.lock().expect("flow gate lock");
        *available = available.saturating_add(amount);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn available(&self) -> u32 {
        *self.available.lock().expect("flow gate lock")
    }
}

/// What a received frame produced: frames to write back (flow-control
/// replenishment) and whether a complete request is now waiting (the remote
/// side just half-closed with no header fragments outstanding).
#[derive(Debug, Default)]
pub struct Received {
    pub replies: Vec<Frame>,
    pub request_ready: bool,
}

pub struct Stream {
    pub id: StreamId,
    state: StreamState,
    /// All header lists received on the stream, merged in arrival order.
    pub headers: Headers,
    headers_buffer: BytesMut,
    /// Created lazily on the first DATA frame.
    pub body: Option<BytesMut>,
    recv_window: u32,
    initial_window: u32,
    pub send_gate: Arc<FlowGate>,
    pub push_enabled: bool,
    /// Resolved with the merged response once the stream closes.
    pub completion: Option<oneshot::Sender<Response>>,
    dispatch_pending: bool,
}

impl Stream {
    #[must_use]
    pub fn new(id: StreamId, send_window: u32, initial_window: u32, push_enabled: bool) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            headers: Headers::new(),
            headers_buffer: BytesMut::new(),
            body: None,
            recv_window: initial_window,
            initial_window,
            send_gate: Arc::new(FlowGate::new(send_window)),
            push_enabled,
            completion: None,
            dispatch_pending: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// https://httpwg.org/specs/rfc7540.html#StreamStates
    fn transition(&mut self, recv: bool, ty: FrameType, flags: Flags) -> Result<(), StreamError> {
        use StreamState::*;
        let original = self.state;

        match ty {
            // RST_STREAM closes from anywhere, Idle included
            FrameType::ResetStream => self.state = Closed,
            FrameType::PushPromise => {
                if self.state == Idle {
                    self.state = if recv { ReservedRemote } else { ReservedLocal };
                }
            }
            FrameType::Headers | FrameType::Data => {
                if self.state == Closed {
                    return Err(StreamError::InvalidTransition {
                        stream: self.id,
                        frame: ty,
                        state: self.state,
                    });
                }
                let end = flags.end_stream();
                let next = match (ty, self.state, end) {
                    (FrameType::Headers, Idle, false) => Some(Open),
                    (FrameType::Headers, ReservedRemote, _) if recv => Some(HalfClosedLocal),
                    (FrameType::Headers, ReservedLocal, _) if !recv => Some(HalfClosedRemote),
                    (FrameType::Headers, Idle | Open, true) => {
                        Some(if recv { HalfClosedRemote } else { HalfClosedLocal })
                    }
                    (FrameType::Headers, HalfClosedLocal | HalfClosedRemote, true) => Some(Closed),
                    (FrameType::Data, Idle, _) => {
                        return Err(StreamError::InvalidTransition {
                            stream: self.id,
                            frame: ty,
                            state: self.state,
                        })
                    }
                    (FrameType::Data, Open, true) => {
                        Some(if recv { HalfClosedRemote } else { HalfClosedLocal })
                    }
                    (FrameType::Data, HalfClosedLocal | HalfClosedRemote, true) => Some(Closed),
                    _ => None,
                };
                if let Some(next) = next {
                    self.state = next;
                }
            }
            // everything else is inert for stream state
            _ => {}
        }

        if self.state != original {
            trace!("stream {} {:?} -> {:?}", self.id, original, self.state);
        }
        Ok(())
    }

    /// Account for a frame we are about to write on this stream.
    pub fn send(&mut self, frame: &Frame) -> Result<(), StreamError> {
        self.send_event(frame.frame_type(), frame.flags())
    }

    /// Same as [`send`](Self::send) for callers that build the frame after
    /// the transition (HEADERS, whose fragment comes from the encoder).
    pub(crate) fn send_event(&mut self, ty: FrameType, flags: Flags) -> Result<(), StreamError> {
        self.transition(false, ty, flags)
    }

    /// Apply a received frame: run the state machine, merge headers, buffer
    /// data, and track the inbound window. `wire_len` is the payload length
    /// as it appeared on the wire (padding counts against flow control).
    pub fn receive(
        &mut self,
        frame: Frame,
        wire_len: usize,
        decoder: &mut hpack::Decoder,
    ) -> Result<Received, ReceiveError> {
        let before = self.state;
        let end_headers = frame.flags().end_headers();
        self.transition(true, frame.frame_type(), frame.flags())?;
        let mut received = Received::default();

        match frame {
            Frame::Headers { fragment, .. } | Frame::Continuation { fragment, .. } => {
                self.headers_buffer.extend_from_slice(&fragment);
                if end_headers {
                    self.decode_header_block(decoder)?;
                }
            }
            Frame::Data { data, .. } => {
                self.body
                    .get_or_insert_with(|| BytesMut::with_capacity(data.len()))
                    .extend_from_slice(&data);
                if let Some(update) = self.charge_recv_window(wire_len) {
                    received.replies.push(update);
                }
            }
            Frame::WindowUpdate { increment, .. } => {
                self.send_gate.release(increment);
            }
            // inert: recorded nowhere, tolerated everywhere
            Frame::Priority { .. } | Frame::PushPromise { .. } => {}
            Frame::ResetStream { error, .. } => {
                log::warn!("stream {} reset by peer: {:?}", self.id, error);
            }
            // connection-scoped frames never reach a stream
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => {}
        }

        if before != StreamState::HalfClosedRemote && self.state == StreamState::HalfClosedRemote {
            self.dispatch_pending = true;
        }
        if self.dispatch_pending && self.headers_buffer.is_empty() {
            self.dispatch_pending = false;
            received.request_ready = true;
        }
        Ok(received)
    }

    fn decode_header_block(&mut self, decoder: &mut hpack::Decoder) -> Result<(), hpack::HpackError> {
        let decoded = decoder.decode(&self.headers_buffer)?;
        self.headers.extend(decoded);
        self.headers_buffer.clear();
        Ok(())
    }

    /// Drop the inbound window by `amount`; once it falls under half the
    /// initial window, top it back up with a WINDOW_UPDATE.
    fn charge_recv_window(&mut self, amount: usize) -> Option<Frame> {
        self.recv_window = self.recv_window.saturating_sub(amount as u32);
        if self.recv_window < self.initial_window / 2 {
            let increment = self.initial_window - self.recv_window;
            self.recv_window = self.initial_window;
            if increment > 0 {
                return Some(Frame::WindowUpdate {
                    stream: self.id,
                    increment,
                });
            }
        }
        None
    }

    /// Resolve the waiting caller with everything the stream accumulated.
    pub fn complete(&mut self) {
        if let Some(tx) = self.completion.take() {
            let response = Response {
                headers: self.headers.clone(),
                body: self.body.clone().unwrap_or_default().freeze(),
            };
            // the caller may have given up on the response; that is fine
            tx.send(response).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{DataFlags, HeadersFlags};
    use bytes::Bytes;

    fn headers_frame(stream: StreamId, flags: HeadersFlags) -> Frame {
        Frame::Headers {
            stream,
            flags,
            fragment: Bytes::from_static(&[0x82]), // :method: GET
        }
    }

    fn data_frame(stream: StreamId, flags: DataFlags, len: usize) -> Frame {
        Frame::Data {
            stream,
            flags,
            data: Bytes::from(vec![0u8; len]),
        }
    }

    fn recv(stream: &mut Stream, frame: Frame) -> Received {
        let len = match &frame {
            Frame::Data { data, .. } => data.len(),
            Frame::Headers { fragment, .. } => fragment.len(),
            _ => 0,
        };
        stream
            .receive(frame, len, &mut hpack::Decoder::default())
            .unwrap()
    }

    #[test]
    fn request_lifecycle_without_trailers() {
        let mut stream = Stream::new(1, DEFAULT_WINDOW_SIZE, DEFAULT_WINDOW_SIZE, false);
        assert_eq!(stream.state(), StreamState::Idle);

        let got = recv(&mut stream, headers_frame(1, HeadersFlags::END_HEADERS));
        assert_eq!(stream.state(), StreamState::Open);
        assert!(!got.request_ready);

        let got = recv(&mut stream, data_frame(1, DataFlags::END_STREAM, 4));
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);
        assert!(got.request_ready);
        assert_eq!(stream.headers, vec![(":method".to_owned(), "GET".to_owned())]);
        assert_eq!(stream.body.as_ref().unwrap().len(), 4);

        // our response: headers, data, trailer
        stream
            .send(&headers_frame(1, HeadersFlags::END_HEADERS))
            .unwrap();
        stream.send(&data_frame(1, DataFlags::empty(), 2)).unwrap();
        stream
            .send(&headers_frame(
                1,
                HeadersFlags::END_HEADERS | HeadersFlags::END_STREAM,
            ))
            .unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn data_on_idle_is_rejected() {
        let mut stream = Stream::new(1, DEFAULT_WINDOW_SIZE, DEFAULT_WINDOW_SIZE, false);
        let err = stream
            .receive(
                data_frame(1, DataFlags::empty(), 1),
                1,
                &mut hpack::Decoder::default(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ReceiveError::Stream(StreamError::InvalidTransition {
                frame: FrameType::Data,
                state: StreamState::Idle,
                ..
            })
        ));
    }

    #[test]
    fn nothing_after_closed() {
        let mut stream = Stream::new(1, DEFAULT_WINDOW_SIZE, DEFAULT_WINDOW_SIZE, false);
        recv(
            &mut stream,
            headers_frame(1, HeadersFlags::END_HEADERS | HeadersFlags::END_STREAM),
        );
        stream
            .send(&headers_frame(
                1,
                HeadersFlags::END_HEADERS | HeadersFlags::END_STREAM,
            ))
            .unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.send(&data_frame(1, DataFlags::empty(), 1)).is_err());
        assert!(stream
            .receive(
                headers_frame(1, HeadersFlags::END_HEADERS),
                1,
                &mut hpack::Decoder::default()
            )
            .is_err());
    }

    #[test]
    fn reset_closes_from_idle() {
        let mut stream = Stream::new(1, DEFAULT_WINDOW_SIZE, DEFAULT_WINDOW_SIZE, false);
        recv(
            &mut stream,
            Frame::ResetStream {
                stream: 1,
                error: ErrorType::Cancel,
            },
        );
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn window_replenishes_below_half() {
        let mut stream = Stream::new(1, DEFAULT_WINDOW_SIZE, DEFAULT_WINDOW_SIZE, false);
        recv(&mut stream, headers_frame(1, HeadersFlags::END_HEADERS));

        // 20,000 bytes: 45,535 left, still above half, no update yet
        let got = recv(&mut stream, data_frame(1, DataFlags::empty(), 20_000));
        assert!(got.replies.is_empty());

        // another 20,000: 25,535 left, below half, refill to initial
        let got = recv(&mut stream, data_frame(1, DataFlags::empty(), 20_000));
        assert_eq!(
            got.replies,
            vec![Frame::WindowUpdate {
                stream: 1,
                increment: 40_000,
            }]
        );

        // total credit handed back covers every byte received
        assert!(40_000 >= 2 * 20_000);
    }

    #[test]
    fn headers_merge_across_continuation() {
        let mut stream = Stream::new(1, DEFAULT_WINDOW_SIZE, DEFAULT_WINDOW_SIZE, false);
        let got = recv(
            &mut stream,
            Frame::Headers {
                stream: 1,
                flags: HeadersFlags::END_STREAM,
                fragment: Bytes::from_static(&[0x82]),
            },
        );
        // half-closed but headers still open: not dispatchable yet
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);
        assert!(!got.request_ready);

        let got = recv(
            &mut stream,
            Frame::Continuation {
                stream: 1,
                flags: crate::flags::ContinuationFlags::END_HEADERS,
                fragment: Bytes::from_static(&[0x84]),
            },
        );
        assert!(got.request_ready);
        assert_eq!(
            stream.headers,
            vec![
                (":method".to_owned(), "GET".to_owned()),
                (":path".to_owned(), "/".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn flow_gate_blocks_until_released() {
        let gate = Arc::new(FlowGate::new(10));
        gate.acquire(8).await;
        assert_eq!(gate.available(), 2);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.acquire(5).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        gate.release(20);
        waiter.await.unwrap();
        assert_eq!(gate.available(), 17);
    }
}
