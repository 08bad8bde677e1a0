//! Session layer: framed request/response exchanges over host streams.
//!
//! Every exchange runs on its own stream. An outbound session writes one
//! request and reads at most one response; an inbound session reads one
//! request and may write one response. Frames are a 4-byte little-endian
//! length prefix followed by the message bytes.

use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::messages::Message;
use crate::common::PeerId;
use crate::host::StreamChannel;
use crate::{Error, Result};

const FRAME_HEADER_SIZE: usize = 4;

/// Upper bound on one framed message.
pub(crate) const MAX_FRAME_SIZE: usize = 64 * 1024;

const READ_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Opaque handle identifying one stream; equality is stream identity.
pub(crate) struct SessionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Inbound only: request delivered, waiting for the node to respond or
    /// close.
    Open,
    Reading,
    Writing,
    Closed,
}

/// What a session produced during a poll.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// An inbound session decoded a request.
    Request {
        session: SessionId,
        peer: PeerId,
        message: Message,
    },
    /// An outbound session received its response (and closed).
    Response {
        session: SessionId,
        peer: PeerId,
        message: Message,
    },
    /// A one-shot outbound session flushed its message (and closed).
    Flushed { session: SessionId, peer: PeerId },
    /// An outbound session failed: timeout, transport or decode error.
    Failed {
        session: SessionId,
        peer: PeerId,
        error: Error,
    },
}

struct Session {
    peer: PeerId,
    channel: Box<dyn StreamChannel>,
    direction: Direction,
    state: SessionState,
    expects_response: bool,
    opened_at: Instant,
    frame_len: Option<usize>,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    written: usize,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("direction", &self.direction)
            .field("state", &self.state)
            .finish()
    }
}

#[derive(Debug)]
/// All live sessions of the node, keyed by stream identity.
pub(crate) struct Sessions {
    next_id: u64,
    sessions: HashMap<SessionId, Session>,
    request_timeout: Duration,
}

impl Sessions {
    pub fn new(request_timeout: Duration) -> Self {
        Sessions {
            next_id: 0,
            sessions: HashMap::new(),
            request_timeout,
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    // === Public Methods ===

    /// Start an outbound exchange on a freshly dialed stream.
    ///
    /// With `expects_response` the session reads one response after the
    /// write; without it the flush itself completes the exchange.
    pub fn open_outbound(
        &mut self,
        peer: PeerId,
        channel: Box<dyn StreamChannel>,
        message: &Message,
        expects_response: bool,
    ) -> Result<SessionId> {
        let frame = encode_frame(message)?;

        let id = self.session_id();
        self.sessions.insert(
            id,
            Session {
                peer,
                channel,
                direction: Direction::Outbound,
                state: SessionState::Writing,
                expects_response,
                opened_at: Instant::now(),
                frame_len: None,
                read_buf: Vec::new(),
                write_buf: frame,
                written: 0,
            },
        );

        trace!(session = ?id, ?peer, "Outbound session opened");

        Ok(id)
    }

    /// Track an accepted inbound stream.
    pub fn accept(&mut self, peer: PeerId, channel: Box<dyn StreamChannel>) -> SessionId {
        let id = self.session_id();
        self.sessions.insert(
            id,
            Session {
                peer,
                channel,
                direction: Direction::Inbound,
                state: SessionState::Reading,
                expects_response: false,
                opened_at: Instant::now(),
                frame_len: None,
                read_buf: Vec::new(),
                write_buf: Vec::new(),
                written: 0,
            },
        );

        trace!(session = ?id, ?peer, "Inbound session accepted");

        id
    }

    /// Queue the response of an inbound session.
    ///
    /// A serialize failure closes the session and surfaces the error to the
    /// caller.
    pub fn respond(&mut self, session: SessionId, message: &Message) -> Result<()> {
        let frame = match encode_frame(message) {
            Ok(frame) => frame,
            Err(error) => {
                debug!(?session, ?error, "Closing session: response serialize failed");
                self.close(session);
                return Err(error);
            }
        };

        if let Some(state) = self.sessions.get_mut(&session) {
            state.write_buf = frame;
            state.written = 0;
            state.state = SessionState::Writing;
        }

        Ok(())
    }

    /// Close and forget a session. Closing an unknown or already closed
    /// session is a no-op.
    pub fn close(&mut self, session: SessionId) {
        if let Some(mut state) = self.sessions.remove(&session) {
            state.channel.close();
        }
    }

    /// Drive every session one step and collect what happened.
    pub fn poll(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let timeout = self.request_timeout;

        for (id, session) in self.sessions.iter_mut() {
            if session.state == SessionState::Writing {
                match drive_write(session) {
                    Progress::Done => match session.direction {
                        Direction::Outbound if session.expects_response => {
                            session.state = SessionState::Reading;
                        }
                        Direction::Outbound => {
                            events.push(SessionEvent::Flushed {
                                session: *id,
                                peer: session.peer,
                            });
                            close_in_place(session);
                        }
                        Direction::Inbound => {
                            // Response delivered; the exchange is over.
                            close_in_place(session);
                        }
                    },
                    Progress::Pending => {}
                    Progress::Error(error) => {
                        fail_in_place(*id, session, error.into(), &mut events);
                    }
                }
            }

            if session.state == SessionState::Reading {
                match drive_read(session) {
                    ReadOutcome::Frame(bytes) => match Message::from_bytes(&bytes) {
                        Ok(message) => match session.direction {
                            Direction::Inbound => {
                                session.state = SessionState::Open;
                                events.push(SessionEvent::Request {
                                    session: *id,
                                    peer: session.peer,
                                    message,
                                });
                            }
                            Direction::Outbound => {
                                events.push(SessionEvent::Response {
                                    session: *id,
                                    peer: session.peer,
                                    message,
                                });
                                close_in_place(session);
                            }
                        },
                        Err(error) => {
                            fail_in_place(*id, session, error, &mut events);
                        }
                    },
                    ReadOutcome::Pending => {}
                    ReadOutcome::Eof => {
                        let error = Error::Transport("stream closed mid exchange");
                        fail_in_place(*id, session, error, &mut events);
                    }
                    ReadOutcome::Error(error) => {
                        fail_in_place(*id, session, error.into(), &mut events);
                    }
                }
            }

            if session.state != SessionState::Closed && session.opened_at.elapsed() > timeout {
                fail_in_place(*id, session, Error::Timeout, &mut events);
            }
        }

        self.sessions
            .retain(|_, session| session.state != SessionState::Closed);

        events
    }

    // === Private Methods ===

    fn session_id(&mut self) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        id
    }
}

/// Mark a session closed; `poll` sweeps it from the map afterwards.
fn close_in_place(session: &mut Session) {
    session.channel.close();
    session.state = SessionState::Closed;
}

/// Close a session and report the failure for outbound exchanges. Inbound
/// failures are only logged; nobody upstream is waiting on them.
fn fail_in_place(
    id: SessionId,
    session: &mut Session,
    error: Error,
    events: &mut Vec<SessionEvent>,
) {
    if session.direction == Direction::Outbound {
        events.push(SessionEvent::Failed {
            session: id,
            peer: session.peer,
            error,
        });
    } else {
        debug!(session = ?id, peer = ?session.peer, ?error, "Inbound session failed");
    }

    close_in_place(session);
}

enum Progress {
    Done,
    Pending,
    Error(io::Error),
}

fn drive_write(session: &mut Session) -> Progress {
    while session.written < session.write_buf.len() {
        match session.channel.write(&session.write_buf[session.written..]) {
            Ok(0) => {
                return Progress::Error(io::ErrorKind::WriteZero.into());
            }
            Ok(n) => {
                session.written += n;
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                return Progress::Pending;
            }
            Err(error) => {
                return Progress::Error(error);
            }
        }
    }

    Progress::Done
}

enum ReadOutcome {
    Frame(Vec<u8>),
    Pending,
    Eof,
    Error(io::Error),
}

fn drive_read(session: &mut Session) -> ReadOutcome {
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        let needed = match session.frame_len {
            None => FRAME_HEADER_SIZE - session.read_buf.len(),
            Some(len) => len - session.read_buf.len(),
        };

        match session.channel.read(&mut chunk[..needed.min(READ_CHUNK_SIZE)]) {
            Ok(0) => {
                return ReadOutcome::Eof;
            }
            Ok(n) => {
                session.read_buf.extend_from_slice(&chunk[..n]);

                match session.frame_len {
                    None if session.read_buf.len() == FRAME_HEADER_SIZE => {
                        let mut header = [0u8; FRAME_HEADER_SIZE];
                        header.copy_from_slice(&session.read_buf);
                        let len = u32::from_le_bytes(header) as usize;

                        if len == 0 || len > MAX_FRAME_SIZE {
                            return ReadOutcome::Error(io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!("invalid frame length: {len}"),
                            ));
                        }

                        session.frame_len = Some(len);
                        session.read_buf.clear();
                        session.read_buf.reserve(len);
                    }
                    Some(len) if session.read_buf.len() == len => {
                        session.frame_len = None;
                        return ReadOutcome::Frame(std::mem::take(&mut session.read_buf));
                    }
                    _ => {}
                }
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                return ReadOutcome::Pending;
            }
            Err(error) => {
                return ReadOutcome::Error(error);
            }
        }
    }
}

fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let body = message.to_bytes()?;

    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::MessageSerialize(format!(
            "message of {} bytes exceeds frame limit",
            body.len()
        )));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);

    Ok(frame)
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::common::Key;

    #[derive(Default)]
    struct Pipe {
        a_to_b: VecDeque<u8>,
        b_to_a: VecDeque<u8>,
        a_closed: bool,
        b_closed: bool,
    }

    struct TestChannel {
        pipe: Arc<Mutex<Pipe>>,
        is_a: bool,
    }

    fn duplex() -> (TestChannel, TestChannel) {
        let pipe = Arc::new(Mutex::new(Pipe::default()));

        (
            TestChannel {
                pipe: pipe.clone(),
                is_a: true,
            },
            TestChannel { pipe, is_a: false },
        )
    }

    impl StreamChannel for TestChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut pipe = self.pipe.lock().unwrap();
            let (incoming, remote_closed) = if self.is_a {
                let remote_closed = pipe.b_closed;
                (&mut pipe.b_to_a, remote_closed)
            } else {
                let remote_closed = pipe.a_closed;
                (&mut pipe.a_to_b, remote_closed)
            };

            if incoming.is_empty() {
                if remote_closed {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let n = buf.len().min(incoming.len());
            for byte in buf.iter_mut().take(n) {
                *byte = incoming.pop_front().expect("non empty");
            }
            Ok(n)
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut pipe = self.pipe.lock().unwrap();

            if self.is_a && pipe.b_closed || !self.is_a && pipe.a_closed {
                return Err(io::ErrorKind::BrokenPipe.into());
            }

            let outgoing = if self.is_a {
                &mut pipe.a_to_b
            } else {
                &mut pipe.b_to_a
            };
            outgoing.extend(buf);
            Ok(buf.len())
        }

        fn close(&mut self) {
            let mut pipe = self.pipe.lock().unwrap();
            if self.is_a {
                pipe.a_closed = true;
            } else {
                pipe.b_closed = true;
            }
        }
    }

    #[test]
    fn request_response_roundtrip() {
        let (client_end, server_end) = duplex();

        let mut client = Sessions::new(Duration::from_secs(1));
        let mut server = Sessions::new(Duration::from_secs(1));

        let request = Message::find_node(Key::new(&b"target"[..]));
        let client_peer = PeerId::random();
        let server_peer = PeerId::random();

        client
            .open_outbound(server_peer, Box::new(client_end), &request, true)
            .unwrap();
        let inbound = server.accept(client_peer, Box::new(server_end));

        // Client writes the request; server reads it.
        assert!(client.poll().is_empty());
        let events = server.poll();
        let received = match &events[..] {
            [SessionEvent::Request { message, session, .. }] => {
                assert_eq!(*session, inbound);
                message.clone()
            }
            other => panic!("expected request event, got {other:?}"),
        };
        assert_eq!(received, request);

        // Server echoes a response; client receives it and the exchange ends.
        let mut response = received;
        response.clear();
        server.respond(inbound, &response).unwrap();
        assert!(server.poll().is_empty());
        assert_eq!(server.len(), 0);

        let events = client.poll();
        assert!(matches!(
            &events[..],
            [SessionEvent::Response { message, .. }] if *message == response
        ));
        assert_eq!(client.len(), 0);
    }

    #[test]
    fn one_shot_write_reports_flushed() {
        let (client_end, _server_end) = duplex();
        let mut client = Sessions::new(Duration::from_secs(1));

        let message = Message::ping();
        let peer = PeerId::random();
        let session = client
            .open_outbound(peer, Box::new(client_end), &message, false)
            .unwrap();

        let events = client.poll();
        assert!(matches!(
            &events[..],
            [SessionEvent::Flushed { session: flushed, .. }] if *flushed == session
        ));
        assert_eq!(client.len(), 0);
    }

    #[test]
    fn garbage_frame_fails_outbound_session() {
        let (client_end, mut server_end) = duplex();
        let mut client = Sessions::new(Duration::from_secs(1));

        client
            .open_outbound(
                PeerId::random(),
                Box::new(client_end),
                &Message::ping(),
                true,
            )
            .unwrap();
        assert!(client.poll().is_empty());

        // Hand-written garbage response.
        let garbage = b"not bencode";
        server_end
            .write(&(garbage.len() as u32).to_le_bytes())
            .unwrap();
        server_end.write(garbage).unwrap();

        let events = client.poll();
        assert!(matches!(
            &events[..],
            [SessionEvent::Failed {
                error: Error::MessageDecode(_),
                ..
            }]
        ));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let (client_end, mut server_end) = duplex();
        let mut client = Sessions::new(Duration::from_secs(1));

        client
            .open_outbound(
                PeerId::random(),
                Box::new(client_end),
                &Message::ping(),
                true,
            )
            .unwrap();
        assert!(client.poll().is_empty());

        server_end
            .write(&((MAX_FRAME_SIZE as u32 + 1).to_le_bytes()))
            .unwrap();

        let events = client.poll();
        assert!(matches!(&events[..], [SessionEvent::Failed { .. }]));
    }

    #[test]
    fn silent_peer_times_out() {
        let (client_end, _server_end) = duplex();
        let mut client = Sessions::new(Duration::from_millis(10));

        client
            .open_outbound(
                PeerId::random(),
                Box::new(client_end),
                &Message::ping(),
                true,
            )
            .unwrap();
        assert!(client.poll().is_empty());

        std::thread::sleep(Duration::from_millis(20));

        let events = client.poll();
        assert!(matches!(
            &events[..],
            [SessionEvent::Failed {
                error: Error::Timeout,
                ..
            }]
        ));
        assert_eq!(client.len(), 0);
    }

    #[test]
    fn half_frame_then_eof_is_a_transport_error() {
        let (client_end, mut server_end) = duplex();
        let mut client = Sessions::new(Duration::from_secs(1));

        client
            .open_outbound(
                PeerId::random(),
                Box::new(client_end),
                &Message::ping(),
                true,
            )
            .unwrap();
        assert!(client.poll().is_empty());

        server_end.write(&100u32.to_le_bytes()).unwrap();
        server_end.write(b"partial").unwrap();
        server_end.close();

        let events = client.poll();
        assert!(matches!(
            &events[..],
            [SessionEvent::Failed {
                error: Error::Transport(_),
                ..
            }]
        ));
    }
}
