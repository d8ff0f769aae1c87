//! Per-connection state machine
//!
//! One connection is one task, one arena, one fixed receive buffer. The
//! machine parses incrementally: every parse state that runs out of buffered
//! bytes records itself in `after_read` and hops through `ReadSocket`, so a
//! request arriving one byte at a time walks the same path as one arriving
//! whole.
//!
//! Memory accounting happens in the driver loop, not in the states: after
//! every step the arena-usage delta is charged to the bucket of the state
//! that ran, and a bucket crossing its ceiling forces a 400. The buckets and
//! the arena itself roll back to the post-accept marker between requests, so
//! a connection's footprint is bounded by its largest request, not its
//! lifetime.

use crate::codec::{self, Request, Response};
use crate::config::ServerOptions;
use crate::error::HttpError;
use crate::router::Router;
use crate::tcp::TcpStream;
use std::rc::Rc;
use std::sync::Arc;
use strand_core::{kdebug, kwarn, Arena, Buffer, Marker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Reset,
    ReadSocket,
    ParseRequestLine,
    ParseHeaders,
    ParseContent,
    ParseChunkSize,
    ParseChunkData,
    ParseTrailers,
    ProcessRequest,
    WriteResponse,
    BadRequest,
    Close,
}

const PHASE_HEADERS: usize = 0;
const PHASE_CONTENT: usize = 1;
const PHASE_TRAILERS: usize = 2;
const PHASE_RESPONSE: usize = 3;

/// Which memory bucket a state's allocations are charged to.
fn phase_of(state: State) -> Option<usize> {
    match state {
        State::ParseRequestLine | State::ParseHeaders => Some(PHASE_HEADERS),
        State::ParseContent | State::ParseChunkSize | State::ParseChunkData => {
            Some(PHASE_CONTENT)
        }
        State::ParseTrailers => Some(PHASE_TRAILERS),
        State::ProcessRequest | State::BadRequest => Some(PHASE_RESPONSE),
        _ => None,
    }
}

pub struct Conn {
    arena: Rc<Arena>,
    stream: TcpStream,
    router: Arc<Router>,
    peer: String,
    inactivity_timeout_ms: u64,
    /// Per-phase ceilings, indexed by `PHASE_*`.
    limits: [usize; 4],
    /// Bytes charged per phase this request epoch.
    mem: [usize; 4],
    /// Fixed-size receive buffer; allocated before `marker`, so it survives
    /// the per-request arena rollback.
    line_buffer: Buffer,
    marker: Marker,
    content_buffer: Buffer,
    response_buffer: Buffer,
    request: Request,
    response: Response,
    /// Scan position for CRLF search; the candidate terminator is the pair
    /// at `[cursor-2, cursor)`, so 2 means "start of buffer".
    cursor: usize,
    /// Body bytes still expected (fixed-length remainder or current chunk).
    chunk_remaining: usize,
    state: State,
    after_read: State,
}

impl Conn {
    pub fn new(
        arena: Rc<Arena>,
        stream: TcpStream,
        router: Arc<Router>,
        options: &ServerOptions,
    ) -> Result<Self, HttpError> {
        let peer = stream.peer();
        let line_buffer = Buffer::with_capacity(arena.clone(), options.line_buffer_size)?;
        let marker = arena.mark();
        let content_buffer = Buffer::with_capacity(arena.clone(), 256)?;
        let response_buffer = Buffer::with_capacity(arena.clone(), 512)?;
        let request = Request::new(arena.clone());
        let response = Response::new(arena.clone())?;
        Ok(Self {
            stream,
            router,
            peer,
            inactivity_timeout_ms: options.inactivity_timeout_ms,
            limits: [
                options.mem_headers_max,
                options.mem_content_max,
                options.mem_trailers_max,
                options.mem_response_max,
            ],
            mem: [0; 4],
            line_buffer,
            marker,
            content_buffer,
            response_buffer,
            request,
            response,
            cursor: 2,
            chunk_remaining: 0,
            state: State::ParseRequestLine,
            after_read: State::ParseRequestLine,
            arena,
        })
    }

    /// Drive the machine until the connection closes. The entry point for
    /// the connection's task.
    pub fn run(mut self) {
        loop {
            kdebug!(
                "conn {}: {:?} mem=[h:{} c:{} t:{} r:{}] used={} rd={} wr={}",
                self.peer,
                self.state,
                self.mem[PHASE_HEADERS],
                self.mem[PHASE_CONTENT],
                self.mem[PHASE_TRAILERS],
                self.mem[PHASE_RESPONSE],
                self.arena.used(),
                self.line_buffer.len(),
                self.response_buffer.len(),
            );

            if self.state == State::Close {
                kdebug!("conn {}: closed", self.peer);
                return;
            }

            let before = self.state;
            let begin = self.arena.used();
            let result = self.step();
            let delta = self.arena.used().saturating_sub(begin);

            if let Some(phase) = phase_of(before) {
                self.mem[phase] += delta;
                if self.mem[phase] > self.limits[phase] && before != State::BadRequest {
                    kwarn!(
                        "conn {}: phase {} over ceiling ({} > {})",
                        self.peer,
                        phase,
                        self.mem[phase],
                        self.limits[phase]
                    );
                    self.state = State::BadRequest;
                }
            }

            match result {
                Ok(()) => {}
                Err(e @ (HttpError::Timeout | HttpError::Cancelled)) => {
                    kdebug!("conn {}: {}", self.peer, e);
                    return;
                }
                Err(e) => {
                    kwarn!("conn {}: {}", self.peer, e);
                    return;
                }
            }
        }
    }

    fn step(&mut self) -> Result<(), HttpError> {
        match self.state {
            State::Reset => self.reset(),
            State::ReadSocket => self.read_socket(),
            State::ParseRequestLine => self.parse_request_line(),
            State::ParseHeaders => self.parse_headers(),
            State::ParseContent => self.parse_content(),
            State::ParseChunkSize => self.parse_chunk_size(),
            State::ParseChunkData => self.parse_chunk_data(),
            State::ParseTrailers => self.parse_trailers(),
            State::ProcessRequest => self.process_request(),
            State::WriteResponse => self.write_response(),
            State::BadRequest => self.bad_request(),
            State::Close => Ok(()),
        }
    }

    /// Advance `cursor` until the pair `[cursor-2, cursor)` is CRLF.
    /// Returns the line length (terminator excluded); `cursor` is then the
    /// full consumed length including the terminator.
    fn find_line(&mut self) -> Option<usize> {
        let data = self.line_buffer.as_slice();
        while self.cursor <= data.len() {
            if &data[self.cursor - 2..self.cursor] == b"\r\n" {
                return Some(self.cursor - 2);
            }
            self.cursor += 1;
        }
        None
    }

    /// Drop `n` consumed bytes from the front of the receive buffer and pull
    /// the scan cursor back with them.
    fn shl(&mut self, n: usize) {
        self.line_buffer.drain_front(n);
        self.cursor = self.cursor.saturating_sub(n).max(2);
    }

    /// Park in `ReadSocket` and come back to `resume` once bytes arrive.
    fn need_more(&mut self, resume: State) -> Result<(), HttpError> {
        self.after_read = resume;
        self.state = State::ReadSocket;
        Ok(())
    }

    fn read_socket(&mut self) -> Result<(), HttpError> {
        if self.line_buffer.spare_mut().is_empty() {
            // A full buffer with no parsable line in it means the request
            // line or a field exceeds what we accept.
            self.state = State::BadRequest;
            return Ok(());
        }
        let timeout = self.inactivity_timeout_ms;
        match self.stream.recv(self.line_buffer.spare_mut(), timeout) {
            Ok(0) => self.state = State::Close,
            Ok(n) => {
                self.line_buffer.advance(n);
                self.state = self.after_read;
            }
            Err(HttpError::Io(e)) if e == libc::ECONNRESET || e == libc::EPROTO => {
                self.state = State::Close;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn parse_request_line(&mut self) -> Result<(), HttpError> {
        let Some(end) = self.find_line() else {
            return self.need_more(State::ParseRequestLine);
        };
        let consumed = self.cursor;
        let line = self.line_buffer.as_slice();
        match codec::parse_reqline(&self.arena, &mut self.request, &line[..end]) {
            Ok(()) => self.state = State::ParseHeaders,
            Err(HttpError::Malformed) => self.state = State::BadRequest,
            Err(e) => return Err(e),
        }
        self.shl(consumed);
        Ok(())
    }

    fn parse_headers(&mut self) -> Result<(), HttpError> {
        loop {
            let Some(end) = self.find_line() else {
                return self.need_more(State::ParseHeaders);
            };
            let consumed = self.cursor;

            if end == 0 {
                self.shl(consumed);
                match codec::validate_request(&self.arena, &mut self.request) {
                    Ok(()) => {
                        if self.request.content_length > 0 {
                            self.chunk_remaining = self.request.content_length;
                            self.state = State::ParseContent;
                        } else if self.request.chunked {
                            self.state = State::ParseChunkSize;
                        } else {
                            self.state = State::ProcessRequest;
                        }
                    }
                    Err(HttpError::Malformed) => self.state = State::BadRequest,
                    Err(e) => return Err(e),
                }
                return Ok(());
            }

            let line = self.line_buffer.as_slice();
            match codec::parse_field(&mut self.request.headers, &line[..end]) {
                Ok(()) => {}
                Err(HttpError::Malformed) => {
                    self.shl(consumed);
                    self.state = State::BadRequest;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
            self.shl(consumed);
        }
    }

    /// Fixed-length body: move buffered bytes into the content buffer until
    /// `Content-Length` is satisfied.
    fn parse_content(&mut self) -> Result<(), HttpError> {
        let take = self.line_buffer.len().min(self.chunk_remaining);
        if take > 0 {
            let line = self.line_buffer.as_slice();
            self.content_buffer.write(&line[..take])?;
            self.shl(take);
            self.chunk_remaining -= take;
        }
        if self.chunk_remaining > 0 {
            return self.need_more(State::ParseContent);
        }
        self.state = State::ProcessRequest;
        Ok(())
    }

    fn parse_chunk_size(&mut self) -> Result<(), HttpError> {
        let Some(end) = self.find_line() else {
            return self.need_more(State::ParseChunkSize);
        };
        let consumed = self.cursor;
        let line = self.line_buffer.as_slice();
        // Extensions after the hex digits are tolerated and ignored.
        match codec::parse_hex_prefix(&line[..end]) {
            Ok((size, _)) => {
                self.chunk_remaining = size;
                self.state = if size == 0 {
                    State::ParseTrailers
                } else {
                    State::ParseChunkData
                };
            }
            Err(HttpError::Malformed) => self.state = State::BadRequest,
            Err(e) => return Err(e),
        }
        self.shl(consumed);
        Ok(())
    }

    /// Chunk payload, then the CRLF that closes the chunk. The payload may
    /// arrive across many reads; only whole buffered prefixes are moved, so
    /// a CR that might start the terminator is never swallowed as data.
    fn parse_chunk_data(&mut self) -> Result<(), HttpError> {
        let take = self.line_buffer.len().min(self.chunk_remaining);
        if take > 0 {
            let line = self.line_buffer.as_slice();
            self.content_buffer.write(&line[..take])?;
            self.shl(take);
            self.chunk_remaining -= take;
        }
        if self.chunk_remaining > 0 {
            return self.need_more(State::ParseChunkData);
        }
        if self.line_buffer.len() < 2 {
            return self.need_more(State::ParseChunkData);
        }
        if &self.line_buffer.as_slice()[..2] != b"\r\n" {
            self.state = State::BadRequest;
            return Ok(());
        }
        self.shl(2);
        self.state = State::ParseChunkSize;
        Ok(())
    }

    fn parse_trailers(&mut self) -> Result<(), HttpError> {
        loop {
            let Some(end) = self.find_line() else {
                return self.need_more(State::ParseTrailers);
            };
            let consumed = self.cursor;

            if end == 0 {
                self.shl(consumed);
                self.state = State::ProcessRequest;
                return Ok(());
            }

            let line = self.line_buffer.as_slice();
            match codec::parse_field(&mut self.request.trailers, &line[..end]) {
                Ok(()) => {}
                Err(HttpError::Malformed) => {
                    self.shl(consumed);
                    self.state = State::BadRequest;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
            self.shl(consumed);
        }
    }

    fn process_request(&mut self) -> Result<(), HttpError> {
        let content = self.content_buffer.as_slice();
        self.request.set_content(content);
        self.router
            .handle(&self.arena, &mut self.request, &mut self.response)?;
        codec::write_response(&mut self.response_buffer, &self.response, self.request.close)?;
        self.state = State::WriteResponse;
        Ok(())
    }

    fn bad_request(&mut self) -> Result<(), HttpError> {
        self.request.close = true;
        codec::write_status(&mut self.response, 400)?;
        self.response_buffer.clear();
        codec::write_response(&mut self.response_buffer, &self.response, true)?;
        self.state = State::WriteResponse;
        Ok(())
    }

    fn write_response(&mut self) -> Result<(), HttpError> {
        let timeout = self.inactivity_timeout_ms;
        let sent = {
            let buf = self.response_buffer.as_slice();
            self.stream.send(buf, timeout)
        };
        let n = match sent {
            Ok(n) => n,
            Err(HttpError::Io(e))
                if e == libc::ECONNRESET || e == libc::EPIPE || e == libc::EPROTO =>
            {
                self.state = State::Close;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if n == 0 {
            self.state = State::Close;
            return Ok(());
        }
        self.response_buffer.drain_front(n);
        if !self.response_buffer.is_empty() {
            // Partial write, stay here and send the rest.
            return Ok(());
        }
        if self.request.close || strand_runtime::cancelled() {
            self.stream.shutdown();
            self.state = State::Close;
        } else {
            self.state = State::Reset;
        }
        Ok(())
    }

    /// Start the next request epoch: roll the arena back to the post-accept
    /// marker and rebuild the per-request structures. Bytes already received
    /// past the previous request stay in the receive buffer, which is what
    /// makes pipelining work.
    fn reset(&mut self) -> Result<(), HttpError> {
        self.arena.free(self.marker);
        self.cursor = 2;
        self.chunk_remaining = 0;
        self.mem = [0; 4];
        self.content_buffer = Buffer::with_capacity(self.arena.clone(), 256)?;
        self.response_buffer = Buffer::with_capacity(self.arena.clone(), 512)?;
        self.request = Request::new(self.arena.clone());
        self.response = Response::new(self.arena.clone())?;
        self.state = State::ParseRequestLine;
        Ok(())
    }
}
