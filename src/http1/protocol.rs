/*
 * Copyright (C) 2020-2023 Fanout, Inc.
 * Copyright (C) 2024 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::buffer::FeedBuffer;
use crate::http1::decode::{
    find_crlf, trim_ascii, ContentDecode, DecodeStep, TransferDecode, TransferDecoder,
};
use log::{debug, trace};
use std::io;
use std::ops::Range;
use std::str;

pub const LINE_LENGTH_MAX: usize = 4096;
pub const EMPTY_LINES_MAX: u32 = 10;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Mode {
    // try a request line first, fall back to a status line
    Auto,
    Request,
    Response,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub max_line_len: usize,
    pub max_empty_lines: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Auto,
            max_line_len: LINE_LENGTH_MAX,
            max_empty_lines: EMPTY_LINES_MAX,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad request")]
    BadRequest,

    #[error("line too long")]
    LineTooLong,

    #[error("invalid content length")]
    InvalidContentLength,

    #[error("invalid chunk size")]
    InvalidChunkSize,

    #[error("invalid chunk suffix")]
    InvalidChunkSuffix,

    #[error(transparent)]
    Io(#[from] io::Error),
}

// a single externally visible output of the parser. payloads borrow
// from the parser's buffer and stay valid until the next feed call
#[derive(Debug, PartialEq, Eq)]
pub enum Event<'buf> {
    Request {
        method: &'buf [u8],
        uri: &'buf [u8],
    },

    Response {
        code: u16,
        reason: &'buf [u8],
    },

    Header {
        name: &'buf [u8],
        value: &'buf [u8],
    },

    HeadersComplete,

    BodyChunk(&'buf [u8]),

    // more input required. feed again when bytes arrive
    NeedBytes,

    // message complete. the payload is the unconsumed suffix, possibly
    // the start of a pipelined successor message
    Done(&'buf [u8]),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Phase {
    // next: FirstLine, Header
    FirstLine,

    // next: Header, Body
    Header,

    // next: Body, Done
    Body,

    // terminal
    Done,
}

enum BodyState {
    // framing not yet selected
    Waiting,

    Streaming(TransferDecoder),

    // final body bytes emitted, Done pending
    Finished,
}

// internal event payload as buffer ranges, resolved to borrows after
// the mutable drive pass
enum Step {
    Request { method: Range<usize>, uri: Range<usize> },
    Response { code: u16, reason: Range<usize> },
    Header { name: Range<usize>, value: Range<usize> },
    HeadersComplete,
    BodyRaw(Range<usize>),
    BodyDecoded,
    NeedBytes,
    Done,
}

enum FramingUpdate {
    ContentLength(usize),
    TransferEncoding(String),
    Connection(Vec<String>),
    ContentType(String),
    Location(Vec<u8>),
    None,
}

pub struct Parser {
    mode: Mode,
    max_line_len: usize,
    max_empty_lines: u32,
    empty_lines: u32,
    phase: Phase,
    buf: FeedBuffer,
    version: Option<(u8, u8)>,
    method: Option<Vec<u8>>,
    content_length: Option<usize>,
    transfer_encoding: Option<String>,
    connection: Option<Vec<String>>,
    content_type: Option<String>,
    location: Option<Vec<u8>>,
    body: BodyState,
    transfer_decoder: Option<Box<dyn TransferDecode>>,
    content_decoder: Option<Box<dyn ContentDecode>>,
    scratch: Vec<u8>,
}

impl Parser {
    pub fn new(config: Config) -> Self {
        Self {
            mode: config.mode,
            max_line_len: config.max_line_len,
            max_empty_lines: config.max_empty_lines,
            empty_lines: 0,
            phase: Phase::FirstLine,
            buf: FeedBuffer::new(),
            version: None,
            method: None,
            content_length: None,
            transfer_encoding: None,
            connection: None,
            content_type: None,
            location: None,
            body: BodyState::Waiting,
            transfer_decoder: None,
            content_decoder: None,
            scratch: Vec::new(),
        }
    }

    // install a decoder for a transfer coding the core does not know.
    // it takes over body framing when the message carries a
    // transfer-encoding other than chunked
    pub fn with_transfer_decoder(mut self, decoder: Box<dyn TransferDecode>) -> Self {
        self.transfer_decoder = Some(decoder);

        self
    }

    pub fn with_content_decoder(mut self, decoder: Box<dyn ContentDecode>) -> Self {
        self.content_decoder = Some(decoder);

        self
    }

    pub fn version(&self) -> Option<(u8, u8)> {
        self.version
    }

    pub fn method(&self) -> Option<&[u8]> {
        self.method.as_deref()
    }

    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    pub fn transfer_encoding(&self) -> Option<&str> {
        self.transfer_encoding.as_deref()
    }

    pub fn connection(&self) -> Option<&[String]> {
        self.connection.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn location(&self) -> Option<&[u8]> {
        self.location.as_deref()
    }

    // unconsumed input
    pub fn buffered(&self) -> &[u8] {
        self.buf.data()
    }

    // append src and advance until an event is produced. call with an
    // empty slice to keep draining buffered input after a non-terminal
    // event. must not be called after Done
    pub fn feed(&mut self, src: &[u8]) -> Result<Event<'_>, Error> {
        assert_ne!(self.phase, Phase::Done, "fed after done");

        self.buf.compact();

        if !src.is_empty() {
            self.buf.extend_from_slice(src);
        }

        let step = self.drive()?;

        Ok(self.emit(step))
    }

    // signal end of input from the transport. completes a
    // close-delimited response body; anywhere else mid-message this is
    // an unexpected eof
    pub fn finish(&mut self) -> Result<Event<'_>, Error> {
        assert_ne!(self.phase, Phase::Done, "finished after done");

        self.buf.compact();

        if self.phase != Phase::Body {
            return Err(Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
        }

        if matches!(self.body, BodyState::Waiting) {
            if let Some(step) = self.select_framing() {
                return Ok(self.emit(step));
            }
        }

        let step = if matches!(
            self.body,
            BodyState::Streaming(TransferDecoder::CloseDelimited)
        ) {
            if !self.buf.is_empty() {
                // undrained input: flush it as the final body bytes
                let start = self.buf.pos();
                let len = self.buf.len();

                self.buf.consume(len);
                self.body = BodyState::Finished;

                self.body_step(start..(start + len))?
            } else {
                self.phase = Phase::Done;

                Step::Done
            }
        } else if matches!(self.body, BodyState::Finished) {
            self.phase = Phase::Done;

            Step::Done
        } else {
            return Err(Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
        };

        Ok(self.emit(step))
    }

    fn drive(&mut self) -> Result<Step, Error> {
        match self.phase {
            Phase::FirstLine => self.parse_first_line(),
            Phase::Header => self.parse_header_line(),
            Phase::Body => self.drive_body(),
            Phase::Done => unreachable!(),
        }
    }

    fn emit(&self, step: Step) -> Event<'_> {
        match step {
            Step::Request { method, uri } => Event::Request {
                method: self.buf.slice(method),
                uri: self.buf.slice(uri),
            },
            Step::Response { code, reason } => Event::Response {
                code,
                reason: self.buf.slice(reason),
            },
            Step::Header { name, value } => Event::Header {
                name: self.buf.slice(name),
                value: self.buf.slice(value),
            },
            Step::HeadersComplete => Event::HeadersComplete,
            Step::BodyRaw(range) => Event::BodyChunk(self.buf.slice(range)),
            Step::BodyDecoded => Event::BodyChunk(&self.scratch),
            Step::NeedBytes => Event::NeedBytes,
            Step::Done => Event::Done(self.buf.data()),
        }
    }

    fn parse_first_line(&mut self) -> Result<Step, Error> {
        loop {
            let data = self.buf.data();

            let lf = match data.iter().position(|&b| b == b'\n') {
                Some(pos) => pos,
                None => {
                    if data.len() > self.max_line_len {
                        return Err(Error::LineTooLong);
                    }

                    return Ok(Step::NeedBytes);
                }
            };

            if lf > self.max_line_len {
                return Err(Error::LineTooLong);
            }

            // bare LF, including before any line. empty lines must use CRLF
            if lf == 0 || data[lf - 1] != b'\r' {
                return Err(Error::BadRequest);
            }

            // empty line before the start line
            if lf == 1 {
                if self.empty_lines == self.max_empty_lines {
                    return Err(Error::BadRequest);
                }

                self.empty_lines += 1;
                self.buf.consume(2);

                continue;
            }

            let line_len = lf - 1;

            return match self.mode {
                Mode::Request => self.parse_request_line(line_len),
                Mode::Response => self.parse_status_line(line_len),
                Mode::Auto => match self.parse_request_line(line_len) {
                    Err(Error::BadRequest) => self.parse_status_line(line_len),
                    ret => ret,
                },
            };
        }
    }

    // METHOD SP URI SP HTTP/M.N, already known to be CRLF-terminated.
    // leaves all state untouched on error so auto mode can retry the
    // same line as a status line
    fn parse_request_line(&mut self, line_len: usize) -> Result<Step, Error> {
        let base = self.buf.pos();
        let data = self.buf.data();
        let line = &data[..line_len];

        let sp1 = match line.iter().position(|&b| b == b' ') {
            Some(pos) => pos,
            None => return Err(Error::BadRequest),
        };

        if line[..sp1].contains(&b'\r') {
            return Err(Error::BadRequest);
        }

        let rest = &line[(sp1 + 1)..];

        let sp2 = match rest.iter().position(|&b| b == b' ') {
            Some(pos) => pos,
            None => return Err(Error::BadRequest),
        };

        if rest[..sp2].contains(&b'\r') {
            return Err(Error::BadRequest);
        }

        let version = match parse_version(&rest[(sp2 + 1)..]) {
            Some(version) => version,
            None => return Err(Error::BadRequest),
        };

        let method = base..(base + sp1);
        let uri = (base + sp1 + 1)..(base + sp1 + 1 + sp2);
        let method_owned = line[..sp1].to_vec();

        self.method = Some(method_owned);
        self.version = Some(version);
        self.phase = Phase::Header;
        self.buf.consume(line_len + 2);

        Ok(Step::Request { method, uri })
    }

    // HTTP/M.N SP CODE SP REASON
    fn parse_status_line(&mut self, line_len: usize) -> Result<Step, Error> {
        let base = self.buf.pos();
        let data = self.buf.data();
        let line = &data[..line_len];

        if line.len() < 10 || line[8] != b' ' {
            return Err(Error::BadRequest);
        }

        let version = match parse_version(&line[..8]) {
            Some(version) => version,
            None => return Err(Error::BadRequest),
        };

        let rest = &line[9..];

        let (code_end, reason) = match rest.iter().position(|&b| b == b' ') {
            Some(pos) => (pos, (base + 9 + pos + 1)..(base + line_len)),
            None => (rest.len(), (base + line_len)..(base + line_len)),
        };

        let code_str = match str::from_utf8(&rest[..code_end]) {
            Ok(s) => s,
            Err(_) => return Err(Error::BadRequest),
        };

        let code: u16 = match code_str.parse() {
            Ok(code) => code,
            Err(_) => return Err(Error::BadRequest),
        };

        self.version = Some(version);
        self.phase = Phase::Header;
        self.buf.consume(line_len + 2);

        Ok(Step::Response { code, reason })
    }

    fn parse_header_line(&mut self) -> Result<Step, Error> {
        loop {
            let data = self.buf.data();

            let crlf = match find_crlf(data) {
                Some(pos) => pos,
                None => return Ok(Step::NeedBytes),
            };

            // blank line ends the headers
            if crlf == 0 {
                self.buf.consume(2);
                self.phase = Phase::Body;

                return Ok(Step::HeadersComplete);
            }

            // obs-fold lookahead: the byte after the CRLF decides
            // whether this line is complete
            if data.len() < crlf + 3 {
                return Ok(Step::NeedBytes);
            }

            let after = data[crlf + 2];

            if after == b' ' || after == b'\t' {
                // splice out the CRLF, keeping the fold whitespace
                self.buf.splice_out(crlf, 2);

                continue;
            }

            let base = self.buf.pos();
            let line = &data[..crlf];

            let (name, value) = match find_separator(line) {
                Some(pos) => (base..(base + pos), (base + pos + 2)..(base + crlf)),
                None => (base..(base + crlf), (base + crlf)..(base + crlf)),
            };

            self.note_framing_header(name.clone(), value.clone())?;
            self.buf.consume(crlf + 2);

            return Ok(Step::Header { name, value });
        }
    }

    // headers that steer body framing, matched case-insensitively. the
    // emitted event passes the original bytes through verbatim
    fn note_framing_header(
        &mut self,
        name: Range<usize>,
        value: Range<usize>,
    ) -> Result<(), Error> {
        let name = self.buf.slice(name);
        let value = self.buf.slice(value);

        let update = if name.eq_ignore_ascii_case(b"content-length") {
            let token = trim_ascii(value);

            if token.is_empty() || !token.iter().all(|b| b.is_ascii_digit()) {
                return Err(Error::InvalidContentLength);
            }

            // valid utf-8 per the check above
            let len: usize = str::from_utf8(token)
                .unwrap()
                .parse()
                .map_err(|_| Error::InvalidContentLength)?;

            if let Some(prev) = self.content_length {
                if prev != len {
                    return Err(Error::InvalidContentLength);
                }
            }

            FramingUpdate::ContentLength(len)
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            FramingUpdate::TransferEncoding(lowercase(trim_ascii(value)))
        } else if name.eq_ignore_ascii_case(b"connection") {
            let tokens = value
                .split(|&b| b == b',')
                .map(|t| lowercase(trim_ascii(t)))
                .collect();

            FramingUpdate::Connection(tokens)
        } else if name.eq_ignore_ascii_case(b"content-type") {
            FramingUpdate::ContentType(lowercase(trim_ascii(value)))
        } else if name.eq_ignore_ascii_case(b"location") {
            FramingUpdate::Location(value.to_vec())
        } else {
            FramingUpdate::None
        };

        match update {
            FramingUpdate::ContentLength(len) => self.content_length = Some(len),
            FramingUpdate::TransferEncoding(v) => self.transfer_encoding = Some(v),
            FramingUpdate::Connection(v) => self.connection = Some(v),
            FramingUpdate::ContentType(v) => self.content_type = Some(v),
            FramingUpdate::Location(v) => self.location = Some(v),
            FramingUpdate::None => {}
        }

        Ok(())
    }

    fn drive_body(&mut self) -> Result<Step, Error> {
        if let BodyState::Waiting = self.body {
            if let Some(step) = self.select_framing() {
                return Ok(step);
            }
        }

        if let BodyState::Finished = self.body {
            self.phase = Phase::Done;

            return Ok(Step::Done);
        }

        let decoder = match &mut self.body {
            BodyState::Streaming(decoder) => decoder,
            _ => unreachable!(),
        };

        let pos = self.buf.pos();

        match decoder.decode(self.buf.data())? {
            DecodeStep::Data { body, consumed } => {
                self.buf.consume(consumed);

                self.body_step((pos + body.start)..(pos + body.end))
            }
            DecodeStep::Boundary { body, consumed } => {
                self.buf.consume(consumed);

                self.body_step((pos + body.start)..(pos + body.end))
            }
            DecodeStep::Finished { body, consumed } => {
                self.buf.consume(consumed);

                match body {
                    Some(body) => {
                        // trailing residual surfaces on the next drive
                        self.body = BodyState::Finished;

                        self.body_step((pos + body.start)..(pos + body.end))
                    }
                    None => {
                        self.phase = Phase::Done;

                        trace!("message done, {} residual bytes", self.buf.len());

                        Ok(Step::Done)
                    }
                }
            }
            DecodeStep::NeedBytes { consumed } => {
                self.buf.consume(consumed);

                Ok(Step::NeedBytes)
            }
        }
    }

    // select transfer framing from the accumulated header state.
    // returns Some(Done) when the message has no body
    fn select_framing(&mut self) -> Option<Step> {
        if self.transfer_encoding.as_deref() == Some("chunked") {
            debug!("chunked transfer decoding");

            self.body = BodyState::Streaming(TransferDecoder::Chunked {
                left: None,
                size: 0,
            });

            return None;
        }

        if self.transfer_encoding.is_some() {
            if let Some(decoder) = self.transfer_decoder.take() {
                debug!("injected transfer decoding");

                self.body = BodyState::Streaming(TransferDecoder::Custom(decoder));

                return None;
            }
        }

        let is_head = self.method.as_deref() == Some(b"HEAD".as_slice());

        if self.content_length == Some(0) || is_head {
            trace!("no body");

            self.phase = Phase::Done;

            return Some(Step::Done);
        }

        if let Some(total) = self.content_length {
            debug!("identity body, {} bytes", total);

            self.body = BodyState::Streaming(TransferDecoder::Identity { streamed: 0, total });

            return None;
        }

        if self.method.is_some() {
            // request without framing headers has no body
            self.phase = Phase::Done;

            return Some(Step::Done);
        }

        // response without framing headers: body runs until the caller
        // signals end of input via finish()
        debug!("close-delimited response body");

        self.body = BodyState::Streaming(TransferDecoder::CloseDelimited);

        None
    }

    // route body bytes through the injected content decoder, if any
    fn body_step(&mut self, body: Range<usize>) -> Result<Step, Error> {
        let decoder = match &mut self.content_decoder {
            Some(decoder) => decoder,
            None => return Ok(Step::BodyRaw(body)),
        };

        self.scratch.clear();

        decoder.decode(self.buf.slice(body), &mut self.scratch)?;

        Ok(Step::BodyDecoded)
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

// literal HTTP/ then single digits, major.minor
fn parse_version(src: &[u8]) -> Option<(u8, u8)> {
    if src.len() != 8 || &src[..5] != b"HTTP/" {
        return None;
    }

    if !src[5].is_ascii_digit() || src[6] != b'.' || !src[7].is_ascii_digit() {
        return None;
    }

    Some((src[5] - b'0', src[7] - b'0'))
}

// first ": " in the line. a line without one is all name, empty value
fn find_separator(line: &[u8]) -> Option<usize> {
    line.windows(2).position(|w| w == b": ")
}

fn lowercase(src: &[u8]) -> String {
    String::from_utf8_lossy(src).to_ascii_lowercase()
}
