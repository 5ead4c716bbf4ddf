//! Incremental parser for the server-to-client protocol.
//!
//! The parser is a byte-at-a-time state machine fed with arbitrary chunks straight from the
//! socket. Control lines and MSG headers are accumulated until their terminating `\n`; MSG payloads
//! are counted byte-exactly against the declared length so CR/LF inside a payload is never
//! mistaken for a terminator. Nothing here blocks and no state is lost between calls.

use crate::error::{NatsError, Result};
use crate::message::InboundMessage;
use bytes::{Bytes, BytesMut};

/// Longest control line (INFO, -ERR, MSG header) accepted before the stream is declared corrupt.
pub const MAX_CONTROL_LINE: usize = 64 * 1024;

const MAX_PREALLOC: usize = 1024 * 1024;

/// One protocol event decoded from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEvent {
    /// `INFO` with its raw JSON argument.
    Info(Bytes),
    /// `PING`.
    Ping,
    /// `PONG`.
    Pong,
    /// `+OK`.
    Ok,
    /// `-ERR` with the quotes stripped from its text.
    Err(String),
    /// A fully assembled `MSG`.
    Msg(InboundMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    OpStart,
    OpPlus,
    OpPlusO,
    OpPlusOk,
    OpMinus,
    OpMinusE,
    OpMinusEr,
    OpMinusErr,
    OpMinusErrSpc,
    MinusErrArg,
    OpM,
    OpMs,
    OpMsg,
    OpMsgSpc,
    MsgArg,
    MsgPayload,
    MsgEnd,
    OpP,
    OpPi,
    OpPin,
    OpPing,
    OpPo,
    OpPon,
    OpPong,
    OpI,
    OpIn,
    OpInf,
    OpInfo,
    OpInfoSpc,
    InfoArg,
}

#[derive(Debug)]
struct MsgHeader {
    subject: String,
    reply_to: Option<String>,
    sid: u64,
    len: usize,
}

/// Streaming protocol parser. One instance per session; call [`Parser::reset`] between sessions.
#[derive(Debug)]
pub struct Parser {
    state: State,
    buf: BytesMut,
    header: Option<MsgHeader>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    /// Creates a parser in its start state.
    pub fn new() -> Self {
        Self {
            state: State::OpStart,
            buf: BytesMut::with_capacity(512),
            header: None,
        }
    }

    /// Drops any partial operation and returns to the start state.
    pub fn reset(&mut self) {
        self.state = State::OpStart;
        self.buf.clear();
        self.header = None;
    }

    /// True when no operation is partially parsed.
    pub fn is_idle(&self) -> bool {
        self.state == State::OpStart
    }

    /// Consumes `chunk`, calling `on_event` for every completed operation.
    ///
    /// An invalid byte yields [`NatsError::Protocol`] and resets the parser. Errors returned by
    /// `on_event` stop parsing and are propagated unchanged.
    pub fn parse<F>(&mut self, chunk: &[u8], mut on_event: F) -> Result<()>
    where
        F: FnMut(ParsedEvent) -> Result<()>,
    {
        use State::*;

        let mut i = 0;
        while i < chunk.len() {
            if self.state == MsgPayload {
                i += self.take_payload(&chunk[i..]);
                if self.header.as_ref().map(|h| h.len) == Some(self.buf.len()) {
                    self.state = MsgEnd;
                    self.finish_message(&mut on_event)?;
                }
                continue;
            }

            let b = chunk[i];
            self.state = match (self.state, b.to_ascii_uppercase()) {
                (OpStart, b'M') => OpM,
                (OpStart, b'P') => OpP,
                (OpStart, b'+') => OpPlus,
                (OpStart, b'-') => OpMinus,
                (OpStart, b'I') => OpI,

                (OpM, b'S') => OpMs,
                (OpMs, b'G') => OpMsg,
                (OpMsg, b' ' | b'\t') => OpMsgSpc,
                (OpMsgSpc, b' ' | b'\t') => OpMsgSpc,
                (OpMsgSpc, c) if c != b'\r' && c != b'\n' => {
                    self.push_arg(b, chunk, i)?;
                    MsgArg
                }
                (MsgArg, b'\r') => MsgArg,
                (MsgArg, b'\n') => self.begin_payload(&mut on_event)?,
                (MsgArg, _) => {
                    self.push_arg(b, chunk, i)?;
                    MsgArg
                }
                (MsgEnd, b'\r') => MsgEnd,
                (MsgEnd, b'\n') => OpStart,

                (OpP, b'I') => OpPi,
                (OpPi, b'N') => OpPin,
                (OpPin, b'G') => OpPing,
                (OpPing, b'\r') => OpPing,
                (OpPing, b'\n') => {
                    on_event(ParsedEvent::Ping)?;
                    OpStart
                }
                (OpP, b'O') => OpPo,
                (OpPo, b'N') => OpPon,
                (OpPon, b'G') => OpPong,
                (OpPong, b'\r') => OpPong,
                (OpPong, b'\n') => {
                    on_event(ParsedEvent::Pong)?;
                    OpStart
                }

                (OpPlus, b'O') => OpPlusO,
                (OpPlusO, b'K') => OpPlusOk,
                (OpPlusOk, b'\r') => OpPlusOk,
                (OpPlusOk, b'\n') => {
                    on_event(ParsedEvent::Ok)?;
                    OpStart
                }

                (OpMinus, b'E') => OpMinusE,
                (OpMinusE, b'R') => OpMinusEr,
                (OpMinusEr, b'R') => OpMinusErr,
                (OpMinusErr, b' ' | b'\t') => OpMinusErrSpc,
                (OpMinusErrSpc, b' ' | b'\t') => OpMinusErrSpc,
                (OpMinusErr | OpMinusErrSpc | MinusErrArg, b'\r') => MinusErrArg,
                (OpMinusErr | OpMinusErrSpc | MinusErrArg, b'\n') => {
                    let text = self.take_error_text();
                    on_event(ParsedEvent::Err(text))?;
                    OpStart
                }
                (OpMinusErrSpc | MinusErrArg, _) => {
                    self.push_arg(b, chunk, i)?;
                    MinusErrArg
                }

                (OpI, b'N') => OpIn,
                (OpIn, b'F') => OpInf,
                (OpInf, b'O') => OpInfo,
                (OpInfo, b' ' | b'\t') => OpInfoSpc,
                (OpInfoSpc, b' ' | b'\t') => OpInfoSpc,
                (OpInfoSpc, c) if c != b'\r' && c != b'\n' => {
                    self.push_arg(b, chunk, i)?;
                    InfoArg
                }
                (InfoArg, b'\r') => InfoArg,
                (InfoArg, b'\n') => {
                    let arg = self.buf.split().freeze();
                    on_event(ParsedEvent::Info(arg))?;
                    OpStart
                }
                (InfoArg, _) => {
                    self.push_arg(b, chunk, i)?;
                    InfoArg
                }

                _ => return Err(self.fail(chunk, i)),
            };
            i += 1;
        }
        Ok(())
    }

    fn push_arg(&mut self, b: u8, chunk: &[u8], i: usize) -> Result<()> {
        if self.buf.len() >= MAX_CONTROL_LINE {
            return Err(self.fail(chunk, i));
        }
        self.buf.extend_from_slice(&[b]);
        Ok(())
    }

    fn take_payload(&mut self, input: &[u8]) -> usize {
        let expected = self.header.as_ref().map_or(0, |h| h.len);
        let take = expected.saturating_sub(self.buf.len()).min(input.len());
        self.buf.extend_from_slice(&input[..take]);
        take
    }

    fn take_error_text(&mut self) -> String {
        let raw = self.buf.split();
        let text = String::from_utf8_lossy(&raw);
        text.trim().trim_matches('\'').to_string()
    }

    fn begin_payload<F>(&mut self, on_event: &mut F) -> Result<State>
    where
        F: FnMut(ParsedEvent) -> Result<()>,
    {
        let header = parse_msg_header(&self.buf);
        self.buf.clear();
        let header = match header {
            Ok(h) => h,
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };
        let len = header.len;
        self.header = Some(header);
        if len == 0 {
            self.finish_message(on_event)?;
            return Ok(State::MsgEnd);
        }
        self.buf.reserve(len.min(MAX_PREALLOC));
        Ok(State::MsgPayload)
    }

    fn finish_message<F>(&mut self, on_event: &mut F) -> Result<()>
    where
        F: FnMut(ParsedEvent) -> Result<()>,
    {
        let payload = self.buf.split().freeze();
        match self.header.take() {
            Some(h) => on_event(ParsedEvent::Msg(InboundMessage::new(
                h.subject, h.reply_to, h.sid, payload,
            ))),
            None => Err(NatsError::protocol(
                format!("{:?}", self.state),
                "payload without header",
            )),
        }
    }

    fn fail(&mut self, chunk: &[u8], i: usize) -> NatsError {
        let start = i.saturating_sub(16);
        let end = (i + 16).min(chunk.len());
        let err = NatsError::protocol(
            format!("{:?}", self.state),
            format!(
                "unexpected byte 0x{:02x} at offset {} near {:?}",
                chunk[i],
                i,
                String::from_utf8_lossy(&chunk[start..end])
            ),
        );
        self.reset();
        err
    }
}

fn parse_msg_header(raw: &[u8]) -> Result<MsgHeader> {
    let bad = |why: &str| {
        NatsError::protocol(
            "MsgArg",
            format!("{}: {:?}", why, String::from_utf8_lossy(raw)),
        )
    };
    let text = std::str::from_utf8(raw).map_err(|_| bad("header is not UTF-8"))?;
    let tokens: Vec<&str> = text.split_ascii_whitespace().collect();
    let (subject, sid, reply_to, len) = match tokens.as_slice() {
        [subject, sid, len] => (*subject, *sid, None, *len),
        [subject, sid, reply, len] => (*subject, *sid, Some(*reply), *len),
        _ => return Err(bad("expected 3 or 4 header fields")),
    };
    Ok(MsgHeader {
        subject: subject.to_string(),
        reply_to: reply_to.map(str::to_string),
        sid: sid.parse().map_err(|_| bad("invalid sid"))?,
        len: len.parse().map_err(|_| bad("invalid payload length"))?,
    })
}
