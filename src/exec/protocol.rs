//! The exec wire format.
//!
//! Requests are `len:u32be | command-utf8`. Responses are `len:u32be | stdout-len:u32be | stdout | stderr-len:u32be
//! | stderr | exit-code:i32be`, where `len` counts everything after itself and the exit code is exactly four bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const LEN_PREFIX: usize = 4;
const EXIT_CODE_LEN: usize = 4;

/// Frames larger than this are discarded unread.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub command: String,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

/// The result of one command run by the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// A response frame that arrived whole but can't be interpreted, or a stream that ended inside a frame. Frames
/// that violate the format are consumed in full, so the stream stays in sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecProtocolViolation {
    /// The stream ended with this many bytes of an incomplete frame buffered.
    TruncatedStream { buffered: usize },
    /// A length field points past the end of its frame.
    FieldOverrun { field: &'static str },
    /// The exit code wasn't exactly four bytes.
    ExitCodeLength(usize),
    /// The frame was larger than the codec accepts and was skipped.
    Oversized { len: usize },
}

impl std::error::Error for ExecProtocolViolation {}

impl std::fmt::Display for ExecProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecProtocolViolation::TruncatedStream { buffered } => {
                write!(f, "The stream ended inside a frame with {buffered} bytes buffered")
            }
            ExecProtocolViolation::FieldOverrun { field } => {
                write!(f, "The {field} length runs past the end of the frame")
            }
            ExecProtocolViolation::ExitCodeLength(len) => {
                write!(f, "The exit code is {len} bytes long instead of {EXIT_CODE_LEN}")
            }
            ExecProtocolViolation::Oversized { len } => write!(f, "A {len}-byte frame exceeded the size limit"),
        }
    }
}

fn split_field(frame: &mut Bytes, field: &'static str) -> Result<Bytes, ExecProtocolViolation> {
    if frame.len() < LEN_PREFIX {
        return Err(ExecProtocolViolation::FieldOverrun { field });
    }
    let len = frame.get_u32() as usize;
    if frame.len() < len {
        return Err(ExecProtocolViolation::FieldOverrun { field });
    }
    Ok(frame.split_to(len))
}

fn parse_response(mut frame: Bytes) -> Result<ExecOutput, ExecProtocolViolation> {
    let stdout = split_field(&mut frame, "stdout")?;
    let stderr = split_field(&mut frame, "stderr")?;
    if frame.len() != EXIT_CODE_LEN {
        return Err(ExecProtocolViolation::ExitCodeLength(frame.len()));
    }
    Ok(ExecOutput {
        stdout,
        stderr,
        exit_code: frame.get_i32(),
    })
}

/// Splits length-prefixed frames, skipping over frames above `max_frame_len` without buffering them.
#[derive(Debug, Clone)]
struct FrameSplitter {
    max_frame_len: usize,
    discarding: Option<Discard>,
}

#[derive(Debug, Clone, Copy)]
struct Discard {
    remaining: usize,
    len: usize,
}

enum Split {
    Frame(Bytes),
    Skipped { len: usize },
}

impl FrameSplitter {
    fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            discarding: None,
        }
    }

    fn split(&mut self, src: &mut BytesMut) -> Option<Split> {
        loop {
            if let Some(discard) = self.discarding.as_mut() {
                let skip = discard.remaining.min(src.len());
                src.advance(skip);
                discard.remaining -= skip;
                if discard.remaining > 0 {
                    return None;
                }
                let len = discard.len;
                self.discarding = None;
                return Some(Split::Skipped { len });
            }

            if src.len() < LEN_PREFIX {
                return None;
            }
            let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if len > self.max_frame_len {
                src.advance(LEN_PREFIX);
                self.discarding = Some(Discard { remaining: len, len });
                continue;
            }
            if src.len() < LEN_PREFIX + len {
                src.reserve(LEN_PREFIX + len - src.len());
                return None;
            }
            src.advance(LEN_PREFIX);
            return Some(Split::Frame(src.split_to(len).freeze()));
        }
    }

    fn truncated(&mut self, src: &mut BytesMut) -> Option<ExecProtocolViolation> {
        let buffered = src.len() + self.discarding.take().map(|discard| discard.len).unwrap_or(0);
        if buffered == 0 {
            return None;
        }
        src.clear();
        Some(ExecProtocolViolation::TruncatedStream { buffered })
    }
}

fn encode_frame(payload_len: usize, dst: &mut BytesMut) -> Result<(), std::io::Error> {
    let len = u32::try_from(payload_len)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame length exceeds u32"))?;
    dst.reserve(LEN_PREFIX + payload_len);
    dst.put_u32(len);
    Ok(())
}

/// The host side: encodes [ExecRequest]s and decodes responses. Malformed responses are yielded as items rather
/// than errors, so the stream remains usable.
#[derive(Debug, Clone)]
pub struct ExecCodec {
    splitter: FrameSplitter,
}

impl ExecCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            splitter: FrameSplitter::new(max_frame_len),
        }
    }
}

impl Default for ExecCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<ExecRequest> for ExecCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: ExecRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(item.command.len(), dst)?;
        dst.put_slice(item.command.as_bytes());
        Ok(())
    }
}

impl Decoder for ExecCodec {
    type Item = Result<ExecOutput, ExecProtocolViolation>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.splitter.split(src).map(|split| match split {
            Split::Frame(frame) => parse_response(frame),
            Split::Skipped { len } => Err(ExecProtocolViolation::Oversized { len }),
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        Ok(self.splitter.truncated(src).map(Err))
    }
}

/// The guest side: decodes [ExecRequest]s and encodes [ExecOutput]s. Used by guest agents and test servers.
#[derive(Debug, Clone)]
pub struct GuestCodec {
    splitter: FrameSplitter,
}

impl GuestCodec {
    pub fn new() -> Self {
        Self {
            splitter: FrameSplitter::new(DEFAULT_MAX_FRAME_LEN),
        }
    }
}

impl Default for GuestCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for GuestCodec {
    type Item = ExecRequest;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.splitter.split(src) {
            None => Ok(None),
            Some(Split::Skipped { len }) => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("a {len}-byte request exceeded the size limit"),
            )),
            Some(Split::Frame(frame)) => String::from_utf8(frame.to_vec())
                .map(|command| Some(ExecRequest { command }))
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err)),
        }
    }
}

impl Encoder<ExecOutput> for GuestCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: ExecOutput, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = LEN_PREFIX + item.stdout.len() + LEN_PREFIX + item.stderr.len() + EXIT_CODE_LEN;
        encode_frame(payload_len, dst)?;
        dst.put_u32(item.stdout.len() as u32);
        dst.put_slice(&item.stdout);
        dst.put_u32(item.stderr.len() as u32);
        dst.put_slice(&item.stderr);
        dst.put_i32(item.exit_code);
        Ok(())
    }
}
