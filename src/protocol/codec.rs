use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::protocol::command::{Command, Magic, REQUEST_MAGIC, RESPONSE_MAGIC};
use crate::protocol::packet::Packet;

pub const HEADER_SIZE: usize = 12;

/// Frames larger than this desynchronize the connection.
pub const MAX_PACKET_SIZE: usize = 64 * 1024 * 1024;

/// Administrative command lines longer than this are rejected.
pub const MAX_TEXT_LINE: usize = 8192;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("invalid packet magic")]
    InvalidMagic,

    #[error("invalid command code {0}")]
    InvalidCommand(u32),

    #[error("packet of {0} bytes exceeds the size limit")]
    PacketTooLarge(usize),

    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

struct Header {
    magic: Magic,
    command: Command,
    data_size: usize,
}

/// Incremental frame decoder. Bytes are appended to the internal buffer as
/// they arrive; `decode` yields at most one packet per call and remembers a
/// parsed header across calls so a frame split by the transport resumes where
/// it left off.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    pending: Option<Header>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The accumulation buffer, for use with `AsyncReadExt::read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn decode(&mut self) -> Result<Option<Packet>, CodecError> {
        if self.pending.is_none() {
            if self.buf.is_empty() {
                return Ok(None);
            }

            if self.buf[0] != 0 {
                return self.decode_text_line();
            }

            if self.buf.len() < HEADER_SIZE {
                return Ok(None);
            }

            let header = self.buf.split_to(HEADER_SIZE);
            let magic = if header[..4] == REQUEST_MAGIC {
                Magic::Request
            } else if header[..4] == RESPONSE_MAGIC {
                Magic::Response
            } else {
                return Err(CodecError::InvalidMagic);
            };

            let code = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
            let command = match Command::from_code(code) {
                Some(Command::Text) | None => return Err(CodecError::InvalidCommand(code)),
                Some(command) => command,
            };

            let data_size =
                u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
            if data_size > MAX_PACKET_SIZE {
                return Err(CodecError::PacketTooLarge(data_size));
            }

            self.pending = Some(Header {
                magic,
                command,
                data_size,
            });
        }

        let header = self.pending.as_ref().expect("header parsed above");
        if self.buf.len() < header.data_size {
            return Ok(None);
        }

        let header = self.pending.take().expect("header parsed above");
        let region = self.buf.split_to(header.data_size).freeze();
        let args = split_args(region, header.command.wire_args())?;

        Ok(Some(Packet {
            magic: header.magic,
            command: header.command,
            args,
        }))
    }

    fn decode_text_line(&mut self) -> Result<Option<Packet>, CodecError> {
        let newline = match self.buf.iter().position(|&b| b == b'\n') {
            Some(pos) => pos,
            None if self.buf.len() > MAX_TEXT_LINE => {
                return Err(CodecError::Malformed("text command line too long"));
            }
            None => return Ok(None),
        };

        let line = self.buf.split_to(newline + 1).freeze();
        let mut end = line.len() - 1;
        if end > 0 && line[end - 1] == b'\r' {
            end -= 1;
        }

        let mut args = Vec::new();
        let mut offset = 0;
        while offset < end {
            if line[offset] == b' ' {
                offset += 1;
                continue;
            }
            let start = offset;
            while offset < end && line[offset] != b' ' {
                offset += 1;
            }
            args.push(line.slice(start..offset));
        }

        Ok(Some(Packet {
            magic: Magic::Text,
            command: Command::Text,
            args,
        }))
    }
}

/// Split an argument region into `count` arguments: all but the last are
/// NUL-terminated, the last takes the remainder with no terminator.
fn split_args(region: Bytes, count: usize) -> Result<Vec<Bytes>, CodecError> {
    if count == 0 {
        if !region.is_empty() {
            return Err(CodecError::Malformed("unexpected arguments"));
        }
        return Ok(Vec::new());
    }

    let mut args = Vec::with_capacity(count);
    let mut rest = region;
    for _ in 0..count - 1 {
        let pos = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(CodecError::Malformed("missing argument separator"))?;
        args.push(rest.split_to(pos));
        let _nul = rest.split_to(1);
    }
    args.push(rest);

    Ok(args)
}

/// Serialize a binary frame: 12-byte header, then NUL-separated arguments
/// with the last one unterminated.
pub fn encode_packet(packet: &Packet) -> Bytes {
    debug_assert!(packet.magic != Magic::Text, "text replies are sent raw");

    let arg_bytes: usize = packet.args.iter().map(|a| a.len()).sum();
    let separators = packet.args.len().saturating_sub(1);
    let data_size = arg_bytes + separators;

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + data_size);
    match packet.magic {
        Magic::Request => buf.put_slice(&REQUEST_MAGIC),
        Magic::Response | Magic::Text => buf.put_slice(&RESPONSE_MAGIC),
    }
    buf.put_u32(packet.command.code());
    buf.put_u32(data_size as u32);

    for (index, arg) in packet.args.iter().enumerate() {
        if index > 0 {
            buf.put_u8(0);
        }
        buf.put_slice(arg);
    }

    buf.freeze()
}
