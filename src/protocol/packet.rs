use bytes::Bytes;

use crate::protocol::command::{Command, Magic};

/// An owned protocol frame. Arguments are stored without their NUL
/// terminators; for commands with a data region the payload is the last
/// argument.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub magic: Magic,
    pub command: Command,
    pub args: Vec<Bytes>,
}

impl Packet {
    pub fn request(command: Command, args: Vec<Bytes>) -> Self {
        debug_assert_eq!(args.len(), command.wire_args());
        Self {
            magic: Magic::Request,
            command,
            args,
        }
    }

    pub fn response(command: Command, args: Vec<Bytes>) -> Self {
        debug_assert_eq!(args.len(), command.wire_args());
        Self {
            magic: Magic::Response,
            command,
            args,
        }
    }

    pub fn arg(&self, index: usize) -> &[u8] {
        self.args.get(index).map(|a| a.as_ref()).unwrap_or(&[])
    }

    /// Re-emit an inbound frame as a response, preserving its arguments.
    /// Used when forwarding worker progress frames to registered clients.
    pub fn into_response(mut self) -> Self {
        self.magic = Magic::Response;
        self
    }

    pub fn job_created(handle: &str) -> Self {
        Self::response(
            Command::JobCreated,
            vec![Bytes::copy_from_slice(handle.as_bytes())],
        )
    }

    pub fn no_job() -> Self {
        Self::response(Command::NoJob, Vec::new())
    }

    pub fn noop() -> Self {
        Self::response(Command::Noop, Vec::new())
    }

    pub fn job_assign(handle: &str, function: Bytes, data: Bytes) -> Self {
        Self::response(
            Command::JobAssign,
            vec![Bytes::copy_from_slice(handle.as_bytes()), function, data],
        )
    }

    pub fn job_assign_uniq(handle: &str, function: Bytes, unique: Bytes, data: Bytes) -> Self {
        Self::response(
            Command::JobAssignUniq,
            vec![
                Bytes::copy_from_slice(handle.as_bytes()),
                function,
                unique,
                data,
            ],
        )
    }

    pub fn echo_res(data: Bytes) -> Self {
        Self::response(Command::EchoRes, vec![data])
    }

    pub fn option_res(option: Bytes) -> Self {
        Self::response(Command::OptionRes, vec![option])
    }

    pub fn status_res(handle: &[u8], known: bool, running: bool, num: u32, den: u32) -> Self {
        Self::response(
            Command::StatusRes,
            vec![
                Bytes::copy_from_slice(handle),
                Bytes::from_static(if known { b"1" } else { b"0" }),
                Bytes::from_static(if running { b"1" } else { b"0" }),
                Bytes::from(num.to_string().into_bytes()),
                Bytes::from(den.to_string().into_bytes()),
            ],
        )
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self::response(
            Command::Error,
            vec![
                Bytes::copy_from_slice(code.as_bytes()),
                Bytes::copy_from_slice(message.as_bytes()),
            ],
        )
    }
}
