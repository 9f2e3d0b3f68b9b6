/// Frame magic. Binary frames start with `\0REQ` or `\0RES`; a non-NUL first
/// byte switches the connection to the line-based administrative protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Text,
    Request,
    Response,
}

pub const REQUEST_MAGIC: [u8; 4] = *b"\0REQ";
pub const RESPONSE_MAGIC: [u8; 4] = *b"\0RES";

/// Command codes, numbered as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    Text = 0,
    CanDo = 1,
    CantDo = 2,
    ResetAbilities = 3,
    PreSleep = 4,
    Unused = 5,
    Noop = 6,
    SubmitJob = 7,
    JobCreated = 8,
    GrabJob = 9,
    NoJob = 10,
    JobAssign = 11,
    WorkStatus = 12,
    WorkComplete = 13,
    WorkFail = 14,
    GetStatus = 15,
    EchoReq = 16,
    EchoRes = 17,
    SubmitJobBg = 18,
    Error = 19,
    StatusRes = 20,
    SubmitJobHigh = 21,
    SetClientId = 22,
    CanDoTimeout = 23,
    AllYours = 24,
    WorkException = 25,
    OptionReq = 26,
    OptionRes = 27,
    WorkData = 28,
    WorkWarning = 29,
    GrabJobUniq = 30,
    JobAssignUniq = 31,
    SubmitJobHighBg = 32,
    SubmitJobLow = 33,
    SubmitJobLowBg = 34,
    SubmitJobSched = 35,
    SubmitJobEpoch = 36,
}

/// `(name, fixed argument count, trailing data region)` per command. The
/// fixed arguments are NUL-terminated on the wire except the last one when
/// there is no data region; the data region, when present, is one extra
/// argument occupying the remainder of the frame.
struct CommandInfo {
    name: &'static str,
    argc: usize,
    data: bool,
}

const COMMAND_INFO: [CommandInfo; 37] = [
    CommandInfo { name: "TEXT", argc: 3, data: false },
    CommandInfo { name: "CAN_DO", argc: 1, data: false },
    CommandInfo { name: "CANT_DO", argc: 1, data: false },
    CommandInfo { name: "RESET_ABILITIES", argc: 0, data: false },
    CommandInfo { name: "PRE_SLEEP", argc: 0, data: false },
    CommandInfo { name: "UNUSED", argc: 0, data: false },
    CommandInfo { name: "NOOP", argc: 0, data: false },
    CommandInfo { name: "SUBMIT_JOB", argc: 2, data: true },
    CommandInfo { name: "JOB_CREATED", argc: 1, data: false },
    CommandInfo { name: "GRAB_JOB", argc: 0, data: false },
    CommandInfo { name: "NO_JOB", argc: 0, data: false },
    CommandInfo { name: "JOB_ASSIGN", argc: 2, data: true },
    CommandInfo { name: "WORK_STATUS", argc: 3, data: false },
    CommandInfo { name: "WORK_COMPLETE", argc: 1, data: true },
    CommandInfo { name: "WORK_FAIL", argc: 1, data: false },
    CommandInfo { name: "GET_STATUS", argc: 1, data: false },
    CommandInfo { name: "ECHO_REQ", argc: 0, data: true },
    CommandInfo { name: "ECHO_RES", argc: 0, data: true },
    CommandInfo { name: "SUBMIT_JOB_BG", argc: 2, data: true },
    CommandInfo { name: "ERROR", argc: 2, data: false },
    CommandInfo { name: "STATUS_RES", argc: 5, data: false },
    CommandInfo { name: "SUBMIT_JOB_HIGH", argc: 2, data: true },
    CommandInfo { name: "SET_CLIENT_ID", argc: 1, data: false },
    CommandInfo { name: "CAN_DO_TIMEOUT", argc: 2, data: false },
    CommandInfo { name: "ALL_YOURS", argc: 0, data: false },
    CommandInfo { name: "WORK_EXCEPTION", argc: 1, data: true },
    CommandInfo { name: "OPTION_REQ", argc: 1, data: false },
    CommandInfo { name: "OPTION_RES", argc: 1, data: false },
    CommandInfo { name: "WORK_DATA", argc: 1, data: true },
    CommandInfo { name: "WORK_WARNING", argc: 1, data: true },
    CommandInfo { name: "GRAB_JOB_UNIQ", argc: 0, data: false },
    CommandInfo { name: "JOB_ASSIGN_UNIQ", argc: 3, data: true },
    CommandInfo { name: "SUBMIT_JOB_HIGH_BG", argc: 2, data: true },
    CommandInfo { name: "SUBMIT_JOB_LOW", argc: 2, data: true },
    CommandInfo { name: "SUBMIT_JOB_LOW_BG", argc: 2, data: true },
    CommandInfo { name: "SUBMIT_JOB_SCHED", argc: 7, data: true },
    CommandInfo { name: "SUBMIT_JOB_EPOCH", argc: 3, data: true },
];

impl Command {
    pub fn from_code(code: u32) -> Option<Self> {
        use Command::*;
        Some(match code {
            0 => Text,
            1 => CanDo,
            2 => CantDo,
            3 => ResetAbilities,
            4 => PreSleep,
            5 => Unused,
            6 => Noop,
            7 => SubmitJob,
            8 => JobCreated,
            9 => GrabJob,
            10 => NoJob,
            11 => JobAssign,
            12 => WorkStatus,
            13 => WorkComplete,
            14 => WorkFail,
            15 => GetStatus,
            16 => EchoReq,
            17 => EchoRes,
            18 => SubmitJobBg,
            19 => Error,
            20 => StatusRes,
            21 => SubmitJobHigh,
            22 => SetClientId,
            23 => CanDoTimeout,
            24 => AllYours,
            25 => WorkException,
            26 => OptionReq,
            27 => OptionRes,
            28 => WorkData,
            29 => WorkWarning,
            30 => GrabJobUniq,
            31 => JobAssignUniq,
            32 => SubmitJobHighBg,
            33 => SubmitJobLow,
            34 => SubmitJobLowBg,
            35 => SubmitJobSched,
            36 => SubmitJobEpoch,
            _ => return None,
        })
    }

    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        COMMAND_INFO[self as usize].name
    }

    /// Total number of arguments a frame of this command carries, including
    /// the data region when the command has one.
    pub fn wire_args(self) -> usize {
        let info = &COMMAND_INFO[self as usize];
        info.argc + usize::from(info.data)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
