use thiserror::Error;

// BSD sysexits(3) codes.
pub const EX_USAGE: i32 = 64;
pub const EX_DATAERR: i32 = 65;
pub const EX_NOINPUT: i32 = 66;
pub const EX_SOFTWARE: i32 = 70;
pub const EX_OSERR: i32 = 71;
pub const EX_CANTCREAT: i32 = 73;

/// Fatal error conditions, each mapped to a sysexits(3) exit code.
///
/// Non-fatal conditions (a missing cycle counter, an unreadable memory map,
/// a duplicate opcode definition) are absorbed with a logged warning by the
/// component closest to the failure and never surface here.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("{0}")]
    Usage(String),

    #[error("{path}:{line}: {msg}")]
    Parse {
        path: String,
        line: usize,
        msg: String,
    },

    #[error("character '{0}' not allowed in bitstring")]
    BitstringChar(char),

    #[error("bitstring \"{0}\" longer than 32 bits")]
    BitstringTooLong(String),

    #[error("cannot specify more than {0} prefixes")]
    TooManyPrefixes(usize),

    #[error("{msg}")]
    Os {
        msg: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{op} pid {pid}")]
    DebugControl {
        op: &'static str,
        pid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("no region for address 0x{addr:08x}")]
    NoRegion { addr: u64 },

    #[error("unable to open {path}")]
    NoInput {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to create {path}")]
    CantCreate {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl TraceError {
    pub fn exit_code(&self) -> i32 {
        match self {
            TraceError::Usage(_) => EX_USAGE,
            TraceError::Parse { .. }
            | TraceError::BitstringChar(_)
            | TraceError::BitstringTooLong(_) => EX_DATAERR,
            TraceError::TooManyPrefixes(_) | TraceError::NoRegion { .. } => EX_SOFTWARE,
            TraceError::Os { .. } | TraceError::DebugControl { .. } => EX_OSERR,
            TraceError::NoInput { .. } => EX_NOINPUT,
            TraceError::CantCreate { .. } => EX_CANTCREAT,
        }
    }
}
