use thiserror::Error;

/// Stable result codes carried over the dump pipe and returned by the
/// control surface. The numeric values are part of the wire protocol and
/// must not be reordered.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceCode {
    Success = 0,
    TraceNotSupported = 1,
    TraceIsOccupied = 2,
    TagError = 3,
    FileError = 4,
    WriteTraceInfoError = 5,
    WrongTraceMode = 6,
    OutOfTime = 7,
    ForkError = 8,
    InvalidMaxDuration = 9,
    EpollWaitError = 10,
    PipeCreateError = 11,
    AsyncDump = 12,
    BufferExhausted = 13,
    TraceTaskDumpTimeout = 14,
    UnknownTraceDumpType = 15,
    /// Initial wire value, never a final code.
    Unset = 255,
}

impl TraceCode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => TraceCode::Success,
            1 => TraceCode::TraceNotSupported,
            2 => TraceCode::TraceIsOccupied,
            3 => TraceCode::TagError,
            4 => TraceCode::FileError,
            5 => TraceCode::WriteTraceInfoError,
            6 => TraceCode::WrongTraceMode,
            7 => TraceCode::OutOfTime,
            8 => TraceCode::ForkError,
            9 => TraceCode::InvalidMaxDuration,
            10 => TraceCode::EpollWaitError,
            11 => TraceCode::PipeCreateError,
            12 => TraceCode::AsyncDump,
            13 => TraceCode::BufferExhausted,
            14 => TraceCode::TraceTaskDumpTimeout,
            15 => TraceCode::UnknownTraceDumpType,
            _ => TraceCode::Unset,
        }
    }

    pub fn is_success(self) -> bool {
        self == TraceCode::Success
    }
}

/// Error surfaced by the public control surface: one taxonomy code plus a
/// human-readable message for the diagnostics stream.
#[derive(Debug, Error)]
#[error("{message} (code {code:?})")]
pub struct TraceError {
    pub code: TraceCode,
    pub message: String,
}

impl TraceError {
    pub fn new(code: TraceCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

pub type TraceResult<T> = Result<T, TraceError>;

/// Map a pseudo-file write failure onto the taxonomy.
pub fn node_write_error(path: &std::path::Path, err: &std::io::Error) -> TraceError {
    use std::io::ErrorKind;
    let code = match err.kind() {
        ErrorKind::NotFound => TraceCode::TraceNotSupported,
        ErrorKind::PermissionDenied => TraceCode::FileError,
        ErrorKind::InvalidInput => TraceCode::FileError,
        _ => TraceCode::FileError,
    };
    TraceError::new(code, format!("write {} failed: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_wire_bytes() {
        for code in [
            TraceCode::Success,
            TraceCode::TraceIsOccupied,
            TraceCode::OutOfTime,
            TraceCode::BufferExhausted,
            TraceCode::TraceTaskDumpTimeout,
            TraceCode::UnknownTraceDumpType,
            TraceCode::Unset,
        ] {
            assert_eq!(TraceCode::from_u8(code as u8), code);
        }
    }

    #[test]
    fn unknown_byte_decodes_to_unset() {
        assert_eq!(TraceCode::from_u8(200), TraceCode::Unset);
    }
}
