//! Process exit codes of the replayer binary

use crate::error::ReplayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,

    /// Panic or an internal failure such as an unwritable snapshot
    Internal = 1,

    CommandLine = 2,

    /// Trace file missing, unreadable or empty
    SourceFile = 3,

    /// Bad format tag, version or config block
    Format = 4,

    /// The live API reported a fatal error
    LiveApi = 5,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == ExitCode::Success
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl From<&ReplayError> for ExitCode {
    fn from(error: &ReplayError) -> Self {
        match error {
            ReplayError::Format(_) => ExitCode::Format,
            ReplayError::CommandLine(_) => ExitCode::CommandLine,
            ReplayError::SourceFile(_) => ExitCode::SourceFile,
            ReplayError::LiveApi { .. } => ExitCode::LiveApi,
            ReplayError::Serialization(_) => ExitCode::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{
        CommandLineError, FormatError, LiveError, SerializationError, SourceFileError,
    };

    #[test]
    fn test_error_kinds_map_to_codes() {
        let cases = [
            (ReplayError::from(FormatError::MissingTag), 4),
            (
                ReplayError::from(CommandLineError::InvalidOptions { reason: "x".to_string() }),
                2,
            ),
            (ReplayError::from(SourceFileError::Empty { path: "t.csv".to_string() }), 3),
            (
                ReplayError::LiveApi {
                    line: 7,
                    source: LiveError::DeviceLost { reason: "gone".to_string() },
                },
                5,
            ),
            (
                ReplayError::from(SerializationError::WriteFailed {
                    path: "out".to_string(),
                    reason: "denied".to_string(),
                }),
                1,
            ),
        ];
        for (error, code) in &cases {
            assert_eq!(ExitCode::from(error).as_i32(), *code, "{}", error);
        }
        assert!(ExitCode::Success.is_success());
        assert_eq!(i32::from(ExitCode::LiveApi), 5);
    }
}
