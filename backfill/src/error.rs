use std::{fmt, process::ExitCode};

use error_stack::{FrameKind, Report};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexerError {
    /// Invalid options. Fix the configuration and restart.
    Configuration,
    /// The chain node could not be reached. Can retry later.
    Rpc,
    /// Database error. Needs operator attention.
    Storage,
    /// Anything else. Should not retry.
    Fatal,
}

pub type Result<T> = error_stack::Result<T, IndexerError>;

impl error_stack::Context for IndexerError {}

impl fmt::Display for IndexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexerError::Configuration => f.write_str("indexer error: configuration"),
            IndexerError::Rpc => f.write_str("indexer error: rpc"),
            IndexerError::Storage => f.write_str("indexer error: storage"),
            IndexerError::Fatal => f.write_str("indexer error: fatal"),
        }
    }
}

pub trait ReportExt {
    fn to_exit_code(&self) -> ExitCode;
}

impl<T> ReportExt for Result<T> {
    fn to_exit_code(&self) -> ExitCode {
        match self {
            Ok(_) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("{:?}", err);
                ExitCode::from(err.current_context().exit_code())
            }
        }
    }
}

impl IndexerError {
    /// Exit codes based on sysexits.h
    pub fn exit_code(&self) -> u8 {
        match self {
            IndexerError::Configuration => 78,
            IndexerError::Rpc => 75,
            IndexerError::Storage | IndexerError::Fatal => 1,
        }
    }
}

/// One line summary of a report: contexts and printable attachments, outermost
/// first.
pub fn report_message<C>(report: &Report<C>) -> String {
    report
        .frames()
        .filter_map(|frame| match frame.kind() {
            FrameKind::Context(context) => Some(context.to_string()),
            FrameKind::Attachment(_) => frame
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| frame.downcast_ref::<&str>().map(|s| s.to_string())),
        })
        .collect::<Vec<_>>()
        .join(": ")
}

#[cfg(test)]
mod tests {
    use error_stack::{Report, ResultExt};

    use super::{report_message, IndexerError};

    #[derive(Debug)]
    struct DiskFull;

    impl error_stack::Context for DiskFull {}

    impl std::fmt::Display for DiskFull {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("disk full")
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(IndexerError::Configuration.exit_code(), 78);
        assert_eq!(IndexerError::Rpc.exit_code(), 75);
        assert_eq!(IndexerError::Storage.exit_code(), 1);
        assert_eq!(IndexerError::Fatal.exit_code(), 1);
    }

    #[test]
    fn test_report_message_includes_contexts_and_attachments() {
        let result: error_stack::Result<(), DiskFull> = Err(Report::new(DiskFull));
        let report = result
            .attach_printable("path: backfill.db")
            .change_context(IndexerError::Storage)
            .unwrap_err();

        let message = report_message(&report);
        assert!(message.starts_with("indexer error: storage"));
        assert!(message.contains("path: backfill.db"));
        assert!(message.ends_with("disk full"));
    }
}
