//! Process exit codes

/// Exit codes of the snapkeeper binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    /// Invalid flags, environment or config file
    UsageError = 2,
    /// The object-storage session or HTTP client could not be set up
    NetworkError = 3,
}

impl ExitCode {
    pub fn from_error(error: &anyhow::Error) -> Self {
        match error.downcast_ref::<sk_core::Error>() {
            Some(e) if e.is_fatal_at_startup() => ExitCode::UsageError,
            Some(sk_core::Error::Network(_)) => ExitCode::NetworkError,
            _ => ExitCode::GeneralError,
        }
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code as u8)
    }
}
