//! CLI error types and exit codes

use thiserror::Error;

/// Exit codes for the CLI
/// - 0: Success (including per-user skips and failures that did not abort the run)
/// - 1: General error
/// - 2: Argument or credential failure
/// - 3: Discovery or transport failure
pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Invalid arguments: {0}")]
    Usage(String),

    #[error("Failed to read password file '{path}': {message}")]
    PasswordFile { path: String, message: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Group discovery failed: {0}")]
    Discovery(String),

    #[error("Sync failed: {0}")]
    Sync(String),
}

impl CliError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Usage(_) | CliError::PasswordFile { .. } | CliError::Authentication(_) => 2,
            CliError::Discovery(_) => 3,
            CliError::Sync(_) => 1,
        }
    }

    /// Print this error to stderr
    pub fn print(&self) {
        let use_color = std::env::var("NO_COLOR").is_err();

        if use_color {
            eprintln!("\x1b[31mError:\x1b[0m {self}");
        } else {
            eprintln!("Error: {self}");
        }
    }
}
