//! grpflt - Syncs the pgMemberOf attribute onto persons that are in posixGroups
//!
//! One-shot reconciliation pass: reads posixGroup member lists under the base
//! DN, computes each person's group set, and rewrites the person's pgMemberOf
//! attribute only when it differs from the computed set. Prints one line per
//! processed uid and a final summary.

use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use grpflt_sync::{LdapSession, Reconciler, RunReport, SyncConfig, SyncError, UserOutcome};

mod error;

use error::{CliError, CliResult};

/// Syncs the pgMemberOf attribute onto persons (inetOrgPerson/posixAccount)
/// that are listed in posixGroups.
#[derive(Parser)]
#[command(name = "grpflt")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// User DN with correct permissions, such as the Directory Manager
    #[arg(short = 'D', long = "binddn")]
    bind_dn: String,

    /// File holding the plaintext password for the given bind DN
    #[arg(short = 'y', long = "password-file")]
    password_file: String,

    /// LDAP Uniform Resource Identifier
    #[arg(short = 'H', long = "uri")]
    uri: String,

    /// Base DN for searches
    #[arg(short = 'b', long = "basedn")]
    base_dn: String,

    /// Persons (users) OU, relative to the base DN
    #[arg(short = 'g', long = "persons-ou")]
    persons_ou: String,

    /// Deadline per directory operation, in seconds
    #[arg(long = "timeout-secs", default_value_t = 30)]
    timeout_secs: u64,

    /// Retries for transient failures during group discovery
    #[arg(long = "discovery-retries", default_value_t = 3)]
    discovery_retries: u32,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("GRPFLT_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            e.print();
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let password = read_password(&cli.password_file)?;

    let config = SyncConfig::new(cli.uri, cli.bind_dn, cli.base_dn, cli.persons_ou)
        .with_password(password)
        .with_operation_timeout_secs(cli.timeout_secs)
        .with_discovery_retries(cli.discovery_retries);

    config
        .validate()
        .map_err(|e| CliError::Usage(e.to_string()))?;

    let session = LdapSession::connect(&config).await.map_err(map_fatal)?;

    let membership_attr = config.membership_attribute.clone();
    let person_classes = config.person_object_classes.clone();
    let mut reconciler = Reconciler::new(session, config);
    let result = reconciler.run().await;

    // The session is released on every exit path, including failed runs.
    if let Err(e) = reconciler.close().await {
        warn!(error = %e, "failed to release directory session");
    }

    let report = result.map_err(map_fatal)?;
    print_report(&report, &membership_attr, &person_classes);

    Ok(())
}

/// Read the bind password from the given file, trimming surrounding whitespace.
fn read_password(path: &str) -> CliResult<String> {
    let contents = std::fs::read_to_string(path).map_err(|e| CliError::PasswordFile {
        path: path.to_string(),
        message: e.to_string(),
    })?;

    let password = contents.trim();
    if password.is_empty() {
        return Err(CliError::PasswordFile {
            path: path.to_string(),
            message: "file is empty".to_string(),
        });
    }

    Ok(password.to_string())
}

fn map_fatal(err: SyncError) -> CliError {
    match err {
        SyncError::AuthenticationFailed => CliError::Authentication(err.to_string()),
        SyncError::InvalidConfiguration { .. } => CliError::Usage(err.to_string()),
        SyncError::DirectoryUnavailable { .. } | SyncError::OperationTimeout { .. } => {
            CliError::Discovery(err.to_string())
        }
        other => CliError::Sync(other.to_string()),
    }
}

fn print_report(report: &RunReport, attr: &str, person_classes: &[String]) {
    for (uid, outcome) in &report.outcomes {
        println!("{}", outcome_line(uid, outcome, attr, person_classes));
    }

    if let Some(reason) = &report.stale_scan_error {
        eprintln!("Warning: scan for stale \"{attr}\" values failed, results above are partial: {reason}");
    }

    println!(
        "{} synced, {} up to date, {} skipped, {} failed",
        report.synced(),
        report.up_to_date(),
        report.not_found(),
        report.failed()
    );
}

fn outcome_line(uid: &str, outcome: &UserOutcome, attr: &str, person_classes: &[String]) -> String {
    match outcome {
        UserOutcome::Synced => format!("Synced \"{attr}\" attribute for the \"{uid}\" uid!"),
        UserOutcome::UpToDate => {
            format!("The \"{attr}\" attribute is up to date for the \"{uid}\" uid!")
        }
        UserOutcome::NotFound => {
            format!(
                "The \"{uid}\" uid does not have the object class {}, so not syncing!",
                class_phrase(person_classes)
            )
        }
        UserOutcome::Failed { reason } => {
            format!("Failed to sync the \"{uid}\" uid: {reason}")
        }
    }
}

fn class_phrase(classes: &[String]) -> String {
    classes
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(" or ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_classes() -> Vec<String> {
        vec!["inetOrgPerson".to_string(), "posixAccount".to_string()]
    }

    #[test]
    fn test_outcome_lines() {
        assert_eq!(
            outcome_line("alice", &UserOutcome::Synced, "pgMemberOf", &default_classes()),
            "Synced \"pgMemberOf\" attribute for the \"alice\" uid!"
        );
        assert_eq!(
            outcome_line("alice", &UserOutcome::UpToDate, "pgMemberOf", &default_classes()),
            "The \"pgMemberOf\" attribute is up to date for the \"alice\" uid!"
        );
        assert_eq!(
            outcome_line("dave", &UserOutcome::NotFound, "pgMemberOf", &default_classes()),
            "The \"dave\" uid does not have the object class \"inetOrgPerson\" or \"posixAccount\", so not syncing!"
        );
    }

    #[test]
    fn test_read_password_trims_whitespace() {
        let dir = std::env::temp_dir();
        let path = dir.join("grpflt-test-password");
        std::fs::write(&path, "  s3cret\n").unwrap();

        let password = read_password(path.to_str().unwrap()).unwrap();
        assert_eq!(password, "s3cret");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_read_password_missing_file() {
        let err = read_password("/nonexistent/grpflt-password").unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_map_fatal_exit_codes() {
        assert_eq!(map_fatal(SyncError::AuthenticationFailed).exit_code(), 2);
        assert_eq!(
            map_fatal(SyncError::unavailable("refused")).exit_code(),
            3
        );
        assert_eq!(
            map_fatal(SyncError::OperationTimeout { timeout_secs: 30 }).exit_code(),
            3
        );
        assert_eq!(
            map_fatal(SyncError::operation_failed("boom")).exit_code(),
            1
        );
    }
}
