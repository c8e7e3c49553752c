//! Purpose: `backstore` CLI entry point for inspecting write-behind queue files.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands never take a queue file over; inspection reads a snapshot.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

mod queue_info_json;

use backstore::api::{
    Error, ErrorKind, MAX_PERSISTENCE_BUF_SIZE, PersistenceConfig, QueueStatus, inspect_queue,
    to_exit_code,
};
use queue_info_json::{queue_info_json, record_json};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse_from(std::env::args_os().collect::<Vec<OsString>>()) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `backstore --help`."));
            }
        },
    };

    match cli.command {
        Command::Info {
            queue,
            max_record_size,
        } => {
            let report = inspect_queue(&queue, max_record_size, 0)?;
            emit_json(queue_info_json(&report));
            Ok(match report.status {
                QueueStatus::Ok => RunOutcome::ok(),
                QueueStatus::Corrupt => RunOutcome::with_code(to_exit_code(ErrorKind::Corrupt)),
            })
        }
        Command::Dump {
            queue,
            max_record_size,
            limit,
        } => {
            let report = inspect_queue(&queue, max_record_size, limit.unwrap_or(usize::MAX))?;
            for record in &report.records {
                println!("{}", record_json(record));
            }
            match (report.status, report.issues.first()) {
                (QueueStatus::Corrupt, Some(issue)) => {
                    let mut err = Error::new(ErrorKind::Corrupt)
                        .with_message(issue.message.clone())
                        .with_path(&report.path);
                    if let Some(offset) = issue.offset {
                        err = err.with_offset(offset);
                    }
                    if let Some(hint) = report.remediation_hints.first() {
                        err = err.with_hint(hint.clone());
                    }
                    Err(err)
                }
                _ => Ok(RunOutcome::ok()),
            }
        }
        Command::Config { file } => {
            let config = PersistenceConfig::from_json_path(&file)?;
            let mut value = serde_json::to_value(&config).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode config")
                    .with_source(err)
            })?;
            if let Some(store) = value.get_mut("store").and_then(Value::as_object_mut) {
                store.insert("password".to_string(), json!("<redacted>"));
            }
            emit_json(value);
            Ok(RunOutcome::ok())
        }
    }
}

#[derive(Parser)]
#[command(
    name = "backstore",
    version,
    about = "Inspect write-behind persistence queue files",
    long_about = None,
    after_help = r#"EXAMPLES
  $ backstore info /var/lib/app/jobs.ring
  $ backstore dump /var/lib/app/jobs.ring --limit 20
  $ backstore config /etc/app/persistence.json

  Set RUST_LOG=debug for diagnostic logging on stderr."#,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Show the header, backlog size and health of a queue file")]
    Info {
        #[arg(help = "Queue file path", value_hint = ValueHint::FilePath)]
        queue: PathBuf,
        #[arg(
            long,
            default_value_t = MAX_PERSISTENCE_BUF_SIZE,
            help = "Record size limit the queue was written with"
        )]
        max_record_size: usize,
    },
    #[command(about = "Print unread records as JSON lines, oldest first")]
    Dump {
        #[arg(help = "Queue file path", value_hint = ValueHint::FilePath)]
        queue: PathBuf,
        #[arg(
            long,
            default_value_t = MAX_PERSISTENCE_BUF_SIZE,
            help = "Record size limit the queue was written with"
        )]
        max_record_size: usize,
        #[arg(long, help = "Stop after this many records")]
        limit: Option<usize>,
    },
    #[command(about = "Validate a persistence config file and print the effective settings")]
    Config {
        #[arg(help = "JSON config path", value_hint = ValueHint::FilePath)]
        file: PathBuf,
    },
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::Busy => "queue is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Corrupt => "corrupt queue".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::SizeOverflow => "record too large".to_string(),
        ErrorKind::KeySizeExceeded => "key too long".to_string(),
        ErrorKind::ArgcOverflow => "too many arguments".to_string(),
        ErrorKind::UnsupportedCommand => "command not persisted".to_string(),
        ErrorKind::Store => "store unavailable".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(offset) = err.offset() {
        lines.push(format!("offset: {offset}"));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
