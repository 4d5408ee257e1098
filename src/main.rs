//! Purpose: `ringpool` CLI entry point.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Records and reports go to stdout as JSON (pretty on a tty, one line otherwise).
//! Invariants: Errors are emitted as JSON on stderr (text on a tty).
//! Invariants: Process exit code is derived from `to_exit_code`.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::io::{self, IsTerminal, Read};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use signal_hook::SigId;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::EnvFilter;

use ringpool::core::codec::{JsonCodec, RecordCodec};
use ringpool::core::error::{Error, ErrorKind, to_exit_code};
use ringpool::core::frame::Record;

mod command_dispatch;

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
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
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
                    .with_hint("Run `ringpool --help` for usage."));
            }
        },
    };

    init_tracing(cli.verbose);
    command_dispatch::dispatch_command(cli.command).map_err(add_hint)
}

#[derive(Parser)]
#[command(
    name = "ringpool",
    version,
    about = "Persistent ring-buffer record pools shared across processes",
    long_about = None,
    after_help = r#"EXAMPLES
  $ ringpool create /tmp/orders --size 1M --index-capacity 256
  $ ringpool await /tmp/orders --count 10        # Terminal 1: waits for records
  $ ringpool deposit /tmp/orders '{"qty": 12}' --json
  $ ringpool nth /tmp/orders 0
  $ ringpool dispose /tmp/orders"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Log lifecycle and lock activity to stderr (-v debug, -vv trace)"
    )]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Create a pool")]
    Create(CreateArgs),
    #[command(about = "Remove unused pools and their semaphores")]
    Dispose {
        #[arg(required = true, help = "Pool path(s)")]
        paths: Vec<PathBuf>,
    },
    #[command(about = "Show pool geometry, flags, and bounds")]
    Info {
        #[arg(help = "Pool path")]
        path: PathBuf,
    },
    #[command(about = "Append records (argument, or stdin when omitted)")]
    Deposit {
        #[arg(help = "Pool path")]
        path: PathBuf,
        #[arg(help = "Record payload; read from stdin when omitted")]
        payload: Option<String>,
        #[arg(long, help = "Require each payload to be JSON; stored compact")]
        json: bool,
        #[arg(long, help = "Treat each stdin line as its own record")]
        lines: bool,
        #[arg(long, help = "Create the pool with default options if missing")]
        create: bool,
    },
    #[command(about = "Read one record by index")]
    Nth {
        #[arg(help = "Pool path")]
        path: PathBuf,
        #[arg(help = "Record index")]
        index: u64,
        #[command(flatten)]
        output: OutputArgs,
    },
    #[command(about = "Print live records oldest first, one JSON object per line")]
    Dump {
        #[arg(help = "Pool path")]
        path: PathBuf,
        #[arg(long, help = "First record index to print (default: oldest)")]
        from: Option<u64>,
        #[arg(long, help = "Stop after this many records")]
        count: Option<u64>,
        #[command(flatten)]
        output: OutputArgs,
    },
    #[command(about = "Block until new records arrive and print them")]
    Await {
        #[arg(help = "Pool path")]
        path: PathBuf,
        #[arg(long, help = "Wait for this record index instead of the next new one")]
        index: Option<u64>,
        #[arg(long, help = "Give up after this long (e.g. 500ms, 10s); 0 means do not wait")]
        timeout: Option<String>,
        #[arg(long, default_value_t = 1, help = "Records to print before exiting (0 = forever)")]
        count: u64,
        #[command(flatten)]
        output: OutputArgs,
    },
    #[command(about = "Find the record closest to a time")]
    Lookup {
        #[arg(help = "Pool path")]
        path: PathBuf,
        #[arg(help = "RFC 3339 time, or seconds (epoch, or offset with --relative-to)")]
        time: String,
        #[arg(
            long,
            default_value = "nearest",
            help = "nearest | not-earlier-than | not-later-than"
        )]
        direction: String,
        #[arg(long, help = "Interpret TIME as seconds relative to this record index")]
        relative_to: Option<u64>,
        #[command(flatten)]
        output: OutputArgs,
    },
    #[command(about = "Move an unused pool")]
    Rename {
        #[arg(help = "Current pool path")]
        from: PathBuf,
        #[arg(help = "New pool path")]
        to: PathBuf,
    },
    #[command(about = "Release the semaphores of an unused pool")]
    Sleep {
        #[arg(help = "Pool path")]
        path: PathBuf,
    },
    #[command(about = "Scan every live record and index sample for damage")]
    Verify {
        #[arg(help = "Pool path")]
        path: PathBuf,
    },
    #[command(about = "Change permissions or flags of an existing pool")]
    Change {
        #[arg(help = "Pool path")]
        path: PathBuf,
        #[arg(long, help = "File mode, octal (e.g. 0660)")]
        mode: Option<String>,
        #[arg(long, help = "Owner name or uid")]
        owner: Option<String>,
        #[arg(long, help = "Group name or gid")]
        group: Option<String>,
        #[arg(long = "set", value_name = "FLAG", help = "Turn a flag on (repeatable)")]
        set: Vec<String>,
        #[arg(long = "clear", value_name = "FLAG", help = "Turn a flag off (repeatable)")]
        clear: Vec<String>,
    },
}

#[derive(Args)]
struct CreateArgs {
    #[arg(help = "Pool path")]
    path: PathBuf,
    #[arg(long, help = "Size in bytes, k/M/G/T, or tiny|small|medium|large|obscene|max")]
    size: Option<String>,
    #[arg(long, help = "Sparse index slots (0 disables the index)")]
    index_capacity: Option<u64>,
    #[arg(long, help = "Store the pool as one file instead of a directory")]
    single_file: bool,
    #[arg(
        long,
        conflicts_with = "single_file",
        help = "Config-in-file layout with side config files and no flags"
    )]
    legacy: bool,
    #[arg(long, help = "Fail deposits instead of reclaiming old records")]
    stop_when_full: bool,
    #[arg(long, help = "Reject all deposits")]
    frozen: bool,
    #[arg(long, help = "Dispose the pool when its last handle closes")]
    auto_dispose: bool,
    #[arg(long, help = "Mark records as checksummed")]
    checksum: bool,
    #[arg(long, help = "Flush the mapping after every deposit")]
    sync: bool,
    #[arg(long, help = "File mode, octal (e.g. 0660)")]
    mode: Option<String>,
    #[arg(long, help = "Owner name or uid")]
    owner: Option<String>,
    #[arg(long, help = "Group name or gid")]
    group: Option<String>,
}

impl CreateArgs {
    /// Option map in the same shape `PoolOptions::from_config` accepts.
    fn to_config(&self) -> Map<String, Value> {
        let mut config = Map::new();
        if let Some(size) = &self.size {
            let value = size
                .parse::<u64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::from(size.clone()));
            config.insert("size".to_string(), value);
        }
        if let Some(capacity) = self.index_capacity {
            config.insert("index-capacity".to_string(), json!(capacity));
        }
        if self.legacy {
            config.insert("resizable".to_string(), json!(false));
        }
        if self.single_file {
            config.insert("single-file".to_string(), json!(true));
        }
        for (key, on) in [
            ("stop-when-full", self.stop_when_full),
            ("frozen", self.frozen),
            ("auto-dispose", self.auto_dispose),
            ("checksum", self.checksum),
            ("sync", self.sync),
        ] {
            if on {
                config.insert(key.to_string(), json!(true));
            }
        }
        insert_identity(&mut config, &self.mode, &self.owner, &self.group);
        config
    }
}

fn insert_identity(
    config: &mut Map<String, Value>,
    mode: &Option<String>,
    owner: &Option<String>,
    group: &Option<String>,
) {
    if let Some(mode) = mode {
        config.insert("mode".to_string(), json!(mode));
    }
    if let Some(owner) = owner {
        config.insert("owner".to_string(), json!(owner));
    }
    if let Some(group) = group {
        config.insert("group".to_string(), json!(group));
    }
}

#[derive(Args, Clone, Copy)]
struct OutputArgs {
    #[arg(long, help = "Decode payloads as JSON instead of text")]
    json: bool,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = if verbose == 0 {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    } else {
        EnvFilter::new(default)
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    rendered
        .lines()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim_start_matches("error: ").to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

fn add_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Corrupt => {
            err.with_hint("Run `ringpool verify <path>` for details; recreate the pool if damaged.")
        }
        ErrorKind::InUse => err.with_hint("Close every handle on the pool and retry."),
        ErrorKind::Semaphore => {
            err.with_hint("Check `ipcs -s`; `ringpool sleep <path>` releases a stale set.")
        }
        _ => err,
    }
}

fn emit_json(value: &Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

/// One compact line per value, for streams.
fn emit_json_line(value: &Value) {
    let json = serde_json::to_string(value)
        .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("error: {}", error_message(err));
        if let Some(hint) = err.hint() {
            eprintln!("hint: {hint}");
        }
        if let Some(path) = err.path() {
            eprintln!("path: {}", path.display());
        }
        for cause in error_causes(err) {
            eprintln!("caused by: {cause}");
        }
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
        ErrorKind::NotFound => "no such pool".to_string(),
        ErrorKind::NoSuchRecord => "no such record".to_string(),
        ErrorKind::AwaitTimedOut => "timed out waiting for a record".to_string(),
        ErrorKind::AwaitInterrupted => "interrupted".to_string(),
        kind => format!("{kind:?}"),
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
    inner.insert("retort".to_string(), json!(err.kind().retort()));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(index) = err.index() {
        inner.insert("index".to_string(), json!(index));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }
    json!({ "error": Value::Object(inner) })
}

fn parse_duration(input: &str) -> Result<Duration, Error> {
    let invalid = || {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid duration '{input}'"))
            .with_hint("Use a number plus ms|s|m|h (e.g. 10s).")
    };
    let trimmed = input.trim();
    if trimmed == "0" {
        return Ok(Duration::ZERO);
    }
    let split = trimmed
        .char_indices()
        .find(|(_, ch)| !ch.is_ascii_digit())
        .map(|(idx, _)| idx)
        .ok_or_else(invalid)?;
    let (num_str, unit) = trimmed.split_at(split);
    let value: u64 = num_str.parse().map_err(|_| invalid())?;
    let millis = match unit {
        "ms" => value,
        "s" => value.saturating_mul(1_000),
        "m" => value.saturating_mul(60_000),
        "h" => value.saturating_mul(3_600_000),
        _ => return Err(invalid()),
    };
    Ok(Duration::from_millis(millis))
}

/// RFC 3339 or plain (possibly fractional) seconds.
fn parse_time(input: &str) -> Result<f64, Error> {
    let trimmed = input.trim();
    if let Ok(seconds) = trimmed.parse::<f64>() {
        if seconds.is_finite() {
            return Ok(seconds);
        }
    }
    let ts = OffsetDateTime::parse(trimmed, &Rfc3339).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid time '{input}'"))
            .with_hint("Use RFC 3339 (2026-02-02T23:45:00Z) or seconds since the epoch.")
            .with_source(err)
    })?;
    Ok(ts.unix_timestamp_nanos() as f64 / 1e9)
}

fn format_timestamp(timestamp: f64) -> Result<String, Error> {
    let ts = OffsetDateTime::from_unix_timestamp_nanos((timestamp * 1e9) as i128).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("invalid timestamp")
            .with_source(err)
    })?;
    ts.format(&Rfc3339).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("timestamp format failed")
            .with_source(err)
    })
}

fn record_json(record: &Record, output: OutputArgs) -> Result<Value, Error> {
    let mut value = Map::new();
    value.insert("index".to_string(), json!(record.index));
    value.insert("time".to_string(), json!(format_timestamp(record.timestamp)?));
    value.insert("timestamp".to_string(), json!(record.timestamp));
    if output.json {
        let data = JsonCodec
            .deserialize(&record.payload)
            .map_err(|err| err.with_index(record.index))?;
        value.insert("data".to_string(), data);
    } else {
        match std::str::from_utf8(&record.payload) {
            Ok(text) => value.insert("data".to_string(), json!(text)),
            Err(_) => value.insert("hex".to_string(), json!(hex(&record.payload))),
        };
    }
    Ok(Value::Object(value))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, Error> {
    serde_json::to_value(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("json encode failed")
            .with_source(err)
    })
}

fn read_stdin() -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    io::stdin().read_to_end(&mut buf).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read stdin")
            .with_source(err)
    })?;
    Ok(buf)
}

/// Self-pipe that becomes readable when SIGINT arrives; polled next to the notification fifo.
struct InterruptPipe {
    reader: UnixStream,
    signal: SigId,
}

impl InterruptPipe {
    fn install() -> Result<Self, Error> {
        let (reader, writer) = UnixStream::pair().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to create interrupt pipe")
                .with_source(err)
        })?;
        let signal = signal_hook::low_level::pipe::register(signal_hook::consts::SIGINT, writer)
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to install SIGINT handler")
                    .with_source(err)
            })?;
        Ok(Self { reader, signal })
    }

    fn fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }
}

impl Drop for InterruptPipe {
    fn drop(&mut self) {
        signal_hook::low_level::unregister(self.signal);
    }
}
