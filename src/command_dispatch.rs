//! Purpose: Top-level CLI command dispatch for `ringpool`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and output helpers.
//! Invariants: Every command opens pools through `Pool`; no command touches pool files directly.
use super::*;

use ringpool::core::lookup::{Direction, Whence};
use ringpool::core::options::{PoolChanges, PoolOptions};
use ringpool::core::pool::{Pool, Timeout};

pub(super) fn dispatch_command(command: Command) -> Result<RunOutcome, Error> {
    match command {
        Command::Create(args) => {
            let options = PoolOptions::from_config(&args.to_config())?;
            Pool::create(&args.path, &options)?;
            let pool = Pool::open(&args.path)?;
            emit_json(&to_json(&pool.info()?)?);
            Ok(RunOutcome::ok())
        }
        Command::Dispose { paths } => {
            for path in &paths {
                Pool::dispose(path)?;
            }
            emit_json(&json!({ "disposed": paths }));
            Ok(RunOutcome::ok())
        }
        Command::Info { path } => {
            let pool = Pool::open(&path)?;
            emit_json(&to_json(&pool.info()?)?);
            Ok(RunOutcome::ok())
        }
        Command::Deposit {
            path,
            payload,
            json,
            lines,
            create,
        } => {
            let mut pool = if create {
                Pool::participate_creatingly(&path, &PoolOptions::default())?
            } else {
                Pool::open(&path)?
            };
            let payloads = match payload {
                Some(payload) => vec![payload.into_bytes()],
                None if lines => read_stdin()?
                    .split(|byte| *byte == b'\n')
                    .filter(|line| !line.is_empty())
                    .map(<[u8]>::to_vec)
                    .collect(),
                None => vec![read_stdin()?],
            };
            for payload in payloads {
                let receipt = if json {
                    let value: Value = serde_json::from_slice(&payload).map_err(|err| {
                        Error::new(ErrorKind::Usage)
                            .with_message("payload is not valid JSON")
                            .with_source(err)
                    })?;
                    pool.deposit_with(&JsonCodec, &value)?
                } else {
                    pool.deposit(&payload)?
                };
                emit_json_line(&json!({
                    "index": receipt.index,
                    "time": format_timestamp(receipt.timestamp)?,
                    "timestamp": receipt.timestamp,
                    "offset": receipt.offset,
                }));
            }
            pool.close()?;
            Ok(RunOutcome::ok())
        }
        Command::Nth {
            path,
            index,
            output,
        } => {
            let mut pool = Pool::open(&path)?;
            let record = pool.nth(index)?;
            emit_json(&record_json(&record, output)?);
            Ok(RunOutcome::ok())
        }
        Command::Dump {
            path,
            from,
            count,
            output,
        } => {
            let mut pool = Pool::open(&path)?;
            match from {
                Some(index) => {
                    pool.seek_to(index)?;
                }
                None => pool.rewind(),
            }
            let mut emitted = 0u64;
            while count.is_none_or(|count| emitted < count) {
                let record = match pool.next() {
                    Ok(record) => record,
                    Err(err) if err.kind() == ErrorKind::NoSuchRecord => break,
                    Err(err) => return Err(err),
                };
                emit_json_line(&record_json(&record, output)?);
                emitted += 1;
            }
            Ok(RunOutcome::ok())
        }
        Command::Await {
            path,
            index,
            timeout,
            count,
            output,
        } => {
            let timeout = match timeout.as_deref().map(parse_duration).transpose()? {
                None => Timeout::Forever,
                Some(duration) if duration.is_zero() => Timeout::NoWait,
                Some(duration) => Timeout::After(duration),
            };
            let interrupt = InterruptPipe::install()?;
            let mut pool = Pool::open(&path)?;
            let mut emitted = 0u64;
            if let Some(index) = index {
                let record = pool.await_nth(index, timeout, Some(interrupt.fd()))?;
                emit_json_line(&record_json(&record, output)?);
                emitted += 1;
            }
            while count == 0 || emitted < count {
                let record = pool.await_next(timeout, Some(interrupt.fd()))?;
                emit_json_line(&record_json(&record, output)?);
                emitted += 1;
            }
            Ok(RunOutcome::ok())
        }
        Command::Lookup {
            path,
            time,
            direction,
            relative_to,
            output,
        } => {
            let direction = Direction::parse(&direction).ok_or_else(|| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("unknown direction '{direction}'"))
                    .with_hint("Use nearest, not-earlier-than, or not-later-than.")
            })?;
            let whence = match relative_to {
                Some(index) => Whence::Relative(index),
                None => Whence::Absolute,
            };
            let timestamp = parse_time(&time)?;
            let mut pool = Pool::open(&path)?;
            let hit = pool.lookup(timestamp, whence, direction)?;
            let mut value = record_json(&pool.nth(hit.index)?, output)?;
            if let Value::Object(map) = &mut value {
                map.insert("offset".to_string(), json!(hit.offset));
            }
            emit_json(&value);
            Ok(RunOutcome::ok())
        }
        Command::Rename { from, to } => {
            Pool::rename(&from, &to)?;
            emit_json(&json!({ "from": from, "to": to }));
            Ok(RunOutcome::ok())
        }
        Command::Sleep { path } => {
            Pool::sleep(&path)?;
            emit_json(&json!({ "asleep": path }));
            Ok(RunOutcome::ok())
        }
        Command::Verify { path } => {
            let pool = Pool::open(&path)?;
            let report = pool.validate()?;
            let clean = report.is_clean();
            emit_json(&json!({
                "path": path,
                "status": if clean { "ok" } else { "corrupt" },
                "report": to_json(&report)?,
            }));
            let exit_code = if clean {
                0
            } else {
                to_exit_code(ErrorKind::Corrupt)
            };
            Ok(RunOutcome::with_code(exit_code))
        }
        Command::Change {
            path,
            mode,
            owner,
            group,
            set,
            clear,
        } => {
            let mut config = Map::new();
            insert_identity(&mut config, &mode, &owner, &group);
            for (names, on) in [(&set, true), (&clear, false)] {
                for name in names {
                    config.insert(name.clone(), json!(on));
                }
            }
            let changes = PoolChanges::from_config(&config)?;
            if changes.is_empty() {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("nothing to change")
                    .with_hint("Pass --mode, --owner, --group, --set FLAG, or --clear FLAG."));
            }
            let mut pool = Pool::open(&path)?;
            pool.change_options(&changes)?;
            emit_json(&to_json(&pool.info()?)?);
            Ok(RunOutcome::ok())
        }
    }
}
