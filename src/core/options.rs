//! Purpose: Typed pool creation options and post-creation changes, plus their config-map form.
//! Exports: `PoolOptions`, `PoolChanges`, `parse_size`, `resolve_owner`, `resolve_group`.
//! Role: Single place where size classes, flag names, and permission values are interpreted.
//! Invariants: Sizes are rounded up to 4096 and bounded by the size maximum.
//! Invariants: Unknown configuration keys are rejected rather than ignored.
use std::ffi::CString;

use serde_json::{Map, Value};

use crate::core::error::{Error, ErrorKind};
use crate::core::format::{
    PoolFlag, SIZE_GRANULE, SIZE_LARGE, SIZE_MAX, SIZE_MEDIUM, SIZE_OBSCENE, SIZE_SMALL, SIZE_TINY,
};
use crate::core::layout::{DirPerm, PoolLayout};

const KEY_SIZE: &str = "size";
const KEY_INDEX_CAPACITY: &str = "index-capacity";
const KEY_RESIZABLE: &str = "resizable";
const KEY_SINGLE_FILE: &str = "single-file";
const KEY_MODE: &str = "mode";
const KEY_OWNER: &str = "owner";
const KEY_GROUP: &str = "group";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoolOptions {
    pub size: u64,
    pub index_capacity: u64,
    pub resizable: bool,
    pub single_file: bool,
    pub stop_when_full: bool,
    pub frozen: bool,
    pub auto_dispose: bool,
    pub checksum: bool,
    pub sync: bool,
    pub mode: Option<u32>,
    pub owner: Option<u32>,
    pub group: Option<u32>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: SIZE_SMALL,
            index_capacity: 0,
            resizable: true,
            single_file: false,
            stop_when_full: false,
            frozen: false,
            auto_dispose: false,
            checksum: false,
            sync: false,
            mode: None,
            owner: None,
            group: None,
        }
    }
}

impl PoolOptions {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    pub fn with_index_capacity(mut self, capacity: u64) -> Self {
        self.index_capacity = capacity;
        self
    }

    pub fn with_layout(mut self, layout: PoolLayout) -> Self {
        self.resizable = layout != PoolLayout::ConfigInFile;
        self.single_file = layout == PoolLayout::SingleFile;
        self
    }

    pub fn with_flag(mut self, flag: PoolFlag, on: bool) -> Self {
        *self.flag_mut(flag) = on;
        self
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn layout(&self) -> PoolLayout {
        PoolLayout::select(self.resizable, self.single_file)
    }

    /// Flag word stored in `conf.flags`.
    pub fn flags(&self) -> i64 {
        PoolFlag::ALL
            .iter()
            .filter(|flag| self.flag(**flag))
            .fold(0, |bits, flag| bits | flag.bit())
    }

    pub fn flag(&self, flag: PoolFlag) -> bool {
        match flag {
            PoolFlag::StopWhenFull => self.stop_when_full,
            PoolFlag::Frozen => self.frozen,
            PoolFlag::AutoDispose => self.auto_dispose,
            PoolFlag::Checksum => self.checksum,
            PoolFlag::Sync => self.sync,
        }
    }

    fn flag_mut(&mut self, flag: PoolFlag) -> &mut bool {
        match flag {
            PoolFlag::StopWhenFull => &mut self.stop_when_full,
            PoolFlag::Frozen => &mut self.frozen,
            PoolFlag::AutoDispose => &mut self.auto_dispose,
            PoolFlag::Checksum => &mut self.checksum,
            PoolFlag::Sync => &mut self.sync,
        }
    }

    pub fn dir_perm(&self) -> DirPerm {
        DirPerm {
            mode: self.mode,
            uid: self.owner,
            gid: self.group,
        }
    }

    /// Builds options from a configuration map such as `{"size": "tiny", "frozen": true}`.
    pub fn from_config(config: &Map<String, Value>) -> Result<Self, Error> {
        let mut options = Self::default();
        for (key, value) in config {
            match key.as_str() {
                KEY_SIZE => options.size = parse_size(value)?,
                KEY_INDEX_CAPACITY => options.index_capacity = expect_u64(key, value)?,
                KEY_RESIZABLE => options.resizable = expect_bool(key, value)?,
                KEY_SINGLE_FILE => options.single_file = expect_bool(key, value)?,
                KEY_MODE => options.mode = Some(parse_mode(value)?),
                KEY_OWNER => options.owner = Some(resolve_owner_value(value)?),
                KEY_GROUP => options.group = Some(resolve_group_value(value)?),
                other => match flag_for_key(other) {
                    Some(flag) => *options.flag_mut(flag) = expect_bool(key, value)?,
                    None => return Err(unknown_key(other)),
                },
            }
        }
        Ok(options)
    }
}

/// Requested edits to an existing pool; `None` leaves a setting alone.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PoolChanges {
    pub size: Option<u64>,
    pub mode: Option<u32>,
    pub owner: Option<u32>,
    pub group: Option<u32>,
    pub flags: Vec<(PoolFlag, bool)>,
}

impl PoolChanges {
    pub fn set_flag(mut self, flag: PoolFlag, on: bool) -> Self {
        self.flags.retain(|(existing, _)| *existing != flag);
        self.flags.push((flag, on));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.size.is_none()
            && self.mode.is_none()
            && self.owner.is_none()
            && self.group.is_none()
            && self.flags.is_empty()
    }

    pub fn from_config(config: &Map<String, Value>) -> Result<Self, Error> {
        let mut changes = Self::default();
        for (key, value) in config {
            match key.as_str() {
                KEY_SIZE => changes.size = Some(parse_size(value)?),
                KEY_MODE => changes.mode = Some(parse_mode(value)?),
                KEY_OWNER => changes.owner = Some(resolve_owner_value(value)?),
                KEY_GROUP => changes.group = Some(resolve_group_value(value)?),
                other => match flag_for_key(other) {
                    Some(flag) => changes = changes.set_flag(flag, expect_bool(key, value)?),
                    None => return Err(unknown_key(other)),
                },
            }
        }
        Ok(changes)
    }
}

fn flag_for_key(key: &str) -> Option<PoolFlag> {
    PoolFlag::ALL.into_iter().find(|flag| flag.name() == key)
}

fn unknown_key(key: &str) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message(format!("unknown pool option '{key}'"))
        .with_hint("Known options: size, index-capacity, resizable, single-file, stop-when-full, frozen, auto-dispose, checksum, sync, mode, owner, group.")
}

fn expect_bool(key: &str, value: &Value) -> Result<bool, Error> {
    value.as_bool().ok_or_else(|| {
        Error::new(ErrorKind::Usage).with_message(format!("option '{key}' must be a boolean"))
    })
}

fn expect_u64(key: &str, value: &Value) -> Result<u64, Error> {
    value.as_u64().ok_or_else(|| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("option '{key}' must be a non-negative integer"))
    })
}

/// Accepts a byte count, a size class name, or `<number>[k|M|G|T]`.
pub fn parse_size(value: &Value) -> Result<u64, Error> {
    let bytes = match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .ok_or_else(|| invalid_size(format!("size {number} is not a byte count")))?,
        Value::String(text) => parse_size_str(text)?,
        other => return Err(invalid_size(format!("size {other} is not a byte count"))),
    };
    round_size(bytes)
}

pub fn parse_size_str(text: &str) -> Result<u64, Error> {
    let text = text.trim();
    match text {
        "tiny" => return Ok(SIZE_TINY),
        "small" => return Ok(SIZE_SMALL),
        "medium" => return Ok(SIZE_MEDIUM),
        "large" => return Ok(SIZE_LARGE),
        "obscene" => return Ok(SIZE_OBSCENE),
        "max" => return Ok(SIZE_MAX),
        _ => {}
    }
    let (digits, shift) = match text.chars().last() {
        Some('k') => (&text[..text.len() - 1], 10),
        Some('M') => (&text[..text.len() - 1], 20),
        Some('G') => (&text[..text.len() - 1], 30),
        Some('T') => (&text[..text.len() - 1], 40),
        _ => (text, 0),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(invalid_size(format!("unrecognized size '{text}'")));
    }
    if let Ok(whole) = digits.parse::<u64>() {
        return whole
            .checked_mul(1u64 << shift)
            .ok_or_else(|| invalid_size(format!("size '{text}' overflows")));
    }
    let fractional: f64 = digits
        .parse()
        .map_err(|_| invalid_size(format!("unrecognized size '{text}'")))?;
    Ok((fractional * (1u64 << shift) as f64) as u64)
}

fn round_size(bytes: u64) -> Result<u64, Error> {
    if bytes == 0 {
        return Ok(SIZE_SMALL);
    }
    let rounded = bytes
        .checked_add(SIZE_GRANULE - 1)
        .map(|padded| padded / SIZE_GRANULE * SIZE_GRANULE)
        .ok_or_else(|| invalid_size(format!("size {bytes} overflows")))?;
    if rounded > SIZE_MAX {
        return Err(invalid_size(format!(
            "size {rounded} exceeds the maximum of {SIZE_MAX}"
        )));
    }
    Ok(rounded)
}

fn invalid_size(message: String) -> Error {
    Error::new(ErrorKind::InvalidSize).with_message(message)
}

/// Mode as an integer or an octal string such as `"0640"`.
fn parse_mode(value: &Value) -> Result<u32, Error> {
    let mode = match value {
        Value::Number(number) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(text) => u32::from_str_radix(text.trim_start_matches("0o"), 8).ok(),
        _ => None,
    };
    match mode {
        Some(mode) if mode <= 0o7777 => Ok(mode),
        _ => Err(Error::new(ErrorKind::Usage)
            .with_message(format!("invalid mode {value}"))
            .with_hint("Use an octal string like \"0660\".")),
    }
}

fn resolve_owner_value(value: &Value) -> Result<u32, Error> {
    match value {
        Value::String(name) => resolve_owner(name),
        Value::Number(number) => id_from_number(number.as_u64(), "owner"),
        other => Err(Error::new(ErrorKind::Usage).with_message(format!("invalid owner {other}"))),
    }
}

fn resolve_group_value(value: &Value) -> Result<u32, Error> {
    match value {
        Value::String(name) => resolve_group(name),
        Value::Number(number) => id_from_number(number.as_u64(), "group"),
        other => Err(Error::new(ErrorKind::Usage).with_message(format!("invalid group {other}"))),
    }
}

fn id_from_number(id: Option<u64>, what: &str) -> Result<u32, Error> {
    id.and_then(|id| u32::try_from(id).ok()).ok_or_else(|| {
        Error::new(ErrorKind::Usage).with_message(format!("{what} id out of range"))
    })
}

const NAME_BUFFER_LEN: usize = 16 * 1024;

/// User name or numeric uid to a uid, via the passwd database.
pub fn resolve_owner(name: &str) -> Result<u32, Error> {
    if let Ok(uid) = name.parse::<u32>() {
        return Ok(uid);
    }
    let c_name = c_name(name)?;
    let mut entry: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let mut buf = vec![0 as libc::c_char; NAME_BUFFER_LEN];
    let rc = unsafe {
        libc::getpwnam_r(
            c_name.as_ptr(),
            &mut entry,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return Err(no_such_id("user", name));
    }
    Ok(entry.pw_uid)
}

/// Group name or numeric gid to a gid, via the group database.
pub fn resolve_group(name: &str) -> Result<u32, Error> {
    if let Ok(gid) = name.parse::<u32>() {
        return Ok(gid);
    }
    let c_name = c_name(name)?;
    let mut entry: libc::group = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::group = std::ptr::null_mut();
    let mut buf = vec![0 as libc::c_char; NAME_BUFFER_LEN];
    let rc = unsafe {
        libc::getgrnam_r(
            c_name.as_ptr(),
            &mut entry,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return Err(no_such_id("group", name));
    }
    Ok(entry.gr_gid)
}

fn c_name(name: &str) -> Result<CString, Error> {
    CString::new(name).map_err(|_| {
        Error::new(ErrorKind::Usage).with_message("account name contains a NUL byte")
    })
}

fn no_such_id(what: &str, name: &str) -> Error {
    Error::new(ErrorKind::Usage).with_message(format!("no such {what} '{name}'"))
}
