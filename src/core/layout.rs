//! Purpose: Map a pool path onto its on-disk layout and the files that layout uses.
//! Exports: `PoolLayout`, `PoolPaths`, `PoolConf`, `MmapConf`, `characterize`.
//! Role: Chosen once at create/open; the engine never branches on paths after that.
//! Invariants: A directory pool always carries `pool.conf` with a known `pool-version`.
//! Invariants: Single-file pools keep notifications in `<parent>/.notification/<name>/`.
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::core::error::{Error, ErrorKind};
use crate::core::format::{
    DIRECTORY_VERSION_CONFIG_IN_FILE, DIRECTORY_VERSION_CONFIG_IN_MMAP,
    DIRECTORY_VERSION_SINGLE_FILE,
};
use crate::core::header::{LegacyConf, PermBits};
use crate::core::store::io_error;

pub const POOL_CONF_NAME: &str = "pool.conf";
pub const MMAP_CONF_NAME: &str = "mmap.conf";
pub const MMAP_FILE_NAME: &str = "mmap-pool";
pub const NOTIFICATION_DIR_NAME: &str = "notification";
pub const SINGLE_FILE_NOTIFICATION_DIR: &str = ".notification";
const POOL_TYPE_MMAP: &str = "mmap";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolLayout {
    /// Directory with a chunked mapped file; the default.
    ConfigInMmap,
    /// Directory with a legacy mapped file; sizes and permissions live in side files.
    ConfigInFile,
    /// The path itself is the chunked mapped file.
    SingleFile,
}

impl PoolLayout {
    pub fn directory_version(self) -> u32 {
        match self {
            PoolLayout::ConfigInMmap => DIRECTORY_VERSION_CONFIG_IN_MMAP,
            PoolLayout::ConfigInFile => DIRECTORY_VERSION_CONFIG_IN_FILE,
            PoolLayout::SingleFile => DIRECTORY_VERSION_SINGLE_FILE,
        }
    }

    pub fn is_chunked(self) -> bool {
        !matches!(self, PoolLayout::ConfigInFile)
    }

    /// Layout selected by the `resizable` and `single-file` creation options.
    pub fn select(resizable: bool, single_file: bool) -> Self {
        if single_file {
            PoolLayout::SingleFile
        } else if resizable {
            PoolLayout::ConfigInMmap
        } else {
            PoolLayout::ConfigInFile
        }
    }
}

/// Every filesystem location a pool of a given layout touches.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoolPaths {
    pub layout: PoolLayout,
    /// The path callers name the pool by.
    pub root: PathBuf,
    pub mmap_file: PathBuf,
    pub pool_conf: Option<PathBuf>,
    pub mmap_conf: Option<PathBuf>,
    pub notification_dir: PathBuf,
}

impl PoolPaths {
    pub fn new(root: &Path, layout: PoolLayout) -> Result<Self, Error> {
        let name = root.file_name().ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message("pool path has no final component")
                .with_path(root)
        })?;
        let root = root.to_path_buf();
        let paths = match layout {
            PoolLayout::ConfigInMmap => Self {
                layout,
                mmap_file: root.join(MMAP_FILE_NAME),
                pool_conf: Some(root.join(POOL_CONF_NAME)),
                mmap_conf: None,
                notification_dir: root.join(NOTIFICATION_DIR_NAME),
                root,
            },
            PoolLayout::ConfigInFile => {
                let mut file_name = name.to_os_string();
                file_name.push(".mmap-pool");
                Self {
                    layout,
                    mmap_file: root.join(file_name),
                    pool_conf: Some(root.join(POOL_CONF_NAME)),
                    mmap_conf: Some(root.join(MMAP_CONF_NAME)),
                    notification_dir: root.join(NOTIFICATION_DIR_NAME),
                    root,
                }
            }
            PoolLayout::SingleFile => {
                let parent = match root.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                    _ => PathBuf::from("."),
                };
                Self {
                    layout,
                    mmap_file: root.clone(),
                    pool_conf: None,
                    mmap_conf: None,
                    notification_dir: parent.join(SINGLE_FILE_NOTIFICATION_DIR).join(name),
                    root,
                }
            }
        };
        Ok(paths)
    }

    /// Characterizes an existing pool and resolves its paths.
    pub fn discover(root: &Path) -> Result<Self, Error> {
        Self::new(root, characterize(root)?)
    }

    /// Directory pools own their root directory; single-file pools do not.
    pub fn owns_root(&self) -> bool {
        self.layout != PoolLayout::SingleFile
    }
}

/// `pool.conf`: identifies the layout; legacy pools also keep permissions and the semaphore key.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PoolConf {
    #[serde(rename = "type")]
    pub kind: String,
    pub pool_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perms: Option<[i64; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sem_key: Option<i64>,
}

impl PoolConf {
    pub fn for_layout(layout: PoolLayout) -> Self {
        Self {
            kind: POOL_TYPE_MMAP.to_string(),
            pool_version: layout.directory_version(),
            perms: None,
            sem_key: None,
        }
    }

    pub fn legacy(perm: PermBits, sem_key: i64) -> Self {
        Self {
            perms: Some([perm.mode, perm.uid, perm.gid]),
            sem_key: Some(sem_key),
            ..Self::for_layout(PoolLayout::ConfigInFile)
        }
    }

    pub fn perm(&self) -> Option<PermBits> {
        self.perms.map(|[mode, uid, gid]| PermBits { mode, uid, gid })
    }
}

/// `mmap.conf`: geometry of a legacy mapped file.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MmapConf {
    pub header_size: u64,
    pub file_size: u64,
    #[serde(default)]
    pub index_capacity: u64,
}

/// Determines the layout of the pool at `path` without opening it.
pub fn characterize(path: &Path) -> Result<PoolLayout, Error> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message("no such pool")
                .with_path(path));
        }
        Err(err) => return Err(io_error(path, err)),
    };
    if !meta.is_dir() {
        return Ok(PoolLayout::SingleFile);
    }
    let conf_path = path.join(POOL_CONF_NAME);
    if !conf_path.exists() {
        return Err(Error::new(ErrorKind::NotFound)
            .with_message("directory has no pool.conf")
            .with_path(path));
    }
    let conf: PoolConf = read_json(&conf_path)?;
    match conf.pool_version {
        DIRECTORY_VERSION_CONFIG_IN_MMAP => Ok(PoolLayout::ConfigInMmap),
        DIRECTORY_VERSION_CONFIG_IN_FILE => Ok(PoolLayout::ConfigInFile),
        other => Err(Error::new(ErrorKind::Corrupt)
            .with_message(format!(
                "pool-version {other}, expected {DIRECTORY_VERSION_CONFIG_IN_FILE} or {DIRECTORY_VERSION_CONFIG_IN_MMAP}"
            ))
            .with_path(conf_path)),
    }
}

/// Reads both legacy side files into the settings the mapped header lacks.
pub fn load_legacy_conf(paths: &PoolPaths) -> Result<(LegacyConf, Option<PermBits>), Error> {
    let (Some(pool_conf), Some(mmap_conf)) = (&paths.pool_conf, &paths.mmap_conf) else {
        return Err(Error::new(ErrorKind::Internal)
            .with_message("layout has no legacy config files")
            .with_path(&paths.root));
    };
    let pool: PoolConf = read_json(pool_conf)?;
    let mmap: MmapConf = read_json(mmap_conf)?;
    let sem_key = pool.sem_key.ok_or_else(|| {
        Error::new(ErrorKind::Corrupt)
            .with_message("pool.conf is missing 'sem-key'")
            .with_path(pool_conf)
    })?;
    Ok((
        LegacyConf {
            file_size: mmap.file_size,
            header_size: mmap.header_size,
            index_capacity: mmap.index_capacity,
            sem_key,
        },
        pool.perm(),
    ))
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let bytes = fs::read(path).map_err(|err| io_error(path, err))?;
    serde_json::from_slice(&bytes).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message(format!("unreadable config: {err}"))
            .with_path(path)
    })
}

/// Writes `value` as JSON, replacing the file atomically.
pub fn write_json<T: Serialize>(path: &Path, value: &T, mode: Option<u32>) -> Result<(), Error> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|err| {
        Error::new(ErrorKind::Internal).with_message(format!("config encode failed: {err}"))
    })?;
    bytes.push(b'\n');
    let mut staged = path.as_os_str().to_os_string();
    staged.push(".tmp");
    let staged = PathBuf::from(staged);
    let mut options = OpenOptions::new();
    options.create(true).truncate(true).write(true);
    if let Some(mode) = mode {
        options.mode(mode & 0o666);
    }
    let mut file = options.open(&staged).map_err(|err| io_error(&staged, err))?;
    file.write_all(&bytes).map_err(|err| io_error(&staged, err))?;
    file.sync_all().map_err(|err| io_error(&staged, err))?;
    fs::rename(&staged, path).map_err(|err| io_error(path, err))
}

/// Creates `path` and missing parents, applying `mode` and ownership to what it created.
pub fn make_dirs(path: &Path, perm: &DirPerm) -> Result<(), Error> {
    if path.is_dir() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            make_dirs(parent, perm)?;
        }
    }
    let mut builder = DirBuilder::new();
    if let Some(mode) = perm.mode {
        builder.mode(mode);
    }
    match builder.create(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(()),
        Err(err) => return Err(io_error(path, err)),
    }
    perm.apply(path)
}

/// Permission settings applied to files and directories a pool creates.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DirPerm {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl DirPerm {
    /// Sets mode exactly (ignoring umask) and ownership where requested.
    pub fn apply(&self, path: &Path) -> Result<(), Error> {
        if let Some(mode) = self.mode {
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .map_err(|err| io_error(path, err))?;
        }
        if self.uid.is_some() || self.gid.is_some() {
            std::os::unix::fs::chown(path, self.uid, self.gid)
                .map_err(|err| io_error(path, err))?;
        }
        Ok(())
    }

    /// Directory variant: search bits follow read bits, so `0o640` becomes `0o750`.
    pub fn for_directories(&self) -> Self {
        Self {
            mode: self.mode.map(|mode| mode | ((mode & 0o444) >> 2)),
            ..*self
        }
    }

    /// File variant: execute bits dropped.
    pub fn for_files(&self) -> Self {
        Self {
            mode: self.mode.map(|mode| mode & 0o666),
            ..*self
        }
    }

    pub fn bits(&self) -> PermBits {
        PermBits {
            mode: self.mode.map(i64::from).unwrap_or(-1),
            uid: self.uid.map(i64::from).unwrap_or(-1),
            gid: self.gid.map(i64::from).unwrap_or(-1),
        }
    }
}

/// Removes `path` if it is an empty directory; anything else is left alone.
pub fn remove_dir_if_empty(path: &Path) {
    if let Err(err) = fs::remove_dir(path) {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), error = %err, "left directory in place");
        }
    }
}
