//! Engine configuration: collation, pragmas, connection-string parsing and
//! the settings record frozen at engine construction.

use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use crate::error::{DbError, Result};

// ============================================================================
// Collation
// ============================================================================

/// String ordering and equality rules, frozen at database creation and
/// recorded in the header page. Changing collation requires a rebuild.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Collation {
    mode: CollationMode,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum CollationMode {
    /// Byte-wise comparison of the UTF-8 encoding.
    Ordinal,
    /// Ordinal over simple-case-folded text.
    OrdinalIgnoreCase,
    /// Named culture; compares case-folded when `ignore_case` is set.
    Culture { name: String, ignore_case: bool },
}

impl Collation {
    pub fn ordinal() -> Self {
        Collation {
            mode: CollationMode::Ordinal,
        }
    }

    pub fn ordinal_ignore_case() -> Self {
        Collation {
            mode: CollationMode::OrdinalIgnoreCase,
        }
    }

    /// Parse `"<culture>"` or `"<culture>/IgnoreCase"`.
    pub fn parse(text: &str) -> Result<Self> {
        let (name, options) = match text.split_once('/') {
            Some((n, o)) => (n.trim(), o.trim()),
            None => (text.trim(), ""),
        };
        let ignore_case = match options {
            "" | "None" => false,
            "IgnoreCase" => true,
            other => {
                return Err(DbError::usage(format!(
                    "unsupported collation option '{other}'"
                )))
            }
        };
        Ok(match name {
            "" | "ordinal" => {
                if ignore_case {
                    Collation::ordinal_ignore_case()
                } else {
                    Collation::ordinal()
                }
            }
            culture => Collation {
                mode: CollationMode::Culture {
                    name: culture.to_string(),
                    ignore_case,
                },
            },
        })
    }

    fn folds_case(&self) -> bool {
        match &self.mode {
            CollationMode::Ordinal => false,
            CollationMode::OrdinalIgnoreCase => true,
            CollationMode::Culture { ignore_case, .. } => *ignore_case,
        }
    }

    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        if self.folds_case() {
            a.chars()
                .flat_map(char::to_lowercase)
                .cmp(b.chars().flat_map(char::to_lowercase))
        } else {
            a.cmp(b)
        }
    }

    pub fn eq_str(&self, a: &str, b: &str) -> bool {
        self.compare(a, b) == Ordering::Equal
    }
}

impl fmt::Display for Collation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mode {
            CollationMode::Ordinal => write!(f, "ordinal"),
            CollationMode::OrdinalIgnoreCase => write!(f, "ordinal/IgnoreCase"),
            CollationMode::Culture { name, ignore_case } => {
                if *ignore_case {
                    write!(f, "{name}/IgnoreCase")
                } else {
                    write!(f, "{name}")
                }
            }
        }
    }
}

impl Default for Collation {
    fn default() -> Self {
        Collation::ordinal()
    }
}

// ============================================================================
// Pragmas
// ============================================================================

pub const DEFAULT_TIMEOUT_SECS: u32 = 60;
pub const DEFAULT_CHECKPOINT_SIZE: u32 = 1000;

/// Mutable per-file settings persisted in the header page.
///
/// COLLATION is read-only (rebuild to change); the rest are writable through
/// the pragma surface.
#[derive(Debug)]
pub struct Pragmas {
    pub user_version: AtomicI32,
    /// Lock acquire timeout, seconds.
    pub timeout: AtomicU32,
    /// Max file size in bytes; 0 means unbounded.
    pub limit_size: AtomicU64,
    /// Render DateTime values as UTC instead of local time.
    pub utc_date: AtomicBool,
    /// Log-page threshold that triggers auto-checkpoint; 0 disables.
    pub checkpoint: AtomicU32,
    pub collation: Collation,
}

impl Pragmas {
    pub fn new(collation: Collation) -> Self {
        Pragmas {
            user_version: AtomicI32::new(0),
            timeout: AtomicU32::new(DEFAULT_TIMEOUT_SECS),
            limit_size: AtomicU64::new(0),
            utc_date: AtomicBool::new(false),
            checkpoint: AtomicU32::new(DEFAULT_CHECKPOINT_SIZE),
            collation,
        }
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout.load(AtomicOrdering::Relaxed) as u64)
    }

    pub fn get(&self, name: &str) -> Result<crate::bson::Value> {
        use crate::bson::Value;
        Ok(match name.to_ascii_uppercase().as_str() {
            "USER_VERSION" => Value::Int32(self.user_version.load(AtomicOrdering::Relaxed)),
            "TIMEOUT" => Value::Int32(self.timeout.load(AtomicOrdering::Relaxed) as i32),
            "LIMIT_SIZE" => Value::Int64(self.limit_size.load(AtomicOrdering::Relaxed) as i64),
            "UTC_DATE" => Value::Boolean(self.utc_date.load(AtomicOrdering::Relaxed)),
            "CHECKPOINT" => Value::Int32(self.checkpoint.load(AtomicOrdering::Relaxed) as i32),
            "COLLATION" => Value::String(self.collation.to_string()),
            other => return Err(DbError::usage(format!("unknown pragma '{other}'"))),
        })
    }

    pub fn set(&self, name: &str, value: &crate::bson::Value) -> Result<()> {
        match name.to_ascii_uppercase().as_str() {
            "USER_VERSION" => {
                let v = value
                    .as_i32()
                    .ok_or_else(|| DbError::usage("USER_VERSION requires an int32"))?;
                self.user_version.store(v, AtomicOrdering::Relaxed);
            }
            "TIMEOUT" => {
                let v = value
                    .as_i32()
                    .filter(|v| *v > 0)
                    .ok_or_else(|| DbError::usage("TIMEOUT requires a positive int32"))?;
                self.timeout.store(v as u32, AtomicOrdering::Relaxed);
            }
            "LIMIT_SIZE" => {
                let v = value
                    .as_i64()
                    .filter(|v| *v >= 0)
                    .ok_or_else(|| DbError::usage("LIMIT_SIZE requires a non-negative int"))?;
                self.limit_size.store(v as u64, AtomicOrdering::Relaxed);
            }
            "UTC_DATE" => {
                let v = value
                    .as_bool()
                    .ok_or_else(|| DbError::usage("UTC_DATE requires a boolean"))?;
                self.utc_date.store(v, AtomicOrdering::Relaxed);
            }
            "CHECKPOINT" => {
                let v = value
                    .as_i32()
                    .filter(|v| *v >= 0)
                    .ok_or_else(|| DbError::usage("CHECKPOINT requires a non-negative int32"))?;
                self.checkpoint.store(v as u32, AtomicOrdering::Relaxed);
            }
            "COLLATION" => {
                return Err(DbError::usage(
                    "COLLATION is read-only; rebuild the database to change it",
                ))
            }
            other => return Err(DbError::usage(format!("unknown pragma '{other}'"))),
        }
        Ok(())
    }
}

// ============================================================================
// Connection string
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ConnectionMode {
    /// Exclusive file lock, single process.
    #[default]
    Direct,
    /// Multi-process access serialized by a system-wide mutex owned by the
    /// caller-side wrapper.
    Shared,
}

/// Parsed `key=value; ...` connection options. A bare string is treated as
/// the filename. Keys are case-insensitive.
#[derive(Clone, Debug, Default)]
pub struct ConnectionString {
    pub filename: String,
    pub connection: ConnectionMode,
    pub password: Option<String>,
    pub initial_size: u64,
    pub read_only: bool,
    pub upgrade: bool,
}

impl FromStr for ConnectionString {
    type Err = DbError;

    fn from_str(text: &str) -> Result<Self> {
        let mut conn = ConnectionString::default();
        if !text.contains('=') {
            conn.filename = text.trim().to_string();
            return Ok(conn);
        }
        for pair in text.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| DbError::usage(format!("invalid connection option '{pair}'")))?;
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "filename" => conn.filename = value.to_string(),
                "connection" => {
                    conn.connection = match value.to_ascii_lowercase().as_str() {
                        "direct" => ConnectionMode::Direct,
                        "shared" => ConnectionMode::Shared,
                        other => {
                            return Err(DbError::usage(format!(
                                "unknown connection mode '{other}'"
                            )))
                        }
                    }
                }
                "password" => conn.password = Some(value.to_string()),
                "initialsize" | "initial size" => {
                    conn.initial_size = parse_file_size(value)?;
                }
                "readonly" | "read only" => {
                    conn.read_only = parse_bool(value)?;
                }
                "upgrade" => conn.upgrade = parse_bool(value)?,
                other => return Err(DbError::usage(format!("unknown connection key '{other}'"))),
            }
        }
        Ok(conn)
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(DbError::usage(format!("invalid boolean '{other}'"))),
    }
}

/// Accepts plain bytes or a `KB`/`MB`/`GB` suffix.
fn parse_file_size(value: &str) -> Result<u64> {
    let value = value.trim().to_ascii_uppercase();
    let (digits, factor) = if let Some(v) = value.strip_suffix("KB") {
        (v.trim().to_string(), 1024)
    } else if let Some(v) = value.strip_suffix("MB") {
        (v.trim().to_string(), 1024 * 1024)
    } else if let Some(v) = value.strip_suffix("GB") {
        (v.trim().to_string(), 1024 * 1024 * 1024)
    } else {
        (value, 1)
    };
    digits
        .parse::<u64>()
        .map(|v| v * factor)
        .map_err(|_| DbError::usage("invalid file size"))
}

// ============================================================================
// Engine settings
// ============================================================================

/// Immutable settings frozen when the engine handle is constructed.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// Path to the data file; `:memory:` and `:temp:` are magic names.
    pub filename: String,
    pub connection: ConnectionMode,
    pub password: Option<String>,
    /// Pre-allocate the data file to this size on creation.
    pub initial_size: u64,
    pub read_only: bool,
    /// Accept older file-format versions by rebuilding on open.
    pub upgrade: bool,
    /// Collation applied when the file is created.
    pub collation: Collation,
    /// Page-cache byte budget (extension cap).
    pub cache_size: usize,
    /// Dirty-page count that makes a safepoint spill to the log.
    pub max_transaction_pages: usize,
    /// Rebuild automatically when structural corruption is detected.
    pub auto_rebuild: bool,
    /// Minimum interval between automatic rebuilds.
    pub auto_rebuild_cooldown: Duration,
}

pub const DEFAULT_CACHE_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_TRANSACTION_PAGES: usize = 512;

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            filename: ":memory:".to_string(),
            connection: ConnectionMode::Direct,
            password: None,
            initial_size: 0,
            read_only: false,
            upgrade: false,
            collation: Collation::default(),
            cache_size: DEFAULT_CACHE_SIZE,
            max_transaction_pages: DEFAULT_MAX_TRANSACTION_PAGES,
            auto_rebuild: false,
            auto_rebuild_cooldown: Duration::from_secs(5 * 60),
        }
    }
}

impl EngineSettings {
    pub fn from_connection_string(conn: &ConnectionString) -> Self {
        EngineSettings {
            filename: conn.filename.clone(),
            connection: conn.connection,
            password: conn.password.clone(),
            initial_size: conn.initial_size,
            read_only: conn.read_only,
            upgrade: conn.upgrade,
            ..EngineSettings::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.filename == ":memory:"
    }

    pub fn is_temp(&self) -> bool {
        self.filename == ":temp:"
    }

    /// Companion file paths, `<name>-log.db` style, in the data directory.
    pub fn log_path(&self) -> PathBuf {
        companion_path(&self.filename, "-log")
    }

    pub fn temp_path(&self) -> PathBuf {
        companion_path(&self.filename, "-tmp")
    }

    pub fn backup_path(&self) -> PathBuf {
        companion_path(&self.filename, "-backup")
    }
}

fn companion_path(filename: &str, suffix: &str) -> PathBuf {
    let path = PathBuf::from(filename);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| filename.to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    path.with_file_name(format!("{stem}{suffix}{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_string_bare_filename() {
        let conn: ConnectionString = "data/app.db".parse().unwrap();
        assert_eq!(conn.filename, "data/app.db");
        assert_eq!(conn.connection, ConnectionMode::Direct);
    }

    #[test]
    fn connection_string_options_case_insensitive() {
        let conn: ConnectionString =
            "Filename=app.db; Connection=shared; PASSWORD=hunter2; InitialSize=8KB; ReadOnly=true"
                .parse()
                .unwrap();
        assert_eq!(conn.filename, "app.db");
        assert_eq!(conn.connection, ConnectionMode::Shared);
        assert_eq!(conn.password.as_deref(), Some("hunter2"));
        assert_eq!(conn.initial_size, 8192);
        assert!(conn.read_only);
    }

    #[test]
    fn collation_compare_modes() {
        let ord = Collation::ordinal();
        let ci = Collation::parse("en-US/IgnoreCase").unwrap();
        assert_ne!(ord.compare("Foo", "foo"), Ordering::Equal);
        assert_eq!(ci.compare("Foo", "foo"), Ordering::Equal);
        assert_eq!(ci.to_string(), "en-US/IgnoreCase");
    }

    #[test]
    fn companion_paths() {
        let settings = EngineSettings {
            filename: "dir/app.db".to_string(),
            ..Default::default()
        };
        assert_eq!(settings.log_path(), PathBuf::from("dir/app-log.db"));
        assert_eq!(settings.temp_path(), PathBuf::from("dir/app-tmp.db"));
        assert_eq!(settings.backup_path(), PathBuf::from("dir/app-backup.db"));
    }

    #[test]
    fn pragma_surface() {
        use crate::bson::Value;
        let pragmas = Pragmas::new(Collation::default());
        pragmas.set("TIMEOUT", &Value::Int32(5)).unwrap();
        assert_eq!(pragmas.get("timeout").unwrap(), Value::Int32(5));
        assert!(pragmas.set("COLLATION", &Value::from("x")).is_err());
        assert!(pragmas.get("NOPE").is_err());
    }
}
