//! Lifecycle registry: the durable owner of every VM record.
//!
//! The registry is the single arbiter of uniqueness. `id`, `port`,
//! `vm_iface` and `socket_path` carry `UNIQUE` constraints, so two
//! allocators racing on the same scanned value are resolved by the insert,
//! never by the scan.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use firefleet_core::{
    OwnerId, StorageSize, VmId, VmNetwork, VmPaths, VmRecord, VmResources, VmState,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};

use crate::EngineError;

/// Largest values ever issued per sequence, live or since deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Maxima {
    pub id: Option<i64>,
    pub port: Option<i64>,
    pub tap_index: Option<i64>,
}

/// Storage contract for VM records.
///
/// Implementations must make `insert` and `update_state` atomic per record.
pub trait VmRegistry: Send + Sync {
    /// Highest id, port and tap index ever issued.
    ///
    /// # Errors
    /// Returns [`EngineError::Registry`] on store failure.
    fn maxima(&self) -> Result<Maxima, EngineError>;

    /// Insert a new record. `tap_index` is the numeric sequence behind
    /// `record.network.vm_iface`.
    ///
    /// # Errors
    /// Returns [`EngineError::DuplicateKey`] if the id, port, tap or socket
    /// path is already taken.
    fn insert(&self, record: &VmRecord, tap_index: u32) -> Result<(), EngineError>;

    /// Move a record to `next` if it is currently in one of `expected` and
    /// the lifecycle permits the step. Returns the updated record.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] or [`EngineError::InvalidTransition`].
    fn update_state(
        &self,
        id: VmId,
        expected: &[VmState],
        next: VmState,
    ) -> Result<VmRecord, EngineError>;

    /// Remove a record. Returns `true` if it existed.
    ///
    /// # Errors
    /// Returns [`EngineError::Registry`] on store failure.
    fn delete(&self, id: VmId) -> Result<bool, EngineError>;

    /// Fetch one record.
    ///
    /// # Errors
    /// Returns [`EngineError::Registry`] on store failure.
    fn get(&self, id: VmId) -> Result<Option<VmRecord>, EngineError>;

    /// All records, or only those of `owner`.
    ///
    /// # Errors
    /// Returns [`EngineError::Registry`] on store failure.
    fn list(&self, owner: Option<OwnerId>) -> Result<Vec<VmRecord>, EngineError>;
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS vms (
    id           INTEGER PRIMARY KEY,
    identifier   INTEGER NOT NULL,
    user_id      INTEGER NOT NULL,
    kernel_image TEXT    NOT NULL,
    rootfs_image TEXT    NOT NULL,
    cpu          INTEGER NOT NULL,
    ram          INTEGER NOT NULL,
    storage      TEXT    NOT NULL,
    socket_path  TEXT    NOT NULL UNIQUE,
    port         INTEGER NOT NULL UNIQUE,
    ip_addr      TEXT    NOT NULL,
    hostname     TEXT    NOT NULL,
    gateway      TEXT    NOT NULL,
    vm_iface     TEXT    NOT NULL UNIQUE,
    tap_index    INTEGER NOT NULL UNIQUE,
    vm_dir       TEXT    NOT NULL,
    config_path  TEXT    NOT NULL,
    state        TEXT    NOT NULL,
    created_at   TEXT    NOT NULL,
    updated_at   TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS vms_user_id ON vms (user_id);
CREATE TABLE IF NOT EXISTS high_water (
    sequence TEXT PRIMARY KEY,
    value    INTEGER NOT NULL
);
";

const SELECT_COLUMNS: &str = "id, identifier, user_id, kernel_image, rootfs_image, cpu, ram, \
     storage, socket_path, port, ip_addr, hostname, gateway, vm_iface, vm_dir, config_path, \
     state, created_at, updated_at";

/// SQLite-backed [`VmRegistry`].
#[derive(Debug)]
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRegistry {
    /// Open (or create) a registry database at `path`, in WAL mode.
    ///
    /// # Errors
    /// Returns [`EngineError::Workspace`] if the parent directory cannot be
    /// created, or [`EngineError::Registry`] if the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::workspace(parent, e))?;
        }

        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(path = %path.display(), %mode, "registry not in WAL mode");
        }
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// Open a private in-memory registry.
    ///
    /// # Errors
    /// Returns [`EngineError::Registry`] if SQLite cannot allocate it.
    pub fn in_memory() -> Result<Self, EngineError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, EngineError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement leaves nothing half-applied: every write runs
        // in its own transaction.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn fetch(conn: &Connection, id: VmId) -> Result<Option<VmRecord>, EngineError> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM vms WHERE id = ?1");
    let raw = conn
        .query_row(&sql, params![id.get()], RawRow::read)
        .optional()?;
    raw.map(RawRow::into_record).transpose()
}

fn map_insert_error(err: rusqlite::Error) -> EngineError {
    match err {
        rusqlite::Error::SqliteFailure(code, message)
            if code.code == ErrorCode::ConstraintViolation =>
        {
            EngineError::DuplicateKey(message.unwrap_or_else(|| code.to_string()))
        }
        other => EngineError::Registry(other),
    }
}

impl VmRegistry for SqliteRegistry {
    fn maxima(&self) -> Result<Maxima, EngineError> {
        let conn = self.conn();
        let (id, port, tap_index): (Option<i64>, Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MAX(id), MAX(port), MAX(tap_index) FROM vms",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let mut maxima = Maxima { id, port, tap_index };
        let mut stmt = conn.prepare("SELECT sequence, value FROM high_water")?;
        let marks = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for mark in marks {
            let (sequence, value) = mark?;
            let slot = match sequence.as_str() {
                "id" => &mut maxima.id,
                "port" => &mut maxima.port,
                "tap" => &mut maxima.tap_index,
                _ => continue,
            };
            *slot = Some(slot.map_or(value, |live| live.max(value)));
        }
        Ok(maxima)
    }

    fn insert(&self, record: &VmRecord, tap_index: u32) -> Result<(), EngineError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO vms (id, identifier, user_id, kernel_image, rootfs_image, cpu, ram, \
             storage, socket_path, port, ip_addr, hostname, gateway, vm_iface, tap_index, \
             vm_dir, config_path, state, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
             ?17, ?18, ?19, ?20)",
            params![
                record.id.get(),
                record.identifier,
                record.owner_id.get(),
                path_text(&record.paths.kernel_image),
                path_text(&record.paths.rootfs_image),
                record.resources.cpu,
                record.resources.ram_mib,
                record.resources.storage.as_str(),
                path_text(&record.paths.socket_path),
                record.network.port,
                record.network.ip_addr,
                record.network.hostname,
                record.network.gateway,
                record.network.vm_iface,
                tap_index,
                path_text(&record.paths.vm_dir),
                path_text(&record.paths.config_path),
                record.state.as_str(),
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )
        .map_err(map_insert_error)?;

        for (sequence, value) in [
            ("id", record.id.get()),
            ("port", i64::from(record.network.port)),
            ("tap", i64::from(tap_index)),
        ] {
            tx.execute(
                "INSERT INTO high_water (sequence, value) VALUES (?1, ?2) \
                 ON CONFLICT (sequence) DO UPDATE SET value = MAX(value, excluded.value)",
                params![sequence, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn update_state(
        &self,
        id: VmId,
        expected: &[VmState],
        next: VmState,
    ) -> Result<VmRecord, EngineError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<String> = tx
            .query_row("SELECT state FROM vms WHERE id = ?1", params![id.get()], |row| {
                row.get(0)
            })
            .optional()?;
        let current = match current {
            Some(text) => parse_state(id.get(), &text)?,
            None => return Err(EngineError::NotFound(id)),
        };
        if !expected.contains(&current) || !current.can_transition_to(next) {
            return Err(EngineError::InvalidTransition { vm_id: id, from: current, to: next });
        }

        tx.execute(
            "UPDATE vms SET state = ?1, updated_at = ?2 WHERE id = ?3",
            params![next.as_str(), Utc::now().to_rfc3339(), id.get()],
        )?;
        let record = fetch(&tx, id)?.ok_or(EngineError::NotFound(id))?;
        tx.commit()?;
        Ok(record)
    }

    fn delete(&self, id: VmId) -> Result<bool, EngineError> {
        let removed = self
            .conn()
            .execute("DELETE FROM vms WHERE id = ?1", params![id.get()])?;
        Ok(removed > 0)
    }

    fn get(&self, id: VmId) -> Result<Option<VmRecord>, EngineError> {
        fetch(&self.conn(), id)
    }

    fn list(&self, owner: Option<OwnerId>) -> Result<Vec<VmRecord>, EngineError> {
        let conn = self.conn();
        let rows = match owner {
            Some(owner) => {
                let sql = format!("SELECT {SELECT_COLUMNS} FROM vms WHERE user_id = ?1 ORDER BY id");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![owner.get()], RawRow::read)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let sql = format!("SELECT {SELECT_COLUMNS} FROM vms ORDER BY id");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], RawRow::read)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        rows.into_iter().map(RawRow::into_record).collect()
    }
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn parse_state(id: i64, text: &str) -> Result<VmState, EngineError> {
    text.parse()
        .map_err(|e: firefleet_core::CoreError| EngineError::CorruptRecord { id, reason: e.to_string() })
}

/// Column values as stored, before domain validation.
struct RawRow {
    id: i64,
    identifier: i64,
    user_id: i64,
    kernel_image: String,
    rootfs_image: String,
    cpu: i64,
    ram: i64,
    storage: String,
    socket_path: String,
    port: i64,
    ip_addr: String,
    hostname: String,
    gateway: String,
    vm_iface: String,
    vm_dir: String,
    config_path: String,
    state: String,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            identifier: row.get(1)?,
            user_id: row.get(2)?,
            kernel_image: row.get(3)?,
            rootfs_image: row.get(4)?,
            cpu: row.get(5)?,
            ram: row.get(6)?,
            storage: row.get(7)?,
            socket_path: row.get(8)?,
            port: row.get(9)?,
            ip_addr: row.get(10)?,
            hostname: row.get(11)?,
            gateway: row.get(12)?,
            vm_iface: row.get(13)?,
            vm_dir: row.get(14)?,
            config_path: row.get(15)?,
            state: row.get(16)?,
            created_at: row.get(17)?,
            updated_at: row.get(18)?,
        })
    }

    fn into_record(self) -> Result<VmRecord, EngineError> {
        let id = self.id;
        let corrupt = |reason: String| EngineError::CorruptRecord { id, reason };
        let timestamp = |text: &str| {
            DateTime::parse_from_rfc3339(text)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("timestamp '{text}': {e}")))
        };

        Ok(VmRecord {
            id: VmId::new(id),
            owner_id: OwnerId::new(self.user_id),
            identifier: self.identifier,
            resources: VmResources {
                cpu: u32::try_from(self.cpu).map_err(|e| corrupt(format!("cpu: {e}")))?,
                ram_mib: u32::try_from(self.ram).map_err(|e| corrupt(format!("ram: {e}")))?,
                storage: StorageSize::parse(&self.storage).map_err(|e| corrupt(e.to_string()))?,
            },
            network: VmNetwork {
                ip_addr: self.ip_addr,
                hostname: self.hostname,
                gateway: self.gateway,
                vm_iface: self.vm_iface,
                port: u16::try_from(self.port).map_err(|e| corrupt(format!("port: {e}")))?,
            },
            paths: VmPaths {
                kernel_image: PathBuf::from(self.kernel_image),
                rootfs_image: PathBuf::from(self.rootfs_image),
                vm_dir: PathBuf::from(self.vm_dir),
                config_path: PathBuf::from(self.config_path),
                socket_path: PathBuf::from(self.socket_path),
            },
            state: parse_state(id, &self.state)?,
            created_at: timestamp(&self.created_at)?,
            updated_at: timestamp(&self.updated_at)?,
        })
    }
}
