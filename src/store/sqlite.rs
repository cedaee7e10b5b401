//! SQLite-backed fleet store
//!
//! Every `fleetd` process opens the same database file, so commands queued
//! by `fleetd submit` or status changes made by `fleetd set-status` are seen
//! by a running daemon on its next sweep. Claims and terminal writes are
//! single conditional statements or immediate transactions, which keeps them
//! atomic across processes as well as across tasks.

use super::{CommandUpdate, DeviceUpdate, FleetStore, PendingBatch, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use fleet_shared::capability::Capabilities;
use fleet_shared::state_machine::is_valid_transition;
use fleet_shared::{Command, CommandStatus, Device, DeviceClass, DeviceStatus};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// How long a writer waits for another process to release the database
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type DbPool = Pool<SqliteConnectionManager>;
type DbConn = PooledConnection<SqliteConnectionManager>;

const DEVICE_COLUMNS: &str =
    "id, name, class, ip_address, overlay_ip, status, capabilities, ssh_username, updated_at";

const COMMAND_COLUMNS: &str = "id, device_id, command, arguments, status, output, error, \
     exit_code, created_at, executed_at, updated_at";

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Everything in the store, for listing
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub devices: Vec<Device>,
    pub commands: Vec<Command>,
}

pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("creating {}: {}", parent.display(), e))
            })?;
        }
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")
        });
        let pool = Pool::builder().max_size(4).build(manager)?;
        let store = Self { pool };
        store.migrate()?;
        info!(
            "[STORE] opened {} (schema v{})",
            path.display(),
            SCHEMA_VERSION
        );
        Ok(store)
    }

    /// Private in-memory database
    ///
    /// A single pooled connection, since each SQLite memory connection is its
    /// own database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder().max_size(1).build(manager)?;
        let store = Self { pool };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<DbConn, StoreError> {
        Ok(self.pool.get()?)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version < 1 {
            migrate_v1(&conn)?;
        }
        Ok(())
    }

    /// Insert or replace a device record
    pub async fn upsert_device(&self, device: Device) -> Result<(), StoreError> {
        let capabilities = encode_capabilities(&device.capabilities)?;
        self.conn()?.execute(
            "INSERT INTO devices (id, name, class, ip_address, overlay_ip, status, \
                 capabilities, ssh_username, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 class = excluded.class,
                 ip_address = excluded.ip_address,
                 overlay_ip = excluded.overlay_ip,
                 status = excluded.status,
                 capabilities = excluded.capabilities,
                 ssh_username = excluded.ssh_username,
                 updated_at = excluded.updated_at",
            params![
                device.id,
                device.name,
                device.class.as_str(),
                device.ip_address,
                device.overlay_ip,
                device.status.to_string(),
                capabilities,
                device.ssh_username,
                timestamp(device.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Persist a new command as submitted by intake
    pub async fn insert_command(&self, command: Command) -> Result<(), StoreError> {
        let conn = self.conn()?;
        if load_device(&conn, &command.device_id)?.is_none() {
            return Err(StoreError::DeviceNotFound(command.device_id));
        }
        conn.execute(
            "INSERT INTO commands (id, device_id, command, arguments, status, output, error, \
                 exit_code, created_at, executed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                command.id,
                command.device_id,
                command.command,
                command.arguments,
                command.status.as_str(),
                command.output,
                command.error,
                command.exit_code,
                timestamp(command.created_at),
                command.executed_at.map(timestamp),
                timestamp(command.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Devices sorted by id, commands by creation time
    pub async fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM devices ORDER BY id", DEVICE_COLUMNS))?;
        let devices = stmt
            .query_map([], row_to_device)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM commands ORDER BY created_at, id",
            COMMAND_COLUMNS
        ))?;
        let commands = stmt
            .query_map([], row_to_command)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Snapshot { devices, commands })
    }
}

#[async_trait]
impl FleetStore for SqliteStore {
    async fn find_device(&self, id: &str) -> Result<Option<Device>, StoreError> {
        load_device(&*self.conn()?, id)
    }

    async fn find_command(&self, id: &str) -> Result<Option<Command>, StoreError> {
        load_command(&*self.conn()?, id)
    }

    async fn find_devices_with_pending_commands(
        &self,
        status: DeviceStatus,
    ) -> Result<Vec<PendingBatch>, StoreError> {
        let conn = self.conn()?;
        let columns = COMMAND_COLUMNS
            .split(", ")
            .map(|c| format!("c.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM commands c JOIN devices d ON d.id = c.device_id
             WHERE c.status = 'PENDING' AND d.status = ?1
             ORDER BY c.created_at, c.id",
            columns
        ))?;
        let pending = stmt
            .query_map(params![status.to_string()], row_to_command)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        // First appearance of a device is its oldest pending command
        let mut batches: Vec<PendingBatch> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for command in pending {
            if let Some(&i) = index.get(&command.device_id) {
                batches[i].commands.push(command);
                continue;
            }
            let Some(device) = load_device(&conn, &command.device_id)? else {
                continue;
            };
            index.insert(command.device_id.clone(), batches.len());
            batches.push(PendingBatch {
                device,
                commands: vec![command],
            });
        }
        Ok(batches)
    }

    async fn claim_command(
        &self,
        id: &str,
        executed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let at = timestamp(executed_at);
        let changed = conn.execute(
            "UPDATE commands SET status = 'RUNNING', executed_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status = 'PENDING'",
            params![id, at],
        )?;
        if changed == 0 && load_command(&conn, id)?.is_none() {
            return Err(StoreError::CommandNotFound(id.to_string()));
        }
        Ok(changed == 1)
    }

    async fn fail_pending(&self, id: &str, update: CommandUpdate) -> Result<bool, StoreError> {
        if update.status != CommandStatus::Failed {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: CommandStatus::Pending,
                to: update.status,
            });
        }
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE commands SET status = 'FAILED', output = ?2, error = ?3, exit_code = ?4,
                 updated_at = ?5
             WHERE id = ?1 AND status = 'PENDING'",
            params![
                id,
                update.output,
                update.error,
                update.exit_code,
                timestamp(update.updated_at),
            ],
        )?;
        if changed == 0 && load_command(&conn, id)?.is_none() {
            return Err(StoreError::CommandNotFound(id.to_string()));
        }
        Ok(changed == 1)
    }

    async fn update_command(
        &self,
        id: &str,
        update: CommandUpdate,
    ) -> Result<Command, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut command =
            load_command(&tx, id)?.ok_or_else(|| StoreError::CommandNotFound(id.to_string()))?;

        if !is_valid_transition(command.status, update.status) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: command.status,
                to: update.status,
            });
        }

        command.status = update.status;
        command.output = update.output;
        command.error = update.error;
        command.exit_code = update.exit_code;
        if let Some(at) = update.executed_at {
            command.executed_at = Some(at);
        }
        command.updated_at = update.updated_at;

        tx.execute(
            "UPDATE commands SET status = ?2, output = ?3, error = ?4, exit_code = ?5,
                 executed_at = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                id,
                command.status.as_str(),
                command.output,
                command.error,
                command.exit_code,
                command.executed_at.map(timestamp),
                timestamp(command.updated_at),
            ],
        )?;
        tx.commit()?;
        Ok(command)
    }

    async fn update_device(&self, id: &str, update: DeviceUpdate) -> Result<Device, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut device =
            load_device(&tx, id)?.ok_or_else(|| StoreError::DeviceNotFound(id.to_string()))?;

        if let Some(status) = update.status {
            device.status = status;
        }
        if let Some(capabilities) = update.capabilities {
            device.capabilities = capabilities;
        }
        device.updated_at = fleet_shared::now();

        tx.execute(
            "UPDATE devices SET status = ?2, capabilities = ?3, updated_at = ?4 WHERE id = ?1",
            params![
                id,
                device.status.to_string(),
                encode_capabilities(&device.capabilities)?,
                timestamp(device.updated_at),
            ],
        )?;
        tx.commit()?;
        debug!("[STORE] {} now {}", id, device.status);
        Ok(device)
    }
}

fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS devices (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            class TEXT NOT NULL,
            ip_address TEXT,
            overlay_ip TEXT,
            status TEXT NOT NULL,
            capabilities TEXT NOT NULL,
            ssh_username TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS commands (
            id TEXT PRIMARY KEY,
            device_id TEXT NOT NULL REFERENCES devices(id),
            command TEXT NOT NULL,
            arguments TEXT,
            status TEXT NOT NULL,
            output TEXT,
            error TEXT,
            exit_code INTEGER,
            created_at TEXT NOT NULL,
            executed_at TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_commands_pending
            ON commands(status, created_at);

        PRAGMA user_version = 1;
        ",
    )?;
    Ok(())
}

fn load_device(conn: &Connection, id: &str) -> Result<Option<Device>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM devices WHERE id = ?1", DEVICE_COLUMNS),
            params![id],
            row_to_device,
        )
        .optional()?)
}

fn load_command(conn: &Connection, id: &str) -> Result<Option<Command>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM commands WHERE id = ?1", COMMAND_COLUMNS),
            params![id],
            row_to_command,
        )
        .optional()?)
}

/// Fixed-width RFC 3339, so text order is time order
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_error(
    idx: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn encode_capabilities(capabilities: &Capabilities) -> Result<String, StoreError> {
    serde_json::to_string(capabilities)
        .map_err(|e| StoreError::Unavailable(format!("encoding capabilities: {}", e)))
}

fn row_to_device(row: &Row<'_>) -> rusqlite::Result<Device> {
    let class: String = row.get(2)?;
    let status: String = row.get(5)?;
    let capabilities: String = row.get(6)?;
    let updated_at: String = row.get(8)?;
    Ok(Device {
        id: row.get(0)?,
        name: row.get(1)?,
        class: class.parse::<DeviceClass>().unwrap_or_default(),
        ip_address: row.get(3)?,
        overlay_ip: row.get(4)?,
        status: status.parse().map_err(|e: String| conversion_error(5, e))?,
        capabilities: serde_json::from_str(&capabilities).map_err(|e| conversion_error(6, e))?,
        ssh_username: row.get(7)?,
        updated_at: parse_timestamp(8, &updated_at)?,
    })
}

fn row_to_command(row: &Row<'_>) -> rusqlite::Result<Command> {
    let status: String = row.get(4)?;
    let created_at: String = row.get(8)?;
    let executed_at: Option<String> = row.get(9)?;
    let updated_at: String = row.get(10)?;
    Ok(Command {
        id: row.get(0)?,
        device_id: row.get(1)?,
        command: row.get(2)?,
        arguments: row.get(3)?,
        status: status.parse().map_err(|e: String| conversion_error(4, e))?,
        output: row.get(5)?,
        error: row.get(6)?,
        exit_code: row.get(7)?,
        created_at: parse_timestamp(8, &created_at)?,
        executed_at: executed_at
            .as_deref()
            .map(|raw| parse_timestamp(9, raw))
            .transpose()?,
        updated_at: parse_timestamp(10, &updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use fleet_shared::capability::Capabilities;
    use fleet_shared::Protocol;
    use std::sync::Arc;

    fn device(id: &str, status: DeviceStatus) -> Device {
        let mut device = Device::new(id, id, DeviceClass::RaspberryPi);
        device.status = status;
        device
    }

    fn command_at(id: &str, device_id: &str, offset_secs: i64) -> Command {
        let mut command = Command::new(id, device_id, "status", None);
        command.created_at = command.created_at + ChronoDuration::seconds(offset_secs);
        command
    }

    fn failed(error: &str) -> CommandUpdate {
        CommandUpdate {
            status: CommandStatus::Failed,
            output: None,
            error: Some(error.to_string()),
            exit_code: None,
            executed_at: None,
            updated_at: fleet_shared::now(),
        }
    }

    async fn seed(store: &SqliteStore) {
        store.upsert_device(device("a", DeviceStatus::Online)).await.unwrap();
        store.upsert_device(device("b", DeviceStatus::Online)).await.unwrap();
        store.upsert_device(device("c", DeviceStatus::Offline)).await.unwrap();
        store.insert_command(command_at("a-2", "a", 20)).await.unwrap();
        store.insert_command(command_at("a-1", "a", 10)).await.unwrap();
        store.insert_command(command_at("b-1", "b", 5)).await.unwrap();
        store.insert_command(command_at("c-1", "c", 0)).await.unwrap();
    }

    async fn seeded() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        seed(&store).await;
        store
    }

    #[tokio::test]
    async fn test_pending_batches_oldest_first() {
        let store = seeded().await;
        let batches = store
            .find_devices_with_pending_commands(DeviceStatus::Online)
            .await
            .unwrap();

        let ids: Vec<_> = batches.iter().map(|b| b.device.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        let a: Vec<_> = batches[1].commands.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(a, vec!["a-1", "a-2"]);
    }

    #[tokio::test]
    async fn test_pending_batches_filter_by_status() {
        let store = seeded().await;
        let offline = store
            .find_devices_with_pending_commands(DeviceStatus::Offline)
            .await
            .unwrap();
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0].device.id, "c");
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = Arc::new(seeded().await);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_command("a-1", fleet_shared::now()).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let command = store.find_command("a-1").await.unwrap().unwrap();
        assert_eq!(command.status, CommandStatus::Running);
        assert!(command.executed_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_commands_are_write_once() {
        let store = seeded().await;
        store.claim_command("b-1", fleet_shared::now()).await.unwrap();
        store.update_command("b-1", failed("boom")).await.unwrap();

        let err = store
            .update_command("b-1", failed("again"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert!(!store.claim_command("b-1", fleet_shared::now()).await.unwrap());

        let command = store.find_command("b-1").await.unwrap().unwrap();
        assert_eq!(command.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_pending_cannot_jump_to_completed() {
        let store = seeded().await;
        let mut update = failed("x");
        update.status = CommandStatus::Completed;
        assert!(store.update_command("a-1", update).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_pending_leaves_running_commands_alone() {
        let store = seeded().await;
        assert!(store.claim_command("a-1", fleet_shared::now()).await.unwrap());

        assert!(!store.fail_pending("a-1", failed("unroutable")).await.unwrap());
        let running = store.find_command("a-1").await.unwrap().unwrap();
        assert_eq!(running.status, CommandStatus::Running);
        assert!(running.error.is_none());

        assert!(store.fail_pending("a-2", failed("unroutable")).await.unwrap());
        let failed_cmd = store.find_command("a-2").await.unwrap().unwrap();
        assert_eq!(failed_cmd.status, CommandStatus::Failed);
        assert_eq!(failed_cmd.error.as_deref(), Some("unroutable"));
        assert!(failed_cmd.executed_at.is_none());
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.find_device("nope").await.unwrap().is_none());
        assert_eq!(
            store.claim_command("nope", fleet_shared::now()).await,
            Err(StoreError::CommandNotFound("nope".into()))
        );
        assert_eq!(
            store.fail_pending("nope", failed("x")).await,
            Err(StoreError::CommandNotFound("nope".into()))
        );
        assert!(store
            .insert_command(Command::new("c", "nope", "status", None))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_device_round_trips_with_capabilities() {
        let store = seeded().await;
        let mut pi = device("pi", DeviceStatus::Online);
        pi.overlay_ip = Some("100.64.0.7".into());
        pi.ssh_username = Some("ops".into());
        pi.capabilities = Capabilities::new()
            .with_protocol(Protocol::Ssh)
            .with_commands(["status", "df"]);
        store.upsert_device(pi.clone()).await.unwrap();

        let loaded = store.find_device("pi").await.unwrap().unwrap();
        assert_eq!(loaded, pi);
    }

    #[tokio::test]
    async fn test_separate_handles_share_one_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("fleet.db");

        // A long-running sweeper and a short-lived CLI invocation
        let daemon = SqliteStore::open(&path).unwrap();
        daemon
            .upsert_device(device("pi", DeviceStatus::Offline))
            .await
            .unwrap();
        assert!(daemon
            .find_devices_with_pending_commands(DeviceStatus::Online)
            .await
            .unwrap()
            .is_empty());

        let cli = SqliteStore::open(&path).unwrap();
        cli.insert_command(command_at("c1", "pi", 0)).await.unwrap();
        cli.update_device("pi", DeviceUpdate::status(DeviceStatus::Online))
            .await
            .unwrap();
        drop(cli);

        let batches = daemon
            .find_devices_with_pending_commands(DeviceStatus::Online)
            .await
            .unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].commands[0].id, "c1");

        // Daemon writes never clobber rows it did not touch
        daemon.claim_command("c1", fleet_shared::now()).await.unwrap();
        let reopened = SqliteStore::open(&path).unwrap();
        let snapshot = reopened.snapshot().await.unwrap();
        assert_eq!(snapshot.devices.len(), 1);
        assert_eq!(snapshot.commands.len(), 1);
        assert_eq!(snapshot.commands[0].status, CommandStatus::Running);
    }

    #[test]
    fn test_timestamps_sort_as_text() {
        let early = Utc::now();
        let late = early + ChronoDuration::nanoseconds(1);
        assert!(timestamp(early) < timestamp(late));
        assert_eq!(parse_timestamp(0, &timestamp(early)).unwrap(), early);
    }
}
