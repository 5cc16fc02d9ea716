use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::agents::EnrollmentRecord;
use crate::models::{AgentIdentity, CoreError, CoreErrorKind, ExecutionTarget, TaskId, TaskSnapshot};
use crate::persistence::{EnrollmentStore, MigrationStore, PersistenceResult, TaskStore};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "warden_schema_migrations";

const TASK_COLUMNS: &str = "
task_id, execution_class, priority, status, wait_reason, assigned_to, retries, max_retries,
case_id, investigation_id, created_at_ms, started_at_ms, completed_at_ms, result_json, error
";

/// Opens a fresh connection per call; callers on the async side go through
/// `spawn_blocking`.
pub struct SqliteStore {
    database_path: PathBuf,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        if target_version > 0 && migration(target_version).is_none() {
            return Err(storage_error_text(
                "apply_migration",
                format!("migration version '{target_version}' is not defined"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // Recorded versions may outlive dropped tables; all DDL is
                // IF NOT EXISTS, so replaying it is harmless.
                for version in 1..=target_version {
                    execute_batch_tolerant(connection, defined(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl TaskStore for SqliteStore {
    fn upsert_task(&self, task: &TaskSnapshot) -> PersistenceResult<()> {
        self.with_connection("upsert_task", |connection| {
            ensure_schema_ready(connection)?;
            let assigned_to = task.assigned_to.as_ref().map(to_json).transpose()?;
            let result = task.result.as_ref().map(to_json).transpose()?;
            connection.execute(
                "
INSERT INTO task_records (
    task_id, execution_class, priority, status, wait_reason, assigned_to, retries, max_retries,
    case_id, investigation_id, created_at_ms, started_at_ms, completed_at_ms, result_json, error,
    updated_at_unix
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, strftime('%s', 'now'))
ON CONFLICT(task_id) DO UPDATE SET
    status = excluded.status,
    wait_reason = excluded.wait_reason,
    assigned_to = excluded.assigned_to,
    retries = excluded.retries,
    started_at_ms = excluded.started_at_ms,
    completed_at_ms = excluded.completed_at_ms,
    result_json = excluded.result_json,
    error = excluded.error,
    updated_at_unix = excluded.updated_at_unix
",
                params![
                    task_id_to_i64(task.id)?,
                    task.execution_class.as_str(),
                    task.priority.as_str(),
                    task.status.as_str(),
                    task.wait_reason.map(|reason| reason.as_str()),
                    assigned_to,
                    task.retries,
                    task.max_retries,
                    task.case_id.as_deref(),
                    task.investigation_id.as_deref(),
                    to_unix_millis(task.created_at)?,
                    task.started_at.map(to_unix_millis).transpose()?,
                    task.completed_at.map(to_unix_millis).transpose()?,
                    result,
                    task.error.as_deref(),
                ],
            )?;
            Ok(())
        })
    }

    fn get_task(&self, task_id: TaskId) -> PersistenceResult<Option<TaskSnapshot>> {
        self.with_connection("get_task", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM task_records WHERE task_id = ?1"),
                    params![task_id_to_i64(task_id)?],
                    read_task_row,
                )
                .optional()
        })
    }

    fn list_recent_tasks(&self, limit: usize) -> PersistenceResult<Vec<TaskSnapshot>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        self.with_connection("list_recent_tasks", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM task_records
                 ORDER BY created_at_ms DESC, task_id DESC
                 LIMIT ?1"
            ))?;
            let rows = statement.query_map(params![to_i64(limit)?], read_task_row)?;
            rows.collect()
        })
    }

    fn next_task_id(&self) -> PersistenceResult<u64> {
        self.with_connection("next_task_id", |connection| {
            ensure_schema_ready(connection)?;
            let max_id: Option<i64> =
                connection.query_row("SELECT MAX(task_id) FROM task_records", [], |row| {
                    row.get(0)
                })?;
            match max_id {
                Some(id) => Ok(i64_to_u64(id)?.saturating_add(1)),
                None => Ok(1),
            }
        })
    }
}

impl EnrollmentStore for SqliteStore {
    fn save_enrollment(&self, record: &EnrollmentRecord) -> PersistenceResult<()> {
        self.with_connection("save_enrollment", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO agent_enrollments (
    agent_identity, execution_class, token_hash, label, enrolled_at_ms
) VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(agent_identity) DO UPDATE SET
    execution_class = excluded.execution_class,
    token_hash = excluded.token_hash,
    label = excluded.label
",
                params![
                    record.agent_identity.as_str(),
                    record.execution_class.as_str(),
                    record.token_hash.as_str(),
                    record.label.as_deref(),
                    to_unix_millis(record.enrolled_at)?,
                ],
            )?;
            Ok(())
        })
    }

    fn find_enrollment(&self, token_hash: &str) -> PersistenceResult<Option<EnrollmentRecord>> {
        self.with_connection("find_enrollment", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    "
SELECT agent_identity, execution_class, token_hash, label, enrolled_at_ms
FROM agent_enrollments
WHERE token_hash = ?1
",
                    params![token_hash],
                    read_enrollment_row,
                )
                .optional()
        })
    }

    fn list_enrollments(&self) -> PersistenceResult<Vec<EnrollmentRecord>> {
        self.with_connection("list_enrollments", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT agent_identity, execution_class, token_hash, label, enrolled_at_ms
FROM agent_enrollments
ORDER BY enrolled_at_ms ASC
",
            )?;
            let rows = statement.query_map([], read_enrollment_row)?;
            rows.collect()
        })
    }
}

fn read_task_row(row: &Row<'_>) -> rusqlite::Result<TaskSnapshot> {
    let task_id_raw: i64 = row.get(0)?;
    let class_raw: String = row.get(1)?;
    let priority_raw: String = row.get(2)?;
    let status_raw: String = row.get(3)?;
    let wait_reason_raw: Option<String> = row.get(4)?;
    let assigned_to_raw: Option<String> = row.get(5)?;
    let started_at_ms: Option<i64> = row.get(11)?;
    let completed_at_ms: Option<i64> = row.get(12)?;
    let result_raw: Option<String> = row.get(13)?;

    Ok(TaskSnapshot {
        id: TaskId(i64_to_u64(task_id_raw)?),
        execution_class: parse_label(&class_raw, "execution class")?,
        priority: parse_label(&priority_raw, "priority")?,
        status: parse_label(&status_raw, "task status")?,
        wait_reason: wait_reason_raw
            .map(|raw| parse_label(&raw, "wait reason"))
            .transpose()?,
        assigned_to: assigned_to_raw
            .map(|raw| from_json::<ExecutionTarget>(&raw))
            .transpose()?,
        retries: row.get(6)?,
        max_retries: row.get(7)?,
        case_id: row.get(8)?,
        investigation_id: row.get(9)?,
        created_at: from_unix_millis(row.get(10)?)?,
        started_at: started_at_ms.map(from_unix_millis).transpose()?,
        completed_at: completed_at_ms.map(from_unix_millis).transpose()?,
        result: result_raw.map(|raw| from_json::<Value>(&raw)).transpose()?,
        error: row.get(14)?,
    })
}

fn read_enrollment_row(row: &Row<'_>) -> rusqlite::Result<EnrollmentRecord> {
    let identity_raw: String = row.get(0)?;
    let class_raw: String = row.get(1)?;
    Ok(EnrollmentRecord {
        agent_identity: AgentIdentity(identity_raw),
        execution_class: parse_label(&class_raw, "execution class")?,
        token_hash: row.get(2)?,
        label: row.get(3)?,
        enrolled_at: from_unix_millis(row.get(4)?)?,
    })
}

fn defined(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    Connection::open(database_path)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
"
    ))?;
    Ok(())
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
            "database schema is not initialized; apply migrations first",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    execute_batch_tolerant(&transaction, migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    tracing::info!(
        version = migration.version,
        name = migration.name,
        "applied sqlite migration"
    );
    Ok(())
}

/// Tolerates "duplicate column name" from replayed `ALTER TABLE ADD COLUMN`.
fn execute_batch_tolerant(connection: &Connection, sql: &str) -> rusqlite::Result<()> {
    match connection.execute_batch(sql) {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("duplicate column name") => Ok(()),
        Err(e) => Err(e),
    }
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

fn parse_label<T: DeserializeOwned>(raw: &str, what: &str) -> rusqlite::Result<T> {
    serde_json::from_value(Value::String(raw.to_string())).map_err(|_| {
        storage_error_sqlite(&format!("unknown {what} '{raw}' in sqlite record"))
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value)
        .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))
}

fn from_json<T: DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|error| {
        storage_error_sqlite(&format!("malformed json column in sqlite record: {error}"))
    })
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    storage_error_text(operation, error.to_string())
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn to_unix_millis(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    i64::try_from(duration.as_millis())
        .map_err(|_| storage_error_sqlite("unix timestamp millis exceed i64 range"))
}

fn from_unix_millis(value: i64) -> rusqlite::Result<SystemTime> {
    let millis = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("negative unix timestamps are not supported"))?;
    Ok(UNIX_EPOCH + Duration::from_millis(millis))
}

fn task_id_to_i64(value: TaskId) -> rusqlite::Result<i64> {
    i64::try_from(value.0).map_err(|_| storage_error_sqlite("task id exceeds i64 range"))
}

fn i64_to_u64(value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| storage_error_sqlite("negative task id in sqlite record"))
}

fn to_i64(value: usize) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}
