#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_task_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS task_records (
    task_id INTEGER PRIMARY KEY,
    execution_class TEXT NOT NULL,
    priority TEXT NOT NULL,
    status TEXT NOT NULL,
    wait_reason TEXT,
    assigned_to TEXT,
    retries INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    case_id TEXT,
    investigation_id TEXT,
    created_at_ms INTEGER NOT NULL,
    started_at_ms INTEGER,
    completed_at_ms INTEGER,
    result_json TEXT,
    error TEXT,
    updated_at_unix INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_records_created
    ON task_records (created_at_ms DESC, task_id DESC);

CREATE INDEX IF NOT EXISTS idx_task_records_case
    ON task_records (case_id);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_task_records_case;
DROP INDEX IF EXISTS idx_task_records_created;
DROP TABLE IF EXISTS task_records;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_agent_enrollments",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS agent_enrollments (
    agent_identity TEXT PRIMARY KEY,
    execution_class TEXT NOT NULL,
    token_hash TEXT NOT NULL UNIQUE,
    label TEXT,
    enrolled_at_ms INTEGER NOT NULL
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS agent_enrollments;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
