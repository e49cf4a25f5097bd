//! Table definitions for the SQL backend.
//!
//! DDL uses portable types; [`Dialect::ddl`](super::Dialect::ddl) maps
//! `MEDIUMTEXT` where needed. Timestamps are Unix nanoseconds in `BIGINT`
//! columns and flags are `0`/`1` integers.

/// Schema version written by [`SqlStore::ensure_schema`](super::SqlStore::ensure_schema).
pub const SCHEMA_VERSION: u32 = 1;

/// Configuration row holding the encryption key label.
pub const ENCRYPTION_KEY_LABEL_ID: &str = "encryption_key_label";

/// Configuration row holding the schema version.
pub const SCHEMA_VERSION_ID: &str = "schema_version";

/// Created before everything else so the version can be recorded.
pub const CREATE_CONFIGURATIONS: &str = "
CREATE TABLE IF NOT EXISTS configurations (
    id VARCHAR(255) NOT NULL PRIMARY KEY,
    value VARCHAR(255) NOT NULL
)";

/// Remaining tables, in creation order.
pub const CREATE_TABLES: &[&str] = &[
    "
CREATE TABLE IF NOT EXISTS domains (
    domain VARCHAR(255) NOT NULL PRIMARY KEY,
    expire_time BIGINT NOT NULL DEFAULT 0
)",
    "
CREATE TABLE IF NOT EXISTS desired_lrps (
    process_guid VARCHAR(255) NOT NULL PRIMARY KEY,
    domain VARCHAR(255) NOT NULL,
    log_guid VARCHAR(255) NOT NULL,
    annotation MEDIUMTEXT NOT NULL,
    instances BIGINT NOT NULL,
    memory_mb BIGINT NOT NULL,
    disk_mb BIGINT NOT NULL,
    max_pids BIGINT NOT NULL DEFAULT 0,
    rootfs VARCHAR(255) NOT NULL,
    routes MEDIUMTEXT NOT NULL,
    volume_placement MEDIUMTEXT NOT NULL,
    placement_tags MEDIUMTEXT NOT NULL,
    modification_tag_epoch VARCHAR(255) NOT NULL,
    modification_tag_index BIGINT NOT NULL,
    run_info MEDIUMTEXT NOT NULL
)",
    "
CREATE TABLE IF NOT EXISTS actual_lrps (
    process_guid VARCHAR(255) NOT NULL,
    instance_index BIGINT NOT NULL,
    evacuating BIGINT NOT NULL DEFAULT 0,
    domain VARCHAR(255) NOT NULL,
    state VARCHAR(255) NOT NULL,
    instance_guid VARCHAR(255) NOT NULL DEFAULT '',
    cell_id VARCHAR(255) NOT NULL DEFAULT '',
    placement_error VARCHAR(255) NOT NULL DEFAULT '',
    since BIGINT NOT NULL DEFAULT 0,
    net_info MEDIUMTEXT NOT NULL,
    modification_tag_epoch VARCHAR(255) NOT NULL,
    modification_tag_index BIGINT NOT NULL,
    crash_count BIGINT NOT NULL DEFAULT 0,
    crash_reason VARCHAR(1024) NOT NULL DEFAULT '',
    expire_time BIGINT NOT NULL DEFAULT 0,
    PRIMARY KEY (process_guid, instance_index, evacuating)
)",
    "
CREATE TABLE IF NOT EXISTS tasks (
    guid VARCHAR(255) NOT NULL PRIMARY KEY,
    domain VARCHAR(255) NOT NULL,
    updated_at BIGINT NOT NULL DEFAULT 0,
    created_at BIGINT NOT NULL DEFAULT 0,
    first_completed_at BIGINT NOT NULL DEFAULT 0,
    state VARCHAR(255) NOT NULL,
    cell_id VARCHAR(255) NOT NULL DEFAULT '',
    result MEDIUMTEXT NOT NULL,
    failed BIGINT NOT NULL DEFAULT 0,
    failure_reason VARCHAR(1024) NOT NULL DEFAULT '',
    task_definition MEDIUMTEXT NOT NULL
)",
    "
CREATE TABLE IF NOT EXISTS locks (
    lock_key VARCHAR(255) NOT NULL PRIMARY KEY,
    owner VARCHAR(255) NOT NULL,
    token VARCHAR(255) NOT NULL,
    expires_at BIGINT NOT NULL
)",
];

/// Secondary indexes as `(name, table, columns)`.
pub const INDEXES: &[(&str, &str, &str)] = &[
    ("desired_lrps_domain_idx", "desired_lrps", "domain"),
    ("actual_lrps_domain_idx", "actual_lrps", "domain"),
    ("actual_lrps_cell_id_idx", "actual_lrps", "cell_id"),
    ("actual_lrps_state_idx", "actual_lrps", "state"),
    ("tasks_domain_idx", "tasks", "domain"),
    ("tasks_state_idx", "tasks", "state"),
    ("tasks_cell_id_idx", "tasks", "cell_id"),
];

/// Storage class of a key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Text column.
    Text,
    /// Integer column.
    Integer,
}

/// Blob columns rotated by re-encryption, per table, with the table's key
/// columns.
#[derive(Debug)]
pub struct EncryptedTable {
    /// Table name.
    pub table: &'static str,
    /// Primary key columns.
    pub key_columns: &'static [(&'static str, ColumnType)],
    /// Encrypted blob columns.
    pub blob_columns: &'static [&'static str],
}

/// Every table with encrypted columns.
pub const ENCRYPTED_TABLES: &[EncryptedTable] = &[
    EncryptedTable {
        table: "desired_lrps",
        key_columns: &[("process_guid", ColumnType::Text)],
        blob_columns: &["run_info", "volume_placement", "routes"],
    },
    EncryptedTable {
        table: "actual_lrps",
        key_columns: &[
            ("process_guid", ColumnType::Text),
            ("instance_index", ColumnType::Integer),
            ("evacuating", ColumnType::Integer),
        ],
        blob_columns: &["net_info"],
    },
    EncryptedTable {
        table: "tasks",
        key_columns: &[("guid", ColumnType::Text)],
        blob_columns: &["task_definition"],
    },
];
