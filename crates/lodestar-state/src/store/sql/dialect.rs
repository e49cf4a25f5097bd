//! SQL dialect strategy.
//!
//! Queries are written once with `?` placeholders and portable types. The
//! [`Dialect`] rewrites them for the connected database and translates the
//! database's error codes into the Lodestar error taxonomy. Nothing outside
//! the SQL backend branches on the dialect.

use std::fmt;

use lodestar_core::Error;

/// How a natural-key upsert is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStrategy {
    /// `INSERT ... ON CONFLICT (...) DO UPDATE`.
    OnConflict,
    /// `INSERT ... ON DUPLICATE KEY UPDATE`.
    OnDuplicateKey,
    /// Table lock in `SHARE ROW EXCLUSIVE` mode, then a conditional
    /// update/insert CTE.
    LockAndMerge,
}

/// A supported SQL database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// SQLite.
    Sqlite,
    /// `PostgreSQL`.
    Postgres,
    /// `MySQL`.
    MySql,
}

impl Dialect {
    /// Picks the dialect from a connection URL scheme.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an unsupported scheme.
    pub fn from_url(url: &str) -> Result<Self, Error> {
        let scheme = url.split(':').next().unwrap_or_default();
        match scheme {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySql),
            // sqlx ships no SQL Server driver.
            "sqlserver" | "mssql" => Err(Error::configuration(
                "sqlserver databases are not supported",
            )),
            other => Err(Error::configuration(format!(
                "unsupported database scheme: {other}"
            ))),
        }
    }

    /// Returns the dialect name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
        }
    }

    /// Rewrites `?` placeholders for the dialect.
    ///
    /// Postgres uses numbered `$1..$n` placeholders; the others keep `?`.
    /// Queries must not contain literal question marks.
    #[must_use]
    pub fn rebind(&self, query: &str) -> String {
        match self {
            Self::Sqlite | Self::MySql => query.to_string(),
            Self::Postgres => {
                let mut out = String::with_capacity(query.len() + 16);
                let mut n = 0;
                for ch in query.chars() {
                    if ch == '?' {
                        n += 1;
                        out.push('$');
                        out.push_str(&n.to_string());
                    } else {
                        out.push(ch);
                    }
                }
                out
            }
        }
    }

    /// Rewrites portable DDL types for the dialect.
    #[must_use]
    pub fn ddl(&self, statement: &str) -> String {
        match self {
            Self::MySql => statement.to_string(),
            Self::Sqlite | Self::Postgres => statement.replace("MEDIUMTEXT", "TEXT"),
        }
    }

    /// Returns the row-lock suffix for a locking read.
    #[must_use]
    pub const fn for_update(&self) -> &'static str {
        match self {
            // SQLite serializes writers at the database level.
            Self::Sqlite => "",
            Self::Postgres | Self::MySql => " FOR UPDATE",
        }
    }

    /// Renders a count of rows matching `condition`.
    #[must_use]
    pub fn count_where(&self, condition: &str) -> String {
        match self {
            Self::Postgres => format!("COUNT(*) FILTER (WHERE {condition})"),
            Self::Sqlite | Self::MySql => format!("COUNT(CASE WHEN {condition} THEN 1 END)"),
        }
    }

    /// Renders a comma-separated aggregation of an integer column.
    #[must_use]
    pub fn aggregate_indices(&self, column: &str) -> String {
        match self {
            Self::Postgres => format!("STRING_AGG(CAST({column} AS TEXT), ',')"),
            Self::MySql => format!("GROUP_CONCAT(CAST({column} AS CHAR))"),
            Self::Sqlite => format!("GROUP_CONCAT({column})"),
        }
    }

    /// Returns the upsert strategy for the dialect.
    #[must_use]
    pub const fn upsert_strategy(&self) -> UpsertStrategy {
        match self {
            Self::Sqlite => UpsertStrategy::OnConflict,
            Self::Postgres => UpsertStrategy::LockAndMerge,
            Self::MySql => UpsertStrategy::OnDuplicateKey,
        }
    }

    /// Translates a driver error into the Lodestar taxonomy.
    ///
    /// Error text never includes the SQL statement.
    #[must_use]
    pub fn classify(&self, err: sqlx::Error) -> Error {
        match err {
            sqlx::Error::Database(db) => self.classify_database(db.as_ref()),
            sqlx::Error::RowNotFound => Error::not_found("row", "query"),
            sqlx::Error::PoolTimedOut => Error::timeout("acquire database connection"),
            sqlx::Error::PoolClosed => Error::unrecoverable("database pool is closed"),
            sqlx::Error::ColumnDecode { index, source } => {
                Error::invalid_record(format!("column {index} could not be decoded: {source}"))
            }
            sqlx::Error::ColumnNotFound(column) => {
                Error::unrecoverable(format!("column {column} is missing"))
            }
            other => Error::unknown_with_source("database error", other),
        }
    }

    fn classify_database(&self, db: &dyn sqlx::error::DatabaseError) -> Error {
        let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
        let message = db.message().to_string();

        if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) {
            return Error::exists("record", "unique key");
        }

        match (self, code.as_str()) {
            // 40P01 deadlock_detected, 40001 serialization_failure
            (Self::Postgres, "40P01" | "40001") => Error::deadlock(message),
            (Self::Postgres, "23505") => Error::exists("record", "unique key"),
            (Self::Postgres, "22001") => Error::bad_request(message),
            (Self::Postgres, "42P01") => Error::unrecoverable(message),

            // MySQL reports SQLSTATE: 1213 -> 40001, 1406 -> 22001, 1146 -> 42S02
            (Self::MySql, "40001") => Error::deadlock(message),
            (Self::MySql, "23000") => Error::exists("record", "unique key"),
            (Self::MySql, "22001") => Error::bad_request(message),
            (Self::MySql, "42S02") => Error::unrecoverable(message),

            // SQLITE_BUSY, SQLITE_LOCKED and their extended codes
            (Self::Sqlite, "5" | "6" | "261" | "262" | "517") => Error::deadlock(message),
            (Self::Sqlite, "18") => Error::bad_request(message),
            (Self::Sqlite, "1") if message.contains("no such table") => {
                Error::unrecoverable(message)
            }

            _ => Error::unknown(format!("database error {code}: {message}")),
        }
    }

    /// Returns true if the error reports an index that already exists.
    #[must_use]
    pub fn is_duplicate_index(&self, err: &sqlx::Error) -> bool {
        match (self, err) {
            (Self::MySql, sqlx::Error::Database(db)) => db.message().contains("Duplicate key name"),
            _ => false,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_url_picks_dialect() {
        assert_eq!(Dialect::from_url("sqlite::memory:").unwrap(), Dialect::Sqlite);
        assert_eq!(
            Dialect::from_url("postgres://u@h/db").unwrap(),
            Dialect::Postgres
        );
        assert_eq!(Dialect::from_url("mysql://u@h/db").unwrap(), Dialect::MySql);
        assert!(Dialect::from_url("oracle://h").is_err());
    }

    #[test]
    fn sqlserver_urls_are_rejected_as_configuration() {
        for url in ["sqlserver://h:1433", "mssql://u@h/db"] {
            assert!(matches!(
                Dialect::from_url(url),
                Err(Error::Configuration { .. })
            ));
        }
    }

    #[test]
    fn rebind_numbers_placeholders_for_postgres() {
        let query = "SELECT * FROM t WHERE a = ? AND b = ?";
        assert_eq!(
            Dialect::Postgres.rebind(query),
            "SELECT * FROM t WHERE a = $1 AND b = $2"
        );
        assert_eq!(Dialect::MySql.rebind(query), query);
        assert_eq!(Dialect::Sqlite.rebind(query), query);
    }

    #[test]
    fn ddl_maps_mediumtext() {
        let ddl = "CREATE TABLE t (a MEDIUMTEXT NOT NULL)";
        assert_eq!(Dialect::Postgres.ddl(ddl), "CREATE TABLE t (a TEXT NOT NULL)");
        assert_eq!(Dialect::MySql.ddl(ddl), ddl);
    }

    #[test]
    fn counts_and_aggregates_per_dialect() {
        assert_eq!(
            Dialect::Postgres.count_where("state = 'RUNNING'"),
            "COUNT(*) FILTER (WHERE state = 'RUNNING')"
        );
        assert_eq!(
            Dialect::MySql.count_where("state = 'RUNNING'"),
            "COUNT(CASE WHEN state = 'RUNNING' THEN 1 END)"
        );
        assert!(Dialect::Postgres.aggregate_indices("i").starts_with("STRING_AGG"));
        assert!(Dialect::Sqlite.aggregate_indices("i").starts_with("GROUP_CONCAT"));
    }

    #[test]
    fn for_update_only_where_supported() {
        assert_eq!(Dialect::Sqlite.for_update(), "");
        assert_eq!(Dialect::Postgres.for_update(), " FOR UPDATE");
    }

    #[test]
    fn pool_errors_are_classified() {
        assert!(matches!(
            Dialect::Sqlite.classify(sqlx::Error::PoolTimedOut),
            Error::Timeout { .. }
        ));
        assert!(matches!(
            Dialect::Sqlite.classify(sqlx::Error::RowNotFound),
            Error::ResourceNotFound { .. }
        ));
    }
}
