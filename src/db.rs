//! Metadata database: connection handling, schema bootstrap, and
//! placeholder rebinding for the Postgres wire family.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Once;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use sqlx::Row;
use tracing::info;
use url::Url;

use crate::error::{Error, Result};

/// Relational backends the metadata database can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// PostgreSQL.
    Postgres,
    /// CockroachDB, spoken to over the Postgres wire protocol.
    Cockroach,
    /// Embedded SQLite, for local and ephemeral deployments.
    Sqlite,
}

impl Backend {
    fn needs_rebind(self) -> bool {
        matches!(self, Backend::Postgres | Backend::Cockroach)
    }
}

/// Where the metadata database lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DatabaseConfig {
    /// A server reached by connection URL (`postgres://` or
    /// `cockroachdb://`).
    Url {
        /// Connection URL.
        url: String,
    },

    /// A SQLite database file.
    Sqlite {
        /// Path to the database file; created if missing.
        path: PathBuf,
    },

    /// In-memory SQLite (for testing).
    Memory,
}

fn install_drivers() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(sqlx::any::install_default_drivers);
}

/// Handle on the metadata database.
///
/// All backends run through a single `sqlx` `Any` pool; statements are
/// written with `?` placeholders and rebound to `$n` for the Postgres
/// wire family.
#[derive(Debug, Clone)]
pub struct Db {
    pool: AnyPool,
    backend: Backend,
}

impl Db {
    /// Open the database named by `config`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        match config {
            DatabaseConfig::Url { url } => Self::open(url).await,
            DatabaseConfig::Sqlite { path } => Self::open_sqlite(path).await,
            DatabaseConfig::Memory => Self::open_memory().await,
        }
    }

    /// Open a server backend by connection URL.
    ///
    /// Exactly two backends are accepted: PostgreSQL (`postgres://`,
    /// `postgresql://`) and CockroachDB (`cockroachdb://`, `cockroach://`).
    /// Anything else is [`Error::UnsupportedBackend`].
    pub async fn open(database_url: &str) -> Result<Self> {
        install_drivers();

        let url = Url::parse(database_url)
            .map_err(|e| Error::UnsupportedBackend(format!("{database_url}: {e}")))?;
        let (backend, url) = match url.scheme() {
            "postgres" | "postgresql" => (Backend::Postgres, url),
            "cockroach" | "cockroachdb" => {
                // Cockroach speaks the Postgres wire protocol; only the
                // scheme differs.
                let mut url = url;
                url.set_scheme("postgres")
                    .map_err(|()| Error::UnsupportedBackend(database_url.to_string()))?;
                (Backend::Cockroach, url)
            }
            other => return Err(Error::UnsupportedBackend(other.to_string())),
        };

        let pool = AnyPoolOptions::new()
            .max_connections(5)
            .connect(url.as_str())
            .await?;

        Ok(Self { pool, backend })
    }

    /// Open a SQLite database file, creating it if missing.
    pub async fn open_sqlite(path: &Path) -> Result<Self> {
        install_drivers();

        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;

        Ok(Self {
            pool,
            backend: Backend::Sqlite,
        })
    }

    /// Open an in-memory SQLite database.
    pub async fn open_memory() -> Result<Self> {
        install_drivers();

        // The database lives in its single connection; it must never be
        // recycled.
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Ok(Self {
            pool,
            backend: Backend::Sqlite,
        })
    }

    /// The backend this handle is connected to.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub(crate) fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Rewrite a `?`-placeholder statement into the dialect of the
    /// connected backend.
    pub(crate) fn sql<'a>(&self, query: &'a str) -> Cow<'a, str> {
        if self.backend.needs_rebind() {
            Cow::Owned(rebind(query))
        } else {
            Cow::Borrowed(query)
        }
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// One migration step: a version number plus the statements that take the
/// schema there, in each backend's dialect.
struct Step {
    version: i64,
    description: &'static str,
    postgres: &'static [&'static str],
    sqlite: &'static [&'static str],
}

const STEPS: &[Step] = &[Step {
    version: 0,
    description: "initial setup",
    postgres: &[
        "CREATE TABLE IF NOT EXISTS blocks (
            cid TEXT NOT NULL,
            size INTEGER NOT NULL,
            created TIMESTAMP NOT NULL DEFAULT NOW(),
            data BYTEA,
            deleted BOOLEAN NOT NULL DEFAULT false,
            pack_object TEXT NOT NULL DEFAULT '',
            pack_offset INTEGER NOT NULL DEFAULT 0,
            pack_status INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY ( cid )
        )",
        "CREATE TABLE IF NOT EXISTS datastore (
            key TEXT NOT NULL,
            data BYTEA,
            PRIMARY KEY ( key )
        )",
    ],
    sqlite: &[
        "CREATE TABLE IF NOT EXISTS blocks (
            cid TEXT NOT NULL,
            size INTEGER NOT NULL,
            created TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            data BLOB,
            deleted BOOLEAN NOT NULL DEFAULT false,
            pack_object TEXT NOT NULL DEFAULT '',
            pack_offset INTEGER NOT NULL DEFAULT 0,
            pack_status INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY ( cid )
        )",
        "CREATE TABLE IF NOT EXISTS datastore (
            key TEXT NOT NULL,
            data BLOB,
            PRIMARY KEY ( key )
        )",
    ],
}];

impl Db {
    /// Bring the schema to the latest version. Idempotent; applied step
    /// numbers are tracked in the `versions` table.
    pub async fn migrate(&self) -> Result<()> {
        let versions_ddl = match self.backend {
            Backend::Postgres | Backend::Cockroach => {
                "CREATE TABLE IF NOT EXISTS versions (
                    version INTEGER NOT NULL,
                    applied TIMESTAMP NOT NULL DEFAULT NOW(),
                    PRIMARY KEY ( version )
                )"
            }
            Backend::Sqlite => {
                "CREATE TABLE IF NOT EXISTS versions (
                    version INTEGER NOT NULL,
                    applied TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    PRIMARY KEY ( version )
                )"
            }
        };
        sqlx::query(versions_ddl).execute(&self.pool).await?;

        let row = sqlx::query("SELECT MAX(version) AS version FROM versions")
            .fetch_one(&self.pool)
            .await?;
        let current: Option<i64> = row.get("version");

        for step in STEPS {
            if current.is_some_and(|v| v >= step.version) {
                continue;
            }

            let statements = match self.backend {
                Backend::Postgres | Backend::Cockroach => step.postgres,
                Backend::Sqlite => step.sqlite,
            };

            let mut tx = self.pool.begin().await?;
            for statement in statements {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
            let insert = self.sql("INSERT INTO versions (version) VALUES (?)");
            sqlx::query(&insert)
                .bind(step.version)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            info!(version = step.version, description = step.description, "applied migration");
        }

        Ok(())
    }
}

// Auxiliary key/value side channel over the `datastore` table. Opaque
// bytes per key, no state machine.
impl Db {
    /// Store a metadata value, replacing any previous one.
    pub async fn put_metadata(&self, key: &str, value: &[u8]) -> Result<()> {
        let sql = self.sql(
            "INSERT INTO datastore (key, data) VALUES (?, ?)
             ON CONFLICT (key) DO UPDATE SET data = excluded.data",
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(value.to_vec())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fetch a metadata value.
    pub async fn get_metadata(&self, key: &str) -> Result<Bytes> {
        let sql = self.sql("SELECT data FROM datastore WHERE key = ?");
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        let data: Option<Vec<u8>> = row.get("data");
        Ok(Bytes::from(data.unwrap_or_default()))
    }

    /// Remove a metadata value. Removing an absent key is not an error.
    pub async fn delete_metadata(&self, key: &str) -> Result<()> {
        let sql = self.sql("DELETE FROM datastore WHERE key = ?");
        sqlx::query(&sql).bind(key).execute(&self.pool).await?;
        Ok(())
    }
}

/// Rewrite `?` placeholders into positional `$1, $2, …` parameters.
///
/// A `?` inside a single-quoted string literal, a double-quoted
/// identifier, or a `--` line comment is left untouched.
pub fn rebind(sql: &str) -> String {
    #[derive(Clone, Copy)]
    enum State {
        Start,
        InString,
        InIdent,
        InLineComment,
    }

    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len() + 10);
    let mut state = State::Start;
    let mut n = 1;

    for i in 0..chars.len() {
        let ch = chars[i];
        match state {
            State::Start => match ch {
                '?' => {
                    out.push('$');
                    out.push_str(&n.to_string());
                    n += 1;
                    continue;
                }
                '-' if chars.get(i + 1) == Some(&'-') => state = State::InLineComment,
                '"' => state = State::InIdent,
                '\'' => state = State::InString,
                _ => {}
            },
            State::InString => {
                if ch == '\'' {
                    state = State::Start;
                }
            }
            State::InIdent => {
                if ch == '"' {
                    state = State::Start;
                }
            }
            State::InLineComment => {
                if ch == '\n' {
                    state = State::Start;
                }
            }
        }
        out.push(ch);
    }

    out
}
