use std::fmt;

use sqlagent_types::{AgentError, Result};
use sqlx::postgres::PgConnectOptions;

use crate::backend::SqlBackend;
use crate::postgres::PostgresBackend;
use crate::sqlite::SqliteBackend;

/// Connection parameters for the target database.
///
/// A `url` takes precedence over the individual fields. URLs starting with
/// `sqlite:` select the SQLite backend; everything else is Postgres.
#[derive(Clone)]
pub struct DbConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: Option<String>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".into(),
            port: 5433,
            name: "llm_sql_agent".into(),
            user: "postgres".into(),
            password: None,
        }
    }
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("url", &self.url.as_ref().map(|_| "<set>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl DbConfig {
    /// Read `DATABASE_URL`, or `DB_HOST`/`DB_PORT`/`DB_NAME`/`DB_USER`/`DB_PASSWORD`,
    /// falling back to the defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let port = match lookup("DB_PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| AgentError::Config(format!("DB_PORT is not a valid port: {raw}")))?,
            None => defaults.port,
        };

        Ok(Self {
            url: lookup("DATABASE_URL").filter(|u| !u.is_empty()),
            host: lookup("DB_HOST").unwrap_or(defaults.host),
            port,
            name: lookup("DB_NAME").unwrap_or(defaults.name),
            user: lookup("DB_USER").unwrap_or(defaults.user),
            password: lookup("DB_PASSWORD").filter(|p| !p.is_empty()),
        })
    }

    pub fn is_sqlite(&self) -> bool {
        self.url
            .as_deref()
            .is_some_and(|u| u.starts_with("sqlite:"))
    }

    fn pg_options(&self) -> Result<PgConnectOptions> {
        if let Some(url) = &self.url {
            return url
                .parse::<PgConnectOptions>()
                .map_err(|e| AgentError::Config(format!("Invalid DATABASE_URL: {e}")));
        }
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.user);
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        Ok(options)
    }

    /// Build the backend this configuration points at. No connection is opened.
    pub fn connect_backend(&self) -> Result<Box<dyn SqlBackend>> {
        if let Some(url) = self.url.as_deref().filter(|_| self.is_sqlite()) {
            let backend = SqliteBackend::from_url(url)
                .map_err(|e| AgentError::Config(format!("Invalid SQLite URL: {e}")))?;
            return Ok(Box::new(backend));
        }
        Ok(Box::new(PostgresBackend::new(self.pg_options()?)))
    }
}
