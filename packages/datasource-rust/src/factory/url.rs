//! Connection-string construction per database backend.
//!
//! Server backends (`postgresql`, `mysql`) use host/port/database templates.
//! Embedded backends (`sqlite`, and the `h2` family, which is served by
//! SQLite) support shared in-memory, private in-memory and file variants
//! with `;`-separated parameters merged over defaults.

use std::collections::BTreeMap;

use apex_data_core::{ConnectionConfig, DataSourceConfiguration, DataSourceError, Result};
use reqwest::Url;

/// Parameters applied to every embedded database unless overridden.
pub const DEFAULT_EMBEDDED_PARAMETERS: &str = "DB_CLOSE_DELAY=-1;MODE=PostgreSQL";

/// SQL placeholder style of the resolved backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    MySql,
    Sqlite,
}

impl SqlDialect {
    /// Positional placeholder for the 1-based parameter `index`.
    #[must_use]
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Self::Postgres => format!("${index}"),
            Self::MySql | Self::Sqlite => "?".to_string(),
        }
    }
}

/// How an embedded database lives in memory, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryMode {
    /// On disk or on a server.
    None,
    /// Named in-memory database shared by every connection of the pool.
    Shared,
    /// Anonymous in-memory database visible to one connection only.
    Private,
}

/// A resolved connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseUrl {
    pub url: String,
    pub dialect: SqlDialect,
    pub memory: MemoryMode,
    /// Merged embedded parameters; empty for server backends.
    pub parameters: BTreeMap<String, String>,
}

impl DatabaseUrl {
    /// Whether the database must outlive its last idle connection
    /// (`DB_CLOSE_DELAY=-1`).
    #[must_use]
    pub fn keep_alive(&self) -> bool {
        self.parameters
            .get("DB_CLOSE_DELAY")
            .is_some_and(|v| v == "-1")
    }

    /// The URL with any password masked, for logging.
    #[must_use]
    pub fn redacted(&self) -> String {
        match Url::parse(&self.url) {
            Ok(mut url) if url.password().is_some() => {
                let _ = url.set_password(Some("****"));
                url.to_string()
            }
            _ => self.url.clone(),
        }
    }
}

/// Builds the connection target for a database configuration.
///
/// # Errors
///
/// Returns `CONFIGURATION_ERROR` when the source type is missing or
/// unsupported, or a required connection field is absent.
pub fn build_database_url(config: &DataSourceConfiguration) -> Result<DatabaseUrl> {
    let fail = |msg: String| {
        Err(DataSourceError::configuration(msg)
            .with_source(config.name.clone())
            .with_operation("build_url"))
    };

    let Some(source_type) = config
        .source_type
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    else {
        return fail("Source type is required for database configuration".to_string());
    };
    let Some(conn) = config.connection.as_ref() else {
        return fail("Connection configuration is required for database data source".to_string());
    };

    match source_type.to_ascii_lowercase().as_str() {
        "postgresql" | "postgres" => server_url(config, conn, "postgres", 5432, SqlDialect::Postgres),
        "mysql" => server_url(config, conn, "mysql", 3306, SqlDialect::MySql),
        "sqlite" | "sqlite3" => embedded_url(conn.database.as_deref(), None),
        "h2" => match (&conn.host, conn.port) {
            (Some(_), Some(_)) => fail(format!(
                "H2 server mode is not supported; use an embedded database for '{}'",
                config.name
            )),
            // Host without port carries parameters for a named in-memory database.
            (Some(params), None) => {
                let name = conn.database.as_deref().unwrap_or("default");
                embedded_url(Some(&format!("mem:{name}")), Some(params))
            }
            (None, _) => embedded_url(conn.database.as_deref(), None),
        },
        other => fail(format!("Unsupported database type: {other}")),
    }
}

fn server_url(
    config: &DataSourceConfiguration,
    conn: &ConnectionConfig,
    scheme: &str,
    default_port: u16,
    dialect: SqlDialect,
) -> Result<DatabaseUrl> {
    let fail = |msg: String| {
        DataSourceError::configuration(msg)
            .with_source(config.name.clone())
            .with_operation("build_url")
    };
    let host = conn
        .host
        .as_deref()
        .filter(|h| !h.trim().is_empty())
        .ok_or_else(|| fail(format!("Host is required for {scheme} data sources")))?;
    let database = conn.database.as_deref().unwrap_or_default();
    let port = conn.port.unwrap_or(default_port);

    let mut url = Url::parse(&format!("{scheme}://{host}:{port}/{database}"))
        .map_err(|e| fail(format!("Invalid connection URL: {e}")))?;
    if let Some(user) = conn.username.as_deref().filter(|u| !u.is_empty()) {
        url.set_username(user)
            .map_err(|()| fail("Invalid username".to_string()))?;
        url.set_password(conn.password.as_deref())
            .map_err(|()| fail("Invalid password".to_string()))?;
    }
    if conn.ssl_enabled {
        let (key, value) = if dialect == SqlDialect::MySql {
            ("ssl-mode", "required")
        } else {
            ("sslmode", "require")
        };
        url.query_pairs_mut().append_pair(key, value);
    }

    Ok(DatabaseUrl {
        url: url.to_string(),
        dialect,
        memory: MemoryMode::None,
        parameters: BTreeMap::new(),
    })
}

/// Resolves an embedded database descriptor such as `mem:orders;TRACE=1`,
/// `mem`, `./data/orders.db` or nothing at all.
fn embedded_url(database: Option<&str>, extra_params: Option<&str>) -> Result<DatabaseUrl> {
    let descriptor = database.map(str::trim).filter(|d| !d.is_empty());
    let (path, user_params) = match descriptor {
        None => ("mem:default", ""),
        Some(descriptor) => match descriptor.split_once(';') {
            Some((path, params)) => (path.trim(), params.trim()),
            None => (descriptor, ""),
        },
    };
    let user_params = match extra_params {
        Some(extra) if user_params.is_empty() => extra.to_string(),
        Some(extra) => format!("{user_params};{extra}"),
        None => user_params.to_string(),
    };
    let parameters = merge_parameters(DEFAULT_EMBEDDED_PARAMETERS, &user_params);

    let (url, memory) = if path == "mem" || path == ":memory:" {
        ("sqlite::memory:".to_string(), MemoryMode::Private)
    } else if let Some(name) = path.strip_prefix("mem:") {
        let name = if name.is_empty() { "default" } else { name };
        (
            format!("sqlite:file:{name}?mode=memory&cache=shared"),
            MemoryMode::Shared,
        )
    } else {
        (format!("sqlite://{path}?mode=rwc"), MemoryMode::None)
    };

    Ok(DatabaseUrl {
        url,
        dialect: SqlDialect::Sqlite,
        memory,
        parameters,
    })
}

/// Merges `;`-separated `KEY=value` lists. Keys from `overrides` win; a key
/// without `=` maps to an empty value.
#[must_use]
pub fn merge_parameters(defaults: &str, overrides: &str) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for source in [defaults, overrides] {
        for param in source.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = param.split_once('=').unwrap_or((param, ""));
            merged.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    merged
}

/// Renders merged parameters back into `KEY=value;KEY2` form.
#[must_use]
pub fn render_parameters(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| if v.is_empty() { k.clone() } else { format!("{k}={v}") })
        .collect::<Vec<_>>()
        .join(";")
}
