// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL dialect differences.
//!
//! Both supported backends share table layouts and placeholder syntax (`?`).
//! They differ in DDL, upsert clauses, row locking and pattern matching:
//!
//! | Concern | MySQL | SQLite |
//! |---|---|---|
//! | Per-type tables | `CREATE TABLE … LIKE template` | `CREATE TABLE … AS SELECT … WHERE 1=0` + indexes |
//! | Upsert | `ON DUPLICATE KEY UPDATE` | `ON CONFLICT(id, agent) DO UPDATE` (3.24+) |
//! | Probe lock | `SELECT … FOR UPDATE` | none (transaction holds the write lock) |
//! | Glob filter | `REGEXP_LIKE(id, ?, 'c')` | `id GLOB ?` |

use crate::schema::{RELATIONSHIP_TEMPLATE, RESOURCE_TEMPLATE};
use crate::storage::traits::CacheError;

/// Columns written by a resource upsert, in bind order.
pub const RESOURCE_COLUMNS: &str = "id, agent, application, body_hash, body, last_updated";
pub const RESOURCE_COLUMN_COUNT: usize = 6;

/// Columns written by a relationship insert, in bind order.
pub const RELATIONSHIP_COLUMNS: &str = "uuid, id, rel_id, rel_agent, rel_type, last_updated";
pub const RELATIONSHIP_COLUMN_COUNT: usize = 6;

/// Escape character used in every `LIKE` this crate issues.
pub const LIKE_ESCAPE: char = '!';

/// Oldest SQLite release with `ON CONFLICT … DO UPDATE`.
const SQLITE_UPSERT_MIN: (u32, u32) = (3, 24);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Sqlite,
}

impl Dialect {
    pub fn from_url(url: &str) -> Result<Self, CacheError> {
        if url.starts_with("sqlite:") {
            Ok(Self::Sqlite)
        } else if url.starts_with("mysql:") || url.starts_with("mariadb:") {
            Ok(Self::MySql)
        } else {
            Err(CacheError::Backend(format!("Unsupported SQL url scheme: {}", url.split(':').next().unwrap_or(""))))
        }
    }

    pub fn is_sqlite(&self) -> bool {
        matches!(self, Self::Sqlite)
    }

    /// DDL for the template tables, run once at startup.
    pub fn template_ddl(&self) -> Vec<String> {
        match self {
            Self::MySql => vec![
                format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {} (
                        id VARCHAR(255) NOT NULL,
                        agent VARCHAR(127) NOT NULL,
                        application VARCHAR(255),
                        body_hash VARCHAR(64) NOT NULL,
                        body MEDIUMTEXT NOT NULL,
                        last_updated BIGINT NOT NULL,
                        PRIMARY KEY (id, agent),
                        INDEX resource_agent_idx (agent),
                        INDEX resource_application_idx (application),
                        INDEX resource_last_updated_idx (last_updated)
                    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_bin
                    "#,
                    RESOURCE_TEMPLATE
                ),
                format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {} (
                        uuid CHAR(36) NOT NULL,
                        id VARCHAR(255) NOT NULL,
                        rel_id VARCHAR(255) NOT NULL,
                        rel_agent VARCHAR(255) NOT NULL,
                        rel_type VARCHAR(64) NOT NULL,
                        last_updated BIGINT NOT NULL,
                        PRIMARY KEY (uuid),
                        INDEX rel_id_idx (id),
                        INDEX rel_agent_type_idx (rel_agent, rel_type)
                    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_bin
                    "#,
                    RELATIONSHIP_TEMPLATE
                ),
            ],
            Self::Sqlite => vec![
                format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {} (
                        id TEXT NOT NULL,
                        agent TEXT NOT NULL,
                        application TEXT,
                        body_hash TEXT NOT NULL,
                        body TEXT NOT NULL,
                        last_updated INTEGER NOT NULL,
                        PRIMARY KEY (id, agent)
                    )
                    "#,
                    RESOURCE_TEMPLATE
                ),
                format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {} (
                        uuid TEXT NOT NULL PRIMARY KEY,
                        id TEXT NOT NULL,
                        rel_id TEXT NOT NULL,
                        rel_agent TEXT NOT NULL,
                        rel_type TEXT NOT NULL,
                        last_updated INTEGER NOT NULL
                    )
                    "#,
                    RELATIONSHIP_TEMPLATE
                ),
            ],
        }
    }

    /// DDL creating a per-type resource table from its template.
    pub fn resource_table_ddl(&self, table: &str) -> Vec<String> {
        match self {
            Self::MySql => vec![format!("CREATE TABLE IF NOT EXISTS {} LIKE {}", table, RESOURCE_TEMPLATE)],
            // AS SELECT copies columns only, so keys are rebuilt as indexes
            Self::Sqlite => vec![
                format!("CREATE TABLE IF NOT EXISTS {} AS SELECT * FROM {} WHERE 1=0", table, RESOURCE_TEMPLATE),
                format!("CREATE UNIQUE INDEX IF NOT EXISTS {0}_id_agent ON {0} (id, agent)", table),
                format!("CREATE INDEX IF NOT EXISTS {0}_agent ON {0} (agent)", table),
                format!("CREATE INDEX IF NOT EXISTS {0}_application ON {0} (application)", table),
                format!("CREATE INDEX IF NOT EXISTS {0}_last_updated ON {0} (last_updated)", table),
            ],
        }
    }

    /// DDL creating a per-type relationship table from its template.
    pub fn relationship_table_ddl(&self, table: &str) -> Vec<String> {
        match self {
            Self::MySql => vec![format!("CREATE TABLE IF NOT EXISTS {} LIKE {}", table, RELATIONSHIP_TEMPLATE)],
            Self::Sqlite => vec![
                format!("CREATE TABLE IF NOT EXISTS {} AS SELECT * FROM {} WHERE 1=0", table, RELATIONSHIP_TEMPLATE),
                format!("CREATE UNIQUE INDEX IF NOT EXISTS {0}_uuid ON {0} (uuid)", table),
                format!("CREATE INDEX IF NOT EXISTS {0}_id ON {0} (id)", table),
                format!("CREATE INDEX IF NOT EXISTS {0}_rel_agent ON {0} (rel_agent, rel_type)", table),
            ],
        }
    }

    /// Multi-row upsert of resource rows.
    pub fn upsert_resources_sql(&self, table: &str, rows: usize) -> String {
        let values = row_placeholders(rows, RESOURCE_COLUMN_COUNT);
        match self {
            Self::MySql => format!(
                "INSERT INTO {} ({}) VALUES {} ON DUPLICATE KEY UPDATE \
                 application = VALUES(application), body_hash = VALUES(body_hash), \
                 body = VALUES(body), last_updated = VALUES(last_updated)",
                table, RESOURCE_COLUMNS, values
            ),
            Self::Sqlite => format!(
                "INSERT INTO {} ({}) VALUES {} ON CONFLICT(id, agent) DO UPDATE SET \
                 application = excluded.application, body_hash = excluded.body_hash, \
                 body = excluded.body, last_updated = excluded.last_updated",
                table, RESOURCE_COLUMNS, values
            ),
        }
    }

    /// Suffix locking the probed row until the transaction ends.
    pub fn row_lock_suffix(&self) -> &'static str {
        match self {
            Self::MySql => " FOR UPDATE",
            Self::Sqlite => "",
        }
    }

    /// Predicate and bind value for a wildcard id filter.
    pub fn glob_filter(&self, glob: &str) -> (&'static str, String) {
        match self {
            Self::MySql => ("REGEXP_LIKE(id, ?, 'c')", glob_to_regex(glob)),
            // No REGEXP operator in stock SQLite; GLOB is anchored and case sensitive
            Self::Sqlite => ("id GLOB ?", glob.to_string()),
        }
    }

    /// Case-sensitive prefix predicate on `column`.
    ///
    /// SQLite's `LIKE` folds ASCII case, so it matches with `GLOB` instead.
    pub fn prefix_filter(&self, column: &str) -> String {
        match self {
            Self::MySql => format!("{} LIKE ? ESCAPE '{}'", column, LIKE_ESCAPE),
            Self::Sqlite => format!("{} GLOB ?", column),
        }
    }

    /// Bind value for [`Dialect::prefix_filter`].
    pub fn prefix_pattern(&self, prefix: &str) -> String {
        match self {
            Self::MySql => format!("{}%", escape_like(prefix)),
            Self::Sqlite => format!("{}*", escape_glob(prefix)),
        }
    }

    /// Whether a reported SQLite version supports native upsert.
    pub fn sqlite_supports_upsert(version: &str) -> bool {
        let mut parts = version.trim().split('.').map(|p| p.parse::<u32>().unwrap_or(0));
        let major = parts.next().unwrap_or(0);
        let minor = parts.next().unwrap_or(0);
        (major, minor) >= SQLITE_UPSERT_MIN
    }
}

/// `?, ?, ?` for `n` values.
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// `(?, ?), (?, ?)` for `rows` tuples of `columns` values.
pub fn row_placeholders(rows: usize, columns: usize) -> String {
    let row = format!("({})", placeholders(columns));
    vec![row; rows].join(", ")
}

/// Translate a glob into an anchored regular expression.
///
/// `*` becomes `.*`, `?` becomes `.`, bracket classes pass through and
/// regex metacharacters are escaped. Runs of `.*` collapse to one.
pub fn glob_to_regex(glob: &str) -> String {
    let mut regex = String::with_capacity(glob.len() + 4);
    regex.push('^');
    let mut in_class = false;
    for c in glob.chars() {
        if in_class {
            regex.push(c);
            if c == ']' {
                in_class = false;
            }
            continue;
        }
        match c {
            '*' => {
                if !regex.ends_with(".*") {
                    regex.push_str(".*");
                }
            }
            '?' => regex.push('.'),
            '[' => {
                in_class = true;
                regex.push(c);
            }
            '.' | '+' | '(' | ')' | '{' | '}' | '|' | '^' | '$' | '\\' => {
                regex.push('\\');
                regex.push(c);
            }
            _ => regex.push(c),
        }
    }
    regex.push('$');
    regex
}

/// Whether a glob needs pattern matching rather than `LIKE`.
pub fn is_wildcard_glob(glob: &str) -> bool {
    glob.contains(['*', '?', '['])
}

/// Escape `LIKE` metacharacters with [`LIKE_ESCAPE`].
pub fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '%' || c == '_' || c == LIKE_ESCAPE {
            escaped.push(LIKE_ESCAPE);
        }
        escaped.push(c);
    }
    escaped
}

/// Escape SQLite `GLOB` metacharacters by wrapping each in a class.
pub fn escape_glob(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' | '?' | '[' => {
                escaped.push('[');
                escaped.push(c);
                escaped.push(']');
            }
            _ => escaped.push(c),
        }
    }
    escaped
}
