// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL connection management for the cache.
//!
//! Owns the sqlx `Any` pool, the detected [`Dialect`] and the template
//! tables every per-type table is cloned from.
//!
//! ## sqlx Any Driver Quirks
//!
//! MySQL `MEDIUMTEXT` columns come back through the `Any` driver as BLOBs,
//! and `NULL` literals in a `UNION ALL` carry no type. Text columns are
//! therefore read with [`text_column`], which tries `String` first and falls
//! back to UTF-8 decoding a byte vector.

use super::dialect::Dialect;
use super::traits::CacheError;
use crate::resilience::retry::{retry, RetryConfig};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, info};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// A connected pool plus its dialect.
#[derive(Debug, Clone)]
pub struct SqlBackend {
    pool: AnyPool,
    dialect: Dialect,
}

impl SqlBackend {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    pub async fn connect(connection_string: &str, max_connections: u32) -> Result<Self, CacheError> {
        install_drivers();

        let dialect = Dialect::from_url(connection_string)?;

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(CacheError::from)
        })
        .await?;

        let backend = Self { pool, dialect };

        if dialect.is_sqlite() {
            backend.enable_wal_mode().await?;
        }

        backend.init_templates().await?;
        info!(dialect = ?dialect, "SQL cache backend connected");
        Ok(backend)
    }

    /// Wrap an existing pool. Template tables are created if missing.
    pub async fn from_pool(pool: AnyPool, dialect: Dialect) -> Result<Self, CacheError> {
        let backend = Self { pool, dialect };
        backend.init_templates().await?;
        Ok(backend)
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Enable WAL (Write-Ahead Logging) mode for SQLite so readers don't
    /// block the single writer.
    async fn enable_wal_mode(&self) -> Result<(), CacheError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| CacheError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| CacheError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_templates(&self) -> Result<(), CacheError> {
        for ddl in self.dialect.template_ddl() {
            sqlx::query(&ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| CacheError::Backend(format!("Failed to create template table: {}", e)))?;
        }
        Ok(())
    }

    /// Whether the backend accepts the dialect's native upsert clause.
    pub async fn detect_native_upsert(&self) -> bool {
        match self.dialect {
            Dialect::MySql => true,
            Dialect::Sqlite => {
                let version = sqlx::query("SELECT sqlite_version() AS version")
                    .fetch_one(&self.pool)
                    .await
                    .ok()
                    .and_then(|row| text_column(&row, "version"));
                let supported = version.as_deref().is_some_and(Dialect::sqlite_supports_upsert);
                debug!(version = ?version, supported, "Probed SQLite upsert support");
                supported
            }
        }
    }
}

/// Read a nullable text column, tolerating BLOB-typed results.
pub fn text_column(row: &AnyRow, column: &str) -> Option<String> {
    if let Ok(value) = row.try_get::<Option<String>, _>(column) {
        return value;
    }
    row.try_get::<Option<Vec<u8>>, _>(column)
        .ok()
        .flatten()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}
