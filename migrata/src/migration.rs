use std::{fs, path::Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use crate::error::Result;

/// A unit of schema change.
///
/// Migrations run in ascending lexical order of their `id`, so ids should be
/// chosen with that in mind, e.g. prefixed with a date:
/// `"2024-03-01 001 Create users"`. The script is sent to the database as is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    pub id: String,
    pub script: String,
}

impl Migration {
    pub fn new(id: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            script: script.into(),
        }
    }

    /// Content hash of the script, recorded alongside the applied migration.
    pub fn checksum(&self) -> String {
        checksum(&self.script)
    }
}

/// A migration recorded in the tracking table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AppliedMigration {
    pub id: String,
    pub checksum: String,
    #[sqlx(rename = "execution_time_in_millis")]
    pub execution_time_millis: i64,
    pub applied_at: DateTime<Utc>,
}

/// Lowercase hex SHA3-256 of a script.
pub fn checksum(script: &str) -> String {
    format!("{:x}", Sha3_256::digest(script.as_bytes()))
}

/// Loads every `*.sql` file of `dir` as a migration whose id is the file
/// stem. The result is sorted by id.
pub fn migrations_from_dir(dir: impl AsRef<Path>) -> Result<Vec<Migration>> {
    let mut migrations = Vec::new();

    for entry in fs::read_dir(dir.as_ref())? {
        let path = entry?.path();

        if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("sql") {
            continue;
        }

        let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };

        let script = fs::read_to_string(&path)?;
        migrations.push(Migration::new(id, script));
    }

    migrations.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(migrations)
}
