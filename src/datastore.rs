//! SQL access to the datastore container, used by the datastore health check and
//! the auto-seeder. Queries go through `docker compose exec ... psql`, so nothing
//! on the host needs a database client.

use crate::config::{DbSettings, Profile, ServiceId};
use crate::docker::{self, DockerMeta};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::timeout;

#[async_trait]
pub trait SqlRunner: Send + Sync {
    /// Run one statement and return its unaligned, tuples-only output.
    async fn query(&self, sql: &str) -> Result<String>;
}

pub struct ComposePsql {
    meta: DockerMeta,
    root: PathBuf,
    profile: String,
    service: String,
    db: DbSettings,
    limit: Duration,
}

impl ComposePsql {
    pub fn new(meta: &DockerMeta, root: PathBuf, profile: &Profile, limit: Duration) -> Self {
        Self {
            meta: meta.clone(),
            root,
            profile: profile.name.as_str().to_string(),
            service: profile.compose_service(ServiceId::Db),
            db: profile.db.clone(),
            limit,
        }
    }
}

#[async_trait]
impl SqlRunner for ComposePsql {
    async fn query(&self, sql: &str) -> Result<String> {
        let mut cmd = docker::compose_command(&self.meta, &self.root, &self.profile);
        cmd.args(["exec", "-T", "-e"])
            .arg(format!("PGPASSWORD={}", self.db.password))
            .arg(&self.service)
            .args(["psql", "-X", "-tA", "-v", "ON_ERROR_STOP=1", "-U", self.db.user.as_str(), "-d", self.db.name.as_str(), "-c", sql])
            .kill_on_drop(true);

        let out = timeout(self.limit, cmd.output())
            .await
            .map_err(|_| anyhow!("psql timed out after {}s", self.limit.as_secs()))??;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let first = stderr.lines().find(|l| !l.trim().is_empty()).unwrap_or("psql failed");
            return Err(anyhow!("{}", first.trim()));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("static regex"))
}

/// Plain (optionally schema-qualified) identifiers only; nothing needing quoting.
pub fn valid_identifier(name: &str) -> bool {
    identifier_re().is_match(name)
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// `(schema, table)` pairs as Postgres stores them: unqualified names live in
/// `public`, unquoted identifiers fold to lower case. Duplicates are dropped.
pub fn table_refs(tables: &[String]) -> Vec<(String, String)> {
    let mut refs: Vec<(String, String)> = Vec::new();
    for t in tables {
        let t = t.trim().to_lowercase();
        let r = match t.split_once('.') {
            Some((schema, table)) => (schema.to_string(), table.to_string()),
            None => ("public".to_string(), t.clone()),
        };
        if !refs.contains(&r) {
            refs.push(r);
        }
    }
    refs
}

/// One round trip: database identity plus how many expected tables exist.
/// Compare the count against `table_refs(expected_tables).len()`.
pub fn identity_check_sql(expected_tables: &[String]) -> String {
    let refs = table_refs(expected_tables);
    let present = if refs.is_empty() {
        "0".to_string()
    } else {
        let list = refs
            .iter()
            .map(|(schema, table)| format!("({}, {})", quote_literal(schema), quote_literal(table)))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "(SELECT count(*) FROM information_schema.tables \
             WHERE (table_schema, table_name) IN ({list}))"
        )
    };
    format!("SELECT current_database() || '|' || {present}")
}

/// Judge the output of [`identity_check_sql`].
pub fn evaluate_identity(output: &str, expected_db: &str, expected_tables: usize) -> Result<(), String> {
    let line = output.lines().map(|l| l.trim()).find(|l| !l.is_empty()).unwrap_or("");
    let (db, count) = line
        .split_once('|')
        .ok_or_else(|| format!("unexpected datastore response '{line}'"))?;
    if db != expected_db {
        return Err(format!("connected to database '{db}', expected '{expected_db}'"));
    }
    let found: usize = count
        .trim()
        .parse()
        .map_err(|_| format!("unexpected table count '{count}'"))?;
    if found < expected_tables {
        return Err(format!("schema incomplete: {found}/{expected_tables} expected tables present"));
    }
    Ok(())
}

pub fn count_rows_sql(table: &str) -> String {
    format!("SELECT count(*) FROM {table}")
}
