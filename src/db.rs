//! Typed client for the coordinator's SQL command surface.
//!
//! Core logic consumes the [`CoordinatorClient`] trait, which returns
//! structured counts, booleans, and row sets. The production [`PsqlClient`]
//! runs tuple-only `psql` queries through the container runtime and does all
//! text parsing here at the boundary.

use crate::error::{PilotError, Result};
use crate::runtime::ContainerRuntime;
use crate::types::ShardPlacementSnapshot;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// SQL command/query surface of the sharded cluster.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// Cheap liveness probe (`SELECT 1`).
    async fn ping(&self) -> Result<()>;

    /// Currently configured coordinator host, if any.
    async fn coordinator_host(&self) -> Result<Option<(String, u16)>>;

    /// Point the metadata at the coordinator's own address.
    async fn set_coordinator_host(&self, host: &str, port: u16) -> Result<()>;

    /// Active worker nodes as `(host, port)` pairs.
    async fn active_workers(&self) -> Result<Vec<(String, u16)>>;

    /// Register a worker with the coordinator.
    async fn add_worker(&self, host: &str, port: u16) -> Result<()>;

    /// Redistribute shard placements across the current worker set.
    async fn rebalance_shards(&self) -> Result<()>;

    /// Evacuate all shard placements off a node.
    async fn drain_node(&self, host: &str, port: u16) -> Result<()>;

    /// Shard counts per node.
    async fn shard_placements(&self) -> Result<Vec<ShardPlacementSnapshot>>;

    /// Distributed tables that still lack a primary key.
    async fn tables_missing_replica_identity(&self) -> Result<Vec<String>>;

    async fn table_exists(&self, table: &str) -> Result<bool>;

    async fn has_primary_key(&self, table: &str) -> Result<bool>;

    async fn column_exists(&self, table: &str, column: &str) -> Result<bool>;

    async fn add_primary_key(&self, table: &str, column: &str) -> Result<()>;

    /// Installed version of an extension, if present.
    async fn extension_version(&self, name: &str) -> Result<Option<String>>;

    async fn count_rows(&self, table: &str) -> Result<u64>;

    /// Insert `count` uniquely tagged marker rows, creating the marker table
    /// when absent.
    async fn insert_markers(&self, table: &str, tag: &str, count: u32) -> Result<()>;

    async fn count_markers(&self, table: &str, tag: &str) -> Result<u64>;

    /// A trivial write-then-read inside one session.
    async fn roundtrip_check(&self) -> Result<()>;
}

/// `psql`-backed client running through the coordinator pod.
pub struct PsqlClient {
    runtime: Arc<dyn ContainerRuntime>,
    service: String,
    database: String,
}

impl PsqlClient {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        service: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            service: service.into(),
            database: database.into(),
        }
    }

    /// Run a statement with tuple-only, unaligned output and return stdout.
    async fn query(&self, sql: &str) -> Result<String> {
        debug!(sql, "Executing query");
        let out = self
            .runtime
            .exec(
                &self.service,
                &["psql", "-d", &self.database, "-v", "ON_ERROR_STOP=1", "-tA", "-c", sql],
            )
            .await
            .map_err(classify_db_error)?;
        Ok(out.stdout)
    }

    /// Run a statement expecting one scalar value.
    ///
    /// Multi-statement scripts emit command tags before the final result, so
    /// the last non-empty line is the value.
    async fn query_scalar(&self, sql: &str) -> Result<String> {
        let out = self.query(sql).await?;
        let value = out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .unwrap_or("");
        Ok(value.to_string())
    }

    async fn query_bool(&self, sql: &str) -> Result<bool> {
        match self.query_scalar(sql).await?.as_str() {
            "t" | "true" => Ok(true),
            "f" | "false" | "" => Ok(false),
            other => Err(PilotError::UnexpectedResult(format!(
                "expected boolean, got '{}'",
                other
            ))),
        }
    }

    async fn query_u64(&self, sql: &str) -> Result<u64> {
        let value = self.query_scalar(sql).await?;
        value
            .parse::<u64>()
            .map_err(|_| PilotError::UnexpectedResult(format!("expected count, got '{}'", value)))
    }
}

/// Re-classify command failures from the database into the error taxonomy.
fn classify_db_error(e: PilotError) -> PilotError {
    let PilotError::CommandFailed { code, stderr } = e else {
        return e;
    };
    let lower = stderr.to_lowercase();
    if lower.contains("connection refused") || lower.contains("could not connect") {
        PilotError::ConnectionRefused(stderr)
    } else if lower.contains("starting up") || lower.contains("the database system is not yet") {
        PilotError::NotReady(stderr)
    } else if lower.contains("could not obtain") && lower.contains("lock") {
        PilotError::LockContention(stderr)
    } else {
        PilotError::CommandFailed { code, stderr }
    }
}

/// Quote a SQL string literal.
fn lit(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Validate and return an identifier for direct interpolation.
fn ident(name: &str) -> Result<&str> {
    if !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        Ok(name)
    } else {
        Err(PilotError::UnexpectedResult(format!(
            "invalid identifier '{}'",
            name
        )))
    }
}

#[async_trait]
impl CoordinatorClient for PsqlClient {
    async fn ping(&self) -> Result<()> {
        self.query_scalar("SELECT 1").await.map(|_| ())
    }

    async fn coordinator_host(&self) -> Result<Option<(String, u16)>> {
        let out = self
            .query("SELECT nodename, nodeport FROM pg_dist_node WHERE groupid = 0")
            .await?;
        parse_node_rows(&out).map(|mut rows| rows.pop())
    }

    async fn set_coordinator_host(&self, host: &str, port: u16) -> Result<()> {
        let sql = format!("SELECT citus_set_coordinator_host({}, {})", lit(host), port);
        self.query(&sql).await.map(|_| ())
    }

    async fn active_workers(&self) -> Result<Vec<(String, u16)>> {
        let out = self
            .query("SELECT node_name, node_port FROM citus_get_active_worker_nodes() ORDER BY 1")
            .await?;
        parse_node_rows(&out)
    }

    async fn add_worker(&self, host: &str, port: u16) -> Result<()> {
        let sql = format!("SELECT citus_add_node({}, {})", lit(host), port);
        self.query(&sql).await.map(|_| ())
    }

    async fn rebalance_shards(&self) -> Result<()> {
        self.query("SELECT rebalance_table_shards()").await.map(|_| ())
    }

    async fn drain_node(&self, host: &str, port: u16) -> Result<()> {
        let sql = format!("SELECT citus_drain_node({}, {})", lit(host), port);
        self.query(&sql).await.map(|_| ())
    }

    async fn shard_placements(&self) -> Result<Vec<ShardPlacementSnapshot>> {
        let out = self
            .query(
                "SELECT nodename, count(*) FROM pg_dist_shard_placement \
                 GROUP BY nodename ORDER BY nodename",
            )
            .await?;

        out.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|line| {
                let (node, count) = line.split_once('|').ok_or_else(|| {
                    PilotError::UnexpectedResult(format!("bad placement row '{}'", line))
                })?;
                let shard_count = count.trim().parse::<u64>().map_err(|_| {
                    PilotError::UnexpectedResult(format!("bad shard count '{}'", count))
                })?;
                Ok(ShardPlacementSnapshot::new(node.trim(), shard_count))
            })
            .collect()
    }

    async fn tables_missing_replica_identity(&self) -> Result<Vec<String>> {
        let out = self
            .query(
                "SELECT logicalrelid::text FROM pg_dist_partition p \
                 WHERE NOT EXISTS (SELECT 1 FROM pg_index i \
                 WHERE i.indrelid = p.logicalrelid AND i.indisprimary) \
                 ORDER BY 1",
            )
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string())
            .collect())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let sql = format!("SELECT to_regclass({}) IS NOT NULL", lit(table));
        self.query_bool(&sql).await
    }

    async fn has_primary_key(&self, table: &str) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM pg_index \
             WHERE indrelid = to_regclass({}) AND indisprimary)",
            lit(table)
        );
        self.query_bool(&sql).await
    }

    async fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM information_schema.columns \
             WHERE table_name = {} AND column_name = {})",
            lit(table),
            lit(column)
        );
        self.query_bool(&sql).await
    }

    async fn add_primary_key(&self, table: &str, column: &str) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {} ADD PRIMARY KEY ({})",
            ident(table)?,
            ident(column)?
        );
        self.query(&sql).await.map(|_| ())
    }

    async fn extension_version(&self, name: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT extversion FROM pg_extension WHERE extname = {}",
            lit(name)
        );
        let version = self.query_scalar(&sql).await?;
        Ok(if version.is_empty() { None } else { Some(version) })
    }

    async fn count_rows(&self, table: &str) -> Result<u64> {
        let sql = format!("SELECT count(*) FROM {}", ident(table)?);
        self.query_u64(&sql).await
    }

    async fn insert_markers(&self, table: &str, tag: &str, count: u32) -> Result<()> {
        let table = ident(table)?;
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {} (tag text NOT NULL, seq int NOT NULL)",
            table
        );
        self.query(&create).await?;

        let insert = format!(
            "INSERT INTO {} (tag, seq) SELECT {}, g FROM generate_series(1, {}) g",
            table,
            lit(tag),
            count
        );
        self.query(&insert).await.map(|_| ())
    }

    async fn count_markers(&self, table: &str, tag: &str) -> Result<u64> {
        let sql = format!(
            "SELECT count(*) FROM {} WHERE tag = {}",
            ident(table)?,
            lit(tag)
        );
        self.query_u64(&sql).await
    }

    async fn roundtrip_check(&self) -> Result<()> {
        // Single psql session; the temp table vanishes with it.
        let count = self
            .query_u64(
                "CREATE TEMP TABLE pilot_rw (v int); \
                 INSERT INTO pilot_rw VALUES (1); \
                 SELECT count(*) FROM pilot_rw",
            )
            .await?;
        if count == 1 {
            Ok(())
        } else {
            Err(PilotError::UnexpectedResult(format!(
                "round-trip expected 1 row, found {}",
                count
            )))
        }
    }
}

/// Parse `host|port` rows into `(host, port)` pairs.
fn parse_node_rows(out: &str) -> Result<Vec<(String, u16)>> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            let (host, port) = line.split_once('|').ok_or_else(|| {
                PilotError::UnexpectedResult(format!("bad node row '{}'", line))
            })?;
            let port = port
                .trim()
                .parse::<u16>()
                .map_err(|_| PilotError::UnexpectedResult(format!("bad port '{}'", port)))?;
            Ok((host.trim().to_string(), port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_rows() {
        let rows = parse_node_rows("worker-0|5432\nworker-1|5432\n").unwrap();
        assert_eq!(
            rows,
            vec![("worker-0".to_string(), 5432), ("worker-1".to_string(), 5432)]
        );
    }

    #[test]
    fn test_parse_node_rows_empty_and_malformed() {
        assert!(parse_node_rows("").unwrap().is_empty());
        assert!(parse_node_rows("worker-0 5432").is_err());
        assert!(parse_node_rows("worker-0|not-a-port").is_err());
    }

    #[test]
    fn test_literal_quoting() {
        assert_eq!(lit("worker-0"), "'worker-0'");
        assert_eq!(lit("o'brien"), "'o''brien'");
    }

    #[test]
    fn test_identifier_validation() {
        assert_eq!(ident("orders").unwrap(), "orders");
        assert_eq!(ident("public.orders").unwrap(), "public.orders");
        assert!(ident("orders; DROP TABLE x").is_err());
        assert!(ident("").is_err());
    }

    #[test]
    fn test_classify_db_error() {
        let refused = classify_db_error(PilotError::CommandFailed {
            code: 2,
            stderr: "psql: could not connect to server: Connection refused".into(),
        });
        assert!(refused.is_transient());

        let starting = classify_db_error(PilotError::CommandFailed {
            code: 2,
            stderr: "FATAL: the database system is starting up".into(),
        });
        assert!(matches!(starting, PilotError::NotReady(_)));

        let other = classify_db_error(PilotError::CommandFailed {
            code: 1,
            stderr: "ERROR: syntax error".into(),
        });
        assert!(!other.is_transient());
    }
}
