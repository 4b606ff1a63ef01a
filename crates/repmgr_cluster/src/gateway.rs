//! Opening database handles and retrying transient query failures.

use std::future::Future;
use std::time::Duration;

use repmgr_common::conninfo;
use repmgr_common::types::{NodeId, NodeRecord, RecoveryType, ReplInfo};
use repmgr_common::{ErrorKind, RepmgrError, RepmgrResult};
use tracing::{debug, error, warn};

use crate::context::ClusterContext;
use crate::db::{Connector, DbSession};

/// Open a handle; failures are logged and returned.
pub async fn establish_db_connection(
    connector: &dyn Connector,
    conninfo: &str,
) -> RepmgrResult<Box<dyn DbSession>> {
    match connector.connect(conninfo).await {
        Ok(conn) => Ok(conn),
        Err(e) => {
            error!("connection to database failed");
            if let Some(d) = &e.detail {
                error!("  {}", d);
            }
            Err(e)
        }
    }
}

/// Open a handle without logging; the caller inspects the result.
pub async fn establish_db_connection_quiet(
    connector: &dyn Connector,
    conninfo: &str,
) -> Option<Box<dyn DbSession>> {
    match connector.connect(conninfo).await {
        Ok(conn) => Some(conn),
        Err(e) => {
            debug!("connection to \"{}\" failed: {}", conninfo, e);
            None
        }
    }
}

/// Open a handle to the node described by `record`.
pub async fn connect_to_node(
    ctx: &ClusterContext,
    record: &NodeRecord,
) -> RepmgrResult<Box<dyn DbSession>> {
    ctx.connector.connect(&record.conninfo).await.map_err(|e| {
        RepmgrError::db_connection(format!(
            "unable to connect to node \"{}\" (ID: {})",
            record.node_name, record.node_id
        ))
        .with_detail(e.detail.unwrap_or(e.message))
    })
}

/// A handle with superuser rights, substituting `--superuser` when given.
///
/// Returns `Ok(None)` when neither the normal handle nor a substituted one
/// is a superuser; the caller decides whether that is fatal.
pub async fn superuser_connection(
    ctx: &ClusterContext,
    conn: &dyn DbSession,
) -> RepmgrResult<Option<Box<dyn DbSession>>> {
    match &ctx.options.superuser {
        Some(su) => {
            let ci = conninfo::with_param(conn.conninfo(), "user", su)?;
            let su_conn = establish_db_connection(ctx.connector.as_ref(), &ci).await?;
            if !su_conn.is_superuser().await? {
                return Err(RepmgrError::bad_config(format!(
                    "\"{}\" is not a superuser",
                    su
                )));
            }
            Ok(Some(su_conn))
        }
        None => {
            if conn.is_superuser().await? {
                let again = establish_db_connection(ctx.connector.as_ref(), conn.conninfo()).await?;
                Ok(Some(again))
            } else {
                Ok(None)
            }
        }
    }
}

/// Connect to the active primary recorded in the metadata and verify it is
/// really a primary.
pub async fn connect_to_primary(
    ctx: &ClusterContext,
    conn: &dyn DbSession,
) -> RepmgrResult<(Box<dyn DbSession>, NodeRecord)> {
    let primary = read_primary_node_record(conn).await?.ok_or_else(|| {
        RepmgrError::node_status("unable to determine the primary node")
            .with_hint("check the node records with \"repmgr cluster show\"")
    })?;
    let primary_conn = connect_to_node(ctx, &primary).await?;
    let rt = read_recovery_type(primary_conn.as_ref()).await?;
    if rt != RecoveryType::Primary {
        return Err(RepmgrError::node_status(format!(
            "node \"{}\" (ID: {}) is registered as primary but is {}",
            primary.node_name,
            primary.node_id,
            rt.as_str()
        )));
    }
    Ok((primary_conn, primary))
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Linear retry policy for database queries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: usize,
    delay: Duration,
}

impl RetryPolicy {
    pub fn linear(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Policy used for metadata queries.
    pub fn db_default() -> Self {
        Self::linear(3, Duration::from_millis(500))
    }

    /// Serialization failures and the like. A closed connection is not
    /// retried: the handle cannot be reused.
    fn retryable(err: &RepmgrError) -> bool {
        err.kind == ErrorKind::DbQuery && err.transient
    }

    /// Run `op`, retrying transient query errors.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> RepmgrResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RepmgrResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.max_attempts && Self::retryable(&e) => {
                    warn!(
                        "{} failed (attempt {} of {}): {}",
                        what, attempt, self.max_attempts, e
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Retried reads
// ---------------------------------------------------------------------------

pub async fn read_node_record(conn: &dyn DbSession, node_id: NodeId) -> RepmgrResult<Option<NodeRecord>> {
    RetryPolicy::db_default()
        .run("reading node record", || conn.get_node_record(node_id))
        .await
}

pub async fn read_primary_node_record(conn: &dyn DbSession) -> RepmgrResult<Option<NodeRecord>> {
    RetryPolicy::db_default()
        .run("reading primary node record", || conn.get_primary_node_record())
        .await
}

pub async fn read_all_node_records(conn: &dyn DbSession) -> RepmgrResult<Vec<NodeRecord>> {
    RetryPolicy::db_default()
        .run("reading node records", || conn.get_all_node_records())
        .await
}

pub async fn read_recovery_type(conn: &dyn DbSession) -> RepmgrResult<RecoveryType> {
    RetryPolicy::db_default()
        .run("reading recovery type", || conn.recovery_type())
        .await
}

pub async fn read_replication_info(conn: &dyn DbSession) -> RepmgrResult<ReplInfo> {
    RetryPolicy::db_default()
        .run("reading replication status", || conn.replication_info())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result = RetryPolicy::db_default()
            .run("query", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(RepmgrError::db_query("could not serialize access").transient())
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let calls = AtomicUsize::new(0);
        let result: RepmgrResult<()> = RetryPolicy::linear(2, Duration::from_millis(10))
            .run("query", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RepmgrError::db_query("could not serialize access").transient())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_query_errors_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: RepmgrResult<()> = RetryPolicy::db_default()
            .run("insert", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RepmgrError::db_query("a record with the same \"node_name\" already exists"))
            })
            .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::DbQuery);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_errors_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: RepmgrResult<()> = RetryPolicy::db_default()
            .run("query", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RepmgrError::db_connection("down"))
            })
            .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::DbConnection);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
