//! Ticket statistics — read-only aggregation queries against the OTRS
//! database, one set of gauges per queue.
//!
//! A cycle is all-or-nothing: any failed query fails the whole cycle.

use std::collections::BTreeMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlPool, MySqlPoolOptions};
use sqlx::{Connection, MySql, Transaction};
use tracing::{debug, warn};

use otrs_core::{CollectionError, CollectorResult, ConfigError, DatabaseConfig, Sample};

use crate::traits::Collector;

/// Aggregates for one queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub queue: String,
    pub open_tickets: u64,
    /// Mean age of open tickets; 0 for an empty queue.
    pub avg_open_age_seconds: f64,
    /// Tickets created within the window.
    pub created: u64,
    /// Tickets moved to a closed state within the window.
    pub closed: u64,
}

/// Source of ticket aggregates.
pub trait TicketStore: Send + Sync + 'static {
    /// Fetch per-queue aggregates; `window` bounds the created/closed counts.
    fn queue_stats(
        &self,
        window: Duration,
    ) -> impl Future<Output = Result<Vec<QueueStats>, CollectionError>> + Send;
}

/// Open = any state of type new, open, or pending.
///
/// `+ 0E0` turns the DECIMAL average into a DOUBLE on every MySQL and
/// MariaDB version; `CAST(.. AS DOUBLE)` needs MySQL 8.0.17.
const OPEN_TICKETS_SQL: &str = "\
SELECT q.name, COUNT(t.id), \
       COALESCE(AVG(TIMESTAMPDIFF(SECOND, t.create_time, NOW())), 0) + 0E0 \
FROM queue q \
LEFT JOIN ticket t ON t.queue_id = q.id AND t.ticket_state_id IN ( \
    SELECT ts.id FROM ticket_state ts \
    JOIN ticket_state_type tst ON tst.id = ts.type_id \
    WHERE tst.name IN ('new', 'open', 'pending reminder', 'pending auto')) \
WHERE q.valid_id = 1 \
GROUP BY q.name";

const CREATED_TICKETS_SQL: &str = "\
SELECT q.name, COUNT(t.id) \
FROM ticket t \
JOIN queue q ON q.id = t.queue_id \
WHERE t.create_time >= NOW() - INTERVAL ? SECOND \
GROUP BY q.name";

/// Counted from state-change history, not `ticket.change_time`, which moves
/// on every edit of an already closed ticket.
const CLOSED_TICKETS_SQL: &str = "\
SELECT q.name, COUNT(DISTINCT th.ticket_id) \
FROM ticket_history th \
JOIN ticket_history_type tht ON tht.id = th.history_type_id \
JOIN ticket_state ts ON ts.id = th.state_id \
JOIN ticket_state_type tst ON tst.id = ts.type_id \
JOIN queue q ON q.id = th.queue_id \
WHERE tht.name = 'StateUpdate' \
  AND tst.name = 'closed' \
  AND th.create_time >= NOW() - INTERVAL ? SECOND \
GROUP BY q.name";

/// [`TicketStore`] backed by a lazily connected MySQL pool.
#[derive(Clone)]
pub struct MySqlTicketStore {
    pool: MySqlPool,
}

impl MySqlTicketStore {
    /// Build the pool without connecting; the first query establishes it.
    ///
    /// Every new connection carries a server-side statement timeout equal to
    /// the query timeout, so a query abandoned on our side does not keep
    /// running on the server.
    pub fn connect_lazy(config: &DatabaseConfig) -> Result<Self, ConfigError> {
        let options = connect_options(config)?;
        let timeout = config.query_timeout();
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(timeout)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    apply_statement_timeout(conn, timeout).await;
                    Ok(())
                })
            })
            .connect_lazy_with(options);
        Ok(Self { pool })
    }

    async fn run_queries(
        tx: &mut Transaction<'_, MySql>,
        window_secs: i64,
    ) -> Result<Vec<QueueStats>, sqlx::Error> {
        let open: Vec<(String, i64, f64)> = sqlx::query_as(OPEN_TICKETS_SQL)
            .fetch_all(&mut **tx)
            .await?;
        let created: Vec<(String, i64)> = sqlx::query_as(CREATED_TICKETS_SQL)
            .bind(window_secs)
            .fetch_all(&mut **tx)
            .await?;
        let closed: Vec<(String, i64)> = sqlx::query_as(CLOSED_TICKETS_SQL)
            .bind(window_secs)
            .fetch_all(&mut **tx)
            .await?;

        Ok(merge_rows(open, created, closed))
    }
}

impl TicketStore for MySqlTicketStore {
    async fn queue_stats(&self, window: Duration) -> Result<Vec<QueueStats>, CollectionError> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx)?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx)?;

        let mut tx = Connection::begin(&mut *conn).await.map_err(map_sqlx)?;
        let window_secs = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
        let stats = Self::run_queries(&mut tx, window_secs)
            .await
            .map_err(map_sqlx)?;
        tx.rollback().await.map_err(map_sqlx)?;
        Ok(stats)
    }
}

fn connect_options(config: &DatabaseConfig) -> Result<MySqlConnectOptions, ConfigError> {
    if let Some(dsn) = &config.dsn {
        return MySqlConnectOptions::from_str(dsn)
            .map_err(|e| ConfigError::Invalid(format!("invalid database dsn: {e}")));
    }

    let mut options = MySqlConnectOptions::new()
        .database(&config.name)
        .username(&config.user);
    options = match config.host.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ConfigError::Invalid(format!("invalid database host {:?}", config.host)))?;
            options.host(host).port(port)
        }
        None => options.host(&config.host),
    };
    if let Some(password) = &config.password {
        options = options.password(password);
    }
    Ok(options)
}

/// MySQL spelling first (milliseconds), then MariaDB (seconds).
fn statement_timeout_sql(timeout: Duration) -> [String; 2] {
    [
        format!("SET SESSION max_execution_time = {}", timeout.as_millis()),
        format!("SET SESSION max_statement_time = {}", timeout.as_secs_f64()),
    ]
}

async fn apply_statement_timeout(conn: &mut MySqlConnection, timeout: Duration) {
    for sql in statement_timeout_sql(timeout) {
        match sqlx::query(&sql).execute(&mut *conn).await {
            Ok(_) => {
                debug!(%sql, "server statement timeout set");
                return;
            }
            Err(e) => debug!(%sql, error = %e, "statement timeout variable rejected"),
        }
    }
    warn!("server does not support a statement timeout, relying on client-side timeout");
}

/// Broken or unobtainable connections are worth one retry; anything else
/// (bad SQL, decode errors) is not.
fn map_sqlx(e: sqlx::Error) -> CollectionError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => CollectionError::ConnectionLost(e.to_string()),
        other => CollectionError::Query(other.to_string()),
    }
}

fn merge_rows(
    open: Vec<(String, i64, f64)>,
    created: Vec<(String, i64)>,
    closed: Vec<(String, i64)>,
) -> Vec<QueueStats> {
    let mut queues: BTreeMap<String, QueueStats> = BTreeMap::new();

    for (name, count, avg_age) in open {
        let q = queue_entry(&mut queues, name);
        q.open_tickets = count.max(0) as u64;
        q.avg_open_age_seconds = avg_age;
    }
    for (name, count) in created {
        queue_entry(&mut queues, name).created = count.max(0) as u64;
    }
    for (name, count) in closed {
        queue_entry(&mut queues, name).closed = count.max(0) as u64;
    }
    queues.into_values().collect()
}

fn queue_entry(queues: &mut BTreeMap<String, QueueStats>, name: String) -> &mut QueueStats {
    queues.entry(name.clone()).or_insert_with(|| QueueStats {
        queue: name,
        ..Default::default()
    })
}

/// Publishes per-queue ticket gauges.
pub struct TicketStatsCollector<S> {
    store: S,
    /// Window for the created/closed counts; matches the collection interval.
    window: Duration,
    query_timeout: Duration,
}

impl<S: TicketStore> TicketStatsCollector<S> {
    pub fn new(store: S, window: Duration, query_timeout: Duration) -> Self {
        Self {
            store,
            window,
            query_timeout,
        }
    }

    async fn fetch_once(&self) -> Result<Vec<QueueStats>, CollectionError> {
        tokio::time::timeout(self.query_timeout, self.store.queue_stats(self.window))
            .await
            .map_err(|_| CollectionError::QueryTimeout(self.query_timeout))?
    }

    async fn fetch(&self) -> Result<Vec<QueueStats>, CollectionError> {
        match self.fetch_once().await {
            Err(CollectionError::ConnectionLost(reason)) => {
                warn!(%reason, "database connection lost, retrying once");
                self.fetch_once().await
            }
            other => other,
        }
    }
}

impl<S: TicketStore> Collector for TicketStatsCollector<S> {
    fn name(&self) -> &str {
        "ticketstats"
    }

    fn timeout(&self) -> Duration {
        // Room for the one retry.
        self.query_timeout
            .saturating_mul(2)
            .saturating_add(Duration::from_secs(1))
    }

    async fn collect(&mut self) -> CollectorResult {
        let stats = self.fetch().await?;
        debug!(queues = stats.len(), "ticket statistics fetched");

        let mut samples = Vec::with_capacity(stats.len() * 4);
        for q in &stats {
            let queue = q.queue.as_str();
            samples.push(
                Sample::gauge("otrs_queue_open_tickets", q.open_tickets as f64)
                    .with_label("queue", queue),
            );
            samples.push(
                Sample::gauge("otrs_queue_open_ticket_age_seconds", q.avg_open_age_seconds)
                    .with_label("queue", queue),
            );
            samples.push(
                Sample::gauge("otrs_queue_tickets_created", q.created as f64)
                    .with_label("queue", queue),
            );
            samples.push(
                Sample::gauge("otrs_queue_tickets_closed", q.closed as f64)
                    .with_label("queue", queue),
            );
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Scripted store: pops one response per call.
    #[derive(Clone, Default)]
    struct ScriptedStore {
        responses: Arc<Mutex<Vec<Step>>>,
        calls: Arc<AtomicU32>,
    }

    #[derive(Clone)]
    enum Step {
        Rows(Vec<QueueStats>),
        Lost,
        Broken,
        Hang,
    }

    impl ScriptedStore {
        fn new(steps: Vec<Step>) -> Self {
            let mut steps = steps;
            steps.reverse();
            Self {
                responses: Arc::new(Mutex::new(steps)),
                calls: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    impl TicketStore for ScriptedStore {
        async fn queue_stats(&self, _window: Duration) -> Result<Vec<QueueStats>, CollectionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.responses.lock().unwrap().pop().unwrap_or(Step::Broken);
            match step {
                Step::Rows(rows) => Ok(rows),
                Step::Lost => Err(CollectionError::ConnectionLost("reset by peer".to_string())),
                Step::Broken => Err(CollectionError::Query("syntax error".to_string())),
                Step::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Vec::new())
                }
            }
        }
    }

    fn rows() -> Vec<QueueStats> {
        vec![
            QueueStats {
                queue: "Raw".to_string(),
                open_tickets: 12,
                avg_open_age_seconds: 3600.5,
                created: 3,
                closed: 1,
            },
            QueueStats {
                queue: "Junk".to_string(),
                open_tickets: 0,
                avg_open_age_seconds: 0.0,
                created: 0,
                closed: 4,
            },
        ]
    }

    fn collector(store: ScriptedStore) -> TicketStatsCollector<ScriptedStore> {
        TicketStatsCollector::new(store, Duration::from_secs(60), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn rows_map_to_queue_labeled_gauges() {
        let mut c = collector(ScriptedStore::new(vec![Step::Rows(rows())]));
        let samples = c.collect().await.unwrap();

        assert_eq!(samples.len(), 8);
        assert!(otrs_core::find_duplicate(&samples).is_none());
        let open_raw = samples
            .iter()
            .find(|s| s.name() == "otrs_queue_open_tickets" && s.labels()["queue"] == "Raw")
            .unwrap();
        assert_eq!(open_raw.value(), 12.0);
        let age_raw = samples
            .iter()
            .find(|s| s.name() == "otrs_queue_open_ticket_age_seconds" && s.labels()["queue"] == "Raw")
            .unwrap();
        assert_eq!(age_raw.value(), 3600.5);
    }

    #[tokio::test]
    async fn connection_loss_is_retried_once() {
        let store = ScriptedStore::new(vec![Step::Lost, Step::Rows(rows())]);
        let calls = Arc::clone(&store.calls);
        let mut c = collector(store);

        assert_eq!(c.collect().await.unwrap().len(), 8);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_connection_loss_fails_cycle() {
        let store = ScriptedStore::new(vec![Step::Lost, Step::Lost, Step::Rows(rows())]);
        let calls = Arc::clone(&store.calls);
        let mut c = collector(store);

        let err = c.collect().await.unwrap_err();
        assert!(matches!(err, CollectionError::ConnectionLost(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn query_errors_are_not_retried() {
        let store = ScriptedStore::new(vec![Step::Broken, Step::Rows(rows())]);
        let calls = Arc::clone(&store.calls);
        let mut c = collector(store);

        assert!(matches!(c.collect().await.unwrap_err(), CollectionError::Query(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_query_times_out() {
        let mut c = collector(ScriptedStore::new(vec![Step::Hang]));
        let err = c.collect().await.unwrap_err();
        assert!(matches!(err, CollectionError::QueryTimeout(d) if d == Duration::from_secs(5)));
    }

    #[test]
    fn merge_rows_joins_by_queue() {
        let merged = merge_rows(
            vec![("Raw".to_string(), 5, 10.0), ("Misc".to_string(), 0, 0.0)],
            vec![("Raw".to_string(), 2)],
            vec![("Postmaster".to_string(), 1)],
        );
        let names: Vec<&str> = merged.iter().map(|q| q.queue.as_str()).collect();
        assert_eq!(names, vec!["Misc", "Postmaster", "Raw"]);
        let raw = merged.iter().find(|q| q.queue == "Raw").unwrap();
        assert_eq!((raw.open_tickets, raw.created, raw.closed), (5, 2, 0));
        let pm = merged.iter().find(|q| q.queue == "Postmaster").unwrap();
        assert_eq!(pm.closed, 1);
    }

    #[test]
    fn connect_options_from_components() {
        let config = DatabaseConfig {
            host: "db.internal:3307".to_string(),
            password: Some("secret".to_string()),
            ..Default::default()
        };
        assert!(connect_options(&config).is_ok());

        let config = DatabaseConfig {
            host: "db.internal:port".to_string(),
            ..Default::default()
        };
        assert!(connect_options(&config).is_err());

        let config = DatabaseConfig {
            dsn: Some("not a dsn".to_string()),
            ..Default::default()
        };
        assert!(connect_options(&config).is_err());
    }

    #[test]
    fn closed_count_comes_from_state_history() {
        assert!(CLOSED_TICKETS_SQL.contains("FROM ticket_history th"));
        assert!(CLOSED_TICKETS_SQL.contains("tht.name = 'StateUpdate'"));
        assert!(CLOSED_TICKETS_SQL.contains("COUNT(DISTINCT th.ticket_id)"));
        assert!(!CLOSED_TICKETS_SQL.contains("change_time"));
        assert_eq!(CLOSED_TICKETS_SQL.matches('?').count(), 1);
        assert!(!OPEN_TICKETS_SQL.contains("AS DOUBLE"));
    }

    #[test]
    fn statement_timeout_for_both_servers() {
        let [mysql, mariadb] = statement_timeout_sql(Duration::from_secs(5));
        assert_eq!(mysql, "SET SESSION max_execution_time = 5000");
        assert_eq!(mariadb, "SET SESSION max_statement_time = 5");
    }

    #[test]
    fn huge_query_timeout_saturates() {
        let c = TicketStatsCollector::new(ScriptedStore::default(), Duration::from_secs(60), Duration::MAX);
        assert_eq!(c.timeout(), Duration::MAX);
    }

    #[test]
    fn sqlx_errors_classified() {
        assert!(matches!(map_sqlx(sqlx::Error::PoolTimedOut), CollectionError::ConnectionLost(_)));
        assert!(matches!(map_sqlx(sqlx::Error::RowNotFound), CollectionError::Query(_)));
    }
}
