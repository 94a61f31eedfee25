use std::sync::Arc;
use std::time::Duration;

use diesel::connection::SimpleConnection;
use diesel::r2d2::{self, ConnectionManager, CustomizeConnection};
use diesel::sql_types::Text;
use diesel::sqlite::SqliteConnection;
use diesel::{QueryableByName, RunQueryDsl};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::db::sqlite::{SqliteAlertStore, SqlitePool, WRITE_LOCK_TIMEOUT_SECS};
use crate::db::{AlertStore, DatabaseError};

/// Applied to every pooled connection.
#[derive(Debug)]
struct SqlitePragmas;

impl CustomizeConnection<SqliteConnection, r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), r2d2::Error> {
        conn.batch_execute(
            "PRAGMA busy_timeout = 10000; PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;",
        )
        .map_err(r2d2::Error::QueryError)
    }
}

#[derive(QueryableByName)]
struct ColumnInfo {
    #[diesel(sql_type = Text)]
    name: String,
}

/// Columns added after the first release; created with a NULL default.
const ALERT_COLUMN_MIGRATIONS: [(&str, &str); 2] =
    [("creator_id", "INTEGER"), ("team", "INTEGER")];

#[derive(Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
    alert_store: Arc<dyn AlertStore>,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let manager = ConnectionManager::<SqliteConnection>::new(config.path.clone());
        let pool = r2d2::Pool::builder()
            .max_size(config.max_connections.max(1))
            .connection_timeout(Duration::from_secs(WRITE_LOCK_TIMEOUT_SECS))
            .connection_customizer(Box::new(SqlitePragmas))
            .build(manager)
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        let alert_store = Arc::new(SqliteAlertStore::new(pool.clone()));

        Ok(Self { pool, alert_store })
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;

            let statements = [
                r#"
                CREATE TABLE IF NOT EXISTS alerts (
                    message_id INTEGER PRIMARY KEY,
                    guild_id INTEGER NOT NULL,
                    channel_id INTEGER NOT NULL,
                    created_ts INTEGER NOT NULL,
                    outcome TEXT,
                    incomplete INTEGER NOT NULL DEFAULT 0,
                    last_ts INTEGER NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS participants (
                    message_id INTEGER NOT NULL,
                    user_id INTEGER NOT NULL,
                    added_by INTEGER,
                    source TEXT NOT NULL DEFAULT 'reaction',
                    ts INTEGER NOT NULL,
                    PRIMARY KEY (message_id, user_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS counters (
                    guild_id INTEGER NOT NULL,
                    kind TEXT NOT NULL,
                    user_id INTEGER NOT NULL,
                    count INTEGER NOT NULL,
                    PRIMARY KEY (guild_id, kind, user_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS board_posts (
                    guild_id INTEGER NOT NULL,
                    kind TEXT NOT NULL,
                    channel_id INTEGER NOT NULL,
                    message_id INTEGER NOT NULL,
                    PRIMARY KEY (guild_id, kind)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS aggregate_seeds (
                    guild_id INTEGER NOT NULL,
                    scope TEXT NOT NULL,
                    attacks INTEGER NOT NULL DEFAULT 0,
                    wins INTEGER NOT NULL DEFAULT 0,
                    losses INTEGER NOT NULL DEFAULT 0,
                    incomplete INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (guild_id, scope)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS hourly_seeds (
                    guild_id INTEGER PRIMARY KEY,
                    morning INTEGER NOT NULL DEFAULT 0,
                    afternoon INTEGER NOT NULL DEFAULT 0,
                    evening INTEGER NOT NULL DEFAULT 0,
                    night INTEGER NOT NULL DEFAULT 0
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_alerts_guild ON alerts(guild_id)",
                "CREATE INDEX IF NOT EXISTS idx_participants_user ON participants(user_id)",
                "CREATE INDEX IF NOT EXISTS idx_board_posts_message ON board_posts(message_id)",
            ];

            for statement in statements {
                diesel::sql_query(statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            let existing = diesel::sql_query("PRAGMA table_info(alerts)")
                .load::<ColumnInfo>(&mut conn)
                .map_err(|e| DatabaseError::Migration(e.to_string()))?;

            for (column, sql_type) in ALERT_COLUMN_MIGRATIONS {
                if existing.iter().any(|info| info.name == column) {
                    continue;
                }
                info!(column, "adding missing column to alerts");
                diesel::sql_query(format!("ALTER TABLE alerts ADD COLUMN {column} {sql_type}"))
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    pub fn alert_store(&self) -> Arc<dyn AlertStore> {
        self.alert_store.clone()
    }
}

#[cfg(test)]
mod tests {
    use diesel::connection::SimpleConnection;
    use diesel::{Connection, sqlite::SqliteConnection};
    use tempfile::NamedTempFile;

    use super::DatabaseManager;
    use crate::config::DatabaseConfig;
    use crate::db::{CounterKind, ParticipantSource};
    use crate::testing::alert;

    fn config_for(file: &NamedTempFile) -> DatabaseConfig {
        DatabaseConfig {
            path: file.path().to_string_lossy().to_string(),
            max_connections: 2,
        }
    }

    #[tokio::test]
    async fn legacy_alerts_table_gains_new_columns() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        {
            let mut conn = SqliteConnection::establish(&file.path().to_string_lossy())
                .expect("raw connection");
            conn.batch_execute(
                "CREATE TABLE alerts (
                    message_id INTEGER PRIMARY KEY,
                    guild_id INTEGER NOT NULL,
                    channel_id INTEGER NOT NULL,
                    created_ts INTEGER NOT NULL,
                    outcome TEXT,
                    incomplete INTEGER NOT NULL DEFAULT 0,
                    last_ts INTEGER NOT NULL
                );
                INSERT INTO alerts VALUES (1, 900, 5, 1700000000, 'win', 0, 1700000000);",
            )
            .expect("legacy schema");
        }

        let manager = DatabaseManager::new(&config_for(&file))
            .await
            .expect("db manager");
        manager.migrate().await.expect("migrate");
        manager.migrate().await.expect("migrate is idempotent");

        let store = manager.alert_store();
        let legacy = store.get_alert(1).await.expect("get").expect("legacy row");
        assert_eq!(legacy.creator_id, None);
        assert_eq!(legacy.team, None);

        let mut record = alert(2, 900, Some(10));
        record.team = Some(1);
        store.record_alert(&record).await.expect("record");
        assert_eq!(
            store.get_alert(2).await.expect("get").expect("new row").team,
            Some(1)
        );
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let config = config_for(&file);

        let manager = DatabaseManager::new(&config).await.expect("db manager");
        manager.migrate().await.expect("migrate");
        let store = manager.alert_store();
        store.record_alert(&alert(1, 900, Some(10))).await.expect("alert");
        store
            .join_defense(1, 900, 20, Some(20), ParticipantSource::Reaction)
            .await
            .expect("join");
        drop(store);
        drop(manager);

        let reopened = DatabaseManager::new(&config).await.expect("reopen");
        reopened.migrate().await.expect("migrate reopened");
        let store = reopened.alert_store();
        assert_eq!(store.list_participants(1).await.expect("list").len(), 1);
        assert_eq!(
            store
                .get_top(900, CounterKind::Defense, 10)
                .await
                .expect("top")
                .len(),
            1
        );
    }
}
