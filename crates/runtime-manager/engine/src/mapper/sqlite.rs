//! SQLite binding store.
//!
//! Bindings and event interest survive restarts, so sessions can be released
//! from memory and reloaded by id; `holds_session` keeps its default.

use async_trait::async_trait;
use chrono::Utc;
use runtime_manager_types::{
    Context, CorrelationKey, InstanceId, ManagerId, Mapper, MapperError, MapperResult, SessionId,
};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

/// SQLite-backed binding store
#[derive(Clone)]
pub struct SqliteMapper {
    pool: SqlitePool,
}

impl SqliteMapper {
    /// Connect and initialize the schema
    pub async fn connect(database_url: &str) -> MapperResult<Self> {
        Self::connect_with_options(database_url, 5).await
    }

    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
    ) -> MapperResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| MapperError::Backend(format!("failed to connect sqlite: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Create the store from an existing pool
    pub async fn from_pool(pool: SqlitePool) -> MapperResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> MapperResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS runtime_manager_bindings (
                manager_id TEXT NOT NULL,
                context_kind TEXT NOT NULL,
                context_value TEXT NOT NULL,
                session_id INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (manager_id, context_kind, context_value)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS runtime_manager_bindings_session
                ON runtime_manager_bindings (manager_id, session_id)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS runtime_manager_session_claims (
                manager_id TEXT NOT NULL,
                session_id INTEGER NOT NULL,
                context_kind TEXT NOT NULL,
                context_value TEXT NOT NULL,
                PRIMARY KEY (manager_id, session_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS runtime_manager_event_interest (
                manager_id TEXT NOT NULL,
                context_kind TEXT NOT NULL,
                context_value TEXT NOT NULL,
                event_type TEXT NOT NULL,
                registered_at TEXT NOT NULL,
                PRIMARY KEY (manager_id, context_kind, context_value, event_type)
            )
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| MapperError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

fn to_db_id(session: SessionId) -> MapperResult<i64> {
    i64::try_from(session.0)
        .map_err(|_| MapperError::InvalidInput(format!("{session} does not fit in a sqlite integer")))
}

fn row_to_session(row: &SqliteRow) -> MapperResult<SessionId> {
    let raw: i64 = row
        .try_get("session_id")
        .map_err(|e| MapperError::Serialization(e.to_string()))?;
    u64::try_from(raw)
        .map(SessionId)
        .map_err(|_| MapperError::Serialization(format!("negative session id {raw}")))
}

fn row_to_context(row: &SqliteRow) -> MapperResult<Context> {
    let kind: String = row
        .try_get("context_kind")
        .map_err(|e| MapperError::Serialization(e.to_string()))?;
    let value: String = row
        .try_get("context_value")
        .map_err(|e| MapperError::Serialization(e.to_string()))?;
    Context::from_parts(&kind, &value)
        .ok_or_else(|| MapperError::Serialization(format!("unknown context {kind}:{value}")))
}

#[async_trait]
impl Mapper for SqliteMapper {
    async fn find_mapping(
        &self,
        context: &Context,
        manager: &ManagerId,
    ) -> MapperResult<Option<SessionId>> {
        let row = sqlx::query(
            r#"
            SELECT session_id
              FROM runtime_manager_bindings
             WHERE manager_id = ? AND context_kind = ? AND context_value = ?
            "#,
        )
        .bind(manager.as_str())
        .bind(context.kind())
        .bind(context.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MapperError::Backend(e.to_string()))?;

        row.as_ref().map(row_to_session).transpose()
    }

    async fn save_mapping(
        &self,
        context: &Context,
        session: SessionId,
        manager: &ManagerId,
    ) -> MapperResult<()> {
        if context.is_empty() {
            return Err(MapperError::InvalidInput(
                "the empty context cannot be bound".to_string(),
            ));
        }
        let session_id = to_db_id(session)?;

        // The claim is written first, so the transaction holds the write
        // lock for the check and the binding
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MapperError::Backend(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO runtime_manager_session_claims
                (manager_id, session_id, context_kind, context_value)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (manager_id, session_id)
            DO UPDATE SET context_kind = excluded.context_kind,
                          context_value = excluded.context_value
             WHERE runtime_manager_session_claims.context_kind = 'correlation'
               AND excluded.context_kind = 'instance'
            "#,
        )
        .bind(manager.as_str())
        .bind(session_id)
        .bind(context.kind())
        .bind(context.value())
        .execute(&mut *tx)
        .await
        .map_err(|e| MapperError::Backend(e.to_string()))?;

        let claim = sqlx::query(
            r#"
            SELECT context_kind, context_value
              FROM runtime_manager_session_claims
             WHERE manager_id = ? AND session_id = ?
            "#,
        )
        .bind(manager.as_str())
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| MapperError::Backend(e.to_string()))?;
        let owner = row_to_context(&claim)?;
        if &owner != context {
            return Err(MapperError::Conflict(format!(
                "{session} already serves {owner}"
            )));
        }

        let previous = sqlx::query(
            r#"
            SELECT session_id
              FROM runtime_manager_bindings
             WHERE manager_id = ? AND context_kind = ? AND context_value = ?
            "#,
        )
        .bind(manager.as_str())
        .bind(context.kind())
        .bind(context.value())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| MapperError::Backend(e.to_string()))?;
        if let Some(previous) = previous.as_ref().map(row_to_session).transpose()? {
            if previous != session {
                sqlx::query(
                    r#"
                    DELETE FROM runtime_manager_session_claims
                     WHERE manager_id = ? AND session_id = ?
                       AND context_kind = ? AND context_value = ?
                    "#,
                )
                .bind(manager.as_str())
                .bind(to_db_id(previous)?)
                .bind(context.kind())
                .bind(context.value())
                .execute(&mut *tx)
                .await
                .map_err(|e| MapperError::Backend(e.to_string()))?;
            }
        }

        sqlx::query(
            r#"
            INSERT INTO runtime_manager_bindings
                (manager_id, context_kind, context_value, session_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (manager_id, context_kind, context_value)
            DO UPDATE SET session_id = excluded.session_id,
                          created_at = excluded.created_at
            "#,
        )
        .bind(manager.as_str())
        .bind(context.kind())
        .bind(context.value())
        .bind(session_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| MapperError::Backend(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| MapperError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn save_alias(
        &self,
        key: &CorrelationKey,
        instance: InstanceId,
        manager: &ManagerId,
    ) -> MapperResult<()> {
        let owner = Context::InstanceId(instance);
        let session = self
            .find_mapping(&owner, manager)
            .await?
            .ok_or_else(|| MapperError::InvalidInput(format!("{owner} is not bound")))?;

        let alias = Context::CorrelationKey(key.clone());
        sqlx::query(
            r#"
            INSERT INTO runtime_manager_bindings
                (manager_id, context_kind, context_value, session_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (manager_id, context_kind, context_value) DO NOTHING
            "#,
        )
        .bind(manager.as_str())
        .bind(alias.kind())
        .bind(alias.value())
        .bind(to_db_id(session)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| MapperError::Backend(e.to_string()))?;

        match self.find_mapping(&alias, manager).await? {
            Some(bound) if bound != session => Err(MapperError::Conflict(format!(
                "{alias} is bound to {bound}, not to {owner}"
            ))),
            _ => Ok(()),
        }
    }

    async fn remove_mapping(&self, context: &Context, manager: &ManagerId) -> MapperResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MapperError::Backend(e.to_string()))?;

        sqlx::query(
            r#"
            DELETE FROM runtime_manager_session_claims
             WHERE manager_id = ? AND context_kind = ? AND context_value = ?
            "#,
        )
        .bind(manager.as_str())
        .bind(context.kind())
        .bind(context.value())
        .execute(&mut *tx)
        .await
        .map_err(|e| MapperError::Backend(e.to_string()))?;

        sqlx::query(
            r#"
            DELETE FROM runtime_manager_bindings
             WHERE manager_id = ? AND context_kind = ? AND context_value = ?
            "#,
        )
        .bind(manager.as_str())
        .bind(context.kind())
        .bind(context.value())
        .execute(&mut *tx)
        .await
        .map_err(|e| MapperError::Backend(e.to_string()))?;

        sqlx::query(
            r#"
            DELETE FROM runtime_manager_event_interest
             WHERE manager_id = ? AND context_kind = ? AND context_value = ?
            "#,
        )
        .bind(manager.as_str())
        .bind(context.kind())
        .bind(context.value())
        .execute(&mut *tx)
        .await
        .map_err(|e| MapperError::Backend(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| MapperError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn find_contexts_waiting_for_event(
        &self,
        event_type: &str,
        manager: &ManagerId,
    ) -> MapperResult<Vec<Context>> {
        let rows = sqlx::query(
            r#"
            SELECT context_kind, context_value
              FROM runtime_manager_event_interest
             WHERE manager_id = ? AND event_type = ?
             ORDER BY rowid
            "#,
        )
        .bind(manager.as_str())
        .bind(event_type)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MapperError::Backend(e.to_string()))?;

        rows.iter().map(row_to_context).collect()
    }

    async fn find_context_id(
        &self,
        session: SessionId,
        manager: &ManagerId,
    ) -> MapperResult<Option<Context>> {
        let row = sqlx::query(
            r#"
            SELECT context_kind, context_value
              FROM runtime_manager_session_claims
             WHERE manager_id = ? AND session_id = ?
            "#,
        )
        .bind(manager.as_str())
        .bind(to_db_id(session)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MapperError::Backend(e.to_string()))?;

        row.as_ref().map(row_to_context).transpose()
    }

    async fn find_sessions_pending_init(
        &self,
        manager: &ManagerId,
    ) -> MapperResult<Vec<SessionId>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT session_id
              FROM runtime_manager_bindings
             WHERE manager_id = ?
             ORDER BY session_id
            "#,
        )
        .bind(manager.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MapperError::Backend(e.to_string()))?;

        rows.iter().map(row_to_session).collect()
    }

    async fn register_event_interest(
        &self,
        context: &Context,
        event_type: &str,
        manager: &ManagerId,
    ) -> MapperResult<()> {
        sqlx::query(
            r#"
            INSERT INTO runtime_manager_event_interest
                (manager_id, context_kind, context_value, event_type, registered_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (manager_id, context_kind, context_value, event_type) DO NOTHING
            "#,
        )
        .bind(manager.as_str())
        .bind(context.kind())
        .bind(context.value())
        .bind(event_type)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| MapperError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn clear_event_interest(
        &self,
        context: &Context,
        event_type: &str,
        manager: &ManagerId,
    ) -> MapperResult<()> {
        sqlx::query(
            r#"
            DELETE FROM runtime_manager_event_interest
             WHERE manager_id = ? AND context_kind = ? AND context_value = ? AND event_type = ?
            "#,
        )
        .bind(manager.as_str())
        .bind(context.kind())
        .bind(context.value())
        .bind(event_type)
        .execute(&self.pool)
        .await
        .map_err(|e| MapperError::Backend(e.to_string()))?;
        Ok(())
    }
}
