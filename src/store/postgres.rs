//! PostgreSQL work store
//!
//! Every mutation is one `UPDATE ... WHERE <expected state> RETURNING id`, so
//! concurrent engines racing for a ticket see exactly one winner.

use super::error::{StoreError, StoreResult};
use super::traits::WorkStore;
use super::types::{
    AssigneeType, StepExecutionRecord, Ticket, TicketEvent, TicketState, TicketUpdate,
    LEASE_PLACEHOLDER,
};
use super::PostgresConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const TICKET_COLUMNS: &str = "id, session_id, title, description, acceptance_criteria, state, \
    depends_on, assignee_id, assignee_type, lease_id, retry_count, retry_after, \
    verification_status, sentinel_feedback, hold_reason, inputs, workflow, branch_name, \
    repo_url, pr_url, outputs, evidence, created_at, updated_at, last_heartbeat, completed_at";

pub struct PgWorkStore {
    pool: PgPool,
    schema: String,
}

impl PgWorkStore {
    pub async fn connect(config: &PostgresConfig) -> StoreResult<Self> {
        if !is_identifier(&config.schema) {
            return Err(StoreError::Connection(format!(
                "Invalid schema name '{}'",
                config.schema
            )));
        }

        info!("Connecting to PostgreSQL work store");
        let connect_options = PgConnectOptions::from_str(&config.url)
            .map_err(|e| StoreError::Connection(format!("Invalid connection string: {}", e)))?
            .statement_cache_capacity(100);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(Duration::from_secs(600)))
            .test_before_acquire(true)
            .connect_with(connect_options)
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to connect: {}", e)))?;

        let store = Self {
            pool,
            schema: config.schema.clone(),
        };
        if config.create_schema {
            store.initialize_schema().await?;
        }
        Ok(store)
    }

    /// Create the tables the engine reads and writes, if missing
    async fn initialize_schema(&self) -> StoreResult<()> {
        info!("Initializing PostgreSQL schema: {}", self.schema);
        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {}.tickets (
                    id TEXT PRIMARY KEY,
                    session_id TEXT,
                    title TEXT NOT NULL DEFAULT '',
                    description TEXT NOT NULL DEFAULT '',
                    acceptance_criteria JSONB NOT NULL DEFAULT '[]',
                    state TEXT NOT NULL,
                    depends_on TEXT[] NOT NULL DEFAULT '{{}}',
                    assignee_id TEXT,
                    assignee_type TEXT,
                    lease_id BIGINT,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    retry_after TIMESTAMPTZ,
                    verification_status TEXT,
                    sentinel_feedback JSONB,
                    hold_reason TEXT,
                    inputs JSONB NOT NULL DEFAULT '{{}}',
                    workflow JSONB,
                    branch_name TEXT,
                    repo_url TEXT,
                    pr_url TEXT,
                    outputs JSONB,
                    evidence JSONB,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    last_heartbeat TIMESTAMPTZ,
                    completed_at TIMESTAMPTZ
                )
                "#,
                self.schema
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS tickets_state_idx ON {}.tickets (state, created_at)",
                self.schema
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {}.ticket_events (
                    id BIGSERIAL PRIMARY KEY,
                    ticket_id TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    from_state TEXT,
                    to_state TEXT,
                    data JSONB NOT NULL DEFAULT '{{}}',
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
                self.schema
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {}.step_executions (
                    id UUID PRIMARY KEY,
                    ticket_id TEXT,
                    run_id TEXT NOT NULL,
                    step_id TEXT NOT NULL,
                    agent TEXT NOT NULL,
                    status TEXT NOT NULL,
                    slot INTEGER,
                    started_at TIMESTAMPTZ NOT NULL,
                    finished_at TIMESTAMPTZ,
                    error TEXT
                )
                "#,
                self.schema
            ),
        ];

        for statement in statements {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(sql_error)?;
        }
        Ok(())
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", self.schema, name)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn sql_error(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut => StoreError::Connection("pool acquire timed out".to_string()),
        sqlx::Error::Io(io) => StoreError::Connection(io.to_string()),
        other => StoreError::query(other),
    }
}

fn row_to_ticket(row: &PgRow) -> StoreResult<Ticket> {
    let get_json = |column: &str| -> StoreResult<Option<JsonValue>> {
        row.try_get::<Option<JsonValue>, _>(column).map_err(sql_error)
    };

    let state: String = row.try_get("state").map_err(sql_error)?;
    let assignee_type: Option<String> = row.try_get("assignee_type").map_err(sql_error)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(sql_error)?;
    let acceptance_criteria = match get_json("acceptance_criteria")? {
        Some(value) => serde_json::from_value(value).map_err(StoreError::serialization)?,
        None => Vec::new(),
    };
    let workflow = match get_json("workflow")? {
        Some(JsonValue::Null) | None => None,
        Some(value) => Some(serde_json::from_value(value).map_err(StoreError::serialization)?),
    };

    Ok(Ticket {
        id: row.try_get("id").map_err(sql_error)?,
        session_id: row.try_get("session_id").map_err(sql_error)?,
        title: row.try_get("title").map_err(sql_error)?,
        description: row.try_get("description").map_err(sql_error)?,
        acceptance_criteria,
        state: TicketState::from_str(&state).map_err(StoreError::Serialization)?,
        depends_on: row.try_get("depends_on").map_err(sql_error)?,
        assignee_id: row.try_get("assignee_id").map_err(sql_error)?,
        assignee_type: assignee_type
            .as_deref()
            .map(AssigneeType::from_str)
            .transpose()
            .map_err(StoreError::Serialization)?,
        lease_id: row.try_get("lease_id").map_err(sql_error)?,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        retry_after: row.try_get("retry_after").map_err(sql_error)?,
        verification_status: row.try_get("verification_status").map_err(sql_error)?,
        sentinel_feedback: get_json("sentinel_feedback")?,
        hold_reason: row.try_get("hold_reason").map_err(sql_error)?,
        inputs: get_json("inputs")?.unwrap_or(JsonValue::Null),
        workflow,
        branch_name: row.try_get("branch_name").map_err(sql_error)?,
        repo_url: row.try_get("repo_url").map_err(sql_error)?,
        pr_url: row.try_get("pr_url").map_err(sql_error)?,
        outputs: get_json("outputs")?,
        evidence: get_json("evidence")?,
        created_at: row.try_get("created_at").map_err(sql_error)?,
        updated_at: row.try_get("updated_at").map_err(sql_error)?,
        last_heartbeat: row.try_get("last_heartbeat").map_err(sql_error)?,
        completed_at: row.try_get("completed_at").map_err(sql_error)?,
    })
}

/// Append `SET` assignments for every field the update touches
fn push_update(qb: &mut QueryBuilder<'_, Postgres>, update: &TicketUpdate) {
    if let Some(lease_id) = update.lease_id {
        qb.push(", lease_id = ").push_bind(lease_id);
    }
    if let Some(assignee_id) = &update.assignee_id {
        qb.push(", assignee_id = ").push_bind(assignee_id.clone());
    }
    if let Some(retry_count) = update.retry_count {
        qb.push(", retry_count = ")
            .push_bind(i32::try_from(retry_count).unwrap_or(i32::MAX));
    }
    if let Some(retry_after) = update.retry_after {
        qb.push(", retry_after = ").push_bind(retry_after);
    }
    if let Some(status) = &update.verification_status {
        qb.push(", verification_status = ").push_bind(status.clone());
    }
    if let Some(feedback) = &update.sentinel_feedback {
        qb.push(", sentinel_feedback = ").push_bind(feedback.clone());
    }
    if let Some(reason) = &update.hold_reason {
        qb.push(", hold_reason = ").push_bind(reason.clone());
    }
    if let Some(outputs) = &update.outputs {
        qb.push(", outputs = ").push_bind(outputs.clone());
    }
    if let Some(evidence) = &update.evidence {
        qb.push(", evidence = ").push_bind(evidence.clone());
    }
    if let Some(completed_at) = update.completed_at {
        qb.push(", completed_at = ").push_bind(completed_at);
    }
}

#[async_trait]
impl WorkStore for PgWorkStore {
    async fn fetch_claimable(&self, limit: usize, now: DateTime<Utc>) -> StoreResult<Vec<Ticket>> {
        let query = format!(
            "SELECT {} FROM {} \
             WHERE state = 'ready' AND assignee_id IS NOT NULL AND assignee_type = 'agent' \
               AND lease_id IS NULL AND (retry_after IS NULL OR retry_after <= $1) \
             ORDER BY created_at ASC LIMIT $2",
            TICKET_COLUMNS,
            self.table("tickets")
        );
        let rows = sqlx::query(&query)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(sql_error)?;
        rows.iter().map(row_to_ticket).collect()
    }

    async fn claim(&self, id: &str) -> StoreResult<bool> {
        let query = format!(
            "UPDATE {} SET state = 'in_progress', lease_id = $2, updated_at = NOW() \
             WHERE id = $1 AND state = 'ready' AND lease_id IS NULL RETURNING id",
            self.table("tickets")
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(LEASE_PLACEHOLDER)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_error)?;
        Ok(row.is_some())
    }

    async fn transition(
        &self,
        id: &str,
        from: &[TicketState],
        to: TicketState,
        update: TicketUpdate,
    ) -> StoreResult<bool> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "UPDATE {} SET state = ",
            self.table("tickets")
        ));
        qb.push_bind(to.as_str()).push(", updated_at = NOW()");
        push_update(&mut qb, &update);
        qb.push(" WHERE id = ")
            .push_bind(id)
            .push(" AND state = ANY(")
            .push_bind(from)
            .push(") RETURNING id");

        let row = qb
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_error)?;
        if row.is_none() {
            debug!("Transition of {} to {} skipped: state changed", id, to);
        }
        Ok(row.is_some())
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Ticket>> {
        let query = format!(
            "SELECT {} FROM {} WHERE id = $1",
            TICKET_COLUMNS,
            self.table("tickets")
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_error)?;
        row.as_ref().map(row_to_ticket).transpose()
    }

    async fn set_lease(&self, id: &str, slot: i64) -> StoreResult<bool> {
        let query = format!(
            "UPDATE {} SET lease_id = $2, updated_at = NOW() \
             WHERE id = $1 AND state = ANY($3) RETURNING id",
            self.table("tickets")
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(slot)
            .bind(leased_states())
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_error)?;
        Ok(row.is_some())
    }

    async fn reset_lease(&self, id: &str, slot: i64) -> StoreResult<bool> {
        let query = format!(
            "UPDATE {} SET lease_id = $3, updated_at = NOW() \
             WHERE id = $1 AND lease_id = $2 AND state = ANY($4) RETURNING id",
            self.table("tickets")
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(slot)
            .bind(LEASE_PLACEHOLDER)
            .bind(leased_states())
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_error)?;
        Ok(row.is_some())
    }

    async fn running_slots(&self, ticket_id: &str) -> StoreResult<Vec<u32>> {
        let query = format!(
            "SELECT DISTINCT slot FROM {} \
             WHERE ticket_id = $1 AND status = 'running' AND slot IS NOT NULL ORDER BY slot",
            self.table("step_executions")
        );
        let slots: Vec<i32> = sqlx::query_scalar(&query)
            .bind(ticket_id)
            .fetch_all(&self.pool)
            .await
            .map_err(sql_error)?;
        Ok(slots
            .into_iter()
            .filter_map(|slot| u32::try_from(slot).ok())
            .collect())
    }

    async fn promote_unblocked(&self) -> StoreResult<Vec<String>> {
        let tickets = self.table("tickets");
        let query = format!(
            "UPDATE {tickets} t SET state = 'ready', updated_at = NOW() \
             WHERE t.state = 'blocked' AND NOT EXISTS ( \
                 SELECT 1 FROM unnest(t.depends_on) AS dep(id) \
                 LEFT JOIN {tickets} d ON d.id = dep.id \
                 WHERE d.state IS DISTINCT FROM 'done') \
             RETURNING t.id",
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(sql_error)?;
        let mut ids = rows
            .iter()
            .map(|row| row.try_get::<String, _>("id").map_err(sql_error))
            .collect::<StoreResult<Vec<_>>>()?;
        ids.sort();
        Ok(ids)
    }

    async fn heartbeat(&self, id: &str) -> StoreResult<()> {
        let query = format!(
            "UPDATE {} SET last_heartbeat = NOW() \
             WHERE id = $1 AND state IN ('in_progress', 'verifying', 'reviewing')",
            self.table("tickets")
        );
        sqlx::query(&query)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sql_error)?;
        Ok(())
    }

    async fn fetch_review_candidates(
        &self,
        sentinel_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<Ticket>> {
        let query = format!(
            "SELECT {} FROM {} \
             WHERE state = 'in_review' AND assignee_id = $1 AND lease_id IS NULL \
             ORDER BY updated_at ASC LIMIT $2",
            TICKET_COLUMNS,
            self.table("tickets")
        );
        let rows = sqlx::query(&query)
            .bind(sentinel_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(sql_error)?;
        rows.iter().map(row_to_ticket).collect()
    }

    async fn claim_review(&self, id: &str, sentinel_id: &str) -> StoreResult<bool> {
        let query = format!(
            "UPDATE {} SET state = 'reviewing', lease_id = $3, updated_at = NOW() \
             WHERE id = $1 AND state = 'in_review' AND assignee_id = $2 AND lease_id IS NULL \
             RETURNING id",
            self.table("tickets")
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(sentinel_id)
            .bind(LEASE_PLACEHOLDER)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_error)?;
        Ok(row.is_some())
    }

    async fn record_event(&self, event: TicketEvent) -> StoreResult<()> {
        let query = format!(
            "INSERT INTO {} (ticket_id, event_type, from_state, to_state, data, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.table("ticket_events")
        );
        sqlx::query(&query)
            .bind(&event.ticket_id)
            .bind(&event.event_type)
            .bind(event.from_state.map(|s| s.as_str()))
            .bind(event.to_state.map(|s| s.as_str()))
            .bind(&event.data)
            .bind(event.created_at)
            .execute(&self.pool)
            .await
            .map_err(sql_error)?;
        Ok(())
    }

    async fn record_step(&self, record: &StepExecutionRecord) -> StoreResult<()> {
        let query = format!(
            "INSERT INTO {} (id, ticket_id, run_id, step_id, agent, status, slot, started_at, finished_at, error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (id) DO UPDATE \
             SET status = $6, slot = $7, finished_at = $9, error = $10",
            self.table("step_executions")
        );
        sqlx::query(&query)
            .bind(record.id)
            .bind(&record.ticket_id)
            .bind(&record.run_id)
            .bind(&record.step_id)
            .bind(&record.agent)
            .bind(record.status.as_str())
            .bind(record.slot.map(|s| i32::try_from(s).unwrap_or(i32::MAX)))
            .bind(record.started_at)
            .bind(record.finished_at)
            .bind(&record.error)
            .execute(&self.pool)
            .await
            .map_err(sql_error)?;
        Ok(())
    }
}

fn leased_states() -> Vec<String> {
    TicketState::LEASED
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_identifier_validation() {
        assert!(is_identifier("public"));
        assert!(is_identifier("swarm_2"));
        assert!(!is_identifier("2swarm"));
        assert!(!is_identifier("public; DROP TABLE tickets"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn test_update_builds_only_touched_columns() {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE t SET state = 'done'");
        push_update(
            &mut qb,
            &TicketUpdate::new().clear_lease().verification("passed"),
        );
        let sql = qb.sql().to_string();
        assert_eq!(
            sql,
            "UPDATE t SET state = 'done', lease_id = $1, verification_status = $2"
        );
    }
}
