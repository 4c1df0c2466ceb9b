//! Durable storage over PostgreSQL (feature `postgres`).
//!
//! Single-claim job leasing rides on `FOR UPDATE SKIP LOCKED`: the claim is
//! one UPDATE statement, so two workers racing for the same row can never
//! both win. Instance saves compare-and-swap on the concurrency token; the
//! latest-flag flip for definition versions happens inside one transaction.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::EngineError;
use crate::store::{HistoryStore, InstanceStore, JobStore, ProcessStore};
use crate::types::{
    InstanceStatus, Job, ProcessDefinition, ProcessInstance, StepExecutionRecord,
};
use crate::xml;

pub struct PostgresStore {
    pool: PgPool,
}

const MIGRATIONS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS process_definitions (
        id UUID PRIMARY KEY,
        key TEXT NOT NULL,
        version INTEGER NOT NULL,
        name TEXT NOT NULL,
        xml TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        is_latest BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL,
        UNIQUE (key, version)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_process_definitions_latest
        ON process_definitions (key) WHERE is_latest"#,
    r#"CREATE TABLE IF NOT EXISTS process_instances (
        id UUID PRIMARY KEY,
        process_definition_id UUID NOT NULL,
        process_key TEXT NOT NULL,
        status TEXT NOT NULL,
        variables JSONB NOT NULL,
        active_tokens JSONB NOT NULL,
        join_arrivals JSONB NOT NULL,
        simulation BOOLEAN NOT NULL DEFAULT FALSE,
        concurrency_token UUID NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_process_instances_key
        ON process_instances (process_key)"#,
    r#"CREATE TABLE IF NOT EXISTS step_executions (
        id UUID PRIMARY KEY,
        process_instance_id UUID NOT NULL,
        process_definition_id UUID NOT NULL,
        process_key TEXT NOT NULL,
        element_id TEXT NOT NULL,
        element_type TEXT NOT NULL,
        sequence BIGINT NOT NULL,
        started_at TIMESTAMPTZ NOT NULL,
        ended_at TIMESTAMPTZ,
        duration_ms BIGINT,
        status TEXT NOT NULL,
        error TEXT,
        UNIQUE (process_instance_id, sequence)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS jobs (
        id UUID PRIMARY KEY,
        type TEXT NOT NULL,
        process_instance_id UUID NOT NULL,
        run_at TIMESTAMPTZ,
        owner_id TEXT,
        locked_until TIMESTAMPTZ,
        attempt INTEGER NOT NULL DEFAULT 0,
        concurrency_token UUID NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_jobs_eligibility
        ON jobs (run_at NULLS FIRST, created_at)"#,
];

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the schema. Idempotent; run once at startup.
    pub async fn migrate(&self) -> Result<(), EngineError> {
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to apply schema migration")?;
        }
        tracing::info!("postgres schema up to date");
        Ok(())
    }
}

// ─── Row types ────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct DefinitionRow {
    id: Uuid,
    key: String,
    version: i32,
    name: String,
    xml: String,
    content_hash: String,
    is_latest: bool,
    created_at: DateTime<Utc>,
}

impl DefinitionRow {
    /// Elements are not stored — they are rebuilt by re-parsing the
    /// retained source.
    fn into_definition(self) -> Result<ProcessDefinition, EngineError> {
        let parsed = xml::parse_process(&self.xml)?;
        Ok(ProcessDefinition {
            id: self.id,
            key: self.key,
            name: self.name,
            version: self.version,
            xml: self.xml,
            content_hash: self.content_hash,
            is_latest: self.is_latest,
            created_at: self.created_at,
            elements: parsed.elements,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: Uuid,
    process_definition_id: Uuid,
    process_key: String,
    status: String,
    variables: serde_json::Value,
    active_tokens: serde_json::Value,
    join_arrivals: serde_json::Value,
    simulation: bool,
    concurrency_token: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl InstanceRow {
    fn into_instance(self) -> Result<ProcessInstance, EngineError> {
        Ok(ProcessInstance {
            id: self.id,
            process_definition_id: self.process_definition_id,
            process_key: self.process_key,
            status: InstanceStatus::parse(&self.status).unwrap_or(InstanceStatus::Running),
            variables: serde_json::from_value(self.variables)
                .context("malformed variables column")?,
            active_tokens: serde_json::from_value(self.active_tokens)
                .context("malformed active_tokens column")?,
            join_arrivals: serde_json::from_value(self.join_arrivals)
                .context("malformed join_arrivals column")?,
            simulation: self.simulation,
            concurrency_token: Some(self.concurrency_token),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    job_type: String,
    process_instance_id: Uuid,
    run_at: Option<DateTime<Utc>>,
    owner_id: Option<String>,
    locked_until: Option<DateTime<Utc>>,
    attempt: i32,
    concurrency_token: Uuid,
    created_at: DateTime<Utc>,
}

impl From<JobRow> for Job {
    fn from(r: JobRow) -> Self {
        Job {
            id: r.id,
            job_type: r.job_type,
            process_instance_id: r.process_instance_id,
            run_at: r.run_at,
            owner_id: r.owner_id,
            locked_until: r.locked_until,
            attempt: r.attempt,
            concurrency_token: r.concurrency_token,
            created_at: r.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: Uuid,
    process_instance_id: Uuid,
    process_definition_id: Uuid,
    process_key: String,
    element_id: String,
    element_type: String,
    sequence: i64,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    status: String,
    error: Option<String>,
}

impl From<StepRow> for StepExecutionRecord {
    fn from(r: StepRow) -> Self {
        StepExecutionRecord {
            id: r.id,
            process_instance_id: r.process_instance_id,
            process_definition_id: r.process_definition_id,
            process_key: r.process_key,
            element_id: r.element_id,
            element_type: r.element_type,
            sequence: r.sequence,
            started_at: r.started_at,
            ended_at: r.ended_at,
            duration_ms: r.duration_ms,
            status: r.status,
            error: r.error,
        }
    }
}

// ─── ProcessStore ─────────────────────────────────────────────

#[async_trait]
impl ProcessStore for PostgresStore {
    async fn save(&self, definition: &mut ProcessDefinition) -> Result<(), EngineError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open definition save transaction")?;

        let version: i32 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM process_definitions WHERE key = $1",
        )
        .bind(&definition.key)
        .fetch_one(&mut *tx)
        .await
        .context("failed to allocate definition version")?;

        sqlx::query("UPDATE process_definitions SET is_latest = FALSE WHERE key = $1 AND is_latest")
            .bind(&definition.key)
            .execute(&mut *tx)
            .await
            .context("failed to clear previous latest definition")?;

        sqlx::query(
            r#"INSERT INTO process_definitions
                (id, key, version, name, xml, content_hash, is_latest, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7)"#,
        )
        .bind(definition.id)
        .bind(&definition.key)
        .bind(version)
        .bind(&definition.name)
        .bind(&definition.xml)
        .bind(&definition.content_hash)
        .bind(definition.created_at)
        .execute(&mut *tx)
        .await
        .context("failed to insert process definition")?;

        tx.commit()
            .await
            .context("failed to commit definition save")?;

        definition.version = version;
        definition.is_latest = true;
        Ok(())
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<ProcessDefinition>, EngineError> {
        let row = sqlx::query_as::<_, DefinitionRow>(
            r#"SELECT id, key, version, name, xml, content_hash, is_latest, created_at
            FROM process_definitions WHERE key = $1 AND is_latest"#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query definition by key")?;
        row.map(DefinitionRow::into_definition).transpose()
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ProcessDefinition>, EngineError> {
        let row = sqlx::query_as::<_, DefinitionRow>(
            r#"SELECT id, key, version, name, xml, content_hash, is_latest, created_at
            FROM process_definitions WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query definition by id")?;
        row.map(DefinitionRow::into_definition).transpose()
    }

    async fn get_all(&self) -> Result<Vec<ProcessDefinition>, EngineError> {
        let rows = sqlx::query_as::<_, DefinitionRow>(
            r#"SELECT id, key, version, name, xml, content_hash, is_latest, created_at
            FROM process_definitions ORDER BY key, version"#,
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list definitions")?;
        rows.into_iter()
            .map(DefinitionRow::into_definition)
            .collect()
    }
}

// ─── InstanceStore ────────────────────────────────────────────

#[async_trait]
impl InstanceStore for PostgresStore {
    async fn save(&self, instance: &mut ProcessInstance) -> Result<(), EngineError> {
        let variables =
            serde_json::to_value(&instance.variables).context("failed to serialize variables")?;
        let active_tokens = serde_json::to_value(&instance.active_tokens)
            .context("failed to serialize active tokens")?;
        let join_arrivals = serde_json::to_value(&instance.join_arrivals)
            .context("failed to serialize join arrivals")?;
        let new_token = Uuid::now_v7();
        let now = Utc::now();

        match instance.concurrency_token {
            None => {
                sqlx::query(
                    r#"INSERT INTO process_instances
                        (id, process_definition_id, process_key, status, variables,
                         active_tokens, join_arrivals, simulation, concurrency_token,
                         created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
                )
                .bind(instance.id)
                .bind(instance.process_definition_id)
                .bind(&instance.process_key)
                .bind(instance.status.as_str())
                .bind(&variables)
                .bind(&active_tokens)
                .bind(&join_arrivals)
                .bind(instance.simulation)
                .bind(new_token)
                .bind(instance.created_at)
                .bind(now)
                .execute(&self.pool)
                .await
                .context("failed to insert process instance")?;
            }
            Some(current) => {
                let result = sqlx::query(
                    r#"UPDATE process_instances
                    SET status = $2, variables = $3, active_tokens = $4,
                        join_arrivals = $5, concurrency_token = $6, updated_at = $7
                    WHERE id = $1 AND concurrency_token = $8"#,
                )
                .bind(instance.id)
                .bind(instance.status.as_str())
                .bind(&variables)
                .bind(&active_tokens)
                .bind(&join_arrivals)
                .bind(new_token)
                .bind(now)
                .bind(current)
                .execute(&self.pool)
                .await
                .context("failed to update process instance")?;

                if result.rows_affected() == 0 {
                    let exists: Option<i32> =
                        sqlx::query_scalar("SELECT 1 FROM process_instances WHERE id = $1")
                            .bind(instance.id)
                            .fetch_optional(&self.pool)
                            .await
                            .context("failed to check instance existence")?;
                    return Err(if exists.is_some() {
                        EngineError::ConcurrencyConflict {
                            entity: "process instance",
                            id: instance.id,
                        }
                    } else {
                        EngineError::InstanceNotFound(instance.id)
                    });
                }
            }
        }

        instance.concurrency_token = Some(new_token);
        instance.updated_at = now;
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ProcessInstance>, EngineError> {
        let row = sqlx::query_as::<_, InstanceRow>(
            r#"SELECT id, process_definition_id, process_key, status, variables,
                active_tokens, join_arrivals, simulation, concurrency_token,
                created_at, updated_at
            FROM process_instances WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query instance by id")?;
        row.map(InstanceRow::into_instance).transpose()
    }

    async fn get_by_process_key(
        &self,
        key: &str,
    ) -> Result<Vec<ProcessInstance>, EngineError> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            r#"SELECT id, process_definition_id, process_key, status, variables,
                active_tokens, join_arrivals, simulation, concurrency_token,
                created_at, updated_at
            FROM process_instances WHERE process_key = $1 ORDER BY created_at"#,
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .context("failed to query instances by process key")?;
        rows.into_iter().map(InstanceRow::into_instance).collect()
    }
}

// ─── JobStore ─────────────────────────────────────────────────

#[async_trait]
impl JobStore for PostgresStore {
    async fn enqueue(&self, job: &mut Job) -> Result<(), EngineError> {
        if job.id.is_nil() {
            job.id = Uuid::now_v7();
        }
        if job.concurrency_token.is_nil() {
            job.concurrency_token = Uuid::now_v7();
        }
        job.attempt = 0;

        sqlx::query(
            r#"INSERT INTO jobs
                (id, type, process_instance_id, run_at, owner_id, locked_until,
                 attempt, concurrency_token, created_at)
            VALUES ($1, $2, $3, $4, NULL, NULL, 0, $5, $6)"#,
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(job.process_instance_id)
        .bind(job.run_at)
        .bind(job.concurrency_token)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .context("failed to enqueue job")?;
        Ok(())
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>, EngineError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"UPDATE jobs
            SET owner_id = $1,
                locked_until = now() + make_interval(secs => $2),
                attempt = attempt + 1,
                concurrency_token = $3
            WHERE id = (
                SELECT id FROM jobs
                WHERE (run_at IS NULL OR run_at <= now())
                  AND (locked_until IS NULL OR locked_until < now())
                ORDER BY run_at ASC NULLS FIRST, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, type AS job_type, process_instance_id, run_at, owner_id,
                      locked_until, attempt, concurrency_token, created_at"#,
        )
        .bind(worker_id)
        .bind(lease.as_secs_f64())
        .bind(Uuid::now_v7())
        .fetch_optional(&self.pool)
        .await
        .context("failed to claim job")?;

        Ok(row.map(Job::from))
    }

    async fn complete(&self, job_id: Uuid, worker_id: &str) -> Result<bool, EngineError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1 AND owner_id = $2")
            .bind(job_id)
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .context("failed to complete job")?;
        Ok(result.rows_affected() > 0)
    }
}

// ─── HistoryStore ─────────────────────────────────────────────

#[async_trait]
impl HistoryStore for PostgresStore {
    async fn append(&self, record: &mut StepExecutionRecord) -> Result<(), EngineError> {
        if record.id.is_nil() {
            record.id = Uuid::now_v7();
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open history append transaction")?;

        let sequence: i64 = sqlx::query_scalar(
            r#"SELECT COALESCE(MAX(sequence), 0) + 1
            FROM step_executions WHERE process_instance_id = $1"#,
        )
        .bind(record.process_instance_id)
        .fetch_one(&mut *tx)
        .await
        .context("failed to allocate history sequence")?;

        sqlx::query(
            r#"INSERT INTO step_executions
                (id, process_instance_id, process_definition_id, process_key,
                 element_id, element_type, sequence, started_at, ended_at,
                 duration_ms, status, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
        )
        .bind(record.id)
        .bind(record.process_instance_id)
        .bind(record.process_definition_id)
        .bind(&record.process_key)
        .bind(&record.element_id)
        .bind(&record.element_type)
        .bind(sequence)
        .bind(record.started_at)
        .bind(record.ended_at)
        .bind(record.duration_ms)
        .bind(&record.status)
        .bind(&record.error)
        .execute(&mut *tx)
        .await
        .context("failed to insert step execution record")?;

        tx.commit()
            .await
            .context("failed to commit history append")?;

        record.sequence = sequence;
        Ok(())
    }

    async fn list_for_instance(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<StepExecutionRecord>, EngineError> {
        let rows = sqlx::query_as::<_, StepRow>(
            r#"SELECT id, process_instance_id, process_definition_id, process_key,
                element_id, element_type, sequence, started_at, ended_at,
                duration_ms, status, error
            FROM step_executions WHERE process_instance_id = $1 ORDER BY sequence"#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list step execution records")?;
        Ok(rows.into_iter().map(StepExecutionRecord::from).collect())
    }
}
