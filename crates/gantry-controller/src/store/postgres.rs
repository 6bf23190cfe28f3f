// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Postgres store backend.
//!
//! Every mutation appends a row to the `events` table inside the same
//! transaction and notifies the `gantry_events` channel with the new event
//! id; [`PostgresStore::subscribe_changes`] turns those notifications back
//! into ordered [`EventRecord`]s via a `LISTEN` connection.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgListener, PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::names::PageToken;

use super::{
    AppRecord, AppUpdate, ControllerStore, DeployState, DeploymentEventData, DeploymentRecord,
    EventFilter, EventOp, EventRecord, EventType, ExpandedDeploymentRecord, FormationRecord,
    ListDeploymentOptions, NewRelease, ProcessCounts, ProcessTags, ReleaseRecord, ScaleState,
    ScaleRequestRecord, StoreError,
};

/// Notification channel carrying new event ids.
const EVENT_CHANNEL: &str = "gantry_events";

const DEFAULT_PAGE_SIZE: i64 = 100;
const FEED_BUFFER: usize = 1024;

/// Postgres [`ControllerStore`] backend.
pub struct PostgresStore {
    pool: PgPool,
    default_route_domain: Option<String>,
}

impl PostgresStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool, default_route_domain: Option<String>) -> Self {
        Self {
            pool,
            default_route_domain,
        }
    }
}

fn app_from_row(row: &PgRow) -> Result<AppRecord, StoreError> {
    Ok(AppRecord {
        seq: row.try_get("seq")?,
        id: row.try_get("app_id")?,
        name: row.try_get("name")?,
        meta: row.try_get::<Json<HashMap<String, String>>, _>("meta")?.0,
        strategy: row.try_get("strategy")?,
        deploy_timeout: row.try_get("deploy_timeout")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn release_from_row(row: &PgRow) -> Result<ReleaseRecord, StoreError> {
    Ok(ReleaseRecord {
        id: row.try_get("release_id")?,
        app_id: row.try_get("app_id")?,
        artifacts: row.try_get::<Json<Vec<String>>, _>("artifacts")?.0,
        env: row.try_get::<Json<HashMap<String, String>>, _>("env")?.0,
        process_types: row.try_get::<Json<Vec<String>>, _>("process_types")?.0,
        meta: row.try_get::<Json<HashMap<String, String>>, _>("meta")?.0,
        created_at: row.try_get("created_at")?,
    })
}

fn scale_request_from_row(row: &PgRow) -> Result<ScaleRequestRecord, StoreError> {
    let state: String = row.try_get("state")?;
    Ok(ScaleRequestRecord {
        id: row.try_get("scale_request_id")?,
        app_id: row.try_get("app_id")?,
        release_id: row.try_get("release_id")?,
        state: ScaleState::parse(&state)
            .ok_or_else(|| StoreError::Decode(format!("unknown scale state {state:?}")))?,
        old_processes: row
            .try_get::<Option<Json<ProcessCounts>>, _>("old_processes")?
            .map(|j| j.0),
        new_processes: row
            .try_get::<Option<Json<ProcessCounts>>, _>("new_processes")?
            .map(|j| j.0),
        old_tags: row
            .try_get::<Option<Json<ProcessTags>>, _>("old_tags")?
            .map(|j| j.0),
        new_tags: row
            .try_get::<Option<Json<ProcessTags>>, _>("new_tags")?
            .map(|j| j.0),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn formation_from_row(row: &PgRow) -> Result<FormationRecord, StoreError> {
    Ok(FormationRecord {
        app_id: row.try_get("app_id")?,
        release_id: row.try_get("release_id")?,
        processes: row.try_get::<Json<ProcessCounts>, _>("processes")?.0,
        tags: row.try_get::<Json<ProcessTags>, _>("tags")?.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn deployment_from_row(row: &PgRow) -> Result<DeploymentRecord, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(DeploymentRecord {
        id: row.try_get("deployment_id")?,
        app_id: row.try_get("app_id")?,
        old_release_id: row.try_get("old_release_id")?,
        new_release_id: row.try_get("new_release_id")?,
        status: DeployState::parse(&status)
            .ok_or_else(|| StoreError::Decode(format!("unknown deployment status {status:?}")))?,
        processes: row.try_get::<Json<ProcessCounts>, _>("processes")?.0,
        created_at: row.try_get("created_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<EventRecord, StoreError> {
    let object_type: String = row.try_get("object_type")?;
    let op: String = row.try_get("op")?;
    Ok(EventRecord {
        id: row.try_get("event_id")?,
        app_id: row.try_get("app_id")?,
        object_type: EventType::parse(&object_type)
            .ok_or_else(|| StoreError::Decode(format!("unknown object type {object_type:?}")))?,
        object_id: row.try_get("object_id")?,
        op: EventOp::parse(&op)
            .ok_or_else(|| StoreError::Decode(format!("unknown event op {op:?}")))?,
        data: row
            .try_get::<Option<Json<serde_json::Value>>, _>("data")?
            .map(|j| j.0)
            .unwrap_or(serde_json::Value::Null),
        created_at: row.try_get("created_at")?,
    })
}

/// Append an event row and notify listeners, inside the caller's transaction.
async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    app_id: &str,
    object_type: EventType,
    object_id: &str,
    op: EventOp,
    data: &serde_json::Value,
) -> Result<(), StoreError> {
    let event_id: i64 = sqlx::query_scalar(
        "INSERT INTO events (app_id, object_type, object_id, op, data)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING event_id",
    )
    .bind(app_id)
    .bind(object_type.as_str())
    .bind(object_id)
    .bind(op.as_str())
    .bind(Json(data))
    .fetch_one(&mut **tx)
    .await?;

    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(EVENT_CHANNEL)
        .bind(event_id.to_string())
        .execute(&mut **tx)
        .await?;

    Ok(())
}

async fn fetch_event(pool: &PgPool, event_id: i64) -> Result<Option<EventRecord>, StoreError> {
    let row = sqlx::query("SELECT * FROM events WHERE event_id = $1")
        .bind(event_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(event_from_row).transpose()
}

async fn upsert_formation(
    tx: &mut Transaction<'_, Postgres>,
    app_id: &str,
    release_id: &str,
    processes: Option<&ProcessCounts>,
    tags: Option<&ProcessTags>,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO formations (app_id, release_id, processes, tags)
         VALUES ($1, $2, COALESCE($3, '{}'::jsonb), COALESCE($4, '{}'::jsonb))
         ON CONFLICT (app_id, release_id) DO UPDATE SET
             processes = COALESCE($3, formations.processes),
             tags = COALESCE($4, formations.tags),
             updated_at = now()",
    )
    .bind(app_id)
    .bind(release_id)
    .bind(processes.map(Json))
    .bind(tags.map(Json))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl ControllerStore for PostgresStore {
    async fn create_app(
        &self,
        name: &str,
        mut meta: HashMap<String, String>,
    ) -> Result<AppRecord, StoreError> {
        if let Some(domain) = &self.default_route_domain {
            meta.entry("route-domain".to_string())
                .or_insert_with(|| format!("{name}.{domain}"));
        }
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO apps (app_id, name, meta) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(name)
        .bind(Json(&meta))
        .fetch_one(&mut *tx)
        .await?;
        let app = app_from_row(&row)?;
        let data = serde_json::to_value(&app)?;
        insert_event(&mut tx, &app.id, EventType::App, &app.id, EventOp::Create, &data).await?;
        tx.commit().await?;
        Ok(app)
    }

    async fn get_app(&self, app_id: &str) -> Result<AppRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM apps WHERE app_id = $1")
            .bind(app_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("app {app_id}")))?;
        app_from_row(&row)
    }

    async fn list_apps_page(
        &self,
        token: &PageToken,
    ) -> Result<(Vec<AppRecord>, Option<PageToken>), StoreError> {
        let size = if token.size > 0 {
            token.size as i64
        } else {
            DEFAULT_PAGE_SIZE
        };
        let rows = sqlx::query("SELECT * FROM apps WHERE seq > $1 ORDER BY seq ASC LIMIT $2")
            .bind(token.before_id.unwrap_or(0))
            .bind(size + 1)
            .fetch_all(&self.pool)
            .await?;
        let mut apps = rows
            .iter()
            .map(app_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let next = if apps.len() as i64 > size {
            apps.truncate(size as usize);
            apps.last().map(|last| PageToken {
                before_id: Some(last.seq),
                size: token.size,
            })
        } else {
            None
        };
        Ok((apps, next))
    }

    async fn update_app(&self, app_id: &str, update: AppUpdate) -> Result<AppRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM apps WHERE app_id = $1 FOR UPDATE")
            .bind(app_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("app {app_id}")))?;
        let mut app = app_from_row(&row)?;
        if let Some(meta) = update.meta {
            app.meta = meta;
        }
        if let Some(strategy) = update.strategy {
            app.strategy = strategy;
        }
        if let Some(deploy_timeout) = update.deploy_timeout {
            app.deploy_timeout = deploy_timeout;
        }
        app.updated_at = Utc::now();
        sqlx::query(
            "UPDATE apps SET meta = $2, strategy = $3, deploy_timeout = $4, updated_at = $5
             WHERE app_id = $1",
        )
        .bind(app_id)
        .bind(Json(&app.meta))
        .bind(&app.strategy)
        .bind(app.deploy_timeout)
        .bind(app.updated_at)
        .execute(&mut *tx)
        .await?;
        let data = serde_json::to_value(&app)?;
        insert_event(&mut tx, app_id, EventType::App, app_id, EventOp::Update, &data).await?;
        tx.commit().await?;
        Ok(app)
    }

    async fn get_app_release(&self, app_id: &str) -> Result<ReleaseRecord, StoreError> {
        let row = sqlx::query(
            "SELECT r.* FROM releases r
             JOIN apps a ON a.release_id = r.release_id
             WHERE a.app_id = $1",
        )
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("current release for app {app_id}")))?;
        release_from_row(&row)
    }

    async fn set_app_release(&self, app_id: &str, release_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM releases WHERE release_id = $1")
            .bind(release_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("release {release_id}")))?;
        let release = release_from_row(&row)?;
        sqlx::query("UPDATE apps SET release_id = $2, updated_at = now() WHERE app_id = $1")
            .bind(app_id)
            .bind(release_id)
            .execute(&mut *tx)
            .await?;
        let data = serde_json::to_value(&release)?;
        insert_event(
            &mut tx,
            app_id,
            EventType::AppRelease,
            release_id,
            EventOp::Create,
            &data,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn create_release(
        &self,
        app_id: &str,
        release: NewRelease,
    ) -> Result<ReleaseRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO releases (release_id, app_id, artifacts, env, process_types, meta)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING *",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(app_id)
        .bind(Json(&release.artifacts))
        .bind(Json(&release.env))
        .bind(Json(&release.process_types))
        .bind(Json(&release.meta))
        .fetch_one(&mut *tx)
        .await?;
        let record = release_from_row(&row)?;
        let data = serde_json::to_value(&record)?;
        insert_event(
            &mut tx,
            app_id,
            EventType::Release,
            &record.id,
            EventOp::Create,
            &data,
        )
        .await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn get_release(&self, release_id: &str) -> Result<ReleaseRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM releases WHERE release_id = $1")
            .bind(release_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("release {release_id}")))?;
        release_from_row(&row)
    }

    async fn list_events(
        &self,
        filter: &EventFilter,
        before_id: Option<i64>,
        count: usize,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM events WHERE true");
        if !filter.app_ids.is_empty() {
            qb.push(" AND app_id = ANY(");
            qb.push_bind(&filter.app_ids);
            qb.push(")");
        }
        if !filter.object_types.is_empty() {
            let types: Vec<String> = filter
                .object_types
                .iter()
                .map(|t| t.as_str().to_string())
                .collect();
            qb.push(" AND object_type = ANY(");
            qb.push_bind(types);
            qb.push(")");
        }
        if !filter.object_id.is_empty() {
            qb.push(" AND object_id = ");
            qb.push_bind(&filter.object_id);
        }
        if let Some(before) = before_id {
            qb.push(" AND event_id < ");
            qb.push_bind(before);
        }
        qb.push(" ORDER BY event_id DESC");
        if count > 0 {
            qb.push(" LIMIT ");
            qb.push_bind(count as i64);
        }
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn subscribe_changes(&self) -> Result<mpsc::Receiver<EventRecord>, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| StoreError::Feed(e.to_string()))?;
        listener
            .listen(EVENT_CHANNEL)
            .await
            .map_err(|e| StoreError::Feed(e.to_string()))?;

        let pool = self.pool.clone();
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        tokio::spawn(async move {
            loop {
                let notification = match listener.recv().await {
                    Ok(n) => n,
                    Err(e) => {
                        error!(error = %e, "event feed connection lost");
                        break;
                    }
                };
                let event_id: i64 = match notification.payload().parse() {
                    Ok(id) => id,
                    Err(_) => {
                        warn!(payload = notification.payload(), "ignoring malformed event notification");
                        continue;
                    }
                };
                match fetch_event(&pool, event_id).await {
                    Ok(Some(event)) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        warn!(event_id, "notified event row missing");
                    }
                    Err(e) => {
                        error!(event_id, error = %e, "failed to fetch notified event");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn create_scale_request(
        &self,
        app_id: &str,
        release_id: &str,
        new_processes: Option<ProcessCounts>,
        new_tags: Option<ProcessTags>,
    ) -> Result<ScaleRequestRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        let formation = sqlx::query(
            "SELECT * FROM formations WHERE app_id = $1 AND release_id = $2 FOR UPDATE",
        )
        .bind(app_id)
        .bind(release_id)
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(formation_from_row)
        .transpose()?;
        if formation.is_none() {
            upsert_formation(&mut tx, app_id, release_id, None, None).await?;
        }
        let row = sqlx::query(
            "INSERT INTO scale_requests
                 (scale_request_id, app_id, release_id, state,
                  old_processes, new_processes, old_tags, new_tags)
             VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7)
             RETURNING *",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(app_id)
        .bind(release_id)
        .bind(formation.as_ref().map(|f| Json(&f.processes)))
        .bind(new_processes.as_ref().map(Json))
        .bind(formation.as_ref().map(|f| Json(&f.tags)))
        .bind(new_tags.as_ref().map(Json))
        .fetch_one(&mut *tx)
        .await?;
        let record = scale_request_from_row(&row)?;
        let data = serde_json::to_value(&record)?;
        insert_event(
            &mut tx,
            app_id,
            EventType::ScaleRequest,
            &record.id,
            EventOp::Create,
            &data,
        )
        .await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn update_scale_request_state(
        &self,
        scale_request_id: &str,
        state: ScaleState,
    ) -> Result<ScaleRequestRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "UPDATE scale_requests SET state = $2, updated_at = now()
             WHERE scale_request_id = $1
             RETURNING *",
        )
        .bind(scale_request_id)
        .bind(state.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("scale request {scale_request_id}")))?;
        let record = scale_request_from_row(&row)?;
        if state == ScaleState::Complete {
            upsert_formation(
                &mut tx,
                &record.app_id,
                &record.release_id,
                record.new_processes.as_ref(),
                record.new_tags.as_ref(),
            )
            .await?;
        }
        let data = serde_json::to_value(&record)?;
        insert_event(
            &mut tx,
            &record.app_id,
            EventType::ScaleRequest,
            scale_request_id,
            EventOp::Update,
            &data,
        )
        .await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn latest_scale_request(
        &self,
        app_id: &str,
        release_id: &str,
    ) -> Result<Option<ScaleRequestRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM scale_requests
             WHERE app_id = $1 AND release_id = $2
             ORDER BY updated_at DESC
             LIMIT 1",
        )
        .bind(app_id)
        .bind(release_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(scale_request_from_row).transpose()
    }

    async fn get_formation(
        &self,
        app_id: &str,
        release_id: &str,
    ) -> Result<FormationRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM formations WHERE app_id = $1 AND release_id = $2")
            .bind(app_id)
            .bind(release_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("formation {app_id}/{release_id}")))?;
        formation_from_row(&row)
    }

    async fn create_deployment(
        &self,
        app_id: &str,
        new_release_id: &str,
    ) -> Result<DeploymentRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM releases WHERE release_id = $1)")
                .bind(new_release_id)
                .fetch_one(&mut *tx)
                .await?;
        if !exists {
            return Err(StoreError::NotFound(format!("release {new_release_id}")));
        }
        let old_release_id: Option<String> =
            sqlx::query_scalar("SELECT release_id FROM apps WHERE app_id = $1")
                .bind(app_id)
                .fetch_optional(&mut *tx)
                .await?
                .flatten();
        let processes: ProcessCounts = match &old_release_id {
            Some(old) => sqlx::query(
                "SELECT * FROM formations WHERE app_id = $1 AND release_id = $2",
            )
            .bind(app_id)
            .bind(old)
            .fetch_optional(&mut *tx)
            .await?
            .as_ref()
            .map(formation_from_row)
            .transpose()?
            .map(|f| f.processes)
            .unwrap_or_default(),
            None => ProcessCounts::new(),
        };
        let row = sqlx::query(
            "INSERT INTO deployments
                 (deployment_id, app_id, old_release_id, new_release_id, status, processes)
             VALUES ($1, $2, $3, $4, 'pending', $5)
             RETURNING *",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(app_id)
        .bind(&old_release_id)
        .bind(new_release_id)
        .bind(Json(&processes))
        .fetch_one(&mut *tx)
        .await?;
        let record = deployment_from_row(&row)?;
        let data = serde_json::to_value(&DeploymentEventData {
            status: DeployState::Pending,
            job_type: String::new(),
            job_state: String::new(),
            error: None,
        })?;
        insert_event(
            &mut tx,
            app_id,
            EventType::Deployment,
            &record.id,
            EventOp::Create,
            &data,
        )
        .await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn get_deployment(&self, deployment_id: &str) -> Result<DeploymentRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM deployments WHERE deployment_id = $1")
            .bind(deployment_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("deployment {deployment_id}")))?;
        deployment_from_row(&row)
    }

    async fn get_expanded_deployment(
        &self,
        deployment_id: &str,
    ) -> Result<ExpandedDeploymentRecord, StoreError> {
        let deployment = self.get_deployment(deployment_id).await?;
        self.expand(deployment).await
    }

    async fn list_deployments(
        &self,
        opts: &ListDeploymentOptions,
    ) -> Result<Vec<ExpandedDeploymentRecord>, StoreError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM deployments WHERE true");
        if !opts.app_ids.is_empty() {
            qb.push(" AND app_id = ANY(");
            qb.push_bind(&opts.app_ids);
            qb.push(")");
        }
        if !opts.deployment_ids.is_empty() {
            qb.push(" AND deployment_id = ANY(");
            qb.push_bind(&opts.deployment_ids);
            qb.push(")");
        }
        qb.push(" ORDER BY created_at DESC");
        if opts.page_token.size > 0 {
            qb.push(" LIMIT ");
            qb.push_bind(opts.page_token.size as i64);
        }
        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut expanded = Vec::with_capacity(rows.len());
        for row in &rows {
            expanded.push(self.expand(deployment_from_row(row)?).await?);
        }
        Ok(expanded)
    }

    async fn record_deployment_event(
        &self,
        deployment_id: &str,
        status: DeployState,
        job_type: &str,
        job_state: &str,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let finished = matches!(status, DeployState::Complete | DeployState::Failed);
        let row = sqlx::query(
            "UPDATE deployments
             SET status = $2, finished_at = CASE WHEN $3 THEN now() ELSE finished_at END
             WHERE deployment_id = $1
             RETURNING *",
        )
        .bind(deployment_id)
        .bind(status.as_str())
        .bind(finished)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("deployment {deployment_id}")))?;
        let deployment = deployment_from_row(&row)?;
        let data = serde_json::to_value(&DeploymentEventData {
            status,
            job_type: job_type.to_string(),
            job_state: job_state.to_string(),
            error: error.map(|e| e.to_string()),
        })?;
        insert_event(
            &mut tx,
            &deployment.app_id,
            EventType::Deployment,
            deployment_id,
            EventOp::Update,
            &data,
        )
        .await?;
        if status == DeployState::Complete {
            let release_row = sqlx::query("SELECT * FROM releases WHERE release_id = $1")
                .bind(&deployment.new_release_id)
                .fetch_optional(&mut *tx)
                .await?;
            if let Some(release_row) = release_row {
                let release = release_from_row(&release_row)?;
                sqlx::query(
                    "UPDATE apps SET release_id = $2, updated_at = now() WHERE app_id = $1",
                )
                .bind(&deployment.app_id)
                .bind(&deployment.new_release_id)
                .execute(&mut *tx)
                .await?;
                let data = serde_json::to_value(&release)?;
                insert_event(
                    &mut tx,
                    &deployment.app_id,
                    EventType::AppRelease,
                    &deployment.new_release_id,
                    EventOp::Create,
                    &data,
                )
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

impl PostgresStore {
    async fn expand(
        &self,
        deployment: DeploymentRecord,
    ) -> Result<ExpandedDeploymentRecord, StoreError> {
        let old_release = match &deployment.old_release_id {
            Some(id) => {
                let row = sqlx::query("SELECT * FROM releases WHERE release_id = $1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
                row.as_ref().map(release_from_row).transpose()?
            }
            None => None,
        };
        let new_release = {
            let row = sqlx::query("SELECT * FROM releases WHERE release_id = $1")
                .bind(&deployment.new_release_id)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(release_from_row).transpose()?
        };
        let job_state = sqlx::query(
            "SELECT data FROM events
             WHERE object_type = 'deployment' AND object_id = $1
             ORDER BY event_id DESC
             LIMIT 1",
        )
        .bind(&deployment.id)
        .fetch_optional(&self.pool)
        .await?
        .and_then(|row| {
            row.try_get::<Option<Json<DeploymentEventData>>, _>("data")
                .ok()
                .flatten()
        })
        .map(|j| j.0.job_state)
        .unwrap_or_default();
        Ok(ExpandedDeploymentRecord {
            old_release,
            new_release,
            job_state,
            deployment,
        })
    }
}
