// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store backend.
//!
//! Mirrors the Postgres backend's observable behavior, including the ordered
//! event log and change feed, so the streaming engine can be exercised
//! without a database. Tests also use it to play the role of the external
//! workers that drive scale-request and deployment transitions.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;
use uuid::Uuid;

use crate::names::PageToken;

use super::{
    AppRecord, AppUpdate, ControllerStore, DeployState, DeploymentEventData, DeploymentRecord,
    EventFilter, EventOp, EventRecord, EventType, ExpandedDeploymentRecord, FormationRecord,
    ListDeploymentOptions, NewRelease, ProcessCounts, ProcessTags, ReleaseRecord, ScaleState,
    ScaleRequestRecord, StoreError,
};

const DEFAULT_PAGE_SIZE: usize = 100;
const FEED_BUFFER: usize = 1024;

#[derive(Default)]
struct Inner {
    next_seq: i64,
    next_event_id: i64,
    apps: Vec<AppRecord>,
    app_releases: HashMap<String, String>,
    releases: HashMap<String, ReleaseRecord>,
    scale_requests: HashMap<String, ScaleRequestRecord>,
    formations: HashMap<(String, String), FormationRecord>,
    deployments: HashMap<String, DeploymentRecord>,
    events: Vec<EventRecord>,
}

/// In-memory [`ControllerStore`] backend.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    feed: broadcast::Sender<EventRecord>,
    default_route_domain: Option<String>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new(default_route_domain: Option<String>) -> Self {
        let (feed, _) = broadcast::channel(FEED_BUFFER);
        Self {
            inner: Mutex::new(Inner::default()),
            feed,
            default_route_domain,
        }
    }

    fn emit(
        &self,
        inner: &mut Inner,
        app_id: &str,
        object_type: EventType,
        object_id: &str,
        op: EventOp,
        data: serde_json::Value,
    ) {
        inner.next_event_id += 1;
        let event = EventRecord {
            id: inner.next_event_id,
            app_id: app_id.to_string(),
            object_type,
            object_id: object_id.to_string(),
            op,
            data,
            created_at: Utc::now(),
        };
        inner.events.push(event.clone());
        // No receivers just means nobody is streaming right now.
        let _ = self.feed.send(event);
    }

    fn job_state_for(inner: &Inner, deployment_id: &str) -> String {
        inner
            .events
            .iter()
            .rev()
            .find(|e| e.object_type == EventType::Deployment && e.object_id == deployment_id)
            .and_then(|e| serde_json::from_value::<DeploymentEventData>(e.data.clone()).ok())
            .map(|d| d.job_state)
            .unwrap_or_default()
    }

    fn expand(inner: &Inner, deployment: DeploymentRecord) -> ExpandedDeploymentRecord {
        let old_release = deployment
            .old_release_id
            .as_ref()
            .and_then(|id| inner.releases.get(id).cloned());
        let new_release = inner.releases.get(&deployment.new_release_id).cloned();
        let job_state = Self::job_state_for(inner, &deployment.id);
        ExpandedDeploymentRecord {
            old_release,
            new_release,
            job_state,
            deployment,
        }
    }
}

#[async_trait]
impl ControllerStore for MemoryStore {
    async fn create_app(
        &self,
        name: &str,
        mut meta: HashMap<String, String>,
    ) -> Result<AppRecord, StoreError> {
        if let Some(domain) = &self.default_route_domain {
            meta.entry("route-domain".to_string())
                .or_insert_with(|| format!("{name}.{domain}"));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.next_seq += 1;
        let now = Utc::now();
        let app = AppRecord {
            seq: inner.next_seq,
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            meta,
            strategy: "all-at-once".to_string(),
            deploy_timeout: 120,
            created_at: now,
            updated_at: now,
        };
        inner.apps.push(app.clone());
        let data = serde_json::to_value(&app)?;
        self.emit(&mut inner, &app.id, EventType::App, &app.id, EventOp::Create, data);
        Ok(app)
    }

    async fn get_app(&self, app_id: &str) -> Result<AppRecord, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .apps
            .iter()
            .find(|a| a.id == app_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("app {app_id}")))
    }

    async fn list_apps_page(
        &self,
        token: &PageToken,
    ) -> Result<(Vec<AppRecord>, Option<PageToken>), StoreError> {
        let inner = self.inner.lock().unwrap();
        let size = if token.size > 0 {
            token.size as usize
        } else {
            DEFAULT_PAGE_SIZE
        };
        let cursor = token.before_id.unwrap_or(0);
        let mut page: Vec<AppRecord> = inner
            .apps
            .iter()
            .filter(|a| a.seq > cursor)
            .take(size + 1)
            .cloned()
            .collect();
        let next = if page.len() > size {
            page.truncate(size);
            page.last().map(|last| PageToken {
                before_id: Some(last.seq),
                size: token.size,
            })
        } else {
            None
        };
        Ok((page, next))
    }

    async fn update_app(&self, app_id: &str, update: AppUpdate) -> Result<AppRecord, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let app = {
            let app = inner
                .apps
                .iter_mut()
                .find(|a| a.id == app_id)
                .ok_or_else(|| StoreError::NotFound(format!("app {app_id}")))?;
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
            app.clone()
        };
        let data = serde_json::to_value(&app)?;
        self.emit(&mut inner, app_id, EventType::App, app_id, EventOp::Update, data);
        Ok(app)
    }

    async fn get_app_release(&self, app_id: &str) -> Result<ReleaseRecord, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .app_releases
            .get(app_id)
            .and_then(|release_id| inner.releases.get(release_id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("current release for app {app_id}")))
    }

    async fn set_app_release(&self, app_id: &str, release_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let release = inner
            .releases
            .get(release_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("release {release_id}")))?;
        inner
            .app_releases
            .insert(app_id.to_string(), release_id.to_string());
        let data = serde_json::to_value(&release)?;
        self.emit(
            &mut inner,
            app_id,
            EventType::AppRelease,
            release_id,
            EventOp::Create,
            data,
        );
        Ok(())
    }

    async fn create_release(
        &self,
        app_id: &str,
        release: NewRelease,
    ) -> Result<ReleaseRecord, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let record = ReleaseRecord {
            id: Uuid::new_v4().to_string(),
            app_id: app_id.to_string(),
            artifacts: release.artifacts,
            env: release.env,
            process_types: release.process_types,
            meta: release.meta,
            created_at: Utc::now(),
        };
        inner.releases.insert(record.id.clone(), record.clone());
        let data = serde_json::to_value(&record)?;
        self.emit(
            &mut inner,
            app_id,
            EventType::Release,
            &record.id,
            EventOp::Create,
            data,
        );
        Ok(record)
    }

    async fn get_release(&self, release_id: &str) -> Result<ReleaseRecord, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .releases
            .get(release_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("release {release_id}")))
    }

    async fn list_events(
        &self,
        filter: &EventFilter,
        before_id: Option<i64>,
        count: usize,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut events: Vec<EventRecord> = inner
            .events
            .iter()
            .rev()
            .filter(|e| {
                (filter.app_ids.is_empty() || filter.app_ids.contains(&e.app_id))
                    && (filter.object_types.is_empty()
                        || filter.object_types.contains(&e.object_type))
                    && (filter.object_id.is_empty() || filter.object_id == e.object_id)
                    && before_id.is_none_or(|before| e.id < before)
            })
            .cloned()
            .collect();
        if count > 0 {
            events.truncate(count);
        }
        Ok(events)
    }

    async fn subscribe_changes(&self) -> Result<mpsc::Receiver<EventRecord>, StoreError> {
        let mut feed = self.feed.subscribe();
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "change feed lagged, closing");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
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
        let mut inner = self.inner.lock().unwrap();
        let key = (app_id.to_string(), release_id.to_string());
        let existing = inner.formations.get(&key).cloned();
        let now = Utc::now();
        if existing.is_none() {
            inner.formations.insert(
                key,
                FormationRecord {
                    app_id: app_id.to_string(),
                    release_id: release_id.to_string(),
                    processes: ProcessCounts::new(),
                    tags: ProcessTags::new(),
                    created_at: now,
                    updated_at: now,
                },
            );
        }
        let record = ScaleRequestRecord {
            id: Uuid::new_v4().to_string(),
            app_id: app_id.to_string(),
            release_id: release_id.to_string(),
            state: ScaleState::Pending,
            old_processes: existing.as_ref().map(|f| f.processes.clone()),
            new_processes,
            old_tags: existing.as_ref().map(|f| f.tags.clone()),
            new_tags,
            created_at: now,
            updated_at: now,
        };
        inner
            .scale_requests
            .insert(record.id.clone(), record.clone());
        let data = serde_json::to_value(&record)?;
        self.emit(
            &mut inner,
            app_id,
            EventType::ScaleRequest,
            &record.id,
            EventOp::Create,
            data,
        );
        Ok(record)
    }

    async fn update_scale_request_state(
        &self,
        scale_request_id: &str,
        state: ScaleState,
    ) -> Result<ScaleRequestRecord, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let record = {
            let record = inner
                .scale_requests
                .get_mut(scale_request_id)
                .ok_or_else(|| StoreError::NotFound(format!("scale request {scale_request_id}")))?;
            record.state = state;
            record.updated_at = Utc::now();
            record.clone()
        };
        if state == ScaleState::Complete {
            let key = (record.app_id.clone(), record.release_id.clone());
            let now = Utc::now();
            let formation = inner.formations.entry(key).or_insert_with(|| FormationRecord {
                app_id: record.app_id.clone(),
                release_id: record.release_id.clone(),
                processes: ProcessCounts::new(),
                tags: ProcessTags::new(),
                created_at: now,
                updated_at: now,
            });
            if let Some(processes) = &record.new_processes {
                formation.processes = processes.clone();
            }
            if let Some(tags) = &record.new_tags {
                formation.tags = tags.clone();
            }
            formation.updated_at = now;
        }
        let data = serde_json::to_value(&record)?;
        self.emit(
            &mut inner,
            &record.app_id,
            EventType::ScaleRequest,
            scale_request_id,
            EventOp::Update,
            data,
        );
        Ok(record)
    }

    async fn latest_scale_request(
        &self,
        app_id: &str,
        release_id: &str,
    ) -> Result<Option<ScaleRequestRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .scale_requests
            .values()
            .filter(|sr| sr.app_id == app_id && sr.release_id == release_id)
            .max_by_key(|sr| (sr.updated_at, sr.created_at))
            .cloned())
    }

    async fn get_formation(
        &self,
        app_id: &str,
        release_id: &str,
    ) -> Result<FormationRecord, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .formations
            .get(&(app_id.to_string(), release_id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("formation {app_id}/{release_id}")))
    }

    async fn create_deployment(
        &self,
        app_id: &str,
        new_release_id: &str,
    ) -> Result<DeploymentRecord, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.releases.contains_key(new_release_id) {
            return Err(StoreError::NotFound(format!("release {new_release_id}")));
        }
        let old_release_id = inner.app_releases.get(app_id).cloned();
        let processes = old_release_id
            .as_ref()
            .and_then(|old| {
                inner
                    .formations
                    .get(&(app_id.to_string(), old.clone()))
                    .map(|f| f.processes.clone())
            })
            .unwrap_or_default();
        let record = DeploymentRecord {
            id: Uuid::new_v4().to_string(),
            app_id: app_id.to_string(),
            old_release_id,
            new_release_id: new_release_id.to_string(),
            status: DeployState::Pending,
            processes,
            created_at: Utc::now(),
            finished_at: None,
        };
        inner
            .deployments
            .insert(record.id.clone(), record.clone());
        let data = serde_json::to_value(&DeploymentEventData {
            status: DeployState::Pending,
            job_type: String::new(),
            job_state: String::new(),
            error: None,
        })?;
        self.emit(
            &mut inner,
            app_id,
            EventType::Deployment,
            &record.id,
            EventOp::Create,
            data,
        );
        Ok(record)
    }

    async fn get_deployment(&self, deployment_id: &str) -> Result<DeploymentRecord, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .deployments
            .get(deployment_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("deployment {deployment_id}")))
    }

    async fn get_expanded_deployment(
        &self,
        deployment_id: &str,
    ) -> Result<ExpandedDeploymentRecord, StoreError> {
        let inner = self.inner.lock().unwrap();
        let deployment = inner
            .deployments
            .get(deployment_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("deployment {deployment_id}")))?;
        Ok(Self::expand(&inner, deployment))
    }

    async fn list_deployments(
        &self,
        opts: &ListDeploymentOptions,
    ) -> Result<Vec<ExpandedDeploymentRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut deployments: Vec<DeploymentRecord> = inner
            .deployments
            .values()
            .filter(|d| {
                (opts.app_ids.is_empty() || opts.app_ids.contains(&d.app_id))
                    && (opts.deployment_ids.is_empty() || opts.deployment_ids.contains(&d.id))
            })
            .cloned()
            .collect();
        deployments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if opts.page_token.size > 0 {
            deployments.truncate(opts.page_token.size as usize);
        }
        Ok(deployments
            .into_iter()
            .map(|d| Self::expand(&inner, d))
            .collect())
    }

    async fn record_deployment_event(
        &self,
        deployment_id: &str,
        status: DeployState,
        job_type: &str,
        job_state: &str,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let (app_id, new_release_id) = {
            let deployment = inner
                .deployments
                .get_mut(deployment_id)
                .ok_or_else(|| StoreError::NotFound(format!("deployment {deployment_id}")))?;
            deployment.status = status;
            if matches!(status, DeployState::Complete | DeployState::Failed) {
                deployment.finished_at = Some(Utc::now());
            }
            (deployment.app_id.clone(), deployment.new_release_id.clone())
        };
        let data = serde_json::to_value(&DeploymentEventData {
            status,
            job_type: job_type.to_string(),
            job_state: job_state.to_string(),
            error: error.map(|e| e.to_string()),
        })?;
        self.emit(
            &mut inner,
            &app_id,
            EventType::Deployment,
            deployment_id,
            EventOp::Update,
            data,
        );
        if status == DeployState::Complete {
            let release = inner.releases.get(&new_release_id).cloned();
            if let Some(release) = release {
                inner
                    .app_releases
                    .insert(app_id.clone(), new_release_id.clone());
                let data = serde_json::to_value(&release)?;
                self.emit(
                    &mut inner,
                    &app_id,
                    EventType::AppRelease,
                    &new_release_id,
                    EventOp::Create,
                    data,
                );
            }
        }
        Ok(())
    }
}
