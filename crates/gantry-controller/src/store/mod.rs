// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for the controller.
//!
//! This module defines the store abstraction the handlers program against and
//! the domain records it traffics in. Two backends exist: Postgres for
//! production and an in-memory store for tests. Every mutation appends a row
//! to the store's ordered event log, which is what the event fabric fans out
//! to streaming RPC subscribers.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::PostgresStore;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::names::PageToken;

/// Process-type -> instance-count map.
pub type ProcessCounts = HashMap<String, i32>;

/// Process-type -> (key -> value) tag map.
pub type ProcessTags = HashMap<String, HashMap<String, String>>;

/// Type of object an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    App,
    AppDeletion,
    AppRelease,
    Release,
    ScaleRequest,
    Deployment,
}

impl EventType {
    /// Stable string form used in the event log.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::App => "app",
            EventType::AppDeletion => "app_deletion",
            EventType::AppRelease => "app_release",
            EventType::Release => "release",
            EventType::ScaleRequest => "scale_request",
            EventType::Deployment => "deployment",
        }
    }

    /// Parse the string form back; unknown strings return `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "app" => Some(EventType::App),
            "app_deletion" => Some(EventType::AppDeletion),
            "app_release" => Some(EventType::AppRelease),
            "release" => Some(EventType::Release),
            "scale_request" => Some(EventType::ScaleRequest),
            "deployment" => Some(EventType::Deployment),
            _ => None,
        }
    }
}

/// Operation recorded by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOp {
    Create,
    Update,
    Delete,
}

impl EventOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOp::Create => "create",
            EventOp::Update => "update",
            EventOp::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(EventOp::Create),
            "update" => Some(EventOp::Update),
            "delete" => Some(EventOp::Delete),
            _ => None,
        }
    }
}

/// Scale request lifecycle state: pending until an external worker publishes
/// a terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleState {
    Pending,
    Cancelled,
    Complete,
}

impl ScaleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleState::Pending => "pending",
            ScaleState::Cancelled => "cancelled",
            ScaleState::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ScaleState::Pending),
            "cancelled" => Some(ScaleState::Cancelled),
            "complete" => Some(ScaleState::Complete),
            _ => None,
        }
    }
}

/// Deployment lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    Pending,
    Running,
    Complete,
    Failed,
}

impl DeployState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployState::Pending => "pending",
            DeployState::Running => "running",
            DeployState::Complete => "complete",
            DeployState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeployState::Pending),
            "running" => Some(DeployState::Running),
            "complete" => Some(DeployState::Complete),
            "failed" => Some(DeployState::Failed),
            _ => None,
        }
    }
}

/// App record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRecord {
    /// Monotonic insertion sequence, used as the pagination cursor.
    pub seq: i64,
    /// Unique identifier (uuid).
    pub id: String,
    /// Human name.
    pub name: String,
    /// Label map.
    pub meta: HashMap<String, String>,
    /// Deploy strategy.
    pub strategy: String,
    /// Deploy timeout in seconds.
    pub deploy_timeout: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields of an app that `update_app` may change.
#[derive(Debug, Clone, Default)]
pub struct AppUpdate {
    pub meta: Option<HashMap<String, String>>,
    pub strategy: Option<String>,
    pub deploy_timeout: Option<i64>,
}

/// Release record. The body (artifacts, process types, env) is passed through
/// verbatim; the controller does not interpret it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub id: String,
    pub app_id: String,
    pub artifacts: Vec<String>,
    pub env: HashMap<String, String>,
    pub process_types: Vec<String>,
    pub meta: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Body of a release to create.
#[derive(Debug, Clone, Default)]
pub struct NewRelease {
    pub artifacts: Vec<String>,
    pub env: HashMap<String, String>,
    pub process_types: Vec<String>,
    pub meta: HashMap<String, String>,
}

/// Scale request record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleRequestRecord {
    pub id: String,
    pub app_id: String,
    pub release_id: String,
    pub state: ScaleState,
    pub old_processes: Option<ProcessCounts>,
    pub new_processes: Option<ProcessCounts>,
    pub old_tags: Option<ProcessTags>,
    pub new_tags: Option<ProcessTags>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Formation record: the current process counts and tags of one
/// (app, release) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormationRecord {
    pub app_id: String,
    pub release_id: String,
    pub processes: ProcessCounts,
    pub tags: ProcessTags,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Deployment record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub app_id: String,
    pub old_release_id: Option<String>,
    pub new_release_id: String,
    pub status: DeployState,
    pub processes: ProcessCounts,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Deployment joined with its releases and the job state of its latest event.
#[derive(Debug, Clone)]
pub struct ExpandedDeploymentRecord {
    pub deployment: DeploymentRecord,
    pub old_release: Option<ReleaseRecord>,
    pub new_release: Option<ReleaseRecord>,
    pub job_state: String,
}

/// Payload of a deployment event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentEventData {
    pub status: DeployState,
    #[serde(default)]
    pub job_type: String,
    #[serde(default)]
    pub job_state: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// One row of the append-only event log. `id` is strictly increasing and
/// defines a total order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub app_id: String,
    pub object_type: EventType,
    pub object_id: String,
    pub op: EventOp,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Filter for [`ControllerStore::list_events`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// App ids to include; empty means all apps.
    pub app_ids: Vec<String>,
    /// Object types to include; empty means all types.
    pub object_types: Vec<EventType>,
    /// Exact object id; empty means all objects.
    pub object_id: String,
}

/// Options for [`ControllerStore::list_deployments`].
#[derive(Debug, Clone, Default)]
pub struct ListDeploymentOptions {
    pub page_token: PageToken,
    pub app_ids: Vec<String>,
    pub deployment_ids: Vec<String>,
}

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON (de)serialization of a record or payload failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value could not be decoded into a domain type.
    #[error("decode error: {0}")]
    Decode(String),

    /// The change feed could not be opened or died.
    #[error("event feed error: {0}")]
    Feed(String),
}

/// Persistence interface used by the RPC handlers.
///
/// Implementations must emit one event-log row per mutation so streaming
/// subscribers observe every change, and must deliver `subscribe_changes`
/// rows in event-id order.
#[async_trait]
pub trait ControllerStore: Send + Sync {
    async fn create_app(
        &self,
        name: &str,
        meta: HashMap<String, String>,
    ) -> Result<AppRecord, StoreError>;

    async fn get_app(&self, app_id: &str) -> Result<AppRecord, StoreError>;

    /// One page of apps in insertion order, plus the token for the next page
    /// when more rows exist.
    async fn list_apps_page(
        &self,
        token: &PageToken,
    ) -> Result<(Vec<AppRecord>, Option<PageToken>), StoreError>;

    async fn update_app(&self, app_id: &str, update: AppUpdate) -> Result<AppRecord, StoreError>;

    /// The app's current release.
    async fn get_app_release(&self, app_id: &str) -> Result<ReleaseRecord, StoreError>;

    /// Point the app at a new current release, emitting an `app_release`
    /// event.
    async fn set_app_release(&self, app_id: &str, release_id: &str) -> Result<(), StoreError>;

    async fn create_release(
        &self,
        app_id: &str,
        release: NewRelease,
    ) -> Result<ReleaseRecord, StoreError>;

    async fn get_release(&self, release_id: &str) -> Result<ReleaseRecord, StoreError>;

    /// Events matching the filter, newest first. `before_id` restricts to
    /// ids strictly below it; `count` of zero means no limit.
    async fn list_events(
        &self,
        filter: &EventFilter,
        before_id: Option<i64>,
        count: usize,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Open the store's change feed. Rows arrive in event-id order.
    async fn subscribe_changes(&self) -> Result<mpsc::Receiver<EventRecord>, StoreError>;

    /// Insert a scale request in state pending. The old processes/tags are
    /// captured from the current formation.
    async fn create_scale_request(
        &self,
        app_id: &str,
        release_id: &str,
        new_processes: Option<ProcessCounts>,
        new_tags: Option<ProcessTags>,
    ) -> Result<ScaleRequestRecord, StoreError>;

    /// Transition a scale request; completing one applies its new
    /// processes/tags to the formation. External workers drive this.
    async fn update_scale_request_state(
        &self,
        scale_request_id: &str,
        state: ScaleState,
    ) -> Result<ScaleRequestRecord, StoreError>;

    /// Most recently updated scale request for the (app, release) pair.
    async fn latest_scale_request(
        &self,
        app_id: &str,
        release_id: &str,
    ) -> Result<Option<ScaleRequestRecord>, StoreError>;

    async fn get_formation(
        &self,
        app_id: &str,
        release_id: &str,
    ) -> Result<FormationRecord, StoreError>;

    /// Insert a deployment in state pending.
    async fn create_deployment(
        &self,
        app_id: &str,
        new_release_id: &str,
    ) -> Result<DeploymentRecord, StoreError>;

    async fn get_deployment(&self, deployment_id: &str) -> Result<DeploymentRecord, StoreError>;

    async fn get_expanded_deployment(
        &self,
        deployment_id: &str,
    ) -> Result<ExpandedDeploymentRecord, StoreError>;

    async fn list_deployments(
        &self,
        opts: &ListDeploymentOptions,
    ) -> Result<Vec<ExpandedDeploymentRecord>, StoreError>;

    /// Record a deployment transition published by an external worker.
    /// Completing a deployment also points the app at the new release.
    async fn record_deployment_event(
        &self,
        deployment_id: &str,
        status: DeployState,
        job_type: &str,
        job_state: &str,
        error: Option<&str>,
    ) -> Result<(), StoreError>;
}
