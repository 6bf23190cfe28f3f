// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event subscription fabric.
//!
//! One process-wide listener holds the store's change feed open and fans each
//! row out to in-memory subscribers filtered by app id, object type and
//! object id. Every streaming RPC builds a [`Subscription`] on top: one
//! underlying subscriber per app id, merged into a single channel.
//!
//! Subscriber queues are bounded. A subscriber that cannot keep up is closed
//! after its error cell is set, so the slow consumer surfaces a defined
//! failure instead of stalling the listener.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ControllerError;
use crate::store::{ControllerStore, EventRecord, EventType};

/// Depth of each subscriber's event queue.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 64;

/// Error slot set at most once; the first error wins.
#[derive(Clone, Default)]
pub struct ErrorCell(Arc<Mutex<Option<ControllerError>>>);

impl ErrorCell {
    /// Record the error unless one is already set.
    pub fn set(&self, err: ControllerError) {
        let mut slot = self.0.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Take the recorded error, leaving the cell empty.
    pub fn take(&self) -> Option<ControllerError> {
        self.0.lock().unwrap().take()
    }
}

struct SubscriberEntry {
    app_id: String,
    object_types: Vec<EventType>,
    object_id: String,
    tx: mpsc::Sender<Arc<EventRecord>>,
    err: ErrorCell,
}

impl SubscriberEntry {
    fn matches(&self, event: &EventRecord) -> bool {
        (self.app_id.is_empty() || self.app_id == event.app_id)
            && self.object_types.contains(&event.object_type)
            && (self.object_id.is_empty() || self.object_id == event.object_id)
    }
}

struct ListenerShared {
    subscribers: Mutex<HashMap<u64, SubscriberEntry>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// A single filtered subscriber allocated on the listener.
struct EventSubscriber {
    id: u64,
    shared: Arc<ListenerShared>,
    rx: mpsc::Receiver<Arc<EventRecord>>,
    err: ErrorCell,
}

/// Process-wide event listener, lazily opened on first subscribe.
pub struct EventHub {
    store: Arc<dyn ControllerStore>,
    listener: tokio::sync::Mutex<Option<Arc<ListenerShared>>>,
}

impl EventHub {
    /// Create a hub over the given store. The change feed is not opened
    /// until the first subscriber arrives.
    pub fn new(store: Arc<dyn ControllerStore>) -> Self {
        Self {
            store,
            listener: tokio::sync::Mutex::new(None),
        }
    }

    /// Return the live listener, opening or reopening the change feed as
    /// needed. The mutex guarantees concurrent first-use opens exactly one
    /// feed connection.
    async fn listener(&self) -> Result<Arc<ListenerShared>, ControllerError> {
        let mut guard = self.listener.lock().await;
        if let Some(shared) = guard.as_ref() {
            if !shared.closed.load(Ordering::Acquire) {
                return Ok(shared.clone());
            }
        }
        let feed = self.store.subscribe_changes().await?;
        let shared = Arc::new(ListenerShared {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(dispatch_loop(shared.clone(), feed));
        debug!("event listener opened");
        *guard = Some(shared.clone());
        Ok(shared)
    }

    async fn subscribe(
        &self,
        app_id: &str,
        object_types: &[EventType],
        object_id: &str,
    ) -> Result<EventSubscriber, ControllerError> {
        let shared = self.listener().await?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let err = ErrorCell::default();
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        shared.subscribers.lock().unwrap().insert(
            id,
            SubscriberEntry {
                app_id: app_id.to_string(),
                object_types: object_types.to_vec(),
                object_id: object_id.to_string(),
                tx,
                err: err.clone(),
            },
        );
        Ok(EventSubscriber {
            id,
            shared,
            rx,
            err,
        })
    }
}

async fn dispatch_loop(shared: Arc<ListenerShared>, mut feed: mpsc::Receiver<EventRecord>) {
    while let Some(event) = feed.recv().await {
        let event = Arc::new(event);
        let mut dropped = Vec::new();
        {
            let subscribers = shared.subscribers.lock().unwrap();
            for (id, entry) in subscribers.iter() {
                if !entry.matches(&event) {
                    continue;
                }
                match entry.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        entry.err.set(ControllerError::Internal(format!(
                            "event subscriber overflowed ({SUBSCRIBER_QUEUE_DEPTH} queued events)"
                        )));
                        warn!(subscriber = id, "closing slow event subscriber");
                        dropped.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dropped.push(*id);
                    }
                }
            }
        }
        if !dropped.is_empty() {
            let mut subscribers = shared.subscribers.lock().unwrap();
            for id in dropped {
                subscribers.remove(&id);
            }
        }
    }

    // Feed ended underneath us. Close every subscriber with an error so the
    // handlers surface a defined failure rather than a silent end-of-stream.
    shared.closed.store(true, Ordering::Release);
    let mut subscribers = shared.subscribers.lock().unwrap();
    for (_, entry) in subscribers.drain() {
        entry
            .err
            .set(ControllerError::Internal("event feed closed".to_string()));
    }
    debug!("event listener closed");
}

struct SubscriberControl {
    id: u64,
    shared: Arc<ListenerShared>,
    err: ErrorCell,
}

/// Per-RPC aggregation of one or more filtered subscribers into a single
/// merged event channel.
///
/// Dropping the subscription closes every underlying subscriber; the merged
/// channel then closes once the last forwarder exits.
pub struct Subscription {
    rx: mpsc::Receiver<Arc<EventRecord>>,
    controls: Vec<SubscriberControl>,
    closed: bool,
}

/// Open a merged subscription. An empty `app_ids` list subscribes a single
/// wildcard (any-app) subscriber.
pub async fn subscribe_events(
    hub: &EventHub,
    app_ids: &[String],
    object_types: &[EventType],
    object_id: &str,
) -> Result<Subscription, ControllerError> {
    let wildcard = [String::new()];
    let app_ids: &[String] = if app_ids.is_empty() { &wildcard } else { app_ids };

    let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
    let mut controls = Vec::with_capacity(app_ids.len());
    for app_id in app_ids {
        let subscriber = hub.subscribe(app_id, object_types, object_id).await?;
        controls.push(SubscriberControl {
            id: subscriber.id,
            shared: subscriber.shared,
            err: subscriber.err,
        });
        let tx = tx.clone();
        let mut sub_rx = subscriber.rx;
        tokio::spawn(async move {
            while let Some(event) = sub_rx.recv().await {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
    }
    Ok(Subscription {
        rx,
        controls,
        closed: false,
    })
}

impl Subscription {
    /// Receive the next event, or `None` once every underlying subscriber
    /// has closed.
    pub async fn recv(&mut self) -> Option<Arc<EventRecord>> {
        self.rx.recv().await
    }

    /// Close every underlying subscriber. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for control in &self.controls {
            control
                .shared
                .subscribers
                .lock()
                .unwrap()
                .remove(&control.id);
        }
    }

    /// First error recorded by any underlying subscriber, if any.
    pub fn take_error(&mut self) -> Option<ControllerError> {
        self.controls.iter().find_map(|control| control.err.take())
    }

    /// Close and report the aggregated error cell.
    pub fn finish(mut self) -> Result<(), ControllerError> {
        self.close();
        match self.take_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
