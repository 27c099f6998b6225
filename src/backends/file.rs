use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::naming::{ensure_active, persisted_now, physical_name};
use super::{bind_replacement, check_entity, check_query, record_rejection, stamp_events};
use crate::config::{FileStoreConfig, StoreConfig};
use crate::data_store::DataStore;
use crate::entity::{EntityMetadata, PropertyBag};
use crate::error::{require_name, StoreError, StoreResult};
use crate::event_sourcing::{check_append, EventEnvelope, EventStore};
use crate::messaging::{deliver, failure_reason, MessageBusStore, MessageHandler, PendingMessage};
use crate::metrics::StoreMetrics;
use crate::query::{evaluate, JoinedContainers, Query};

const BACKEND: &str = "file";

// ============================================================================
// Durable local file backend
// ============================================================================
//
// Layout under the configured root:
//
//   data/<container>.json                 entities, insertion order
//   events/<container>/<id>.json          one stream per file
//   bus/<topic>/<subscription>.json       pending queue per subscription
//
// Every path segment goes through `physical_name`. A file is only ever
// replaced by writing a sibling `.json.tmp`, syncing it and renaming it over
// the original, so a crash leaves either the old or the new content.
//
// All file access is serialized by `io_lock`. Receives additionally hold a
// per-subscription lock across the handler call; `io_lock` is released
// while the handler runs.
//
// ============================================================================

pub struct FileStore {
    root: PathBuf,
    config: StoreConfig,
    metrics: Arc<StoreMetrics>,
    io_lock: Mutex<()>,
    receivers: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `config.root`.
    pub async fn open(config: FileStoreConfig) -> StoreResult<Self> {
        Self::open_with_metrics(config, Arc::new(StoreMetrics::default())).await
    }

    pub async fn open_with_metrics(config: FileStoreConfig, metrics: Arc<StoreMetrics>) -> StoreResult<Self> {
        for area in ["data", "events", "bus"] {
            fs::create_dir_all(config.root.join(area)).await?;
        }
        tracing::info!(backend = BACKEND, root = %config.root.display(), "File store opened");

        Ok(Self {
            root: config.root,
            config: config.store,
            metrics,
            io_lock: Mutex::new(()),
            receivers: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metrics(&self) -> Arc<StoreMetrics> {
        self.metrics.clone()
    }

    fn container_path(&self, container: &str) -> PathBuf {
        self.root
            .join("data")
            .join(format!("{}.json", physical_name(container)))
    }

    fn streams_dir(&self, container: &str) -> PathBuf {
        self.root.join("events").join(physical_name(container))
    }

    fn stream_path(&self, container: &str, id: &str) -> PathBuf {
        self.streams_dir(container)
            .join(format!("{}.json", physical_name(id)))
    }

    fn topic_dir(&self, topic: &str) -> PathBuf {
        self.root.join("bus").join(physical_name(topic))
    }

    fn subscription_path(&self, topic: &str, subscription: &str) -> PathBuf {
        self.topic_dir(topic)
            .join(format!("{}.json", physical_name(subscription)))
    }

    async fn load_container(&self, container: &str) -> StoreResult<Vec<PropertyBag>> {
        Ok(read_json(&self.container_path(container)).await?.unwrap_or_default())
    }

    async fn receive_lock(&self, topic: &str, subscription: &str) -> Arc<Mutex<()>> {
        let mut receivers = self.receivers.lock().await;
        receivers
            .entry((topic.to_string(), subscription.to_string()))
            .or_default()
            .clone()
    }
}

// ============================================================================
// File helpers
// ============================================================================

/// `Ok(None)` when the file does not exist.
async fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::Unexpected(format!(
            "failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::unexpected(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(dir).await?;

    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(value)?;
    let mut file = fs::File::create(&tmp_path).await?;
    file.write_all(&json).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp_path, path).await?;
    Ok(())
}

async fn remove_path(path: &Path) -> StoreResult<()> {
    let result = if fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false) {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    };
    match result {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

// ============================================================================
// DataStore
// ============================================================================

#[async_trait]
impl DataStore for FileStore {
    async fn add(
        &self,
        container: &str,
        mut entity: PropertyBag,
        cancel: &CancellationToken,
    ) -> StoreResult<PropertyBag> {
        check_entity(container, &entity)?;
        let started = Instant::now();

        let _io = self.io_lock.lock().await;
        let mut entities = self.load_container(container).await?;
        if entities.iter().any(|existing| existing.id == entity.id) {
            return Err(StoreError::DuplicateEntity {
                container: container.to_string(),
                id: entity.id,
            });
        }

        entity.last_persisted_at = Some(persisted_now(None));
        entities.push(entity.clone());
        ensure_active(cancel)?;
        write_json_atomic(&self.container_path(container), &entities).await?;

        self.metrics.record_write(BACKEND, "add");
        self.metrics.observe(BACKEND, "add", started.elapsed().as_secs_f64());
        tracing::info!(backend = BACKEND, container = %container, id = %entity.id, "Entity added");
        Ok(entity)
    }

    async fn count(&self, container: &str, cancel: &CancellationToken) -> StoreResult<usize> {
        require_name("container name", container)?;
        ensure_active(cancel)?;

        let _io = self.io_lock.lock().await;
        Ok(self.load_container(container).await?.len())
    }

    async fn query(
        &self,
        container: &str,
        query: &Query,
        metadata: &EntityMetadata,
        cancel: &CancellationToken,
    ) -> StoreResult<Vec<PropertyBag>> {
        check_query(container, query)?;
        ensure_active(cancel)?;
        let started = Instant::now();

        let (entities, joined) = {
            let _io = self.io_lock.lock().await;
            let entities = self.load_container(container).await?;
            let mut joined = JoinedContainers::new();
            for name in query.joined_containers() {
                joined.insert(name.to_string(), self.load_container(name).await?);
            }
            (entities, joined)
        };
        let rows = evaluate(&entities, query, metadata, &joined);

        self.metrics.record_query(BACKEND, rows.len());
        self.metrics.observe(BACKEND, "query", started.elapsed().as_secs_f64());
        tracing::debug!(backend = BACKEND, container = %container, rows = rows.len(), "Query evaluated");
        Ok(rows)
    }

    async fn retrieve(
        &self,
        container: &str,
        id: &str,
        metadata: &EntityMetadata,
        cancel: &CancellationToken,
    ) -> StoreResult<Option<PropertyBag>> {
        require_name("container name", container)?;
        require_name("entity id", id)?;
        ensure_active(cancel)?;

        let entities = {
            let _io = self.io_lock.lock().await;
            self.load_container(container).await?
        };
        let found = entities
            .into_iter()
            .find(|e| e.id == id)
            .map(|bag| metadata.materialize(bag));

        tracing::debug!(backend = BACKEND, container = %container, id = %id, found = found.is_some(), "Entity retrieved");
        Ok(found)
    }

    async fn replace(
        &self,
        container: &str,
        id: &str,
        entity: PropertyBag,
        cancel: &CancellationToken,
    ) -> StoreResult<PropertyBag> {
        let mut entity = bind_replacement(container, id, entity)?;
        let started = Instant::now();

        let _io = self.io_lock.lock().await;
        let mut entities = self.load_container(container).await?;
        let slot = entities
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::EntityNotFound {
                container: container.to_string(),
                id: id.to_string(),
            })?;

        entity.last_persisted_at = Some(persisted_now(slot.last_persisted_at));
        *slot = entity.clone();
        ensure_active(cancel)?;
        write_json_atomic(&self.container_path(container), &entities).await?;

        self.metrics.record_write(BACKEND, "replace");
        self.metrics.observe(BACKEND, "replace", started.elapsed().as_secs_f64());
        tracing::info!(backend = BACKEND, container = %container, id = %id, "Entity replaced");
        Ok(entity)
    }

    async fn remove(&self, container: &str, id: &str, cancel: &CancellationToken) -> StoreResult<()> {
        require_name("container name", container)?;
        require_name("entity id", id)?;

        let _io = self.io_lock.lock().await;
        let mut entities = self.load_container(container).await?;
        let before = entities.len();
        entities.retain(|e| e.id != id);
        if entities.len() == before {
            return Ok(());
        }

        ensure_active(cancel)?;
        write_json_atomic(&self.container_path(container), &entities).await?;
        self.metrics.record_write(BACKEND, "remove");
        tracing::info!(backend = BACKEND, container = %container, id = %id, "Entity removed");
        Ok(())
    }

    async fn destroy_all(&self, container: &str, cancel: &CancellationToken) -> StoreResult<()> {
        require_name("container name", container)?;
        self.config.capabilities.require_destructive("destroy_all")?;
        ensure_active(cancel)?;

        let _io = self.io_lock.lock().await;
        remove_path(&self.container_path(container)).await?;
        tracing::info!(backend = BACKEND, container = %container, "Container destroyed");
        Ok(())
    }
}

// ============================================================================
// EventStore
// ============================================================================

#[async_trait]
impl EventStore for FileStore {
    async fn get_event_stream(
        &self,
        container: &str,
        id: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<Vec<EventEnvelope>> {
        require_name("container name", container)?;
        require_name("entity id", id)?;
        ensure_active(cancel)?;

        let _io = self.io_lock.lock().await;
        Ok(read_json(&self.stream_path(container, id)).await?.unwrap_or_default())
    }

    async fn add_events(
        &self,
        container: &str,
        id: &str,
        mut events: Vec<EventEnvelope>,
        cancel: &CancellationToken,
    ) -> StoreResult<()> {
        require_name("container name", container)?;
        require_name("entity id", id)?;
        let started = Instant::now();

        let _io = self.io_lock.lock().await;
        let path = self.stream_path(container, id);
        let mut stream: Vec<EventEnvelope> = read_json(&path).await?.unwrap_or_default();
        let current = stream.last().map(|e| e.version).unwrap_or(0);

        check_append(container, id, current, &events)
            .map_err(|e| record_rejection(&self.metrics, BACKEND, container, id, e))?;

        stamp_events(id, &mut events);
        let appended = events.len();
        stream.extend(events);
        ensure_active(cancel)?;
        write_json_atomic(&path, &stream).await?;

        self.metrics.record_append(BACKEND, appended);
        self.metrics.observe(BACKEND, "add_events", started.elapsed().as_secs_f64());
        tracing::info!(
            backend = BACKEND,
            container = %container,
            id = %id,
            from_version = current + 1,
            to_version = current + appended as u64,
            "Events appended"
        );
        Ok(())
    }

    async fn destroy_all_streams(&self, container: &str, cancel: &CancellationToken) -> StoreResult<()> {
        require_name("container name", container)?;
        self.config.capabilities.require_destructive("destroy_all")?;
        ensure_active(cancel)?;

        let _io = self.io_lock.lock().await;
        remove_path(&self.streams_dir(container)).await?;
        tracing::info!(backend = BACKEND, container = %container, "Event streams destroyed");
        Ok(())
    }
}

// ============================================================================
// MessageBusStore
// ============================================================================

#[async_trait]
impl MessageBusStore for FileStore {
    async fn subscribe(&self, topic: &str, subscription: &str, cancel: &CancellationToken) -> StoreResult<()> {
        require_name("topic name", topic)?;
        require_name("subscription name", subscription)?;
        ensure_active(cancel)?;

        let _io = self.io_lock.lock().await;
        let path = self.subscription_path(topic, subscription);
        if read_json::<Vec<PendingMessage>>(&path).await?.is_none() {
            write_json_atomic(&path, &Vec::<PendingMessage>::new()).await?;
            tracing::debug!(backend = BACKEND, topic = %topic, subscription = %subscription, "Subscribed");
        }
        Ok(())
    }

    async fn send(&self, topic: &str, body: &str, cancel: &CancellationToken) -> StoreResult<()> {
        require_name("topic name", topic)?;

        let _io = self.io_lock.lock().await;
        let mut queues = Vec::new();
        match fs::read_dir(self.topic_dir(topic)).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) == Some("json") {
                        queues.push(path);
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        ensure_active(cancel)?;

        let message = PendingMessage::new(body);
        for path in &queues {
            let mut queue: Vec<PendingMessage> = read_json(path).await?.unwrap_or_default();
            queue.push(message.clone());
            write_json_atomic(path, &queue).await?;
        }

        self.metrics.record_send(BACKEND);
        tracing::info!(
            backend = BACKEND,
            topic = %topic,
            message_id = %message.message_id,
            subscriptions = queues.len(),
            "Message sent"
        );
        Ok(())
    }

    async fn receive_single(
        &self,
        topic: &str,
        subscription: &str,
        handler: MessageHandler,
        cancel: &CancellationToken,
    ) -> StoreResult<bool> {
        require_name("topic name", topic)?;
        require_name("subscription name", subscription)?;

        let receive_lock = self.receive_lock(topic, subscription).await;
        let _receiving = receive_lock.lock().await;
        ensure_active(cancel)?;

        let path = self.subscription_path(topic, subscription);
        let message = {
            let _io = self.io_lock.lock().await;
            let mut queue: Vec<PendingMessage> = match read_json(&path).await? {
                Some(queue) => queue,
                None => return Ok(false),
            };
            let head = match queue.first_mut() {
                Some(head) => {
                    head.delivery_count += 1;
                    head.clone()
                }
                None => return Ok(false),
            };
            write_json_atomic(&path, &queue).await?;
            head
        };

        if let Err(err) = deliver(&message, handler).await {
            self.metrics.record_handler_failure(BACKEND, failure_reason(&err));
            tracing::warn!(
                backend = BACKEND,
                topic = %topic,
                subscription = %subscription,
                message_id = %message.message_id,
                delivery_count = message.delivery_count,
                "Handler failed, message left pending: {}",
                err
            );
            return Err(err);
        }

        {
            let _io = self.io_lock.lock().await;
            if let Some(mut queue) = read_json::<Vec<PendingMessage>>(&path).await? {
                if queue.first().map(|m| m.message_id) == Some(message.message_id) {
                    queue.remove(0);
                    write_json_atomic(&path, &queue).await?;
                }
            }
        }

        self.metrics.record_ack(BACKEND);
        tracing::info!(
            backend = BACKEND,
            topic = %topic,
            subscription = %subscription,
            message_id = %message.message_id,
            "Message acknowledged"
        );
        Ok(true)
    }

    async fn pending_count(&self, topic: &str, subscription: &str, cancel: &CancellationToken) -> StoreResult<usize> {
        require_name("topic name", topic)?;
        require_name("subscription name", subscription)?;
        ensure_active(cancel)?;

        let _io = self.io_lock.lock().await;
        let queue: Option<Vec<PendingMessage>> = read_json(&self.subscription_path(topic, subscription)).await?;
        Ok(queue.map(|q| q.len()).unwrap_or(0))
    }

    async fn destroy_topic(&self, topic: &str, cancel: &CancellationToken) -> StoreResult<()> {
        require_name("topic name", topic)?;
        self.config.capabilities.require_destructive("destroy_all")?;
        ensure_active(cancel)?;

        let _io = self.io_lock.lock().await;
        remove_path(&self.topic_dir(topic)).await?;
        self.receivers.lock().await.retain(|(t, _), _| t != topic);
        tracing::info!(backend = BACKEND, topic = %topic, "Topic destroyed");
        Ok(())
    }
}
