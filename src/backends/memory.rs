use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::naming::{ensure_active, persisted_now};
use super::{bind_replacement, check_entity, check_query, record_rejection, stamp_events};
use crate::config::StoreConfig;
use crate::data_store::DataStore;
use crate::entity::{EntityMetadata, PropertyBag};
use crate::error::{require_name, StoreError, StoreResult};
use crate::event_sourcing::{check_append, EventEnvelope, EventStore};
use crate::messaging::{deliver, failure_reason, MessageBusStore, MessageHandler, PendingMessage};
use crate::metrics::StoreMetrics;
use crate::query::{evaluate, JoinedContainers, Query};

const BACKEND: &str = "memory";

// ============================================================================
// In-memory backend
// ============================================================================
//
// Volatile; everything is lost when the store is dropped. Containers and
// streams each sit behind one RwLock so a write is atomic relative to every
// read. Subscriptions are shared through `Arc` so a long-running handler
// only blocks its own subscription.
//
// ============================================================================

#[derive(Default)]
struct Subscription {
    queue: Mutex<VecDeque<PendingMessage>>,
    /// Held for the whole hand-off, handler included.
    receiving: Mutex<()>,
}

type Streams = HashMap<String, HashMap<String, Vec<EventEnvelope>>>;
type Topics = HashMap<String, HashMap<String, Arc<Subscription>>>;

pub struct MemoryStore {
    config: StoreConfig,
    metrics: Arc<StoreMetrics>,
    /// Entities per container, in insertion order.
    containers: RwLock<HashMap<String, Vec<PropertyBag>>>,
    streams: RwLock<Streams>,
    topics: RwLock<Topics>,
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        Self::with_metrics(config, Arc::new(StoreMetrics::default()))
    }

    pub fn with_metrics(config: StoreConfig, metrics: Arc<StoreMetrics>) -> Self {
        Self {
            config,
            metrics,
            containers: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
        }
    }

    pub fn metrics(&self) -> Arc<StoreMetrics> {
        self.metrics.clone()
    }

    async fn subscription(&self, topic: &str, subscription: &str) -> Option<Arc<Subscription>> {
        let topics = self.topics.read().await;
        topics.get(topic).and_then(|subs| subs.get(subscription)).cloned()
    }
}

// ============================================================================
// DataStore
// ============================================================================

#[async_trait]
impl DataStore for MemoryStore {
    async fn add(
        &self,
        container: &str,
        mut entity: PropertyBag,
        cancel: &CancellationToken,
    ) -> StoreResult<PropertyBag> {
        check_entity(container, &entity)?;
        let started = Instant::now();

        let mut containers = self.containers.write().await;
        ensure_active(cancel)?;
        let entities = containers.entry(container.to_string()).or_default();
        if entities.iter().any(|existing| existing.id == entity.id) {
            return Err(StoreError::DuplicateEntity {
                container: container.to_string(),
                id: entity.id,
            });
        }

        entity.last_persisted_at = Some(persisted_now(None));
        entities.push(entity.clone());

        self.metrics.record_write(BACKEND, "add");
        self.metrics.observe(BACKEND, "add", started.elapsed().as_secs_f64());
        tracing::info!(backend = BACKEND, container = %container, id = %entity.id, "Entity added");
        Ok(entity)
    }

    async fn count(&self, container: &str, cancel: &CancellationToken) -> StoreResult<usize> {
        require_name("container name", container)?;
        ensure_active(cancel)?;

        let containers = self.containers.read().await;
        Ok(containers.get(container).map(Vec::len).unwrap_or(0))
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

        let containers = self.containers.read().await;
        let joined: JoinedContainers = query
            .joined_containers()
            .into_iter()
            .map(|name| (name.to_string(), containers.get(name).cloned().unwrap_or_default()))
            .collect();
        let entities = containers.get(container).map(Vec::as_slice).unwrap_or(&[]);
        let rows = evaluate(entities, query, metadata, &joined);

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

        let containers = self.containers.read().await;
        let found = containers
            .get(container)
            .and_then(|entities| entities.iter().find(|e| e.id == id))
            .cloned()
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

        let mut containers = self.containers.write().await;
        let slot = containers
            .get_mut(container)
            .and_then(|entities| entities.iter_mut().find(|e| e.id == id))
            .ok_or_else(|| StoreError::EntityNotFound {
                container: container.to_string(),
                id: id.to_string(),
            })?;
        ensure_active(cancel)?;

        entity.last_persisted_at = Some(persisted_now(slot.last_persisted_at));
        *slot = entity.clone();

        self.metrics.record_write(BACKEND, "replace");
        self.metrics.observe(BACKEND, "replace", started.elapsed().as_secs_f64());
        tracing::info!(backend = BACKEND, container = %container, id = %id, "Entity replaced");
        Ok(entity)
    }

    async fn remove(&self, container: &str, id: &str, cancel: &CancellationToken) -> StoreResult<()> {
        require_name("container name", container)?;
        require_name("entity id", id)?;

        let mut containers = self.containers.write().await;
        ensure_active(cancel)?;
        if let Some(entities) = containers.get_mut(container) {
            let before = entities.len();
            entities.retain(|e| e.id != id);
            if entities.len() != before {
                self.metrics.record_write(BACKEND, "remove");
                tracing::info!(backend = BACKEND, container = %container, id = %id, "Entity removed");
            }
        }
        Ok(())
    }

    async fn destroy_all(&self, container: &str, cancel: &CancellationToken) -> StoreResult<()> {
        require_name("container name", container)?;
        self.config.capabilities.require_destructive("destroy_all")?;
        ensure_active(cancel)?;

        self.containers.write().await.remove(container);
        tracing::info!(backend = BACKEND, container = %container, "Container destroyed");
        Ok(())
    }
}

// ============================================================================
// EventStore
// ============================================================================

#[async_trait]
impl EventStore for MemoryStore {
    async fn get_event_stream(
        &self,
        container: &str,
        id: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<Vec<EventEnvelope>> {
        require_name("container name", container)?;
        require_name("entity id", id)?;
        ensure_active(cancel)?;

        let streams = self.streams.read().await;
        Ok(streams
            .get(container)
            .and_then(|c| c.get(id))
            .cloned()
            .unwrap_or_default())
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

        let mut streams = self.streams.write().await;
        let current = streams
            .get(container)
            .and_then(|c| c.get(id))
            .and_then(|stream| stream.last())
            .map(|e| e.version)
            .unwrap_or(0);

        check_append(container, id, current, &events)
            .map_err(|e| record_rejection(&self.metrics, BACKEND, container, id, e))?;
        ensure_active(cancel)?;

        stamp_events(id, &mut events);
        let appended = events.len();
        streams
            .entry(container.to_string())
            .or_default()
            .entry(id.to_string())
            .or_default()
            .extend(events);

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

        self.streams.write().await.remove(container);
        tracing::info!(backend = BACKEND, container = %container, "Event streams destroyed");
        Ok(())
    }
}

// ============================================================================
// MessageBusStore
// ============================================================================

#[async_trait]
impl MessageBusStore for MemoryStore {
    async fn subscribe(&self, topic: &str, subscription: &str, cancel: &CancellationToken) -> StoreResult<()> {
        require_name("topic name", topic)?;
        require_name("subscription name", subscription)?;
        ensure_active(cancel)?;

        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_default()
            .entry(subscription.to_string())
            .or_default();
        tracing::debug!(backend = BACKEND, topic = %topic, subscription = %subscription, "Subscribed");
        Ok(())
    }

    async fn send(&self, topic: &str, body: &str, cancel: &CancellationToken) -> StoreResult<()> {
        require_name("topic name", topic)?;

        let topics = self.topics.read().await;
        ensure_active(cancel)?;
        let message = PendingMessage::new(body);
        let mut delivered = 0;
        if let Some(subscriptions) = topics.get(topic) {
            for subscription in subscriptions.values() {
                subscription.queue.lock().await.push_back(message.clone());
                delivered += 1;
            }
        }

        self.metrics.record_send(BACKEND);
        tracing::info!(
            backend = BACKEND,
            topic = %topic,
            message_id = %message.message_id,
            subscriptions = delivered,
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

        let sub = match self.subscription(topic, subscription).await {
            Some(sub) => sub,
            None => return Ok(false),
        };
        let _receiving = sub.receiving.lock().await;
        ensure_active(cancel)?;

        let message = {
            let mut queue = sub.queue.lock().await;
            match queue.front_mut() {
                Some(head) => {
                    head.delivery_count += 1;
                    head.clone()
                }
                None => return Ok(false),
            }
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

        let mut queue = sub.queue.lock().await;
        if queue.front().map(|m| m.message_id) == Some(message.message_id) {
            queue.pop_front();
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

        match self.subscription(topic, subscription).await {
            Some(sub) => Ok(sub.queue.lock().await.len()),
            None => Ok(0),
        }
    }

    async fn destroy_topic(&self, topic: &str, cancel: &CancellationToken) -> StoreResult<()> {
        require_name("topic name", topic)?;
        self.config.capabilities.require_destructive("destroy_all")?;
        ensure_active(cancel)?;

        self.topics.write().await.remove(topic);
        tracing::info!(backend = BACKEND, topic = %topic, "Topic destroyed");
        Ok(())
    }
}
