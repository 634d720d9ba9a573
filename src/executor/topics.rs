use crate::core::ClassifiedError;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// The broker-side topics the executor checks, creates and deletes.
///
/// Errors come back already classified: an unreachable broker is an
/// infrastructure failure, not a problem with the statement.
#[async_trait]
pub trait TopicClient: Send + Sync {
    async fn topic_exists(&self, topic: &str) -> Result<bool, ClassifiedError>;

    async fn create_topic(&self, topic: &str) -> Result<(), ClassifiedError>;

    async fn delete_topic(&self, topic: &str) -> Result<(), ClassifiedError>;
}

#[derive(Default)]
struct TopicState {
    topics: BTreeSet<String>,
    undeletable: BTreeSet<String>,
}

/// Topic registry kept in memory, with switches for failure injection.
#[derive(Clone)]
pub struct InMemoryTopicClient {
    state: Arc<Mutex<TopicState>>,
    available: Arc<AtomicBool>,
}

impl Default for InMemoryTopicClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTopicClient {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TopicState::default())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn with_topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::new();
        if let Ok(mut state) = client.state.lock() {
            state.topics.extend(topics.into_iter().map(Into::into));
        }
        client
    }

    /// Makes a topic visible, as if it finished propagating.
    pub fn add_topic(&self, topic: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.topics.insert(topic.into());
        }
    }

    /// Deleting this topic will fail.
    pub fn deny_delete(&self, topic: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.undeletable.insert(topic.into());
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn topics(&self) -> BTreeSet<String> {
        self.state
            .lock()
            .map(|state| state.topics.clone())
            .unwrap_or_default()
    }

    fn ensure_available(&self) -> Result<(), ClassifiedError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClassifiedError::infrastructure(
                "Kafka cluster is not reachable",
            ))
        }
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, TopicState>, ClassifiedError> {
        self.state
            .lock()
            .map_err(|err| ClassifiedError::infrastructure(format!("topic registry poisoned: {}", err)))
    }
}

#[async_trait]
impl TopicClient for InMemoryTopicClient {
    async fn topic_exists(&self, topic: &str) -> Result<bool, ClassifiedError> {
        self.ensure_available()?;
        Ok(self.lock_state()?.topics.contains(topic))
    }

    async fn create_topic(&self, topic: &str) -> Result<(), ClassifiedError> {
        self.ensure_available()?;
        self.lock_state()?.topics.insert(topic.to_string());
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<(), ClassifiedError> {
        self.ensure_available()?;
        let mut state = self.lock_state()?;
        if state.undeletable.contains(topic) {
            return Err(ClassifiedError::fatal(format!(
                "Not authorized to delete topic '{}'",
                topic
            )));
        }
        state.topics.remove(topic);
        Ok(())
    }
}
