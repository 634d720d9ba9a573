//! Cluster termination: the request, the resource release and the stop.
//!
//! A `TERMINATE CLUSTER` record goes through the log like any other command.
//! Applying it stops every query and releases the topics the cluster owns,
//! then the runner publishes its status and stops. A node that later finds
//! the record in its backlog runs only the termination, so terminated
//! queries are never brought back.

use crate::core::{ClassifiedError, Command};
use crate::executor::TopicClient;
use std::sync::Arc;
use tracing::{Level, event};

/// Text of a cluster-terminate request, optionally deleting extra topics.
pub fn terminate_cluster_statement(delete_topics: &[String]) -> String {
    if delete_topics.is_empty() {
        return "TERMINATE CLUSTER;".to_string();
    }
    let quoted: Vec<String> = delete_topics
        .iter()
        .map(|topic| format!("'{}'", topic))
        .collect();
    format!("TERMINATE CLUSTER DELETE TOPICS ({});", quoted.join(", "))
}

/// The last cluster-terminate record of a replay backlog, if any.
pub fn find_cluster_terminate(backlog: &[Command]) -> Option<&Command> {
    backlog
        .iter()
        .rev()
        .find(|command| command.id.is_cluster_terminate())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    /// Topic and the reason it could not be deleted.
    pub failed: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Deletes topics on termination. Failures are logged and reported, never raised.
#[derive(Clone)]
pub struct ResourceCleaner {
    topics: Arc<dyn TopicClient>,
}

impl ResourceCleaner {
    pub fn new(topics: Arc<dyn TopicClient>) -> Self {
        Self { topics }
    }

    pub async fn release<I>(&self, topics: I) -> CleanupReport
    where
        I: IntoIterator<Item = String>,
    {
        let mut report = CleanupReport::default();
        for topic in topics {
            match self.delete_if_present(&topic).await {
                Ok(true) => report.deleted.push(topic),
                Ok(false) => {}
                Err(err) => {
                    event!(
                        Level::WARN,
                        topic = %topic,
                        error = %err,
                        "failed to delete topic during cluster termination"
                    );
                    report.failed.push((topic, err.message));
                }
            }
        }
        report
    }

    async fn delete_if_present(&self, topic: &str) -> Result<bool, ClassifiedError> {
        if !self.topics.topic_exists(topic).await? {
            return Ok(false);
        }
        self.topics.delete_topic(topic).await?;
        Ok(true)
    }
}
