use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use streamcmd::{
    CommandConfig, CommandError, CommandLog, CommandNode, CommandStatusKind, FileCommandLog,
    InMemoryCommandTape, InMemoryTopicClient, LogPosition, MetaStoreExecutor, MetaStoreView,
    ReplayOutcome, RunnerState,
};
use tempfile::tempdir;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> CommandConfig {
    CommandConfig::new("it_")
        .max_statement_retries(2)
        .retry_backoff(Duration::from_millis(5), Duration::from_millis(20))
        .infrastructure_backoff(Duration::from_millis(10), Duration::from_millis(40))
        .poll_timeout(Duration::from_millis(20))
        .command_response_timeout(WAIT)
}

async fn start_node(
    config: CommandConfig,
    log: Arc<dyn CommandLog>,
    topics: &InMemoryTopicClient,
) -> (CommandNode, MetaStoreView) {
    let executor =
        MetaStoreExecutor::new(Arc::new(topics.clone())).with_command_topic(config.command_topic());
    let view = executor.view();
    let node = CommandNode::builder(config)
        .log(log)
        .executor(Box::new(executor))
        .topic_client(Arc::new(topics.clone()))
        .start()
        .await
        .unwrap();
    (node, view)
}

async fn wait_for_position(node: &CommandNode, position: LogPosition) {
    timeout(WAIT, async {
        while node.applied_position() < Some(position) {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn nodes_apply_the_same_commands_in_the_same_order() {
    let tape = InMemoryCommandTape::new();
    let topics = InMemoryTopicClient::with_topics(["pageviews", "users"]);
    let (leader, leader_view) = start_node(config(), Arc::new(tape.client()), &topics).await;
    let (follower, follower_view) = start_node(config(), Arc::new(tape.client()), &topics).await;

    for statement in [
        "CREATE STREAM PAGEVIEWS (USERID VARCHAR) WITH (KAFKA_TOPIC='pageviews');",
        "CREATE TABLE USERS (USERID VARCHAR) WITH (KAFKA_TOPIC='users');",
        "CREATE STREAM ENRICHED AS SELECT * FROM PAGEVIEWS P JOIN USERS U ON P.USERID = U.USERID;",
        "DROP TABLE USERS;",
    ] {
        leader.execute(statement).await.unwrap();
    }

    wait_for_position(&follower, LogPosition(4)).await;
    assert_eq!(*leader_view.current(), *follower_view.current());
    assert_eq!(
        follower
            .status(&"table/USERS/drop".parse().unwrap())
            .unwrap()
            .unwrap()
            .status,
        CommandStatusKind::Error
    );

    leader.close().await.unwrap();
    follower.close().await.unwrap();
}

#[tokio::test]
async fn poison_statement_does_not_block_the_next_one() {
    let tape = InMemoryCommandTape::new();
    let topics = InMemoryTopicClient::with_topics(["a"]);
    let (node, view) = start_node(config(), Arc::new(tape.client()), &topics).await;

    let bad = node.execute("DROP STREAM NOPE;").await.unwrap();
    assert_eq!(bad.status, CommandStatusKind::Error);
    assert!(bad.message.contains("NOPE does not exist"));

    let good = node
        .execute("CREATE STREAM A (X INT) WITH (KAFKA_TOPIC='a');")
        .await
        .unwrap();
    assert_eq!(good.status, CommandStatusKind::Success);
    assert!(view.current().source("A").is_some());
    node.close().await.unwrap();
}

#[tokio::test]
async fn duplicate_create_fails_without_corrupting_state() {
    let tape = InMemoryCommandTape::new();
    let topics = InMemoryTopicClient::with_topics(["a", "b"]);
    let (node, view) = start_node(config(), Arc::new(tape.client()), &topics).await;
    let create = "CREATE STREAM A (X INT) WITH (KAFKA_TOPIC='a');";

    let first = node.submit(create, BTreeMap::new()).await.unwrap();
    let second = node.submit(create, BTreeMap::new()).await.unwrap();
    let queue = node.queue();
    assert_eq!(
        queue.wait_for(&first, WAIT).await.unwrap().status,
        CommandStatusKind::Success
    );
    let duplicate = queue.wait_for(&second, WAIT).await.unwrap();
    assert_eq!(duplicate.status, CommandStatusKind::Error);
    assert!(duplicate.message.contains("already exists"));

    let after = node
        .execute("CREATE STREAM B AS SELECT * FROM A;")
        .await
        .unwrap();
    assert_eq!(after.status, CommandStatusKind::Success);
    let store = view.current();
    assert_eq!(store.source("A").unwrap().created_at_offset, Some(first.sequence_number));
    assert_eq!(store.running_queries(), 1);
    node.close().await.unwrap();
}

#[tokio::test]
async fn transient_failure_gives_up_after_retries() {
    let tape = InMemoryCommandTape::new();
    let topics = InMemoryTopicClient::new();
    let (node, _view) = start_node(config(), Arc::new(tape.client()), &topics).await;

    let status = node
        .execute("CREATE STREAM LATE (X INT) WITH (KAFKA_TOPIC='late');")
        .await
        .unwrap();
    assert_eq!(status.status, CommandStatusKind::Error);
    assert!(status.message.contains("Kafka topic does not exist: late"));
    assert!(status.message.contains("gave up after 3 attempts"));
    node.close().await.unwrap();
}

#[tokio::test]
async fn transient_failure_succeeds_once_the_topic_appears() {
    let tape = InMemoryCommandTape::new();
    let topics = InMemoryTopicClient::new();
    let config = config()
        .max_statement_retries(20)
        .retry_backoff(Duration::from_millis(5), Duration::from_millis(10));
    let (node, _view) = start_node(config, Arc::new(tape.client()), &topics).await;

    let propagation = {
        let topics = topics.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            topics.add_topic("late");
        })
    };
    let status = node
        .execute("CREATE STREAM LATE (X INT) WITH (KAFKA_TOPIC='late');")
        .await
        .unwrap();
    propagation.await.unwrap();
    assert_eq!(status.status, CommandStatusKind::Success);
    node.close().await.unwrap();
}

#[tokio::test]
async fn infrastructure_outage_pauses_in_order_and_wait_times_out() {
    let tape = InMemoryCommandTape::new();
    let topics = InMemoryTopicClient::with_topics(["src"]);
    let (node, view) = start_node(config(), Arc::new(tape.client()), &topics).await;
    let mut states = node.subscribe_state();

    topics.set_available(false);
    let first = node
        .submit("CREATE STREAM FIRST (X INT) WITH (KAFKA_TOPIC='src');", BTreeMap::new())
        .await
        .unwrap();
    let second = node
        .submit("CREATE STREAM SECOND (X INT) WITH (KAFKA_TOPIC='src');", BTreeMap::new())
        .await
        .unwrap();

    timeout(WAIT, states.wait_for(|state| *state == RunnerState::Degraded))
        .await
        .unwrap()
        .unwrap();
    let err = node
        .queue()
        .wait_for(&first, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::StatusTimeout { .. }));
    assert_eq!(
        node.status(&first.id).unwrap().unwrap().status,
        CommandStatusKind::Executing
    );
    assert_eq!(
        node.status(&second.id).unwrap().unwrap().status,
        CommandStatusKind::Queued
    );
    assert!(view.current().source("FIRST").is_none());

    topics.set_available(true);
    let queue = node.queue();
    let first_done = queue.wait_for(&first, WAIT).await.unwrap();
    let second_done = queue.wait_for(&second, WAIT).await.unwrap();
    assert_eq!(first_done.status, CommandStatusKind::Success);
    assert_eq!(second_done.status, CommandStatusKind::Success);
    assert!(first_done.updated_at <= second_done.updated_at);
    assert_eq!(node.state(), RunnerState::Running);
    node.close().await.unwrap();
}

#[tokio::test]
async fn late_waiter_still_sees_the_result() {
    let tape = InMemoryCommandTape::new();
    let topics = InMemoryTopicClient::with_topics(["a"]);
    let (node, _view) = start_node(config(), Arc::new(tape.client()), &topics).await;

    let queued = node
        .submit("CREATE STREAM A (X INT) WITH (KAFKA_TOPIC='a');", BTreeMap::new())
        .await
        .unwrap();
    wait_for_position(&node, LogPosition(1)).await;

    let status = node.queue().wait_for(&queued, Duration::ZERO).await.unwrap();
    assert_eq!(status.status, CommandStatusKind::Success);
    node.close().await.unwrap();
}

#[tokio::test]
async fn terminated_cluster_is_not_resurrected_on_restart() {
    let tape = InMemoryCommandTape::new();
    let topics = InMemoryTopicClient::with_topics(["src"]);
    let (node, _view) = start_node(config(), Arc::new(tape.client()), &topics).await;
    node.execute("CREATE STREAM SRC (X INT) WITH (KAFKA_TOPIC='src');")
        .await
        .unwrap();
    node.execute("CREATE STREAM OUT AS SELECT * FROM SRC;")
        .await
        .unwrap();
    let status = node.shutdown().await.unwrap().unwrap();
    assert_eq!(status.status, CommandStatusKind::Success);
    assert!(!topics.topics().contains("OUT"));

    let (restarted, view) = start_node(config(), Arc::new(tape.client()), &topics).await;
    assert_eq!(
        restarted.replay_outcome(),
        ReplayOutcome::Terminated { error: None }
    );
    assert_eq!(restarted.state(), RunnerState::Stopped);
    let store = view.current();
    assert!(store.queries.is_empty());
    assert!(store.source("OUT").is_none());
    assert!(!topics.topics().contains("OUT"));

    let err = restarted
        .submit("CREATE STREAM AGAIN (X INT);", BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::NotReady(_)));
}

#[tokio::test]
async fn file_log_survives_node_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("commands").join("command_topic.jsonl");
    let topics = InMemoryTopicClient::with_topics(["src"]);

    {
        let log = FileCommandLog::open(&path).await.unwrap();
        let (node, _view) = start_node(config(), Arc::new(log), &topics).await;
        node.execute("CREATE STREAM SRC (X INT) WITH (KAFKA_TOPIC='src');")
            .await
            .unwrap();
        node.execute("CREATE STREAM OUT AS SELECT * FROM SRC;")
            .await
            .unwrap();
        node.close().await.unwrap();
    }

    let log = FileCommandLog::open(&path).await.unwrap();
    let (node, view) = start_node(config(), Arc::new(log), &topics).await;
    assert_eq!(node.replay_outcome(), ReplayOutcome::Completed { replayed: 2 });
    let store = view.current();
    assert_eq!(store.running_queries(), 1);
    assert!(store.queries.contains_key("CSAS_OUT_1"));

    let queued = node
        .submit("CREATE TABLE T (X INT) WITH (KAFKA_TOPIC='src');", BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(queued.sequence_number, 2);
    node.close().await.unwrap();
}

#[tokio::test]
async fn node_stops_accepting_commands_when_its_runner_dies() {
    let tape = InMemoryCommandTape::new();
    let topics = InMemoryTopicClient::with_topics(["a"]);
    let (node, _view) = start_node(config(), Arc::new(tape.client()), &topics).await;
    let mut states = node.subscribe_state();
    assert!(node.is_ready());

    tape.set_available(false);
    timeout(WAIT, states.wait_for(|state| *state == RunnerState::Stopped))
        .await
        .unwrap()
        .unwrap();
    tape.set_available(true);

    assert!(!node.is_ready());
    let err = node
        .execute("CREATE STREAM A (X INT) WITH (KAFKA_TOPIC='a');")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CommandError::NotReady(_) | CommandError::RunnerStopped(_)
    ));
    assert!(tape.is_empty());

    let err = node.close().await.unwrap_err();
    assert!(matches!(err, CommandError::LogUnavailable(_)));
}

#[tokio::test]
async fn close_is_not_blocked_by_a_terminate_waiting_on_an_outage() {
    let tape = InMemoryCommandTape::new();
    let topics = InMemoryTopicClient::with_topics(["src"]);
    let (node, _view) = start_node(config(), Arc::new(tape.client()), &topics).await;
    let node = Arc::new(node);
    let mut states = node.subscribe_state();

    topics.set_available(false);
    node.submit("CREATE STREAM A (X INT) WITH (KAFKA_TOPIC='src');", BTreeMap::new())
        .await
        .unwrap();
    timeout(WAIT, states.wait_for(|state| *state == RunnerState::Degraded))
        .await
        .unwrap()
        .unwrap();

    let terminating = {
        let node = node.clone();
        tokio::spawn(async move { node.shutdown().await })
    };
    timeout(WAIT, async {
        while tape.len() < 2 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(node.applied_position(), Some(LogPosition(0)));
    timeout(WAIT, node.close()).await.unwrap().unwrap();

    let status = timeout(WAIT, terminating).await.unwrap().unwrap().unwrap();
    assert!(status.is_none());
    assert_eq!(node.state(), RunnerState::Stopped);
}
