//! In-process partitioned log with consumer groups
//!
//! Mirrors the Kafka behaviour the controller relies on:
//! - keyed records always land on the same partition, keyless records are spread round-robin
//! - every group keeps its own committed offsets; a new group starts at offset 0
//! - a group's partitions are split across its members and rebalanced on join/leave
//! - a partition moves to its new owner only after the previous owner polls again, and
//!   commits are accepted only from the current owner
use super::{EventLog, LogConsumer, LogRecord};
use crate::destination::DestinationIdentity;
use crate::error::{BrokerError, ForwardError, StartError};
use crate::forwarder::{Ack, EventForwarder};
use async_trait::async_trait;
use event_schema::Event;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

const DEFAULT_PARTITIONS: i32 = 20;

#[derive(Clone)]
pub struct MemoryLog {
    shared: Arc<Shared>,
}

struct Shared {
    partitions: i32,
    state: Mutex<LogState>,
    changed: Notify,
}

#[derive(Default)]
struct LogState {
    topics: HashMap<String, TopicLog>,
    next_member_id: u64,
}

struct TopicLog {
    partitions: Vec<Vec<StoredRecord>>,
    next_keyless: usize,
    groups: HashMap<String, GroupState>,
}

struct StoredRecord {
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
}

#[derive(Default)]
struct GroupState {
    members: BTreeSet<u64>,
    /// Target assignment computed by the last rebalance
    assignments: HashMap<u64, Vec<i32>>,
    /// Partitions currently held; a holder keeps its partition until it polls again
    owners: HashMap<i32, u64>,
    committed: HashMap<i32, i64>,
}

impl TopicLog {
    fn new(partitions: i32) -> Self {
        Self {
            partitions: (0..partitions).map(|_| Vec::new()).collect(),
            next_keyless: 0,
            groups: HashMap::new(),
        }
    }
}

impl GroupState {
    fn rebalance(&mut self, partitions: i32) {
        self.assignments.clear();
        let members: Vec<u64> = self.members.iter().copied().collect();
        if members.is_empty() {
            return;
        }

        for partition in 0..partitions {
            let owner = members[partition as usize % members.len()];
            self.assignments.entry(owner).or_default().push(partition);
        }
    }

    /// Release partitions no longer assigned to `member` and claim the free ones that are
    fn sync_member(&mut self, member: u64) -> Vec<i32> {
        let target = self.assignments.get(&member).cloned().unwrap_or_default();
        self.owners
            .retain(|partition, owner| *owner != member || target.contains(partition));

        let mut held = Vec::with_capacity(target.len());
        for partition in target {
            let owner = self.owners.entry(partition).or_insert(member);
            if *owner == member {
                held.push(partition);
            }
        }
        held
    }

    fn leave(&mut self, member: u64, partitions: i32) {
        self.members.remove(&member);
        self.owners.retain(|_, owner| *owner != member);
        self.rebalance(partitions);
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl MemoryLog {
    pub fn new(partitions: i32) -> Self {
        Self {
            shared: Arc::new(Shared {
                partitions: partitions.max(1),
                state: Mutex::new(LogState::default()),
                changed: Notify::new(),
            }),
        }
    }

    pub fn partitions(&self) -> i32 {
        self.shared.partitions
    }

    /// Idempotent; returns `true` when the topic did not exist yet
    pub fn create_topic(&self, topic: &str) -> bool {
        let mut state = self.shared.state.lock();
        if state.topics.contains_key(topic) {
            return false;
        }
        state
            .topics
            .insert(topic.to_string(), TopicLog::new(self.shared.partitions));
        true
    }

    pub fn partition_for_key(&self, key: &[u8]) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shared.partitions as u64) as i32
    }

    /// Append a raw record and return its `(partition, offset)`
    pub fn append(&self, topic: &str, key: Option<&[u8]>, payload: Option<&[u8]>) -> (i32, i64) {
        let partition_for_key = key.map(|key| self.partition_for_key(key));
        let mut state = self.shared.state.lock();
        let log = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicLog::new(self.shared.partitions));

        let partition = match partition_for_key {
            Some(partition) => partition,
            None => {
                let partition = (log.next_keyless % log.partitions.len()) as i32;
                log.next_keyless += 1;
                partition
            }
        };

        let records = &mut log.partitions[partition as usize];
        let offset = records.len() as i64;
        records.push(StoredRecord {
            key: key.map(<[u8]>::to_vec),
            payload: payload.map(<[u8]>::to_vec),
        });
        drop(state);

        self.shared.changed.notify_waiters();
        (partition, offset)
    }

    pub fn record_count(&self, topic: &str) -> usize {
        let state = self.shared.state.lock();
        state
            .topics
            .get(topic)
            .map(|log| log.partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn committed_offset(&self, topic: &str, group_id: &str, partition: i32) -> Option<i64> {
        let state = self.shared.state.lock();
        state
            .topics
            .get(topic)?
            .groups
            .get(group_id)?
            .committed
            .get(&partition)
            .copied()
    }

    /// Records in `topic` not yet committed by `group_id`
    pub fn lag(&self, topic: &str, group_id: &str) -> i64 {
        let state = self.shared.state.lock();
        let Some(log) = state.topics.get(topic) else {
            return 0;
        };
        let committed = log.groups.get(group_id).map(|group| &group.committed);

        log.partitions
            .iter()
            .enumerate()
            .map(|(partition, records)| {
                let done = committed
                    .and_then(|c| c.get(&(partition as i32)).copied())
                    .unwrap_or(0);
                records.len() as i64 - done
            })
            .sum()
    }

    pub fn group_members(&self, topic: &str, group_id: &str) -> usize {
        let state = self.shared.state.lock();
        state
            .topics
            .get(topic)
            .and_then(|log| log.groups.get(group_id))
            .map(|group| group.members.len())
            .unwrap_or(0)
    }
}

impl EventLog for MemoryLog {
    fn subscribe(
        &self,
        destination: &DestinationIdentity,
    ) -> Result<Box<dyn LogConsumer>, StartError> {
        let partitions = self.shared.partitions;
        let mut state = self.shared.state.lock();
        let member = state.next_member_id;
        state.next_member_id += 1;

        let log = state
            .topics
            .entry(destination.topic.clone())
            .or_insert_with(|| TopicLog::new(partitions));
        let group = log.groups.entry(destination.group_id.clone()).or_default();
        group.members.insert(member);
        group.rebalance(partitions);
        drop(state);

        self.shared.changed.notify_waiters();
        debug!(
            topic = %destination.topic,
            group_id = %destination.group_id,
            member,
            "Joined consumer group"
        );

        Ok(Box::new(MemoryConsumer {
            shared: Arc::clone(&self.shared),
            topic: destination.topic.clone(),
            group_id: destination.group_id.clone(),
            member,
            positions: HashMap::new(),
            held: Vec::new(),
            cursor: 0,
            closed: false,
        }))
    }
}

struct MemoryConsumer {
    shared: Arc<Shared>,
    topic: String,
    group_id: String,
    member: u64,
    positions: HashMap<i32, i64>,
    held: Vec<i32>,
    cursor: usize,
    closed: bool,
}

impl MemoryConsumer {
    fn next_record(&mut self) -> Option<LogRecord> {
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        let TopicLog {
            partitions, groups, ..
        } = state.topics.get_mut(&self.topic)?;
        let group = groups.get_mut(&self.group_id)?;

        self.held = group.sync_member(self.member);
        let held = &self.held;
        self.positions.retain(|partition, _| held.contains(partition));
        for partition in &self.held {
            self.positions
                .entry(*partition)
                .or_insert_with(|| group.committed.get(partition).copied().unwrap_or(0));
        }

        let count = self.held.len();
        for step in 0..count {
            let index = (self.cursor + step) % count;
            let partition = self.held[index];
            let position = self.positions[&partition];

            if let Some(record) = partitions[partition as usize].get(position as usize) {
                self.positions.insert(partition, position + 1);
                self.cursor = index + 1;
                return Some(LogRecord {
                    partition,
                    offset: position,
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                });
            }
        }

        None
    }

    fn leave(&mut self) {
        let partitions = self.shared.partitions;
        let mut state = self.shared.state.lock();
        if let Some(group) = state
            .topics
            .get_mut(&self.topic)
            .and_then(|log| log.groups.get_mut(&self.group_id))
        {
            group.leave(self.member, partitions);
        }
        drop(state);

        self.closed = true;
        self.held.clear();
        self.positions.clear();
        self.shared.changed.notify_waiters();
    }
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<LogRecord>, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }

        let deadline = Instant::now() + timeout;
        let shared = Arc::clone(&self.shared);

        loop {
            // Registered before checking so an append in between still wakes us
            let changed = shared.changed.notified();

            if let Some(record) = self.next_record() {
                return Ok(Some(record));
            }

            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return Ok(None);
            }
        }
    }

    fn commit(&mut self, partition: i32, next_offset: i64) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }

        let mut state = self.shared.state.lock();
        let group = state
            .topics
            .get_mut(&self.topic)
            .and_then(|log| log.groups.get_mut(&self.group_id))
            .ok_or(BrokerError::NotAssigned { partition })?;

        if group.owners.get(&partition) != Some(&self.member) {
            return Err(BrokerError::NotAssigned { partition });
        }

        let committed = group.committed.entry(partition).or_insert(0);
        *committed = (*committed).max(next_offset);
        Ok(())
    }

    fn unsubscribe(&mut self) {
        if !self.closed {
            self.leave();
            debug!(
                topic = %self.topic,
                group_id = %self.group_id,
                member = self.member,
                "Left consumer group"
            );
        }
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        if !self.closed {
            self.leave();
        }
    }
}

/// [`EventForwarder`] that appends to a [`MemoryLog`]
pub struct MemoryForwarder {
    log: MemoryLog,
    topic: String,
    closed: AtomicBool,
}

impl MemoryForwarder {
    pub fn new(log: MemoryLog, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        if log.create_topic(&topic) {
            info!(topic = %topic, partitions = log.partitions(), "Created in-memory topic");
        }

        Self {
            log,
            topic,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl EventForwarder for MemoryForwarder {
    async fn forward(&self, event: &Event) -> Result<Ack, ForwardError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ForwardError::Closed);
        }

        let body = event.to_bytes()?;
        let (partition, offset) = self.log.append(
            &self.topic,
            event.partition_key().map(str::as_bytes),
            Some(&body),
        );

        debug!(
            key = %event.key,
            topic = %self.topic,
            partition,
            offset,
            "Delivered message"
        );

        Ok(Ack {
            topic: self.topic.clone(),
            partition,
            offset,
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(group_id: &str) -> DestinationIdentity {
        DestinationIdentity::new("events", group_id)
    }

    #[test]
    fn test_keyed_records_share_a_partition() {
        let log = MemoryLog::new(8);

        let (first, _) = log.append("events", Some(b"user-1"), Some(b"a"));
        let (second, offset) = log.append("events", Some(b"user-1"), Some(b"b"));

        assert_eq!(first, second);
        assert_eq!(first, log.partition_for_key(b"user-1"));
        assert_eq!(offset, 1);
    }

    #[test]
    fn test_keyless_records_round_robin() {
        let log = MemoryLog::new(4);

        let partitions: Vec<i32> = (0..6)
            .map(|_| log.append("events", None, Some(b"x")).0)
            .collect();

        assert_eq!(partitions, vec![0, 1, 2, 3, 0, 1]);
        assert_eq!(log.record_count("events"), 6);
    }

    #[test]
    fn test_create_topic_is_idempotent() {
        let log = MemoryLog::new(2);

        assert!(log.create_topic("events"));
        assert!(!log.create_topic("events"));
    }

    #[tokio::test]
    async fn test_new_group_reads_from_earliest() {
        let log = MemoryLog::new(1);
        log.append("events", None, Some(b"0"));
        log.append("events", None, Some(b"1"));

        let mut consumer = log.subscribe(&identity("late")).unwrap();
        let first = consumer.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        let second = consumer.poll(Duration::from_millis(10)).await.unwrap().unwrap();

        assert_eq!((first.offset, first.payload.as_deref()), (0, Some(&b"0"[..])));
        assert_eq!((second.offset, second.payload.as_deref()), (1, Some(&b"1"[..])));
        assert_eq!(consumer.poll(Duration::from_millis(10)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_groups_progress_independently() {
        let log = MemoryLog::new(1);
        log.append("events", None, Some(b"0"));

        let mut a = log.subscribe(&identity("a")).unwrap();
        let mut b = log.subscribe(&identity("b")).unwrap();

        let record = a.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        a.commit(record.partition, record.offset + 1).unwrap();

        assert_eq!(log.lag("events", "a"), 0);
        assert_eq!(log.lag("events", "b"), 1);
        assert!(b.poll(Duration::from_millis(10)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_uncommitted_record_is_redelivered_to_next_member() {
        let log = MemoryLog::new(1);
        log.append("events", None, Some(b"0"));

        let mut first = log.subscribe(&identity("g")).unwrap();
        assert!(first.poll(Duration::from_millis(10)).await.unwrap().is_some());
        first.unsubscribe();

        let mut second = log.subscribe(&identity("g")).unwrap();
        let record = second.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(record.offset, 0);
    }

    #[tokio::test]
    async fn test_partitions_split_across_members() {
        let log = MemoryLog::new(4);
        for _ in 0..4 {
            log.append("events", None, Some(b"x"));
        }

        let mut a = log.subscribe(&identity("g")).unwrap();
        let mut b = log.subscribe(&identity("g")).unwrap();
        assert_eq!(log.group_members("events", "g"), 2);

        let mut seen = Vec::new();
        while let Some(record) = a.poll(Duration::from_millis(10)).await.unwrap() {
            seen.push(record.partition);
        }
        while let Some(record) = b.poll(Duration::from_millis(10)).await.unwrap() {
            seen.push(record.partition);
        }

        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_partition_moves_only_after_holder_polls() {
        let log = MemoryLog::new(2);
        log.append("events", None, Some(b"p0"));
        log.append("events", None, Some(b"p1"));

        let mut a = log.subscribe(&identity("g")).unwrap();
        let first = a.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.partition, 0);

        // b joins while a still holds both partitions
        let mut b = log.subscribe(&identity("g")).unwrap();
        assert_eq!(b.poll(Duration::from_millis(10)).await.unwrap(), None);

        // a can still commit what it is working on
        a.commit(0, 1).unwrap();

        // a's next poll releases partition 1 to b
        let _ = a.poll(Duration::from_millis(10)).await.unwrap();
        let moved = b.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(moved.partition, 1);
        assert!(matches!(
            a.commit(1, 1),
            Err(BrokerError::NotAssigned { partition: 1 })
        ));
    }

    #[tokio::test]
    async fn test_poll_wakes_on_append() {
        let log = MemoryLog::new(1);
        let mut consumer = log.subscribe(&identity("g")).unwrap();

        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("events", None, Some(b"late"));
        });

        let record = consumer.poll(Duration::from_secs(5)).await.unwrap();
        assert!(record.is_some());
    }

    #[tokio::test]
    async fn test_closed_consumer() {
        let log = MemoryLog::new(1);
        let mut consumer = log.subscribe(&identity("g")).unwrap();

        consumer.unsubscribe();
        consumer.unsubscribe();

        assert!(matches!(
            consumer.poll(Duration::from_millis(1)).await,
            Err(BrokerError::Closed)
        ));
        assert_eq!(log.group_members("events", "g"), 0);
    }

    #[tokio::test]
    async fn test_forwarder_keys_by_event_key() {
        let log = MemoryLog::new(8);
        let forwarder = MemoryForwarder::new(log.clone(), "events");

        let ack = forwarder.forward(&Event::new("one", "payload")).await.unwrap();
        assert_eq!(ack.partition, log.partition_for_key(b"one"));
        assert_eq!(ack.offset, 0);

        forwarder.close().await;
        assert!(matches!(
            forwarder.forward(&Event::new("one", "payload")).await,
            Err(ForwardError::Closed)
        ));
    }
}
