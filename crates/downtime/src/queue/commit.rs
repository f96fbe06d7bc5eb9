use std::collections::{BTreeSet, HashMap};

/// A committable consumer position: the next offset to read on a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommitPosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Default)]
struct PartitionTrack {
    pending: BTreeSet<i64>,
    highest_done: Option<i64>,
    committed: Option<i64>,
}

impl PartitionTrack {
    /// Lowest offset not yet known to be done
    fn frontier(&self) -> Option<i64> {
        match self.pending.first() {
            Some(&lowest) => Some(lowest),
            None => self.highest_done.map(|done| done + 1),
        }
    }
}

/// Per-partition offset bookkeeping for out-of-order completion.
///
/// Handlers on one partition finish in any order, but the broker only
/// understands a single position per partition. The position committed is
/// always the lowest offset still in flight, so a message whose result was
/// never published holds back every later commit on its partition and is
/// delivered again after a restart.
#[derive(Debug, Default)]
pub struct CommitTracker {
    partitions: HashMap<(String, i32), PartitionTrack>,
}

impl CommitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a received message. Must be called in delivery order, before
    /// its handler runs.
    pub fn begin(&mut self, topic: &str, partition: i32, offset: i64) {
        self.partitions
            .entry((topic.to_string(), partition))
            .or_default()
            .pending
            .insert(offset);
    }

    /// Mark a message done (its result was published). Returns the new
    /// position when it moved forward.
    pub fn complete(&mut self, topic: &str, partition: i32, offset: i64) -> Option<CommitPosition> {
        let track = self.partitions.get_mut(&(topic.to_string(), partition))?;
        if !track.pending.remove(&offset) {
            return None;
        }
        track.highest_done = Some(track.highest_done.map_or(offset, |done| done.max(offset)));

        let frontier = track.frontier()?;
        if track.committed.is_some_and(|committed| committed >= frontier) {
            return None;
        }
        track.committed = Some(frontier);
        Some(CommitPosition { topic: topic.to_string(), partition, offset: frontier })
    }

    /// Last advanced position of every partition, for the shutdown flush
    pub fn positions(&self) -> Vec<CommitPosition> {
        let mut positions: Vec<_> = self
            .partitions
            .iter()
            .filter_map(|((topic, partition), track)| {
                track.committed.map(|offset| CommitPosition {
                    topic: topic.clone(),
                    partition: *partition,
                    offset,
                })
            })
            .collect();
        positions.sort();
        positions
    }

    /// Messages received but not completed
    pub fn pending(&self) -> usize {
        self.partitions.values().map(|track| track.pending.len()).sum()
    }

    /// Lowest uncompleted offset of a partition
    pub fn blocked_at(&self, topic: &str, partition: i32) -> Option<i64> {
        self.partitions
            .get(&(topic.to_string(), partition))
            .and_then(|track| track.pending.first().copied())
    }
}
