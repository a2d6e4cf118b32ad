//! Message reconciliation: one set of identity and time-window rules shared
//! by the history fetch path and the live path.
//!
//! Two messages are the same logical message when they carry the same id,
//! or when they are text from the same author with identical content whose
//! effective timestamps lie inside the dedup window.  The window is a
//! heuristic: a genuine repeat sent inside it is dropped.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tracing::trace;

use huddle_shared::{Message, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupPolicy {
    window: ChronoDuration,
}

impl DedupPolicy {
    pub fn new(window: Duration) -> Self {
        Self {
            window: ChronoDuration::from_std(window).unwrap_or(ChronoDuration::MAX),
        }
    }

    pub fn window(&self) -> ChronoDuration {
        self.window
    }

    /// Same author, same content, close enough in time.
    pub fn same_logical(&self, a: &Message, b: &Message) -> bool {
        a.kind.is_text()
            && b.kind.is_text()
            && a.user_id == b.user_id
            && a.content == b.content
            && (a.effective_timestamp() - b.effective_timestamp()).abs() <= self.window
    }
}

/// What reconciling one incoming message did to the sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// A new entry.
    Added,
    /// Took the place of the optimistic entry `local_id`.
    Replaced { local_id: MessageId },
    /// Overwrote the fields of an entry with the same id.
    Updated,
    /// Already present; nothing changed.
    Duplicate,
}

/// Reconcile `incoming` into `entries` without re-sorting.
///
/// Same id: the copy with the later effective timestamp supplies the fields,
/// ties keep the existing copy.  A confirmed message takes over a matching
/// optimistic entry.  Any other windowed match is a duplicate.
fn reconcile_one(entries: &mut Vec<Message>, incoming: Message, policy: &DedupPolicy) -> Applied {
    if let Some(existing) = entries.iter_mut().find(|m| m.id == incoming.id) {
        if incoming.effective_timestamp() > existing.effective_timestamp() {
            *existing = incoming;
            return Applied::Updated;
        }
        return Applied::Duplicate;
    }

    if !incoming.is_optimistic() {
        if let Some(slot) = entries
            .iter_mut()
            .find(|m| m.is_optimistic() && policy.same_logical(m, &incoming))
        {
            let local_id = std::mem::replace(slot, incoming).id;
            return Applied::Replaced { local_id };
        }
    }

    if entries.iter().any(|m| policy.same_logical(m, &incoming)) {
        trace!(message = %incoming.id, "dropping windowed duplicate");
        return Applied::Duplicate;
    }

    entries.push(incoming);
    Applied::Added
}

fn sort_ascending(entries: &mut [Message]) {
    entries.sort_by_key(|m| m.effective_timestamp());
}

/// Merge `incoming` into `existing` under `policy`, ascending by effective
/// timestamp.  No id appears twice and no two entries are the same logical
/// message.
pub fn merge_and_dedup(
    existing: &[Message],
    incoming: &[Message],
    policy: &DedupPolicy,
) -> Vec<Message> {
    let mut merged: Vec<Message> = Vec::with_capacity(existing.len() + incoming.len());
    for message in existing.iter().cloned() {
        reconcile_one(&mut merged, message, policy);
    }
    for message in incoming.iter().cloned() {
        reconcile_one(&mut merged, message, policy);
    }
    sort_ascending(&mut merged);
    merged
}

/// The live, ordered message list of one room session.
#[derive(Debug, Clone)]
pub struct Timeline {
    entries: Vec<Message>,
    policy: DedupPolicy,
}

impl Timeline {
    pub fn new(policy: DedupPolicy) -> Self {
        Self {
            entries: Vec::new(),
            policy,
        }
    }

    pub fn with_messages(policy: DedupPolicy, messages: &[Message]) -> Self {
        Self {
            entries: merge_and_dedup(&[], messages, &policy),
            policy,
        }
    }

    pub fn apply(&mut self, message: Message) -> Applied {
        let applied = reconcile_one(&mut self.entries, message, &self.policy);
        if applied != Applied::Duplicate {
            sort_ascending(&mut self.entries);
        }
        applied
    }

    /// Swap the optimistic entry `local_id` for its confirmed copy.  When the
    /// echo already took its place this is a no-op.
    pub fn confirm(&mut self, local_id: &MessageId, confirmed: Message) -> Applied {
        let confirmed_present = self.contains(&confirmed.id);
        match self.entries.iter().position(|m| &m.id == local_id) {
            Some(index) if confirmed_present => {
                self.entries.remove(index);
                Applied::Duplicate
            }
            Some(index) => {
                self.entries[index] = confirmed;
                sort_ascending(&mut self.entries);
                Applied::Replaced {
                    local_id: local_id.clone(),
                }
            }
            None => self.apply(confirmed),
        }
    }

    /// Remove an entry by id.  Returns `true` if it was present.
    pub fn remove(&mut self, id: &MessageId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|m| &m.id != id);
        self.entries.len() != before
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.iter().any(|m| &m.id == id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Bounded set of recently processed message ids.  Past `max` entries it
/// keeps only the `retain` most recent.
#[derive(Debug, Clone)]
pub struct SeenIds {
    order: VecDeque<MessageId>,
    set: HashSet<MessageId>,
    max: usize,
    retain: usize,
}

impl SeenIds {
    pub fn new(max: usize, retain: usize) -> Self {
        let max = max.max(1);
        Self {
            order: VecDeque::with_capacity(max + 1),
            set: HashSet::with_capacity(max + 1),
            max,
            retain: retain.min(max),
        }
    }

    /// Record `id`.  Returns `false` if it was already seen.
    pub fn insert(&mut self, id: &MessageId) -> bool {
        if !self.set.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id.clone());
        if self.order.len() > self.max {
            while self.order.len() > self.retain {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.set.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.set.clear();
    }
}
