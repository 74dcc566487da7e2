//! Live change feed: push-based insert/update notifications for messages,
//! groups and memberships.
//!
//! Built on a single `tokio::sync::broadcast` channel. Publish order is
//! delivery order for every receiver, which gives the causal guarantee the
//! observers rely on: a message's update can never arrive before its
//! insert, because publishers hold their write-order lock across each
//! store commit and its publish. There is no replay — a receiver that lags
//! is told how much it missed and must re-fetch state to resynchronize.

use std::collections::HashSet;

use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use mingle_types::events::{ChangeEvent, ChangeScope};

const DEFAULT_CAPACITY: usize = 1024;

/// Shared publish handle. Cheap to clone; all clones feed the same
/// subscribers.
#[derive(Clone)]
pub struct Feed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl Feed {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fan an event out to every live subscription. Never blocks; with no
    /// subscribers the event is simply dropped.
    pub fn publish(&self, event: ChangeEvent) {
        trace!(kind = ?event.kind(), op = ?event.op, "publishing change event");
        let _ = self.tx.send(event);
    }

    /// Open a subscription seeing every event published after this call
    /// that matches `filter`. Cancel by dropping the subscription.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            filter,
        }
    }
}

impl Default for Feed {
    fn default() -> Self {
        Self::new()
    }
}

/// Which events a subscription wants.
///
/// Direct-message events are matched per user: the filter's user must be an
/// endpoint of the conversation, optionally restricted to a set of
/// counterparts. Group events match an explicit group-id set, and directory
/// events (new groups, membership rows) are an opt-in flag.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    all: bool,
    user: Option<Uuid>,
    counterparts: Option<HashSet<Uuid>>,
    groups: HashSet<Uuid>,
    directory: bool,
}

impl EventFilter {
    /// Match everything. Used by tests and operational taps.
    pub fn all() -> Self {
        Self { all: true, ..Self::default() }
    }

    /// Match every direct conversation involving `user`.
    pub fn for_user(user: Uuid) -> Self {
        Self { user: Some(user), ..Self::default() }
    }

    /// Restrict direct matches to conversations with these counterparts.
    pub fn with_counterparts(mut self, counterparts: impl IntoIterator<Item = Uuid>) -> Self {
        self.counterparts = Some(counterparts.into_iter().collect());
        self
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = Uuid>) -> Self {
        self.groups = groups.into_iter().collect();
        self
    }

    pub fn with_directory(mut self, directory: bool) -> Self {
        self.directory = directory;
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if self.all {
            return true;
        }
        match event.scope() {
            ChangeScope::Direct { a, b } => {
                let Some(user) = self.user else { return false };
                if user != a && user != b {
                    return false;
                }
                let other = if user == a { b } else { a };
                match &self.counterparts {
                    Some(set) => set.contains(&other) || other == user,
                    None => true,
                }
            }
            ChangeScope::Group(id) => self.groups.contains(&id),
            ChangeScope::Directory => self.directory,
        }
    }
}

/// One item from a subscription.
#[derive(Debug, Clone)]
pub enum FeedItem {
    Event(ChangeEvent),
    /// The subscriber fell behind and `skipped` events were dropped from
    /// its queue. Full-state re-fetch is the only recovery.
    Lagged(u64),
}

/// Live stream of matching events. Never completes on its own; dropping it
/// cancels the subscription and releases the receiver, which is safe even
/// while a delivery is in flight.
pub struct Subscription {
    rx: broadcast::Receiver<ChangeEvent>,
    filter: EventFilter,
}

impl Subscription {
    /// Wait for the next matching event. Returns `None` once the feed
    /// itself is gone (all publish handles dropped).
    pub async fn recv(&mut self) -> Option<FeedItem> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => {
                    return Some(FeedItem::Event(event));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Some(FeedItem::Lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Replace the filter in place; used when a client re-scopes what it
    /// watches on an already-open connection.
    pub fn set_filter(&mut self, filter: EventFilter) {
        self.filter = filter;
    }
}
