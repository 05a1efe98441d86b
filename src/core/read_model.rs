//! Shared state cell behind both synchronizers.
//!
//! # Invariants
//! - `loading` is true while at least one fetch is in flight.
//! - A fetch result is applied only when its ticket is newer than the last
//!   applied one; late responses from superseded fetches are discarded.
//! - `ready` flips to true on the first applied fetch and back on `reset`.
//! - After `close` nothing is written again: fetches, edits and resets that
//!   arrive later are dropped.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    pub value: T,
    pub loading: bool,
    pub ready: bool,
}

/// Sequence number handed out when a fetch starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FetchTicket(u64);

impl FetchTicket {
    pub fn seq(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Default)]
struct Sequencer {
    issued: u64,
    applied: u64,
    in_flight: usize,
    closed: bool,
}

pub struct ReadModel<T> {
    state: watch::Sender<Snapshot<T>>,
    sequencer: Mutex<Sequencer>,
}

impl<T> ReadModel<T> {
    pub fn new(initial: T) -> Self {
        let (state, _) = watch::channel(Snapshot {
            value: initial,
            loading: false,
            ready: false,
        });
        Self {
            state,
            sequencer: Mutex::new(Sequencer::default()),
        }
    }

    pub fn watch(&self) -> watch::Receiver<Snapshot<T>> {
        self.state.subscribe()
    }

    pub fn read<R>(&self, f: impl FnOnce(&Snapshot<T>) -> R) -> R {
        f(&self.state.borrow())
    }

    pub fn loading(&self) -> bool {
        self.read(|snapshot| snapshot.loading)
    }

    pub fn ready(&self) -> bool {
        self.read(|snapshot| snapshot.ready)
    }

    pub fn begin_fetch(&self) -> FetchTicket {
        let mut sequencer = self.sequencer();
        sequencer.issued += 1;
        sequencer.in_flight += 1;
        if !sequencer.closed {
            self.state.send_modify(|snapshot| snapshot.loading = true);
        }
        FetchTicket(sequencer.issued)
    }

    /// Settles a fetch. `None` means the fetch failed and prior state stays.
    ///
    /// Returns whether `outcome` replaced the current value.
    pub fn finish_fetch(&self, ticket: FetchTicket, outcome: Option<T>) -> bool {
        let mut sequencer = self.sequencer();
        sequencer.in_flight = sequencer.in_flight.saturating_sub(1);
        if sequencer.closed {
            tracing::debug!(seq = ticket.0, "discarding fetch response after close");
            return false;
        }
        let loading = sequencer.in_flight > 0;
        let fresh = ticket.0 > sequencer.applied;
        let replacement = outcome.filter(|_| fresh);
        let applied = replacement.is_some();
        if applied {
            sequencer.applied = ticket.0;
        } else if fresh {
            tracing::trace!(seq = ticket.0, "fetch settled without a value");
        } else {
            tracing::debug!(
                seq = ticket.0,
                applied = sequencer.applied,
                "discarding stale fetch response"
            );
        }
        self.state.send_modify(|snapshot| {
            if let Some(value) = replacement {
                snapshot.value = value;
                snapshot.ready = true;
            }
            snapshot.loading = loading;
        });
        applied
    }

    /// Returns `false` without calling `f` once the model is closed.
    pub fn modify(&self, f: impl FnOnce(&mut T)) -> bool {
        let sequencer = self.sequencer();
        if sequencer.closed {
            return false;
        }
        self.state.send_modify(|snapshot| f(&mut snapshot.value));
        true
    }

    /// Back to the unauthenticated state; fetches already in flight are
    /// treated as stale.
    pub fn reset(&self, value: T) {
        let mut sequencer = self.sequencer();
        if sequencer.closed {
            return;
        }
        sequencer.applied = sequencer.issued;
        self.clear(value);
    }

    /// Resets to `value` and refuses every later write.
    pub fn close(&self, value: T) {
        let mut sequencer = self.sequencer();
        sequencer.applied = sequencer.issued;
        sequencer.closed = true;
        self.clear(value);
    }

    pub fn is_closed(&self) -> bool {
        self.sequencer().closed
    }

    fn clear(&self, value: T) {
        self.state.send_modify(|snapshot| {
            snapshot.value = value;
            snapshot.loading = false;
            snapshot.ready = false;
        });
    }

    fn sequencer(&self) -> MutexGuard<'_, Sequencer> {
        self.sequencer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> ReadModel<T> {
    pub fn snapshot(&self) -> Snapshot<T> {
        self.state.borrow().clone()
    }

    pub fn value(&self) -> T {
        self.state.borrow().value.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loading_tracks_every_in_flight_fetch() {
        let model = ReadModel::new(0_u32);
        let first = model.begin_fetch();
        let second = model.begin_fetch();
        assert!(model.loading());

        model.finish_fetch(first, Some(1));
        assert!(model.loading());
        model.finish_fetch(second, None);
        assert!(!model.loading());
    }

    #[test]
    fn late_response_from_older_fetch_is_discarded() {
        let model = ReadModel::new(Vec::<u32>::new());
        let older = model.begin_fetch();
        let newer = model.begin_fetch();

        assert!(model.finish_fetch(newer, Some(vec![2])));
        assert!(!model.finish_fetch(older, Some(vec![1])));
        assert_eq!(model.value(), vec![2]);
        assert!(older.seq() < newer.seq());
    }

    #[test]
    fn failed_fetch_keeps_prior_value_and_readiness() {
        let model = ReadModel::new(String::new());
        assert!(!model.ready());

        let ticket = model.begin_fetch();
        model.finish_fetch(ticket, None);
        assert!(!model.ready());

        let ticket = model.begin_fetch();
        model.finish_fetch(ticket, Some("synced".to_string()));
        let ticket = model.begin_fetch();
        model.finish_fetch(ticket, None);

        let snapshot = model.snapshot();
        assert!(snapshot.ready);
        assert_eq!(snapshot.value, "synced");
    }

    #[test]
    fn reset_invalidates_fetches_already_in_flight() {
        let model = ReadModel::new(Vec::<u32>::new());
        let ticket = model.begin_fetch();
        model.reset(Vec::new());

        assert!(!model.finish_fetch(ticket, Some(vec![7])));
        assert!(model.value().is_empty());
        assert!(!model.ready());
    }

    #[test]
    fn closed_model_ignores_late_writes() {
        let model = ReadModel::new(Vec::<u32>::new());
        let ticket = model.begin_fetch();
        model.modify(|values| values.push(1));
        model.close(Vec::new());

        assert!(!model.modify(|values| values.push(2)));
        assert!(!model.finish_fetch(ticket, Some(vec![3])));
        let later = model.begin_fetch();
        assert!(!model.finish_fetch(later, Some(vec![4])));
        model.reset(vec![5]);

        let snapshot = model.snapshot();
        assert!(model.is_closed());
        assert!(snapshot.value.is_empty());
        assert!(!snapshot.loading);
        assert!(!snapshot.ready);
    }

    #[test]
    fn watchers_observe_modifications() {
        let model = ReadModel::new(Vec::<u32>::new());
        let mut receiver = model.watch();
        model.modify(|values| values.insert(0, 5));

        assert!(receiver.has_changed().expect("sender alive"));
        assert_eq!(receiver.borrow_and_update().value, vec![5]);
    }
}
