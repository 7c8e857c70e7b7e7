//! Memo table slots.
//!
//! Every `(compiled entry, params)` pair demanded at runtime owns one
//! [`Entry`]. The slot moves through `NotStarted -> Running -> Done`; a
//! running slot can fall back to `NotStarted` when nobody is interested in
//! its result anymore, and a done slot is restarted when it no longer
//! verifies against the current epoch.

use std::fmt;
use std::sync::{Arc, Mutex};

use petgraph::graph::NodeIndex;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::core::Dynamic;
use crate::engine::tracking::RunRecord;
use crate::error::Failure;
use crate::params::Params;

/// Memoization key: a compiled entry together with the values of exactly the
/// params it uses.
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct NodeKey {
    pub entry: NodeIndex,
    pub params: Params,
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {:?}", self.entry.index(), self.params)
    }
}

/// A terminal result as handed out to demanders.
#[derive(Clone)]
pub(crate) struct Settled {
    pub result: Result<Dynamic, Failure>,
    /// Bumped every time the node is executed again, so dependents can tell
    /// whether the value they saw is still the current one.
    pub generation: u64,
    /// Only valid for the session that computed it.
    pub session_scoped: bool,
}

pub(crate) struct Completed {
    pub settled: Settled,
    pub record: RunRecord,
    /// Invalidation epoch the result was last verified against.
    pub epoch: u64,
    /// Session the result was last verified in.
    pub run_id: u64,
}

impl Completed {
    pub fn is_verified(&self, epoch: u64, run_id: u64) -> bool {
        self.epoch == epoch && (!self.settled.session_scoped || self.run_id == run_id)
    }
}

pub(crate) enum State {
    NotStarted {
        previous: Option<Arc<Completed>>,
    },
    Running {
        /// Identifies this run, results of abandoned runs are discarded.
        token: u64,
        /// Number of demanders currently awaiting the result.
        interest: usize,
        tx: watch::Sender<Option<Settled>>,
        abort: AbortHandle,
        previous: Option<Arc<Completed>>,
    },
    Done(Arc<Completed>),
}

pub(crate) struct Entry {
    pub label: String,
    pub state: Mutex<State>,
}

impl Entry {
    pub fn new(label: String) -> Self {
        Self {
            label,
            state: Mutex::new(State::NotStarted { previous: None }),
        }
    }

    /// Stores the result of the run identified by `token` and wakes every
    /// awaiter. Results of runs that were abandoned in the meantime are
    /// dropped.
    pub fn complete(&self, token: u64, completed: Completed) {
        let mut state = self.state.lock().unwrap();

        match &*state {
            State::Running { token: current, tx, .. } if *current == token => {
                tx.send_replace(Some(completed.settled.clone()));
                *state = State::Done(Arc::new(completed));
            }
            _ => tracing::trace!("dropping result of abandoned run of {}", self.label),
        }
    }
}

/// Interest of one demander in a running entry.
///
/// Dropping the last interest in a run aborts it and resets the slot, so a
/// cancelled request does not keep work alive that nobody else wants.
pub(crate) struct Interest {
    entry: Arc<Entry>,
    token: u64,
}

impl Interest {
    pub fn new(entry: Arc<Entry>, token: u64) -> Self {
        Self { entry, token }
    }
}

impl Drop for Interest {
    fn drop(&mut self) {
        let mut state = self.entry.state.lock().unwrap();

        if let State::Running {
            token,
            interest,
            abort,
            previous,
            ..
        } = &mut *state
            && *token == self.token
        {
            *interest -= 1;

            if *interest == 0 {
                tracing::debug!("abandoning {}, no demanders left", self.entry.label);
                abort.abort();
                let previous = previous.take();
                *state = State::NotStarted { previous };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settled(generation: u64, session_scoped: bool) -> Settled {
        Settled {
            result: Ok(Arc::new(()) as Dynamic),
            generation,
            session_scoped,
        }
    }

    #[test]
    fn test_verification_rules() {
        let completed = Completed {
            settled: settled(0, false),
            record: RunRecord::default(),
            epoch: 3,
            run_id: 7,
        };
        assert!(completed.is_verified(3, 7));
        assert!(completed.is_verified(3, 8));
        assert!(!completed.is_verified(4, 7));

        let scoped = Completed {
            settled: settled(0, true),
            ..completed
        };
        assert!(scoped.is_verified(3, 7));
        assert!(!scoped.is_verified(3, 8));
    }

    #[tokio::test]
    async fn test_stale_completion_is_dropped() {
        let entry = Arc::new(Entry::new("test".into()));
        let (tx, mut rx) = watch::channel(None);
        let task = tokio::spawn(std::future::pending::<()>());

        *entry.state.lock().unwrap() = State::Running {
            token: 2,
            interest: 1,
            tx,
            abort: task.abort_handle(),
            previous: None,
        };

        let completed = |generation| Completed {
            settled: settled(generation, false),
            record: RunRecord::default(),
            epoch: 0,
            run_id: 0,
        };

        entry.complete(1, completed(10));
        assert!(rx.borrow().is_none());

        entry.complete(2, completed(11));
        let value = rx.wait_for(Option::is_some).await.unwrap().clone().unwrap();
        assert_eq!(value.generation, 11);
        assert!(matches!(&*entry.state.lock().unwrap(), State::Done(_)));
        task.abort();
    }

    #[tokio::test]
    async fn test_last_interest_aborts_the_run() {
        let entry = Arc::new(Entry::new("test".into()));
        let (tx, _rx) = watch::channel(None);
        let task = tokio::spawn(std::future::pending::<()>());

        *entry.state.lock().unwrap() = State::Running {
            token: 1,
            interest: 2,
            tx,
            abort: task.abort_handle(),
            previous: None,
        };

        drop(Interest::new(Arc::clone(&entry), 1));
        assert!(matches!(&*entry.state.lock().unwrap(), State::Running { interest: 1, .. }));

        drop(Interest::new(Arc::clone(&entry), 1));
        assert!(matches!(&*entry.state.lock().unwrap(), State::NotStarted { previous: None }));
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
