use std::sync::{Arc, Mutex};

use crate::engine::entry::{NodeKey, Settled};
use crate::invalidation::{Fact, FactVersion};

/// A dependency observed while running a node, together with the generation
/// of the value that was handed out.
#[derive(Clone, Debug)]
pub(crate) struct DepRecord {
    pub key: NodeKey,
    pub generation: u64,
}

/// Everything a single run of a node read: other nodes, in the order they
/// were demanded, and external facts.
#[derive(Clone, Debug, Default)]
pub(crate) struct RunRecord {
    pub deps: Vec<DepRecord>,
    pub facts: Vec<(Fact, FactVersion)>,
    /// Some dependency is only valid for the session it was computed in.
    pub session_scoped: bool,
}

/// Shared handle to the record of the run in progress, cloned into every
/// [`Context`](crate::Context) handed to the rule body.
#[derive(Clone, Default)]
pub(crate) struct RecordPtr {
    pub(crate) ptr: Arc<Mutex<RunRecord>>,
}

impl RecordPtr {
    pub(crate) fn push_dep(&self, key: NodeKey, settled: &Settled) {
        let mut record = self.ptr.lock().unwrap();
        record.session_scoped |= settled.session_scoped;
        record.deps.push(DepRecord {
            key,
            generation: settled.generation,
        });
    }

    pub(crate) fn push_fact(&self, fact: Fact, version: FactVersion) {
        let mut record = self.ptr.lock().unwrap();
        if !record.facts.iter().any(|(f, v)| f == &fact && v == &version) {
            record.facts.push((fact, version));
        }
    }

    /// Takes the finished record out, leaving an empty one behind for any
    /// context clone that outlived the run.
    pub(crate) fn take(&self) -> RunRecord {
        std::mem::take(&mut *self.ptr.lock().unwrap())
    }
}
