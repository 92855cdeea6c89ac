//! The single synchronised hand-off between the detection loop and readers.
//!
//! Every operation takes the lock once, copies in or out, and releases it.
//! Readers therefore see either the whole previous publish or the whole next
//! one. Encoding and transmission always happen after the lock is dropped.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use ml_core::FrameResult;

use crate::{counters::Counters, data::AnnotatedFrame};

/// Frames of detection history kept for the results endpoint.
pub const HISTORY_CAPACITY: usize = 50;

/// The latest frame, or the placeholder when nothing has been published since
/// the last reset.
#[derive(Clone, Debug)]
pub struct LatestFrame {
    pub frame: Arc<AnnotatedFrame>,
    pub is_placeholder: bool,
}

/// A consistent view of the store taken under one lock acquisition.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub latest: LatestFrame,
    /// Oldest first.
    pub history: Vec<FrameResult>,
    pub counters: Counters,
    pub published: u64,
}

#[derive(Default)]
struct StoreState {
    frame: Option<Arc<AnnotatedFrame>>,
    history: VecDeque<FrameResult>,
    counters: Counters,
    published: u64,
}

pub struct FrameStore {
    state: Mutex<StoreState>,
    placeholder: Arc<AnnotatedFrame>,
    capacity: usize,
}

impl FrameStore {
    pub fn new(capacity: usize, placeholder: AnnotatedFrame) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(StoreState {
                history: VecDeque::with_capacity(capacity),
                ..StoreState::default()
            }),
            placeholder: Arc::new(placeholder),
            capacity,
        }
    }

    /// Replace the latest frame, append its result (evicting the oldest past
    /// capacity) and record the session totals, all in one step.
    pub fn publish(&self, frame: AnnotatedFrame, result: FrameResult, counters: Counters) {
        let frame = Arc::new(frame);
        let mut state = self.lock();
        state.frame = Some(frame);
        state.history.push_back(result);
        while state.history.len() > self.capacity {
            state.history.pop_front();
        }
        state.counters = counters;
        state.published += 1;
    }

    /// Frame plus a copy of the history.
    pub fn latest(&self) -> Snapshot {
        let state = self.lock();
        Snapshot {
            latest: self.frame_of(&state),
            history: state.history.iter().cloned().collect(),
            counters: state.counters,
            published: state.published,
        }
    }

    /// Just the frame; cheaper than [`FrameStore::latest`] for streaming.
    pub fn latest_frame(&self) -> LatestFrame {
        let state = self.lock();
        self.frame_of(&state)
    }

    pub fn history(&self) -> Vec<FrameResult> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn counters(&self) -> (Counters, u64) {
        let state = self.lock();
        (state.counters, state.published)
    }

    /// Forget everything from the previous session.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.frame = None;
        state.history.clear();
        state.counters = Counters::default();
        state.published = 0;
    }

    pub fn placeholder(&self) -> Arc<AnnotatedFrame> {
        self.placeholder.clone()
    }

    fn frame_of(&self, state: &StoreState) -> LatestFrame {
        match &state.frame {
            Some(frame) => LatestFrame {
                frame: frame.clone(),
                is_placeholder: false,
            },
            None => LatestFrame {
                frame: self.placeholder.clone(),
                is_placeholder: true,
            },
        }
    }

    // Each critical section leaves the state valid, so a poisoned lock is
    // still safe to use.
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
