//! Bounded, time-ordered queue of pending commands for one clock domain.
//!
//! Entries are kept sorted by due time with the most imminent at the back
//! of the vector, so a due pop is O(1) and insertion is a binary search
//! plus shift. Capacity exhaustion is an explicit, non-fatal error: the
//! push never mutates on failure and callers degrade (a paired note push
//! is skipped as a unit rather than leaving a stuck note).

use crate::error::EngineError;
use crate::events::Event;
use crate::timing::SchedTime;

pub struct EventStack {
    /// Sorted descending by due time; `events.last()` is most imminent.
    events: Vec<Event>,
    capacity: usize,
}

impl EventStack {
    pub fn new(capacity: usize) -> Self {
        EventStack {
            events: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Insertion point preserving descending due-time order. Among equal
    /// times the new event lands behind existing ones, keeping dispatch
    /// FIFO for simultaneous events.
    fn insertion_index(&self, due: SchedTime) -> usize {
        self.events.partition_point(|e| e.due.is_after(due))
    }

    /// Queue an event at its own due time.
    pub fn push(&mut self, event: Event) -> Result<(), EngineError> {
        if self.events.len() >= self.capacity {
            return Err(EngineError::StackFull);
        }
        let idx = self.insertion_index(event.due);
        self.events.insert(idx, event);
        Ok(())
    }

    /// Queue several events with a common time offset added to each.
    /// Atomic: if the batch does not fit, nothing is committed. Used for
    /// paired pushes (note-on plus note-off) that must not be split.
    pub fn push_list(
        &mut self,
        events: impl IntoIterator<Item = Event>,
        count: usize,
        offset: u32,
    ) -> Result<(), EngineError> {
        if self.events.len() + count > self.capacity {
            return Err(EngineError::StackFull);
        }
        for mut event in events.into_iter().take(count) {
            event.due = event.due.offset(offset);
            let idx = self.insertion_index(event.due);
            self.events.insert(idx, event);
        }
        Ok(())
    }

    /// Due time of the most imminent event, if any.
    pub fn next_time(&self) -> Option<SchedTime> {
        self.events.last().map(|e| e.due)
    }

    /// Remove and return the most imminent event only if it is due at
    /// `time`; otherwise leave the stack untouched.
    pub fn pop_due(&mut self, time: SchedTime) -> Option<Event> {
        match self.events.last() {
            Some(next) if next.due.is_due(time) => self.events.pop(),
            _ => None,
        }
    }

    /// Unconditional pop of the most imminent event.
    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop()
    }

    /// Single-pass filtered removal: every event matching `pred` is
    /// removed and returned in dispatch order, the rest keep their
    /// relative order. Used to flush only note-offs on stop/reset.
    pub fn drain_matching(&mut self, mut pred: impl FnMut(&Event) -> bool) -> Vec<Event> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.events.len());
        for event in self.events.drain(..) {
            if pred(&event) {
                removed.push(event);
            } else {
                kept.push(event);
            }
        }
        self.events = kept;
        // Internal order is most-imminent-last; dispatch order is the
        // reverse.
        removed.reverse();
        removed
    }

    /// Drop everything, returning the removed events most imminent
    /// first.
    pub fn clear(&mut self) -> Vec<Event> {
        let mut all = std::mem::take(&mut self.events);
        all.reverse();
        all
    }

    /// Iterate pending events without removing them, most imminent
    /// first.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().rev()
    }
}
