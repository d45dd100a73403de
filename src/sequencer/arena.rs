/// Owning store for every sequencer, addressed by generational handles.
///
/// Connections between sequencers are `SequencerId`s into this arena, so
/// cycles in the step graph carry no ownership, and a handle to a removed
/// sequencer simply stops resolving.
use std::fmt;

use super::{Sequencer, StepSink, Transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequencerId {
    index: u32,
    generation: u32,
}

impl SequencerId {
    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SequencerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    sequencer: Option<Sequencer>,
}

#[derive(Debug)]
pub struct SequencerArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    capacity: usize,
}

impl SequencerArena {
    /// Reserve room for `capacity` sequencers up front; inserting never reallocates.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a sequencer. Returns `None` when the arena is full.
    pub fn insert(&mut self) -> Option<SequencerId> {
        let id = if let Some(index) = self.free.pop() {
            SequencerId {
                index,
                generation: self.slots[index as usize].generation,
            }
        } else if self.slots.len() < self.capacity {
            self.slots.push(Slot {
                generation: 0,
                sequencer: None,
            });
            SequencerId {
                index: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        } else {
            return None;
        };

        self.slots[id.index()].sequencer = Some(Sequencer::new(id));
        Some(id)
    }

    /// Remove a sequencer and every connection that leads into it.
    pub fn remove(&mut self, id: SequencerId) -> Option<Sequencer> {
        if !self.contains(id) {
            return None;
        }
        let slot = &mut self.slots[id.index()];
        let removed = slot.sequencer.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);

        for sequencer in self.iter_mut() {
            sequencer.disconnect_from(id);
        }
        removed
    }

    pub fn contains(&self, id: SequencerId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: SequencerId) -> Option<&Sequencer> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.sequencer.as_ref())
    }

    pub fn get_mut(&mut self, id: SequencerId) -> Option<&mut Sequencer> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.sequencer.as_mut())
    }

    /// Lowest-indexed live sequencer.
    pub fn first(&self) -> Option<SequencerId> {
        self.iter().next().map(|s| s.id())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sequencer> {
        self.slots.iter().filter_map(|slot| slot.sequencer.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Sequencer> {
        self.slots.iter_mut().filter_map(|slot| slot.sequencer.as_mut())
    }

    /// Enter the next step of `id` and resolve where execution continues.
    ///
    /// Returns the sequencer whose `next_step` is consumed at the following
    /// boundary: `id` itself, or the branch target. A branch into a sequencer
    /// that no longer exists falls back to continuing the ring.
    pub fn process_step_begin<S: StepSink>(&mut self, id: SequencerId, sink: &mut S) -> SequencerId {
        let Some(sequencer) = self.get_mut(id) else {
            return id;
        };

        match sequencer.process_step_begin(sink) {
            Transition::Continue => id,
            Transition::Branch(connection) => {
                if let Some(target) = self.get_mut(connection.target) {
                    target.jump_to(connection.step);
                    connection.target
                } else {
                    if let Some(sequencer) = self.get_mut(id) {
                        sequencer.advance();
                    }
                    id
                }
            }
        }
    }

    pub fn process_step_end<S: StepSink>(&mut self, id: SequencerId, sink: &mut S) {
        if let Some(sequencer) = self.get_mut(id) {
            sequencer.process_step_end(sink);
        }
    }

    pub fn stop<S: StepSink>(&mut self, id: SequencerId, sink: &mut S) {
        if let Some(sequencer) = self.get_mut(id) {
            sequencer.stop(sink);
        }
    }
}
