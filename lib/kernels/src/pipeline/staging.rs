// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Group-local staging storage.
//!
//! A ring of equally sized slots with an explicit barrier. A slot written by a
//! transfer becomes readable only after the next [`StagingBuffer::sync`], and a slot
//! being consumed becomes writable again only after the barrier that ends the
//! consume. Touching a slot in the wrong state is a programming error and panics.

use bytemuck::Zeroable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Free to receive a transfer
    Free,
    /// A transfer wrote into the slot; not yet visible
    Filling,
    /// Published by a barrier; readable
    Ready,
    /// Being consumed by compute
    Consuming,
}

#[derive(Debug)]
pub struct StagingBuffer<T> {
    slot_len: usize,
    data: Vec<T>,
    states: Vec<SlotState>,
    barriers: usize,
}

impl<T: Zeroable + Copy> StagingBuffer<T> {
    pub fn new(num_slots: usize, slot_len: usize) -> Self {
        Self {
            slot_len,
            data: vec![T::zeroed(); num_slots * slot_len],
            states: vec![SlotState::Free; num_slots],
            barriers: 0,
        }
    }

    pub fn num_slots(&self) -> usize {
        self.states.len()
    }

    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    pub fn state(&self, slot: usize) -> SlotState {
        self.states[slot]
    }

    /// Barriers executed so far.
    pub fn barriers(&self) -> usize {
        self.barriers
    }

    /// Start a transfer into `slot`.
    ///
    /// # Panics
    ///
    /// If the slot still holds unconsumed or in-use data.
    pub fn begin_write(&mut self, slot: usize) -> &mut [T] {
        let state = self.states[slot];
        assert!(
            state == SlotState::Free,
            "staging slot {slot} written while {state:?}: missing barrier"
        );
        self.states[slot] = SlotState::Filling;
        let start = slot * self.slot_len;
        &mut self.data[start..start + self.slot_len]
    }

    /// Start consuming `slot`.
    ///
    /// # Panics
    ///
    /// If the slot was not published by a barrier since it was written.
    pub fn read(&mut self, slot: usize) -> &[T] {
        let state = self.states[slot];
        assert!(
            state == SlotState::Ready,
            "staging slot {slot} read while {state:?}: missing barrier"
        );
        self.states[slot] = SlotState::Consuming;
        let start = slot * self.slot_len;
        &self.data[start..start + self.slot_len]
    }

    /// Group-wide barrier: publishes filled slots and releases consumed ones.
    pub fn sync(&mut self) {
        for state in self.states.iter_mut() {
            *state = match *state {
                SlotState::Filling => SlotState::Ready,
                SlotState::Consuming => SlotState::Free,
                other => other,
            };
        }
        self.barriers += 1;
    }
}
