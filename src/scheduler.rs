//! Sample-correspondence scheduling.
//!
//! The hardware round-robins over `nsamples` virtual channels once per shot.
//! Each virtual channel (slot) is bound to one physical input when the task is
//! built, so the ownership table decided here fixes which input is read at
//! every slot of the acquisition window:
//!
//! - `0`: rest slot, read from the configured rest channel
//! - `k > 0`: channel `k` (1-indexed position among configured channels)
//! - `k < 0`: chopper `-k` (1-indexed position among configured choppers)
//!
//! Slots wanted by several channels are shared round robin by slot index.
//! Choppers are applied last and always win their slot.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::channel::{Channel, Chopper};

/// Classification of a single ownership-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Unassigned slot.
    Rest,
    /// Zero-based index into the configured channel list.
    Channel(usize),
    /// Zero-based index into the configured chopper list.
    Chopper(usize),
}

/// Slot-ownership table for one acquisition window.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnershipTable(Vec<i32>);

impl OwnershipTable {
    /// Build the table for `nsamples` slots.
    ///
    /// Configuration is expected to be validated already; out-of-window
    /// chopper indices are ignored rather than reported.
    pub fn build(channels: &[Channel], choppers: &[Chopper], nsamples: usize) -> Self {
        let mut slots = vec![0_i32; nsamples];
        let mut claims: Vec<i32> = Vec::with_capacity(channels.len());

        for (i, slot) in slots.iter_mut().enumerate() {
            claims.clear();
            claims.extend(
                channels
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.enabled && c.claims(i))
                    .map(|(ordinal, _)| channel_id(ordinal)),
            );
            // Ordinals come out ascending and each channel is pushed at most
            // once, so the list is already sorted and de-duplicated.
            *slot = match claims.len() {
                0 => 0,
                1 => claims[0],
                n => claims[i % n],
            };
        }

        for (ordinal, chopper) in choppers.iter().enumerate() {
            if !chopper.enabled {
                continue;
            }
            if let Some(slot) = slots.get_mut(chopper.index) {
                *slot = -channel_id(ordinal);
            }
        }

        Self(slots)
    }

    /// Raw table entries.
    pub fn slots(&self) -> &[i32] {
        &self.0
    }

    /// Number of slots (`nsamples`).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for a zero-length acquisition window.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Classify slot `index`, or `None` if it is outside the table.
    pub fn slot(&self, index: usize) -> Option<Slot> {
        self.0.get(index).map(|&id| classify(id))
    }

    /// Iterate all slots in order.
    pub fn iter(&self) -> impl Iterator<Item = Slot> + '_ {
        self.0.iter().map(|&id| classify(id))
    }

    /// Slot indices holding `id`, ascending.
    pub fn rows_for(&self, id: i32) -> Vec<usize> {
        self.0
            .iter()
            .enumerate()
            .filter(|&(_, &v)| v == id)
            .map(|(row, _)| row)
            .collect()
    }

    /// Number of slots assigned to any chopper.
    pub fn chopper_slots(&self) -> usize {
        self.0.iter().filter(|&&v| v < 0).count()
    }
}

impl fmt::Display for OwnershipTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// 1-indexed table id for a zero-based ordinal.
pub(crate) fn channel_id(ordinal: usize) -> i32 {
    i32::try_from(ordinal + 1).unwrap_or(i32::MAX)
}

fn classify(id: i32) -> Slot {
    match id {
        0 => Slot::Rest,
        k if k > 0 => Slot::Channel(k as usize - 1),
        k => Slot::Chopper(k.unsigned_abs() as usize - 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SampleWindow;

    #[test]
    fn test_single_channel_and_chopper() {
        let channels = vec![Channel::new("signal", "ai0", SampleWindow::new(2, 5, 1))];
        let choppers = vec![Chopper::new("chopper", "ai7", 8)];
        let table = OwnershipTable::build(&channels, &choppers, 10);
        assert_eq!(table.slots(), &[0, 0, 1, 1, 1, 0, 0, 0, -1, 0]);
    }

    #[test]
    fn test_chopper_overrides_channel() {
        let channels = vec![Channel::new("signal", "ai0", SampleWindow::new(1, 9, 1))];
        let choppers = vec![Chopper::new("chopper", "ai7", 4)];
        let table = OwnershipTable::build(&channels, &choppers, 10);
        assert_eq!(table.slot(4), Some(Slot::Chopper(0)));
        assert_eq!(table.slot(3), Some(Slot::Channel(0)));
        assert_eq!(table.slot(5), Some(Slot::Channel(0)));
    }

    #[test]
    fn test_round_robin_is_fair() {
        // Identical windows over slots 1..=12 (twelve shared slots).
        let window = SampleWindow::new(3, 13, 3);
        let channels = vec![
            Channel::new("a", "ai0", window),
            Channel::new("b", "ai1", window),
        ];
        let table = OwnershipTable::build(&channels, &[], 14);
        let a = table.rows_for(1).len();
        let b = table.rows_for(2).len();
        assert_eq!(a + b, 12);
        assert!(a.abs_diff(b) <= 1);
        // Shared slots alternate by slot index.
        assert_eq!(&table.slots()[..4], &[0, 2, 1, 2]);
    }

    #[test]
    fn test_round_robin_odd_overlap() {
        let window = SampleWindow::new(2, 6, 0);
        let channels = vec![
            Channel::new("a", "ai0", window),
            Channel::new("b", "ai1", window),
        ];
        let table = OwnershipTable::build(&channels, &[], 8);
        // Slots 3, 4, 5 are shared; 3 % 2 -> b, 4 % 2 -> a, 5 % 2 -> b.
        assert_eq!(table.slots(), &[0, 0, 0, 2, 1, 2, 0, 0]);
        let a = table.rows_for(1).len();
        let b = table.rows_for(2).len();
        assert_eq!((a, b), (1, 2));
    }

    #[test]
    fn test_baseline_window_claims_slots() {
        let channel = Channel::new("signal", "ai0", SampleWindow::new(1, 3, 0))
            .with_baseline(SampleWindow::new(6, 9, 1), crate::channel::AggregationMethod::Average);
        let table = OwnershipTable::build(&[channel], &[], 10);
        assert_eq!(table.slots(), &[0, 0, 1, 0, 0, 0, 1, 1, 1, 0]);
    }

    #[test]
    fn test_baseline_ignored_when_unused() {
        let mut channel = Channel::new("signal", "ai0", SampleWindow::new(1, 3, 0));
        channel.baseline = SampleWindow::new(6, 9, 1);
        let table = OwnershipTable::build(&[channel], &[], 10);
        assert_eq!(table.rows_for(1), vec![2]);
    }

    #[test]
    fn test_disabled_entries_keep_their_ids() {
        let mut first = Channel::new("first", "ai0", SampleWindow::new(1, 4, 0));
        first.enabled = false;
        let second = Channel::new("second", "ai1", SampleWindow::new(1, 4, 0));
        let mut chop_a = Chopper::new("a", "ai6", 7);
        chop_a.enabled = false;
        let chop_b = Chopper::new("b", "ai7", 8);

        let table = OwnershipTable::build(&[first, second], &[chop_a, chop_b], 10);
        assert_eq!(table.slots(), &[0, 0, 2, 2, 0, 0, 0, 0, -2, 0]);
        assert_eq!(table.chopper_slots(), 1);
    }

    #[test]
    fn test_every_slot_is_valid() {
        let channels = vec![
            Channel::new("a", "ai0", SampleWindow::new(3, 40, 3)),
            Channel::new("b", "ai1", SampleWindow::new(20, 60, 5)).with_baseline(
                SampleWindow::new(70, 90, 0),
                crate::channel::AggregationMethod::Min,
            ),
            Channel::new("c", "ai2", SampleWindow::new(10, 95, 10)),
        ];
        let choppers = vec![Chopper::new("x", "ai6", 0), Chopper::new("y", "ai7", 50)];
        let table = OwnershipTable::build(&channels, &choppers, 100);

        assert_eq!(table.len(), 100);
        for id in table.slots() {
            assert!((-2..=3).contains(id), "slot id {id} out of range");
        }
        assert_eq!(table.chopper_slots(), 2);
        assert_eq!(table.slot(0), Some(Slot::Chopper(0)));
        assert_eq!(table.slot(50), Some(Slot::Chopper(1)));
    }
}
