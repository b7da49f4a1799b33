//! Command identifier table
//!
//! One command slot and one response slot per identifier, plus a FIFO free
//! list. An identifier is free only when both of its slots are empty:
//! - the command slot empties on send completion
//! - the response slot empties on receive completion, which also puts the
//!   identifier back on the free list
//!
//! The receive can overtake the send completion, so a freed identifier may
//! still have its command slot occupied. `reserve` skips such identifiers
//! and fails with `QueueFull` once every free entry has been tried, rather
//! than spinning until the send completion is polled.

use crate::error::{NvmfError, Result};
use std::collections::VecDeque;

pub(crate) struct CommandIdTable<C, R> {
    commands: Vec<Option<C>>,
    responses: Vec<Option<R>>,
    free: VecDeque<u16>,
}

impl<C, R> CommandIdTable<C, R> {
    pub(crate) fn new(size: u16) -> Self {
        Self {
            commands: (0..size).map(|_| None).collect(),
            responses: (0..size).map(|_| None).collect(),
            free: (0..size).collect(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.commands.len()
    }

    /// Pop a free identifier whose command slot has drained
    ///
    /// Each identifier on the free list is tried once; busy ones go to the
    /// back of the list.
    pub(crate) fn reserve(&mut self) -> Result<u16> {
        for _ in 0..self.free.len() {
            let cid = self.free.pop_front().ok_or(NvmfError::QueueFull)?;
            if self.commands[cid as usize].is_none() {
                debug_assert!(self.responses[cid as usize].is_none());
                return Ok(cid);
            }
            // response done, send completion still pending
            self.free.push_back(cid);
        }
        Err(NvmfError::QueueFull)
    }

    /// Hand back an identifier that was reserved but never posted
    pub(crate) fn unreserve(&mut self, cid: u16) {
        self.free.push_back(cid);
    }

    pub(crate) fn insert(&mut self, cid: u16, command: C, response: R) {
        let index = cid as usize;
        debug_assert!(self.commands[index].is_none() && self.responses[index].is_none());
        self.commands[index] = Some(command);
        self.responses[index] = Some(response);
    }

    pub(crate) fn release_on_send_complete(&mut self, cid: u16) -> Option<C> {
        self.commands.get_mut(cid as usize)?.take()
    }

    /// Empty the response slot and return the identifier to the free list
    pub(crate) fn release_on_receive_complete(&mut self, cid: u16) -> Option<R> {
        let response = self.responses.get_mut(cid as usize)?.take()?;
        self.free.push_back(cid);
        Some(response)
    }

    /// Occupied response slots, left in place
    pub(crate) fn responses_mut(&mut self) -> impl Iterator<Item = &mut R> {
        self.responses.iter_mut().flatten()
    }

    pub(crate) fn outstanding_commands(&self) -> usize {
        self.commands.iter().filter(|c| c.is_some()).count()
    }

    pub(crate) fn outstanding_responses(&self) -> usize {
        self.responses.iter().filter(|r| r.is_some()).count()
    }

    pub(crate) fn free_identifiers(&self) -> usize {
        self.free.len()
    }

    /// Drop every entry and reset the free list
    pub(crate) fn clear(&mut self) {
        self.commands.iter_mut().for_each(|c| *c = None);
        self.responses.iter_mut().for_each(|r| *r = None);
        self.free = (0..self.capacity() as u16).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;

    type Table = CommandIdTable<(), ()>;

    #[test]
    fn test_initial_order() {
        let mut table = Table::new(4);
        let ids: Vec<u16> = (0..4).map(|_| table.reserve().unwrap()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert!(matches!(table.reserve(), Err(NvmfError::QueueFull)));
    }

    #[test]
    fn test_depth_two_scenario() {
        let mut table = Table::new(2);
        let a = table.reserve().unwrap();
        table.insert(a, (), ());
        let b = table.reserve().unwrap();
        table.insert(b, (), ());
        assert_eq!((a, b), (0, 1));
        assert!(matches!(table.reserve(), Err(NvmfError::QueueFull)));

        assert!(table.release_on_send_complete(a).is_some());
        assert!(table.release_on_receive_complete(a).is_some());
        assert_eq!(table.reserve().unwrap(), 0);
    }

    #[test]
    fn test_receive_before_send_completion() {
        let mut table = Table::new(2);
        let a = table.reserve().unwrap();
        table.insert(a, (), ());

        // response arrived first; identifier is back but not reusable
        table.release_on_receive_complete(a).unwrap();
        assert_eq!(table.reserve().unwrap(), 1);
        assert!(matches!(table.reserve(), Err(NvmfError::QueueFull)));
        assert_eq!(table.free_identifiers(), 1);

        table.release_on_send_complete(a).unwrap();
        assert_eq!(table.reserve().unwrap(), 0);
    }

    #[test]
    fn test_skips_busy_identifier() {
        let mut table = Table::new(3);
        for _ in 0..3 {
            let cid = table.reserve().unwrap();
            table.insert(cid, (), ());
        }
        table.release_on_receive_complete(0).unwrap();
        table.release_on_receive_complete(1).unwrap();
        table.release_on_send_complete(1).unwrap();

        // 0 is still waiting for its send completion
        assert_eq!(table.reserve().unwrap(), 1);
        assert_eq!(table.free_identifiers(), 1);
    }

    #[test]
    fn test_all_free_identifiers_busy() {
        let mut table = Table::new(2);
        for _ in 0..2 {
            let cid = table.reserve().unwrap();
            table.insert(cid, (), ());
        }
        table.release_on_receive_complete(0).unwrap();
        table.release_on_receive_complete(1).unwrap();

        // both back on the free list, neither usable yet
        assert!(matches!(table.reserve(), Err(NvmfError::QueueFull)));
        assert_eq!(table.free_identifiers(), 2);
    }

    #[test]
    fn test_unknown_identifiers() {
        let mut table = Table::new(2);
        assert!(table.release_on_send_complete(1).is_none());
        assert!(table.release_on_receive_complete(1).is_none());
        assert!(table.release_on_send_complete(500).is_none());
        // nothing was pushed to the free list
        assert_eq!(table.free_identifiers(), 2);
    }

    #[test]
    fn test_clear() {
        let mut table = Table::new(2);
        let cid = table.reserve().unwrap();
        table.insert(cid, (), ());
        assert_eq!(table.outstanding_commands(), 1);
        assert_eq!(table.outstanding_responses(), 1);

        table.clear();
        assert_eq!(table.outstanding_commands(), 0);
        assert_eq!(table.free_identifiers(), 2);
    }

    #[test]
    fn test_randomized_identifiers_unique() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let depth = 16u16;
        let mut table = Table::new(depth);
        let mut sent: BTreeSet<u16> = BTreeSet::new();
        let mut received: BTreeSet<u16> = BTreeSet::new();

        for _ in 0..10_000 {
            match rng.gen_range(0..3) {
                0 => match table.reserve() {
                    Ok(cid) => {
                        assert!(!sent.contains(&cid) && !received.contains(&cid));
                        table.insert(cid, (), ());
                        sent.insert(cid);
                        received.insert(cid);
                    }
                    Err(NvmfError::QueueFull) => {
                        // only when nothing is reusable
                        let reusable = (0..depth)
                            .filter(|cid| !sent.contains(cid) && !received.contains(cid))
                            .count();
                        assert_eq!(reusable, 0);
                    }
                    Err(e) => panic!("unexpected error: {}", e),
                },
                1 => {
                    if let Some(&cid) = sent.iter().next() {
                        assert!(table.release_on_send_complete(cid).is_some());
                        sent.remove(&cid);
                    }
                }
                _ => {
                    if let Some(&cid) = received.iter().next() {
                        assert!(table.release_on_receive_complete(cid).is_some());
                        received.remove(&cid);
                    }
                }
            }
            assert_eq!(table.outstanding_commands(), sent.len());
            assert_eq!(table.outstanding_responses(), received.len());
        }
    }
}
