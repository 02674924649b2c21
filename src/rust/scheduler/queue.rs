// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Time-ordered priority queues of scheduling tickets.
//!
//! Both the EDF runnable queue and the activation queue are ordered sets
//! keyed by an absolute time and the domain id. The domain-id tie break makes
//! the order total: two tickets never compare equal, and the popped sequence
//! is the same on every hardware thread of a cohort.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::arena::FixedArena,
    runtime::types::TimeNs,
    scheduler::{
        domain::DomainId,
        ticket::{
            Locus,
            Ticket,
            TicketId,
        },
    },
};
use ::std::collections::BTreeMap;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Which time attribute orders the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueOrder {
    /// Order by absolute deadline: the EDF runnable queue.
    Deadline,
    /// Order by earliest start time: the activation queue.
    EarliestStart,
}

/// A priority queue of tickets, keyed by `(time, domain id)` over the ticket
/// arena of the owning local scheduler.
pub struct TicketQueue {
    order: QueueOrder,
    entries: BTreeMap<(TimeNs, DomainId), TicketId>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TicketQueue {
    pub fn new(order: QueueOrder) -> Self {
        Self {
            order,
            entries: BTreeMap::new(),
        }
    }

    /// The locus value stamped on tickets held by this queue.
    fn locus(&self) -> Locus {
        match self.order {
            QueueOrder::Deadline => Locus::RunnableQueue,
            QueueOrder::EarliestStart => Locus::ActivationQueue,
        }
    }

    fn key_of(&self, ticket: &Ticket) -> (TimeNs, DomainId) {
        match self.order {
            QueueOrder::Deadline => (ticket.deadline, ticket.domid),
            QueueOrder::EarliestStart => (ticket.earliest_start_time, ticket.domid),
        }
    }

    /// Inserts a detached ticket. Keys are derived from the ticket's current
    /// time values, so those must be final before insertion.
    pub fn insert(&mut self, arena: &mut FixedArena<Ticket>, tid: TicketId) {
        let ticket: &mut Ticket = arena.get_mut(tid.0).expect("ticket to insert must be live");
        assert!(
            ticket.locus == Locus::Detached,
            "inserting ticket of domain {} that is already in {:?}",
            ticket.domid,
            ticket.locus
        );
        ticket.locus = self.locus();
        let key: (TimeNs, DomainId) = self.key_of(ticket);
        if self.entries.insert(key, tid).is_some() {
            panic!("two tickets of domain {} in the same queue", key.1);
        }
    }

    /// Removes a specific ticket and detaches it, so that it can be safely
    /// inserted elsewhere.
    pub fn remove(&mut self, arena: &mut FixedArena<Ticket>, tid: TicketId) {
        let ticket: &mut Ticket = arena.get_mut(tid.0).expect("ticket to remove must be live");
        assert!(
            ticket.locus == self.locus(),
            "removing ticket of domain {} from {:?} while it is in {:?}",
            ticket.domid,
            self.locus(),
            ticket.locus
        );
        let key: (TimeNs, DomainId) = self.key_of(ticket);
        match self.entries.remove(&key) {
            Some(found) if found == tid => ticket.locus = Locus::Detached,
            _ => panic!("ticket of domain {} not found at its own key", key.1),
        }
    }

    /// The ticket with the smallest key, if any.
    pub fn peek_min(&self) -> Option<TicketId> {
        self.entries.values().next().copied()
    }

    /// Removes and detaches the ticket with the smallest key.
    pub fn pop_min(&mut self, arena: &mut FixedArena<Ticket>) -> Option<TicketId> {
        let tid: TicketId = self.peek_min()?;
        self.remove(arena, tid);
        Some(tid)
    }

    /// Searches for the ticket of a given domain. Linear in the queue length.
    pub fn search_domain(&self, domid: DomainId) -> Option<TicketId> {
        self.entries
            .iter()
            .find(|((_, id), _)| *id == domid)
            .map(|(_, tid)| *tid)
    }

    /// Iterates tickets in key order.
    pub fn iter(&self) -> impl Iterator<Item = TicketId> + '_ {
        self.entries.values().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drops all entries. Used only when the owning scheduler discards the
    /// whole arena.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        QueueOrder,
        TicketQueue,
    };
    use crate::{
        collections::arena::FixedArena,
        scheduler::{
            domain::DomainId,
            ticket::{
                Locus,
                Ticket,
                TicketId,
            },
        },
    };
    use ::anyhow::Result;

    fn alloc(arena: &mut FixedArena<Ticket>, domid: i32, deadline: i64) -> TicketId {
        let mut ticket: Ticket = Ticket::new(None, DomainId(domid));
        ticket.deadline = deadline;
        ticket.earliest_start_time = deadline;
        TicketId(arena.insert(ticket).expect("arena has room"))
    }

    #[test]
    fn pop_order_is_time_then_domain_id() -> Result<()> {
        let mut arena: FixedArena<Ticket> = FixedArena::new(8);
        let mut queue: TicketQueue = TicketQueue::new(QueueOrder::Deadline);

        let late: TicketId = alloc(&mut arena, 1, 300);
        let tie_high: TicketId = alloc(&mut arena, 9, 100);
        let tie_low: TicketId = alloc(&mut arena, 2, 100);
        queue.insert(&mut arena, late);
        queue.insert(&mut arena, tie_high);
        queue.insert(&mut arena, tie_low);

        crate::ensure_eq!(queue.pop_min(&mut arena), Some(tie_low));
        crate::ensure_eq!(queue.pop_min(&mut arena), Some(tie_high));
        crate::ensure_eq!(queue.pop_min(&mut arena), Some(late));
        crate::ensure_eq!(queue.pop_min(&mut arena), None);
        Ok(())
    }

    #[test]
    fn removal_detaches_ticket() -> Result<()> {
        let mut arena: FixedArena<Ticket> = FixedArena::new(8);
        let mut queue: TicketQueue = TicketQueue::new(QueueOrder::EarliestStart);

        let tid: TicketId = alloc(&mut arena, 3, 50);
        queue.insert(&mut arena, tid);
        crate::ensure_eq!(arena.get(tid.0).map(|t| t.locus), Some(Locus::ActivationQueue));

        queue.remove(&mut arena, tid);
        crate::ensure_eq!(arena.get(tid.0).map(|t| t.locus), Some(Locus::Detached));
        crate::ensure_eq!(queue.is_empty(), true);

        // A detached ticket may be inserted again.
        queue.insert(&mut arena, tid);
        crate::ensure_eq!(queue.len(), 1);
        Ok(())
    }

    #[test]
    fn search_finds_ticket_by_domain() -> Result<()> {
        let mut arena: FixedArena<Ticket> = FixedArena::new(8);
        let mut queue: TicketQueue = TicketQueue::new(QueueOrder::Deadline);

        let a: TicketId = alloc(&mut arena, 4, 10);
        let b: TicketId = alloc(&mut arena, 5, 20);
        queue.insert(&mut arena, a);
        queue.insert(&mut arena, b);

        crate::ensure_eq!(queue.search_domain(DomainId(5)), Some(b));
        crate::ensure_eq!(queue.search_domain(DomainId(6)), None);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "already in")]
    fn double_insert_is_fatal() {
        let mut arena: FixedArena<Ticket> = FixedArena::new(8);
        let mut queue: TicketQueue = TicketQueue::new(QueueOrder::Deadline);
        let tid: TicketId = alloc(&mut arena, 1, 10);
        queue.insert(&mut arena, tid);
        queue.insert(&mut arena, tid);
    }
}
