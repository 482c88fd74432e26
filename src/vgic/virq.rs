//! Virtual interrupt state and the intrusive pending queue.
//!
//! States live in one fixed arena: SPIs once, SGIs and PPIs once per core.
//! The pending queue threads through the arena by index, so no allocation
//! is ever needed at EL2.

use crate::arch::gicv2::{MAX_IRQ_ID, NUM_PRIVATE_IRQS, NUM_SGIS};
use crate::platform::MAX_CORE;

/// Arena index one past the last SPI.
pub const SPI_END_INDEX: usize = (MAX_IRQ_ID + 1 - NUM_PRIVATE_IRQS) as usize;
/// Total number of virtual interrupt states.
pub const MAX_NUM_INT_STATES: usize = SPI_END_INDEX + MAX_CORE * NUM_PRIVATE_IRQS as usize;

/// Lowest virtual priority, the reset value of every interrupt.
pub const LOWEST_VIRTUAL_PRIORITY: u8 = 0x1F;
/// Virtual priorities are GIC priorities with the low 3 bits dropped.
pub const PRIORITY_SHIFT: u32 = 3;

/// Link of a state in the pending queue.
///
/// `Unqueued` and `End` are distinct: a queued state at the tail links to
/// `End`, a state outside the queue links to nothing at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueLink {
    Unqueued,
    End,
    Node(u16),
}

impl QueueLink {
    fn index(self) -> Option<usize> {
        match self {
            QueueLink::Node(i) => Some(i as usize),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VirqState {
    pub irq_id: u16,
    /// Owning core for SGIs/PPIs; for SPIs, the core currently handling it.
    pub core_id: u8,
    pub src_core_id: u8,
    pub edge_triggered: bool,
    /// 5-bit virtual priority
    pub priority: u8,
    pub target_list: u8,
    pub enabled: bool,
    /// Level of the line (level-sensitive interrupts)
    pub pending: bool,
    /// Latched edge (edge-triggered interrupts)
    pub pending_latch: bool,
    pub active: bool,
    /// Occupies a list register
    pub handled: bool,
    prev: QueueLink,
    next: QueueLink,
}

impl VirqState {
    pub const INIT: Self = Self {
        irq_id: 0,
        core_id: 0,
        src_core_id: 0,
        edge_triggered: false,
        priority: LOWEST_VIRTUAL_PRIORITY,
        target_list: 0,
        enabled: false,
        pending: false,
        pending_latch: false,
        active: false,
        handled: false,
        prev: QueueLink::Unqueued,
        next: QueueLink::Unqueued,
    };

    pub fn is_queued(&self) -> bool {
        self.next != QueueLink::Unqueued
    }

    pub fn is_pending(&self) -> bool {
        self.pending_latch || (!self.edge_triggered && self.pending)
    }

    pub fn set_pending(&mut self) {
        if self.edge_triggered {
            self.pending_latch = true;
        } else {
            self.pending = true;
        }
    }

    pub fn clear_pending(&mut self) {
        self.pending = false;
        self.pending_latch = false;
    }

    pub fn is_sgi(&self) -> bool {
        u32::from(self.irq_id) < NUM_SGIS
    }

    pub fn is_private(&self) -> bool {
        u32::from(self.irq_id) < NUM_PRIVATE_IRQS
    }

    /// Cores that may take this interrupt.
    pub fn targets(&self) -> u32 {
        if self.is_private() {
            1 << self.core_id
        } else {
            u32::from(self.target_list)
        }
    }
}

impl Default for VirqState {
    fn default() -> Self {
        Self::INIT
    }
}

/// Arena index of `irq_id` as seen from `core_id`.
pub fn state_index(core_id: u32, irq_id: u32) -> usize {
    if irq_id >= NUM_PRIVATE_IRQS {
        (irq_id - NUM_PRIVATE_IRQS) as usize
    } else {
        SPI_END_INDEX + (core_id * NUM_PRIVATE_IRQS + irq_id) as usize
    }
}

/// Priority-ordered doubly linked list over the state arena.
#[derive(Debug)]
pub struct VirqQueue {
    first: QueueLink,
    last: QueueLink,
}

impl VirqQueue {
    pub const fn new() -> Self {
        Self {
            first: QueueLink::End,
            last: QueueLink::End,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first == QueueLink::End
    }

    pub fn first(&self) -> Option<usize> {
        self.first.index()
    }

    pub fn next(&self, states: &[VirqState], idx: usize) -> Option<usize> {
        states[idx].next.index()
    }

    pub fn iter<'a>(&self, states: &'a [VirqState]) -> impl Iterator<Item = usize> + 'a {
        let mut cur = self.first;
        core::iter::from_fn(move || {
            let idx = cur.index()?;
            cur = states[idx].next;
            Some(idx)
        })
    }

    /// Insert by priority. Among equal priorities, the new state goes after
    /// entries that were already handled and before those never handled.
    pub fn insert(&mut self, states: &mut [VirqState], idx: usize) {
        let priority = states[idx].priority;
        let pos = self
            .iter(states)
            .find(|&p| {
                let other = &states[p];
                other.priority > priority || (other.priority == priority && !other.handled)
            })
            .map_or(QueueLink::End, |p| QueueLink::Node(p as u16));
        self.insert_before(states, pos, idx);
    }

    fn insert_before(&mut self, states: &mut [VirqState], pos: QueueLink, idx: usize) {
        assert!(
            !states[idx].is_queued(),
            "vIRQ {} is already queued",
            states[idx].irq_id
        );
        let node = QueueLink::Node(idx as u16);
        let prev = match pos.index() {
            Some(p) => states[p].prev,
            None => self.last,
        };

        states[idx].prev = prev;
        states[idx].next = pos;

        match prev.index() {
            Some(p) => states[p].next = node,
            None => self.first = node,
        }
        match pos.index() {
            Some(p) => states[p].prev = node,
            None => self.last = node,
        }
    }

    pub fn erase(&mut self, states: &mut [VirqState], idx: usize) {
        assert!(
            states[idx].is_queued(),
            "vIRQ {} is not queued",
            states[idx].irq_id
        );
        let (prev, next) = (states[idx].prev, states[idx].next);

        match prev.index() {
            Some(p) => states[p].next = next,
            None => self.first = next,
        }
        match next.index() {
            Some(n) => states[n].prev = prev,
            None => self.last = prev,
        }

        states[idx].prev = QueueLink::Unqueued;
        states[idx].next = QueueLink::Unqueued;
    }
}

impl Default for VirqQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(priorities: &[(u8, bool)]) -> [VirqState; 8] {
        let mut states = [VirqState::INIT; 8];
        for (i, &(prio, handled)) in priorities.iter().enumerate() {
            states[i].irq_id = 32 + i as u16;
            states[i].priority = prio;
            states[i].handled = handled;
        }
        states
    }

    #[test]
    fn test_priority_order_prefers_previously_handled() {
        let mut states = arena(&[(5, false), (3, false), (5, true), (3, false)]);
        let mut queue = VirqQueue::new();
        for i in 0..4 {
            queue.insert(&mut states, i);
        }
        let order: Vec<u8> = queue.iter(&states).map(|i| states[i].priority).collect();
        assert_eq!(order, [3, 3, 5, 5]);
        let fives: Vec<usize> = queue.iter(&states).filter(|&i| states[i].priority == 5).collect();
        assert_eq!(fives, [2, 0]);
    }

    #[test]
    fn test_erase_relinks_neighbours() {
        let mut states = arena(&[(1, false), (2, false), (3, false)]);
        let mut queue = VirqQueue::new();
        for i in 0..3 {
            queue.insert(&mut states, i);
        }
        queue.erase(&mut states, 1);
        assert!(!states[1].is_queued());
        assert_eq!(queue.iter(&states).collect::<Vec<_>>(), [0, 2]);
        queue.erase(&mut states, 0);
        queue.erase(&mut states, 2);
        assert!(queue.is_empty());
        assert_eq!(queue.first(), None);
    }

    #[test]
    #[should_panic]
    fn test_double_insert_is_fatal() {
        let mut states = arena(&[(1, false)]);
        let mut queue = VirqQueue::new();
        queue.insert(&mut states, 0);
        queue.insert(&mut states, 0);
    }

    #[test]
    fn test_state_index_layout() {
        assert_eq!(state_index(3, 32), 0);
        assert_eq!(state_index(0, 5), SPI_END_INDEX + 5);
        assert_eq!(state_index(2, 27), SPI_END_INDEX + 64 + 27);
        assert_eq!(state_index(3, 31), MAX_NUM_INT_STATES - 1);
    }

    #[test]
    fn test_pending_semantics() {
        let mut st = VirqState::INIT;
        st.edge_triggered = true;
        st.pending = true;
        assert!(!st.is_pending());
        st.set_pending();
        assert!(st.pending_latch && st.is_pending());
        st.clear_pending();
        assert!(!st.is_pending());
    }
}
