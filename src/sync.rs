use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

/// Ticket counters shared by [`SpinLock`] and [`RecursiveSpinLock`].
struct TicketLock {
    next_ticket: AtomicU32,
    now_serving: AtomicU32,
}

impl TicketLock {
    const fn new() -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
        }
    }

    fn acquire(&self) -> u32 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop(); // WFE on ARM64
        }
        ticket
    }

    fn try_acquire(&self) -> Option<u32> {
        let ticket = self.now_serving.load(Ordering::Acquire);
        self.next_ticket
            .compare_exchange(ticket, ticket.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
            .ok()
    }

    fn release(&self, ticket: u32) {
        self.now_serving
            .store(ticket.wrapping_add(1), Ordering::Release);
        send_event();
    }
}

/// Wake any core parked in `wfe`.
#[inline]
pub fn send_event() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        core::arch::asm!("sev", options(nostack, nomem))
    };
}

/// Wait for an event (or spin on hosts).
#[inline]
pub fn wait_for_event() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        core::arch::asm!("wfe", options(nostack, nomem))
    };
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    core::hint::spin_loop();
}

pub struct SpinLock<T> {
    ticket: TicketLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    ticket: u32,
}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            ticket: TicketLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let ticket = self.ticket.acquire();
        SpinLockGuard { lock: self, ticket }
    }

    /// Take the lock only if nobody holds or waits for it.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let ticket = self.ticket.try_acquire()?;
        Some(SpinLockGuard { lock: self, ticket })
    }
}

impl<T> core::ops::Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> core::ops::DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.ticket.release(self.ticket);
    }
}

const NO_OWNER: u32 = u32::MAX;

/// Spinlock that the owning core may take again while already holding it.
///
/// Ownership is keyed by core id, which callers pass explicitly. The guard
/// only hands out shared references: wrap mutable state in a `RefCell`.
pub struct RecursiveSpinLock<T> {
    ticket: TicketLock,
    owner: AtomicU32,
    /// Ticket held by the owner. Only touched by the owning core.
    held_ticket: UnsafeCell<u32>,
    depth: UnsafeCell<u32>,
    data: T,
}

unsafe impl<T: Send> Sync for RecursiveSpinLock<T> {}
unsafe impl<T: Send> Send for RecursiveSpinLock<T> {}

pub struct RecursiveSpinLockGuard<'a, T> {
    lock: &'a RecursiveSpinLock<T>,
}

impl<T> RecursiveSpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            ticket: TicketLock::new(),
            owner: AtomicU32::new(NO_OWNER),
            held_ticket: UnsafeCell::new(0),
            depth: UnsafeCell::new(0),
            data,
        }
    }

    pub fn lock(&self, core_id: u32) -> RecursiveSpinLockGuard<'_, T> {
        if self.owner.load(Ordering::Relaxed) == core_id {
            unsafe { *self.depth.get() += 1 };
        } else {
            let ticket = self.ticket.acquire();
            self.owner.store(core_id, Ordering::Relaxed);
            unsafe {
                *self.held_ticket.get() = ticket;
                *self.depth.get() = 1;
            }
        }
        RecursiveSpinLockGuard { lock: self }
    }

    /// Whether `core_id` currently holds the lock.
    pub fn is_held_by(&self, core_id: u32) -> bool {
        self.owner.load(Ordering::Relaxed) == core_id
    }
}

impl<T> core::ops::Deref for RecursiveSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.lock.data
    }
}

impl<T> Drop for RecursiveSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        let lock = self.lock;
        unsafe {
            *lock.depth.get() -= 1;
            if *lock.depth.get() == 0 {
                let ticket = *lock.held_ticket.get();
                lock.owner.store(NO_OWNER, Ordering::Relaxed);
                lock.ticket.release(ticket);
            }
        }
    }
}

/// Core rendezvous: the initiator resets the mask, every core in it joins.
pub struct Barrier {
    val: AtomicU32,
    /// Bumped by every reset, so waiters of a finished round leave even if
    /// the next round re-arms the mask before they saw it reach zero.
    generation: AtomicU32,
}

impl Barrier {
    pub const fn new() -> Self {
        Self {
            val: AtomicU32::new(0),
            generation: AtomicU32::new(0),
        }
    }

    pub fn reset(&self, core_mask: u32) {
        self.val.store(core_mask, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Remove this core from the mask, then wait for everyone else.
    pub fn join(&self, core_id: u32) {
        let bit = 1u32 << core_id;
        let generation = self.generation.load(Ordering::SeqCst);
        let prev = self.val.fetch_and(!bit, Ordering::SeqCst);
        assert!(
            prev & bit != 0,
            "core {} joined a barrier it was not part of",
            core_id
        );
        send_event();
        while self.val.load(Ordering::SeqCst) != 0
            && self.generation.load(Ordering::SeqCst) == generation
        {
            wait_for_event();
        }
    }

    pub fn pending(&self) -> u32 {
        self.val.load(Ordering::SeqCst)
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}
