//! Completion waiters.
//!
//! A waiter is a single-shot notification target attached to a register.
//! Each attached waiter is notified exactly once, with the outcome of the
//! next operation to complete on that register (or of a reset), in the
//! order waiters were attached.
//!
//! Notifications are collected while the device lock is held and
//! delivered by [`Notifications::dispatch`] after it is released, so a
//! waiter may call back into the device.

use crate::register::{RegisterStatus, Severity};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use tokio::sync::{oneshot, watch};

static NEXT_WAITER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a waiter, used to detach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaiterId(pub u64);

impl WaiterId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        Self(NEXT_WAITER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Outcome delivered to a waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Register the operation ran on.
    pub register: String,
    /// Recorded status.
    pub status: RegisterStatus,
    /// Recorded severity.
    pub severity: Severity,
}

impl Completion {
    /// True if the operation succeeded.
    pub fn is_ok(&self) -> bool {
        self.status == RegisterStatus::Ok
    }
}

/// A single-shot completion target.
pub trait Waiter: Send {
    /// Identity for [`detach`](crate::Device::detach).
    fn id(&self) -> WaiterId;

    /// Deliver the outcome; consumes the waiter.
    fn notify(self: Box<Self>, completion: Completion);
}

/// Waiter completing a tokio oneshot channel.
pub struct OneshotWaiter {
    id: WaiterId,
    tx: oneshot::Sender<Completion>,
}

impl OneshotWaiter {
    /// Waiter plus the receiver to await.
    pub fn new() -> (Self, oneshot::Receiver<Completion>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                id: WaiterId::next(),
                tx,
            },
            rx,
        )
    }
}

impl Waiter for OneshotWaiter {
    fn id(&self) -> WaiterId {
        self.id
    }

    fn notify(self: Box<Self>, completion: Completion) {
        let Self { tx, .. } = *self;
        // receiver may be gone
        let _ = tx.send(completion);
    }
}

/// Waiter posting to a shared std channel; usable from blocking code.
pub struct ChannelWaiter {
    id: WaiterId,
    tx: mpsc::Sender<(WaiterId, Completion)>,
}

impl ChannelWaiter {
    /// Waiter posting `(id, completion)` to `tx`.
    pub fn new(tx: mpsc::Sender<(WaiterId, Completion)>) -> Self {
        Self {
            id: WaiterId::next(),
            tx,
        }
    }
}

impl Waiter for ChannelWaiter {
    fn id(&self) -> WaiterId {
        self.id
    }

    fn notify(self: Box<Self>, completion: Completion) {
        let _ = self.tx.send((self.id, completion));
    }
}

/// Waiter running a closure.
pub struct FnWaiter<F> {
    id: WaiterId,
    f: F,
}

impl<F: FnOnce(Completion) + Send> FnWaiter<F> {
    /// Wrap a callback.
    pub fn new(f: F) -> Self {
        Self {
            id: WaiterId::next(),
            f,
        }
    }
}

impl<F: FnOnce(Completion) + Send> Waiter for FnWaiter<F> {
    fn id(&self) -> WaiterId {
        self.id
    }

    fn notify(self: Box<Self>, completion: Completion) {
        let Self { f, .. } = *self;
        f(completion)
    }
}

// ─── Deferred notification ──────────────────────────────────────────

/// Notifications collected under the device lock.
#[derive(Default)]
pub(crate) struct Notifications {
    completions: Vec<(Box<dyn Waiter>, Completion)>,
    registers: Vec<Arc<watch::Sender<u64>>>,
    device: bool,
}

impl Notifications {
    pub(crate) fn complete(&mut self, waiter: Box<dyn Waiter>, completion: Completion) {
        self.completions.push((waiter, completion));
    }

    pub(crate) fn register_changed(&mut self, changed: &Arc<watch::Sender<u64>>) {
        if !self.registers.iter().any(|c| Arc::ptr_eq(c, changed)) {
            self.registers.push(changed.clone());
        }
    }

    pub(crate) fn device_changed(&mut self) {
        self.device = true;
    }

    /// Deliver everything; must be called without the device lock.
    pub(crate) fn dispatch(self, device: &watch::Sender<u64>) {
        for (waiter, completion) in self.completions {
            waiter.notify(completion);
        }
        for changed in self.registers {
            changed.send_modify(|n| *n = n.wrapping_add(1));
        }
        if self.device {
            device.send_modify(|n| *n = n.wrapping_add(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn completion(status: RegisterStatus) -> Completion {
        Completion {
            register: "r".to_string(),
            status,
            severity: Severity::None,
        }
    }

    #[test]
    fn test_ids_unique() {
        assert_ne!(WaiterId::next(), WaiterId::next());
    }

    #[test]
    fn test_dispatch_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut notes = Notifications::default();
        for i in 0..3 {
            let seen = seen.clone();
            notes.complete(
                Box::new(FnWaiter::new(move |_| seen.lock().unwrap().push(i))),
                completion(RegisterStatus::Ok),
            );
        }
        let (device, rx) = watch::channel(0u64);
        notes.device_changed();
        notes.dispatch(&device);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(*rx.borrow(), 1);
    }

    #[test]
    fn test_register_change_deduplicated() {
        let (tx, rx) = watch::channel(0u64);
        let tx = Arc::new(tx);
        let mut notes = Notifications::default();
        notes.register_changed(&tx);
        notes.register_changed(&tx);
        let (device, device_rx) = watch::channel(0u64);
        notes.dispatch(&device);
        assert_eq!(*rx.borrow(), 1);
        assert_eq!(*device_rx.borrow(), 0);
    }

    #[test]
    fn test_channel_and_oneshot_waiters() {
        let (tx, rx) = mpsc::channel();
        let waiter = ChannelWaiter::new(tx);
        let id = waiter.id();
        Box::new(waiter).notify(completion(RegisterStatus::Timeout));
        let (got, c) = rx.recv().unwrap();
        assert_eq!(got, id);
        assert!(!c.is_ok());

        let (waiter, mut rx) = OneshotWaiter::new();
        Box::new(waiter).notify(completion(RegisterStatus::Ok));
        assert!(rx.try_recv().unwrap().is_ok());
    }
}
