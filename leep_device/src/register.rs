//! Registers and their in-flight operations.
//!
//! A [`Register`] mirrors a block of device words. It carries the outcome
//! of its last completed operation, at most one [`InFlight`] operation and
//! a FIFO of attached waiters. It knows nothing about the network; the
//! session core drives it.

use crate::error::QueueError;
use crate::waiter::{Completion, Notifications, Waiter, WaiterId};
use leep_common::regmap::RegisterInfo;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// Outcome of the most recent completed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterStatus {
    /// No operation completed yet.
    #[default]
    Undefined,
    /// Reply matched.
    Ok,
    /// No matching reply within the timeout.
    Timeout,
    /// A reply arrived but was rejected, then the frame timed out.
    Malformed,
    /// The device flagged the command with a non-zero status nibble.
    DeviceError(u8),
    /// Aborted by a device reset.
    Reset,
}

impl RegisterStatus {
    /// Severity recorded alongside this status.
    pub const fn severity(self) -> Severity {
        match self {
            Self::Ok => Severity::None,
            Self::DeviceError(_) => Severity::Major,
            Self::Undefined | Self::Timeout | Self::Malformed | Self::Reset => Severity::Invalid,
        }
    }
}

impl fmt::Display for RegisterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Ok => f.write_str("ok"),
            Self::Timeout => f.write_str("timeout"),
            Self::Malformed => f.write_str("malformed"),
            Self::DeviceError(nibble) => write!(f, "device error {nibble:#x}"),
            Self::Reset => f.write_str("reset"),
        }
    }
}

/// Alarm severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// No alarm.
    None,
    /// Minor alarm.
    Minor,
    /// Major alarm.
    Major,
    /// Value not trustworthy.
    #[default]
    Invalid,
}

/// Operation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Device to mirror.
    Read,
    /// Mirror to device.
    Write,
}

impl Direction {
    /// `Write` if `is_write`, else `Read`.
    pub const fn from_write(is_write: bool) -> Self {
        if is_write { Self::Write } else { Self::Read }
    }
}

/// Where a register's address mapping comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterOrigin {
    /// Built-in handshake register; mapping never changes.
    Bootstrap,
    /// Declared in configuration; mapping never changes.
    Configured,
    /// Announced by the device ROM; unmapped on reset.
    Announced,
    /// Referenced before any mapping is known.
    Pending,
}

/// Index of a register within its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct RegisterId(pub(crate) usize);

/// Bookkeeping for one outstanding operation.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub(crate) id: u64,
    pub(crate) direction: Direction,
    pub(crate) range: Range<usize>,
    /// Sequence word of the first frame carrying this operation.
    pub(crate) sequence: Option<u32>,
    pub(crate) started: Instant,
    /// Next word offset to put on the wire.
    pub(crate) next_send: usize,
    acked: Vec<bool>,
    pending: usize,
    status_bits: u8,
}

impl InFlight {
    fn new(id: u64, direction: Direction, range: Range<usize>, now: Instant) -> Self {
        let len = range.len();
        Self {
            id,
            direction,
            next_send: range.start,
            range,
            sequence: None,
            started: now,
            acked: vec![false; len],
            pending: len,
            status_bits: 0,
        }
    }

    /// All words are on the wire.
    pub(crate) fn fully_sent(&self) -> bool {
        self.next_send >= self.range.end
    }
}

/// A named block of device words.
pub struct Register {
    pub(crate) name: String,
    pub(crate) origin: RegisterOrigin,
    pub(crate) info: Option<RegisterInfo>,
    pub(crate) mem: Vec<u32>,
    pub(crate) status: RegisterStatus,
    pub(crate) severity: Severity,
    pub(crate) op: Option<InFlight>,
    waiters: VecDeque<Box<dyn Waiter>>,
    changed: Arc<watch::Sender<u64>>,
}

impl Register {
    pub(crate) fn new(name: impl Into<String>, origin: RegisterOrigin, info: Option<RegisterInfo>) -> Self {
        let words = info.as_ref().map_or(0, RegisterInfo::word_count);
        let (changed, _) = watch::channel(0);
        Self {
            name: name.into(),
            origin,
            info,
            mem: vec![0; words],
            status: RegisterStatus::Undefined,
            severity: Severity::Invalid,
            op: None,
            waiters: VecDeque::new(),
            changed: Arc::new(changed),
        }
    }

    /// Register name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if an address mapping is known.
    pub fn is_mapped(&self) -> bool {
        self.info.is_some()
    }

    /// True while an operation is in flight.
    pub fn in_progress(&self) -> bool {
        self.op.is_some()
    }

    /// Number of attached waiters.
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Install an address mapping, resizing the mirror if needed.
    pub(crate) fn map(&mut self, info: RegisterInfo, origin: RegisterOrigin, notes: &mut Notifications) {
        let words = info.word_count();
        if self.mem.len() != words {
            self.mem = vec![0; words];
        }
        self.info = Some(info);
        self.origin = origin;
        notes.register_changed(&self.changed);
    }

    /// Start an operation on `range` (the whole register when `None`).
    ///
    /// # Errors
    /// Rejects unmapped registers, wrong access, bad ranges and a second
    /// operation while one is in flight. Nothing changes on rejection.
    pub(crate) fn begin(
        &mut self,
        id: u64,
        direction: Direction,
        range: Option<Range<usize>>,
        now: Instant,
    ) -> Result<(), QueueError> {
        let info = self.info.as_ref().ok_or(QueueError::NotMapped)?;
        if self.op.is_some() {
            return Err(QueueError::Busy);
        }
        match direction {
            Direction::Read if !info.access.readable() => return Err(QueueError::NotReadable),
            Direction::Write if !info.access.writable() => return Err(QueueError::NotWritable),
            _ => {}
        }
        let range = range.unwrap_or(0..self.mem.len());
        if range.is_empty() || range.end > self.mem.len() {
            return Err(QueueError::OutOfRange);
        }
        self.op = Some(InFlight::new(id, direction, range, now));
        Ok(())
    }

    /// Record the reply to one word of operation `op_id`.
    ///
    /// Returns true once every word of the operation has been answered.
    pub(crate) fn acknowledge(&mut self, op_id: u64, offset: usize, data: Option<u32>, status: u8) -> bool {
        let Some(op) = self.op.as_mut().filter(|op| op.id == op_id) else {
            return false;
        };
        let Some(acked) = offset
            .checked_sub(op.range.start)
            .and_then(|i| op.acked.get_mut(i))
        else {
            return false;
        };
        if !*acked {
            *acked = true;
            op.pending -= 1;
        }
        op.status_bits |= status;
        if let (Some(value), Some(word)) = (data, self.mem.get_mut(offset)) {
            *word = value;
        }
        op.pending == 0
    }

    /// Status for a fully answered operation.
    pub(crate) fn answered_status(&self) -> RegisterStatus {
        match self.op.as_ref().map_or(0, |op| op.status_bits) {
            0 => RegisterStatus::Ok,
            bits => RegisterStatus::DeviceError(bits),
        }
    }

    /// End the current operation (if any) and notify every waiter.
    pub(crate) fn finish(&mut self, status: RegisterStatus, notes: &mut Notifications) {
        self.op = None;
        self.status = status;
        self.severity = status.severity();
        let completion = Completion {
            register: self.name.clone(),
            status,
            severity: self.severity,
        };
        for waiter in self.waiters.drain(..) {
            notes.complete(waiter, completion.clone());
        }
        notes.register_changed(&self.changed);
    }

    /// Abort for a device reset: zero the mirror and drop announced mappings.
    pub(crate) fn reset(&mut self, notes: &mut Notifications) {
        self.mem.iter_mut().for_each(|w| *w = 0);
        if self.origin == RegisterOrigin::Announced {
            self.info = None;
            self.mem.clear();
        }
        self.finish(RegisterStatus::Reset, notes);
    }

    pub(crate) fn attach(&mut self, waiter: Box<dyn Waiter>) {
        self.waiters.push_back(waiter);
    }

    /// Remove a waiter and hand it back, so the caller can drop it
    /// outside the device lock.
    pub(crate) fn detach(&mut self, id: WaiterId) -> Option<Box<dyn Waiter>> {
        let index = self.waiters.iter().position(|w| w.id() == id)?;
        self.waiters.remove(index)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    pub(crate) fn snapshot(&self) -> RegisterSnapshot {
        RegisterSnapshot {
            name: self.name.clone(),
            origin: self.origin,
            info: self.info.clone(),
            words: self.mem.clone(),
            status: self.status,
            severity: self.severity,
            in_progress: self.op.is_some(),
            direction: self.op.as_ref().map(|op| op.direction),
            sequence: self.op.as_ref().and_then(|op| op.sequence),
            waiters: self.waiter_count(),
        }
    }
}

/// Copy of a register's observable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterSnapshot {
    /// Register name.
    pub name: String,
    /// Mapping origin.
    pub origin: RegisterOrigin,
    /// Address mapping, if known.
    pub info: Option<RegisterInfo>,
    /// Mirror contents.
    pub words: Vec<u32>,
    /// Last outcome.
    pub status: RegisterStatus,
    /// Last severity.
    pub severity: Severity,
    /// An operation is in flight.
    pub in_progress: bool,
    /// Direction of the operation in flight.
    pub direction: Option<Direction>,
    /// Sequence word of the operation in flight, once sent.
    pub sequence: Option<u32>,
    /// Attached waiters.
    pub waiters: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waiter::FnWaiter;
    use leep_common::regmap::Access;
    use std::sync::Mutex;

    fn register(access: Access) -> Register {
        Register::new(
            "r",
            RegisterOrigin::Configured,
            Some(RegisterInfo::new("r", 0x10, 2).with_access(access)),
        )
    }

    #[test]
    fn test_begin_rejections() {
        let now = Instant::now();
        let mut unmapped = Register::new("p", RegisterOrigin::Pending, None);
        assert_eq!(unmapped.begin(1, Direction::Read, None, now), Err(QueueError::NotMapped));

        let mut ro = register(Access::Read);
        assert_eq!(ro.begin(1, Direction::Write, None, now), Err(QueueError::NotWritable));
        assert_eq!(ro.begin(1, Direction::Read, Some(2..5), now), Err(QueueError::OutOfRange));
        assert_eq!(ro.begin(1, Direction::Read, Some(2..2), now), Err(QueueError::OutOfRange));
        assert_eq!(ro.begin(1, Direction::Read, None, now), Ok(()));
        assert_eq!(ro.begin(2, Direction::Read, None, now), Err(QueueError::Busy));
        assert_eq!(ro.op.as_ref().map(|op| op.id), Some(1));

        let mut wo = register(Access::Write);
        assert_eq!(wo.begin(1, Direction::Read, None, now), Err(QueueError::NotReadable));
    }

    #[test]
    fn test_acknowledge_completes_when_all_words_answered() {
        let mut reg = register(Access::ReadWrite);
        reg.begin(7, Direction::Read, Some(1..3), Instant::now()).unwrap();
        assert!(!reg.acknowledge(7, 1, Some(0xaa), 0));
        // duplicate and foreign answers do not count
        assert!(!reg.acknowledge(7, 1, Some(0xaa), 0));
        assert!(!reg.acknowledge(8, 2, Some(0xbb), 0));
        assert!(reg.acknowledge(7, 2, Some(0xbb), 0));
        assert_eq!(reg.mem, vec![0, 0xaa, 0xbb, 0]);
        assert_eq!(reg.answered_status(), RegisterStatus::Ok);
    }

    #[test]
    fn test_status_nibble_reported() {
        let mut reg = register(Access::ReadWrite);
        reg.begin(1, Direction::Write, Some(0..1), Instant::now()).unwrap();
        assert!(reg.acknowledge(1, 0, None, 0x4));
        assert_eq!(reg.answered_status(), RegisterStatus::DeviceError(4));
        assert_eq!(RegisterStatus::DeviceError(4).severity(), Severity::Major);
    }

    #[test]
    fn test_finish_notifies_waiters_fifo() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut reg = register(Access::ReadWrite);
        for i in 0..3 {
            let seen = seen.clone();
            reg.attach(Box::new(FnWaiter::new(move |c: Completion| {
                seen.lock().unwrap().push((i, c.status))
            })));
        }
        reg.begin(1, Direction::Read, None, Instant::now()).unwrap();
        let mut notes = Notifications::default();
        reg.finish(RegisterStatus::Timeout, &mut notes);
        assert!(!reg.in_progress());
        assert_eq!(reg.severity, Severity::Invalid);
        let (device, _) = watch::channel(0);
        notes.dispatch(&device);
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (0, RegisterStatus::Timeout),
                (1, RegisterStatus::Timeout),
                (2, RegisterStatus::Timeout)
            ]
        );
    }

    #[test]
    fn test_detach() {
        let mut reg = register(Access::ReadWrite);
        let waiter = FnWaiter::new(|_| {});
        let id = waiter.id();
        reg.attach(Box::new(waiter));
        assert!(reg.detach(id).is_some());
        assert!(reg.detach(id).is_none());
        assert_eq!(reg.snapshot().waiters, 0);
    }

    #[test]
    fn test_reset_unmaps_announced_only() {
        let mut notes = Notifications::default();
        let mut announced = Register::new("a", RegisterOrigin::Pending, None);
        announced.map(RegisterInfo::new("a", 0x20, 1), RegisterOrigin::Announced, &mut notes);
        announced.mem[1] = 5;
        announced.reset(&mut notes);
        assert!(!announced.is_mapped());
        assert!(announced.mem.is_empty());
        assert_eq!(announced.status, RegisterStatus::Reset);

        let mut configured = register(Access::ReadWrite);
        configured.mem[0] = 9;
        configured.reset(&mut notes);
        assert!(configured.is_mapped());
        assert_eq!(configured.mem, vec![0; 4]);
    }
}
