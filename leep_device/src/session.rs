//! Device handle.
//!
//! A [`Device`] wraps the session core in the per-device lock and owns
//! the background driver thread. Every public method takes the lock only
//! for the state change itself; waiters and value-changed channels are
//! notified after it is released.
//!
//! Nothing here waits for the network. Requests return as soon as they
//! are queued and complete through attached waiters.

use crate::core::SessionCore;
use crate::driver;
use crate::error::{DeviceError, DeviceResult, QueueError};
use crate::register::{Direction, RegisterSnapshot};
use crate::status::{ConnectionState, Counters, DebugFlags, DeviceIdentity, RttStats};
use crate::waiter::{Notifications, Waiter, WaiterId};
use leep_common::config::{DeviceConfig, PeerAddress};
use leep_common::wire::{ElementWidth, Elements};
use parking_lot::Mutex;
use std::net::{SocketAddr, UdpSocket};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, watch};
use tracing::{info, warn};

/// One LEEP device session.
pub struct Device {
    name: String,
    local_addr: SocketAddr,
    core: Mutex<SessionCore>,
    wakeup: Notify,
    changed: watch::Sender<u64>,
    stop: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Device {
    /// Bind the local socket and start the driver thread.
    ///
    /// # Errors
    /// Configuration errors and socket or thread setup failures are
    /// returned synchronously.
    pub fn create(config: DeviceConfig) -> DeviceResult<Arc<Self>> {
        let core = SessionCore::new(&config, rand::random(), Instant::now())?;
        let socket = UdpSocket::bind(config.bind_addr()?)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (changed, _) = watch::channel(0);
        let device = Arc::new(Self {
            name: config.name.clone(),
            local_addr,
            core: Mutex::new(core),
            wakeup: Notify::new(),
            changed,
            stop: AtomicBool::new(false),
            driver: Mutex::new(None),
        });

        let worker = device.clone();
        let handle = std::thread::Builder::new()
            .name(format!("leep-{}", config.name))
            .spawn(move || runtime.block_on(driver::run(worker, socket)))?;
        *device.driver.lock() = Some(handle);
        info!(device = %device.name, "Created on {}", local_addr);
        Ok(device)
    }

    /// Lock the core, apply `f`, then notify outside the lock.
    fn with_core<R>(&self, f: impl FnOnce(&mut SessionCore, &mut Notifications) -> R) -> R {
        let mut notes = Notifications::default();
        let result = {
            let mut core = self.core.lock();
            f(&mut *core, &mut notes)
        };
        notes.dispatch(&self.changed);
        result
    }

    fn read_core<R>(&self, f: impl FnOnce(&SessionCore) -> R) -> R {
        let core = self.core.lock();
        f(&*core)
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    // ─── Register requests ──────────────────────────────────────────

    /// Queue a whole-register read or write; false if rejected.
    pub fn queue(&self, register: &str, is_write: bool) -> bool {
        self.try_queue(register, Direction::from_write(is_write)).is_ok()
    }

    /// Queue a whole-register operation.
    ///
    /// # Errors
    /// The [`QueueError`] kind; no state changes on rejection.
    pub fn try_queue(&self, register: &str, direction: Direction) -> Result<(), QueueError> {
        self.queue_range(register, direction, None)
    }

    /// Queue an operation on a word range of a register.
    pub fn try_queue_range(
        &self,
        register: &str,
        direction: Direction,
        range: Range<usize>,
    ) -> Result<(), QueueError> {
        self.queue_range(register, direction, Some(range))
    }

    fn queue_range(
        &self,
        register: &str,
        direction: Direction,
        range: Option<Range<usize>>,
    ) -> Result<(), QueueError> {
        self.with_core(|core, _| core.try_queue(register, direction, range, Instant::now()))?;
        self.poke_runner();
        Ok(())
    }

    /// Store `words` in the mirror at `offset` and queue their write.
    pub fn write(&self, register: &str, offset: usize, words: &[u32]) -> Result<(), QueueError> {
        self.with_core(|core, _| core.write(register, offset, words, Instant::now()))?;
        self.poke_runner();
        Ok(())
    }

    /// Attach a waiter to the next completion of `register`.
    ///
    /// Unknown names create an unmapped register that picks up its
    /// mapping from the next handshake.
    pub fn attach(&self, register: &str, waiter: Box<dyn Waiter>) {
        self.with_core(|core, _| core.attach(register, waiter));
    }

    /// Remove a waiter that has not been notified yet.
    pub fn detach(&self, register: &str, waiter: WaiterId) -> bool {
        let removed = self.with_core(|core, _| core.detach(register, waiter));
        removed.is_some()
    }

    /// Value-changed channel of one register.
    pub fn subscribe_register(&self, register: &str) -> watch::Receiver<u64> {
        self.with_core(|core, _| core.subscribe_register(register))
    }

    /// Device-level value-changed channel (state, counters, message).
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    // ─── Session control ────────────────────────────────────────────

    /// Abort all operations and disconnect. Idempotent.
    pub fn request_reset(&self) {
        self.with_core(|core, notes| core.request_reset(Instant::now(), notes));
        self.poke_runner();
    }

    /// Force the transport-error path with `message`.
    pub fn report_error(&self, message: &str) {
        self.with_core(|core, notes| core.report_error(message, Instant::now(), notes));
        self.poke_runner();
    }

    /// Set (or with an empty string, clear) the peer.
    ///
    /// # Errors
    /// A malformed address is a configuration error; the session is left
    /// untouched.
    pub fn set_peer(&self, peer: &str) -> DeviceResult<()> {
        let peer = match peer.trim() {
            "" => None,
            p => Some(p.parse::<PeerAddress>()?),
        };
        self.with_core(|core, notes| core.set_peer(peer, Instant::now(), notes));
        self.poke_runner();
        Ok(())
    }

    /// Wake the driver without blocking.
    pub fn poke_runner(&self) {
        self.wakeup.notify_one();
    }

    /// Replace the trace categories.
    pub fn set_debug(&self, debug: DebugFlags) {
        self.with_core(|core, _| core.set_debug(debug));
    }

    /// Current trace categories.
    pub fn debug(&self) -> DebugFlags {
        self.read_core(SessionCore::debug)
    }

    // ─── Observers ──────────────────────────────────────────────────

    /// Connection state.
    pub fn state(&self) -> ConnectionState {
        self.read_core(SessionCore::state)
    }

    /// Counter snapshot.
    pub fn counters(&self) -> Counters {
        self.read_core(SessionCore::counters)
    }

    /// Last session error message.
    pub fn last_message(&self) -> String {
        self.read_core(|core| core.last_message().to_string())
    }

    /// Configured peer.
    pub fn peer(&self) -> Option<PeerAddress> {
        self.read_core(|core| core.peer().cloned())
    }

    /// zlib-compressed JSON device info; empty unless connected.
    pub fn info_blob(&self) -> Vec<u8> {
        self.read_core(|core| core.info_blob().to_vec())
    }

    /// ROM identity of the connected device.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.read_core(|core| core.identity().cloned())
    }

    /// Round-trip time summary.
    pub fn rtt(&self) -> RttStats {
        self.read_core(SessionCore::rtt)
    }

    /// Snapshot of one register.
    pub fn register(&self, register: &str) -> Option<RegisterSnapshot> {
        self.read_core(|core| core.register(register))
    }

    /// Register names in sorted order.
    pub fn register_names(&self) -> Vec<String> {
        self.read_core(SessionCore::register_names)
    }

    /// Register mirror as 16- or 32-bit elements.
    ///
    /// # Errors
    /// Unknown register, or an element width other than 16 or 32.
    pub fn read_elements(&self, register: &str, bits: u32) -> DeviceResult<Elements> {
        let width = ElementWidth::from_bits(bits)?;
        let snap = self
            .register(register)
            .ok_or_else(|| DeviceError::UnknownRegister(register.to_string()))?;
        Ok(Elements::from_words(&snap.words, width))
    }

    /// Text report, `level` 0 to 3.
    pub fn show(&self, level: u8) -> String {
        self.read_core(|core| core.show(level, Instant::now()))
    }

    /// Block until `CONNECTED` or `timeout`.
    ///
    /// Intended for CLIs and tests; the engine itself never blocks.
    pub fn wait_connected(&self, timeout: Duration) -> DeviceResult<()> {
        let deadline = Instant::now() + timeout;
        while self.state() != ConnectionState::Connected {
            if Instant::now() >= deadline {
                return Err(DeviceError::WaitTimeout(format!(
                    "{} to connect ({})",
                    self.name,
                    self.last_message()
                )));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    /// Stop and join the driver thread.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.poke_runner();
        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!(device = %self.name, "Driver thread panicked");
            }
        }
    }

    // ─── Driver side ────────────────────────────────────────────────

    pub(crate) fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.wakeup.notified()
    }

    pub(crate) fn drive(&self) -> crate::core::PollResult {
        self.with_core(|core, notes| core.poll(Instant::now(), notes))
    }

    pub(crate) fn resolve_timeout(&self) -> Duration {
        self.read_core(SessionCore::timeout)
    }

    pub(crate) fn resolved(&self, generation: u64, result: Result<SocketAddr, String>) {
        self.with_core(|core, notes| core.resolved(generation, result, Instant::now(), notes));
    }

    pub(crate) fn sent(&self, frames: usize) {
        if frames > 0 {
            self.with_core(|core, notes| core.sent(frames, notes));
        }
    }

    pub(crate) fn datagram(&self, bytes: &[u8], from: SocketAddr) {
        self.with_core(|core, notes| core.handle_datagram(bytes, from, Instant::now(), notes));
    }

    pub(crate) fn transport_error(&self, message: String) {
        self.with_core(|core, notes| core.session_error(message, Instant::now(), notes));
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .finish()
    }
}
