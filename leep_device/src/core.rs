//! Sans-IO session state machine.
//!
//! [`SessionCore`] holds everything the device lock protects: connection
//! state, registers, the send queue, frame slots and counters. It never
//! touches a socket. The driver feeds it time, datagrams and resolution
//! results and transmits the frames [`SessionCore::poll`] hands back.
//!
//! # Frame Slots
//!
//! ```text
//! send_queue ──► submit() ──► slot[k] (seq = k<<24 | counter) ──► wire
//!                                 │
//!                 reply / timeout ┘──► registers complete ──► waiters
//! ```
//!
//! Up to `max_in_flight` frames are outstanding, one per slot. The slot
//! index travels in the top byte of the sequence word so a reply finds
//! its request without a search.

use crate::error::{DeviceError, QueueError};
use crate::register::{Direction, Register, RegisterId, RegisterOrigin, RegisterSnapshot, RegisterStatus};
use crate::status::{ConnectionState, Counters, DebugFlags, DeviceIdentity, RoundTrip, RttStats};
use crate::waiter::{Notifications, Waiter, WaiterId};
use leep_common::config::{ConfigError, DeviceConfig, PeerAddress, SessionConfig};
use leep_common::consts::{
    HELLO_ADDRESS, MAX_COMMANDS, ROM_2K_ADDRESS, ROM_16K_ADDRESS, SEQUENCE_COUNTER_MASK,
    SEQUENCE_SLOT_SHIFT,
};
use leep_common::regmap::{Access, RegisterInfo, RegisterMap};
use leep_common::rom::{self, Rom, RomError};
use leep_common::wire::{Command, Frame};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::ops::Range;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Greeting register read by the probe.
pub const HELLO_REGISTER: &str = "HELLO";
/// First word of the small ROM, read by the probe.
pub const ROM_PROBE_REGISTER: &str = "ROM probe";
/// 2K-word ROM image.
pub const ROM_2K_REGISTER: &str = "ROM 2K";
/// 16K-word ROM image.
pub const ROM_16K_REGISTER: &str = "ROM 16K";

const HELLO_ID: RegisterId = RegisterId(0);
const ROM_PROBE_ID: RegisterId = RegisterId(1);
const ROM_2K_ID: RegisterId = RegisterId(2);
const ROM_16K_ID: RegisterId = RegisterId(3);

fn bootstrap_registers() -> [RegisterInfo; 4] {
    [
        RegisterInfo::new(HELLO_REGISTER, HELLO_ADDRESS, 2).with_access(Access::Read),
        RegisterInfo::new(ROM_PROBE_REGISTER, ROM_2K_ADDRESS, 0)
            .with_access(Access::Read)
            .with_data_width(16),
        RegisterInfo::new(ROM_2K_REGISTER, ROM_2K_ADDRESS, 11)
            .with_access(Access::Read)
            .with_data_width(16),
        RegisterInfo::new(ROM_16K_REGISTER, ROM_16K_ADDRESS, 14)
            .with_access(Access::Read)
            .with_data_width(16),
    ]
}

// ─── Driver interface ───────────────────────────────────────────────

/// A frame ready for transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Outbound {
    pub(crate) dest: SocketAddr,
    pub(crate) bytes: Vec<u8>,
}

/// Peer name resolution requested from the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolveRequest {
    pub(crate) generation: u64,
    pub(crate) peer: PeerAddress,
}

/// Work for the driver after a poll.
#[derive(Debug, Default)]
pub(crate) struct PollResult {
    pub(crate) outbound: Vec<Outbound>,
    pub(crate) resolve: Option<ResolveRequest>,
    /// Earliest time the core needs to be polled again.
    pub(crate) deadline: Option<Instant>,
}

// ─── Frame slots ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct SlotEntry {
    register: RegisterId,
    op_id: u64,
    offset: usize,
}

#[derive(Debug)]
struct Outstanding {
    request: Frame,
    /// One per request command; `None` for padding.
    entries: Vec<Option<SlotEntry>>,
    sent_at: Instant,
    due: Instant,
    /// A reply was rejected for this frame.
    malformed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    Idle,
    Probing { attempts: u32 },
    ReadingRom { register: RegisterId, attempts: u32 },
}

/// State guarded by the device lock.
pub(crate) struct SessionCore {
    name: String,
    config: SessionConfig,
    debug: DebugFlags,
    state: ConnectionState,
    peer: Option<PeerAddress>,
    peer_addr: Option<SocketAddr>,
    peer_generation: u64,
    reconnect_at: Option<Instant>,
    handshake: Handshake,
    counters: Counters,
    last_message: String,
    info_blob: Vec<u8>,
    identity: Option<DeviceIdentity>,
    registers: Vec<Register>,
    by_name: BTreeMap<String, RegisterId>,
    send_queue: VecDeque<RegisterId>,
    slots: Vec<Option<Outstanding>>,
    next_op_id: u64,
    rtt: RoundTrip,
}

impl SessionCore {
    /// Build the core for a validated configuration.
    pub(crate) fn new(config: &DeviceConfig, send_sequence: u32, now: Instant) -> Result<Self, DeviceError> {
        config.validate()?;
        let peer = config.peer_address()?;
        let mut core = Self {
            name: config.name.clone(),
            config: config.session.clone(),
            debug: config
                .debug
                .map(DebugFlags::from_bits_truncate)
                .unwrap_or_default(),
            state: ConnectionState::Disconnected,
            reconnect_at: peer.as_ref().map(|_| now),
            peer,
            peer_addr: None,
            peer_generation: 0,
            handshake: Handshake::Idle,
            counters: Counters {
                send_sequence: send_sequence & SEQUENCE_COUNTER_MASK,
                ..Counters::default()
            },
            last_message: String::new(),
            info_blob: Vec::new(),
            identity: None,
            registers: Vec::new(),
            by_name: BTreeMap::new(),
            send_queue: VecDeque::new(),
            slots: (0..config.session.max_in_flight).map(|_| None).collect(),
            next_op_id: 1,
            rtt: RoundTrip::default(),
        };

        for info in bootstrap_registers() {
            core.add_register(info.name.clone(), RegisterOrigin::Bootstrap, Some(info));
        }
        for info in &config.registers {
            if core.by_name.contains_key(&info.name) {
                return Err(DeviceError::Config(ConfigError::ValidationError(format!(
                    "Register name '{}' is reserved",
                    info.name
                ))));
            }
            core.add_register(info.name.clone(), RegisterOrigin::Configured, Some(info.clone()));
        }
        Ok(core)
    }

    fn add_register(&mut self, name: String, origin: RegisterOrigin, info: Option<RegisterInfo>) -> RegisterId {
        let id = RegisterId(self.registers.len());
        self.registers.push(Register::new(name.clone(), origin, info));
        self.by_name.insert(name, id);
        id
    }

    /// Register id, creating an unmapped register on first reference.
    fn ensure_register(&mut self, name: &str) -> RegisterId {
        match self.by_name.get(name) {
            Some(&id) => id,
            None => self.add_register(name.to_string(), RegisterOrigin::Pending, None),
        }
    }

    fn reg(&self, id: RegisterId) -> &Register {
        &self.registers[id.0]
    }

    fn reg_mut(&mut self, id: RegisterId) -> &mut Register {
        &mut self.registers[id.0]
    }

    // ─── Observers ──────────────────────────────────────────────────

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn counters(&self) -> Counters {
        self.counters
    }

    pub(crate) fn last_message(&self) -> &str {
        &self.last_message
    }

    pub(crate) fn info_blob(&self) -> &[u8] {
        &self.info_blob
    }

    pub(crate) fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    pub(crate) fn peer(&self) -> Option<&PeerAddress> {
        self.peer.as_ref()
    }

    pub(crate) fn rtt(&self) -> RttStats {
        self.rtt.stats()
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    pub(crate) fn debug(&self) -> DebugFlags {
        self.debug
    }

    pub(crate) fn set_debug(&mut self, debug: DebugFlags) {
        self.debug = debug;
    }

    pub(crate) fn register(&self, name: &str) -> Option<RegisterSnapshot> {
        self.by_name.get(name).map(|&id| self.reg(id).snapshot())
    }

    pub(crate) fn register_names(&self) -> Vec<String> {
        self.by_name.keys().cloned().collect()
    }

    fn traced(&self, flag: DebugFlags) -> bool {
        self.debug.contains(flag)
    }

    // ─── Caller intents ─────────────────────────────────────────────

    /// Queue a read or write of `range` (whole register when `None`).
    pub(crate) fn try_queue(
        &mut self,
        name: &str,
        direction: Direction,
        range: Option<Range<usize>>,
        now: Instant,
    ) -> Result<(), QueueError> {
        let result = self.queue_user(name, direction, range, now).map(|_| ());
        if self.traced(DebugFlags::QUEUE) {
            match &result {
                Ok(()) => debug!(device = %self.name, "Queued {:?} of {}", direction, name),
                Err(e) => debug!(device = %self.name, "Rejected {:?} of {}: {}", direction, name, e),
            }
        }
        result
    }

    fn queue_user(
        &mut self,
        name: &str,
        direction: Direction,
        range: Option<Range<usize>>,
        now: Instant,
    ) -> Result<RegisterId, QueueError> {
        if self.state != ConnectionState::Connected {
            return Err(QueueError::NotConnected);
        }
        let id = *self.by_name.get(name).ok_or(QueueError::UnknownRegister)?;
        self.queue_internal(id, direction, range, now)?;
        Ok(id)
    }

    fn queue_internal(
        &mut self,
        id: RegisterId,
        direction: Direction,
        range: Option<Range<usize>>,
        now: Instant,
    ) -> Result<(), QueueError> {
        let op_id = self.next_op_id;
        self.reg_mut(id).begin(op_id, direction, range, now)?;
        self.next_op_id += 1;
        self.send_queue.push_back(id);
        Ok(())
    }

    /// Update the mirror at `offset` and queue a write of those words.
    pub(crate) fn write(&mut self, name: &str, offset: usize, words: &[u32], now: Instant) -> Result<(), QueueError> {
        let end = offset.checked_add(words.len()).ok_or(QueueError::OutOfRange)?;
        let id = self
            .queue_user(name, Direction::Write, Some(offset..end), now)
            .inspect_err(|e| {
                if self.traced(DebugFlags::QUEUE) {
                    debug!(device = %self.name, "Rejected write of {}: {}", name, e);
                }
            })?;
        self.reg_mut(id).mem[offset..end].copy_from_slice(words);
        Ok(())
    }

    pub(crate) fn attach(&mut self, name: &str, waiter: Box<dyn Waiter>) {
        let id = self.ensure_register(name);
        self.reg_mut(id).attach(waiter);
    }

    pub(crate) fn detach(&mut self, name: &str, waiter: WaiterId) -> Option<Box<dyn Waiter>> {
        let id = *self.by_name.get(name)?;
        self.reg_mut(id).detach(waiter)
    }

    pub(crate) fn subscribe_register(&mut self, name: &str) -> watch::Receiver<u64> {
        let id = self.ensure_register(name);
        self.reg(id).subscribe()
    }

    /// Abort everything and drop to `DISCONNECTED`. Idempotent.
    pub(crate) fn request_reset(&mut self, now: Instant, notes: &mut Notifications) {
        info!(device = %self.name, "Reset requested");
        self.reset(now, true, notes);
    }

    /// Session error raised by the binding layer.
    pub(crate) fn report_error(&mut self, message: &str, now: Instant, notes: &mut Notifications) {
        self.session_error(message.to_string(), now, notes);
    }

    /// Replace the peer; reconnects immediately when set.
    pub(crate) fn set_peer(&mut self, peer: Option<PeerAddress>, now: Instant, notes: &mut Notifications) {
        match &peer {
            Some(p) => info!(device = %self.name, "Peer set to {}", p),
            None => info!(device = %self.name, "Peer cleared"),
        }
        self.peer = peer;
        self.peer_generation += 1;
        self.reset(now, false, notes);
    }

    // ─── Session errors and reset ───────────────────────────────────

    pub(crate) fn session_error(&mut self, message: String, now: Instant, notes: &mut Notifications) {
        warn!(device = %self.name, "{}", message);
        self.counters.errors += 1;
        self.last_message = message;
        self.reset(now, true, notes);
    }

    fn reset(&mut self, now: Instant, backoff: bool, notes: &mut Notifications) {
        if self.traced(DebugFlags::CONNECTION) {
            debug!(device = %self.name, "Reset from {}", self.state);
        }
        self.state = ConnectionState::Disconnected;
        self.handshake = Handshake::Idle;
        self.peer_addr = None;
        self.send_queue.clear();
        self.slots.iter_mut().for_each(|s| *s = None);
        for reg in &mut self.registers {
            reg.reset(notes);
        }
        self.info_blob.clear();
        self.identity = None;
        self.reconnect_at = self.peer.as_ref().map(|_| {
            if backoff {
                now + self.config.reconnect_backoff()
            } else {
                now
            }
        });
        notes.device_changed();
    }

    // ─── Driver interface ───────────────────────────────────────────

    /// Expire timed-out frames, advance the handshake and pack frames.
    pub(crate) fn poll(&mut self, now: Instant, notes: &mut Notifications) -> PollResult {
        let mut result = PollResult::default();
        self.expire(now, notes);

        match self.state {
            ConnectionState::Disconnected => {
                if let (Some(peer), Some(at)) = (&self.peer, self.reconnect_at)
                    && at <= now
                {
                    if self.traced(DebugFlags::CONNECTION) {
                        debug!(device = %self.name, "Resolving {}", peer);
                    }
                    result.resolve = Some(ResolveRequest {
                        generation: self.peer_generation,
                        peer: peer.clone(),
                    });
                    self.reconnect_at = None;
                    self.state = ConnectionState::Resolving;
                    notes.device_changed();
                }
            }
            ConnectionState::Binding => self.advance_handshake(now, notes),
            ConnectionState::Resolving | ConnectionState::Connected => {}
        }

        if matches!(self.state, ConnectionState::Binding | ConnectionState::Connected) {
            result.outbound = self.submit(now);
        }
        result.deadline = self.next_deadline();
        result
    }

    /// Outcome of a resolution requested by [`SessionCore::poll`].
    pub(crate) fn resolved(
        &mut self,
        generation: u64,
        result: Result<SocketAddr, String>,
        now: Instant,
        notes: &mut Notifications,
    ) {
        if generation != self.peer_generation || self.state != ConnectionState::Resolving {
            return;
        }
        match result {
            Ok(addr) => {
                info!(device = %self.name, "Binding to {}", addr);
                self.peer_addr = Some(addr);
                self.state = ConnectionState::Binding;
                self.start_probe(0, now);
                notes.device_changed();
            }
            Err(e) => {
                let peer = self.peer.as_ref().map(ToString::to_string).unwrap_or_default();
                self.session_error(format!("Unable to resolve {peer}: {e}"), now, notes);
            }
        }
    }

    /// Count frames the driver put on the wire.
    pub(crate) fn sent(&mut self, frames: usize, notes: &mut Notifications) {
        self.counters.sent += frames as u64;
        notes.device_changed();
    }

    fn next_deadline(&self) -> Option<Instant> {
        let due = self.slots.iter().flatten().map(|s| s.due).min();
        let reconnect = match self.state {
            ConnectionState::Disconnected => self.reconnect_at,
            _ => None,
        };
        match (due, reconnect) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ─── Handshake ──────────────────────────────────────────────────

    fn start_probe(&mut self, attempts: u32, now: Instant) {
        self.handshake = Handshake::Probing { attempts };
        for id in [HELLO_ID, ROM_PROBE_ID] {
            if let Err(e) = self.queue_internal(id, Direction::Read, None, now) {
                error!(device = %self.name, "Probe of {} not queued: {}", self.reg(id).name, e);
            }
        }
    }

    fn advance_handshake(&mut self, now: Instant, notes: &mut Notifications) {
        match self.handshake {
            Handshake::Idle => {}
            Handshake::Probing { attempts } => {
                let (hello, probe) = (self.reg(HELLO_ID), self.reg(ROM_PROBE_ID));
                if hello.in_progress() || probe.in_progress() {
                    return;
                }
                if hello.status != RegisterStatus::Ok || probe.status != RegisterStatus::Ok {
                    return self.retry_handshake(attempts + 1, now, notes);
                }
                let rom = if probe.mem[0] & 0xffff == 0 {
                    ROM_16K_ID
                } else {
                    ROM_2K_ID
                };
                if self.traced(DebugFlags::ROM) {
                    debug!(
                        device = %self.name,
                        "Probe word {:#06x}, reading {}", self.reg(ROM_PROBE_ID).mem[0], self.reg(rom).name
                    );
                }
                self.handshake = Handshake::ReadingRom {
                    register: rom,
                    attempts,
                };
                if let Err(e) = self.queue_internal(rom, Direction::Read, None, now) {
                    error!(device = %self.name, "ROM read not queued: {}", e);
                }
            }
            Handshake::ReadingRom { register, attempts } => {
                let reg = self.reg(register);
                if reg.in_progress() {
                    return;
                }
                if reg.status != RegisterStatus::Ok {
                    return self.retry_handshake(attempts + 1, now, notes);
                }
                if let Err(e) = self.inspect_rom(register, notes) {
                    self.session_error(format!("Bad ROM: {e}"), now, notes);
                }
            }
        }
    }

    fn retry_handshake(&mut self, attempts: u32, now: Instant, notes: &mut Notifications) {
        let limit = self.config.probe_retries;
        if limit != 0 && attempts >= limit {
            return self.session_error(
                format!("No handshake reply after {attempts} attempts"),
                now,
                notes,
            );
        }
        if self.traced(DebugFlags::CONNECTION) {
            debug!(device = %self.name, "Handshake attempt {} failed, retrying", attempts);
        }
        self.start_probe(attempts, now);
    }

    fn inspect_rom(&mut self, register: RegisterId, notes: &mut Notifications) -> Result<(), DeviceError> {
        let image = Rom::parse(&self.reg(register).mem)?;
        let json = image.json().ok_or(RomError::NoJson)?;
        let map = RegisterMap::parse(json)?;
        if self.traced(DebugFlags::ROM) {
            for d in image.descriptors() {
                trace!(device = %self.name, "ROM descriptor {:?}", d);
            }
        }

        for info in map.iter() {
            self.announce(info.clone(), notes);
        }

        let identity = DeviceIdentity {
            description: image.description().unwrap_or_default().to_string(),
            json_hash: image.json_hash().unwrap_or_default().to_string(),
            code_hash: image.code_hash().unwrap_or_default().to_string(),
        };
        let blob = serde_json::json!({
            "peer": self.peer.as_ref().map(ToString::to_string),
            "description": identity.description,
            "jsonhash": identity.json_hash,
            "codehash": identity.code_hash,
            "registers": map.to_json(),
        });
        self.info_blob = rom::compress(&serde_json::to_vec(&blob)?)?;
        info!(
            device = %self.name,
            "Connected to {}: {} ({} registers)",
            self.peer_addr.map(|a| a.to_string()).unwrap_or_default(),
            identity.description,
            map.len()
        );
        self.identity = Some(identity);
        self.handshake = Handshake::Idle;
        self.state = ConnectionState::Connected;
        notes.device_changed();
        Ok(())
    }

    fn announce(&mut self, info: RegisterInfo, notes: &mut Notifications) {
        let id = self.ensure_register(&info.name);
        let traced = self.traced(DebugFlags::ROM);
        let origin = self.reg(id).origin;
        match origin {
            RegisterOrigin::Bootstrap | RegisterOrigin::Configured => {
                if traced {
                    debug!(device = %self.name, "Keeping local mapping of {}", info.name);
                }
            }
            RegisterOrigin::Announced | RegisterOrigin::Pending => {
                if traced {
                    trace!(
                        device = %self.name,
                        "Register {} at {:#x}, {} words",
                        info.name,
                        info.base_addr,
                        info.word_count()
                    );
                }
                self.reg_mut(id).map(info, RegisterOrigin::Announced, notes);
            }
        }
    }

    // ─── Transmission ───────────────────────────────────────────────

    /// Pack queued operations into free slots, FIFO.
    fn submit(&mut self, now: Instant) -> Vec<Outbound> {
        let Some(dest) = self.peer_addr else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for slot in 0..self.slots.len() {
            if self.send_queue.is_empty() {
                break;
            }
            if self.slots[slot].is_some() {
                continue;
            }

            let sequence = ((slot as u32) << SEQUENCE_SLOT_SHIFT)
                | (self.counters.send_sequence & SEQUENCE_COUNTER_MASK);
            let (commands, entries) = self.pack(sequence);
            if commands.is_empty() {
                continue;
            }
            self.counters.send_sequence = self.counters.send_sequence.wrapping_add(1) & SEQUENCE_COUNTER_MASK;

            let mut request = Frame::new(sequence, commands);
            request.pad();
            let mut entries = entries;
            entries.resize(request.commands.len(), None);

            match request.encode() {
                Ok(bytes) => {
                    if self.traced(DebugFlags::PACKETS) {
                        trace!(device = %self.name, "Send {:08x}: {} commands", sequence, request.commands.len());
                    }
                    out.push(Outbound { dest, bytes });
                }
                // the slot still arms so the operations time out
                Err(e) => error!(device = %self.name, "Unable to encode frame {:08x}: {}", sequence, e),
            }
            self.slots[slot] = Some(Outstanding {
                request,
                entries,
                sent_at: now,
                due: now + self.config.timeout(),
                malformed: false,
            });
        }
        out
    }

    fn pack(&mut self, sequence: u32) -> (Vec<Command>, Vec<Option<SlotEntry>>) {
        let mut commands = Vec::new();
        let mut entries = Vec::new();
        while commands.len() < MAX_COMMANDS {
            let Some(&id) = self.send_queue.front() else {
                break;
            };
            let Register { info, mem, op, .. } = &mut self.registers[id.0];
            let (Some(info), Some(op)) = (info.as_ref(), op.as_mut()) else {
                self.send_queue.pop_front();
                continue;
            };
            while commands.len() < MAX_COMMANDS && !op.fully_sent() {
                let offset = op.next_send;
                let address = info.base_addr + offset as u32;
                commands.push(match op.direction {
                    Direction::Read => Command::read(address),
                    Direction::Write => Command::write(address, mem[offset]),
                });
                entries.push(Some(SlotEntry {
                    register: id,
                    op_id: op.id,
                    offset,
                }));
                op.sequence.get_or_insert(sequence);
                op.next_send += 1;
            }
            if op.fully_sent() {
                self.send_queue.pop_front();
            }
        }
        (commands, entries)
    }

    // ─── Reception ──────────────────────────────────────────────────

    /// Match a datagram against the outstanding frames.
    pub(crate) fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr, now: Instant, notes: &mut Notifications) {
        self.counters.received += 1;
        self.counters.received_bytes += (bytes.len() + self.config.udp_header_size) as u64;
        notes.device_changed();

        if Some(from) != self.peer_addr {
            self.ignore(format_args!("datagram from unexpected {from}"));
            return;
        }
        let reply = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => return self.ignore(format_args!("undecodable reply: {e}")),
        };
        let slot = (reply.sequence >> SEQUENCE_SLOT_SHIFT) as usize;
        let Some(outstanding) = self.slots.get_mut(slot).and_then(Option::as_mut) else {
            return self.ignore(format_args!("reply {:08x} for idle slot", reply.sequence));
        };
        if outstanding.request.sequence != reply.sequence {
            let expected = outstanding.request.sequence;
            return self.ignore(format_args!(
                "stale reply {:08x}, expecting {:08x}",
                reply.sequence, expected
            ));
        }
        if let Err(e) = outstanding.request.match_reply(&reply) {
            outstanding.malformed = true;
            self.counters.ignored += 1;
            warn!(device = %self.name, "Malformed reply {:08x}: {}", reply.sequence, e);
            return;
        }

        let Some(outstanding) = self.slots[slot].take() else {
            return;
        };
        self.rtt.push(now.saturating_duration_since(outstanding.sent_at));
        if self.traced(DebugFlags::PACKETS) {
            trace!(device = %self.name, "Reply {:08x} matched", reply.sequence);
        }
        for (entry, cmd) in outstanding.entries.iter().zip(&reply.commands) {
            let Some(entry) = entry else {
                continue;
            };
            let reg = self.reg_mut(entry.register);
            let data = cmd.is_read().then_some(cmd.data);
            if reg.acknowledge(entry.op_id, entry.offset, data, cmd.status()) {
                let status = reg.answered_status();
                reg.finish(status, notes);
            }
        }
        if self.traced(DebugFlags::STATE) {
            debug!(device = %self.name, "Frame {:08x} complete", reply.sequence);
        }
    }

    fn ignore(&mut self, reason: std::fmt::Arguments<'_>) {
        self.counters.ignored += 1;
        if self.traced(DebugFlags::PACKETS) {
            debug!(device = %self.name, "Ignoring {}", reason);
        }
    }

    /// Fail the operations of every frame past its deadline.
    fn expire(&mut self, now: Instant, notes: &mut Notifications) {
        for slot in 0..self.slots.len() {
            if !self.slots[slot].as_ref().is_some_and(|s| s.due <= now) {
                continue;
            }
            let Some(outstanding) = self.slots[slot].take() else {
                continue;
            };
            self.counters.timeouts += 1;
            notes.device_changed();
            let status = if outstanding.malformed {
                RegisterStatus::Malformed
            } else {
                RegisterStatus::Timeout
            };
            warn!(
                device = %self.name,
                "Frame {:08x} timed out ({})", outstanding.request.sequence, status
            );
            for entry in outstanding.entries.iter().flatten() {
                let reg = self.reg_mut(entry.register);
                if reg.op.as_ref().is_some_and(|op| op.id == entry.op_id) {
                    reg.finish(status, notes);
                    self.send_queue.retain(|&r| r != entry.register);
                }
            }
        }
    }

    // ─── Diagnostics ────────────────────────────────────────────────

    /// Text report; higher levels add detail.
    pub(crate) fn show(&self, level: u8, now: Instant) -> String {
        let mut out = String::new();
        let peer = self.peer.as_ref().map(ToString::to_string).unwrap_or_else(|| "-".to_string());
        let c = &self.counters;
        let _ = writeln!(out, "Device {} ({}) peer {}", self.name, self.state, peer);
        if let Some(addr) = self.peer_addr {
            let _ = writeln!(out, "  peer address {addr}");
        }
        let _ = writeln!(out, "  last message: {}", self.last_message);
        let _ = writeln!(
            out,
            "  sent {} received {} ({} bytes) ignored {} timeouts {} errors {} seq {:06x}",
            c.sent, c.received, c.received_bytes, c.ignored, c.timeouts, c.errors, c.send_sequence
        );
        let rtt = self.rtt.stats();
        if rtt.samples > 0 {
            let _ = writeln!(
                out,
                "  rtt min {:?} mean {:?} max {:?} over {}",
                rtt.min, rtt.mean, rtt.max, rtt.samples
            );
        }
        if level < 1 {
            return out;
        }

        if let Some(id) = &self.identity {
            let _ = writeln!(out, "  description: {}", id.description);
            let _ = writeln!(out, "  json hash: {}", id.json_hash);
            let _ = writeln!(out, "  code hash: {}", id.code_hash);
        }
        for (index, slot) in self.slots.iter().enumerate() {
            match slot {
                None => {
                    let _ = writeln!(out, "  slot {index}: idle");
                }
                Some(s) => {
                    let _ = writeln!(
                        out,
                        "  slot {index}: seq {:08x}, {} commands, age {:?}{}",
                        s.request.sequence,
                        s.request.commands.len(),
                        now.saturating_duration_since(s.sent_at),
                        if s.malformed { ", malformed reply" } else { "" }
                    );
                }
            }
        }
        if level < 2 {
            return out;
        }

        let queued: Vec<&str> = self.send_queue.iter().map(|&id| self.reg(id).name.as_str()).collect();
        let _ = writeln!(out, "  send queue: [{}]", queued.join(", "));
        if level < 3 {
            return out;
        }

        for (name, &id) in &self.by_name {
            let reg = self.reg(id);
            let mapping = match &reg.info {
                Some(info) => format!("{:#08x}+{}", info.base_addr, reg.mem.len()),
                None => "unmapped".to_string(),
            };
            let busy = match &reg.op {
                Some(op) => format!(
                    ", {:?} {}..{} for {:?}",
                    op.direction,
                    op.range.start,
                    op.range.end,
                    now.saturating_duration_since(op.started)
                ),
                None => String::new(),
            };
            let _ = writeln!(
                out,
                "  {name} [{:?}] {mapping} {} / {:?}, {} waiters{busy}",
                reg.origin, reg.status, reg.severity, reg.waiter_count()
            );
        }
        out
    }
}
