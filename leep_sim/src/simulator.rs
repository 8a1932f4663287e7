//! UDP server answering LEEP requests from a simulated register image.
//!
//! # Request Handling
//!
//! ```text
//! recv ──► slowdown ──► process() ──► send reply
//!                          │
//!                          ├─ read:  data = storage[offset]
//!                          ├─ write: SimLogic::reg_write(data & mask)
//!                          └─ ghost: no reply
//! ```
//!
//! [`Simulator::process`] is a pure frame handler and can be driven
//! without a socket.

use crate::error::SimResult;
use crate::image::SimImage;
use crate::logic::SimLogic;
use leep_common::consts::{COMMAND_SIZE, MAX_FRAME_BYTES, MIN_FRAME_BYTES, UNMAPPED_READ_VALUE};
use leep_common::wire::Frame;
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Register name whose access suppresses the reply.
pub const GHOST_REGISTER: &str = "ghost";

/// How often the server loop checks the running flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct SimState {
    image: SimImage,
    logic: Box<dyn SimLogic>,
}

/// A simulated LEEP device bound to a UDP socket.
pub struct Simulator {
    socket: UdpSocket,
    local_addr: SocketAddr,
    state: Mutex<SimState>,
    running: Arc<AtomicBool>,
    debug: AtomicBool,
    slowdown_us: AtomicU64,
}

impl Simulator {
    /// Bind the server socket.
    pub fn bind(addr: SocketAddr, image: SimImage, logic: Box<dyn SimLogic>) -> SimResult<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let local_addr = socket.local_addr()?;
        info!("Simulator ({} logic) bound to {}", logic.name(), local_addr);
        Ok(Self {
            socket,
            local_addr,
            state: Mutex::new(SimState { image, logic }),
            running: Arc::new(AtomicBool::new(true)),
            debug: AtomicBool::new(false),
            slowdown_us: AtomicU64::new(0),
        })
    }

    /// Address the server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Log every register access.
    pub fn set_debug(&self, debug: bool) {
        self.debug.store(debug, Ordering::Relaxed);
    }

    /// Delay inserted before handling each request.
    pub fn set_slowdown(&self, slowdown: Duration) {
        self.slowdown_us
            .store(slowdown.as_micros() as u64, Ordering::Relaxed);
    }

    /// Flag cleared to stop [`Simulator::exec`].
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Ask the server loop to stop.
    pub fn interrupt(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run `f` with exclusive access to the register image.
    pub fn with_image<R>(&self, f: impl FnOnce(&mut SimImage) -> R) -> R {
        f(&mut self.state.lock().image)
    }

    /// Serve requests until interrupted.
    pub fn exec(&self) -> SimResult<()> {
        let mut buf = vec![0u8; MAX_FRAME_BYTES + COMMAND_SIZE];
        while self.running.load(Ordering::SeqCst) {
            let (len, peer) = match self.socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset
                    ) =>
                {
                    debug!("Ignoring socket error: {}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let slowdown = self.slowdown_us.load(Ordering::Relaxed);
            if slowdown > 0 {
                std::thread::sleep(Duration::from_micros(slowdown));
            }

            if let Some(reply) = self.process(peer, &buf[..len]) {
                if let Err(e) = self.socket.send_to(&reply, peer) {
                    warn!("{}: failed to send reply: {}", peer, e);
                }
            }
        }
        info!("Simulator on {} stopped", self.local_addr);
        Ok(())
    }

    /// Handle one request; `None` means no reply is sent.
    pub fn process(&self, peer: SocketAddr, request: &[u8]) -> Option<Vec<u8>> {
        if request.len() < MIN_FRAME_BYTES {
            warn!("{}: ignoring too short request ({} bytes)", peer, request.len());
            return None;
        }
        let junk = request.len() % COMMAND_SIZE;
        if junk != 0 {
            warn!("{}: sent request with {} bytes of trailing junk", peer, junk);
        }
        let mut frame = match Frame::decode(&request[..request.len() - junk]) {
            Ok(f) => f,
            Err(e) => {
                warn!("{}: ignoring request: {}", peer, e);
                return None;
            }
        };

        let debug = self.debug.load(Ordering::Relaxed);
        let mut ignore = false;
        {
            let mut guard = self.state.lock();
            let SimState { image, logic } = &mut *guard;

            for cmd in &mut frame.commands {
                if cmd.unused_bits() != 0 {
                    warn!("{}: unused bits set in cmd/address {:08x}", peer, cmd.cmd_addr);
                }

                let Some((index, offset)) = image.locate(cmd.address()) else {
                    warn!("{}: unknown cmd/address {:08x}", peer, cmd.cmd_addr);
                    if cmd.is_read() {
                        cmd.data = UNMAPPED_READ_VALUE;
                    }
                    continue;
                };

                if image.reg(index).name == GHOST_REGISTER {
                    ignore = true;
                }

                if cmd.is_read() {
                    let reg = image.reg(index);
                    cmd.data = reg.storage[offset];
                    if debug {
                        debug!(
                            "{}: read {}[{}] ({:06x}) -> {:08x}",
                            peer, reg.name, offset, cmd.address(), cmd.data
                        );
                        if !reg.readable {
                            debug!("{}: read of unreadable cmd/address {:08x}", peer, cmd.cmd_addr);
                        }
                    }
                } else {
                    // the reply echoes the value written
                    let value = cmd.data & image.reg(index).mask;
                    logic.reg_write(image, index, offset, value);
                    let reg = image.reg(index);
                    if debug {
                        debug!(
                            "{}: write {}[{}] ({:06x}) <- {:08x}",
                            peer, reg.name, offset, cmd.address(), reg.storage[offset]
                        );
                    }
                    if !reg.writable {
                        warn!("{}: write of unwriteable cmd/address {:08x}", peer, cmd.cmd_addr);
                    }
                }
            }
        }

        if ignore {
            return None;
        }
        match frame.encode() {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!("{}: failed to encode reply: {}", peer, e);
                None
            }
        }
    }

    /// Run the server loop on a background thread.
    pub fn spawn(self) -> SimResult<SimulatorHandle> {
        let sim = Arc::new(self);
        let worker = sim.clone();
        let thread = std::thread::Builder::new()
            .name("leep-sim".to_string())
            .spawn(move || worker.exec())?;
        Ok(SimulatorHandle {
            sim,
            thread: Some(thread),
        })
    }
}

/// A simulator running on its own thread; stopped on drop.
pub struct SimulatorHandle {
    sim: Arc<Simulator>,
    thread: Option<JoinHandle<SimResult<()>>>,
}

impl SimulatorHandle {
    /// Stop the server and wait for its thread.
    pub fn stop(mut self) -> SimResult<()> {
        self.join()
    }

    fn join(&mut self) -> SimResult<()> {
        self.sim.interrupt();
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => {
                warn!("Simulator thread panicked");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl std::ops::Deref for SimulatorHandle {
    type Target = Simulator;

    fn deref(&self) -> &Simulator {
        &self.sim
    }
}

impl Drop for SimulatorHandle {
    fn drop(&mut self) {
        let _ = self.join();
    }
}
