//! Device sessions against a simulator on the loopback interface.

use leep_common::config::{BitRef, WaveformRuleConfig};
use leep_common::rom;
use leep_device::{
    ChannelWaiter, Completion, ConnectionState, Device, DeviceConfig, DeviceError, Direction,
    Elements, FnWaiter, QueueError, RegisterStatus, Severity, Waiter, WaiterId,
};
use leep_sim::{LogicKind, SimImage, Simulator, SimulatorHandle, build_logic};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const MAP: &str = r#"{
    "scratch": {"base_addr": 16, "addr_width": 3},
    "status": {"base_addr": 32, "access": "r"},
    "ghost": {"base_addr": 48},
    "cap_reset": {"base_addr": 64},
    "cap_status": {"base_addr": 65},
    "cap_data": {"base_addr": 128, "addr_width": 3}
}"#;

const WAIT: Duration = Duration::from_secs(5);

fn start_sim(kind: LogicKind, rules: &[WaveformRuleConfig]) -> SimulatorHandle {
    let image = SimImage::from_json(MAP, false).unwrap();
    let logic = build_logic(kind, &image, rules).unwrap();
    Simulator::bind("127.0.0.1:0".parse().unwrap(), image, logic)
        .unwrap()
        .spawn()
        .unwrap()
}

fn connect(sim: &Simulator, timeout_ms: u64) -> Arc<Device> {
    let mut config = DeviceConfig::new("session-test");
    config.bind = "127.0.0.1:0".to_string();
    config.peer = Some(sim.local_addr().to_string());
    config.session.timeout_ms = timeout_ms;
    config.session.reconnect_backoff_ms = 100;
    let device = Device::create(config).unwrap();
    device.wait_connected(WAIT).unwrap();
    device
}

/// Attach a waiter, start the request and wait for its completion.
fn request(
    device: &Device,
    register: &str,
    start: impl FnOnce(&Device) -> Result<(), QueueError>,
) -> Completion {
    let (tx, rx) = mpsc::channel();
    device.attach(register, Box::new(ChannelWaiter::new(tx)));
    start(device).unwrap();
    rx.recv_timeout(WAIT).unwrap().1
}

fn read(device: &Device, register: &str) -> Vec<u32> {
    let completion = request(device, register, |d| d.try_queue(register, Direction::Read));
    assert!(completion.is_ok(), "{completion:?}");
    device.register(register).unwrap().words
}

#[test]
fn test_connect_populates_identity() {
    let sim = start_sim(LogicKind::None, &[]);
    let device = connect(&sim, 500);

    assert_eq!(device.state(), ConnectionState::Connected);
    assert_eq!(device.identity().unwrap().description, "LEEP Simulator");
    let blob = rom::decompress(&device.info_blob()).unwrap();
    let info: serde_json::Value = serde_json::from_slice(&blob).unwrap();
    assert_eq!(info["registers"]["scratch"]["base_addr"], 16);

    let counters = device.counters();
    assert!(counters.sent > 0);
    assert_eq!(counters.sent, counters.received);
    assert_eq!(counters.ignored, 0);
    assert!(device.rtt().samples > 0);
    assert!(device.register_names().contains(&"cap_data".to_string()));
    device.shutdown();
}

#[test]
fn test_write_then_read() {
    let sim = start_sim(LogicKind::None, &[]);
    let device = connect(&sim, 500);

    let done = request(&device, "scratch", |d| d.write("scratch", 1, &[0x0001_0002, 3]));
    assert_eq!(done.status, RegisterStatus::Ok);
    assert_eq!(done.severity, Severity::None);

    let words = read(&device, "scratch");
    assert_eq!(words, vec![0, 0x0001_0002, 3, 0, 0, 0, 0, 0]);

    match device.read_elements("scratch", 16).unwrap() {
        Elements::U16(values) => assert_eq!(&values[2..4], &[1, 2]),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        device.read_elements("scratch", 8),
        Err(DeviceError::Wire(_))
    ));
    device.shutdown();
}

#[test]
fn test_sub_range_read() {
    let sim = start_sim(LogicKind::None, &[]);
    let device = connect(&sim, 500);
    let done = request(&device, "scratch", |d| d.write("scratch", 0, &[9; 8]));
    assert!(done.is_ok());

    let done = request(&device, "scratch", |d| {
        d.try_queue_range("scratch", Direction::Read, 6..8)
    });
    assert!(done.is_ok());
    assert_eq!(
        device.try_queue_range("scratch", Direction::Read, 6..9),
        Err(QueueError::OutOfRange)
    );
    device.shutdown();
}

#[test]
fn test_timeout_fails_waiter_within_window() {
    let sim = start_sim(LogicKind::None, &[]);
    let device = connect(&sim, 100);
    let timeouts = device.counters().timeouts;

    let started = Instant::now();
    let done = request(&device, "ghost", |d| d.try_queue("ghost", Direction::Read));
    let elapsed = started.elapsed();

    assert_eq!(done.status, RegisterStatus::Timeout);
    assert_eq!(done.severity, Severity::Invalid);
    assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1000), "{elapsed:?}");
    assert_eq!(device.counters().timeouts, timeouts + 1);
    assert_eq!(device.state(), ConnectionState::Connected);
    device.shutdown();
}

#[test]
fn test_second_write_is_busy() {
    let sim = start_sim(LogicKind::None, &[]);
    let device = connect(&sim, 2000);
    sim.set_slowdown(Duration::from_millis(200));

    let (tx, rx) = mpsc::channel();
    device.attach("scratch", Box::new(ChannelWaiter::new(tx)));
    assert!(device.queue("scratch", true));
    let before = device.register("scratch").unwrap();
    assert!(before.in_progress);

    assert!(!device.queue("scratch", true));
    assert_eq!(
        device.try_queue("scratch", Direction::Write),
        Err(QueueError::Busy)
    );
    let after = device.register("scratch").unwrap();
    assert!(after.in_progress);
    assert_eq!(after.direction, Some(Direction::Write));

    let (_, done) = rx.recv_timeout(WAIT).unwrap();
    assert!(done.is_ok());
    sim.set_slowdown(Duration::ZERO);
    assert!(device.queue("scratch", true));
    device.shutdown();
}

#[test]
fn test_waiters_notified_in_order() {
    let sim = start_sim(LogicKind::None, &[]);
    let device = connect(&sim, 500);
    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    for i in 0..3 {
        let order = order.clone();
        let tx = tx.clone();
        device.attach(
            "status",
            Box::new(FnWaiter::new(move |c: Completion| {
                order.lock().unwrap().push((i, c.status));
                let _ = tx.send(());
            })),
        );
    }
    assert!(device.queue("status", false));
    for _ in 0..3 {
        rx.recv_timeout(WAIT).unwrap();
    }
    assert_eq!(
        *order.lock().unwrap(),
        vec![
            (0, RegisterStatus::Ok),
            (1, RegisterStatus::Ok),
            (2, RegisterStatus::Ok)
        ]
    );
    device.shutdown();
}

#[test]
fn test_detached_waiter_not_notified() {
    let sim = start_sim(LogicKind::None, &[]);
    let device = connect(&sim, 500);
    let (tx, rx) = mpsc::channel();
    let waiter = ChannelWaiter::new(tx.clone());
    let id = waiter.id();
    device.attach("status", Box::new(waiter));
    assert!(device.detach("status", id));

    let done = request(&device, "status", |d| d.try_queue("status", Direction::Read));
    assert!(done.is_ok());
    assert!(rx.try_recv().is_err());
    device.shutdown();
}

/// Reads device state when dropped.
struct InspectOnDrop {
    id: WaiterId,
    device: Arc<Device>,
    dropped: mpsc::Sender<ConnectionState>,
}

impl Waiter for InspectOnDrop {
    fn id(&self) -> WaiterId {
        self.id
    }

    fn notify(self: Box<Self>, _completion: Completion) {}
}

impl Drop for InspectOnDrop {
    fn drop(&mut self) {
        let _ = self.dropped.send(self.device.state());
    }
}

#[test]
fn test_detached_waiter_dropped_outside_lock() {
    let sim = start_sim(LogicKind::None, &[]);
    let device = connect(&sim, 500);
    let (tx, rx) = mpsc::channel();
    let id = WaiterId::next();
    device.attach(
        "status",
        Box::new(InspectOnDrop {
            id,
            device: device.clone(),
            dropped: tx,
        }),
    );

    let detacher = device.clone();
    std::thread::spawn(move || detacher.detach("status", id));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), ConnectionState::Connected);
    assert_eq!(device.register("status").unwrap().waiters, 0);
    device.shutdown();
}

#[test]
fn test_reset_twice_notifies_each_waiter_once() {
    let sim = start_sim(LogicKind::None, &[]);
    let device = connect(&sim, 2000);
    sim.set_slowdown(Duration::from_millis(300));

    let (tx, rx) = mpsc::channel();
    device.attach("scratch", Box::new(ChannelWaiter::new(tx.clone())));
    device.attach("scratch", Box::new(ChannelWaiter::new(tx)));
    assert!(device.queue("scratch", false));

    device.request_reset();
    device.request_reset();
    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert!(device.info_blob().is_empty());

    let got: Vec<_> = (0..2).map(|_| rx.recv_timeout(WAIT).unwrap().1).collect();
    assert!(got.iter().all(|c| c.status == RegisterStatus::Reset));
    assert!(rx.try_recv().is_err());
    let snap = device.register("scratch").unwrap();
    assert!(!snap.in_progress);
    assert_eq!(snap.waiters, 0);

    sim.set_slowdown(Duration::ZERO);
    device.wait_connected(WAIT).unwrap();
    assert!(device.register("scratch").unwrap().info.is_some());
    device.shutdown();
}

#[test]
fn test_reconnect_to_new_peer_after_error() {
    let first = start_sim(LogicKind::None, &[]);
    let device = connect(&first, 500);
    let mut changes = device.subscribe();

    device.report_error("link lost");
    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert_eq!(device.counters().errors, 1);
    assert_eq!(device.last_message(), "link lost");
    assert!(changes.has_changed().unwrap());
    changes.mark_unchanged();

    let second = start_sim(LogicKind::None, &[]);
    device.set_peer(&second.local_addr().to_string()).unwrap();
    device.poke_runner();
    device.wait_connected(WAIT).unwrap();
    assert_eq!(
        device.peer().and_then(|p| p.socket_addr()),
        Some(second.local_addr())
    );
    assert!(changes.has_changed().unwrap());
    device.shutdown();
}

#[test]
fn test_bad_peer_rejected_synchronously() {
    let sim = start_sim(LogicKind::None, &[]);
    let device = connect(&sim, 500);
    assert!(matches!(
        device.set_peer("not a host!"),
        Err(DeviceError::Config(_))
    ));
    assert_eq!(device.state(), ConnectionState::Connected);

    device.set_peer("").unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert!(!device.queue("scratch", false));
    device.shutdown();
}

#[test]
fn test_register_change_channel() {
    let sim = start_sim(LogicKind::None, &[]);
    let device = connect(&sim, 500);
    let mut changed = device.subscribe_register("scratch");
    changed.mark_unchanged();
    read(&device, "scratch");
    assert!(changed.has_changed().unwrap());
    device.shutdown();
}

#[test]
fn test_derived_waveform_through_device() {
    let rule = WaveformRuleConfig {
        name: "capture".to_string(),
        reset: BitRef {
            register: "cap_reset".to_string(),
            bit: 0,
        },
        status: BitRef {
            register: "cap_status".to_string(),
            bit: 1,
        },
        buffer: "cap_data".to_string(),
        valid: 0b101,
        mask: None,
    };
    let sim = start_sim(LogicKind::Hires, &[rule]);
    let device = connect(&sim, 500);

    let done = request(&device, "cap_reset", |d| d.write("cap_reset", 0, &[1]));
    assert!(done.is_ok());
    assert_eq!(read(&device, "cap_status")[0] & 0b10, 0b10);
    assert_eq!(read(&device, "cap_reset"), vec![0]);
    // channels 0 and 2 interleaved, seed 0
    assert_eq!(read(&device, "cap_data"), vec![0, 20, 5, 25, 10, 30, 15, 35]);

    request(&device, "cap_reset", |d| d.write("cap_reset", 0, &[1]));
    assert_eq!(read(&device, "cap_data"), vec![1, 21, 6, 26, 11, 31, 16, 36]);
    device.shutdown();
}

#[test]
fn test_show_report() {
    let sim = start_sim(LogicKind::None, &[]);
    let device = connect(&sim, 500);
    let report = device.show(3);
    assert!(report.contains("CONNECTED"));
    assert!(report.contains("LEEP Simulator"));
    assert!(report.contains("cap_data"));
    device.shutdown();
}
