//! Simulator behavior as seen from a UDP client.

use leep_common::consts::{HELLO_WORDS, MAX_COMMANDS, MAX_FRAME_BYTES, ROM_2K_ADDRESS, ROM_2K_WORDS};
use leep_common::regmap::RegisterMap;
use leep_common::rom::Rom;
use leep_common::wire::{decode_reply, encode_request};
use leep_sim::{InitialValues, LogicKind, SimImage, Simulator, SimulatorHandle, build_logic};
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tempfile::NamedTempFile;

const MAP: &str = r#"{
    "scratch": {"base_addr": 16, "addr_width": 2},
    "ghost": {"base_addr": 48}
}"#;

fn client() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    socket
}

fn spawn(image: SimImage) -> SimulatorHandle {
    let logic = build_logic(LogicKind::None, &image, &[]).unwrap();
    Simulator::bind("127.0.0.1:0".parse().unwrap(), image, logic)
        .unwrap()
        .spawn()
        .unwrap()
}

fn read_words(socket: &UdpSocket, sim: SocketAddr, sequence: u32, address: u32, count: usize) -> Vec<u32> {
    socket
        .send_to(&encode_request(sequence, address, false, &vec![0; count]).unwrap(), sim)
        .unwrap();
    let mut buf = [0u8; MAX_FRAME_BYTES];
    let (len, _) = socket.recv_from(&mut buf).unwrap();
    let reply = decode_reply(&buf[..len]).unwrap();
    assert_eq!(reply.sequence, sequence);
    reply.words[..count].to_vec()
}

#[test]
fn test_initial_values_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "10 0000abcd").unwrap();
    writeln!(file).unwrap();
    writeln!(file, "0x13 7").unwrap();
    writeln!(file, "900000 1").unwrap();
    let values = InitialValues::load(file.path()).unwrap();

    let mut image = SimImage::from_json(MAP, false).unwrap();
    assert_eq!(image.apply_initial(&values), 2);
    let sim = spawn(image);

    let socket = client();
    assert_eq!(
        read_words(&socket, sim.local_addr(), 1, 16, 4),
        vec![0xabcd, 0, 0, 7]
    );
}

#[test]
fn test_greeting_and_rom_over_udp() {
    let sim = spawn(SimImage::from_json(MAP, false).unwrap());
    let socket = client();
    assert_eq!(read_words(&socket, sim.local_addr(), 1, 0, 4), HELLO_WORDS.to_vec());

    let mut words = Vec::with_capacity(ROM_2K_WORDS);
    let mut sequence = 2;
    while words.len() < ROM_2K_WORDS {
        let count = (ROM_2K_WORDS - words.len()).min(MAX_COMMANDS);
        let address = ROM_2K_ADDRESS + words.len() as u32;
        words.extend(read_words(&socket, sim.local_addr(), sequence, address, count));
        sequence += 1;
    }

    let rom = Rom::parse(&words).unwrap();
    assert_eq!(rom.description(), Some("LEEP Simulator"));
    let map = RegisterMap::parse(rom.json().unwrap()).unwrap();
    assert_eq!(map.len(), 2);
}

#[test]
fn test_big_rom_probe_reads_zero() {
    let sim = spawn(SimImage::from_json(MAP, true).unwrap());
    let socket = client();
    let probe = read_words(&socket, sim.local_addr(), 1, ROM_2K_ADDRESS, 1);
    assert_eq!(probe[0] & 0xffff, 0);
}

#[test]
fn test_ghost_register_is_silent() {
    let sim = spawn(SimImage::from_json(MAP, false).unwrap());
    let socket = client();
    socket
        .send_to(&encode_request(1, 48, false, &[0]).unwrap(), sim.local_addr())
        .unwrap();
    let mut buf = [0u8; MAX_FRAME_BYTES];
    assert!(socket.recv_from(&mut buf).is_err());

    // still serving afterwards
    assert_eq!(read_words(&socket, sim.local_addr(), 2, 16, 1), vec![0]);
}
