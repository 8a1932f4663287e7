//! Property tests for the wire codec.
//!
//! Encoding then decoding must reproduce register words bit-exactly for
//! any valid range, at both supported element widths.

use leep_common::consts::{ADDRESS_MASK, MAX_COMMANDS, MIN_COMMANDS};
use leep_common::wire::{
    Command, ElementWidth, Elements, Frame, bytes_to_words, decode_reply, encode_request,
    words_to_bytes,
};
use proptest::prelude::*;

fn word_range() -> impl Strategy<Value = (u32, Vec<u32>)> {
    prop::collection::vec(any::<u32>(), 1..=MAX_COMMANDS).prop_flat_map(|words| {
        let max_base = ADDRESS_MASK + 1 - words.len() as u32;
        (0..=max_base, Just(words))
    })
}

proptest! {
    #[test]
    fn write_request_round_trip((address, words) in word_range(), sequence in any::<u32>()) {
        let bytes = encode_request(sequence, address, true, &words).unwrap();
        let frame = Frame::decode(&bytes).unwrap();
        prop_assert_eq!(frame.sequence, sequence);
        prop_assert_eq!(frame.commands.len(), words.len().max(MIN_COMMANDS));
        for (i, (cmd, &w)) in frame.commands.iter().zip(&words).enumerate() {
            prop_assert!(!cmd.is_read());
            prop_assert_eq!(cmd.address(), address + i as u32);
            prop_assert_eq!(cmd.data, w);
        }
    }

    #[test]
    fn read_reply_round_trip((address, words) in word_range(), sequence in any::<u32>()) {
        // Build the request, then answer it the way a device would.
        let request = Frame::decode(
            &encode_request(sequence, address, false, &words).unwrap(),
        ).unwrap();
        let mut reply = request.clone();
        for (cmd, &w) in reply.commands.iter_mut().zip(&words) {
            cmd.data = w;
        }
        let bytes = reply.encode().unwrap();

        prop_assert!(request.match_reply(&Frame::decode(&bytes).unwrap()).is_ok());
        let decoded = decode_reply(&bytes).unwrap();
        prop_assert_eq!(decoded.sequence, sequence);
        prop_assert_eq!(decoded.status, 0);
        prop_assert_eq!(&decoded.words[..words.len()], &words[..]);
    }

    #[test]
    fn element_views_round_trip(words in prop::collection::vec(any::<u32>(), 0..256)) {
        for width in [ElementWidth::Bits16, ElementWidth::Bits32] {
            let elements = Elements::from_words(&words, width);
            prop_assert_eq!(elements.len(), words.len() * width.per_word());
            prop_assert_eq!(elements.to_words(), words.clone());
        }
        prop_assert_eq!(bytes_to_words(&words_to_bytes(&words)).unwrap(), words);
    }

    #[test]
    fn unsupported_widths_rejected(bits in any::<u32>()) {
        prop_assume!(bits != 16 && bits != 32);
        prop_assert!(ElementWidth::from_bits(bits).is_err());
    }

    #[test]
    fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..1100)) {
        let _ = Frame::decode(&bytes);
    }

    #[test]
    fn status_nibble_does_not_break_match(status in 0u32..16, address in 0u32..0x1000) {
        let mut request = Frame::new(7, vec![Command::read(address)]);
        request.pad();
        let mut reply = request.clone();
        reply.commands[0].cmd_addr |= status << 24;
        prop_assert!(request.match_reply(&reply).is_ok());
        prop_assert_eq!(reply.status(), status as u8);
    }
}
