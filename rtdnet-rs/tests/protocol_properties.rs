//! Codec properties over arbitrary frame contents.

use proptest::prelude::*;
use rtdnet_rs::frame::{self, CodecError, Frame, FrameData, FrameShape};

fn any_data() -> impl Strategy<Value = FrameData> {
    prop_oneof![
        any::<[u8; 4]>().prop_map(FrameData::Request),
        any::<[u8; 3]>().prop_map(FrameData::Register),
        any::<[u8; 2]>().prop_map(FrameData::Coil),
    ]
}

proptest! {
    #[test]
    fn test_encoded_frames_decode_and_validate(address: u8, command: u8, data in any_data()) {
        let frame = Frame::new(address, command, data);
        let wire = frame::encode(&frame);

        prop_assert_eq!(wire.len(), data.shape().wire_len());
        let decoded = frame::decode(&wire, data.shape()).unwrap();
        prop_assert_eq!(decoded, frame);
        prop_assert!(frame::validate(&decoded));
    }

    #[test]
    fn test_truncated_input_is_short_read(address: u8, command: u8, data in any_data(), cut in 1usize..=8) {
        let shape = data.shape();
        let wire = frame::encode(&Frame::new(address, command, data));
        let keep = wire.len().saturating_sub(cut);

        prop_assert_eq!(
            frame::decode(&wire[..keep], shape),
            Err(CodecError::ShortRead { expected: shape.wire_len(), actual: keep })
        );
    }

    #[test]
    fn test_single_bit_flip_fails_validation(
        address: u8,
        command: u8,
        data in any_data(),
        bit in 0usize..64,
    ) {
        let shape = data.shape();
        let mut wire = frame::encode(&Frame::new(address, command, data));
        let bit = bit % (wire.len() * 8);
        wire[bit / 8] ^= 1 << (bit % 8);

        let decoded = frame::decode(&wire, shape).unwrap();
        prop_assert!(!frame::validate(&decoded));
    }

    #[test]
    fn test_request_fields_survive_encoding(address: u8, register: u16, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        let request = Frame::request(address, 0x06, register, hi, lo);
        let decoded = frame::decode(&frame::encode(&request), FrameShape::Request).unwrap();

        prop_assert_eq!(decoded.register(), Some(register));
        prop_assert_eq!(decoded.register_value(), value);
    }
}
