//! Property-based tests for the packet codec.
//!
//! - Any sequence of (u32, u64, string) fields packed into a packet
//!   unpacks to the original values
//! - Any truncation of an encoded packet body makes unpacking fail

#![cfg(test)]

use proptest::prelude::*;

use crate::sftp::codec::{PacketBuilder, PacketReader, FRAME_HEADER_LEN};

#[derive(Debug, Clone)]
enum Field {
    U32(u32),
    U64(u64),
    Str(Vec<u8>),
}

fn arb_field() -> impl Strategy<Value = Field> {
    prop_oneof![
        any::<u32>().prop_map(Field::U32),
        any::<u64>().prop_map(Field::U64),
        proptest::collection::vec(any::<u8>(), 0..64).prop_map(Field::Str),
    ]
}

fn pack(packet_type: u8, fields: &[Field]) -> bytes::Bytes {
    let mut p = PacketBuilder::new(packet_type);
    for field in fields {
        match field {
            Field::U32(n) => p.put_u32(*n),
            Field::U64(n) => p.put_u64(*n),
            Field::Str(s) => p.put_str(s),
        }
    }
    p.finish()
}

proptest! {
    #[test]
    fn roundtrip(packet_type in any::<u8>(), fields in proptest::collection::vec(arb_field(), 0..12)) {
        let packet = pack(packet_type, &fields);

        // The length prefix covers the type byte plus the body.
        let len = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]) as usize;
        prop_assert_eq!(len, packet.len() - 4);
        prop_assert_eq!(packet[4], packet_type);

        let mut r = PacketReader::new(&packet[FRAME_HEADER_LEN..]);
        for field in &fields {
            match field {
                Field::U32(n) => prop_assert_eq!(r.get_u32().unwrap(), *n),
                Field::U64(n) => prop_assert_eq!(r.get_u64().unwrap(), *n),
                Field::Str(s) => prop_assert_eq!(&r.get_str().unwrap(), s),
            }
        }
        prop_assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn truncation_always_fails(fields in proptest::collection::vec(arb_field(), 1..8), cut in 1usize..16) {
        let packet = pack(5, &fields);
        let body = &packet[FRAME_HEADER_LEN..];
        prop_assume!(!body.is_empty());
        let cut = cut.min(body.len());
        let truncated = &body[..body.len() - cut];

        let mut r = PacketReader::new(truncated);
        let mut failed = false;
        for field in &fields {
            let ok = match field {
                Field::U32(n) => r.get_u32().map(|v| v == *n),
                Field::U64(n) => r.get_u64().map(|v| v == *n),
                Field::Str(s) => r.get_str().map(|v| &v == s),
            };
            match ok {
                Ok(matched) => prop_assert!(matched),
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }
        // Removing bytes must break at least one field decode.
        prop_assert!(failed);
    }
}
