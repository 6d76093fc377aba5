//! Property-based tests using proptest
//!
//! These tests check the codec and statistics invariants over randomly
//! generated bundles, bodies and sample sets.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use latency_mitigator::core::bundle::{split_messages, BundleHeader, MAGIC_CONSTANT};
use latency_mitigator::core::codec::BundleCodec;
use latency_mitigator::core::message::{IpcHeader, Message, MessageType};
use latency_mitigator::utils::compression::CompressionKind;
use latency_mitigator::utils::{ManualClock, StatsTracker};
use proptest::prelude::*;

fn header(compression: CompressionKind) -> BundleHeader {
    BundleHeader {
        magic: MAGIC_CONSTANT,
        timestamp_ms: 1_700_000_000_000,
        total_length: 0,
        conn_type: 1,
        message_count: 0,
        encoding: 1,
        compression: compression.to_byte(),
        reserved: 0,
        decoded_body_length: 0,
    }
}

fn arb_message() -> impl Strategy<Value = Message> {
    prop_oneof![
        (any::<u32>(), any::<u16>(), prop::collection::vec(any::<u8>(), 0..256)).prop_map(
            |(actor, subtype, body)| {
                let header = IpcHeader {
                    ipc_type: 0x0014,
                    subtype,
                    ..IpcHeader::default()
                };
                Message::ipc(actor, actor, header, &body)
            }
        ),
        (any::<u32>(), any::<u32>()).prop_map(|(id, epoch)| {
            Message::keep_alive(MessageType::ClientKeepAlive, 1, id, epoch)
        }),
    ]
}

// Property: a re-encoded bundle yields the same messages in the same order
proptest! {
    #[test]
    fn prop_bundle_preserves_messages(
        messages in prop::collection::vec(arb_message(), 1..16),
        deflate in any::<bool>(),
    ) {
        let kind = if deflate { CompressionKind::Deflate } else { CompressionKind::None };
        let mut codec = BundleCodec::new();

        let bytes = codec.encode(&header(kind), &messages).expect("encode should not fail");
        let decoded = codec.decode(&bytes).expect("decode should not fail");

        prop_assert_eq!(decoded.header.total_length as usize, bytes.len());
        prop_assert_eq!(usize::from(decoded.header.message_count), messages.len());
        if !deflate {
            let again = codec.encode(&decoded.header, &decoded.messages).expect("re-encode should not fail");
            prop_assert_eq!(&again, &bytes);
        }
        prop_assert_eq!(decoded.messages, messages);
    }
}

// Property: decoding arbitrary bytes never panics
proptest! {
    #[test]
    fn prop_decode_arbitrary_bytes(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = BundleCodec::new().decode(&data);
    }
}

// Property: arbitrary bytes behind a valid header never panic the decoder
proptest! {
    #[test]
    fn prop_decode_arbitrary_body(body in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut bundle_header = header(CompressionKind::None);
        bundle_header.total_length = (40 + body.len()) as u32;
        let mut bytes = bundle_header.to_bytes().to_vec();
        bytes.extend_from_slice(&body);

        let _ = BundleCodec::new().decode(&bytes);
    }
}

// Property: split slices cover the whole body, each starting with its own length
proptest! {
    #[test]
    fn prop_split_covers_body(lengths in prop::collection::vec(16usize..64, 0..8)) {
        let mut body = Vec::new();
        for &len in &lengths {
            let mut message = vec![0u8; len];
            message[..4].copy_from_slice(&(len as u32).to_le_bytes());
            body.extend_from_slice(&message);
        }

        let slices = split_messages(lengths.len(), &body).expect("split should not fail");
        prop_assert_eq!(slices.len(), lengths.len());
        prop_assert_eq!(slices.iter().map(|s| s.len()).sum::<usize>(), body.len());
        for (slice, &len) in slices.iter().zip(&lengths) {
            prop_assert_eq!(slice.len(), len);
        }
    }
}

// Property: a body whose lengths do not add up is rejected, never mis-split
proptest! {
    #[test]
    fn prop_split_rejects_overrun(len in 17u32..1024, available in 16usize..64) {
        prop_assume!((len as usize) > available);
        let mut body = vec![0u8; available];
        body[..4].copy_from_slice(&len.to_le_bytes());
        prop_assert!(split_messages(1, &body).is_err());
    }
}

// Property: with every sample at one timestamp, statistics ignore insertion order
proptest! {
    #[test]
    fn prop_stats_order_independent(mut values in prop::collection::vec(-1_000_000i64..1_000_000, 1..10)) {
        let clock = Arc::new(ManualClock::new(5_000));
        let mut forward = StatsTracker::new(10, i64::MAX, clock.clone());
        for &value in &values {
            forward.add_value(value);
        }
        values.reverse();
        let mut backward = StatsTracker::new(10, i64::MAX, clock);
        for &value in &values {
            backward.add_value(value);
        }

        prop_assert_eq!(forward.min(0), backward.min(0));
        prop_assert_eq!(forward.max(0), backward.max(0));
        prop_assert_eq!(forward.median(0), backward.median(0));
        prop_assert_eq!(forward.mean_and_deviation(0), backward.mean_and_deviation(0));
    }
}

// Property: the window never holds more than track_count samples
proptest! {
    #[test]
    fn prop_stats_respects_track_count(
        track_count in 1usize..16,
        values in prop::collection::vec(any::<i32>(), 0..64),
    ) {
        let clock = Arc::new(ManualClock::new(0));
        let mut stats = StatsTracker::new(track_count, -1, clock.clone());
        for &value in &values {
            clock.advance_us(1);
            stats.add_value(i64::from(value));
        }

        prop_assert_eq!(stats.count(0), values.len().min(track_count));
        if let Some(&last) = values.last() {
            prop_assert_eq!(stats.latest(), i64::from(last));
        } else {
            prop_assert_eq!(stats.latest(), -1);
        }
    }
}
