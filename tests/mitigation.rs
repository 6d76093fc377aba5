//! End-to-end mitigation scenarios
//!
//! Bundles are built with the codec, pushed through an [`Interceptor`] on a
//! manual clock, and the forwarded bytes are decoded again to inspect what
//! the client would actually see.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use latency_mitigator::config::{Config, ConfigProvider, OpcodeConfig};
use latency_mitigator::core::bundle::{BundleHeader, MAGIC_CONSTANT};
use latency_mitigator::core::codec::BundleCodec;
use latency_mitigator::core::message::{
    ActionEffect, ActionRequest, IpcHeader, Message, TimingHint,
};
use latency_mitigator::protocol::ConnectionId;
use latency_mitigator::service::Interceptor;
use latency_mitigator::utils::compression::CompressionKind;
use latency_mitigator::utils::ManualClock;

const REQUEST: u16 = 0x0196;
const EFFECT: u16 = 0x0146;
const EFFECT_8: u16 = 0x0233;
const CONTROL: u16 = 0x0393;
const CONTROL_SELF: u16 = 0x0067;
const CAST: u16 = 0x0397;
const ME: u32 = 0x1040_2000;
const CONN: ConnectionId = ConnectionId(0x7a3);

struct Session {
    interceptor: Interceptor,
    clock: ManualClock,
}

impl Session {
    fn new(mutate: impl FnOnce(&mut Config)) -> Self {
        let config = Config::default_with_overrides(|config| {
            config.opcodes = OpcodeConfig {
                c2s_action_request: vec![REQUEST],
                s2c_action_effects: vec![EFFECT, EFFECT_8],
                s2c_actor_control: CONTROL,
                s2c_actor_control_self: CONTROL_SELF,
                s2c_actor_cast: CAST,
                ..OpcodeConfig::default()
            };
            mutate(config);
        });
        let clock = ManualClock::new(50_000_000);
        let interceptor =
            Interceptor::with_clock(Arc::new(ConfigProvider::new(config)), Arc::new(clock.clone()));
        assert!(interceptor.on_connection_found(CONN));
        Self { interceptor, clock }
    }

    fn bundle(messages: &[Message]) -> Vec<u8> {
        let header = BundleHeader {
            magic: MAGIC_CONSTANT,
            timestamp_ms: 1_700_000_000_000,
            total_length: 0,
            conn_type: 1,
            message_count: 0,
            encoding: 1,
            compression: CompressionKind::Deflate.to_byte(),
            reserved: 0,
            decoded_body_length: 0,
        };
        BundleCodec::new().encode(&header, messages).unwrap()
    }

    fn ipc(subtype: u16, body: &[u8]) -> Message {
        let header = IpcHeader {
            ipc_type: 0x0014,
            subtype,
            ..IpcHeader::default()
        };
        Message::ipc(ME, ME, header, body)
    }

    fn request(action_id: u32, sequence: u16) -> Message {
        Self::ipc(REQUEST, &ActionRequest { action_id, sequence }.to_body())
    }

    fn effect(subtype: u16, action_id: u32, sequence: u16, lock: f32) -> Message {
        let body = ActionEffect {
            action_id,
            animation_lock: lock,
            source_sequence: sequence,
        }
        .to_body();
        Self::ipc(subtype, &body)
    }

    fn send(&self, messages: &[Message]) -> Vec<u8> {
        let input = Self::bundle(messages);
        let out = self.interceptor.on_send(CONN, &input);
        assert_eq!(out, input, "outbound traffic is never rewritten");
        out
    }

    fn recv(&self, messages: &[Message]) -> Vec<Message> {
        let out = self.interceptor.on_recv(CONN, &Self::bundle(messages));
        if out.is_empty() {
            return Vec::new();
        }
        BundleCodec::new().decode(&out).unwrap().messages
    }

    fn recv_lock(&self, message: Message) -> f32 {
        let forwarded = self.recv(&[message]);
        ActionEffect::parse(forwarded[0].ipc_body()).unwrap().animation_lock
    }
}

fn assert_close(actual: f32, expected: f32) {
    assert!(
        (actual - expected).abs() < 1e-4,
        "expected {expected}, got {actual}"
    );
}

#[test]
fn test_fast_response_through_interceptor() {
    let session = Session::new(|_| {});
    session.send(&[Session::request(7, 1)]);
    assert_close(session.recv_lock(Session::effect(EFFECT, 7, 1, 0.6)), 0.675);

    let metrics = session.interceptor.metrics().snapshot();
    assert_eq!(metrics.messages_rewritten, 1);
    assert_eq!(metrics.bundles_reencoded, 1);
}

#[test]
fn test_slow_response_through_interceptor() {
    let session = Session::new(|_| {});
    session.send(&[Session::request(7, 1)]);
    session.clock.advance_ms(80);
    assert_close(session.recv_lock(Session::effect(EFFECT, 7, 1, 0.6)), 0.595);
}

#[test]
fn test_multi_target_effect_variant_is_recognised() {
    let session = Session::new(|_| {});
    session.send(&[Session::request(7, 1)]);
    assert_close(session.recv_lock(Session::effect(EFFECT_8, 7, 1, 0.6)), 0.675);
}

#[test]
fn test_chained_actions_respect_previous_lock() {
    let session = Session::new(|_| {});
    session.send(&[Session::request(1, 1)]);
    session.clock.advance_ms(50);
    assert_close(session.recv_lock(Session::effect(EFFECT, 1, 1, 0.6)), 0.625);

    // the client queues the next action right as its shortened lock ends
    session.clock.advance_ms(625);
    session.send(&[Session::request(2, 2)]);
    session.clock.advance_ms(50);
    assert_close(session.recv_lock(Session::effect(EFFECT, 2, 2, 0.6)), 0.625);
}

#[test]
fn test_interleaved_requests_drain_in_order() {
    let session = Session::new(|_| {});
    session.send(&[Session::request(1, 1), Session::request(2, 2)]);
    session.clock.advance_ms(40);

    // response to the second request skips the first
    let lock = session.recv_lock(Session::effect(EFFECT, 2, 2, 0.6));
    assert!(lock > 0.6, "lock was not extended: {lock}");

    // the first request was dropped from the queue
    assert_eq!(session.recv_lock(Session::effect(EFFECT, 1, 1, 0.6)), 0.6);
    assert_eq!(session.interceptor.metrics().snapshot().sequence_mismatches, 1);
}

#[test]
fn test_unmatched_effect_resets_chain() {
    let session = Session::new(|_| {});
    session.send(&[Session::request(1, 1)]);
    assert_eq!(session.recv_lock(Session::effect(EFFECT, 1, 44, 0.6)), 0.6);

    // the unmodified lock now anchors the chain
    session.clock.advance_ms(600);
    session.send(&[Session::request(2, 2)]);
    assert_close(session.recv_lock(Session::effect(EFFECT, 2, 2, 0.6)), 0.675);
}

#[test]
fn test_timing_hint_never_reaches_client() {
    let session = Session::new(|_| {});
    session.send(&[Session::request(1, 1)]);

    let header = IpcHeader {
        ipc_type: 0xe852,
        subtype: 0,
        ..IpcHeader::default()
    };
    let hint = Message::ipc(
        ME,
        ME,
        header,
        &TimingHint {
            source_sequence: 1,
            original_wait_time: 0.5,
        }
        .to_body(),
    );
    let effect = Session::effect(EFFECT, 1, 1, 0.6);

    let forwarded = session.recv(&[hint, effect]);
    assert_eq!(forwarded.len(), 1);
    let lock = ActionEffect::parse(forwarded[0].ipc_body()).unwrap().animation_lock;
    assert_close(lock, 0.575);
}

#[test]
fn test_disabled_mitigation_forwards_bytes_unchanged() {
    let session = Session::new(|config| config.mitigation.enabled = false);
    session.send(&[Session::request(1, 1)]);
    let input = Session::bundle(&[Session::effect(EFFECT, 1, 1, 0.6)]);
    assert_eq!(session.interceptor.on_recv(CONN, &input), input);
}

#[test]
fn test_toggling_off_forgets_pending_requests() {
    let session = Session::new(|_| {});
    session.send(&[Session::request(1, 1)]);
    session.interceptor.set_mitigation_enabled(false);
    session.interceptor.set_mitigation_enabled(true);

    // the request sent before the toggle is gone
    assert_eq!(session.recv_lock(Session::effect(EFFECT, 1, 1, 0.6)), 0.6);
}

#[test]
fn test_unknown_opcodes_are_inert() {
    let session = Session::new(|config| config.opcodes = OpcodeConfig::default());
    let input = Session::bundle(&[Session::request(1, 1)]);
    assert_eq!(session.interceptor.on_send(CONN, &input), input);
    let input = Session::bundle(&[Session::effect(EFFECT, 1, 1, 0.6)]);
    assert_eq!(session.interceptor.on_recv(CONN, &input), input);
}

#[test]
fn test_bundle_split_across_reads() {
    let session = Session::new(|_| {});
    session.send(&[Session::request(1, 1)]);

    let input = Session::bundle(&[Session::effect(EFFECT, 1, 1, 0.6)]);
    let (head, tail) = input.split_at(input.len() / 2);
    assert!(session.interceptor.on_recv(CONN, head).is_empty());

    let out = session.interceptor.on_recv(CONN, tail);
    let messages = BundleCodec::new().decode(&out).unwrap().messages;
    let lock = ActionEffect::parse(messages[0].ipc_body()).unwrap().animation_lock;
    assert_close(lock, 0.675);
}

#[test]
fn test_connection_gone_returns_partial_bundle() {
    let session = Session::new(|_| {});
    let input = Session::bundle(&[Session::request(1, 1)]);
    let cut = input.len() - 1;
    assert!(session.interceptor.on_send(CONN, &input[..cut]).is_empty());

    let (send, recv) = session.interceptor.on_connection_gone(CONN).unwrap();
    assert_eq!(send, &input[..cut]);
    assert!(recv.is_empty());
    // later traffic on the dead id is passed straight through
    assert_eq!(session.interceptor.on_send(CONN, &input), input);
}
