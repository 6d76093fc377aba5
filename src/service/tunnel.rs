//! Per-direction stream re-framing.
//!
//! Socket buffers do not line up with bundles. A [`StreamTunnel`] keeps the
//! unconsumed tail of the stream, forwards noise as it is found, holds back
//! incomplete bundles, and runs every complete bundle through the pipeline.
//! A bundle nobody changed is forwarded as the exact bytes received, unless
//! its body uses a stateful encoding: the outgoing encoder must then see
//! every bundle so its history matches the receiver's decoder.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{debug, error, warn};

use crate::core::codec::{BundleCodec, BundleFramer, Frame};
use crate::core::message::Message;
use crate::protocol::pipeline::{Direction, MessagePipeline, Verdict};
use crate::protocol::state::ConnectionState;
use crate::utils::compression::CompressionKind;
use crate::utils::metrics::Metrics;

/// One direction of one intercepted connection.
#[derive(Debug)]
pub struct StreamTunnel {
    direction: Direction,
    framer: BundleFramer,
    codec: BundleCodec,
    buffer: BytesMut,
    metrics: Arc<Metrics>,
}

impl StreamTunnel {
    pub fn new(direction: Direction, codec: BundleCodec, metrics: Arc<Metrics>) -> Self {
        Self {
            direction,
            framer: BundleFramer::new(),
            codec,
            buffer: BytesMut::new(),
            metrics,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Bytes held back while waiting for the rest of a bundle.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Feed newly intercepted bytes and collect what may be forwarded now.
    pub fn process(
        &mut self,
        data: &[u8],
        pipeline: &MessagePipeline,
        state: &mut ConnectionState,
    ) -> BytesMut {
        self.buffer.extend_from_slice(data);
        let mut out = BytesMut::with_capacity(data.len());

        loop {
            match self.framer.decode(&mut self.buffer) {
                Ok(Some(Frame::Noise(noise))) => {
                    self.metrics.noise(noise.len() as u64);
                    out.put(noise);
                }
                Ok(Some(Frame::Bundle(bundle))) => {
                    self.process_bundle(bundle, pipeline, state, &mut out);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(direction = ?self.direction, error = %e, "Framer failed; forwarding buffer");
                    out.put(self.buffer.split());
                    break;
                }
            }
        }

        out
    }

    /// Release everything still buffered, unprocessed.
    pub fn flush(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    fn process_bundle(
        &mut self,
        bundle: Bytes,
        pipeline: &MessagePipeline,
        state: &mut ConnectionState,
        out: &mut BytesMut,
    ) {
        let decoded = match self.codec.decode(&bundle) {
            Ok(decoded) => decoded,
            Err(e) => {
                if e.is_compression() {
                    self.metrics.compression_error();
                    error!(connection = %state.id(), direction = ?self.direction, error = %e, "Bundle forwarded unmodified");
                } else {
                    self.metrics.framing_error();
                    warn!(connection = %state.id(), direction = ?self.direction, error = %e, "Bundle forwarded unmodified");
                }
                self.metrics.bundle_passed_through();
                out.put(bundle);
                return;
            }
        };

        let count = decoded.messages.len();
        let mut changed = false;
        let mut forwarded: Vec<Message> = Vec::with_capacity(count);

        for mut message in decoded.messages {
            let now = state.now_us();
            let outcome = pipeline.dispatch(self.direction, &mut message, state, now);
            changed |= outcome.changes_stream();
            match outcome.verdict {
                Verdict::Forward => forwarded.push(message),
                Verdict::Drop => self.metrics.message_dropped(),
            }
            forwarded.extend(outcome.extra);
        }
        self.metrics.bundle_processed(count as u64);

        let stateful = decoded
            .header
            .compression_kind()
            .is_ok_and(CompressionKind::is_stateful);
        if !changed && !stateful {
            out.put(bundle);
            return;
        }

        if changed && forwarded.is_empty() {
            debug!(connection = %state.id(), direction = ?self.direction, "Every message vetoed; bundle dropped");
            return;
        }

        match self.codec.encode(&decoded.header, &forwarded) {
            Ok(encoded) => {
                self.metrics.bundle_reencoded();
                out.put_slice(&encoded);
            }
            Err(e) => {
                self.metrics.bundle_passed_through();
                error!(connection = %state.id(), direction = ?self.direction, error = %e, "Re-encoding failed; original bundle forwarded");
                out.put(bundle);
            }
        }
    }
}
