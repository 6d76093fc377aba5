//! Animation lock latency mitigation.
//!
//! The client refuses new actions until the animation lock reported by the
//! server has elapsed, and it starts counting only once the response
//! arrives. On a high-latency connection the lock therefore lasts the
//! reported duration plus a full round trip. The mitigator tracks in-flight
//! action requests per connection and rewrites the lock duration in
//! responses so the next action becomes usable when the server would accept
//! it.
//!
//! Requests and responses are matched by sequence number on a FIFO queue.
//! Anything that does not line up is logged and forwarded untouched.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{Config, ConfigProvider, MitigationConfig, MitigationMode};
use crate::core::message::{
    cooldown_units_to_us, ActionEffect, ActionRequest, ActorCast, ActorControl, ActorControlSelf,
    MessageType, TimingHint,
};
use crate::protocol::pipeline::{Direction, HandlerContext, MessagePipeline, OwnerId, Subscription};
use crate::protocol::state::{ConnectionState, PendingAction, QueueMatch};
use crate::utils::metrics::Metrics;
use crate::utils::time::{seconds_to_us, us_to_seconds};

/// Latency mitigation handlers, shared by every connection.
///
/// All per-connection data lives in [`ConnectionState`]; this type only holds
/// the configuration source and metrics.
#[derive(Debug)]
pub struct LatencyMitigator {
    config: Arc<ConfigProvider>,
    metrics: Arc<Metrics>,
}

impl LatencyMitigator {
    pub fn new(config: Arc<ConfigProvider>, metrics: Arc<Metrics>) -> Self {
        Self { config, metrics }
    }

    /// Register the inbound and outbound handlers on `pipeline`.
    ///
    /// Dropping the returned subscriptions detaches the mitigator.
    pub fn attach(self: &Arc<Self>, pipeline: &MessagePipeline, owner: OwnerId) -> Vec<Subscription> {
        let outbound = Arc::clone(self);
        let inbound = Arc::clone(self);
        vec![
            pipeline.register(owner, Direction::Outbound, move |ctx: &mut HandlerContext<'_>| {
                outbound.on_outbound(ctx)
            }),
            pipeline.register(owner, Direction::Inbound, move |ctx: &mut HandlerContext<'_>| {
                inbound.on_inbound(ctx)
            }),
        ]
    }

    /// Observe a client-to-server message.
    pub fn on_outbound(&self, ctx: &mut HandlerContext<'_>) {
        let config = self.config.current();
        let opcodes = &config.opcodes;

        let Some(ipc) = ctx.message().ipc_header() else {
            return;
        };
        if ipc.ipc_type != opcodes.ipc_type_interested
            || ipc.subtype == 0
            || !opcodes.c2s_action_request.contains(&ipc.subtype)
        {
            return;
        }
        let Some(request) = ActionRequest::parse(ctx.message().ipc_body()) else {
            debug!(subtype = ipc.subtype, "Action request too short, ignored");
            return;
        };

        let now = ctx.now_us();
        let mitigation = &config.mitigation;
        let state = ctx.state();
        state.push_pending(PendingAction::new(
            request.action_id,
            u32::from(request.sequence),
            now,
        ));

        let delay_us = state.last_animation_lock_ends_at().map(|end| now - end);
        match (state.last_animation_lock_ends_at(), delay_us) {
            (Some(end), Some(delay)) if delay < 0 => {
                if mitigation.use_early_penalty {
                    // the next action may not start before the early amount has passed again
                    state.set_last_animation_lock_ends_at(end - delay);
                    state.early_requests().add_value(-delay);
                }
            }
            _ => {
                if state.pending_len() == 1 {
                    state.set_last_animation_lock_ends_at(now);
                }
            }
        }

        if mitigation.verbose_logging {
            let prev_relative_us = state
                .latest_successful_request()
                .map(|latest| now - latest.request_us);
            info!(
                connection = %state.id(),
                subtype = ipc.subtype,
                action_id = request.action_id,
                sequence = request.sequence,
                delay_us,
                prev_relative_us,
                "C2S action request"
            );
        }
    }

    /// Observe and possibly rewrite a server-to-client message.
    pub fn on_inbound(&self, ctx: &mut HandlerContext<'_>) {
        let config = self.config.current();
        let opcodes = &config.opcodes;

        let Some(ipc) = ctx.message().ipc_header() else {
            return;
        };

        if ipc.ipc_type == opcodes.ipc_type_custom {
            if ipc.subtype == opcodes.custom_original_wait_time {
                if let Some(hint) = TimingHint::parse(ctx.message().ipc_body()) {
                    ctx.state().stash_hint(
                        u32::from(hint.source_sequence),
                        seconds_to_us(hint.original_wait_time),
                    );
                }
            }
            // custom payloads are never relayed to the client
            ctx.veto();
            return;
        }

        if ipc.ipc_type != opcodes.ipc_type_interested
            || ipc.subtype == 0
            || ctx.message().current_actor() != ctx.message().source_actor()
        {
            return;
        }

        if opcodes.s2c_action_effects.contains(&ipc.subtype) {
            self.on_action_effect(ctx, &config, ipc.subtype);
        } else if ipc.subtype == opcodes.s2c_actor_control_self {
            self.on_actor_control_self(ctx, &config);
        } else if ipc.subtype == opcodes.s2c_actor_control {
            self.on_actor_control(ctx, &config);
        } else if ipc.subtype == opcodes.s2c_actor_cast {
            self.on_actor_cast(ctx, &config);
        }
    }

    fn on_action_effect(&self, ctx: &mut HandlerContext<'_>, config: &Config, subtype: u16) {
        let Some(effect) = ActionEffect::parse(ctx.message().ipc_body()) else {
            debug!(subtype, "Action effect too short, ignored");
            return;
        };
        let mitigation = &config.mitigation;
        let now = ctx.now_us();
        let state = ctx.state();
        let connection = state.id();
        let source_sequence = u32::from(effect.source_sequence);

        let original_wait_us = state
            .take_hint(source_sequence)
            .unwrap_or_else(|| seconds_to_us(effect.animation_lock));
        let mut wait_us = original_wait_us;
        let mut rtt_us = None;

        if source_sequence == 0 {
            // server-originated (auto-attack): splice onto the current lock chain
            let latest = state.latest_successful_request().copied();
            let last_end = state.last_animation_lock_ends_at();
            if let (Some(latest), Some(last_end)) = (latest, last_end) {
                if !latest.cast_flag && latest.sequence != 0 && last_end > now {
                    let shifted = last_end + (original_wait_us + now)
                        - (latest.original_wait_us + latest.response_us);
                    let end = shifted.max(now + mitigation.auto_attack_delay_us());
                    if let Some(latest) = state.latest_successful_request_mut() {
                        latest.action_id = effect.action_id;
                        latest.sequence = 0;
                    }
                    state.set_last_animation_lock_ends_at(end);
                    wait_us = end - now;
                }
            }
        } else {
            let matched = state.take_pending_until(|action| action.sequence == source_sequence);
            log_skipped(state, &matched);

            let Some(mut action) = matched.found else {
                self.metrics.sequence_mismatch();
                warn!(
                    connection = %connection,
                    subtype,
                    action_id = effect.action_id,
                    source_sequence,
                    "Action effect matches no pending request; forwarding unmodified"
                );
                state.set_last_animation_lock_ends_at(now + original_wait_us);
                return;
            };

            action.response_us = now;
            action.original_wait_us = original_wait_us;
            state.set_latest_successful_request(action);

            // the lock after a cast is left alone
            if !action.cast_flag {
                let rtt = now - action.request_us;
                state.rtt().add_value(rtt);
                rtt_us = Some(rtt);
                let last_end = state.last_animation_lock_ends_at().unwrap_or(now);
                let end =
                    resolve_next_lock_end(state, mitigation, last_end, now, original_wait_us, rtt);
                state.set_last_animation_lock_ends_at(end);
                wait_us = end - now;
            }
        }

        // never more than twice the original lock
        wait_us = wait_us.min(original_wait_us * 2);
        state.set_last_animation_lock_ends_at(now + wait_us);

        let rewritten = us_to_seconds(wait_us.max(0));
        let changed = rewritten.to_bits() != effect.animation_lock.to_bits();

        if mitigation.verbose_logging {
            info!(
                connection = %connection,
                subtype,
                action_id = effect.action_id,
                source_sequence,
                server_originated = (source_sequence == 0),
                rtt_us,
                original_wait_us,
                wait_us,
                mode = mitigation.mode.name(),
                preview = mitigation.preview_mode,
                "S2C action effect"
            );
        }
        if wait_us < 0 {
            debug!(connection = %connection, wait_us, "Ping or jitter too high, lock cleared");
        }

        if changed && !mitigation.preview_mode {
            if ActionEffect::write_animation_lock(ctx.message_mut().ipc_body_mut(), rewritten) {
                self.metrics.message_rewritten();
            }
        }
    }

    fn on_actor_control_self(&self, ctx: &mut HandlerContext<'_>, config: &Config) {
        let Some(control) = ActorControlSelf::parse(ctx.message().ipc_body()) else {
            return;
        };
        let opcodes = &config.opcodes;
        let verbose = config.mitigation.verbose_logging;
        let now = ctx.now_us();
        let state = ctx.state();

        if control.category == opcodes.actor_control_self_cooldown {
            let (group, action_id, duration) = control.cooldown();
            if let Some(front) = state.pending_front() {
                if front.action_id == action_id && verbose {
                    info!(
                        connection = %state.id(),
                        action_id,
                        group,
                        cooldown_us = cooldown_units_to_us(duration),
                        registration_delay_us = now - front.request_us,
                        "S2C cooldown"
                    );
                }
            }
        } else if control.category == opcodes.actor_control_self_action_rejected {
            let action_id = control.rejected_action_id();
            let source_sequence = control.rejected_source_sequence();
            // the sequence is sometimes missing; fall back to the action id
            let matched = state.take_pending_until(|action| {
                if source_sequence != 0 {
                    action.sequence == source_sequence
                } else {
                    action.action_id == action_id
                }
            });
            log_skipped(state, &matched);
            if matched.found.is_none() {
                debug!(connection = %state.id(), action_id, source_sequence, "Rejected action was not pending");
            }
            if verbose {
                info!(connection = %state.id(), action_id, source_sequence, "S2C action rejected");
            }
        }
    }

    fn on_actor_control(&self, ctx: &mut HandlerContext<'_>, config: &Config) {
        let Some(control) = ActorControl::parse(ctx.message().ipc_body()) else {
            return;
        };
        if control.category != config.opcodes.actor_control_cancel_cast {
            return;
        }

        let action_id = control.cancelled_action_id();
        let state = ctx.state();
        let matched = state.take_pending_until(|action| action.action_id == action_id);
        log_skipped(state, &matched);
        if config.mitigation.verbose_logging {
            info!(connection = %state.id(), action_id, "S2C cast cancelled");
        }
    }

    fn on_actor_cast(&self, ctx: &mut HandlerContext<'_>, config: &Config) {
        let Some(cast) = ActorCast::parse(ctx.message().ipc_body()) else {
            return;
        };
        let state = ctx.state();
        // the client blocks further requests while casting, so the front entry is the cast
        if let Some(front) = state.pending_front_mut() {
            front.cast_flag = true;
        }
        if config.mitigation.verbose_logging {
            info!(
                connection = %state.id(),
                action_id = cast.action_id,
                cast_time = cast.cast_time,
                target_id = cast.target_id,
                "S2C actor cast"
            );
        }
    }
}

fn log_skipped(state: &ConnectionState, matched: &QueueMatch) {
    for skipped in &matched.skipped {
        debug!(
            connection = %state.id(),
            action_id = skipped.action_id,
            sequence = skipped.sequence,
            "Action request ignored for processing"
        );
    }
}

/// Next lock end after a confirmed request.
///
/// Without a latency sample the new lock is chained onto the previous one:
/// original wait plus a constant extra delay that stands in for the server's
/// own processing time.
fn resolve_next_lock_end(
    state: &mut ConnectionState,
    mitigation: &MitigationConfig,
    last_end_us: i64,
    now_us: i64,
    original_wait_us: i64,
    rtt_us: i64,
) -> i64 {
    let chained = last_end_us + original_wait_us + mitigation.extra_delay_us();
    let Some(latency_us) = corrected_latency(state, rtt_us) else {
        return chained;
    };

    match mitigation.mode {
        MitigationMode::SimulateRtt => chained,
        MitigationMode::SubtractLatency => now_us + original_wait_us - latency_us,
        MitigationMode::SimulateNormalizedRttAndLatency => {
            if rtt_us > 100 && latency_us < 5_000 {
                warn!(
                    connection = %state.id(),
                    rtt_us,
                    latency_us,
                    "Latency implausibly low for the observed round trip; another tool may be rewriting it"
                );
            }
            match normalized_extra_delay(state, mitigation, latency_us, rtt_us) {
                Some(delay) => last_end_us + original_wait_us + delay,
                None => chained,
            }
        }
    }
}

/// Latest latency sample, less the median amount by which samples have
/// exceeded the round trip.
///
/// `None` while no latency sample is available.
fn corrected_latency(state: &mut ConnectionState, rtt_us: i64) -> Option<i64> {
    let tracker = state.server_response_delay();
    let latency_us = tracker.latest();
    if latency_us == tracker.invalid_value() {
        return None;
    }

    if latency_us > rtt_us {
        state.exaggerated_latency().add_value(latency_us - rtt_us);
    }
    let exaggeration = state.exaggerated_latency();
    let (median, invalid) = (exaggeration.median(0), exaggeration.invalid_value());
    if median != invalid && latency_us >= median {
        debug!(
            connection = %state.id(),
            latency_us,
            corrected_us = latency_us - median,
            "Latency exceeds round trip, corrected"
        );
        return Some(latency_us - median);
    }
    Some(latency_us)
}

/// Extra delay derived from round-trip and latency statistics.
///
/// `None` while the round-trip tracker is empty.
fn normalized_extra_delay(
    state: &mut ConnectionState,
    mitigation: &MitigationConfig,
    latency_us: i64,
    rtt_us: i64,
) -> Option<i64> {
    let (latency_mean, latency_deviation) = state.server_response_delay().mean_and_deviation(0);

    let rtt_tracker = state.rtt();
    let rtt_min = rtt_tracker.min(0);
    let (rtt_mean, rtt_deviation) = rtt_tracker.mean_and_deviation(0);
    if rtt_min == rtt_tracker.invalid_value() {
        return None;
    }

    // damp outliers
    let latency_adjusted_immediate = latency_us.clamp(
        latency_mean - latency_deviation,
        latency_mean + latency_deviation,
    );
    let rtt_adjusted = rtt_us.clamp(rtt_mean - rtt_deviation, rtt_mean + rtt_deviation);

    let latency_estimate = (rtt_adjusted + rtt_min + rtt_mean) / 3 - rtt_deviation;
    let latency_adjusted = latency_estimate.max(latency_adjusted_immediate);

    let early_penalty = if mitigation.use_early_penalty {
        state.early_requests().max(0)
    } else {
        0
    };

    let delay = rtt_adjusted + mitigation.base_latency_penalty_us() + early_penalty;
    Some((delay - latency_adjusted).clamp(0, mitigation.maximum_extra_delay_us()))
}

/// Samples network latency from keep-alive round trips.
#[derive(Debug)]
pub struct KeepAliveSampler {
    config: Arc<ConfigProvider>,
}

impl KeepAliveSampler {
    pub fn new(config: Arc<ConfigProvider>) -> Self {
        Self { config }
    }

    pub fn attach(self: &Arc<Self>, pipeline: &MessagePipeline, owner: OwnerId) -> Vec<Subscription> {
        [Direction::Outbound, Direction::Inbound]
            .into_iter()
            .map(|direction| {
                let sampler = Arc::clone(self);
                pipeline.register(owner, direction, move |ctx: &mut HandlerContext<'_>| {
                    sampler.observe(ctx)
                })
            })
            .collect()
    }

    pub fn observe(&self, ctx: &mut HandlerContext<'_>) {
        let now = ctx.now_us();
        match (ctx.direction(), ctx.message().message_type()) {
            (Direction::Outbound, MessageType::ClientKeepAlive) => {
                ctx.state().record_keepalive_request(now);
            }
            (Direction::Inbound, MessageType::ServerKeepAlive) => {
                let max_wait = self.config.current().mitigation.keepalive_max_wait_us();
                let state = ctx.state();
                if let Some(delay_us) = state.record_keepalive_response(now, max_wait) {
                    debug!(connection = %state.id(), delay_us, "Keep-alive latency");
                }
            }
            _ => {}
        }
    }
}
