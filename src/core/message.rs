//! Messages and their opcode-routed payloads.
//!
//! ## Wire Format
//! ```text
//! Message:  [Length(4)] [SourceActor(4)] [CurrentActor(4)] [Type(2)] [Reserved(2)] [Data(N)]
//! Ipc data: [IpcType(2)] [Subtype(2)] [Unknown(2)] [ServerId(2)] [Epoch(4)] [Unknown(4)] [Body(N)]
//! ```
//! The body layouts below are fixed; which subtype carries which layout is
//! build-specific and comes from [`crate::config::OpcodeConfig`].

use bytes::{Buf, BufMut};

use crate::core::bundle::MESSAGE_HEADER_SIZE;
use crate::error::{constants, ProtocolError, Result};

/// Size of the opcode payload header following the message header
pub const IPC_HEADER_SIZE: usize = 16;

/// Offset of the opcode-specific body within a message
pub const IPC_BODY_OFFSET: usize = MESSAGE_HEADER_SIZE + IPC_HEADER_SIZE;

/// Message type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ipc,
    ClientKeepAlive,
    ServerKeepAlive,
    Other(u16),
}

impl MessageType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            3 => MessageType::Ipc,
            7 => MessageType::ClientKeepAlive,
            8 => MessageType::ServerKeepAlive,
            other => MessageType::Other(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            MessageType::Ipc => 3,
            MessageType::ClientKeepAlive => 7,
            MessageType::ServerKeepAlive => 8,
            MessageType::Other(value) => value,
        }
    }
}

/// Opcode payload header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpcHeader {
    pub ipc_type: u16,
    pub subtype: u16,
    pub unknown1: u16,
    pub server_id: u16,
    pub epoch: i32,
    pub unknown2: u32,
}

impl IpcHeader {
    fn write_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_u16_le(self.ipc_type);
        dst.put_u16_le(self.subtype);
        dst.put_u16_le(self.unknown1);
        dst.put_u16_le(self.server_id);
        dst.put_i32_le(self.epoch);
        dst.put_u32_le(self.unknown2);
    }
}

/// One message, owning its bytes.
///
/// The length field always equals the buffer length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    bytes: Vec<u8>,
}

impl Message {
    /// Wrap raw message bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Framing` if the buffer is shorter than a
    /// message header or its length field disagrees with the buffer.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < MESSAGE_HEADER_SIZE {
            return Err(ProtocolError::Framing(
                constants::ERR_TRUNCATED_MESSAGE.to_string(),
            ));
        }
        let declared = read_u32(&bytes, 0).unwrap_or(0) as usize;
        if declared != bytes.len() {
            return Err(ProtocolError::Framing(format!(
                "Message length field {declared} does not match {} bytes",
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    /// Build an opcode-routed message.
    pub fn ipc(source_actor: u32, current_actor: u32, header: IpcHeader, body: &[u8]) -> Self {
        let length = IPC_BODY_OFFSET + body.len();
        let mut bytes = Vec::with_capacity(length);
        bytes.put_u32_le(length as u32);
        bytes.put_u32_le(source_actor);
        bytes.put_u32_le(current_actor);
        bytes.put_u16_le(MessageType::Ipc.to_u16());
        bytes.put_u16_le(0);
        header.write_to(&mut bytes);
        bytes.put_slice(body);
        Self { bytes }
    }

    /// Build a keep-alive message carrying an id and an epoch in seconds.
    pub fn keep_alive(kind: MessageType, source_actor: u32, id: u32, epoch: u32) -> Self {
        let length = MESSAGE_HEADER_SIZE + 8;
        let mut bytes = Vec::with_capacity(length);
        bytes.put_u32_le(length as u32);
        bytes.put_u32_le(source_actor);
        bytes.put_u32_le(source_actor);
        bytes.put_u16_le(kind.to_u16());
        bytes.put_u16_le(0);
        bytes.put_u32_le(id);
        bytes.put_u32_le(epoch);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn source_actor(&self) -> u32 {
        read_u32(&self.bytes, 4).unwrap_or(0)
    }

    pub fn current_actor(&self) -> u32 {
        read_u32(&self.bytes, 8).unwrap_or(0)
    }

    pub fn message_type(&self) -> MessageType {
        MessageType::from_u16(read_u16(&self.bytes, 12).unwrap_or(0))
    }

    /// Opcode payload header, if this is an opcode-routed message.
    pub fn ipc_header(&self) -> Option<IpcHeader> {
        if self.message_type() != MessageType::Ipc || self.bytes.len() < IPC_BODY_OFFSET {
            return None;
        }
        let mut cursor = &self.bytes[MESSAGE_HEADER_SIZE..IPC_BODY_OFFSET];
        Some(IpcHeader {
            ipc_type: cursor.get_u16_le(),
            subtype: cursor.get_u16_le(),
            unknown1: cursor.get_u16_le(),
            server_id: cursor.get_u16_le(),
            epoch: cursor.get_i32_le(),
            unknown2: cursor.get_u32_le(),
        })
    }

    /// Whether this is an opcode-routed message of the given category and subtype.
    ///
    /// A zero subtype is unmapped and never matches.
    pub fn is_ipc(&self, ipc_type: u16, subtype: u16) -> bool {
        self.ipc_header()
            .is_some_and(|h| h.ipc_type == ipc_type && h.subtype == subtype)
    }

    /// Opcode-specific body; empty for non-opcode messages.
    pub fn ipc_body(&self) -> &[u8] {
        match self.message_type() {
            MessageType::Ipc if self.bytes.len() >= IPC_BODY_OFFSET => {
                &self.bytes[IPC_BODY_OFFSET..]
            }
            _ => &[],
        }
    }

    pub fn ipc_body_mut(&mut self) -> &mut [u8] {
        match self.message_type() {
            MessageType::Ipc if self.bytes.len() >= IPC_BODY_OFFSET => {
                &mut self.bytes[IPC_BODY_OFFSET..]
            }
            _ => &mut [],
        }
    }
}

#[inline]
fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    buf.get(offset..offset + 2)
        .map(|mut bytes| bytes.get_u16_le())
}

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    buf.get(offset..offset + 4)
        .map(|mut bytes| bytes.get_u32_le())
}

#[inline]
fn read_i32(buf: &[u8], offset: usize) -> Option<i32> {
    buf.get(offset..offset + 4)
        .map(|mut bytes| bytes.get_i32_le())
}

#[inline]
fn read_f32(buf: &[u8], offset: usize) -> Option<f32> {
    buf.get(offset..offset + 4)
        .map(|mut bytes| bytes.get_f32_le())
}

/// Client request to use an action.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionRequest {
    pub action_id: u32,
    pub sequence: u16,
}

impl ActionRequest {
    pub const SIZE: usize = 32;

    pub fn parse(body: &[u8]) -> Option<Self> {
        Some(Self {
            action_id: read_u32(body, 4)?,
            sequence: read_u16(body, 8)?,
        })
    }

    pub fn to_body(&self) -> Vec<u8> {
        let mut body = vec![0u8; Self::SIZE];
        body[4..8].copy_from_slice(&self.action_id.to_le_bytes());
        body[8..10].copy_from_slice(&self.sequence.to_le_bytes());
        body
    }
}

/// Server notice that an action took effect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionEffect {
    pub action_id: u32,
    /// Seconds the client must wait before the next action
    pub animation_lock: f32,
    /// Sequence of the originating request; `0` if the server initiated it
    pub source_sequence: u16,
}

impl ActionEffect {
    pub const SIZE: usize = 32;
    const ANIMATION_LOCK_OFFSET: usize = 16;

    pub fn parse(body: &[u8]) -> Option<Self> {
        Some(Self {
            action_id: read_u32(body, 8)?,
            animation_lock: read_f32(body, Self::ANIMATION_LOCK_OFFSET)?,
            source_sequence: read_u16(body, 24)?,
        })
    }

    /// Overwrite the animation lock field in place.
    ///
    /// Returns `false` if the body is too short to hold it.
    pub fn write_animation_lock(body: &mut [u8], seconds: f32) -> bool {
        match body.get_mut(Self::ANIMATION_LOCK_OFFSET..Self::ANIMATION_LOCK_OFFSET + 4) {
            Some(field) => {
                field.copy_from_slice(&seconds.to_le_bytes());
                true
            }
            None => false,
        }
    }

    pub fn to_body(&self) -> Vec<u8> {
        let mut body = vec![0u8; Self::SIZE];
        body[8..12].copy_from_slice(&self.action_id.to_le_bytes());
        body[16..20].copy_from_slice(&self.animation_lock.to_le_bytes());
        body[24..26].copy_from_slice(&self.source_sequence.to_le_bytes());
        body
    }
}

/// Generic actor control notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorControl {
    pub category: u16,
    pub params: [u32; 4],
}

impl ActorControl {
    pub const SIZE: usize = 24;

    pub fn parse(body: &[u8]) -> Option<Self> {
        Some(Self {
            category: read_u16(body, 0)?,
            params: [
                read_u32(body, 4)?,
                read_u32(body, 8)?,
                read_u32(body, 12)?,
                read_u32(body, 16)?,
            ],
        })
    }

    /// Action whose cast was cancelled, for the cancel-cast category.
    pub fn cancelled_action_id(&self) -> u32 {
        self.params[2]
    }

    pub fn to_body(&self) -> Vec<u8> {
        let mut body = vec![0u8; Self::SIZE];
        body[0..2].copy_from_slice(&self.category.to_le_bytes());
        for (i, param) in self.params.iter().enumerate() {
            let at = 4 + i * 4;
            body[at..at + 4].copy_from_slice(&param.to_le_bytes());
        }
        body
    }
}

/// Actor control notice addressed to the local player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorControlSelf {
    pub category: u16,
    pub params: [u32; 6],
}

impl ActorControlSelf {
    pub const SIZE: usize = 32;

    pub fn parse(body: &[u8]) -> Option<Self> {
        Some(Self {
            category: read_u16(body, 0)?,
            params: [
                read_u32(body, 4)?,
                read_u32(body, 8)?,
                read_u32(body, 12)?,
                read_u32(body, 16)?,
                read_u32(body, 20)?,
                read_u32(body, 24)?,
            ],
        })
    }

    /// Rejected action, for the action-rejected category.
    pub fn rejected_action_id(&self) -> u32 {
        self.params[2]
    }

    /// Sequence of the rejected request, for the action-rejected category.
    pub fn rejected_source_sequence(&self) -> u32 {
        self.params[5]
    }

    /// `(group, action_id, duration in 10ms units)`, for the cooldown category.
    pub fn cooldown(&self) -> (u32, u32, i32) {
        (self.params[0], self.params[1], self.params[2] as i32)
    }

    pub fn to_body(&self) -> Vec<u8> {
        let mut body = vec![0u8; Self::SIZE];
        body[0..2].copy_from_slice(&self.category.to_le_bytes());
        for (i, param) in self.params.iter().enumerate() {
            let at = 4 + i * 4;
            body[at..at + 4].copy_from_slice(&param.to_le_bytes());
        }
        body
    }
}

/// Notice that an actor started casting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActorCast {
    pub action_id: u16,
    pub cast_time: f32,
    pub target_id: u32,
}

impl ActorCast {
    pub const SIZE: usize = 32;

    pub fn parse(body: &[u8]) -> Option<Self> {
        Some(Self {
            action_id: read_u16(body, 0)?,
            cast_time: read_f32(body, 8)?,
            target_id: read_u32(body, 12)?,
        })
    }

    pub fn to_body(&self) -> Vec<u8> {
        let mut body = vec![0u8; Self::SIZE];
        body[0..2].copy_from_slice(&self.action_id.to_le_bytes());
        body[8..12].copy_from_slice(&self.cast_time.to_le_bytes());
        body[12..16].copy_from_slice(&self.target_id.to_le_bytes());
        body
    }
}

/// Server-side hint carrying the unmodified wait time of a response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingHint {
    pub source_sequence: u16,
    pub original_wait_time: f32,
}

impl TimingHint {
    pub const SIZE: usize = 8;

    pub fn parse(body: &[u8]) -> Option<Self> {
        Some(Self {
            source_sequence: read_u16(body, 0)?,
            original_wait_time: read_f32(body, 4)?,
        })
    }

    pub fn to_body(&self) -> Vec<u8> {
        let mut body = vec![0u8; Self::SIZE];
        body[0..2].copy_from_slice(&self.source_sequence.to_le_bytes());
        body[4..8].copy_from_slice(&self.original_wait_time.to_le_bytes());
        body
    }
}

/// Cooldown duration field in microseconds.
pub fn cooldown_units_to_us(units: i32) -> i64 {
    i64::from(units) * 10_000
}
