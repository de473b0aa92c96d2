//! System endpoint wire format: frame header, property codec, endianness.
//!
//! Frame layout on the wire, in transmission order:
//!
//! ```text
//! | command_id: u8 | command_seq: u8 | length: u8 | payload: length bytes |
//! ```
//!
//! `PROP_*` payloads begin with a little-endian `property_id` (4 bytes)
//! followed by the property value. All multi-byte protocol scalars are
//! little-endian on the wire; this module is the only place that cares.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Per-command sequence number. Wraps mod 256; identity within the
/// Command Table, not pointer identity (see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CommandSeq(pub u8);

impl std::fmt::Display for CommandSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically incrementing, wrapping allocator for [`CommandSeq`]s.
#[derive(Debug, Default)]
pub struct SeqCounter(u8);

impl SeqCounter {
    pub fn next(&mut self) -> CommandSeq {
        let seq = CommandSeq(self.0);
        self.0 = self.0.wrapping_add(1);
        seq
    }
}

/// A 32-bit property identifier, transmitted little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyId(pub u32);

impl PropertyId {
    /// Unsolicited status stream property.
    pub const LAST_STATUS: PropertyId = PropertyId(0);

    /// Base of the contiguous `ENDPOINT_STATE_0..ENDPOINT_STATE_255` range.
    ///
    /// No literal wire value is pinned down elsewhere (it only ever
    /// appears as `ENDPOINT_STATE_0 + endpoint_id`); chosen far
    /// from `LAST_STATUS` with headroom for the full `u8` endpoint range.
    pub const ENDPOINT_STATE_0: u32 = 0x9000_0000;

    /// Build the `ENDPOINT_STATE_<id>` property id for a given endpoint.
    pub fn endpoint_state(endpoint_id: u8) -> PropertyId {
        PropertyId(Self::ENDPOINT_STATE_0 + endpoint_id as u32)
    }

    /// If this id falls in `ENDPOINT_STATE_0..=ENDPOINT_STATE_255`, the
    /// endpoint id it encodes in its low byte.
    pub fn as_endpoint_id(self) -> Option<u8> {
        let offset = self.0.checked_sub(Self::ENDPOINT_STATE_0)?;
        u8::try_from(offset).ok()
    }
}

/// System status, transmitted little-endian as a 32-bit value.
///
/// `InProgress` is an internal marker meaning "at least one retry has
/// occurred" and is never a terminal status in the C source; this
/// reimplementation still surfaces it verbatim to the final-arrival
/// callback when that is what `error_status` held at the time (see
/// DESIGN.md's resolution of the "final arrival after retry" open
/// question).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemStatus {
    Ok,
    Failure,
    InProgress,
    Timeout,
    /// A status value this implementation doesn't have a name for.
    Other(u32),
}

impl SystemStatus {
    const WIRE_OK: u32 = 0;
    const WIRE_FAILURE: u32 = 1;
    const WIRE_IN_PROGRESS: u32 = 2;
    const WIRE_TIMEOUT: u32 = 3;

    pub fn from_wire(value: u32) -> Self {
        match value {
            Self::WIRE_OK => SystemStatus::Ok,
            Self::WIRE_FAILURE => SystemStatus::Failure,
            Self::WIRE_IN_PROGRESS => SystemStatus::InProgress,
            Self::WIRE_TIMEOUT => SystemStatus::Timeout,
            other => SystemStatus::Other(other),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            SystemStatus::Ok => Self::WIRE_OK,
            SystemStatus::Failure => Self::WIRE_FAILURE,
            SystemStatus::InProgress => Self::WIRE_IN_PROGRESS,
            SystemStatus::Timeout => Self::WIRE_TIMEOUT,
            SystemStatus::Other(v) => v,
        }
    }
}

/// The five system-endpoint command ids that appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCommandId {
    Noop,
    Reset,
    PropertyGet,
    PropertySet,
    PropertyIs,
}

impl SystemCommandId {
    pub const WIRE_NOOP: u8 = 0x00;
    pub const WIRE_RESET: u8 = 0x01;
    pub const WIRE_PROPERTY_GET: u8 = 0x02;
    pub const WIRE_PROPERTY_SET: u8 = 0x03;
    pub const WIRE_PROPERTY_IS: u8 = 0x06;

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            Self::WIRE_NOOP => Some(Self::Noop),
            Self::WIRE_RESET => Some(Self::Reset),
            Self::WIRE_PROPERTY_GET => Some(Self::PropertyGet),
            Self::WIRE_PROPERTY_SET => Some(Self::PropertySet),
            Self::WIRE_PROPERTY_IS => Some(Self::PropertyIs),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Noop => Self::WIRE_NOOP,
            Self::Reset => Self::WIRE_RESET,
            Self::PropertyGet => Self::WIRE_PROPERTY_GET,
            Self::PropertySet => Self::WIRE_PROPERTY_SET,
            Self::PropertyIs => Self::WIRE_PROPERTY_IS,
        }
    }
}

/// Raw 3-byte frame header (mirrors `sl_cpc_system_cmd_t` minus payload).
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct RawHeader {
    command_id: u8,
    command_seq: u8,
    length: u8,
}

/// A parsed frame, borrowing its payload from the buffer it was decoded
/// from (avoids a copy on the final/uframe hot path).
#[derive(Debug, Clone, Copy)]
pub struct SystemFrame<'a> {
    pub command_id: u8,
    pub seq: CommandSeq,
    pub payload: &'a [u8],
}

/// Frame is malformed in a way that indicates a bug in one of the two
/// paired peers: the `length` byte disagrees with the buffer, or (for
/// command-specific decodes) the payload is too short for its declared
/// shape. Fatal, not a recoverable `Result`.
fn fatal_protocol(msg: impl std::fmt::Display) -> ! {
    tracing::error!("protocol violation: {msg}");
    panic!("cpc-system: protocol violation: {msg}");
}

/// Encode a NOOP frame: `{NOOP, seq, 0, []}`.
pub fn encode_noop(seq: CommandSeq) -> Vec<u8> {
    vec![SystemCommandId::WIRE_NOOP, seq.0, 0]
}

/// Encode a RESET frame: `{RESET, seq, 0, []}`.
pub fn encode_reset(seq: CommandSeq) -> Vec<u8> {
    vec![SystemCommandId::WIRE_RESET, seq.0, 0]
}

/// Encode a PROP_VALUE_GET frame. Payload is the little-endian `prop_id`.
pub fn encode_prop_get(seq: CommandSeq, prop_id: PropertyId) -> Vec<u8> {
    let mut frame = vec![SystemCommandId::WIRE_PROPERTY_GET, seq.0, 4];
    frame.extend_from_slice(&prop_id.0.to_le_bytes());
    frame
}

/// Encode a PROP_VALUE_SET frame. Payload is the little-endian `prop_id`
/// followed by `value`, endianness-swapped per the policy below.
///
/// # Panics
///
/// Panics (fatal) if `value` is empty.
pub fn encode_prop_set(seq: CommandSeq, prop_id: PropertyId, value: &[u8]) -> Vec<u8> {
    if value.is_empty() {
        fatal_protocol("property-set request with value of length 0");
    }

    let length = 4usize + value.len();
    let length: u8 = length
        .try_into()
        .unwrap_or_else(|_| fatal_protocol(format!("property-set value too long ({length} bytes)")));

    let mut frame = vec![SystemCommandId::WIRE_PROPERTY_SET, seq.0, length];
    frame.extend_from_slice(&prop_id.0.to_le_bytes());
    frame.extend_from_slice(&swap_to_wire_endianness(value));
    frame
}

/// Endianness policy for a property-set value: if `len(value)` is 2, 4, or
/// 8, the caller is assumed to have supplied a host-endian scalar of that
/// width, which is byte-swapped to little-endian. Any other length
/// (including 1) is copied verbatim.
fn swap_to_wire_endianness(value: &[u8]) -> Vec<u8> {
    match value.len() {
        2 => {
            let v = u16::from_ne_bytes(value.try_into().unwrap());
            v.to_le_bytes().to_vec()
        }
        4 => {
            let v = u32::from_ne_bytes(value.try_into().unwrap());
            v.to_le_bytes().to_vec()
        }
        8 => {
            let v = u64::from_ne_bytes(value.try_into().unwrap());
            v.to_le_bytes().to_vec()
        }
        _ => value.to_vec(),
    }
}

/// Decode a final (or uframe) frame. `length == bytes.len() - 3` is a
/// protocol invariant; violation is fatal.
pub fn decode_frame(bytes: &[u8]) -> SystemFrame<'_> {
    let (header, rest) = RawHeader::ref_from_prefix(bytes)
        .unwrap_or_else(|_| fatal_protocol(format!("frame shorter than header ({} bytes)", bytes.len())));

    if rest.len() != header.length as usize {
        fatal_protocol(format!(
            "length field {} does not match payload of {} bytes",
            header.length,
            rest.len()
        ));
    }

    SystemFrame {
        command_id: header.command_id,
        seq: CommandSeq(header.command_seq),
        payload: rest,
    }
}

/// Decode a PROP_* payload into `(property_id, value)`.
pub fn decode_property_payload(payload: &[u8]) -> (PropertyId, &[u8]) {
    if payload.len() < 4 {
        fatal_protocol(format!(
            "property payload shorter than a property id ({} bytes)",
            payload.len()
        ));
    }
    let prop_id = u32::from_le_bytes(payload[..4].try_into().unwrap());
    (PropertyId(prop_id), &payload[4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_roundtrip() {
        let frame = encode_noop(CommandSeq(0));
        assert_eq!(frame, vec![0x00, 0x00, 0x00]);
        let decoded = decode_frame(&frame);
        assert_eq!(decoded.command_id, SystemCommandId::WIRE_NOOP);
        assert_eq!(decoded.seq, CommandSeq(0));
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn property_get_wire_bytes_match_scenario_4() {
        let frame = encode_prop_get(CommandSeq(3), PropertyId(0x0000_000B));
        assert_eq!(frame, vec![0x02, 0x03, 0x04, 0x0B, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn property_is_final_decodes_scenario_4() {
        let bytes = [0x06, 0x03, 0x08, 0x0B, 0x00, 0x00, 0x00, 0x2A, 0x00, 0x00, 0x00];
        let frame = decode_frame(&bytes);
        assert_eq!(frame.command_id, SystemCommandId::WIRE_PROPERTY_IS);
        assert_eq!(frame.seq, CommandSeq(3));
        let (prop_id, value) = decode_property_payload(frame.payload);
        assert_eq!(prop_id, PropertyId(0x0000_000B));
        assert_eq!(value, &[0x2A, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn property_set_swaps_2_4_8_byte_scalars_to_le() {
        let seq = CommandSeq(9);
        let prop = PropertyId(1);

        let frame16 = encode_prop_set(seq, prop, &0x1234u16.to_ne_bytes());
        assert_eq!(&frame16[7..], &0x1234u16.to_le_bytes());

        let frame32 = encode_prop_set(seq, prop, &0xDEAD_BEEFu32.to_ne_bytes());
        assert_eq!(&frame32[7..], &0xDEAD_BEEFu32.to_le_bytes());

        let frame64 = encode_prop_set(seq, prop, &0x0123_4567_89AB_CDEFu64.to_ne_bytes());
        assert_eq!(&frame64[7..], &0x0123_4567_89AB_CDEFu64.to_le_bytes());
    }

    #[test]
    fn property_set_copies_1_byte_value_verbatim() {
        let frame = encode_prop_set(CommandSeq(0), PropertyId(0), &[0xAB]);
        assert_eq!(&frame[7..], &[0xAB]);
    }

    #[test]
    #[should_panic(expected = "value of length 0")]
    fn property_set_rejects_empty_value() {
        encode_prop_set(CommandSeq(0), PropertyId(0), &[]);
    }

    #[test]
    #[should_panic(expected = "length field")]
    fn decode_rejects_length_mismatch() {
        decode_frame(&[0x00, 0x00, 0x05, 0x01, 0x02]);
    }

    #[test]
    fn last_status_uframe_decodes_scenario_5() {
        let bytes = [0x06, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x11, 0x00, 0x00, 0x00];
        let frame = decode_frame(&bytes);
        let (prop_id, value) = decode_property_payload(frame.payload);
        assert_eq!(prop_id, PropertyId::LAST_STATUS);
        assert_eq!(u32::from_le_bytes(value.try_into().unwrap()), 0x11);
    }

    #[test]
    fn endpoint_state_property_id_roundtrips() {
        let prop = PropertyId::endpoint_state(5);
        assert_eq!(prop.as_endpoint_id(), Some(5));
        assert_eq!(PropertyId::LAST_STATUS.as_endpoint_id(), None);
    }
}
