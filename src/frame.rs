//! CAN message representation and its packed wire form.
//!
//! A frame travels through `read`/`write` as a 5-byte header followed by the
//! payload: a little-endian id word, then one byte packing the DLC with the
//! RTR/EXTID/ERROR flags. The DLC-to-byte-count coding follows classic CAN,
//! or the CAN FD long-frame table when the `can-fd` feature is on. Frames are
//! self-delimiting, so a buffer can carry several back to back.

use byteorder::{ByteOrder, LittleEndian};
use embedded_can::{Frame, Id, StandardId};

#[cfg(feature = "extid")]
use embedded_can::ExtendedId;

use crate::error::Error;
#[cfg(feature = "errors")]
use crate::error::ErrorFlags;

/// Largest payload a single frame can carry.
#[cfg(feature = "can-fd")]
pub const CAN_MAX_PAYLOAD: usize = 64;
/// Largest payload a single frame can carry.
#[cfg(not(feature = "can-fd"))]
pub const CAN_MAX_PAYLOAD: usize = 8;

/// Packed header size on the wire: the id word plus the DLC/flags byte.
pub const CAN_HDR_LEN: usize = 5;

/// DLC carried by synthesized error frames.
#[cfg(feature = "errors")]
pub const CAN_ERROR_DLC: u8 = 8;

/// Standard id carried by synthesized internal-error frames.
#[cfg(feature = "errors")]
pub const CAN_ERROR_INTERNAL: u16 = 0x400;

/// Byte within an error frame's payload that carries the sticky error byte.
#[cfg(feature = "errors")]
pub const CAN_ERROR_BYTE: usize = 5;

const HDR_DLC_MASK: u8 = 0x0f;
const HDR_RTR: u8 = 1 << 4;
const HDR_EXTID: u8 = 1 << 5;
const HDR_ERROR: u8 = 1 << 6;

/// Total wire length of a frame carrying `nbytes` of payload.
pub const fn msg_len(nbytes: usize) -> usize {
    CAN_HDR_LEN + nbytes
}

/// Payload byte count encoded by a DLC value.
///
/// Codes 0 to 8 map to themselves; 9 to 15 select the CAN FD long data
/// lengths.
#[cfg(feature = "can-fd")]
pub const fn dlc_to_bytes(dlc: u8) -> usize {
    match dlc {
        0..=8 => dlc as usize,
        9 => 12,
        10 => 16,
        11 => 20,
        12 => 24,
        13 => 32,
        14 => 48,
        _ => 64,
    }
}

/// Payload byte count encoded by a DLC value.
///
/// Codes 0 to 8 map to themselves; in classic CAN every larger code still
/// means an 8-byte data field.
#[cfg(not(feature = "can-fd"))]
pub const fn dlc_to_bytes(dlc: u8) -> usize {
    if dlc > 8 {
        8
    } else {
        dlc as usize
    }
}

/// Smallest DLC whose data field holds at least `nbytes`.
#[cfg(feature = "can-fd")]
pub const fn bytes_to_dlc(nbytes: usize) -> u8 {
    match nbytes {
        0..=8 => nbytes as u8,
        9..=12 => 9,
        13..=16 => 10,
        17..=20 => 11,
        21..=24 => 12,
        25..=32 => 13,
        33..=48 => 14,
        _ => 15,
    }
}

/// Smallest DLC whose data field holds at least `nbytes`.
#[cfg(not(feature = "can-fd"))]
pub const fn bytes_to_dlc(nbytes: usize) -> u8 {
    if nbytes > 8 {
        8
    } else {
        nbytes as u8
    }
}

/// Raw numeric value of an id, mostly for log lines.
pub fn id_raw(id: Id) -> u32 {
    match id {
        Id::Standard(sid) => sid.as_raw() as u32,
        Id::Extended(eid) => eid.as_raw(),
    }
}

/// Decoded frame header.
///
/// The standard/extended distinction lives in the [`Id`] variant rather than
/// a separate flag. `error` marks frames synthesized by the driver itself;
/// such frames are never accepted from user buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanHeader {
    pub id: Id,
    pub dlc: u8,
    pub rtr: bool,
    #[cfg(feature = "errors")]
    pub error: bool,
}

impl CanHeader {
    /// Header of a data frame.
    pub fn new(id: impl Into<Id>, dlc: u8) -> Self {
        assert!(dlc <= 15);
        Self {
            id: id.into(),
            dlc,
            rtr: false,
            #[cfg(feature = "errors")]
            error: false,
        }
    }

    /// Header of a remote transmission request. The DLC encodes the
    /// requested data length; the frame itself carries no payload.
    pub fn new_remote(id: impl Into<Id>, dlc: u8) -> Self {
        let mut hdr = Self::new(id, dlc);
        hdr.rtr = true;
        hdr
    }

    /// Payload bytes this header implies on the wire.
    pub fn payload_len(&self) -> usize {
        if self.rtr {
            0
        } else {
            dlc_to_bytes(self.dlc)
        }
    }

    fn is_error(&self) -> bool {
        #[cfg(feature = "errors")]
        {
            self.error
        }
        #[cfg(not(feature = "errors"))]
        {
            false
        }
    }
}

/// One CAN message: header plus payload storage.
///
/// The payload array is fixed-size; the live prefix is `payload_len()` bytes
/// and the remainder stays zeroed, so whole-struct comparison is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    pub header: CanHeader,
    data: [u8; CAN_MAX_PAYLOAD],
}

impl CanFrame {
    pub(crate) const EMPTY: CanFrame = CanFrame {
        header: CanHeader {
            id: Id::Standard(StandardId::ZERO),
            dlc: 0,
            rtr: false,
            #[cfg(feature = "errors")]
            error: false,
        },
        data: [0; CAN_MAX_PAYLOAD],
    };

    /// Build a data frame around `data`.
    ///
    /// The DLC is the smallest code covering `data.len()`; with CAN FD that
    /// can round the data field up, and the extra bytes read back as zero.
    pub fn new(id: impl Into<Id>, data: &[u8]) -> Result<Self, Error> {
        if data.len() > CAN_MAX_PAYLOAD {
            return Err(Error::InvalidInput);
        }
        let mut buf = [0u8; CAN_MAX_PAYLOAD];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            header: CanHeader::new(id, bytes_to_dlc(data.len())),
            data: buf,
        })
    }

    /// Build a remote transmission request soliciting `dlc`-coded data.
    pub fn new_remote(id: impl Into<Id>, dlc: u8) -> Result<Self, Error> {
        if dlc > 15 {
            return Err(Error::InvalidInput);
        }
        Ok(Self {
            header: CanHeader::new_remote(id, dlc),
            data: [0; CAN_MAX_PAYLOAD],
        })
    }

    /// Assemble a frame from a decoded header and raw payload bytes, as
    /// handed up by a receive interrupt.
    pub fn from_parts(header: CanHeader, data: &[u8]) -> Self {
        let mut buf = [0u8; CAN_MAX_PAYLOAD];
        let nbytes = header.payload_len().min(data.len());
        buf[..nbytes].copy_from_slice(&data[..nbytes]);
        Self { header, data: buf }
    }

    /// Live payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.header.payload_len()]
    }

    /// Bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        msg_len(self.header.payload_len())
    }

    /// Pack the frame into `buf`, returning the byte count written.
    ///
    /// Panics if `buf` is shorter than [`Self::wire_len`].
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let nbytes = self.header.payload_len();
        let total = msg_len(nbytes);
        let (raw, ext) = match self.header.id {
            Id::Standard(sid) => (sid.as_raw() as u32, false),
            Id::Extended(eid) => (eid.as_raw(), true),
        };
        LittleEndian::write_u32(&mut buf[0..4], raw);
        let mut flags = self.header.dlc & HDR_DLC_MASK;
        if self.header.rtr {
            flags |= HDR_RTR;
        }
        if ext {
            flags |= HDR_EXTID;
        }
        if self.header.is_error() {
            flags |= HDR_ERROR;
        }
        buf[4] = flags;
        buf[CAN_HDR_LEN..total].copy_from_slice(&self.data[..nbytes]);
        total
    }

    /// Unpack one frame from the head of `buf`.
    ///
    /// This is the user-input path: the ERROR flag is refused (such frames
    /// are driver-synthesized only), extended ids are refused unless
    /// compiled in, and a payload truncated by the end of the buffer is
    /// refused rather than read short.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < CAN_HDR_LEN {
            return Err(Error::InvalidInput);
        }
        let raw = LittleEndian::read_u32(&buf[0..4]);
        let flags = buf[4];
        if flags & HDR_ERROR != 0 {
            return Err(Error::InvalidInput);
        }
        let id = decode_id(raw, flags & HDR_EXTID != 0)?;
        let header = CanHeader {
            id,
            dlc: flags & HDR_DLC_MASK,
            rtr: flags & HDR_RTR != 0,
            #[cfg(feature = "errors")]
            error: false,
        };
        let nbytes = header.payload_len();
        if buf.len() < msg_len(nbytes) {
            return Err(Error::InvalidInput);
        }
        let mut data = [0u8; CAN_MAX_PAYLOAD];
        data[..nbytes].copy_from_slice(&buf[CAN_HDR_LEN..CAN_HDR_LEN + nbytes]);
        Ok(Self { header, data })
    }
}

#[cfg(feature = "extid")]
fn decode_id(raw: u32, ext: bool) -> Result<Id, Error> {
    if ext {
        ExtendedId::new(raw)
            .map(Id::Extended)
            .ok_or(Error::InvalidInput)
    } else {
        u16::try_from(raw)
            .ok()
            .and_then(StandardId::new)
            .map(Id::Standard)
            .ok_or(Error::InvalidInput)
    }
}

#[cfg(not(feature = "extid"))]
fn decode_id(raw: u32, ext: bool) -> Result<Id, Error> {
    if ext {
        return Err(Error::InvalidInput);
    }
    u16::try_from(raw)
        .ok()
        .and_then(StandardId::new)
        .map(Id::Standard)
        .ok_or(Error::InvalidInput)
}

/// Synthesize the internal-error frame a read returns while the sticky
/// error byte is latched.
#[cfg(feature = "errors")]
pub(crate) fn error_frame(flags: ErrorFlags) -> CanFrame {
    let mut data = [0u8; CAN_MAX_PAYLOAD];
    data[CAN_ERROR_BYTE] = flags.bits();
    CanFrame {
        header: CanHeader {
            id: Id::Standard(StandardId::new(CAN_ERROR_INTERNAL).unwrap()),
            dlc: CAN_ERROR_DLC,
            rtr: false,
            error: true,
        },
        data,
    }
}

// Classic-CAN interop; the trait constructors refuse long frames.
impl Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > 8 {
            return None;
        }
        CanFrame::new(id, data).ok()
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > 8 {
            return None;
        }
        CanFrame::new_remote(id, dlc as u8).ok()
    }

    fn is_extended(&self) -> bool {
        matches!(self.header.id, Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        self.header.rtr
    }

    fn id(&self) -> Id {
        self.header.id
    }

    fn dlc(&self) -> usize {
        self.header.dlc as usize
    }

    fn data(&self) -> &[u8] {
        &self.data[..self.header.payload_len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(raw: u16) -> Id {
        Id::Standard(StandardId::new(raw).unwrap())
    }

    #[cfg(feature = "can-fd")]
    #[test]
    fn dlc_codes_round_trip() {
        for dlc in 0..=15u8 {
            assert_eq!(bytes_to_dlc(dlc_to_bytes(dlc)), dlc);
        }
    }

    #[cfg(not(feature = "can-fd"))]
    #[test]
    fn dlc_codes_round_trip_saturating() {
        for dlc in 0..=15u8 {
            assert_eq!(bytes_to_dlc(dlc_to_bytes(dlc)), dlc.min(8));
        }
    }

    #[test]
    fn bytes_round_up_to_covering_dlc() {
        for nbytes in 0..=CAN_MAX_PAYLOAD {
            let dlc = bytes_to_dlc(nbytes);
            assert!(dlc_to_bytes(dlc) >= nbytes, "nbytes={}", nbytes);
        }
    }

    #[cfg(feature = "can-fd")]
    #[test]
    fn fd_long_frame_table() {
        assert_eq!(dlc_to_bytes(9), 12);
        assert_eq!(dlc_to_bytes(13), 32);
        assert_eq!(dlc_to_bytes(15), 64);
        assert_eq!(bytes_to_dlc(33), 14);
    }

    #[cfg(not(feature = "can-fd"))]
    #[test]
    fn classic_dlc_saturates() {
        assert_eq!(dlc_to_bytes(13), 8);
        assert_eq!(bytes_to_dlc(64), 8);
    }

    #[test]
    fn encode_decode_data_frame() {
        let frame = CanFrame::new(sid(0x123), &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 80];
        let len = frame.encode(&mut buf);
        assert_eq!(len, msg_len(3));
        let back = CanFrame::decode(&buf[..len]).unwrap();
        assert_eq!(back, frame);
        assert_eq!(back.data(), &[1, 2, 3]);
    }

    #[test]
    fn remote_frames_carry_no_payload() {
        let frame = CanFrame::new_remote(sid(0x7ff), 4).unwrap();
        assert_eq!(frame.wire_len(), msg_len(0));
        assert_eq!(frame.data(), &[]);
        let mut buf = [0u8; 16];
        let len = frame.encode(&mut buf);
        let back = CanFrame::decode(&buf[..len]).unwrap();
        assert!(back.header.rtr);
        assert_eq!(back.header.dlc, 4);
    }

    #[cfg(feature = "extid")]
    #[test]
    fn extended_id_round_trip() {
        let id = Id::Extended(ExtendedId::new(0x1234_5678).unwrap());
        let frame = CanFrame::new(id, &[0xaa]).unwrap();
        let mut buf = [0u8; 16];
        let len = frame.encode(&mut buf);
        let back = CanFrame::decode(&buf[..len]).unwrap();
        assert_eq!(back.header.id, id);
    }

    #[test]
    fn error_flag_refused_from_user_input() {
        let frame = CanFrame::new(sid(1), &[]).unwrap();
        let mut buf = [0u8; 8];
        let len = frame.encode(&mut buf);
        buf[4] |= 1 << 6;
        assert_eq!(CanFrame::decode(&buf[..len]), Err(Error::InvalidInput));
    }

    #[test]
    fn truncated_payload_refused() {
        let frame = CanFrame::new(sid(1), &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 16];
        let len = frame.encode(&mut buf);
        assert!(CanFrame::decode(&buf[..len - 1]).is_err());
    }

    #[cfg(feature = "errors")]
    #[test]
    fn synthesized_error_frame_layout() {
        let frame = error_frame(ErrorFlags::RX_OVERFLOW);
        assert_eq!(id_raw(frame.header.id), CAN_ERROR_INTERNAL as u32);
        assert_eq!(frame.header.dlc, CAN_ERROR_DLC);
        assert!(frame.header.error);
        assert_eq!(frame.data()[CAN_ERROR_BYTE], ErrorFlags::RX_OVERFLOW.bits());
        assert_eq!(frame.wire_len(), msg_len(CAN_ERROR_DLC as usize));
    }
}
