//! Wire-level encoding shared by both halves of the bridge.
//!
//! Every frame is one opcode byte followed by one machine word, packed
//! little-endian two's-complement. A handful of opcodes append a payload
//! (raw bytes or further packed words) whose length is derived from the
//! word argument. The word width is negotiated once at startup: the host
//! passes `WORD_SIZE` to the interpreter service on its command line, and
//! both sides must agree for the lifetime of the session.

use strum::IntoStaticStr;

/// Width in bytes of every packed integer on the wire.
pub(crate) const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Bytes occupied by a frame header: opcode byte plus one packed word.
pub(crate) const FRAME_SIZE: usize = 1 + WORD_SIZE;

/// Word sent with the final `Ret` frame to shut the service down.
///
/// Truncates on 32-bit hosts; the service quits on any top-level `Ret`
/// without inspecting the payload, so the exact value is advisory.
pub(crate) const QUIT_SENTINEL: isize = 0xD1E_A112EAD1u64 as isize;

/// Identifier of a value slot in the interpreter-side object table.
///
/// The token is opaque to the host: it is produced by the service, echoed
/// back in later commands, and eventually released with [`Opcode::DelPtr`].
/// The sign carries no meaning on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct RemoteIndex(isize);

impl RemoteIndex {
    /// Creates a remote index from a raw word.
    #[must_use]
    pub fn new(raw: isize) -> Self {
        Self(raw)
    }

    /// Returns the raw word identifier.
    #[must_use]
    pub fn raw(self) -> isize {
        self.0
    }
}

/// Frame opcodes, outbound (host to service) and inbound (service to host).
///
/// The discriminant is the literal byte on the wire. `Ret`, `Exc` and
/// `DelPtr` occur in both directions; `HostCall` only arrives inbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[repr(u8)]
pub(crate) enum Opcode {
    MakeInt = b'I',
    MakeBytes = b'B',
    MakeStr = b'S',
    MakeTuple = b'T',
    MakeGlobal = b'G',
    MakeRemote = b'R',
    Call = b'C',
    Starcall = b'X',
    Lambda = b'L',
    Dup = b'D',
    GetInt = b'i',
    GetBytes = b'b',
    DelPtr = b'~',
    Ret = b'r',
    Exc = b'e',
    HostCall = b'c',
}

impl Opcode {
    /// Decodes a wire byte, returning `None` for anything outside the
    /// protocol.
    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            b'I' => Self::MakeInt,
            b'B' => Self::MakeBytes,
            b'S' => Self::MakeStr,
            b'T' => Self::MakeTuple,
            b'G' => Self::MakeGlobal,
            b'R' => Self::MakeRemote,
            b'C' => Self::Call,
            b'X' => Self::Starcall,
            b'L' => Self::Lambda,
            b'D' => Self::Dup,
            b'i' => Self::GetInt,
            b'b' => Self::GetBytes,
            b'~' => Self::DelPtr,
            b'r' => Self::Ret,
            b'e' => Self::Exc,
            b'c' => Self::HostCall,
            _ => return None,
        })
    }

    /// The byte this opcode occupies on the wire.
    pub(crate) fn byte(self) -> u8 {
        self as u8
    }
}

/// Packs a word little-endian at the negotiated width.
pub(crate) fn pack_word(value: isize) -> [u8; WORD_SIZE] {
    value.to_le_bytes()
}

/// Unpacks a little-endian word at the negotiated width.
pub(crate) fn unpack_word(bytes: [u8; WORD_SIZE]) -> isize {
    isize::from_le_bytes(bytes)
}

/// Builds a complete frame header: opcode byte plus packed word.
pub(crate) fn pack_frame(op: Opcode, arg: isize) -> [u8; FRAME_SIZE] {
    let mut frame = [0u8; FRAME_SIZE];
    frame[0] = op.byte();
    frame[1..].copy_from_slice(&pack_word(arg));
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_round_trip() {
        for value in [0, 1, -1, 42, -42, isize::MAX, isize::MIN, QUIT_SENTINEL] {
            assert_eq!(unpack_word(pack_word(value)), value);
        }
    }

    #[test]
    fn words_are_little_endian() {
        let packed = pack_word(0x0102);
        assert_eq!(packed[0], 0x02);
        assert_eq!(packed[1], 0x01);
    }

    #[test]
    fn negative_words_wrap_twos_complement() {
        let packed = pack_word(-1);
        assert!(packed.iter().all(|&b| b == 0xff));
    }

    #[test]
    fn opcode_decode_round_trip() {
        for byte in b"IBSTGRCXLDib~rec" {
            let op = Opcode::from_byte(*byte).unwrap();
            assert_eq!(op.byte(), *byte);
        }
    }

    #[test]
    fn opcode_decode_rejects_unknown_bytes() {
        assert_eq!(Opcode::from_byte(b'Z'), None);
        assert_eq!(Opcode::from_byte(0), None);
        assert_eq!(Opcode::from_byte(0xff), None);
    }

    #[test]
    fn frame_layout() {
        let frame = pack_frame(Opcode::MakeInt, 7);
        assert_eq!(frame[0], b'I');
        assert_eq!(unpack_word(frame[1..].try_into().unwrap()), 7);
    }

    #[test]
    fn opcode_names_for_diagnostics() {
        let name: &'static str = Opcode::Starcall.into();
        assert_eq!(name, "Starcall");
    }
}
