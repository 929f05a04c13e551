//! Type-7 command-processor packet codec
//!
//! Every packet is one header dword followed by `count` operand dwords.
//!
//! ```text
//!  31   28 27 24 23  22       16 15  14            0
//! +-------+-----+---+-----------+---+---------------+
//! | 0x7   |  0  | P |  opcode   | P |     count     |
//! +-------+-----+---+-----------+---+---------------+
//! ```
//!
//! Both `P` bits are odd-parity bits over the adjacent field, so a
//! corrupted header is detected when the command processor (or the
//! simulator) decodes it.

use core::fmt;

/// Type nibble of a type-7 packet header
pub const TYPE7_MARKER: u32 = 0x7000_0000;

/// Largest operand count a single packet can carry
pub const MAX_PACKET_COUNT: u32 = 0x3fff;

/// `CP_EVENT_WRITE` operand-0 flag: raise an interrupt when executed
pub const EVENT_IRQ: u32 = 1 << 31;

/// `CP_EVENT_WRITE` operand-0 flag: write a timestamp to the address operands
pub const EVENT_TIMESTAMP: u32 = 1 << 30;

/// `CP_THREAD_CONTROL` operand: select both BR and BV threads
pub const THREAD_BOTH: u32 = 0x3;

/// `CP_THREAD_CONTROL` operand flag: wait for both threads to sync
pub const THREAD_SYNC: u32 = 1 << 31;

/// Opcodes emitted by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0x10,
    WaitForMe = 0x13,
    ThreadControl = 0x17,
    WaitForIdle = 0x26,
    MemWrite = 0x3d,
    IndirectBuffer = 0x3f,
    EventWrite = 0x46,
    MeInit = 0x48,
    SmmuTableUpdate = 0x53,
    SetPseudoReg = 0x56,
    SetMarker = 0x65,
    SetSecureMode = 0x66,
    ContextSwitchYield = 0x6b,
}

impl Opcode {
    pub const fn from_u8(v: u8) -> Option<Opcode> {
        Some(match v {
            0x10 => Opcode::Nop,
            0x13 => Opcode::WaitForMe,
            0x17 => Opcode::ThreadControl,
            0x26 => Opcode::WaitForIdle,
            0x3d => Opcode::MemWrite,
            0x3f => Opcode::IndirectBuffer,
            0x46 => Opcode::EventWrite,
            0x48 => Opcode::MeInit,
            0x53 => Opcode::SmmuTableUpdate,
            0x56 => Opcode::SetPseudoReg,
            0x65 => Opcode::SetMarker,
            0x66 => Opcode::SetSecureMode,
            0x6b => Opcode::ContextSwitchYield,
            _ => return None,
        })
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Events carried by `CP_EVENT_WRITE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventKind {
    CacheFlushTs = 0x04,
    CacheInvalidate = 0x31,
    CacheCleanTs = 0x32,
}

/// `CP_SET_PSEUDO_REG` register selectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PseudoReg {
    SmmuInfo = 0,
    NonSecureSaveAddr = 1,
    SecureSaveAddr = 2,
    NonPrivSaveAddr = 3,
    Counter = 4,
}

/// `CP_SET_MARKER` modes
pub mod marker {
    /// Start of a user command stream
    pub const RM6_CMD_START: u32 = 0x1;
    /// Driver-internal IB section
    pub const RM6_IB1_LIST_START: u32 = 0x6;
    /// Yield point marker
    pub const RM6_YIELD: u32 = 0x8;
}

/// Odd parity of `val`, folded to four bits
#[inline]
pub const fn odd_parity(val: u32) -> u32 {
    let folded = val
        ^ (val >> 4)
        ^ (val >> 8)
        ^ (val >> 12)
        ^ (val >> 16)
        ^ (val >> 20)
        ^ (val >> 24)
        ^ (val >> 28);
    (0x9669 >> (folded & 0xf)) & 1
}

/// Decoded type-7 packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub opcode: u8,
    pub count: u32,
}

impl PacketHeader {
    /// Encode a header for `opcode` carrying `count` operands
    #[inline]
    pub const fn encode(opcode: u8, count: u32) -> u32 {
        let op = opcode as u32 & 0x7f;
        let cnt = count & MAX_PACKET_COUNT;
        TYPE7_MARKER | cnt | (odd_parity(cnt) << 15) | (op << 16) | (odd_parity(op) << 23)
    }

    /// Decode and validate a header dword
    pub const fn decode(word: u32) -> Option<PacketHeader> {
        if word & 0xf000_0000 != TYPE7_MARKER {
            return None;
        }
        let count = word & MAX_PACKET_COUNT;
        let op = (word >> 16) & 0x7f;
        if (word >> 15) & 1 != odd_parity(count) {
            return None;
        }
        if (word >> 23) & 1 != odd_parity(op) {
            return None;
        }
        Some(PacketHeader { opcode: op as u8, count })
    }

    /// Total dwords of the packet, header included
    #[inline]
    pub const fn len_dwords(&self) -> u32 {
        self.count + 1
    }
}

/// An owned, fully encoded sequence of packets
///
/// Submissions are encoded into a stream first and copied into the ring
/// only once every check has passed, so a rejected submission never
/// leaves a partial packet in ring memory.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PacketStream {
    words: Vec<u32>,
    packets: u32,
}

impl PacketStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(dwords: usize) -> Self {
        Self { words: Vec::with_capacity(dwords), packets: 0 }
    }

    /// Append one packet
    pub fn pkt7(&mut self, opcode: Opcode, operands: &[u32]) -> &mut Self {
        debug_assert!(operands.len() as u32 <= MAX_PACKET_COUNT);
        self.words.push(PacketHeader::encode(opcode as u8, operands.len() as u32));
        self.words.extend_from_slice(operands);
        self.packets += 1;
        self
    }

    /// Append a stream that was encoded elsewhere
    pub fn extend(&mut self, other: &PacketStream) -> &mut Self {
        self.words.extend_from_slice(&other.words);
        self.packets += other.packets;
        self
    }

    /// `CP_MEM_WRITE` of one dword to a 64-bit iova
    pub fn mem_write(&mut self, iova: u64, value: u32) -> &mut Self {
        self.pkt7(Opcode::MemWrite, &[lo32(iova), hi32(iova), value])
    }

    /// `CP_EVENT_WRITE` that writes `value` to `iova` once the event retires
    pub fn event_write_ts(&mut self, event: EventKind, iova: u64, value: u32, irq: bool) -> &mut Self {
        let mut op0 = event as u32 | EVENT_TIMESTAMP;
        if irq {
            op0 |= EVENT_IRQ;
        }
        self.pkt7(Opcode::EventWrite, &[op0, lo32(iova), hi32(iova), value])
    }

    /// `CP_MEM_WRITE` of consecutive dwords starting at `iova`
    pub fn mem_write_n(&mut self, iova: u64, values: &[u32]) -> &mut Self {
        let mut operands = Vec::with_capacity(values.len() + 2);
        operands.push(lo32(iova));
        operands.push(hi32(iova));
        operands.extend_from_slice(values);
        self.pkt7(Opcode::MemWrite, &operands)
    }

    /// Plain `CP_EVENT_WRITE` without a timestamp
    pub fn event_write(&mut self, event: EventKind) -> &mut Self {
        self.pkt7(Opcode::EventWrite, &[event as u32])
    }

    /// The yield packet; the only point where hardware may preempt the ring
    pub fn yield_point(&mut self) -> &mut Self {
        // operands: reserved, reserved, irq on preempt, enable yield
        self.pkt7(Opcode::ContextSwitchYield, &[0, 0, 1, 1])
    }

    #[inline]
    pub fn as_slice(&self) -> &[u32] {
        &self.words
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Number of packets in the stream
    #[inline]
    pub fn packets(&self) -> u32 {
        self.packets
    }

    /// Walk the packets of the stream
    pub fn iter(&self) -> PacketIter<'_> {
        PacketIter { words: &self.words }
    }
}

impl fmt::Debug for PacketStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for pkt in self.iter() {
            match pkt {
                Ok((op, operands)) => {
                    list.entry(&format_args!("{:?}{:x?}", op, operands));
                }
                Err(word) => {
                    list.entry(&format_args!("BAD({:#010x})", word));
                }
            }
        }
        list.finish()
    }
}

/// Iterator over `(opcode, operands)`; yields `Err(word)` on a bad header
pub struct PacketIter<'a> {
    words: &'a [u32],
}

impl<'a> Iterator for PacketIter<'a> {
    type Item = Result<(Opcode, &'a [u32]), u32>;

    fn next(&mut self) -> Option<Self::Item> {
        let (&head, rest) = self.words.split_first()?;
        let Some(hdr) = PacketHeader::decode(head) else {
            self.words = &[];
            return Some(Err(head));
        };
        let count = hdr.count as usize;
        if count > rest.len() {
            self.words = &[];
            return Some(Err(head));
        }
        let (operands, tail) = rest.split_at(count);
        self.words = tail;
        match Opcode::from_u8(hdr.opcode) {
            Some(op) => Some(Ok((op, operands))),
            None => Some(Err(head)),
        }
    }
}

#[inline]
pub const fn lo32(v: u64) -> u32 {
    v as u32
}

#[inline]
pub const fn hi32(v: u64) -> u32 {
    (v >> 32) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parity() {
        assert_eq!(odd_parity(0), 1);
        assert_eq!(odd_parity(1), 0);
        assert_eq!(odd_parity(3), 1);
        assert_eq!(odd_parity(0x6b), 0);
    }

    #[test]
    fn test_header_fields() {
        let word = PacketHeader::encode(Opcode::ContextSwitchYield as u8, 4);
        assert_eq!(word & 0xf000_0000, TYPE7_MARKER);
        let hdr = PacketHeader::decode(word).unwrap();
        assert_eq!(hdr.opcode, 0x6b);
        assert_eq!(hdr.count, 4);
        assert_eq!(hdr.len_dwords(), 5);
    }

    #[test]
    fn test_header_rejects_flipped_parity() {
        let word = PacketHeader::encode(Opcode::Nop as u8, 2);
        assert!(PacketHeader::decode(word ^ (1 << 15)).is_none());
        assert!(PacketHeader::decode(word ^ (1 << 23)).is_none());
        assert!(PacketHeader::decode(0x4000_0000).is_none());
    }

    #[test]
    fn test_stream_iter() {
        let mut s = PacketStream::new();
        s.mem_write(0x1_0000_1000, 5).yield_point();
        assert_eq!(s.packets(), 2);
        assert_eq!(s.len(), 4 + 5);

        let pkts: Vec<_> = s.iter().map(|p| p.unwrap()).collect();
        assert_eq!(pkts[0].0, Opcode::MemWrite);
        assert_eq!(pkts[0].1, &[0x1000, 0x1, 5]);
        assert_eq!(pkts[1].0, Opcode::ContextSwitchYield);
    }

    #[test]
    fn test_truncated_stream_is_reported() {
        let mut s = PacketStream::new();
        s.mem_write(0x1000, 1);
        let words = &s.as_slice()[..2];
        let mut it = PacketIter { words };
        assert!(matches!(it.next(), Some(Err(_))));
        assert!(it.next().is_none());
    }
}
