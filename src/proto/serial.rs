use std::hash::Hasher;

use siphasher::sip::SipHasher13;
use smallvec::SmallVec;

use super::{AreqSpec, PacketDesc};

pub const FASTPASS_PKT_HDR_LEN: usize = 8;
pub const FASTPASS_PKT_RESET_LEN: usize = 8;

pub const FASTPASS_PKT_MAX_AREQ: usize = 10;
pub const FASTPASS_PKT_AREQ_LEN: usize = 2 + 4 * FASTPASS_PKT_MAX_AREQ;

pub const FASTPASS_PKT_MAX_DSTS: usize = 15;
pub const FASTPASS_PKT_MAX_ALLOC_TSLOTS: usize = 64;
pub const FASTPASS_PKT_ALLOC_LEN: usize =
    6 + 2 * FASTPASS_PKT_MAX_DSTS + FASTPASS_PKT_MAX_ALLOC_TSLOTS;

pub const FASTPASS_PKT_ACK_LEN: usize = 16;

/// Largest control packet an endpoint will accept.
pub const FASTPASS_ENDPOINT_MAX_PAYLOAD: usize =
    FASTPASS_PKT_HDR_LEN + FASTPASS_PKT_RESET_LEN + FASTPASS_PKT_AREQ_LEN + FASTPASS_PKT_ACK_LEN;

/// Largest control packet the arbiter will emit (adds the ALLOC section).
pub const FASTPASS_ARBITER_MAX_PAYLOAD: usize =
    FASTPASS_ENDPOINT_MAX_PAYLOAD + FASTPASS_PKT_ALLOC_LEN;

const PTYPE_PADDING: u8 = 0x0;
const PTYPE_RESET: u8 = 0x1;
const PTYPE_AREQ: u8 = 0x2;
const PTYPE_ALLOC: u8 = 0x3;
const PTYPE_ACK: u8 = 0x4;

/// Decode failures, each backed by a statistics counter on the connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SerialError {
    TooShort,
    UnknownPayload,
    IncompleteReset,
    IncompleteAreq,
    IncompleteAlloc,
    IncompleteAck,
    BufferTooSmall,
}

pub struct Reader<'a> {
    ptr: *const u8,
    bytes_read: usize,
    _lifetime: std::marker::PhantomData<&'a ()>,
}

impl<'a> Reader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            ptr: buffer.as_ptr(),
            bytes_read: 0,
            _lifetime: Default::default(),
        }
    }

    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    pub unsafe fn read_u8(&mut self) -> u8 {
        let value = *self.ptr;
        self.ptr = self.ptr.offset(1);
        self.bytes_read += 1;
        value
    }

    pub unsafe fn read_u16(&mut self) -> u16 {
        let mut value = 0;
        value |= (*self.ptr.offset(0) as u16) << 8;
        value |= *self.ptr.offset(1) as u16;
        self.ptr = self.ptr.offset(2);
        self.bytes_read += 2;
        value
    }

    pub unsafe fn read_u24(&mut self) -> u32 {
        let mut value = 0;
        value |= (*self.ptr.offset(0) as u32) << 16;
        value |= (*self.ptr.offset(1) as u32) << 8;
        value |= *self.ptr.offset(2) as u32;
        self.ptr = self.ptr.offset(3);
        self.bytes_read += 3;
        value
    }

    pub unsafe fn read_u32(&mut self) -> u32 {
        let mut value = 0;
        value |= (*self.ptr.offset(0) as u32) << 24;
        value |= (*self.ptr.offset(1) as u32) << 16;
        value |= (*self.ptr.offset(2) as u32) << 8;
        value |= *self.ptr.offset(3) as u32;
        self.ptr = self.ptr.offset(4);
        self.bytes_read += 4;
        value
    }

    pub unsafe fn read_u48(&mut self) -> u64 {
        let hi = self.read_u16() as u64;
        let lo = self.read_u32() as u64;
        (hi << 32) | lo
    }

    pub unsafe fn read_u64(&mut self) -> u64 {
        let hi = self.read_u32() as u64;
        let lo = self.read_u32() as u64;
        (hi << 32) | lo
    }
}

pub struct Writer<'a> {
    ptr: *mut u8,
    bytes_written: usize,
    _lifetime: std::marker::PhantomData<&'a ()>,
}

impl<'a> Writer<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            ptr: buffer.as_mut_ptr(),
            bytes_written: 0,
            _lifetime: Default::default(),
        }
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    pub unsafe fn write_u8(&mut self, value: u8) {
        *self.ptr = value;
        self.ptr = self.ptr.offset(1);
        self.bytes_written += 1;
    }

    pub unsafe fn write_u16(&mut self, value: u16) {
        *self.ptr.offset(0) = (value >> 8) as u8;
        *self.ptr.offset(1) = (value) as u8;
        self.ptr = self.ptr.offset(2);
        self.bytes_written += 2;
    }

    pub unsafe fn write_u24(&mut self, value: u32) {
        *self.ptr.offset(0) = (value >> 16) as u8;
        *self.ptr.offset(1) = (value >> 8) as u8;
        *self.ptr.offset(2) = (value) as u8;
        self.ptr = self.ptr.offset(3);
        self.bytes_written += 3;
    }

    pub unsafe fn write_u32(&mut self, value: u32) {
        *self.ptr.offset(0) = (value >> 24) as u8;
        *self.ptr.offset(1) = (value >> 16) as u8;
        *self.ptr.offset(2) = (value >> 8) as u8;
        *self.ptr.offset(3) = (value) as u8;
        self.ptr = self.ptr.offset(4);
        self.bytes_written += 4;
    }

    pub unsafe fn write_u48(&mut self, value: u64) {
        self.write_u16((value >> 32) as u16);
        self.write_u32(value as u32);
    }

    pub unsafe fn write_u64(&mut self, value: u64) {
        self.write_u32((value >> 32) as u32);
        self.write_u32(value as u32);
    }
}

/// The 8-byte header: four 16-bit words in network byte order.
///
/// `check` is a keyed digest of the rest of the packet (see [`checksum`]);
/// `ack_seq` carries only its low 14 bits, the top 2 bits are reserved.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WireHdr {
    pub seq: u16,
    pub check: u16,
    pub ack_seq: u16,
    pub ack_vec: u16,
}

pub fn read_hdr(buffer: &[u8]) -> Result<WireHdr, SerialError> {
    if buffer.len() < FASTPASS_PKT_HDR_LEN {
        return Err(SerialError::TooShort);
    }

    let mut rd = Reader::new(buffer);

    unsafe {
        Ok(WireHdr {
            seq: rd.read_u16(),
            check: rd.read_u16(),
            ack_seq: rd.read_u16() & 0x3FFF,
            ack_vec: rd.read_u16(),
        })
    }
}

/// Keyed 16-bit packet digest. The key is the (source, destination) address
/// pair, so a packet from an unexpected source fails verification outright.
pub fn checksum(buffer: &[u8], saddr: u32, daddr: u32) -> u16 {
    debug_assert!(buffer.len() >= FASTPASS_PKT_HDR_LEN);

    let mut hasher = SipHasher13::new_with_keys(saddr as u64, daddr as u64);
    hasher.write(&buffer[0..2]);
    hasher.write(&[0, 0]);
    hasher.write(&buffer[4..]);

    let digest = hasher.finish();
    let folded = digest ^ (digest >> 32);
    (folded ^ (folded >> 16)) as u16
}

pub fn verify_checksum(buffer: &[u8], saddr: u32, daddr: u32) -> bool {
    if buffer.len() < FASTPASS_PKT_HDR_LEN {
        return false;
    }

    let carried = ((buffer[2] as u16) << 8) | buffer[3] as u16;
    checksum(buffer, saddr, daddr) == carried
}

/// One decoded payload section. `PAD` sections are skipped by the reader and
/// never surface here.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Section<'a> {
    Reset {
        timestamp: u64,
    },
    Areq {
        pairs: SmallVec<[(u16, u16); FASTPASS_PKT_MAX_AREQ]>,
    },
    Alloc {
        base_tslot: u32,
        dsts: SmallVec<[u16; FASTPASS_PKT_MAX_DSTS]>,
        specs: &'a [u8],
    },
    Ack {
        ack_seq: u64,
        ack_vec: u64,
    },
}

/// Walks the typed sections following the header. Each section starts with a
/// byte whose high nibble is the type code.
pub struct PayloadReader<'a> {
    buffer: &'a [u8],
    read_idx: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            read_idx: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.buffer.len() - self.read_idx
    }

    pub fn next_section(&mut self) -> Result<Option<Section<'a>>, SerialError> {
        loop {
            if self.remaining() == 0 {
                return Ok(None);
            }

            let tag = self.buffer[self.read_idx];

            match tag >> 4 {
                PTYPE_PADDING => {
                    self.read_idx += 1;
                }
                PTYPE_RESET => {
                    if self.remaining() < FASTPASS_PKT_RESET_LEN {
                        return Err(SerialError::IncompleteReset);
                    }

                    let mut rd = Reader::new(&self.buffer[self.read_idx + 1..]);
                    let timestamp = unsafe {
                        let hi = rd.read_u24() as u64;
                        let lo = rd.read_u32() as u64;
                        (hi << 32) | lo
                    };
                    self.read_idx += FASTPASS_PKT_RESET_LEN;

                    return Ok(Some(Section::Reset { timestamp }));
                }
                PTYPE_AREQ => {
                    if self.remaining() < 2 {
                        return Err(SerialError::IncompleteAreq);
                    }

                    let n = self.buffer[self.read_idx + 1] as usize;
                    if n > FASTPASS_PKT_MAX_AREQ || self.remaining() < 2 + 4 * n {
                        return Err(SerialError::IncompleteAreq);
                    }

                    let mut rd = Reader::new(&self.buffer[self.read_idx + 2..]);
                    let mut pairs = SmallVec::new();
                    for _ in 0..n {
                        unsafe {
                            let dst = rd.read_u16();
                            let count = rd.read_u16();
                            pairs.push((dst, count));
                        }
                    }
                    self.read_idx += 2 + 4 * n;

                    return Ok(Some(Section::Areq { pairs }));
                }
                PTYPE_ALLOC => {
                    if self.remaining() < 6 {
                        return Err(SerialError::IncompleteAlloc);
                    }

                    let n_dst = (tag & 0xF) as usize;

                    let mut rd = Reader::new(&self.buffer[self.read_idx + 1..]);
                    let (alloc_count, base_tslot) =
                        unsafe { (rd.read_u16() as usize, rd.read_u24() & 0xFFFFF) };

                    if alloc_count > FASTPASS_PKT_MAX_ALLOC_TSLOTS
                        || self.remaining() < 6 + 2 * n_dst + alloc_count
                    {
                        return Err(SerialError::IncompleteAlloc);
                    }

                    let mut rd = Reader::new(&self.buffer[self.read_idx + 6..]);
                    let mut dsts = SmallVec::new();
                    for _ in 0..n_dst {
                        dsts.push(unsafe { rd.read_u16() });
                    }

                    let specs_begin = self.read_idx + 6 + 2 * n_dst;
                    let specs = &self.buffer[specs_begin..specs_begin + alloc_count];

                    self.read_idx = specs_begin + alloc_count;

                    return Ok(Some(Section::Alloc {
                        base_tslot,
                        dsts,
                        specs,
                    }));
                }
                PTYPE_ACK => {
                    if self.remaining() < FASTPASS_PKT_ACK_LEN {
                        return Err(SerialError::IncompleteAck);
                    }

                    let mut rd = Reader::new(&self.buffer[self.read_idx + 2..]);
                    let (ack_seq, ack_vec) = unsafe { (rd.read_u48(), rd.read_u64()) };
                    self.read_idx += FASTPASS_PKT_ACK_LEN;

                    return Ok(Some(Section::Ack { ack_seq, ack_vec }));
                }
                _ => return Err(SerialError::UnknownPayload),
            }
        }
    }
}

/// Encodes `pd` into `data`, returning the number of bytes used. Packets
/// shorter than `min_size` are padded out with PAD sections.
pub fn encode_packet(
    pd: &PacketDesc,
    data: &mut [u8],
    saddr: u32,
    daddr: u32,
    min_size: usize,
) -> Result<usize, SerialError> {
    let mut needed = FASTPASS_PKT_HDR_LEN;
    if pd.send_reset {
        needed += FASTPASS_PKT_RESET_LEN;
    }
    if !pd.areq.is_empty() {
        needed += 2 + 4 * pd.areq.len();
    }
    if !pd.tslot_desc.is_empty() {
        let section = 6 + 2 * pd.dsts.len() + pd.tslot_desc.len();
        needed += section + (section & 1);
    }
    if pd.send_ack {
        needed += FASTPASS_PKT_ACK_LEN;
    }

    if data.len() < needed.max(min_size) {
        return Err(SerialError::BufferTooSmall);
    }

    assert!(pd.areq.len() <= FASTPASS_PKT_MAX_AREQ);
    assert!(pd.dsts.len() <= FASTPASS_PKT_MAX_DSTS);
    assert!(pd.tslot_desc.len() <= FASTPASS_PKT_MAX_ALLOC_TSLOTS);

    let mut wr = Writer::new(data);

    unsafe {
        wr.write_u16(pd.seqno as u16);
        wr.write_u16(0); // checksum, patched below
        wr.write_u16(pd.ack_seq as u16 & 0x3FFF);
        wr.write_u16(pd.ack_vec16);

        if pd.send_reset {
            wr.write_u8(PTYPE_RESET << 4);
            let ts = pd.reset_timestamp & 0x00FF_FFFF_FFFF_FFFF;
            wr.write_u24((ts >> 32) as u32);
            wr.write_u32(ts as u32);
        }

        if !pd.areq.is_empty() {
            wr.write_u8(PTYPE_AREQ << 4);
            wr.write_u8(pd.areq.len() as u8);
            for areq in pd.areq.iter() {
                wr.write_u16(areq.src_dst_key as u16);
                wr.write_u16(areq.tslots as u16);
            }
        }

        if !pd.tslot_desc.is_empty() {
            wr.write_u8((PTYPE_ALLOC << 4) | pd.dsts.len() as u8);
            wr.write_u16(pd.tslot_desc.len() as u16);
            wr.write_u24(pd.base_tslot as u32 & 0xFFFFF);
            for &dst in pd.dsts.iter() {
                wr.write_u16(dst);
            }
            for &spec in pd.tslot_desc.iter() {
                wr.write_u8(spec);
            }
            if (6 + 2 * pd.dsts.len() + pd.tslot_desc.len()) & 1 != 0 {
                wr.write_u8(PTYPE_PADDING << 4);
            }
        }

        if pd.send_ack {
            wr.write_u8(PTYPE_ACK << 4);
            wr.write_u8(0);
            wr.write_u48(pd.ack_seq);
            wr.write_u64(pd.ack_vec64);
        }

        while wr.bytes_written() < min_size {
            wr.write_u8(PTYPE_PADDING << 4);
        }
    }

    let len = wr.bytes_written();
    let check = checksum(&data[..len], saddr, daddr);
    data[2] = (check >> 8) as u8;
    data[3] = check as u8;

    Ok(len)
}

/// Expands a 16-bit wire sequence number against the highest sequence seen,
/// choosing the value within half the 16-bit wrap space either side.
pub fn expand_seq16(wire: u16, in_max_seqno: u64) -> u64 {
    let base = in_max_seqno.wrapping_sub(1 << 15);
    base.wrapping_add(wire.wrapping_sub(base as u16) as u64)
}

/// Expands a 14-bit wire ack against our send state; acks always refer to
/// already-sent sequence numbers, so the result never exceeds
/// `next_seqno - 1`.
pub fn expand_ack14(wire: u16, next_seqno: u64) -> u64 {
    let head = next_seqno.wrapping_sub(1);
    head.wrapping_sub(head.wrapping_sub(wire as u64) & 0x3FFF)
}

/// Expands a 20-bit wire base timeslot against the current timeslot,
/// 1/4 of the wrap space back and 3/4 forward.
pub fn expand_tslot20(wire: u32, current_tslot: u64) -> u64 {
    let base = current_tslot.wrapping_sub(1 << 18);
    base.wrapping_add((wire.wrapping_sub(base as u32) & 0xFFFFF) as u64)
}

/// Expands a 16-bit cumulative demand count against the recorded counter,
/// with a 2^15 guard band either side. Known to be unsafe against counter
/// jumps larger than the guard; callers log suspicious jumps.
pub fn expand_count16(wire: u16, current: u64) -> u64 {
    let base = current.wrapping_sub(1 << 15);
    base.wrapping_add(wire.wrapping_sub(base as u16) as u64)
}
