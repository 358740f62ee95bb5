//! Buffered, bit-addressable reader over a forward-only byte source.
//!
//! Bits are consumed least-significant first within each byte, which is the
//! CTF layout for little-endian fields. A value of `n` bits comes back as
//! `ceil(n / 8)` little-endian bytes with the value packed into the low bits.

use std::io::{ErrorKind, Read};

use super::error::{CtfError, Result};

/// Size of each refill chunk.
pub const DEFAULT_BUFFER_SIZE: usize = 1 << 20;

#[derive(Debug, Default, Clone, Copy)]
struct PacketBounds {
    start_bit: u64,
    bits_in_packet: Option<u64>,
}

pub struct BitReader<R> {
    source: R,
    buffer: Box<[u8]>,
    len: usize,
    pos: usize,
    /// Bits already consumed from `buffer[pos]`, always 0..=7.
    bit_offset: u32,
    /// Stream offset of `buffer[0]`.
    buffer_start: u64,
    exhausted: bool,
    packet: PacketBounds,
}

impl<R: Read> BitReader<R> {
    pub fn new(source: R) -> Self {
        Self::with_capacity(source, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(source: R, capacity: usize) -> Self {
        Self {
            source,
            buffer: vec![0u8; capacity.max(1)].into_boxed_slice(),
            len: 0,
            pos: 0,
            bit_offset: 0,
            buffer_start: 0,
            exhausted: false,
            packet: PacketBounds::default(),
        }
    }

    /// Absolute position in bits from the start of the stream.
    pub fn bit_position(&self) -> u64 {
        (self.buffer_start + self.pos as u64) * 8 + self.bit_offset as u64
    }

    /// Whole bytes passed so far. A partially consumed byte is not counted.
    pub fn bytes_consumed(&self) -> u64 {
        self.buffer_start + self.pos as u64
    }

    pub fn bits_remaining_in_buffer(&self) -> u64 {
        (self.len - self.pos) as u64 * 8 - self.bit_offset as u64
    }

    pub fn is_byte_aligned(&self) -> bool {
        self.bit_offset == 0
    }

    /// True once every byte of the source has been consumed.
    pub fn end_of_stream(&mut self) -> Result<bool> {
        if self.pos < self.len {
            return Ok(false);
        }
        Ok(!self.fill()?)
    }

    /// Marks the current position as the start of a packet with a length
    /// that is not known yet.
    pub fn begin_packet(&mut self) {
        self.packet = PacketBounds {
            start_bit: self.bit_position(),
            bits_in_packet: None,
        };
    }

    /// Declares the total packet length once the header or context has
    /// revealed it. Later reads may not cross it.
    pub fn set_packet_bits(&mut self, bits: u64) -> Result<()> {
        let read = self.bits_read_from_packet();
        if bits < read {
            return Err(CtfError::corrupt(format!(
                "packet size of {bits} bits is smaller than the {read} bits already decoded"
            )));
        }
        self.packet.bits_in_packet = Some(bits);
        Ok(())
    }

    pub fn end_packet(&mut self) {
        self.begin_packet();
    }

    pub fn bits_in_packet(&self) -> Option<u64> {
        self.packet.bits_in_packet
    }

    pub fn bits_read_from_packet(&self) -> u64 {
        self.bit_position() - self.packet.start_bit
    }

    /// Reads `count` bits into a freshly allocated little-endian buffer.
    pub fn read_bits(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; count.div_ceil(8)];
        self.read_bits_into(count, &mut out)?;
        Ok(out)
    }

    /// Reads `count` bits into `out`, which must hold at least
    /// `ceil(count / 8)` bytes.
    pub fn read_bits_into(&mut self, count: usize, out: &mut [u8]) -> Result<()> {
        if out.len() < count.div_ceil(8) {
            return Err(CtfError::corrupt(format!(
                "{} byte buffer cannot hold {count} bits",
                out.len()
            )));
        }
        self.reserve(count as u64)?;
        if self.bit_offset == 0 {
            self.read_aligned(count, out)
        } else {
            self.read_unaligned(count, out)
        }
    }

    /// Reads a NUL-terminated byte string. The terminator is consumed but
    /// not returned.
    pub fn read_cstring(&mut self) -> Result<Vec<u8>> {
        if self.bit_offset != 0 {
            return Err(CtfError::corrupt(format!(
                "string read at bit {} is not byte aligned",
                self.bit_position()
            )));
        }

        let mut out = Vec::new();
        loop {
            if !self.fill()? {
                return Err(self.truncated());
            }
            let available = &self.buffer[self.pos..self.len];
            match available.iter().position(|&b| b == 0) {
                Some(idx) => {
                    self.reserve((idx as u64 + 1) * 8)?;
                    out.extend_from_slice(&available[..idx]);
                    self.pos += idx + 1;
                    return Ok(out);
                }
                None => {
                    let n = available.len();
                    self.reserve(n as u64 * 8)?;
                    out.extend_from_slice(available);
                    self.pos += n;
                }
            }
        }
    }

    pub fn skip_bits(&mut self, count: u64) -> Result<()> {
        self.reserve(count)?;
        let mut remaining = count;
        while remaining > 0 {
            if self.bit_offset == 0 && remaining >= 8 {
                if !self.fill()? {
                    return Err(self.truncated());
                }
                let n = ((self.len - self.pos) as u64).min(remaining / 8);
                self.pos += n as usize;
                remaining -= n * 8;
            } else {
                let n = remaining.min((8 - self.bit_offset) as u64) as u32;
                self.take_bits(n)?;
                remaining -= n as u64;
            }
        }
        Ok(())
    }

    /// Advances to the next multiple of `alignment` bits, measured from the
    /// start of the current packet. No-op when already aligned.
    pub fn align(&mut self, alignment: u32) -> Result<()> {
        if alignment <= 1 {
            return Ok(());
        }
        let offset = self.bit_position() - self.packet.start_bit;
        let rem = offset % alignment as u64;
        if rem == 0 {
            return Ok(());
        }
        self.skip_bits(alignment as u64 - rem)
    }

    fn read_aligned(&mut self, count: usize, out: &mut [u8]) -> Result<()> {
        let whole = count / 8;
        let mut copied = 0;
        while copied < whole {
            if !self.fill()? {
                return Err(self.truncated());
            }
            let n = (self.len - self.pos).min(whole - copied);
            out[copied..copied + n].copy_from_slice(&self.buffer[self.pos..self.pos + n]);
            self.pos += n;
            copied += n;
        }

        let rest = (count % 8) as u32;
        if rest > 0 {
            out[whole] = self.take_bits(rest)?;
        }
        Ok(())
    }

    fn read_unaligned(&mut self, count: usize, out: &mut [u8]) -> Result<()> {
        let mut remaining = count;
        for byte in out.iter_mut() {
            if remaining == 0 {
                break;
            }
            let n = remaining.min(8);
            *byte = self.take_bits(n as u32)?;
            remaining -= n;
        }
        Ok(())
    }

    /// Takes 1..=8 bits, joining the tail of the current byte with the head
    /// of the next one when the request straddles a byte boundary.
    fn take_bits(&mut self, count: u32) -> Result<u8> {
        debug_assert!((1..=8).contains(&count));
        let current = self.current_byte()?;
        let available = 8 - self.bit_offset;
        if count <= available {
            let value = (current >> self.bit_offset) & low_mask(count);
            self.advance_bits(count);
            return Ok(value);
        }

        let low = current >> self.bit_offset;
        self.advance_bits(available);
        let next = self.current_byte()?;
        let high = next & low_mask(count - available);
        self.advance_bits(count - available);
        Ok(low | (high << available))
    }

    fn advance_bits(&mut self, count: u32) {
        self.bit_offset += count;
        if self.bit_offset >= 8 {
            self.pos += 1;
            self.bit_offset -= 8;
        }
    }

    fn current_byte(&mut self) -> Result<u8> {
        if !self.fill()? {
            return Err(self.truncated());
        }
        Ok(self.buffer[self.pos])
    }

    fn reserve(&self, bits: u64) -> Result<()> {
        if let Some(limit) = self.packet.bits_in_packet {
            let read = self.bits_read_from_packet();
            if read + bits > limit {
                return Err(CtfError::corrupt(format!(
                    "read of {bits} bits at packet offset {read} crosses the packet end at {limit} bits"
                )));
            }
        }
        Ok(())
    }

    /// Makes sure `buffer[pos]` is readable. Returns false once the source
    /// has nothing left.
    fn fill(&mut self) -> Result<bool> {
        if self.pos < self.len {
            return Ok(true);
        }
        if self.exhausted {
            return Ok(false);
        }

        self.buffer_start += self.len as u64;
        self.pos = 0;
        self.len = 0;
        loop {
            match self.source.read(&mut self.buffer) {
                Ok(0) => {
                    self.exhausted = true;
                    return Ok(false);
                }
                Ok(n) => {
                    self.len = n;
                    return Ok(true);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn truncated(&self) -> CtfError {
        CtfError::corrupt(format!(
            "unexpected end of stream at bit {}",
            self.bit_position()
        ))
    }
}

fn low_mask(count: u32) -> u8 {
    if count >= 8 {
        0xFF
    } else {
        (1u8 << count) - 1
    }
}
