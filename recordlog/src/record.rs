//! Record framing inside fixed-size blocks.
//!
//! A record is stored as one or more fragments. Each fragment is framed as
//! `[crc: u32 LE][length: u32 LE][flags: u8][payload]` where the crc32c
//! covers the flags byte and the payload. The FIRST/LAST flag bits stitch
//! fragments of a record that straddles block boundaries back together; a
//! fragment carrying both is a whole record. When the tail of a block cannot
//! hold another fragment header it is zero-padded, and an all-zero header
//! also marks padding, so a reader can always tell padding from data.

use std::io::Read;
use std::io::Write;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// Bytes of framing in front of every fragment payload.
pub const FRAGMENT_HEADER_SIZE: usize = 9;

/// Fragment starts a record.
const FRAG_FIRST: u8 = 0x01;
/// Fragment ends a record.
const FRAG_LAST: u8 = 0x02;
/// Record payload is zlib-deflated (set on the first fragment only).
const FRAG_DEFLATE: u8 = 0x04;

const FRAG_KNOWN: u8 = FRAG_FIRST | FRAG_LAST | FRAG_DEFLATE;

fn fragment_crc(flags: u8, payload: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&[flags]);
    crc32c::crc32c_append(crc, payload)
}

/// Packs records into fixed-size blocks.
///
/// The writer keeps the current block in memory. Appending a record emits
/// every block it fills; the partially-filled tail block stays owned by the
/// writer until it either fills up or is snapshotted with
/// [`RecordWriter::finalize_content`] (which pads a copy but keeps the block
/// open for more records).
pub struct RecordWriter {
    block_size: usize,
    deflate: bool,
    block: Vec<u8>,
    records_in_block: i32,
}

impl RecordWriter {
    pub fn new(block_size: usize, deflate: bool) -> Self {
        assert!(
            block_size > FRAGMENT_HEADER_SIZE,
            "block_size must exceed the fragment header"
        );
        Self {
            block_size,
            deflate,
            block: Vec::with_capacity(block_size),
            records_in_block: 0,
        }
    }

    /// Records begun in the current (partially-filled) block.
    pub fn pending_record_count(&self) -> i32 {
        self.records_in_block
    }

    /// Whether the current block holds any bytes.
    pub fn has_pending(&self) -> bool {
        !self.block.is_empty()
    }

    /// Drop all buffered state (after a truncation or a file switch).
    pub fn clear(&mut self) {
        self.block.clear();
        self.records_in_block = 0;
    }

    /// Append one record, pushing every block it fills onto `out`.
    ///
    /// Returns the number of full blocks emitted. The record counts toward
    /// the block it begins in; a fresh tail block left behind by a
    /// straddling record starts at zero records.
    pub fn append_record(&mut self, data: &[u8], out: &mut Vec<Vec<u8>>) -> usize {
        let mut deflated = false;
        let owned;
        let mut payload = data;
        if self.deflate && !data.is_empty() {
            let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
            // Writing into a Vec cannot fail.
            enc.write_all(data).unwrap();
            owned = enc.finish().unwrap();
            if owned.len() < data.len() {
                payload = &owned;
                deflated = true;
            }
        }

        let emitted_before = out.len();

        let mut offset = 0;
        let mut first = true;
        loop {
            let space = self.block_size - self.block.len();
            if space <= FRAGMENT_HEADER_SIZE {
                // No room for a useful fragment: pad out and retire the block.
                self.block.resize(self.block_size, 0);
                self.emit(out);
                continue;
            }
            if first {
                // The record counts toward the block its first fragment
                // lands in.
                self.records_in_block += 1;
            }
            let avail = space - FRAGMENT_HEADER_SIZE;
            let take = avail.min(payload.len() - offset);
            let last = offset + take == payload.len();

            let mut flags = 0u8;
            if first {
                flags |= FRAG_FIRST;
                if deflated {
                    flags |= FRAG_DEFLATE;
                }
            }
            if last {
                flags |= FRAG_LAST;
            }
            let chunk = &payload[offset..offset + take];
            self.block
                .extend_from_slice(&fragment_crc(flags, chunk).to_le_bytes());
            self.block.extend_from_slice(&(take as u32).to_le_bytes());
            self.block.push(flags);
            self.block.extend_from_slice(chunk);

            offset += take;
            first = false;
            if self.block.len() == self.block_size {
                self.emit(out);
            }
            if last {
                break;
            }
        }
        out.len() - emitted_before
    }

    /// Produce a padded snapshot of the current partial block, leaving it
    /// open so later records keep packing into it. Returns `None` when the
    /// block is empty.
    pub fn finalize_content(&self) -> Option<Vec<u8>> {
        if self.block.is_empty() {
            return None;
        }
        let mut snapshot = self.block.clone();
        snapshot.resize(self.block_size, 0);
        Some(snapshot)
    }

    fn emit(&mut self, out: &mut Vec<Vec<u8>>) {
        debug_assert_eq!(self.block.len(), self.block_size);
        out.push(std::mem::replace(
            &mut self.block,
            Vec::with_capacity(self.block_size),
        ));
        self.records_in_block = 0;
    }
}

/// The outcome of a [`RecordReader::read_record`] call.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete record. `began_in_block` tells whether its first fragment
    /// was in the block currently loaded (false for a record assembled
    /// across a block boundary).
    Record {
        data: Vec<u8>,
        began_in_block: bool,
    },
    /// The loaded block is exhausted (consumed or padding reached); feed the
    /// next one.
    NeedBlock,
    /// Framing or checksum error; the rest of the loaded block has been
    /// discarded so reading resyncs at the next block boundary.
    Corrupt,
}

/// Splits blocks back into records, reassembling straddling fragments.
pub struct RecordReader {
    block_size: usize,
    buf: Vec<u8>,
    offset: usize,
    partial: Option<Vec<u8>>,
    partial_deflated: bool,
}

impl RecordReader {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            buf: Vec::new(),
            offset: 0,
            partial: None,
            partial_deflated: false,
        }
    }

    /// Load the next block. Any in-progress record assembly is kept.
    pub fn feed_block(&mut self, data: &[u8]) {
        debug_assert_eq!(data.len(), self.block_size);
        self.buf.clear();
        self.buf.extend_from_slice(data);
        self.offset = 0;
    }

    /// Whether a record started in an earlier block awaits its continuation.
    pub fn has_partial(&self) -> bool {
        self.partial.is_some()
    }

    /// Drop the loaded block and any partial assembly.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.offset = 0;
        self.partial = None;
        self.partial_deflated = false;
    }

    pub fn read_record(&mut self) -> ReadOutcome {
        loop {
            if self.buf.len() - self.offset <= FRAGMENT_HEADER_SIZE {
                // A tail shorter than one header is always padding.
                return ReadOutcome::NeedBlock;
            }
            let header = &self.buf[self.offset..self.offset + FRAGMENT_HEADER_SIZE];
            if header.iter().all(|b| *b == 0) {
                return ReadOutcome::NeedBlock;
            }
            let crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
            let flags = header[8];

            if flags & !FRAG_KNOWN != 0 || len > self.buf.len() - self.offset - FRAGMENT_HEADER_SIZE
            {
                self.fail_block();
                return ReadOutcome::Corrupt;
            }
            let payload_start = self.offset + FRAGMENT_HEADER_SIZE;
            let payload = &self.buf[payload_start..payload_start + len];
            if fragment_crc(flags, payload) != crc {
                self.fail_block();
                return ReadOutcome::Corrupt;
            }

            let first = flags & FRAG_FIRST != 0;
            let last = flags & FRAG_LAST != 0;

            if first && self.partial.is_some() {
                // A new record begins while another is mid-assembly: the
                // continuation we were waiting for is gone.
                self.fail_block();
                return ReadOutcome::Corrupt;
            }
            if !first && self.partial.is_none() {
                // Head-of-block continuation of a record that began before
                // our seek point; skip it without counting.
                self.offset = payload_start + len;
                continue;
            }

            if first && last {
                let data = payload.to_vec();
                self.offset = payload_start + len;
                return self.complete(data, flags & FRAG_DEFLATE != 0, true);
            }
            if first {
                self.partial = Some(payload.to_vec());
                self.partial_deflated = flags & FRAG_DEFLATE != 0;
                self.offset = payload_start + len;
                continue;
            }
            // Continuation of our partial.
            let mut data = self.partial.take().unwrap();
            data.extend_from_slice(payload);
            self.offset = payload_start + len;
            if last {
                let deflated = self.partial_deflated;
                self.partial_deflated = false;
                return self.complete(data, deflated, false);
            }
            self.partial = Some(data);
        }
    }

    fn complete(&mut self, data: Vec<u8>, deflated: bool, began_in_block: bool) -> ReadOutcome {
        if !deflated {
            return ReadOutcome::Record {
                data,
                began_in_block,
            };
        }
        let mut inflated = Vec::new();
        match ZlibDecoder::new(&data[..]).read_to_end(&mut inflated) {
            Ok(_) => ReadOutcome::Record {
                data: inflated,
                began_in_block,
            },
            Err(_) => {
                self.fail_block();
                ReadOutcome::Corrupt
            }
        }
    }

    /// Discard the rest of the block and any partial assembly, so reading
    /// resyncs cleanly at the next block boundary.
    fn fail_block(&mut self) {
        self.offset = self.buf.len();
        self.partial = None;
        self.partial_deflated = false;
    }
}
