//! Ogg/Opus framing
//!
//! Builds the Ogg byte streams fed to the speaker and recorder subprocesses
//! (OpusHead/OpusTags header pages, then one audio packet per page) and
//! parses the stream the microphone transcoder produces. The page CRC is
//! the Ogg variant: polynomial 0x04C11DB7, non-reflected, initial value 0,
//! computed over the whole page with the CRC field zeroed.

use log::{debug, warn};

/// Samples per 20 ms Opus frame at 48 kHz.
pub const SAMPLES_PER_FRAME: u64 = 960;

const PAGE_MAGIC: &[u8; 4] = b"OggS";
const HEADER_TYPE_CONTINUED: u8 = 0x01;
const HEADER_TYPE_BOS: u8 = 0x02;
const OPUS_HEAD_MAGIC: &[u8; 8] = b"OpusHead";
const OPUS_TAGS_MAGIC: &[u8; 8] = b"OpusTags";

/// Recommended decoder pre-skip for the synthesized OpusHead.
const PRE_SKIP: u16 = 312;

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut r = (n as u32) << 24;
        let mut i = 0;
        while i < 8 {
            r = if r & 0x8000_0000 != 0 {
                (r << 1) ^ 0x04C1_1DB7
            } else {
                r << 1
            };
            i += 1;
        }
        table[n] = r;
        n += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = build_crc_table();

/// Ogg page CRC-32.
pub fn ogg_crc(data: &[u8]) -> u32 {
    let mut crc = 0u32;
    for &byte in data {
        crc = (crc << 8) ^ CRC_TABLE[(((crc >> 24) as u8) ^ byte) as usize];
    }
    crc
}

/// 19-byte OpusHead identification packet (mono, 48 kHz input clock).
fn opus_head() -> Vec<u8> {
    let mut head = Vec::with_capacity(19);
    head.extend_from_slice(OPUS_HEAD_MAGIC);
    head.push(1); // version
    head.push(1); // channel count
    head.extend_from_slice(&PRE_SKIP.to_le_bytes());
    head.extend_from_slice(&48_000u32.to_le_bytes());
    head.extend_from_slice(&0i16.to_le_bytes()); // output gain
    head.push(0); // mapping family
    head
}

/// Minimal OpusTags comment packet (vendor string, zero comments).
fn opus_tags() -> Vec<u8> {
    let vendor = env!("CARGO_PKG_NAME").as_bytes();
    let mut tags = Vec::with_capacity(8 + 4 + vendor.len() + 4);
    tags.extend_from_slice(OPUS_TAGS_MAGIC);
    tags.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    tags.extend_from_slice(vendor);
    tags.extend_from_slice(&0u32.to_le_bytes());
    tags
}

/// Segment lacing for a single-packet page.
fn lacing(len: usize) -> Vec<u8> {
    let mut table = Vec::with_capacity(len / 255 + 1);
    let mut remaining = len;
    loop {
        if remaining >= 255 {
            table.push(255);
            remaining -= 255;
        } else {
            table.push(remaining as u8);
            break;
        }
    }
    table
}

fn build_page(
    header_type: u8,
    granule_position: u64,
    serial: u32,
    page_sequence: u32,
    packet: &[u8],
) -> Vec<u8> {
    let segments = lacing(packet.len());
    let mut page = Vec::with_capacity(27 + segments.len() + packet.len());

    page.extend_from_slice(PAGE_MAGIC);
    page.push(0); // stream structure version
    page.push(header_type);
    page.extend_from_slice(&granule_position.to_le_bytes());
    page.extend_from_slice(&serial.to_le_bytes());
    page.extend_from_slice(&page_sequence.to_le_bytes());
    page.extend_from_slice(&0u32.to_le_bytes()); // CRC placeholder
    page.push(segments.len() as u8);
    page.extend_from_slice(&segments);
    page.extend_from_slice(packet);

    let crc = ogg_crc(&page);
    page[22..26].copy_from_slice(&crc.to_le_bytes());
    page
}

/// Stateful Ogg writer for one logical stream.
///
/// In persistent speaker mode the same writer outlives floor sessions, so
/// the granule position keeps counting and the downstream decoder never
/// resets.
pub struct OggStreamWriter {
    serial: u32,
    page_sequence: u32,
    granule_position: u64,
    headers_written: bool,
}

impl OggStreamWriter {
    pub fn new(serial: u32) -> Self {
        Self {
            serial,
            page_sequence: 0,
            granule_position: 0,
            headers_written: false,
        }
    }

    /// OpusHead (page 0, BOS) followed by OpusTags (page 1). Empty if the
    /// headers already went out on this stream.
    pub fn header_pages(&mut self) -> Vec<u8> {
        if self.headers_written {
            return Vec::new();
        }
        let mut out = build_page(HEADER_TYPE_BOS, 0, self.serial, 0, &opus_head());
        out.extend_from_slice(&build_page(0, 0, self.serial, 1, &opus_tags()));
        self.page_sequence = 2;
        self.headers_written = true;
        out
    }

    /// Wrap one Opus packet into the next audio page.
    pub fn audio_page(&mut self, packet: &[u8]) -> Vec<u8> {
        self.granule_position += SAMPLES_PER_FRAME;
        let page = build_page(
            0,
            self.granule_position,
            self.serial,
            self.page_sequence,
            packet,
        );
        self.page_sequence = self.page_sequence.wrapping_add(1);
        page
    }

    pub fn headers_written(&self) -> bool {
        self.headers_written
    }

    pub fn granule_position(&self) -> u64 {
        self.granule_position
    }
}

/// Incremental parser for the microphone transcoder's Ogg/Opus stdout.
///
/// Feeds of arbitrary byte chunks yield completed Opus packets; the
/// OpusHead/OpusTags header pages are recognized by magic and skipped, and
/// pages with bad CRCs are dropped. Packets may span pages (continuation
/// flag), which the parser stitches back together.
pub struct OggPacketReader {
    buf: Vec<u8>,
    partial: Vec<u8>,
}

impl Default for OggPacketReader {
    fn default() -> Self {
        Self::new()
    }
}

impl OggPacketReader {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            partial: Vec::new(),
        }
    }

    /// Consume a chunk and return any completed audio packets.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(data);
        let mut packets = Vec::new();

        loop {
            // Resync to the next capture pattern
            match find_magic(&self.buf) {
                Some(0) => {}
                Some(offset) => {
                    debug!("Ogg resync: skipping {} byte(s)", offset);
                    self.buf.drain(..offset);
                }
                None => {
                    // Nothing that can start a page; keep at most the last
                    // three bytes in case a magic straddles the chunk edge
                    let keep = self.buf.len().min(3);
                    self.buf.drain(..self.buf.len() - keep);
                    break;
                }
            }

            if self.buf.len() < 27 {
                break;
            }
            let segment_count = self.buf[26] as usize;
            let header_len = 27 + segment_count;
            if self.buf.len() < header_len {
                break;
            }

            let body_len: usize = self.buf[27..header_len].iter().map(|&b| b as usize).sum();
            let page_len = header_len + body_len;
            if self.buf.len() < page_len {
                break;
            }

            let page: Vec<u8> = self.buf.drain(..page_len).collect();
            self.consume_page(&page, header_len, &mut packets);
        }

        packets
    }

    fn consume_page(&mut self, page: &[u8], header_len: usize, packets: &mut Vec<Vec<u8>>) {
        let mut check = page.to_vec();
        let stored = u32::from_le_bytes([page[22], page[23], page[24], page[25]]);
        check[22..26].fill(0);
        if ogg_crc(&check) != stored {
            warn!("Dropping Ogg page with bad CRC");
            self.partial.clear();
            return;
        }

        let header_type = page[5];
        if header_type & HEADER_TYPE_CONTINUED == 0 {
            self.partial.clear();
        }

        let segments = &page[27..header_len];
        let mut offset = header_len;
        for &lace in segments {
            let end = offset + lace as usize;
            self.partial.extend_from_slice(&page[offset..end]);
            offset = end;
            if lace < 255 {
                let packet = std::mem::take(&mut self.partial);
                if !is_header_packet(&packet) {
                    packets.push(packet);
                }
            }
        }
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == PAGE_MAGIC)
}

fn is_header_packet(packet: &[u8]) -> bool {
    packet.starts_with(OPUS_HEAD_MAGIC) || packet.starts_with(OPUS_TAGS_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_matches_known_vector() {
        // CRC-32/CKSUM without the final complement (the Ogg variant)
        assert_eq!(ogg_crc(b"123456789"), 0x89A1_897F);
        assert_eq!(ogg_crc(&[]), 0);
    }

    #[test]
    fn header_pages_carry_bos_and_magics() {
        let mut writer = OggStreamWriter::new(0x1234_5678);
        let headers = writer.header_pages();

        assert_eq!(&headers[..4], b"OggS");
        assert_eq!(headers[5], 0x02); // BOS on page 0
        let head_body_start = 27 + headers[26] as usize;
        assert_eq!(
            &headers[head_body_start..head_body_start + 8],
            b"OpusHead"
        );

        // Second call emits nothing
        assert!(writer.header_pages().is_empty());
    }

    #[test]
    fn audio_pages_advance_granule_monotonically() {
        let mut writer = OggStreamWriter::new(1);
        writer.header_pages();
        writer.audio_page(&[0xFC; 40]);
        assert_eq!(writer.granule_position(), SAMPLES_PER_FRAME);
        writer.audio_page(&[0xFC; 40]);
        assert_eq!(writer.granule_position(), 2 * SAMPLES_PER_FRAME);
    }

    #[test]
    fn built_pages_have_valid_crc() {
        let mut writer = OggStreamWriter::new(7);
        writer.header_pages();
        let page = writer.audio_page(&[0xAB; 100]);

        let stored = u32::from_le_bytes([page[22], page[23], page[24], page[25]]);
        let mut zeroed = page.clone();
        zeroed[22..26].fill(0);
        assert_eq!(ogg_crc(&zeroed), stored);
    }

    #[test]
    fn lacing_handles_255_boundary() {
        assert_eq!(lacing(0), vec![0]);
        assert_eq!(lacing(254), vec![254]);
        assert_eq!(lacing(255), vec![255, 0]);
        assert_eq!(lacing(600), vec![255, 255, 90]);
    }

    #[test]
    fn reader_skips_headers_and_yields_audio_packets() {
        let mut writer = OggStreamWriter::new(42);
        let mut stream = writer.header_pages();
        stream.extend_from_slice(&writer.audio_page(&[0x01, 0x02, 0x03]));
        stream.extend_from_slice(&writer.audio_page(&[0x04, 0x05]));

        let mut reader = OggPacketReader::new();
        // Feed in awkward chunk sizes to exercise buffering
        let mut packets = Vec::new();
        for chunk in stream.chunks(13) {
            packets.extend(reader.push(chunk));
        }

        assert_eq!(packets, vec![vec![0x01, 0x02, 0x03], vec![0x04, 0x05]]);
    }

    #[test]
    fn reader_resyncs_after_garbage() {
        let mut writer = OggStreamWriter::new(9);
        writer.header_pages();
        let page = writer.audio_page(&[0xEE; 10]);

        let mut reader = OggPacketReader::new();
        let mut stream = vec![0xDE, 0xAD, 0xBE, 0xEF];
        stream.extend_from_slice(&page);

        let packets = reader.push(&stream);
        assert_eq!(packets, vec![vec![0xEE; 10]]);
    }

    fn raw_page(header_type: u8, serial: u32, sequence: u32, segments: &[u8], body: &[u8]) -> Vec<u8> {
        let mut page = Vec::new();
        page.extend_from_slice(b"OggS");
        page.push(0);
        page.push(header_type);
        page.extend_from_slice(&0u64.to_le_bytes());
        page.extend_from_slice(&serial.to_le_bytes());
        page.extend_from_slice(&sequence.to_le_bytes());
        page.extend_from_slice(&0u32.to_le_bytes());
        page.push(segments.len() as u8);
        page.extend_from_slice(segments);
        page.extend_from_slice(body);
        let crc = ogg_crc(&page);
        page[22..26].copy_from_slice(&crc.to_le_bytes());
        page
    }

    #[test]
    fn reader_stitches_packets_across_pages() {
        // A 255-byte lacing value does not terminate the packet; the
        // continuation flag on the next page carries it on
        let mut stream = raw_page(0, 3, 2, &[255], &[0x11; 255]);
        stream.extend_from_slice(&raw_page(HEADER_TYPE_CONTINUED, 3, 3, &[5], &[0x22; 5]));

        let mut reader = OggPacketReader::new();
        let packets = reader.push(&stream);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 260);
        assert_eq!(&packets[0][..255], &[0x11; 255][..]);
        assert_eq!(&packets[0][255..], &[0x22; 5][..]);
    }

    #[test]
    fn reader_drops_corrupted_page() {
        let mut writer = OggStreamWriter::new(9);
        writer.header_pages();
        let mut page = writer.audio_page(&[0x55; 8]);
        let last = page.len() - 1;
        page[last] ^= 0xFF;

        let mut reader = OggPacketReader::new();
        assert!(reader.push(&page).is_empty());
    }
}
