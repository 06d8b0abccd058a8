//! Ogg page boundary scanning. We only need page start offsets to align
//! splits, not the packet/stream reconstruction a full Ogg demuxer would
//! give us, so this reads the page header fields directly rather than
//! pulling in a decoding crate.

use super::FrameAdapter;

const CAPTURE_PATTERN: &[u8; 4] = b"OggS";

struct PageHeader {
    size: usize,
}

fn parse_page(buf: &[u8], at: usize) -> Option<PageHeader> {
    if at + 27 > buf.len() || &buf[at..at + 4] != CAPTURE_PATTERN {
        return None;
    }

    let page_segments = buf[at + 26] as usize;
    let table_end = at + 27 + page_segments;
    if table_end > buf.len() {
        return None;
    }

    let body_len: usize = buf[at + 27..table_end].iter().map(|&b| b as usize).sum();
    Some(PageHeader {
        size: 27 + page_segments + body_len,
    })
}

/// [`FrameAdapter`] for Ogg page boundaries.
pub struct OggAdapter;

impl FrameAdapter for OggAdapter {
    fn boundaries(&self, buf: &[u8]) -> Vec<usize> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos + 27 <= buf.len() {
            match parse_page(buf, pos) {
                Some(page) if page.size > 0 => {
                    out.push(pos);
                    pos += page.size;
                },
                _ => pos += 1,
            }
        }
        out
    }

    fn detect_bitrate_kbps(&self, _buf: &[u8]) -> Option<u32> {
        // Ogg bitrate is a stream-level identification-header property,
        // not something recoverable from arbitrary page boundaries.
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthesize_page(body_len: usize) -> Vec<u8> {
        let mut segments = Vec::new();
        let mut remaining = body_len;
        while remaining >= 255 {
            segments.push(255u8);
            remaining -= 255;
        }
        segments.push(remaining as u8);

        let mut page = Vec::new();
        page.extend_from_slice(CAPTURE_PATTERN);
        page.push(0); // version
        page.push(0x02); // header_type (first page)
        page.extend_from_slice(&0u64.to_le_bytes()); // granule position
        page.extend_from_slice(&1u32.to_le_bytes()); // serial
        page.extend_from_slice(&0u32.to_le_bytes()); // sequence number
        page.extend_from_slice(&0u32.to_le_bytes()); // checksum (unchecked here)
        page.push(segments.len() as u8);
        page.extend_from_slice(&segments);
        page.extend(std::iter::repeat(0xAAu8).take(body_len));
        page
    }

    #[test]
    fn finds_consecutive_page_boundaries() {
        let mut stream = synthesize_page(50);
        let first_len = stream.len();
        stream.extend(synthesize_page(300));

        let adapter = OggAdapter;
        assert_eq!(adapter.boundaries(&stream), vec![0, first_len]);
    }

    #[test]
    fn garbage_has_no_boundaries() {
        let stream = vec![0u8; 64];
        let adapter = OggAdapter;
        assert!(adapter.boundaries(&stream).is_empty());
    }
}
