//! `spec.md` §4.2 — de-interleaves in-band ICY metadata from the audio
//! byte stream at a fixed interval, with pseudo-sticky dedup against the
//! previously active raw metadata string.

use std::io::{self, Read};

/// Result of pulling the next chunk out of a [`MetaStripper`].
pub enum StripEvent {
    /// `n` audio bytes were written to the caller's buffer; no metadata
    /// marker was hit in this call.
    Audio(usize),
    /// `n` audio bytes were written, and a *new* (non-duplicate) metadata
    /// event was extracted right after them.
    AudioThenMetadata(usize, Vec<u8>),
    /// The underlying reader reached EOF.
    Eof,
}

/// Strips ICY in-band metadata from `reader`, per `spec.md` §4.2. When
/// `metadata_interval` is `None` (or `Some(0)`), the stripper degenerates
/// to a pass-through: no metadata is ever extracted.
pub struct MetaStripper<R> {
    reader: R,
    metadata_interval: Option<u32>,
    since_marker: u32,
    last_raw: Option<Vec<u8>>,
}

impl<R: Read> MetaStripper<R> {
    /// Wraps `reader`, tracking the ICY `metadata_interval` byte counter.
    #[must_use]
    pub fn new(reader: R, metadata_interval: Option<u32>) -> Self {
        Self {
            reader,
            metadata_interval: metadata_interval.filter(|&n| n > 0),
            since_marker: 0,
            last_raw: None,
        }
    }

    /// Reads the next event. `buf` must be non-empty; at most
    /// `bytes_until_next_marker` audio bytes are written per call so the
    /// caller never has to special-case a metadata block landing
    /// mid-buffer.
    pub fn next_event(&mut self, buf: &mut [u8]) -> io::Result<StripEvent> {
        debug_assert!(!buf.is_empty());

        let audio_budget = match self.metadata_interval {
            Some(interval) => (interval - self.since_marker) as usize,
            None => buf.len(),
        };
        let want = audio_budget.min(buf.len()).max(1);

        let n = read_some(&mut self.reader, &mut buf[..want])?;
        if n == 0 {
            return Ok(StripEvent::Eof);
        }

        let Some(interval) = self.metadata_interval else {
            return Ok(StripEvent::Audio(n));
        };

        self.since_marker += n as u32;
        if self.since_marker < interval {
            return Ok(StripEvent::Audio(n));
        }

        self.since_marker = 0;
        match self.read_metadata_block()? {
            Some(raw) if self.last_raw.as_deref() != Some(raw.as_slice()) => {
                self.last_raw = Some(raw.clone());
                Ok(StripEvent::AudioThenMetadata(n, raw))
            },
            _ => Ok(StripEvent::Audio(n)),
        }
    }

    fn read_metadata_block(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut len_byte = [0u8; 1];
        if read_some(&mut self.reader, &mut len_byte)? == 0 {
            return Ok(None);
        }

        let len = len_byte[0] as usize * 16;
        if len == 0 {
            return Ok(None);
        }

        let mut raw = vec![0u8; len];
        self.reader.read_exact(&mut raw)?;
        while raw.last() == Some(&0) {
            raw.pop();
        }
        Ok(Some(raw))
    }
}

/// Like `Read::read` but retries on `Interrupted` and treats a `0`-byte
/// read from a non-empty buffer request as EOF (never as "try again").
fn read_some(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn metadata_block(text: &str) -> Vec<u8> {
        let mut bytes = text.as_bytes().to_vec();
        let padded = bytes.len().div_ceil(16) * 16;
        bytes.resize(padded, 0);
        let mut out = vec![(padded / 16) as u8];
        out.extend(bytes);
        out
    }

    #[test]
    fn extracts_metadata_after_interval() {
        let mut stream = vec![b'a'; 8];
        stream.extend(metadata_block("StreamTitle='X - Y';"));
        stream.extend(vec![b'b'; 8]);

        let mut stripper = MetaStripper::new(Cursor::new(stream), Some(8));
        let mut buf = [0u8; 8];

        let first = stripper.next_event(&mut buf).unwrap();
        match first {
            StripEvent::AudioThenMetadata(n, raw) => {
                assert_eq!(n, 8);
                assert_eq!(&raw, b"StreamTitle='X - Y';");
            },
            _ => panic!("expected metadata on first event"),
        }
    }

    #[test]
    fn suppresses_duplicate_title() {
        let block = metadata_block("StreamTitle='Same';");
        let mut stream = vec![b'a'; 4];
        stream.extend(block.clone());
        stream.extend(vec![b'a'; 4]);
        stream.extend(block);
        stream.extend(vec![b'a'; 4]);

        let mut stripper = MetaStripper::new(Cursor::new(stream), Some(4));
        let mut buf = [0u8; 4];

        let first = stripper.next_event(&mut buf).unwrap();
        assert!(matches!(first, StripEvent::AudioThenMetadata(_, _)));

        let second = stripper.next_event(&mut buf).unwrap();
        assert!(matches!(second, StripEvent::Audio(_)));
    }

    #[test]
    fn zero_length_byte_emits_no_event() {
        let mut stream = vec![b'a'; 4];
        stream.push(0); // length byte 0: no metadata payload follows
        stream.extend(vec![b'a'; 4]);

        let mut stripper = MetaStripper::new(Cursor::new(stream), Some(4));
        let mut buf = [0u8; 4];
        let first = stripper.next_event(&mut buf).unwrap();
        assert!(matches!(first, StripEvent::Audio(4)));
    }

    #[test]
    fn passthrough_without_metadata_interval() {
        let stream = vec![b'x'; 16];
        let mut stripper = MetaStripper::new(Cursor::new(stream), None);
        let mut buf = [0u8; 16];
        let event = stripper.next_event(&mut buf).unwrap();
        assert!(matches!(event, StripEvent::Audio(16)));
    }
}
