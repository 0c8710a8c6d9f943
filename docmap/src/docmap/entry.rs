use super::{Location, WEIGHT_PRECISION};
use crate::{codec, mime::Mime};
use bytes::BufMut;

/// Metadata of a single document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Entry {
    pub docno: u64,
    pub fileno: u32,
    pub offset: u64,
    pub bytes: u32,
    pub compressed: bool,
    pub words: u32,
    pub distinct_words: u32,
    pub mime: Mime,
    pub trecno: Vec<u8>,
    pub weight: f32,
}

/// Length of the longest common prefix of `a` and `b`.
pub(super) fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

impl Entry {
    /// Reset to the all-zero entry that precedes the first entry of every page.
    pub(super) fn reset(&mut self) {
        self.docno = 0;
        self.fileno = 0;
        self.offset = 0;
        self.bytes = 0;
        self.compressed = false;
        self.words = 0;
        self.distinct_words = 0;
        self.mime = Mime::default();
        self.trecno.clear();
        self.weight = 0.0;
    }

    /// Where the raw bytes of the document live.
    pub fn location(&self) -> Location {
        Location {
            fileno: self.fileno,
            offset: self.offset,
            bytes: self.bytes,
            mime: self.mime,
            compressed: self.compressed,
        }
    }

    /// Append the encoding of `self`, relative to `prev`, to `buf`.
    ///
    /// `self` must follow `prev` in docno, fileno and trecno order and satisfy
    /// `distinct_words <= words` and `2 * words <= bytes + 1`.
    pub(super) fn encode(&self, prev: &Entry, buf: &mut impl BufMut) {
        if self.fileno == prev.fileno && self.offset == prev.offset + prev.bytes as u64 {
            codec::write_vbyte(0, buf);
        } else {
            codec::write_vbyte((self.fileno - prev.fileno) as u64 + 1, buf);
            codec::write_vbyte(self.offset, buf);
        }
        codec::write_vbyte((self.docno - prev.docno) << 1 | self.compressed as u64, buf);
        codec::write_vbyte(self.distinct_words as u64, buf);
        codec::write_vbyte((self.words - self.distinct_words) as u64, buf);
        codec::write_vbyte(self.bytes as u64 + 1 - 2 * self.words as u64, buf);
        codec::write_vbyte(self.mime.ordinal() as u64, buf);

        let prefix = common_prefix(&prev.trecno, &self.trecno);
        codec::write_vbyte(prefix as u64, buf);
        codec::write_vbyte((self.trecno.len() - prefix) as u64, buf);
        buf.put_slice(&self.trecno[prefix..]);

        codec::write_float(self.weight, WEIGHT_PRECISION, buf);
    }

    /// Replace `self` with the entry encoded next in `buf`.
    pub(super) fn decode_next(&mut self, buf: &mut &[u8]) -> Result<(), codec::Error> {
        match codec::read_vbyte(buf)? {
            0 => {
                self.offset = self
                    .offset
                    .checked_add(self.bytes as u64)
                    .ok_or(codec::Error::InvalidData("offset overflow"))?;
            }
            gap => {
                self.fileno = u32::try_from(gap - 1)
                    .ok()
                    .and_then(|gap| self.fileno.checked_add(gap))
                    .ok_or(codec::Error::InvalidData("fileno overflow"))?;
                self.offset = codec::read_vbyte(buf)?;
            }
        }

        let docno = codec::read_vbyte(buf)?;
        self.docno = self
            .docno
            .checked_add(docno >> 1)
            .ok_or(codec::Error::InvalidData("docno overflow"))?;
        self.compressed = docno & 1 == 1;

        self.distinct_words = codec::read_vbyte_u32(buf)?;
        self.words = codec::read_vbyte_u32(buf)?
            .checked_add(self.distinct_words)
            .ok_or(codec::Error::InvalidData("words overflow"))?;
        let bytes = codec::read_vbyte(buf)?
            .checked_add(2 * self.words as u64)
            .and_then(|bytes| bytes.checked_sub(1))
            .ok_or(codec::Error::InvalidData("invalid length"))?;
        self.bytes = u32::try_from(bytes).map_err(|_| codec::Error::InvalidData("bytes overflow"))?;
        self.mime = Mime::new(codec::read_vbyte_u32(buf)?);

        let prefix = codec::read_vbyte(buf)? as usize;
        let suffix = codec::read_vbyte(buf)? as usize;
        if prefix > self.trecno.len() {
            return Err(codec::Error::InvalidData("trecno prefix too long"));
        }
        self.trecno.truncate(prefix);
        self.trecno.extend_from_slice(codec::read_slice(buf, suffix)?);

        self.weight = codec::read_float(buf, WEIGHT_PRECISION)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;

    fn entry(docno: u64, fileno: u32, offset: u64, trecno: &[u8]) -> Entry {
        Entry {
            docno,
            fileno,
            offset,
            bytes: 100,
            compressed: false,
            words: 20,
            distinct_words: 10,
            mime: Mime::default(),
            trecno: trecno.to_vec(),
            weight: codec::quantize(2.5, WEIGHT_PRECISION),
        }
    }

    fn decode_all(buf: &[u8], count: usize) -> Vec<Entry> {
        let mut buf = buf;
        let mut current = Entry::default();
        let mut decoded = Vec::new();
        for _ in 0..count {
            current.decode_next(&mut buf).unwrap();
            decoded.push(current.clone());
        }
        assert!(buf.is_empty());
        decoded
    }

    #[test_traced]
    fn test_common_prefix() {
        assert_eq!(common_prefix(b"", b"abc"), 0);
        assert_eq!(common_prefix(b"abc", b"abd"), 2);
        assert_eq!(common_prefix(b"abc", b"abcdef"), 3);
        assert_eq!(common_prefix(b"xyz", b"abc"), 0);
    }

    #[test_traced]
    fn test_contiguous_entries() {
        let entries = vec![
            entry(0, 0, 0, b"FT911-1"),
            entry(1, 0, 100, b"FT911-2"),
            entry(2, 0, 200, b"FT911-10"),
        ];
        let mut buf = Vec::new();
        let mut prev = Entry::default();
        for entry in &entries {
            entry.encode(&prev, &mut buf);
            prev = entry.clone();
        }
        assert_eq!(decode_all(&buf, entries.len()), entries);

        // The second entry is contiguous and shares six bytes of its identifier
        let mut second = Vec::new();
        entries[1].encode(&entries[0], &mut second);
        assert_eq!(second[0], 0);
        assert_eq!(&second[6..9], &[6, 1, b'2']);
    }

    #[test_traced]
    fn test_repository_change() {
        let mut first = entry(7, 2, 0, b"A");
        first.compressed = true;
        let mut second = entry(8, 5, 0, b"B");
        second.mime = Mime::TEXT_HTML;
        second.bytes = 1;
        second.words = 1;
        second.distinct_words = 1;

        let mut buf = Vec::new();
        first.encode(&Entry::default(), &mut buf);
        second.encode(&first, &mut buf);

        // Fileno gap (3) + 1, explicit offset
        let mut tail = Vec::new();
        second.encode(&first, &mut tail);
        assert_eq!(&tail[..2], &[4, 0]);

        assert_eq!(decode_all(&buf, 2), vec![first, second]);
    }

    #[test_traced]
    fn test_weight_quantized() {
        let mut e = entry(0, 0, 0, b"X");
        e.weight = 0.123_456;
        let mut buf = Vec::new();
        e.encode(&Entry::default(), &mut buf);

        let mut decoded = Entry::default();
        decoded.decode_next(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded.weight, codec::quantize(0.123_456, WEIGHT_PRECISION));
    }

    #[test_traced]
    fn test_decode_truncated() {
        let e = entry(3, 1, 77, b"truncated");
        let mut buf = Vec::new();
        e.encode(&Entry::default(), &mut buf);
        for len in 0..buf.len() {
            let mut decoded = Entry::default();
            assert!(decoded.decode_next(&mut &buf[..len]).is_err());
        }
    }

    #[test_traced]
    fn test_decode_invalid_prefix() {
        // Contiguous, docno 0, no words, 1 byte, default mime, prefix 5 of an empty identifier
        let buf = [0u8, 0, 0, 0, 2, 3, 5, 0, 0, 0];
        let mut decoded = Entry::default();
        assert_eq!(
            decoded.decode_next(&mut &buf[..]),
            Err(codec::Error::InvalidData("trecno prefix too long"))
        );
    }

    #[test_traced]
    fn test_reset() {
        let mut e = entry(9, 4, 12, b"reset");
        e.reset();
        assert_eq!(e, Entry::default());
    }
}
