use super::{
    PacketRecord, LINK_TYPE_ETHERNET, MAGIC_MICROS, SNAP_LEN, VERSION_MAJOR, VERSION_MINOR,
};
use bytes::{BufMut, Bytes, BytesMut};

pub const FILE_HEADER_LEN: usize = 24;
pub const RECORD_HEADER_LEN: usize = 16;

/// The global file header of merged output: little-endian, microsecond
/// resolution, version 2.4, snapshot length 65535, Ethernet link type.
/// Written exactly once per output stream, before any record.
pub fn file_header() -> Bytes {
    let mut buf = BytesMut::with_capacity(FILE_HEADER_LEN);
    buf.put_u32_le(MAGIC_MICROS);
    buf.put_u16_le(VERSION_MAJOR);
    buf.put_u16_le(VERSION_MINOR);
    buf.put_u32_le(0); // thiszone
    buf.put_u32_le(0); // sigfigs
    buf.put_u32_le(SNAP_LEN);
    buf.put_u32_le(LINK_TYPE_ETHERNET);
    buf.freeze()
}

/// Frame one record: a 16-byte record header followed by the raw bytes.
/// The record's own capture metadata is preserved, with the timestamp
/// fraction rounded down to microseconds to match the output header.
pub fn encode_record(record: &PacketRecord) -> Bytes {
    let mut buf = BytesMut::with_capacity(RECORD_HEADER_LEN + record.data.len());
    buf.put_u32_le(record.ts_sec);
    buf.put_u32_le(record.ts_nanos / 1_000);
    buf.put_u32_le(record.data.len() as u32);
    buf.put_u32_le(record.orig_len);
    buf.extend_from_slice(&record.data);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_header_layout() {
        let header = file_header();
        assert_eq!(header.len(), FILE_HEADER_LEN);
        assert_eq!(&header[0..4], &[0xd4, 0xc3, 0xb2, 0xa1]); // LE magic.
        assert_eq!(&header[4..8], &[2, 0, 4, 0]); // Version 2.4.
        assert_eq!(&header[16..20], &[0xff, 0xff, 0, 0]); // Snap length 65535.
        assert_eq!(&header[20..24], &[1, 0, 0, 0]); // Ethernet.
    }

    #[test]
    fn record_framing() {
        let record = PacketRecord {
            ts_sec: 0x01020304,
            ts_nanos: 7_000, // 7 microseconds.
            orig_len: 1500,
            data: Bytes::from_static(b"abc"),
        };
        let framed = encode_record(&record);
        assert_eq!(framed.len(), RECORD_HEADER_LEN + 3);
        assert_eq!(&framed[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&framed[4..8], &[7, 0, 0, 0]);
        assert_eq!(&framed[8..12], &[3, 0, 0, 0]); // Captured length.
        assert_eq!(&framed[12..16], &[0xdc, 0x05, 0, 0]); // Original length 1500.
        assert_eq!(&framed[16..], b"abc");
    }
}
