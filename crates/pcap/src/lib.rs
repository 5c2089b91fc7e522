//! Reading and writing of libpcap capture files as async streams.
//!
//! A capture file is one fixed 24-byte global header followed by a sequence
//! of framed packet records. The reader detects byte order and timestamp
//! resolution from the magic number; the writer always produces canonical
//! little-endian, microsecond-resolution output so that streams merged from
//! many sources remain a single well-formed capture.

mod read;
mod write;

pub use read::Decoder;
pub use write::{encode_record, file_header, FILE_HEADER_LEN, RECORD_HEADER_LEN};

use bytes::Bytes;

/// Standard magic number, microsecond timestamp resolution.
pub const MAGIC_MICROS: u32 = 0xa1b2_c3d4;
/// Magic number of files carrying nanosecond-resolution timestamps.
pub const MAGIC_NANOS: u32 = 0xa1b2_3c4d;

pub const VERSION_MAJOR: u16 = 2;
pub const VERSION_MINOR: u16 = 4;

/// Snapshot length advertised by merged output headers.
pub const SNAP_LEN: u32 = 65535;
/// LINKTYPE_ETHERNET, the link-layer type of merged output headers.
pub const LINK_TYPE_ETHERNET: u32 = 1;

/// One captured frame together with its record metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    /// Seconds since the Unix epoch.
    pub ts_sec: u32,
    /// Sub-second remainder, in nanoseconds regardless of source resolution.
    pub ts_nanos: u32,
    /// Original wire length of the frame. May exceed `data.len()` when the
    /// capture was truncated at the snapshot length.
    pub orig_len: u32,
    /// Captured link-layer bytes.
    pub data: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("stream does not begin with a pcap magic number (got {0:#010x})")]
    BadMagic(u32),
    #[error("unsupported pcap version {0}.{1}")]
    UnsupportedVersion(u16, u16),
    #[error("record claims {claimed} captured bytes, exceeding the bound of {bound}")]
    OversizedRecord { claimed: u32, bound: u32 },
    #[error("capture stream ended mid-record")]
    TruncatedRecord,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
