use super::{
    DecodeError, PacketRecord, FILE_HEADER_LEN, MAGIC_MICROS, MAGIC_NANOS, RECORD_HEADER_LEN,
    VERSION_MAJOR,
};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tokio::io::{AsyncRead, AsyncReadExt};

// Upper bound on a record's claimed capture length, checked before
// allocating. Well above any sane snapshot length.
const MAX_RECORD_LEN: u32 = 1 << 26;

#[derive(Debug, Clone, Copy)]
enum Endian {
    Little,
    Big,
}

impl Endian {
    fn u16(self, buf: &[u8]) -> u16 {
        match self {
            Endian::Little => LittleEndian::read_u16(buf),
            Endian::Big => BigEndian::read_u16(buf),
        }
    }

    fn u32(self, buf: &[u8]) -> u32 {
        match self {
            Endian::Little => LittleEndian::read_u32(buf),
            Endian::Big => BigEndian::read_u32(buf),
        }
    }
}

/// Pulls `PacketRecord`s out of one capture stream.
///
/// The decoder is lazy: records are read from the underlying stream only as
/// they're asked for, and a clean end-of-stream at a record boundary ends
/// the sequence without error.
#[derive(Debug)]
pub struct Decoder<R> {
    reader: R,
    endian: Endian,
    nanos: bool,
    /// Link-layer type declared by the stream's global header.
    pub link_type: u32,
    /// Snapshot length declared by the stream's global header.
    pub snap_len: u32,
}

impl<R: AsyncRead + Unpin> Decoder<R> {
    /// Read and validate the global file header, detecting byte order and
    /// timestamp resolution from the magic number.
    pub async fn new(mut reader: R) -> Result<Self, DecodeError> {
        let mut header = [0u8; FILE_HEADER_LEN];
        reader.read_exact(&mut header).await?;

        let le_magic = LittleEndian::read_u32(&header[0..4]);
        let be_magic = BigEndian::read_u32(&header[0..4]);
        let (endian, nanos) = if le_magic == MAGIC_MICROS {
            (Endian::Little, false)
        } else if le_magic == MAGIC_NANOS {
            (Endian::Little, true)
        } else if be_magic == MAGIC_MICROS {
            (Endian::Big, false)
        } else if be_magic == MAGIC_NANOS {
            (Endian::Big, true)
        } else {
            // Neither byte order matched; report the bytes in wire order.
            return Err(DecodeError::BadMagic(be_magic));
        };

        let major = endian.u16(&header[4..6]);
        let minor = endian.u16(&header[6..8]);
        if major != VERSION_MAJOR {
            return Err(DecodeError::UnsupportedVersion(major, minor));
        }

        Ok(Self {
            reader,
            endian,
            nanos,
            snap_len: endian.u32(&header[16..20]),
            link_type: endian.u32(&header[20..24]),
        })
    }

    /// The next record, or `None` at a clean end of stream.
    pub async fn next(&mut self) -> Result<Option<PacketRecord>, DecodeError> {
        let mut head = [0u8; RECORD_HEADER_LEN];
        if !read_exact_or_eof(&mut self.reader, &mut head).await? {
            return Ok(None);
        }

        let ts_sec = self.endian.u32(&head[0..4]);
        let ts_frac = self.endian.u32(&head[4..8]);
        let cap_len = self.endian.u32(&head[8..12]);
        let orig_len = self.endian.u32(&head[12..16]);

        if cap_len > MAX_RECORD_LEN {
            return Err(DecodeError::OversizedRecord {
                claimed: cap_len,
                bound: MAX_RECORD_LEN,
            });
        }

        let mut data = vec![0u8; cap_len as usize];
        self.reader
            .read_exact(&mut data)
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::UnexpectedEof => DecodeError::TruncatedRecord,
                _ => DecodeError::Io(err),
            })?;

        let ts_nanos = if self.nanos {
            ts_frac
        } else {
            ts_frac.saturating_mul(1_000)
        };

        Ok(Some(PacketRecord {
            ts_sec,
            ts_nanos,
            orig_len,
            data: data.into(),
        }))
    }
}

// Fill `buf` from `reader`, distinguishing a clean EOF before the first byte
// (Ok(false)) from a stream that ends partway through (TruncatedRecord).
async fn read_exact_or_eof<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<bool, DecodeError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(DecodeError::TruncatedRecord);
        }
        filled += n;
    }
    Ok(true)
}
