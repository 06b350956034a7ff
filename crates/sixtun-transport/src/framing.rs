//! Record framing for stream transports.
//!
//! A TCP byte stream does not preserve send boundaries, so each envelope has to
//! be delimited explicitly on the wire. Datagram transports carry exactly one
//! envelope per datagram and never go through this module.
//!
//! | Framing          | Wire layout                                   |
//! |------------------|-----------------------------------------------|
//! | `HeaderLength`   | `[outer header (20)] [rest]`, sized by header bytes 2..4 |
//! | `LengthPrefixed` | `[len: u16 BE] [envelope]`                     |
//! | `Raw`            | `[envelope]`, one read is taken as one record  |

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the fixed outer header that starts every envelope
pub const OUTER_HEADER_LEN: usize = 20;

/// Offset of the big-endian total-length field inside the outer header
const TOTAL_LENGTH_OFFSET: usize = 2;

/// Size of the `LengthPrefixed` record prefix
const LENGTH_PREFIX_LEN: usize = 2;

/// How envelopes are delimited on a stream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// Use the total-length field of the outer header itself; no extra bytes on the wire
    #[default]
    HeaderLength,
    /// Two-byte big-endian length before every envelope
    LengthPrefixed,
    /// No delimiting; every successful read is handed over as one record
    Raw,
}

impl Framing {
    /// Stable lowercase name used in configuration files
    pub fn as_str(&self) -> &'static str {
        match self {
            Framing::HeaderLength => "header-length",
            Framing::LengthPrefixed => "length-prefixed",
            Framing::Raw => "raw",
        }
    }

    /// Write one record.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the record cannot be represented in this
    /// framing, or any write error from the stream.
    pub async fn write_record<W>(&self, writer: &mut W, record: &[u8]) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        match self {
            Framing::HeaderLength | Framing::Raw => {
                writer.write_all(record).await?;
            }
            Framing::LengthPrefixed => {
                let len = u16::try_from(record.len()).map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("record of {} bytes exceeds length prefix", record.len()),
                    )
                })?;
                // Single write so one record never straddles two segments needlessly
                let mut buf = Vec::with_capacity(LENGTH_PREFIX_LEN + record.len());
                buf.extend_from_slice(&len.to_be_bytes());
                buf.extend_from_slice(record);
                writer.write_all(&buf).await?;
            }
        }
        writer.flush().await
    }

    /// Read one record into `buf`, resizing it to the record length.
    ///
    /// Returns `Ok(None)` on a clean end of stream at a record boundary.
    ///
    /// # Errors
    ///
    /// Returns `UnexpectedEof` if the stream ends inside a record and
    /// `InvalidData` if the delimiter is inconsistent or exceeds `max_len`.
    pub async fn read_record<R>(
        &self,
        reader: &mut R,
        buf: &mut Vec<u8>,
        max_len: usize,
    ) -> io::Result<Option<usize>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        match self {
            Framing::HeaderLength => {
                buf.resize(OUTER_HEADER_LEN, 0);
                if !read_full_or_eof(reader, &mut buf[..]).await? {
                    return Ok(None);
                }

                let total = u16::from_be_bytes([
                    buf[TOTAL_LENGTH_OFFSET],
                    buf[TOTAL_LENGTH_OFFSET + 1],
                ]) as usize;
                if total < OUTER_HEADER_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("total length {total} shorter than outer header"),
                    ));
                }
                check_max(total, max_len)?;

                buf.resize(total, 0);
                reader.read_exact(&mut buf[OUTER_HEADER_LEN..]).await?;
                Ok(Some(total))
            }
            Framing::LengthPrefixed => {
                let mut prefix = [0u8; LENGTH_PREFIX_LEN];
                if !read_full_or_eof(reader, &mut prefix).await? {
                    return Ok(None);
                }

                let len = u16::from_be_bytes(prefix) as usize;
                check_max(len, max_len)?;

                buf.resize(len, 0);
                reader.read_exact(&mut buf[..]).await?;
                Ok(Some(len))
            }
            Framing::Raw => {
                buf.resize(max_len, 0);
                let n = reader.read(&mut buf[..]).await?;
                buf.truncate(n);
                Ok((n > 0).then_some(n))
            }
        }
    }
}

impl std::fmt::Display for Framing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "header-length" => Ok(Framing::HeaderLength),
            "length-prefixed" => Ok(Framing::LengthPrefixed),
            "raw" => Ok(Framing::Raw),
            other => Err(format!(
                "unknown framing '{other}' (expected header-length, length-prefixed or raw)"
            )),
        }
    }
}

fn check_max(len: usize, max_len: usize) -> io::Result<()> {
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("record of {len} bytes exceeds limit of {max_len}"),
        ));
    }
    Ok(())
}

/// Fill `buf` completely. Returns `false` if the stream was already at EOF.
async fn read_full_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended after {filled} of {} bytes", buf.len()),
            ));
        }
        filled += n;
    }
    Ok(true)
}
