//! Fax page container header
//!
//! Layout, little-endian:
//!
//! ```text
//! +------------+----------+-----+------------+-----+-------------+
//! | resolution | format   | len | station id | len | header line |
//! | 2 bytes    | 2 bytes  | 1   | len bytes  | 1   | len bytes   |
//! +------------+----------+-----+------------+-----+-------------+
//! ```
//!
//! Each length byte holds the exact byte count of the string after it, so
//! strings are limited to 255 bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{TelephonyError, TelephonyResult};

const MAX_FIELD_LEN: usize = u8::MAX as usize;

/// Vertical resolution tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    Standard,
    Fine,
}

impl Resolution {
    pub fn tag(self) -> u16 {
        match self {
            Resolution::Standard => 0,
            Resolution::Fine => 1,
        }
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            0 => Some(Resolution::Standard),
            1 => Some(Resolution::Fine),
            _ => None,
        }
    }
}

/// Page data format tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageFormat {
    /// Structured fax file
    Sff,
    /// Plain G3 data
    PlainFax,
    Tiff,
    Ascii,
}

impl PageFormat {
    pub fn tag(self) -> u16 {
        match self {
            PageFormat::Sff => 0,
            PageFormat::PlainFax => 1,
            PageFormat::Tiff => 4,
            PageFormat::Ascii => 5,
        }
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            0 => Some(PageFormat::Sff),
            1 => Some(PageFormat::PlainFax),
            4 => Some(PageFormat::Tiff),
            5 => Some(PageFormat::Ascii),
            _ => None,
        }
    }
}

/// Header preceding the page payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaxPageHeader {
    pub resolution: Resolution,
    pub format: PageFormat,
    pub station_id: String,
    pub header_line: String,
}

impl FaxPageHeader {
    /// Create a header, rejecting strings that do not fit a length byte
    pub fn new(
        resolution: Resolution,
        format: PageFormat,
        station_id: impl Into<String>,
        header_line: impl Into<String>,
    ) -> TelephonyResult<Self> {
        let header = Self {
            resolution,
            format,
            station_id: station_id.into(),
            header_line: header_line.into(),
        };
        header.check_lengths()?;
        Ok(header)
    }

    fn check_lengths(&self) -> TelephonyResult<()> {
        for (field, value) in [("station_id", &self.station_id), ("header_line", &self.header_line)] {
            if value.len() > MAX_FIELD_LEN {
                return Err(TelephonyError::HeaderFieldTooLong {
                    field,
                    length: value.len(),
                });
            }
        }
        Ok(())
    }

    /// Number of bytes `encode` produces
    pub fn encoded_len(&self) -> usize {
        2 + 2 + 1 + self.station_id.len() + 1 + self.header_line.len()
    }

    pub fn encode(&self) -> TelephonyResult<Bytes> {
        self.check_lengths()?;

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u16_le(self.resolution.tag());
        buf.put_u16_le(self.format.tag());
        buf.put_u8(self.station_id.len() as u8);
        buf.put_slice(self.station_id.as_bytes());
        buf.put_u8(self.header_line.len() as u8);
        buf.put_slice(self.header_line.as_bytes());

        Ok(buf.freeze())
    }

    /// Parse a header from the front of `data`, returning it with the
    /// remaining page payload
    pub fn decode(mut data: Bytes) -> TelephonyResult<(Self, Bytes)> {
        if data.remaining() < 5 {
            return Err(TelephonyError::InvalidHeader {
                reason: format!("{} bytes is too short", data.remaining()),
            });
        }

        let resolution_tag = data.get_u16_le();
        let resolution = Resolution::from_tag(resolution_tag).ok_or_else(|| TelephonyError::InvalidHeader {
            reason: format!("unknown resolution {}", resolution_tag),
        })?;
        let format_tag = data.get_u16_le();
        let format = PageFormat::from_tag(format_tag).ok_or_else(|| TelephonyError::InvalidHeader {
            reason: format!("unknown format {}", format_tag),
        })?;

        let station_id = take_prefixed_string(&mut data, "station_id")?;
        let header_line = take_prefixed_string(&mut data, "header_line")?;

        Ok((
            Self {
                resolution,
                format,
                station_id,
                header_line,
            },
            data,
        ))
    }
}

fn take_prefixed_string(data: &mut Bytes, field: &str) -> TelephonyResult<String> {
    if !data.has_remaining() {
        return Err(TelephonyError::InvalidHeader {
            reason: format!("missing {} length", field),
        });
    }
    let len = data.get_u8() as usize;
    if data.remaining() < len {
        return Err(TelephonyError::InvalidHeader {
            reason: format!("{} needs {} bytes, {} left", field, len, data.remaining()),
        });
    }
    let raw = data.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| TelephonyError::InvalidHeader {
        reason: format!("{} is not valid UTF-8", field),
    })
}
