//! Read-only, memory-mapped access to 2-D integer `.npy` arrays.
//!
//! The format is described in
//! [npy-format](https://numpy.org/doc/stable/reference/generated/numpy.lib.format.html).
//! Only C-ordered little-endian integer arrays are supported; each row is
//! decoded to `i64` on access.

use memmap2::{Mmap, MmapOptions};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

const NPY_MAGIC_STRING: &[u8] = b"\x93NUMPY";

#[derive(Error, Debug)]
pub enum NpyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid npy header: {0}")]
    Header(String),
    #[error("Unsupported dtype {0}")]
    UnsupportedDtype(String),
    #[error("Fortran-ordered arrays are not supported")]
    FortranOrder,
    #[error("Expected a 1-D or 2-D array, got shape {0:?}")]
    Shape(Vec<usize>),
    #[error("File holds {got} data bytes, header promises {expected}")]
    Truncated { got: usize, expected: usize },
    #[error("Row {row} out of range for {rows} rows")]
    RowOutOfRange { row: usize, rows: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpyDtype {
    U8,
    I16,
    U16,
    I32,
    I64,
}

impl NpyDtype {
    fn parse(descr: &str) -> Result<Self, NpyError> {
        if descr.starts_with('>') {
            return Err(NpyError::UnsupportedDtype(descr.to_string()));
        }
        match descr.trim_matches(|c: char| c == '=' || c == '<' || c == '|') {
            "B" | "u1" => Ok(Self::U8),
            "h" | "i2" => Ok(Self::I16),
            "H" | "u2" => Ok(Self::U16),
            "i" | "i4" => Ok(Self::I32),
            "q" | "i8" => Ok(Self::I64),
            other => Err(NpyError::UnsupportedDtype(other.to_string())),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 => 4,
            Self::I64 => 8,
        }
    }

    fn decode(&self, bytes: &[u8]) -> i64 {
        match self {
            Self::U8 => bytes[0] as i64,
            Self::I16 => i16::from_le_bytes([bytes[0], bytes[1]]) as i64,
            Self::U16 => u16::from_le_bytes([bytes[0], bytes[1]]) as i64,
            Self::I32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
            Self::I64 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&bytes[..8]);
                i64::from_le_bytes(b)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Header {
    dtype: NpyDtype,
    fortran_order: bool,
    shape: Vec<usize>,
}

impl Header {
    // Parses dict-literal headers such as
    // {'descr': '<i8', 'fortran_order': False, 'shape': (100, 250), }
    fn parse(header: &str) -> Result<Self, NpyError> {
        let header =
            header.trim_matches(|c: char| c == '{' || c == '}' || c == ',' || c.is_whitespace());

        let mut parts = Vec::new();
        let mut start = 0usize;
        let mut depth = 0i32;
        for (i, c) in header.char_indices() {
            match c {
                '(' => depth += 1,
                ')' => depth -= 1,
                ',' if depth == 0 => {
                    parts.push(&header[start..i]);
                    start = i + 1;
                }
                _ => {}
            }
        }
        parts.push(&header[start..]);

        let mut fields = HashMap::new();
        for part in parts.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
            let Some((key, value)) = part.split_once(':') else {
                return Err(NpyError::Header(format!("unable to parse {part:?}")));
            };
            let key = key.trim_matches(|c: char| c == '\'' || c.is_whitespace());
            let value = value.trim_matches(|c: char| c == '\'' || c.is_whitespace());
            fields.insert(key, value);
        }

        let dtype = fields
            .get("descr")
            .ok_or_else(|| NpyError::Header("no descr".to_string()))
            .and_then(|d| NpyDtype::parse(d))?;
        let fortran_order = match fields.get("fortran_order").copied() {
            None | Some("False") => false,
            Some("True") => true,
            Some(other) => return Err(NpyError::Header(format!("fortran_order {other}"))),
        };
        let shape = fields
            .get("shape")
            .ok_or_else(|| NpyError::Header("no shape".to_string()))?
            .trim_matches(|c: char| c == '(' || c == ')' || c == ',')
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<usize>()
                    .map_err(|_| NpyError::Header(format!("bad dimension {s:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            dtype,
            fortran_order,
            shape,
        })
    }
}

/// A memory-mapped `[rows, row_len]` integer array.
#[derive(Debug)]
pub struct NpyRows {
    mmap: Mmap,
    data_offset: usize,
    dtype: NpyDtype,
    rows: usize,
    row_len: usize,
}

impl NpyRows {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, NpyError> {
        let file = File::open(path)?;
        // SAFETY: read-only mapping; label files are not modified while training.
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let (header, data_offset) = read_header(&mmap)?;
        let header = Header::parse(header)?;
        if header.fortran_order {
            return Err(NpyError::FortranOrder);
        }
        let (rows, row_len) = match header.shape.as_slice() {
            [rows] => (*rows, 1),
            [rows, row_len] => (*rows, *row_len),
            other => return Err(NpyError::Shape(other.to_vec())),
        };

        let expected = rows * row_len * header.dtype.size();
        let got = mmap.len() - data_offset;
        if got < expected {
            return Err(NpyError::Truncated { got, expected });
        }

        Ok(Self {
            mmap,
            data_offset,
            dtype: header.dtype,
            rows,
            row_len,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn row_len(&self) -> usize {
        self.row_len
    }

    pub fn dtype(&self) -> NpyDtype {
        self.dtype
    }

    /// Decode one row.
    pub fn row(&self, row: usize) -> Result<Vec<i64>, NpyError> {
        if row >= self.rows {
            return Err(NpyError::RowOutOfRange {
                row,
                rows: self.rows,
            });
        }
        let elem = self.dtype.size();
        let start = self.data_offset + row * self.row_len * elem;
        let bytes = &self.mmap[start..start + self.row_len * elem];
        Ok(bytes.chunks_exact(elem).map(|b| self.dtype.decode(b)).collect())
    }
}

/// Returns the header text and the offset of the first data byte.
fn read_header(bytes: &[u8]) -> Result<(&str, usize), NpyError> {
    if bytes.len() < 10 || &bytes[..NPY_MAGIC_STRING.len()] != NPY_MAGIC_STRING {
        return Err(NpyError::Header("magic string mismatch".to_string()));
    }
    let (header_len, header_start) = match bytes[6] {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(NpyError::Header("truncated header".to_string()));
            }
            let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
            (len as usize, 12)
        }
        v => return Err(NpyError::Header(format!("unsupported version {v}"))),
    };
    let end = header_start + header_len;
    if bytes.len() < end {
        return Err(NpyError::Header("truncated header".to_string()));
    }
    let header = std::str::from_utf8(&bytes[header_start..end])
        .map_err(|_| NpyError::Header("header is not utf-8".to_string()))?;
    Ok((header, end))
}
