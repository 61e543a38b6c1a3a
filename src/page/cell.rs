//! Cell encoding and decoding.
//!
//! Cells are the variable-length records stored within B-tree pages.
//! Every cell carries a signed 64-bit row key. Leaf cells add the row
//! payload; interior cells add the page number of the child that holds all
//! keys less than or equal to the cell's key.

use crate::types::{decode_varint, put_varint, varint_size, zigzag_decode, zigzag_encode, PageId};

/// Type of cell stored in a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    /// Leaf cell: key + payload
    Leaf,
    /// Interior cell: key + left child pointer
    Interior,
}

/// A cell within a B-tree page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Type of this cell
    pub cell_type: CellType,
    /// The row key
    pub key: i64,
    /// The payload bytes (only for leaf cells)
    pub payload: Vec<u8>,
    /// Left child page pointer (only for interior cells)
    pub left_child: PageId,
}

impl Cell {
    /// Create a new leaf cell with key and payload
    pub fn new_leaf(key: i64, payload: Vec<u8>) -> Self {
        Self {
            cell_type: CellType::Leaf,
            key,
            payload,
            left_child: PageId::INVALID,
        }
    }

    /// Create a new interior cell with key and left child pointer
    pub fn new_interior(key: i64, left_child: PageId) -> Self {
        Self {
            cell_type: CellType::Interior,
            key,
            payload: Vec::new(),
            left_child,
        }
    }

    /// Calculate the encoded size of this cell in bytes
    pub fn encoded_size(&self) -> usize {
        let key_size = varint_size(zigzag_encode(self.key));
        match self.cell_type {
            CellType::Leaf => {
                varint_size(self.payload.len() as u64) + key_size + self.payload.len()
            }
            CellType::Interior => 4 + key_size,
        }
    }

    /// Encode this cell into bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size());

        match self.cell_type {
            CellType::Leaf => {
                // payload_len: varint, key: zigzag varint, payload
                put_varint(&mut buf, self.payload.len() as u64);
                put_varint(&mut buf, zigzag_encode(self.key));
                buf.extend_from_slice(&self.payload);
            }
            CellType::Interior => {
                // left_child: u32 (big-endian), key: zigzag varint
                buf.extend_from_slice(&self.left_child.value().to_be_bytes());
                put_varint(&mut buf, zigzag_encode(self.key));
            }
        }

        buf
    }

    /// Decode only the key of a leaf cell, skipping the payload copy
    pub fn decode_leaf_key(bytes: &[u8]) -> Option<i64> {
        let (_, n) = decode_varint(bytes)?;
        let (key, _) = decode_varint(bytes.get(n..)?)?;
        Some(zigzag_decode(key))
    }

    /// Decode a leaf cell from bytes
    ///
    /// Returns the cell and the number of bytes consumed.
    pub fn decode_leaf(bytes: &[u8]) -> Option<(Self, usize)> {
        let (payload_len, mut offset) = decode_varint(bytes)?;
        let (key, n) = decode_varint(bytes.get(offset..)?)?;
        offset += n;

        let payload_len = usize::try_from(payload_len).ok()?;
        let end = offset.checked_add(payload_len)?;
        let payload = bytes.get(offset..end)?.to_vec();

        Some((Self::new_leaf(zigzag_decode(key), payload), end))
    }

    /// Decode an interior cell from bytes
    ///
    /// Returns the cell and the number of bytes consumed.
    pub fn decode_interior(bytes: &[u8]) -> Option<(Self, usize)> {
        let child = bytes.get(..4)?;
        let left_child = u32::from_be_bytes([child[0], child[1], child[2], child[3]]);
        let (key, n) = decode_varint(bytes.get(4..)?)?;

        Some((
            Self::new_interior(zigzag_decode(key), PageId::new(left_child)),
            4 + n,
        ))
    }
}
