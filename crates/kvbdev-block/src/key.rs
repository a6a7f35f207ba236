//! Key synthesis for block storage
//!
//! Maps block offsets to the fixed-width keys stored on the key-value SSD.
//!
//! ```text
//! byte offset 0x3000, sector size 512
//!   → LBA 24
//!   → key [18 00 00 00 00 00 00 00 | 00 00 00 00 00 00 00 00]
//!          LBA, little-endian          zero padding
//! ```

use kvbdev_common::Lba;

/// Width of every key handed to the engine
pub const KEY_WIDTH: usize = 16;

/// Size of a SCSI UNMAP block descriptor on the wire
pub const UNMAP_DESCRIPTOR_LEN: usize = 16;

/// Convert a sector-aligned byte offset to a logical block address.
///
/// The caller guarantees `byte_offset` is a multiple of `sector_size` and
/// that `sector_size` is non-zero.
#[must_use]
pub fn offset_to_lba(byte_offset: u64, sector_size: u32) -> Lba {
    byte_offset / u64::from(sector_size)
}

/// Logical block address named by an unmap descriptor
#[must_use]
pub fn unmap_descriptor_to_lba(descriptor: &UnmapDescriptor) -> Lba {
    descriptor.lba()
}

/// Encode a logical block address into a key
#[must_use]
pub fn encode_key(lba: Lba) -> [u8; KEY_WIDTH] {
    let mut key = [0u8; KEY_WIDTH];
    write_key(lba, &mut key);
    key
}

/// Encode a logical block address into an existing key buffer.
///
/// Bytes past the address are zeroed.
pub fn write_key(lba: Lba, key: &mut [u8; KEY_WIDTH]) {
    let (addr, pad) = key.split_at_mut(8);
    addr.copy_from_slice(&lba.to_le_bytes());
    pad.fill(0);
}

/// Decode the logical block address from a key.
///
/// Returns `None` if the key is not exactly [`KEY_WIDTH`] bytes.
#[must_use]
pub fn decode_key(key: &[u8]) -> Option<Lba> {
    if key.len() != KEY_WIDTH {
        return None;
    }
    let lba: [u8; 8] = key[..8].try_into().ok()?;
    Some(Lba::from_le_bytes(lba))
}

/// One SCSI UNMAP block descriptor.
///
/// Fields are kept in wire form: 8-byte big-endian LBA, 4-byte big-endian
/// block count, 4 reserved bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnmapDescriptor {
    raw: [u8; UNMAP_DESCRIPTOR_LEN],
}

impl UnmapDescriptor {
    /// Build a descriptor for `block_count` blocks starting at `lba`
    #[must_use]
    pub fn new(lba: Lba, block_count: u32) -> Self {
        let mut raw = [0u8; UNMAP_DESCRIPTOR_LEN];
        raw[..8].copy_from_slice(&lba.to_be_bytes());
        raw[8..12].copy_from_slice(&block_count.to_be_bytes());
        Self { raw }
    }

    /// Parse a descriptor from its wire form
    #[must_use]
    pub const fn from_bytes(raw: [u8; UNMAP_DESCRIPTOR_LEN]) -> Self {
        Self { raw }
    }

    /// Parse every descriptor in an UNMAP parameter list body.
    ///
    /// Trailing bytes that do not form a whole descriptor are ignored.
    #[must_use]
    pub fn parse_list(body: &[u8]) -> Vec<Self> {
        body.chunks_exact(UNMAP_DESCRIPTOR_LEN)
            .filter_map(|chunk| chunk.try_into().ok().map(Self::from_bytes))
            .collect()
    }

    /// Starting logical block address
    #[must_use]
    pub fn lba(&self) -> Lba {
        let mut lba = [0u8; 8];
        lba.copy_from_slice(&self.raw[..8]);
        Lba::from_be_bytes(lba)
    }

    /// Number of blocks to unmap
    #[must_use]
    pub fn block_count(&self) -> u32 {
        let mut count = [0u8; 4];
        count.copy_from_slice(&self.raw[8..12]);
        u32::from_be_bytes(count)
    }

    /// Wire form
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; UNMAP_DESCRIPTOR_LEN] {
        &self.raw
    }
}

impl std::fmt::Debug for UnmapDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnmapDescriptor")
            .field("lba", &self.lba())
            .field("block_count", &self.block_count())
            .finish()
    }
}
