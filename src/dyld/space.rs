//! Address translation over the cache files.

use zerocopy::FromBytes;

use super::chain::ChainRegion;
use super::context::ImageEntry;
use crate::arch::Architecture;
use crate::error::{Error, Result};
use crate::macho::{MachHeader, MachHeader64, MachOContext, MH_MAGIC_64};
use crate::util;

/// Read-only view of one or more cooperating cache files as a single
/// virtual address space.
pub trait AddressSpace {
    /// Translates a virtual address to `(file offset, file index)`.
    fn translate(&self, addr: u64) -> Option<(u64, usize)>;

    /// Returns `len` bytes at a file offset, or `None` if out of bounds.
    fn read_bytes(&self, file_index: usize, offset: u64, len: usize) -> Option<&[u8]>;

    /// Returns the bytes at a virtual address.
    fn data_at_addr(&self, addr: u64, len: usize) -> Result<&[u8]> {
        let (offset, file_index) = self.translate(addr).ok_or(Error::AddressNotFound { addr })?;
        self.read_bytes(file_index, offset, len).ok_or(Error::BufferTooSmall {
            needed: offset as usize + len,
            available: offset as usize,
        })
    }

    /// Reads a u16 at a virtual address.
    fn read_u16_at(&self, addr: u64) -> Result<u16> {
        Ok(util::read_u16_le(self.data_at_addr(addr, 2)?))
    }

    /// Reads a u32 at a virtual address.
    fn read_u32_at(&self, addr: u64) -> Result<u32> {
        Ok(util::read_u32_le(self.data_at_addr(addr, 4)?))
    }

    /// Reads a u64 at a virtual address.
    fn read_u64_at(&self, addr: u64) -> Result<u64> {
        Ok(util::read_u64_le(self.data_at_addr(addr, 8)?))
    }

    /// Returns true if the address is mapped.
    fn contains_addr(&self, addr: u64) -> bool {
        self.translate(addr).is_some()
    }
}

/// A shared cache: an address space plus its image table and slide info.
pub trait SharedCache: AddressSpace {
    /// Architecture the cache was built for.
    fn architecture(&self) -> Architecture;

    /// Every image in the cache, in table order.
    fn images(&self) -> &[ImageEntry];

    /// Collects the chained pointer regions of every slid mapping.
    fn chain_regions(&self) -> Result<Vec<ChainRegion>>;

    /// Finds an image by its exact install path.
    fn image_by_path(&self, path: &str) -> Option<&ImageEntry> {
        self.images().iter().find(|img| img.path == path)
    }

    /// Parses an image's header and load commands straight from the cache.
    ///
    /// The returned context holds only the header region, enough for
    /// lookups that read everything else through the cache.
    fn image_macho(&self, image: &ImageEntry) -> Result<MachOContext> {
        let magic = self.read_u32_at(image.address)?;
        let header_size = if magic == MH_MAGIC_64 {
            MachHeader64::SIZE
        } else {
            MachHeader::SIZE
        };

        // ncmds and sizeofcmds sit at the same offsets in both widths.
        let header = self.data_at_addr(image.address, header_size)?;
        let sizeofcmds = MachHeader::read_from_prefix(header)
            .map_err(|_| Error::parse(0, "failed to parse image header"))?
            .0
            .sizeofcmds as usize;

        let bytes = self.data_at_addr(image.address, header_size + sizeofcmds)?;
        MachOContext::new(bytes.to_vec())
    }
}
