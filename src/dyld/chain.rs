//! Chained pointer formats.
//!
//! A slid mapping stores its pointers as linked chains: each slot holds a
//! target (or an import ordinal) plus the distance to the next slot in the
//! same page. This module decodes single slots and page start tables; the
//! walk itself lives in the pointer tracker.

use crate::arch::Architecture;
use crate::util::sign_extend;

use super::structs::*;

/// Pointer authentication data carried by an authenticated slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerAuth {
    /// Extra discriminator
    pub diversity: u16,
    /// Discriminator is blended with the slot address
    pub addr_div: bool,
    /// Key (0 = IA, 1 = IB, 2 = DA, 3 = DB)
    pub key: u8,
}

/// What a single decoded slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeValue {
    /// A plain address.
    Rebase {
        /// Target with the stored high bits restored
        target: u64,
        /// Authentication data, if the slot is signed
        auth: Option<PointerAuth>,
    },
    /// A reference to an imported symbol.
    Bind {
        /// Import ordinal
        ordinal: u32,
        /// Addend applied to the import's address
        addend: i64,
        /// Authentication data, if the slot is signed
        auth: Option<PointerAuth>,
    },
}

/// A decoded slot: its value plus the byte distance to the next slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedNode {
    /// Byte offset to the next slot; zero ends the chain
    pub next: u64,
    /// The slot's value
    pub value: NodeValue,
}

/// Encoding of a chained pointer region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFormat {
    /// Bitmap of 32-bit slots holding plain addresses.
    SlideV1 {
        /// Bytes per page bitmap
        entry_size: u32,
    },
    /// Delta-masked pointers of cache pointer width.
    SlideV2 {
        /// Bits that hold the delta to the next slot
        delta_mask: u64,
        /// Added to every non-zero value
        value_add: u64,
    },
    /// arm64e pointers with pointer authentication.
    SlideV3 {
        /// Base for authenticated pointers
        auth_value_add: u64,
    },
    /// Delta-masked 32-bit pointers with small non-pointer values.
    SlideV4 {
        /// Bits that hold the delta to the next slot
        delta_mask: u64,
        /// Added to every real pointer
        value_add: u64,
    },
    /// arm64e pointers stored as cache-relative offsets.
    SlideV5 {
        /// Base added to every runtime offset
        value_add: u64,
    },
    /// 64-bit chained fixups with 4-byte stride.
    Ptr64,
    /// arm64e chained fixups.
    Arm64e,
    /// 32-bit chained fixups.
    Ptr32,
}

impl ChainFormat {
    /// Bytes encoded by one unit of a page start.
    pub fn stride_unit(&self) -> u64 {
        match self {
            ChainFormat::SlideV3 { .. } | ChainFormat::SlideV5 { .. } | ChainFormat::Arm64e => 8,
            _ => 4,
        }
    }

    /// Largest distance to the next slot a valid chain can encode.
    pub fn max_stride(&self, page_size: u64) -> u64 {
        match self {
            ChainFormat::SlideV1 { .. } => 0,
            ChainFormat::SlideV2 { .. } | ChainFormat::SlideV4 { .. } => page_size,
            ChainFormat::SlideV3 { .. } | ChainFormat::SlideV5 { .. } | ChainFormat::Arm64e => {
                0x7FF * 8
            }
            ChainFormat::Ptr64 => 0xFFF * 4,
            ChainFormat::Ptr32 => 0x1F * 4,
        }
    }

    /// Width in bytes of one slot.
    pub fn slot_width(&self, arch: Architecture) -> usize {
        match self {
            ChainFormat::SlideV1 { .. } | ChainFormat::SlideV4 { .. } | ChainFormat::Ptr32 => 4,
            ChainFormat::SlideV2 { .. } => arch.pointer_size(),
            ChainFormat::SlideV3 { .. }
            | ChainFormat::SlideV5 { .. }
            | ChainFormat::Ptr64
            | ChainFormat::Arm64e => 8,
        }
    }

    /// Decodes the raw bits of one slot.
    pub fn decode(&self, raw: u64) -> DecodedNode {
        match *self {
            ChainFormat::SlideV1 { .. } => DecodedNode {
                next: 0,
                value: NodeValue::Rebase {
                    target: raw,
                    auth: None,
                },
            },

            ChainFormat::SlideV2 {
                delta_mask,
                value_add,
            } => {
                let shift = delta_mask.trailing_zeros().saturating_sub(2);
                let next = (raw & delta_mask) >> shift;
                let mut target = raw & !delta_mask;
                if target != 0 {
                    target = target.wrapping_add(value_add);
                }
                DecodedNode {
                    next,
                    value: NodeValue::Rebase { target, auth: None },
                }
            }

            ChainFormat::SlideV3 { auth_value_add } => {
                let next = ((raw >> 51) & 0x7FF) * 8;
                let value = if raw >> 63 != 0 {
                    NodeValue::Rebase {
                        target: (raw & 0xFFFF_FFFF).wrapping_add(auth_value_add),
                        auth: Some(auth_low(raw)),
                    }
                } else {
                    let value51 = raw & 0x0007_FFFF_FFFF_FFFF;
                    let top8 = value51 & 0x0007_F800_0000_0000;
                    let bottom43 = value51 & 0x0000_07FF_FFFF_FFFF;
                    NodeValue::Rebase {
                        target: (top8 << 13) | bottom43,
                        auth: None,
                    }
                };
                DecodedNode { next, value }
            }

            ChainFormat::SlideV4 {
                delta_mask,
                value_add,
            } => {
                let shift = delta_mask.trailing_zeros().saturating_sub(2);
                let next = (raw & delta_mask) >> shift;
                let value = (raw & !delta_mask) as u32;
                let target = if value & 0xFFFF_8000 == 0 {
                    // Small positive non-pointer.
                    value
                } else if value & 0x3FFF_8000 == 0x3FFF_8000 {
                    // Small negative non-pointer.
                    value | 0xC000_0000
                } else {
                    value.wrapping_add(value_add as u32)
                };
                DecodedNode {
                    next,
                    value: NodeValue::Rebase {
                        target: target as u64,
                        auth: None,
                    },
                }
            }

            ChainFormat::SlideV5 { value_add } => {
                let next = ((raw >> 52) & 0x7FF) * 8;
                let offset = raw & 0x3_FFFF_FFFF;
                let value = if raw >> 63 != 0 {
                    NodeValue::Rebase {
                        target: value_add.wrapping_add(offset),
                        auth: Some(PointerAuth {
                            diversity: (raw >> 34) as u16,
                            addr_div: (raw >> 50) & 1 != 0,
                            // Always an A key: IA for code, DA for data.
                            key: if (raw >> 51) & 1 != 0 { 2 } else { 0 },
                        }),
                    }
                } else {
                    let high8 = (raw >> 34) & 0xFF;
                    NodeValue::Rebase {
                        target: value_add.wrapping_add(offset) | (high8 << 56),
                        auth: None,
                    }
                };
                DecodedNode { next, value }
            }

            ChainFormat::Ptr64 => {
                let next = ((raw >> 51) & 0xFFF) * 4;
                let value = if raw >> 63 != 0 {
                    NodeValue::Bind {
                        ordinal: (raw & 0xFF_FFFF) as u32,
                        addend: ((raw >> 24) & 0xFF) as i64,
                        auth: None,
                    }
                } else {
                    NodeValue::Rebase {
                        target: (raw & 0xF_FFFF_FFFF) | (((raw >> 36) & 0xFF) << 56),
                        auth: None,
                    }
                };
                DecodedNode { next, value }
            }

            ChainFormat::Arm64e => {
                let next = ((raw >> 51) & 0x7FF) * 8;
                let is_bind = (raw >> 62) & 1 != 0;
                let is_auth = raw >> 63 != 0;
                let value = match (is_auth, is_bind) {
                    (true, false) => NodeValue::Rebase {
                        target: raw & 0xFFFF_FFFF,
                        auth: Some(auth_low(raw)),
                    },
                    (true, true) => NodeValue::Bind {
                        ordinal: (raw & 0xFFFF) as u32,
                        addend: 0,
                        auth: Some(auth_low(raw)),
                    },
                    (false, false) => NodeValue::Rebase {
                        target: (raw & 0x7FF_FFFF_FFFF) | (((raw >> 43) & 0xFF) << 56),
                        auth: None,
                    },
                    (false, true) => NodeValue::Bind {
                        ordinal: (raw & 0xFFFF) as u32,
                        addend: sign_extend((raw >> 32) & 0x7_FFFF, 19),
                        auth: None,
                    },
                };
                DecodedNode { next, value }
            }

            ChainFormat::Ptr32 => {
                let next = ((raw >> 26) & 0x1F) * 4;
                let value = if (raw >> 31) & 1 != 0 {
                    NodeValue::Bind {
                        ordinal: (raw & 0xF_FFFF) as u32,
                        addend: ((raw >> 20) & 0x3F) as i64,
                        auth: None,
                    }
                } else {
                    NodeValue::Rebase {
                        target: raw & 0x3FF_FFFF,
                        auth: None,
                    }
                };
                DecodedNode { next, value }
            }
        }
    }
}

/// Authentication fields shared by v3 slide info and arm64e fixups.
fn auth_low(raw: u64) -> PointerAuth {
    PointerAuth {
        diversity: (raw >> 32) as u16,
        addr_div: (raw >> 48) & 1 != 0,
        key: ((raw >> 49) & 0b11) as u8,
    }
}

/// One slid mapping and the tables describing its chains.
#[derive(Debug, Clone)]
pub struct ChainRegion {
    /// Start address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// Bytes covered by one page start
    pub page_size: u64,
    /// Slot encoding
    pub format: ChainFormat,
    /// Page start encodings (the table of contents for v1)
    pub page_starts: Vec<u16>,
    /// Page extras (v2 and v4)
    pub page_extras: Vec<u16>,
    /// Page bitmaps (v1)
    pub bitmaps: Vec<u8>,
}

impl ChainRegion {
    /// Returns true if the region contains the address.
    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.address && addr - self.address < self.size
    }

    /// Returns the page index covering the address.
    #[inline]
    pub fn page_index(&self, addr: u64) -> Option<usize> {
        if !self.contains(addr) || self.page_size == 0 {
            return None;
        }
        Some(((addr - self.address) / self.page_size) as usize)
    }

    /// Returns the number of pages with a page start entry.
    pub fn page_count(&self) -> usize {
        self.page_starts.len()
    }

    /// Decodes the chain start offsets (relative to the page) of a page.
    ///
    /// Returns an empty list for pages without rebases or out-of-range
    /// page indexes. v1 pages yield one entry per set bitmap bit.
    pub fn chain_starts(&self, page_index: usize) -> Vec<u64> {
        let Some(&start) = self.page_starts.get(page_index) else {
            return Vec::new();
        };

        match self.format {
            ChainFormat::SlideV1 { entry_size } => {
                let base = start as usize * entry_size as usize;
                let Some(bitmap) = self.bitmaps.get(base..base + entry_size as usize) else {
                    return Vec::new();
                };
                let mut starts = Vec::new();
                for (byte_index, &byte) in bitmap.iter().enumerate() {
                    for bit in 0..8 {
                        if byte & (1 << bit) != 0 {
                            starts.push((byte_index as u64 * 8 + bit) * 4);
                        }
                    }
                }
                starts
            }

            ChainFormat::SlideV2 { .. } => {
                if start == SLIDE_V2_PAGE_NO_REBASE {
                    Vec::new()
                } else if start & SLIDE_V2_PAGE_EXTRA != 0 {
                    self.extra_starts(
                        (start & SLIDE_V2_PAGE_VALUE_MASK) as usize,
                        SLIDE_V2_PAGE_VALUE_MASK,
                        SLIDE_V2_PAGE_EXTRA_END,
                    )
                } else {
                    vec![start as u64 * 4]
                }
            }

            ChainFormat::SlideV4 { .. } => {
                if start == SLIDE_V4_PAGE_NO_REBASE {
                    Vec::new()
                } else if start & SLIDE_V4_PAGE_USE_EXTRA != 0 {
                    self.extra_starts(
                        (start & SLIDE_V4_PAGE_INDEX) as usize,
                        SLIDE_V4_PAGE_INDEX,
                        SLIDE_V4_PAGE_EXTRA_END,
                    )
                } else {
                    vec![start as u64 * 4]
                }
            }

            _ => {
                if start == SLIDE_V3_PAGE_NO_REBASE {
                    Vec::new()
                } else {
                    vec![start as u64 * self.format.stride_unit()]
                }
            }
        }
    }

    /// Collects a run of extras, stopping at the end marker.
    fn extra_starts(&self, first: usize, value_mask: u16, end: u16) -> Vec<u64> {
        let mut starts = Vec::new();
        for &extra in self.page_extras.iter().skip(first) {
            starts.push((extra & value_mask) as u64 * 4);
            if extra & end != 0 {
                break;
            }
        }
        starts
    }
}
