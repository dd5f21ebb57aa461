//! Image buffer assembly and output.
//!
//! Inside the cache an image's segments are scattered across mappings and
//! their file offsets point into the cache files. The writer copies the
//! segments into one private buffer at compact, page aligned offsets and
//! rewrites every file offset in the load commands to match.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::debug;

use crate::dyld::{ImageEntry, SharedCache};
use crate::error::{Error, Result};
use crate::macho::{LoadCommandInfo, MachOContext, SEG_LINKEDIT};
use crate::util::align_up;

/// Page size for alignment.
const PAGE_SIZE: u64 = 0x4000;

/// Where a segment lands in the output buffer.
#[derive(Debug, Clone)]
struct Placement {
    command_offset: usize,
    vmaddr: u64,
    old_fileoff: u64,
    new_fileoff: u64,
    filesize: u64,
    /// `(offset of the section's file offset field, stored value)`
    sections: Vec<(usize, u32)>,
    is_linkedit: bool,
}

/// Copies an image out of the cache into a private, standalone buffer.
///
/// The first segment with contents must start at the image address, since
/// it carries the header and load commands.
pub fn load_image<C: SharedCache + ?Sized>(cache: &C, image: &ImageEntry) -> Result<MachOContext> {
    let header = cache.image_macho(image)?;
    let is_64bit = header.is_64bit;
    let section_field = if is_64bit { 48 } else { 40 };

    let mut placements = Vec::new();
    let mut write_offset = 0u64;
    for seg in header.segments().filter(|seg| seg.command.filesize > 0) {
        placements.push(Placement {
            command_offset: seg.command_offset,
            vmaddr: seg.command.vmaddr,
            old_fileoff: seg.command.fileoff,
            new_fileoff: write_offset,
            filesize: seg.command.filesize,
            sections: seg
                .sections
                .iter()
                .map(|s| (s.struct_offset + section_field, s.section.offset))
                .collect(),
            is_linkedit: seg.name() == SEG_LINKEDIT,
        });
        write_offset = align_up(write_offset + seg.command.filesize, PAGE_SIZE);
    }

    match placements.first() {
        Some(first) if first.vmaddr == image.address => {}
        _ => {
            return Err(Error::MalformedLayout {
                reason: "first segment does not start at the image address",
            })
        }
    }

    let total = placements
        .last()
        .map(|p| p.new_fileoff + p.filesize)
        .unwrap_or(0);
    let mut data = vec![0u8; total as usize];
    for p in &placements {
        let bytes = cache.data_at_addr(p.vmaddr, p.filesize as usize)?;
        let start = p.new_fileoff as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    let mut macho = MachOContext::new(data)?;
    for p in &placements {
        if is_64bit {
            macho.write_u64(p.command_offset + 40, p.new_fileoff)?;
        } else {
            macho.write_u32(p.command_offset + 32, p.new_fileoff as u32)?;
        }
        for &(field, old) in &p.sections {
            if old != 0 {
                let new = p.new_fileoff + (u64::from(old) - p.old_fileoff);
                macho.write_u32(field, new as u32)?;
            }
        }
    }

    if let Some(linkedit) = placements.iter().find(|p| p.is_linkedit) {
        let delta = linkedit.new_fileoff as i64 - linkedit.old_fileoff as i64;
        if delta != 0 {
            update_linkedit_load_commands(&mut macho, delta)?;
        }
    }

    debug!(
        "{}: assembled {} segments into {:#x} bytes",
        image.basename(),
        placements.len(),
        total
    );

    // Parse again so the typed view reflects the new offsets.
    MachOContext::new(macho.data)
}

/// Shifts every LINKEDIT offset in the load commands by `delta`.
///
/// Offset fields whose paired count or size is zero are left alone.
fn update_linkedit_load_commands(macho: &mut MachOContext, delta: i64) -> Result<()> {
    // (offset field, count field) pairs relative to the command.
    let mut fields: Vec<(usize, usize)> = Vec::new();
    for lc in &macho.load_commands {
        let base = lc.offset();
        let pairs: &[(usize, usize)] = match lc {
            LoadCommandInfo::Symtab { .. } => &[(8, 12), (16, 20)],
            LoadCommandInfo::Dysymtab { .. } => {
                &[(32, 36), (40, 44), (48, 52), (56, 60), (64, 68), (72, 76)]
            }
            LoadCommandInfo::DyldInfo { .. } => &[(8, 12), (16, 20), (24, 28), (32, 36), (40, 44)],
            LoadCommandInfo::LinkeditData { .. } => &[(8, 12)],
            _ => &[],
        };
        fields.extend(pairs.iter().map(|&(off, count)| (base + off, base + count)));
    }

    for (field, count) in fields {
        if macho.read_u32(count)? > 0 {
            update_offset_field(macho, field, delta)?;
        }
    }

    Ok(())
}

/// Updates an offset field by adding a delta.
fn update_offset_field(macho: &mut MachOContext, offset: usize, delta: i64) -> Result<()> {
    let old_value = macho.read_u32(offset)?;
    if old_value != 0 {
        let new_value = (old_value as i64 + delta) as u32;
        macho.write_u32(offset, new_value)?;
    }
    Ok(())
}

/// Writes the reconstructed image to a file, creating parent directories.
pub fn write_macho<P: AsRef<Path>>(macho: &MachOContext, output_path: P) -> Result<()> {
    let path = output_path.as_ref();
    let write_error = |source| Error::FileWrite {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_error)?;
    }

    let file = File::create(path).map_err(write_error)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(macho.as_bytes()).map_err(write_error)?;
    writer.flush().map_err(write_error)?;

    Ok(())
}
