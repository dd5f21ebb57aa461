//! Structural checks run before an image is touched.

use crate::error::{Error, Result};
use crate::macho::{MachOContext, LC_FUNCTION_STARTS, SECT_TEXT, SEG_LINKEDIT, SEG_TEXT};

/// Alignment the cache builder gives `__LINKEDIT`.
pub const LINKEDIT_ALIGNMENT: u64 = 0x4000;

/// Checks that the image has every structure extraction relies on.
///
/// The first missing element is reported as [`Error::MissingStructure`];
/// a `__LINKEDIT` that is not the last, highest and page aligned segment is
/// reported as [`Error::MalformedLayout`].
pub fn validate(macho: &MachOContext) -> Result<()> {
    let linkedit = macho.linkedit_segment().ok_or(Error::MissingStructure {
        element: "__LINKEDIT segment",
    })?;
    macho.text_segment().ok_or(Error::MissingStructure {
        element: "__TEXT segment",
    })?;
    macho
        .section(SEG_TEXT, SECT_TEXT)
        .ok_or(Error::MissingStructure {
            element: "__TEXT,__text section",
        })?;
    macho.symtab().ok_or(Error::MissingStructure {
        element: "LC_SYMTAB",
    })?;
    macho.dysymtab().ok_or(Error::MissingStructure {
        element: "LC_DYSYMTAB",
    })?;
    if !macho.segments().any(|seg| seg.command.is_writable()) {
        return Err(Error::MissingStructure {
            element: "writable data segment",
        });
    }
    macho
        .linkedit_data(LC_FUNCTION_STARTS)
        .ok_or(Error::MissingStructure {
            element: "LC_FUNCTION_STARTS",
        })?;

    let last = macho.segments().last().map(|seg| seg.name());
    if last != Some(SEG_LINKEDIT) {
        return Err(Error::MalformedLayout {
            reason: "__LINKEDIT is not the last segment",
        });
    }
    let vmaddr = linkedit.command.vmaddr;
    if macho.segments().any(|seg| seg.command.vmaddr > vmaddr) {
        return Err(Error::MalformedLayout {
            reason: "__LINKEDIT is not the highest segment",
        });
    }
    if vmaddr % LINKEDIT_ALIGNMENT != 0 {
        return Err(Error::MalformedLayout {
            reason: "__LINKEDIT is not page aligned",
        });
    }

    Ok(())
}
