//! Mach-O constants.

// =============================================================================
// Magic Numbers
// =============================================================================

/// 64-bit Mach-O magic (little-endian)
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;

/// 32-bit Mach-O magic (little-endian)
pub const MH_MAGIC: u32 = 0xFEEDFACE;

/// Dynamically bound shared library
pub const MH_DYLIB: u32 = 0x6;

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit architecture flag
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;
/// 64-bit instructions with 32-bit pointers
pub const CPU_ARCH_ABI64_32: u32 = 0x0200_0000;

/// ARM CPU type
pub const CPU_TYPE_ARM: u32 = 12;
/// ARM64 CPU type
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;
/// ARM64_32 CPU type
pub const CPU_TYPE_ARM64_32: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64_32;

/// x86 CPU type
pub const CPU_TYPE_X86: u32 = 7;
/// x86_64 CPU type
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;

/// ARM64 all
pub const CPU_SUBTYPE_ARM64_ALL: u32 = 0;
/// ARMv7
pub const CPU_SUBTYPE_ARM_V7: u32 = 9;

// =============================================================================
// Load Commands
// =============================================================================

/// Load command requiring dynamic linker
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

/// 32-bit segment
pub const LC_SEGMENT: u32 = 0x1;
/// Link-edit symbol table info
pub const LC_SYMTAB: u32 = 0x2;
/// Dynamic link-edit symbol table info
pub const LC_DYSYMTAB: u32 = 0xB;
/// Load a dynamically linked shared library
pub const LC_LOAD_DYLIB: u32 = 0xC;
/// Dynamically linked shared lib identification
pub const LC_ID_DYLIB: u32 = 0xD;
/// Load a weak dynamically linked shared library
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
/// 64-bit segment
pub const LC_SEGMENT_64: u32 = 0x19;
/// UUID
pub const LC_UUID: u32 = 0x1B;
/// Local of code signature
pub const LC_CODE_SIGNATURE: u32 = 0x1D;
/// Local of segment split info
pub const LC_SEGMENT_SPLIT_INFO: u32 = 0x1E;
/// Load and re-export dylib
pub const LC_REEXPORT_DYLIB: u32 = 0x1F | LC_REQ_DYLD;
/// Delay load of dylib
pub const LC_LAZY_LOAD_DYLIB: u32 = 0x20;
/// Compressed dyld info
pub const LC_DYLD_INFO: u32 = 0x22;
/// Compressed dyld info only
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
/// Load upward dylib
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
/// Local of function starts
pub const LC_FUNCTION_STARTS: u32 = 0x26;
/// Table of non-instructions in __text
pub const LC_DATA_IN_CODE: u32 = 0x29;
/// Exports trie, used with linkedit_data_command
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;
/// Chained fixups, used with linkedit_data_command
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;

// =============================================================================
// Segment and Section Names
// =============================================================================

/// Text segment name
pub const SEG_TEXT: &str = "__TEXT";
/// Link-edit segment name
pub const SEG_LINKEDIT: &str = "__LINKEDIT";
/// Main code section name
pub const SECT_TEXT: &str = "__text";

// =============================================================================
// Section Types and Attributes
// =============================================================================

/// Section types mask
pub const SECTION_TYPE: u32 = 0x0000_00FF;
/// Section with only non-lazy symbol pointers
pub const S_NON_LAZY_SYMBOL_POINTERS: u32 = 0x6;
/// Section with only lazy symbol pointers
pub const S_LAZY_SYMBOL_POINTERS: u32 = 0x7;
/// Section with symbol stubs
pub const S_SYMBOL_STUBS: u32 = 0x8;
/// Section contains only true machine instructions
pub const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x8000_0000;
/// Section contains some machine instructions
pub const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x0000_0400;

// =============================================================================
// Symbol Table
// =============================================================================

/// Indirect symbol table entry for a local symbol
pub const INDIRECT_SYMBOL_LOCAL: u32 = 0x8000_0000;
/// Indirect symbol table entry for an absolute symbol
pub const INDIRECT_SYMBOL_ABS: u32 = 0x4000_0000;
/// Undefined symbol type
pub const N_UNDF: u8 = 0x0;
/// External symbol bit of `n_type`
pub const N_EXT: u8 = 0x1;

// =============================================================================
// VM Protection
// =============================================================================

/// Readable
pub const VM_PROT_READ: u32 = 0x1;
/// Writable
pub const VM_PROT_WRITE: u32 = 0x2;
/// Executable
pub const VM_PROT_EXECUTE: u32 = 0x4;
