//! Target instruction set architectures.

use std::fmt;

use crate::macho::{CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_ARM64_32, CPU_TYPE_X86_64};

/// Architectures a cache can be built for.
///
/// arm64e is represented as [`Architecture::Arm64`]; pointer authentication
/// is a property of the image, not of the instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Architecture {
    /// 32-bit ARM (armv7, armv7s, armv7k), ARM and Thumb code.
    Arm,
    /// 64-bit ARM, including arm64e.
    Arm64,
    /// 64-bit ARM instructions with 32-bit pointers.
    Arm64_32,
    /// x86_64 and x86_64h.
    X86_64,
}

impl Architecture {
    /// Parses the architecture part of a cache magic or file name.
    pub fn from_cache_name(name: &str) -> Option<Self> {
        match name.trim() {
            "armv7" | "armv7s" | "armv7k" | "armv7f" => Some(Self::Arm),
            "arm64" | "arm64e" => Some(Self::Arm64),
            "arm64_32" => Some(Self::Arm64_32),
            "x86_64" | "x86_64h" => Some(Self::X86_64),
            _ => None,
        }
    }

    /// Determines the architecture from a Mach-O header's CPU type.
    pub fn from_cpu(cputype: u32) -> Option<Self> {
        match cputype {
            CPU_TYPE_ARM => Some(Self::Arm),
            CPU_TYPE_ARM64 => Some(Self::Arm64),
            CPU_TYPE_ARM64_32 => Some(Self::Arm64_32),
            CPU_TYPE_X86_64 => Some(Self::X86_64),
            _ => None,
        }
    }

    /// Size of a pointer in bytes.
    #[inline]
    pub fn pointer_size(self) -> usize {
        match self {
            Self::Arm | Self::Arm64_32 => 4,
            Self::Arm64 | Self::X86_64 => 8,
        }
    }

    /// Returns true for architectures with 64-bit pointers.
    #[inline]
    pub fn is_64bit(self) -> bool {
        self.pointer_size() == 8
    }

    /// Returns the canonical name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Arm => "arm",
            Self::Arm64 => "arm64",
            Self::Arm64_32 => "arm64_32",
            Self::X86_64 => "x86_64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
