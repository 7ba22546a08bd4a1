//! The slice of ELF64 the loader needs.

use dataview::Pod;

/// "\x7FELF" in little endian.
pub const ELF_MAGIC: u32 = 0x464c_457f;

/// A loadable program segment.
pub const ELF_PROG_LOAD: u32 = 1;

/// The ELF file header.
#[repr(C)]
#[derive(Debug, Clone, Pod)]
pub struct ElfHeader {
    pub magic: u32,
    pub elf: [u8; 12],
    pub ty: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

/// A program header.
#[repr(C)]
#[derive(Debug, Clone, Pod)]
pub struct ProgramHeader {
    pub ty: u32,
    pub flags: u32,
    pub off: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

/// Segment flag bits.
pub const PF_X: u32 = 0x1;
pub const PF_W: u32 = 0x2;
