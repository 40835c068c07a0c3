//! ELF type aliases selected by the target's pointer width.

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "riscv64",
    target_arch = "arm",
)))]
compile_error!("unsupport arch");

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        pub(crate) type Dyn = elf::dynamic::Elf64_Dyn;
        pub(crate) type Phdr = elf::segment::Elf64_Phdr;
        pub(crate) type Rel = elf::relocation::Elf64_Rel;
        pub(crate) type Rela = elf::relocation::Elf64_Rela;
        pub(crate) type Sym = elf::symbol::Elf64_Sym;
        /// Shift extracting the symbol table index from `r_info` (ELF64_R_SYM).
        pub(crate) const REL_BIT: usize = 32;
    } else {
        pub(crate) type Dyn = elf::dynamic::Elf32_Dyn;
        pub(crate) type Phdr = elf::segment::Elf32_Phdr;
        pub(crate) type Rel = elf::relocation::Elf32_Rel;
        pub(crate) type Rela = elf::relocation::Elf32_Rela;
        pub(crate) type Sym = Elf32Sym;
        /// Shift extracting the symbol table index from `r_info` (ELF32_R_SYM).
        pub(crate) const REL_BIT: usize = 8;
    }
}

/// 32-bit ELF symbol table entry, the native layout of ELF32 files.
/// On 64-bit targets the `Sym` alias points at `elf::symbol::Elf64_Sym` instead.
#[allow(unused)]
#[repr(C)]
pub(crate) struct Elf32Sym {
    pub st_name: u32,
    pub st_value: u32,
    pub st_size: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
}
