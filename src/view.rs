//! Read-only structural access to a loaded object's dynamic section.
//!
//! Given an object's load base and its `PT_DYNAMIC` segment, [`ElfView`]
//! exposes the symbol table, the string table and the three relocation
//! tables (implicit-addend Rel, explicit-addend Rela and the PLT's Jmprel).
//! Nothing here is parsed from disk; every pointer aliases memory the
//! dynamic linker already mapped.

use crate::{
    Result,
    arch::{Dyn, REL_BIT, Rel, Rela, Sym},
    parse_dynamic_error,
};
use core::ffi::CStr;
use elf::abi::*;

/// String table of a loaded object (`.dynstr`).
pub(crate) struct ElfStringTable {
    data: *const u8,
}

impl ElfStringTable {
    const fn new(data: *const u8) -> Self {
        ElfStringTable { data }
    }

    /// Null-terminated name at `offset`, reinterpreted as UTF-8.
    #[inline]
    fn get_str(&self, offset: usize) -> &'static str {
        unsafe {
            let start = self.data.add(offset).cast();
            core::str::from_utf8_unchecked(CStr::from_ptr(start).to_bytes())
        }
    }
}

/// One relocation entry reduced to the two values the patcher needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelEntry {
    /// Object-relative address of the slot to patch; absolute once the
    /// load base is added.
    pub offset: usize,
    /// Index into the object's symbol table, from the `r_info` word.
    pub symbol_index: usize,
}

/// A relocation table in loaded memory, with either Rel or Rela entries.
#[derive(Clone, Copy)]
pub enum RelTable {
    Rel(&'static [Rel]),
    Rela(&'static [Rela]),
}

impl RelTable {
    pub fn len(&self) -> usize {
        match self {
            RelTable::Rel(entries) => entries.len(),
            RelTable::Rela(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries in on-disk order.
    pub fn entries(self) -> RelEntries {
        RelEntries {
            table: self,
            idx: 0,
        }
    }

    fn entry(&self, idx: usize) -> RelEntry {
        match self {
            RelTable::Rel(entries) => {
                let rel = &entries[idx];
                RelEntry {
                    offset: rel.r_offset as usize,
                    symbol_index: rel.r_info as usize >> REL_BIT,
                }
            }
            RelTable::Rela(entries) => {
                let rela = &entries[idx];
                RelEntry {
                    offset: rela.r_offset as usize,
                    symbol_index: rela.r_info as usize >> REL_BIT,
                }
            }
        }
    }
}

pub struct RelEntries {
    table: RelTable,
    idx: usize,
}

impl Iterator for RelEntries {
    type Item = RelEntry;

    fn next(&mut self) -> Option<RelEntry> {
        if self.idx >= self.table.len() {
            return None;
        }
        let entry = self.table.entry(self.idx);
        self.idx += 1;
        Some(entry)
    }
}

/// Structural view of one loaded object's dynamic section.
pub struct ElfView {
    base: usize,
    symtab: *const Sym,
    strtab: ElfStringTable,
    nsyms: usize,
    rel: Option<RelTable>,
    rela: Option<RelTable>,
    jmprel: Option<RelTable>,
}

impl ElfView {
    /// Parse the dynamic array at `dynamic_ptr` for the object loaded at
    /// `base`.
    ///
    /// # Safety
    /// `dynamic_ptr` must point at the live, `DT_NULL`-terminated dynamic
    /// array of an object currently mapped at `base`.
    pub unsafe fn new(base: usize, dynamic_ptr: *const Dyn) -> Result<ElfView> {
        let mut symtab_off = None;
        let mut strtab_off = None;
        let mut elf_hash_off = None;
        let mut gnu_hash_off = None;
        let mut rel_off = None;
        let mut rel_size = 0;
        let mut rela_off = None;
        let mut rela_size = 0;
        let mut pltrel_off = None;
        let mut pltrel_size = 0;
        let mut pltrel_is_rela = None;

        let mut cur_dyn_ptr = dynamic_ptr;
        unsafe {
            loop {
                let dynamic = &*cur_dyn_ptr;
                match dynamic.d_tag as i64 {
                    DT_SYMTAB => symtab_off = Some(dynamic.d_un as usize),
                    DT_STRTAB => strtab_off = Some(dynamic.d_un as usize),
                    DT_HASH => elf_hash_off = Some(dynamic.d_un as usize),
                    DT_GNU_HASH => gnu_hash_off = Some(dynamic.d_un as usize),
                    DT_REL => rel_off = Some(dynamic.d_un as usize),
                    DT_RELSZ => rel_size = dynamic.d_un as usize,
                    DT_RELA => rela_off = Some(dynamic.d_un as usize),
                    DT_RELASZ => rela_size = dynamic.d_un as usize,
                    DT_JMPREL => pltrel_off = Some(dynamic.d_un as usize),
                    DT_PLTRELSZ => pltrel_size = dynamic.d_un as usize,
                    DT_PLTREL => pltrel_is_rela = Some(dynamic.d_un as i64 == DT_RELA),
                    DT_NULL => break,
                    _ => {}
                }
                cur_dyn_ptr = cur_dyn_ptr.add(1);
            }
        }

        let Some(symtab_off) = symtab_off else {
            return Err(parse_dynamic_error("dynamic section does not have DT_SYMTAB"));
        };
        let Some(strtab_off) = strtab_off else {
            return Err(parse_dynamic_error("dynamic section does not have DT_STRTAB"));
        };

        // glibc rewrites table addresses in the dynamic section to absolute
        // values in place; other loaders leave them image-relative.
        let rebase = |off: usize| if off < base { base + off } else { off };

        let symtab = rebase(symtab_off) as *const Sym;
        let strtab = ElfStringTable::new(rebase(strtab_off) as *const u8);

        let nsyms = if let Some(off) = elf_hash_off {
            unsafe { sysv_symbol_count(rebase(off) as *const u32) }
        } else if let Some(off) = gnu_hash_off {
            unsafe { gnu_symbol_count(rebase(off) as *const u8) }
        } else {
            return Err(parse_dynamic_error(
                "dynamic section does not have DT_GNU_HASH nor DT_HASH",
            ));
        };

        let rel = rel_off.map(|off| unsafe {
            RelTable::Rel(core::slice::from_raw_parts(
                rebase(off) as *const Rel,
                rel_size / size_of::<Rel>(),
            ))
        });
        let rela = rela_off.map(|off| unsafe {
            RelTable::Rela(core::slice::from_raw_parts(
                rebase(off) as *const Rela,
                rela_size / size_of::<Rela>(),
            ))
        });
        let jmprel = match (pltrel_off, pltrel_is_rela) {
            (None, _) => None,
            (Some(_), None) => {
                return Err(parse_dynamic_error(
                    "dynamic section has DT_JMPREL but no DT_PLTREL",
                ));
            }
            (Some(off), Some(true)) => Some(unsafe {
                RelTable::Rela(core::slice::from_raw_parts(
                    rebase(off) as *const Rela,
                    pltrel_size / size_of::<Rela>(),
                ))
            }),
            (Some(off), Some(false)) => Some(unsafe {
                RelTable::Rel(core::slice::from_raw_parts(
                    rebase(off) as *const Rel,
                    pltrel_size / size_of::<Rel>(),
                ))
            }),
        };

        Ok(ElfView {
            base,
            symtab,
            strtab,
            nsyms,
            rel,
            rela,
            jmprel,
        })
    }

    /// The three relocation tables that are present, in Rel, Rela, Jmprel
    /// order.
    pub fn relocation_tables(&self) -> impl Iterator<Item = RelTable> + '_ {
        [self.rel, self.rela, self.jmprel].into_iter().flatten()
    }

    /// Name of the symbol at `index`, or `""` when the index is out of
    /// range.
    pub fn symbol_name(&self, index: usize) -> &'static str {
        if index >= self.nsyms {
            return "";
        }
        let sym = unsafe { &*self.symtab.add(index) };
        self.strtab.get_str(sym.st_name as usize)
    }

    /// Absolute address of the first defined symbol named `name`; `0` when
    /// the object does not export it.
    pub fn address_of(&self, name: &str) -> usize {
        for idx in 0..self.nsyms {
            let sym = unsafe { &*self.symtab.add(idx) };
            if sym.st_shndx == SHN_UNDEF || sym.st_value == 0 {
                continue;
            }
            if self.strtab.get_str(sym.st_name as usize) == name {
                return self.base + sym.st_value as usize;
            }
        }
        0
    }
}

/// `DT_HASH` keeps the symbol count directly: the chain array has one entry
/// per symbol table entry.
unsafe fn sysv_symbol_count(ptr: *const u32) -> usize {
    unsafe { ptr.add(1).read() as usize }
}

/// `DT_GNU_HASH` has no count field; walk the highest bucket's chain to its
/// terminator, as the dynamic linker does.
unsafe fn gnu_symbol_count(ptr: *const u8) -> usize {
    unsafe {
        let header = ptr as *const u32;
        let nbucket = header.read() as usize;
        let symbias = header.add(1).read() as usize;
        let nbloom = header.add(2).read() as usize;

        let blooms = ptr.add(4 * size_of::<u32>());
        let buckets = blooms.add(nbloom * size_of::<usize>()) as *const u32;
        let chains = buckets.add(nbucket);

        let mut nsym = 0;
        for i in 0..nbucket {
            nsym = nsym.max(buckets.add(i).read() as usize);
        }
        if nsym == 0 {
            return symbias;
        }

        let mut val = chains.add(nsym - symbias);
        while val.read() & 1 == 0 {
            nsym += 1;
            val = val.add(1);
        }
        nsym + 1
    }
}
