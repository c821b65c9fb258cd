use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::mem;
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::path::Path;
use std::path::PathBuf;

use memmap2::Mmap;
use nix::libc::{Elf64_Ehdr, Elf64_Shdr, Elf64_Sym};
use rustc_demangle::demangle;
use tracing::debug;

use crate::dwarf::Dwarf;
use crate::error::{Error, Result};
use crate::types::{FileAddr, VirtAddr};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EM_X86_64: u16 = 62;

/// Extract the symbol type from st_info (lower 4 bits)
#[inline]
pub fn elf64_st_type(st_info: u8) -> u8 {
    st_info & 0xf
}

pub const STT_TLS: u8 = 6;
pub const STT_FUNC: u8 = 2;

/// A read-only view over one mapped ELF object.
///
/// Section contents and the strings handed out by [`Elf::get_string`] alias
/// directly into the mapping; they stay valid for as long as the `Elf`
/// lives, and no longer. `Elf` values are unique-owned and never copied.
#[derive(Debug)]
pub struct Elf {
    path: PathBuf,
    file_size: usize,
    mmap: Mmap,

    header: Elf64_Ehdr,

    section_headers: Vec<Elf64_Shdr>,
    // Map section name -> pointer to section header
    section_map: HashMap<String, *const Elf64_Shdr>,

    // Load bias (virtual address offset), zero until notify_loaded
    load_bias: VirtAddr,

    symbol_table: Vec<Elf64_Sym>,
    symbol_name_map: HashMap<String, Vec<*const Elf64_Sym>>,
    // (st_value, st_value + st_size) file-address intervals, ordered by low
    symbol_addr_map: BTreeMap<(u64, u64), *const Elf64_Sym>,

    dwarf_data: Option<Box<Dwarf>>,
}

impl PartialEq for Elf {
    fn eq(&self, other: &Self) -> bool {
        (self as *const _) == (other as *const _)
    }
}

impl Eq for Elf {}

impl Elf {
    pub fn new(path: impl AsRef<Path>) -> Result<Box<Self>> {
        let path_buf = path.as_ref().to_path_buf();
        let file = File::open(&path_buf)?;
        let file_size = file.metadata()?.len() as usize;

        // Memory map the whole file as read-only
        let mmap = unsafe { Mmap::map(&file)? };

        if file_size < mem::size_of::<Elf64_Ehdr>() {
            return Err(Error::UnsupportedElf("file too small".into()));
        }

        // SAFETY: the mapping covers at least one header; the copy is
        // unaligned-safe.
        let header: Elf64_Ehdr =
            unsafe { std::ptr::read_unaligned(mmap.as_ptr() as *const Elf64_Ehdr) };

        if header.e_ident[..4] != ELF_MAGIC {
            return Err(Error::UnsupportedElf("bad magic".into()));
        }
        if header.e_ident[4] != ELFCLASS64 {
            return Err(Error::UnsupportedElf("not a 64-bit object".into()));
        }
        if header.e_ident[5] != ELFDATA2LSB {
            return Err(Error::UnsupportedElf("not little-endian".into()));
        }
        if header.e_machine != EM_X86_64 {
            return Err(Error::UnsupportedElf(format!(
                "unexpected machine {:#x}",
                header.e_machine
            )));
        }

        let mut elf = Box::new(Self {
            path: path_buf,
            file_size,
            mmap,
            header,

            section_headers: Vec::new(),
            section_map: HashMap::new(),

            load_bias: VirtAddr(0),

            symbol_table: Vec::new(),
            symbol_name_map: HashMap::new(),
            symbol_addr_map: BTreeMap::new(),
            dwarf_data: None,
        });

        elf.parse_section_headers()?;
        elf.build_section_map();
        elf.parse_symbol_table()?;
        elf.build_symbol_maps();
        debug!(
            path = %elf.path.display(),
            sections = elf.section_headers.len(),
            symbols = elf.symbol_table.len(),
            "parsed ELF object"
        );
        elf.dwarf_data = Some(Dwarf::new(&elf)?);
        Ok(elf)
    }

    fn data_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Elf64_Ehdr {
        &self.header
    }

    pub fn load_bias(&self) -> VirtAddr {
        self.load_bias
    }

    /// Records where the loader placed this object. Called exactly once,
    /// after the process image is mapped.
    pub fn notify_loaded(&mut self, address: VirtAddr) {
        self.load_bias = address;
    }

    /// Returns the section header that contains the given file address, or None.
    pub fn get_section_containing_addr(&self, addr: FileAddr) -> Option<&Elf64_Shdr> {
        // Addresses tagged with a different object never match
        match addr.elf_file() {
            Some(elf) if elf == self => {}
            _ => return None,
        }

        self.section_headers.iter().find(|section| {
            let start = section.sh_addr;
            let end = section.sh_addr + section.sh_size;
            section.sh_addr != 0 && start <= addr.addr() && addr.addr() < end
        })
    }

    /// Returns the section header that contains the given virtual address, or None.
    pub fn get_section_containing_addr_virt(&self, addr: VirtAddr) -> Option<&Elf64_Shdr> {
        let target_addr = addr.0;

        self.section_headers.iter().find(|section| {
            let start = self.load_bias.0 + section.sh_addr;
            let end = start + section.sh_size;
            section.sh_addr != 0 && start <= target_addr && target_addr < end
        })
    }

    fn parse_section_headers(&mut self) -> Result<()> {
        let header = &self.header;

        let shoff = header.e_shoff as usize;
        let entsize = header.e_shentsize as usize;
        let mut count = header.e_shnum as usize;

        if count == 0 && entsize != 0 {
            // ELF extension: the real count lives in sh_size of header 0
            if shoff + mem::size_of::<Elf64_Shdr>() > self.file_size {
                return Err(Error::UnsupportedElf("section headers out of bounds".into()));
            }
            let first: Elf64_Shdr = unsafe {
                std::ptr::read_unaligned(self.data_ptr().add(shoff) as *const Elf64_Shdr)
            };
            count = first.sh_size as usize;
        }

        if count == 0 || entsize != mem::size_of::<Elf64_Shdr>() {
            return Err(Error::UnsupportedElf(
                "invalid section header count or size".into(),
            ));
        }
        if shoff + count * entsize > self.file_size {
            return Err(Error::UnsupportedElf("section headers out of bounds".into()));
        }

        self.section_headers.reserve(count);
        for i in 0..count {
            // SAFETY: bounds checked above; read_unaligned tolerates any shoff.
            let shdr: Elf64_Shdr = unsafe {
                std::ptr::read_unaligned(
                    self.data_ptr().add(shoff + i * entsize) as *const Elf64_Shdr
                )
            };
            self.section_headers.push(shdr);
        }
        Ok(())
    }

    pub fn get_section_name(&self, section_index: usize) -> Option<&str> {
        let shstrndx = self.header.e_shstrndx as usize;
        if shstrndx >= self.section_headers.len() || section_index >= self.section_headers.len() {
            return None;
        }

        let shstr_section = &self.section_headers[shstrndx];

        let sh_name_offset = self.section_headers[section_index].sh_name as usize;
        let str_offset = shstr_section.sh_offset as usize + sh_name_offset;

        if str_offset >= self.file_size {
            return None;
        }

        unsafe {
            let ptr = self.data_ptr().add(str_offset);
            let c_str = std::ffi::CStr::from_ptr(ptr as *const i8);
            c_str.to_str().ok()
        }
    }

    fn build_section_map(&mut self) {
        for (i, section) in self.section_headers.iter().enumerate() {
            if let Some(name) = self.get_section_name(i) {
                self.section_map
                    .insert(name.to_string(), section as *const _);
            }
        }
    }

    pub fn get_section(&self, name: &str) -> Option<&Elf64_Shdr> {
        self.section_map.get(name).map(|&ptr| unsafe { &*ptr })
    }

    /// Returns the raw bytes of a named section. The slice aliases the
    /// mapping; nothing is copied.
    pub fn get_section_contents(&self, name: &str) -> Option<&[u8]> {
        let section = self.get_section(name)?;
        let offset = section.sh_offset as usize;
        let size = section.sh_size as usize;

        if offset + size > self.file_size {
            return None;
        }

        unsafe { Some(std::slice::from_raw_parts(self.data_ptr().add(offset), size)) }
    }

    fn parse_symbol_table(&mut self) -> Result<()> {
        let symtab = match self
            .get_section(".symtab")
            .or_else(|| self.get_section(".dynsym"))
        {
            Some(sec) => sec,
            // No symbol table is fine; name and address lookups just miss.
            None => return Ok(()),
        };

        let entsize = symtab.sh_entsize as usize;
        let size = symtab.sh_size as usize;
        let offset = symtab.sh_offset as usize;

        if entsize != mem::size_of::<Elf64_Sym>() {
            return Err(Error::UnsupportedElf("bad symbol entry size".into()));
        }
        if size % entsize != 0 || offset + size > self.file_size {
            return Err(Error::UnsupportedElf("bad symbol table geometry".into()));
        }

        let count = size / entsize;
        self.symbol_table.reserve(count);
        for i in 0..count {
            let sym: Elf64_Sym = unsafe {
                std::ptr::read_unaligned(
                    self.data_ptr().add(offset + i * entsize) as *const Elf64_Sym
                )
            };
            self.symbol_table.push(sym);
        }

        Ok(())
    }

    fn build_symbol_maps(&mut self) {
        for symbol in &self.symbol_table {
            let mangled_name = self.get_string(symbol.st_name as usize).to_owned();
            if mangled_name.is_empty() {
                continue;
            }

            let demangled_name = {
                let demangled = demangle(&mangled_name).to_string();
                if demangled == mangled_name {
                    mangled_name.clone()
                } else {
                    demangled
                }
            };

            self.symbol_name_map
                .entry(demangled_name.clone())
                .or_default()
                .push(symbol as *const _);

            if demangled_name != mangled_name {
                self.symbol_name_map
                    .entry(mangled_name)
                    .or_default()
                    .push(symbol as *const _);
            }

            let st_value = symbol.st_value;
            let st_size = symbol.st_size;
            let st_type = elf64_st_type(symbol.st_info);

            if st_value != 0 && st_size > 0 && st_type != STT_TLS {
                self.symbol_addr_map
                    .insert((st_value, st_value + st_size), symbol as *const _);
            }
        }
    }

    /// Returns a string slice from the string table at the given index.
    /// Falls back to ".dynstr" if ".strtab" not found. Returns empty string
    /// if neither exists.
    pub fn get_string(&self, index: usize) -> &str {
        let opt_strtab = self
            .get_section(".strtab")
            .or_else(|| self.get_section(".dynstr"));

        if let Some(strtab) = opt_strtab {
            let str_offset = strtab.sh_offset as usize + index;
            if str_offset >= self.file_size {
                return "";
            }
            // SAFETY: string tables are NUL-terminated by construction; the
            // mapping keeps a terminator in bounds for well-formed objects.
            unsafe {
                let ptr = self.data_ptr().add(str_offset);
                let c_str = std::ffi::CStr::from_ptr(ptr as *const i8);
                c_str.to_str().unwrap_or("")
            }
        } else {
            ""
        }
    }

    pub fn get_section_start_address(&self, name: &str) -> Option<FileAddr> {
        self.get_section(name)
            .map(|sect| FileAddr::from(self, sect.sh_addr))
    }

    pub fn get_symbols_by_name(&self, name: &str) -> Vec<&Elf64_Sym> {
        if let Some(symbols) = self.symbol_name_map.get(name) {
            symbols.iter().map(|&ptr| unsafe { &*ptr }).collect()
        } else {
            Vec::new()
        }
    }

    /// Symbol whose value is exactly `address`.
    pub fn get_symbol_at_address(&self, address: FileAddr) -> Option<&Elf64_Sym> {
        if address.elf_file()? != self {
            return None;
        }

        let mut range = self
            .symbol_addr_map
            .range((Included((address.addr(), 0)), Unbounded));
        if let Some((&(start, _), &ptr)) = range.next() {
            if start == address.addr() {
                return Some(unsafe { &*ptr });
            }
        }
        None
    }

    pub fn get_symbol_at_address_virt(&self, address: VirtAddr) -> Option<&Elf64_Sym> {
        self.get_symbol_at_address(address.to_file_addr(self))
    }

    /// Symbol whose `[st_value, st_value + st_size)` interval covers `address`.
    pub fn get_symbol_containing_address(&self, address: FileAddr) -> Option<&Elf64_Sym> {
        if address.elf_file()? != self || self.symbol_addr_map.is_empty() {
            return None;
        }

        let addr = address.addr();

        // Entry starting exactly at the address
        let mut range = self.symbol_addr_map.range((Included((addr, 0)), Unbounded));
        if let Some((&(start, _), &ptr)) = range.next() {
            if start == addr {
                return Some(unsafe { &*ptr });
            }
        }

        // Otherwise the covering interval, if any, is the one just below
        let mut prev_range = self.symbol_addr_map.range((Unbounded, Excluded((addr, 0))));
        if let Some((&(start, end), &ptr)) = prev_range.next_back() {
            if start < addr && addr < end {
                return Some(unsafe { &*ptr });
            }
        }

        None
    }

    pub fn get_symbol_containing_address_virt(&self, address: VirtAddr) -> Option<&Elf64_Sym> {
        self.get_symbol_containing_address(address.to_file_addr(self))
    }

    pub fn dwarf(&self) -> &Dwarf {
        self.dwarf_data
            .as_ref()
            .expect("DWARF data initialized in Elf::new")
    }
}
