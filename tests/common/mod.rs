//! Builders for synthetic ELF objects with hand-assembled DWARF sections.
//!
//! Fixtures are written under `target/test_fixtures/` and opened through the
//! normal `Elf` path, so tests exercise the same mmap-backed decoding as a
//! real debuggee binary.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use rdwarf::Elf;

pub const DW_TAG_ARRAY_TYPE: u64 = 0x01;
pub const DW_TAG_CLASS_TYPE: u64 = 0x02;
pub const DW_TAG_ENUMERATION_TYPE: u64 = 0x04;
pub const DW_TAG_MEMBER: u64 = 0x0d;
pub const DW_TAG_POINTER_TYPE: u64 = 0x0f;
pub const DW_TAG_COMPILE_UNIT: u64 = 0x11;
pub const DW_TAG_STRUCTURE_TYPE: u64 = 0x13;
pub const DW_TAG_TYPEDEF: u64 = 0x16;
pub const DW_TAG_UNION_TYPE: u64 = 0x17;
pub const DW_TAG_INLINED_SUBROUTINE: u64 = 0x1d;
pub const DW_TAG_SUBRANGE_TYPE: u64 = 0x21;
pub const DW_TAG_BASE_TYPE: u64 = 0x24;
pub const DW_TAG_CONST_TYPE: u64 = 0x26;
pub const DW_TAG_SUBPROGRAM: u64 = 0x2e;
pub const DW_TAG_NAMESPACE: u64 = 0x39;

pub const DW_AT_SIBLING: u64 = 0x01;
pub const DW_AT_NAME: u64 = 0x03;
pub const DW_AT_BYTE_SIZE: u64 = 0x0b;
pub const DW_AT_BIT_OFFSET: u64 = 0x0c;
pub const DW_AT_BIT_SIZE: u64 = 0x0d;
pub const DW_AT_STMT_LIST: u64 = 0x10;
pub const DW_AT_LOW_PC: u64 = 0x11;
pub const DW_AT_HIGH_PC: u64 = 0x12;
pub const DW_AT_COMP_DIR: u64 = 0x1b;
pub const DW_AT_UPPER_BOUND: u64 = 0x2f;
pub const DW_AT_ABSTRACT_ORIGIN: u64 = 0x31;
pub const DW_AT_DATA_MEMBER_LOCATION: u64 = 0x38;
pub const DW_AT_DECL_FILE: u64 = 0x3a;
pub const DW_AT_DECL_LINE: u64 = 0x3b;
pub const DW_AT_ENCODING: u64 = 0x3e;
pub const DW_AT_SPECIFICATION: u64 = 0x47;
pub const DW_AT_TYPE: u64 = 0x49;
pub const DW_AT_RANGES: u64 = 0x55;
pub const DW_AT_CALL_FILE: u64 = 0x58;
pub const DW_AT_CALL_LINE: u64 = 0x59;

pub const DW_ATE_BOOLEAN: u64 = 0x02;
pub const DW_ATE_FLOAT: u64 = 0x04;
pub const DW_ATE_SIGNED: u64 = 0x05;
pub const DW_ATE_SIGNED_CHAR: u64 = 0x06;
pub const DW_ATE_UNSIGNED: u64 = 0x07;
pub const DW_ATE_UNSIGNED_CHAR: u64 = 0x08;

pub const DW_FORM_ADDR: u64 = 0x01;
pub const DW_FORM_DATA2: u64 = 0x05;
pub const DW_FORM_DATA4: u64 = 0x06;
pub const DW_FORM_DATA8: u64 = 0x07;
pub const DW_FORM_STRING: u64 = 0x08;
pub const DW_FORM_DATA1: u64 = 0x0b;
pub const DW_FORM_SDATA: u64 = 0x0d;
pub const DW_FORM_STRP: u64 = 0x0e;
pub const DW_FORM_UDATA: u64 = 0x0f;
pub const DW_FORM_REF4: u64 = 0x13;
pub const DW_FORM_SEC_OFFSET: u64 = 0x17;
pub const DW_FORM_FLAG_PRESENT: u64 = 0x19;

pub fn uleb(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

pub fn sleb(mut value: i64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let sign = byte & 0x40 != 0;
        if (value == 0 && !sign) || (value == -1 && sign) {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

/// One abbreviation declaration for the fixture's `.debug_abbrev` table.
pub struct AbbrevDecl {
    pub code: u64,
    pub tag: u64,
    pub has_children: bool,
    pub attrs: Vec<(u64, u64)>,
}

pub fn abbrev_bytes(decls: &[AbbrevDecl]) -> Vec<u8> {
    let mut out = Vec::new();
    for decl in decls {
        out.extend(uleb(decl.code));
        out.extend(uleb(decl.tag));
        out.push(decl.has_children as u8);
        for &(attr, form) in &decl.attrs {
            out.extend(uleb(attr));
            out.extend(uleb(form));
        }
        out.extend(uleb(0));
        out.extend(uleb(0));
    }
    out.extend(uleb(0));
    out
}

/// An attribute value; must line up positionally with the owning abbrev's
/// attr list.
#[derive(Clone)]
pub enum AttrValue {
    Data1(u8),
    Data2(u16),
    Data4(u32),
    Data8(u64),
    Udata(u64),
    Sdata(i64),
    Addr(u64),
    SecOffset(u32),
    Str(&'static str),
    Strp(u32),
    /// Resolved to a CU-relative `DW_FORM_ref4` offset of the DIE with this
    /// label.
    Ref(&'static str),
    FlagPresent,
}

impl AttrValue {
    fn encoded_len(&self) -> usize {
        match self {
            AttrValue::Data1(_) => 1,
            AttrValue::Data2(_) => 2,
            AttrValue::Data4(_) | AttrValue::SecOffset(_) | AttrValue::Strp(_) => 4,
            AttrValue::Data8(_) | AttrValue::Addr(_) => 8,
            AttrValue::Udata(v) => uleb(*v).len(),
            AttrValue::Sdata(v) => sleb(*v).len(),
            AttrValue::Str(s) => s.len() + 1,
            AttrValue::Ref(_) => 4,
            AttrValue::FlagPresent => 0,
        }
    }

    fn encode(&self, out: &mut Vec<u8>, labels: &HashMap<&'static str, usize>) {
        match self {
            AttrValue::Data1(v) => out.push(*v),
            AttrValue::Data2(v) => out.extend(v.to_le_bytes()),
            AttrValue::Data4(v) => out.extend(v.to_le_bytes()),
            AttrValue::Data8(v) => out.extend(v.to_le_bytes()),
            AttrValue::Udata(v) => out.extend(uleb(*v)),
            AttrValue::Sdata(v) => out.extend(sleb(*v)),
            AttrValue::Addr(v) => out.extend(v.to_le_bytes()),
            AttrValue::SecOffset(v) => out.extend(v.to_le_bytes()),
            AttrValue::Str(s) => {
                out.extend(s.as_bytes());
                out.push(0);
            }
            AttrValue::Strp(v) => out.extend(v.to_le_bytes()),
            AttrValue::Ref(label) => {
                let target = labels[label] as u32;
                out.extend(target.to_le_bytes());
            }
            AttrValue::FlagPresent => {}
        }
    }
}

/// A DIE in the fixture tree. `label` makes the DIE's CU-relative offset
/// addressable from `AttrValue::Ref`.
pub struct DieSpec {
    pub code: u64,
    pub label: Option<&'static str>,
    pub values: Vec<AttrValue>,
    pub children: Vec<DieSpec>,
}

impl DieSpec {
    pub fn new(code: u64, values: Vec<AttrValue>) -> Self {
        Self {
            code,
            label: None,
            values,
            children: Vec::new(),
        }
    }

    pub fn labeled(mut self, label: &'static str) -> Self {
        self.label = Some(label);
        self
    }

    pub fn with_children(mut self, children: Vec<DieSpec>) -> Self {
        self.children = children;
        self
    }

    fn has_children(&self, decls: &[AbbrevDecl]) -> bool {
        decls
            .iter()
            .find(|d| d.code == self.code)
            .map(|d| d.has_children)
            .unwrap_or(false)
    }
}

fn assign_offsets(
    die: &DieSpec,
    decls: &[AbbrevDecl],
    offset: &mut usize,
    labels: &mut HashMap<&'static str, usize>,
) {
    if let Some(label) = die.label {
        labels.insert(label, *offset);
    }
    *offset += uleb(die.code).len();
    for value in &die.values {
        *offset += value.encoded_len();
    }
    if die.has_children(decls) {
        for child in &die.children {
            assign_offsets(child, decls, offset, labels);
        }
        *offset += 1; // null terminator
    }
}

fn encode_die(
    die: &DieSpec,
    decls: &[AbbrevDecl],
    labels: &HashMap<&'static str, usize>,
    out: &mut Vec<u8>,
) {
    out.extend(uleb(die.code));
    for value in &die.values {
        value.encode(out, labels);
    }
    if die.has_children(decls) {
        for child in &die.children {
            encode_die(child, decls, labels, out);
        }
        out.extend(uleb(0));
    }
}

/// Encodes one compile unit (header plus DIE tree) for `.debug_info`.
/// `Ref` labels resolve CU-relative, within this unit only.
pub fn compile_unit(root: &DieSpec, decls: &[AbbrevDecl], abbrev_offset: u32) -> Vec<u8> {
    let mut labels = HashMap::new();
    let mut offset = 11usize; // past the unit header
    assign_offsets(root, decls, &mut offset, &mut labels);

    let mut dies = Vec::new();
    encode_die(root, decls, &labels, &mut dies);

    let unit_len = (2 + 4 + 1 + dies.len()) as u32;
    let mut out = Vec::new();
    out.extend(unit_len.to_le_bytes());
    out.extend(4u16.to_le_bytes());
    out.extend(abbrev_offset.to_le_bytes());
    out.push(8);
    out.extend(dies);
    out
}

/// A compile unit with a broken header, for decoder-rejection tests.
pub fn raw_compile_unit(unit_len: u32, version: u16, abbrev_offset: u32, addr_size: u8) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend(unit_len.to_le_bytes());
    out.extend(version.to_le_bytes());
    out.extend(abbrev_offset.to_le_bytes());
    out.push(addr_size);
    out
}

/// `.debug_str` accumulator; `add` returns the string's section offset.
#[derive(Default)]
pub struct StrTab {
    pub bytes: Vec<u8>,
}

impl StrTab {
    pub fn add(&mut self, s: &str) -> u32 {
        let offset = self.bytes.len() as u32;
        self.bytes.extend(s.as_bytes());
        self.bytes.push(0);
        offset
    }
}

/// Raw `.debug_ranges` pairs; the end-of-list marker is appended.
pub fn ranges_bytes(pairs: &[(u64, u64)]) -> Vec<u8> {
    let mut out = Vec::new();
    for &(low, high) in pairs {
        out.extend(low.to_le_bytes());
        out.extend(high.to_le_bytes());
    }
    out.extend(0u64.to_le_bytes());
    out.extend(0u64.to_le_bytes());
    out
}

pub const LINE_BASE: i8 = -5;
pub const LINE_RANGE: u8 = 14;
pub const OPCODE_BASE: u8 = 13;

/// The special opcode advancing the address by `addr_adv` and the line by
/// `line_adv`, under the fixture's header constants.
pub fn special_opcode(addr_adv: u64, line_adv: i64) -> u8 {
    let adjusted =
        (line_adv - LINE_BASE as i64) as u64 + LINE_RANGE as u64 * addr_adv + OPCODE_BASE as u64;
    assert!(adjusted <= 255, "operands do not fit a special opcode");
    adjusted as u8
}

pub fn lne_set_address(addr: u64) -> Vec<u8> {
    let mut out = vec![0x00, 9, 0x02];
    out.extend(addr.to_le_bytes());
    out
}

pub fn lne_end_sequence() -> Vec<u8> {
    vec![0x00, 1, 0x01]
}

pub fn lns_advance_pc(adv: u64) -> Vec<u8> {
    let mut out = vec![0x02];
    out.extend(uleb(adv));
    out
}

pub fn lns_advance_line(adv: i64) -> Vec<u8> {
    let mut out = vec![0x03];
    out.extend(sleb(adv));
    out
}

pub fn lns_copy() -> Vec<u8> {
    vec![0x01]
}

pub fn lns_set_file(index: u64) -> Vec<u8> {
    let mut out = vec![0x04];
    out.extend(uleb(index));
    out
}

/// One DWARF v4 line-number program unit. Directory and file names are raw
/// bytes; files are `(name, dir_index)` with zeroed mtime and length.
pub fn line_program(
    include_dirs: &[&[u8]],
    files: &[(&[u8], u64)],
    opcodes: &[u8],
) -> Vec<u8> {
    let mut header = Vec::new();
    header.push(1); // minimum_instruction_length
    header.push(1); // maximum_operations_per_instruction
    header.push(1); // default_is_stmt
    header.push(LINE_BASE as u8);
    header.push(LINE_RANGE);
    header.push(OPCODE_BASE);
    header.extend([0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1]);
    for dir in include_dirs {
        header.extend(*dir);
        header.push(0);
    }
    header.push(0);
    for (name, dir_index) in files {
        header.extend(*name);
        header.push(0);
        header.extend(uleb(*dir_index));
        header.extend(uleb(0));
        header.extend(uleb(0));
    }
    header.push(0);

    let header_length = header.len() as u32;
    let mut unit = Vec::new();
    unit.extend(4u16.to_le_bytes());
    unit.extend(header_length.to_le_bytes());
    unit.extend(header);
    unit.extend(opcodes);

    let mut out = Vec::new();
    out.extend((unit.len() as u32).to_le_bytes());
    out.extend(unit);
    out
}

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;

struct SectionSpec {
    name: String,
    sh_type: u32,
    sh_addr: u64,
    sh_entsize: u64,
    data: Vec<u8>,
}

pub struct SymbolSpec {
    pub name: &'static str,
    pub value: u64,
    pub size: u64,
    pub info: u8,
}

/// Assembles a minimal ELF64 executable image on disk and opens it.
pub struct ElfFixture {
    sections: Vec<SectionSpec>,
    symbols: Vec<SymbolSpec>,
}

impl ElfFixture {
    pub fn new() -> Self {
        Self {
            sections: Vec::new(),
            symbols: Vec::new(),
        }
    }

    pub fn section(mut self, name: &str, data: Vec<u8>) -> Self {
        self.sections.push(SectionSpec {
            name: name.to_string(),
            sh_type: SHT_PROGBITS,
            sh_addr: 0,
            sh_entsize: 0,
            data,
        });
        self
    }

    /// An allocated section occupying `[addr, addr + size)` in the link-time
    /// address space.
    pub fn alloc_section(mut self, name: &str, addr: u64, size: usize) -> Self {
        self.sections.push(SectionSpec {
            name: name.to_string(),
            sh_type: SHT_PROGBITS,
            sh_addr: addr,
            sh_entsize: 0,
            data: vec![0x90; size],
        });
        self
    }

    pub fn symbol(mut self, symbol: SymbolSpec) -> Self {
        self.symbols.push(symbol);
        self
    }

    pub fn build(mut self, file_name: &str) -> Result<Box<Elf>> {
        if !self.symbols.is_empty() {
            let mut strtab = vec![0u8];
            let mut symtab = Vec::new();
            for sym in &self.symbols {
                let name_offset = strtab.len() as u32;
                strtab.extend(sym.name.as_bytes());
                strtab.push(0);

                symtab.extend(name_offset.to_le_bytes());
                symtab.push(sym.info);
                symtab.push(0); // st_other
                symtab.extend(1u16.to_le_bytes()); // st_shndx
                symtab.extend(sym.value.to_le_bytes());
                symtab.extend(sym.size.to_le_bytes());
            }
            self.sections.push(SectionSpec {
                name: ".symtab".to_string(),
                sh_type: SHT_SYMTAB,
                sh_addr: 0,
                sh_entsize: 24,
                data: symtab,
            });
            self.sections.push(SectionSpec {
                name: ".strtab".to_string(),
                sh_type: SHT_STRTAB,
                sh_addr: 0,
                sh_entsize: 0,
                data: strtab,
            });
        }

        // Section-name string table goes last
        let mut shstrtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for section in &self.sections {
            name_offsets.push(shstrtab.len() as u32);
            shstrtab.extend(section.name.as_bytes());
            shstrtab.push(0);
        }
        let shstrtab_name_offset = shstrtab.len() as u32;
        shstrtab.extend(b".shstrtab");
        shstrtab.push(0);
        self.sections.push(SectionSpec {
            name: ".shstrtab".to_string(),
            sh_type: SHT_STRTAB,
            sh_addr: 0,
            sh_entsize: 0,
            data: shstrtab,
        });
        name_offsets.push(shstrtab_name_offset);

        // Layout: ELF header, section data, section header table
        const EHDR_SIZE: usize = 64;
        const SHDR_SIZE: usize = 64;
        let mut data_offsets = Vec::new();
        let mut cursor = EHDR_SIZE;
        for section in &self.sections {
            cursor = (cursor + 7) & !7;
            data_offsets.push(cursor);
            cursor += section.data.len();
        }
        let shoff = (cursor + 7) & !7;
        let shnum = self.sections.len() + 1; // plus the null section

        let mut image = Vec::new();
        // e_ident
        image.extend([0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        image.extend([0u8; 8]);
        image.extend(2u16.to_le_bytes()); // e_type = ET_EXEC
        image.extend(62u16.to_le_bytes()); // e_machine = EM_X86_64
        image.extend(1u32.to_le_bytes()); // e_version
        image.extend(0u64.to_le_bytes()); // e_entry
        image.extend(0u64.to_le_bytes()); // e_phoff
        image.extend((shoff as u64).to_le_bytes()); // e_shoff
        image.extend(0u32.to_le_bytes()); // e_flags
        image.extend((EHDR_SIZE as u16).to_le_bytes()); // e_ehsize
        image.extend(0u16.to_le_bytes()); // e_phentsize
        image.extend(0u16.to_le_bytes()); // e_phnum
        image.extend((SHDR_SIZE as u16).to_le_bytes()); // e_shentsize
        image.extend((shnum as u16).to_le_bytes()); // e_shnum
        image.extend(((shnum - 1) as u16).to_le_bytes()); // e_shstrndx
        assert_eq!(image.len(), EHDR_SIZE);

        for (section, &offset) in self.sections.iter().zip(&data_offsets) {
            image.resize(offset, 0);
            image.extend(&section.data);
        }
        image.resize(shoff, 0);

        // Null section header
        image.extend([0u8; SHDR_SIZE]);
        for ((section, &offset), &name_offset) in self
            .sections
            .iter()
            .zip(&data_offsets)
            .zip(&name_offsets)
        {
            image.extend(name_offset.to_le_bytes()); // sh_name
            image.extend(section.sh_type.to_le_bytes()); // sh_type
            let flags: u64 = if section.sh_addr != 0 { 2 } else { 0 }; // SHF_ALLOC
            image.extend(flags.to_le_bytes());
            image.extend(section.sh_addr.to_le_bytes());
            image.extend((offset as u64).to_le_bytes()); // sh_offset
            image.extend((section.data.len() as u64).to_le_bytes()); // sh_size
            image.extend(0u32.to_le_bytes()); // sh_link
            image.extend(0u32.to_le_bytes()); // sh_info
            image.extend(8u64.to_le_bytes()); // sh_addralign
            image.extend(section.sh_entsize.to_le_bytes());
        }

        let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("target")
            .join("test_fixtures");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(file_name);
        std::fs::write(&path, &image)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        Elf::new(&path).map_err(Into::into)
    }
}
