use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::elf::Elf;
use crate::error::{Error, Result};
use crate::types::FileAddr;

#[allow(non_camel_case_types)]
pub type DwarfTag = u64;
#[allow(non_camel_case_types)]
pub type DwarfAttr = u64;
#[allow(non_camel_case_types)]
pub type DwarfForm = u64;

// DW_TAG_* constants (subset)
pub const DW_TAG_ARRAY_TYPE: DwarfTag = 0x01;
pub const DW_TAG_CLASS_TYPE: DwarfTag = 0x02;
pub const DW_TAG_ENUMERATION_TYPE: DwarfTag = 0x04;
pub const DW_TAG_MEMBER: DwarfTag = 0x0d;
pub const DW_TAG_POINTER_TYPE: DwarfTag = 0x0f;
pub const DW_TAG_REFERENCE_TYPE: DwarfTag = 0x10;
pub const DW_TAG_COMPILE_UNIT: DwarfTag = 0x11;
pub const DW_TAG_STRUCTURE_TYPE: DwarfTag = 0x13;
pub const DW_TAG_TYPEDEF: DwarfTag = 0x16;
pub const DW_TAG_UNION_TYPE: DwarfTag = 0x17;
pub const DW_TAG_INLINED_SUBROUTINE: DwarfTag = 0x1d;
pub const DW_TAG_PTR_TO_MEMBER_TYPE: DwarfTag = 0x1f;
pub const DW_TAG_SUBRANGE_TYPE: DwarfTag = 0x21;
pub const DW_TAG_BASE_TYPE: DwarfTag = 0x24;
pub const DW_TAG_CONST_TYPE: DwarfTag = 0x26;
pub const DW_TAG_SUBPROGRAM: DwarfTag = 0x2e;
pub const DW_TAG_VOLATILE_TYPE: DwarfTag = 0x35;
pub const DW_TAG_RVALUE_REFERENCE_TYPE: DwarfTag = 0x42;

// DW_AT_* constants (subset)
pub const DW_AT_SIBLING: DwarfAttr = 0x01;
pub const DW_AT_NAME: DwarfAttr = 0x03;
pub const DW_AT_BYTE_SIZE: DwarfAttr = 0x0b;
pub const DW_AT_BIT_OFFSET: DwarfAttr = 0x0c;
pub const DW_AT_BIT_SIZE: DwarfAttr = 0x0d;
pub const DW_AT_STMT_LIST: DwarfAttr = 0x10;
pub const DW_AT_LOW_PC: DwarfAttr = 0x11;
pub const DW_AT_HIGH_PC: DwarfAttr = 0x12;
pub const DW_AT_COMP_DIR: DwarfAttr = 0x1b;
pub const DW_AT_UPPER_BOUND: DwarfAttr = 0x2f;
pub const DW_AT_ABSTRACT_ORIGIN: DwarfAttr = 0x31;
pub const DW_AT_DATA_MEMBER_LOCATION: DwarfAttr = 0x38;
pub const DW_AT_DECL_FILE: DwarfAttr = 0x3a;
pub const DW_AT_DECL_LINE: DwarfAttr = 0x3b;
pub const DW_AT_ENCODING: DwarfAttr = 0x3e;
pub const DW_AT_SPECIFICATION: DwarfAttr = 0x47;
pub const DW_AT_TYPE: DwarfAttr = 0x49;
pub const DW_AT_RANGES: DwarfAttr = 0x55;
pub const DW_AT_CALL_FILE: DwarfAttr = 0x58;
pub const DW_AT_CALL_LINE: DwarfAttr = 0x59;
pub const DW_AT_DATA_BIT_OFFSET: DwarfAttr = 0x6b;

// DW_ATE_* base type encodings (subset)
pub const DW_ATE_BOOLEAN: u64 = 0x02;
pub const DW_ATE_FLOAT: u64 = 0x04;
pub const DW_ATE_SIGNED: u64 = 0x05;
pub const DW_ATE_SIGNED_CHAR: u64 = 0x06;
pub const DW_ATE_UNSIGNED: u64 = 0x07;
pub const DW_ATE_UNSIGNED_CHAR: u64 = 0x08;
pub const DW_ATE_UTF: u64 = 0x10;

// DW_FORM_* constants (subset)
pub const DW_FORM_ADDR: DwarfForm = 0x01;
pub const DW_FORM_BLOCK2: DwarfForm = 0x03;
pub const DW_FORM_BLOCK4: DwarfForm = 0x04;
pub const DW_FORM_DATA2: DwarfForm = 0x05;
pub const DW_FORM_DATA4: DwarfForm = 0x06;
pub const DW_FORM_DATA8: DwarfForm = 0x07;
pub const DW_FORM_STRING: DwarfForm = 0x08;
pub const DW_FORM_BLOCK: DwarfForm = 0x09;
pub const DW_FORM_BLOCK1: DwarfForm = 0x0a;
pub const DW_FORM_DATA1: DwarfForm = 0x0b;
pub const DW_FORM_FLAG: DwarfForm = 0x0c;
pub const DW_FORM_SDATA: DwarfForm = 0x0d;
pub const DW_FORM_STRP: DwarfForm = 0x0e;
pub const DW_FORM_UDATA: DwarfForm = 0x0f;
pub const DW_FORM_REF_ADDR: DwarfForm = 0x10;
pub const DW_FORM_REF1: DwarfForm = 0x11;
pub const DW_FORM_REF2: DwarfForm = 0x12;
pub const DW_FORM_REF4: DwarfForm = 0x13;
pub const DW_FORM_REF8: DwarfForm = 0x14;
pub const DW_FORM_REF_UDATA: DwarfForm = 0x15;
pub const DW_FORM_INDIRECT: DwarfForm = 0x16;
pub const DW_FORM_SEC_OFFSET: DwarfForm = 0x17;
pub const DW_FORM_EXPRLOC: DwarfForm = 0x18;
pub const DW_FORM_FLAG_PRESENT: DwarfForm = 0x19;

// Line table opcodes
const DW_LNS_COPY: u8 = 0x01;
const DW_LNS_ADVANCE_PC: u8 = 0x02;
const DW_LNS_ADVANCE_LINE: u8 = 0x03;
const DW_LNS_SET_FILE: u8 = 0x04;
const DW_LNS_SET_COLUMN: u8 = 0x05;
const DW_LNS_NEGATE_STMT: u8 = 0x06;
const DW_LNS_SET_BASIC_BLOCK: u8 = 0x07;
const DW_LNS_CONST_ADD_PC: u8 = 0x08;
const DW_LNS_FIXED_ADVANCE_PC: u8 = 0x09;
const DW_LNS_SET_PROLOGUE_END: u8 = 0x0a;
const DW_LNS_SET_EPILOGUE_BEGIN: u8 = 0x0b;
const DW_LNS_SET_ISA: u8 = 0x0c;

const DW_LNE_END_SEQUENCE: u8 = 0x01;
const DW_LNE_SET_ADDRESS: u8 = 0x02;
const DW_LNE_DEFINE_FILE: u8 = 0x03;
const DW_LNE_SET_DISCRIMINATOR: u8 = 0x04;

/// Stateful little-endian reader over a byte span.
#[derive(Clone, Copy)]
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn is_finished(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn advance(&mut self, amount: usize) -> Result<()> {
        if self.pos + amount > self.data.len() {
            return Err(Error::Truncated("skipped bytes"));
        }
        self.pos += amount;
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.data.len() {
            return Err(Error::Truncated("byte"));
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::Truncated("fixed-width value"));
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.data[start..self.pos])
    }

    fn read_uleb128(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        Ok(result)
    }

    fn read_sleb128(&mut self) -> Result<i64> {
        let mut result = 0i64;
        let mut shift = 0;
        let mut byte;

        loop {
            byte = self.read_u8()?;
            let value = (byte & 0x7f) as i64;
            result |= value << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }

        if shift < 64 && (byte & 0x40) != 0 {
            result |= (!0i64) << shift;
        }

        Ok(result)
    }

    fn read_cstr(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        while self.pos < self.data.len() && self.data[self.pos] != 0 {
            self.pos += 1;
        }
        if self.pos >= self.data.len() {
            return Err(Error::Truncated("string"));
        }
        let end = self.pos;
        self.pos += 1; // skip null terminator
        Ok(&self.data[start..end])
    }

    /// Advances by the exact byte cost of `form` without materializing the
    /// value. The form alone determines the encoding.
    fn skip_form(&mut self, form: DwarfForm) -> Result<()> {
        match form {
            DW_FORM_FLAG_PRESENT => {}
            DW_FORM_DATA1 | DW_FORM_REF1 | DW_FORM_FLAG => {
                self.advance(1)?;
            }
            DW_FORM_DATA2 | DW_FORM_REF2 => {
                self.advance(2)?;
            }
            DW_FORM_DATA4 | DW_FORM_REF4 | DW_FORM_REF_ADDR | DW_FORM_SEC_OFFSET | DW_FORM_STRP => {
                self.advance(4)?;
            }
            DW_FORM_DATA8 | DW_FORM_REF8 | DW_FORM_ADDR => {
                self.advance(8)?;
            }
            DW_FORM_SDATA => {
                let _ = self.read_sleb128()?;
            }
            DW_FORM_UDATA | DW_FORM_REF_UDATA => {
                let _ = self.read_uleb128()?;
            }
            DW_FORM_BLOCK1 => {
                let size = self.read_u8()? as usize;
                self.advance(size)?;
            }
            DW_FORM_BLOCK2 => {
                let size = self.read_u16()? as usize;
                self.advance(size)?;
            }
            DW_FORM_BLOCK4 => {
                let size = self.read_u32()? as usize;
                self.advance(size)?;
            }
            DW_FORM_BLOCK | DW_FORM_EXPRLOC => {
                let size = self.read_uleb128()? as usize;
                self.advance(size)?;
            }
            DW_FORM_STRING => {
                let _ = self.read_cstr()?;
            }
            DW_FORM_INDIRECT => {
                let actual = self.read_uleb128()?;
                self.skip_form(actual)?;
            }
            _ => return Err(Error::UnknownForm(form)),
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct AttrSpec {
    pub attr: DwarfAttr,
    pub form: DwarfForm,
}

#[derive(Clone, Debug)]
pub struct Abbrev {
    pub code: u64,
    pub tag: DwarfTag,
    pub has_children: bool,
    pub attr_specs: Vec<AttrSpec>,
}

/// One attribute of a DIE: its name, form, and the byte offset where its
/// value begins inside the owning compile unit's data.
#[derive(Clone)]
pub struct Attr {
    dwarf: *const Dwarf,
    cu_index: usize,
    name: DwarfAttr,
    form: DwarfForm,
    location: usize,
}

impl Attr {
    pub fn name(&self) -> DwarfAttr {
        self.name
    }

    pub fn form(&self) -> DwarfForm {
        self.form
    }

    fn dwarf(&self) -> &Dwarf {
        unsafe { &*self.dwarf }
    }

    fn compile_unit(&self) -> &CompileUnit {
        &self.dwarf().compile_units[self.cu_index]
    }

    fn data_slice(&self) -> Result<&[u8]> {
        let cu = self.compile_unit();
        let data = cu.data();
        if self.location >= data.len() {
            return Err(Error::Truncated("attribute value"));
        }
        Ok(&data[self.location..])
    }

    pub fn as_address(&self) -> Result<FileAddr> {
        if self.form != DW_FORM_ADDR {
            return Err(Error::BadForm {
                form: self.form,
                wanted: "address",
            });
        }
        let mut cur = Cursor::new(self.data_slice()?);
        let raw = cur.read_u64()?;
        let elf = self.dwarf().elf();
        Ok(FileAddr::from(elf, raw))
    }

    pub fn as_section_offset(&self) -> Result<u32> {
        if self.form != DW_FORM_SEC_OFFSET {
            return Err(Error::BadForm {
                form: self.form,
                wanted: "section offset",
            });
        }
        let mut cur = Cursor::new(self.data_slice()?);
        cur.read_u32()
    }

    pub fn as_u64(&self) -> Result<u64> {
        let mut cur = Cursor::new(self.data_slice()?);
        Ok(match self.form {
            DW_FORM_DATA1 | DW_FORM_REF1 | DW_FORM_FLAG => cur.read_u8()? as u64,
            DW_FORM_DATA2 | DW_FORM_REF2 => cur.read_u16()? as u64,
            DW_FORM_DATA4 | DW_FORM_REF4 | DW_FORM_REF_ADDR | DW_FORM_SEC_OFFSET | DW_FORM_STRP => {
                cur.read_u32()? as u64
            }
            DW_FORM_DATA8 | DW_FORM_REF8 => cur.read_u64()?,
            DW_FORM_UDATA | DW_FORM_REF_UDATA => cur.read_uleb128()?,
            _ => {
                return Err(Error::BadForm {
                    form: self.form,
                    wanted: "integer",
                })
            }
        })
    }

    pub fn as_i64(&self) -> Result<i64> {
        let mut cur = Cursor::new(self.data_slice()?);
        match self.form {
            DW_FORM_SDATA => cur.read_sleb128(),
            _ => Ok(self.as_u64()? as i64),
        }
    }

    pub fn as_flag(&self) -> Result<bool> {
        match self.form {
            DW_FORM_FLAG_PRESENT => Ok(true),
            DW_FORM_FLAG => {
                let mut cur = Cursor::new(self.data_slice()?);
                Ok(cur.read_u8()? != 0)
            }
            _ => Err(Error::BadForm {
                form: self.form,
                wanted: "flag",
            }),
        }
    }

    pub fn as_block(&self) -> Result<&[u8]> {
        let mut cur = Cursor::new(self.data_slice()?);
        let size = match self.form {
            DW_FORM_BLOCK1 => cur.read_u8()? as usize,
            DW_FORM_BLOCK2 => cur.read_u16()? as usize,
            DW_FORM_BLOCK4 => cur.read_u32()? as usize,
            DW_FORM_BLOCK | DW_FORM_EXPRLOC => cur.read_uleb128()? as usize,
            _ => {
                return Err(Error::BadForm {
                    form: self.form,
                    wanted: "block",
                })
            }
        };
        cur.read_bytes(size)
    }

    /// Decodes a string-form attribute. DWARF strings are raw NUL-terminated
    /// bytes; decoding is lossy, never a validation failure.
    pub fn as_string(&self) -> Result<String> {
        let dwarf = self.dwarf();
        let mut cur = Cursor::new(self.data_slice()?);
        match self.form {
            DW_FORM_STRING => {
                let bytes = cur.read_cstr()?;
                Ok(String::from_utf8_lossy(bytes).into_owned())
            }
            DW_FORM_STRP => {
                let offset = cur.read_u32()? as usize;
                let strings = dwarf.debug_str();
                if offset >= strings.len() {
                    return Err(Error::Truncated("string table offset"));
                }
                let mut str_cur = Cursor::new(&strings[offset..]);
                let bytes = str_cur.read_cstr()?;
                Ok(String::from_utf8_lossy(bytes).into_owned())
            }
            _ => Err(Error::BadForm {
                form: self.form,
                wanted: "string",
            }),
        }
    }

    /// Resolves a reference-form attribute to the DIE it points at.
    /// CU-relative forms resolve inside the owning compile unit; `ref_addr`
    /// resolves inside whichever compile unit covers the target offset.
    pub fn as_reference(&self) -> Result<Die> {
        let dwarf = self.dwarf();
        match self.form {
            DW_FORM_REF1 | DW_FORM_REF2 | DW_FORM_REF4 | DW_FORM_REF8 | DW_FORM_REF_UDATA => {
                let offset = self.as_u64()? as usize;
                parse_die_at(self.compile_unit(), offset)
            }
            DW_FORM_REF_ADDR => {
                let section_offset = self.as_u64()? as usize;
                if section_offset >= dwarf.debug_info().len() {
                    return Err(Error::Truncated("reference target"));
                }
                let cu = dwarf
                    .compile_units
                    .iter()
                    .find(|cu| section_offset >= cu.offset && section_offset < cu.offset + cu.size)
                    .ok_or_else(|| {
                        Error::UnsupportedDwarf(
                            "reference does not land in any compile unit".into(),
                        )
                    })?;
                parse_die_at(cu, section_offset - cu.offset)
            }
            _ => Err(Error::BadForm {
                form: self.form,
                wanted: "reference",
            }),
        }
    }

    /// The `.debug_ranges` list this attribute points at, with the walker's
    /// initial base address taken from the CU root's `DW_AT_low_pc`.
    pub fn as_range_list(&self) -> Result<RangeList> {
        let offset = self.as_section_offset()? as usize;
        let root = self.compile_unit().root()?;
        let base_address = if root.contains(DW_AT_LOW_PC) {
            root.get_attr(DW_AT_LOW_PC)?.as_address()?.addr()
        } else {
            0
        };
        Ok(RangeList {
            dwarf: self.dwarf,
            offset,
            base_address,
        })
    }
}

/// A debugging-information entry, parsed on demand from its compile unit.
///
/// A DIE whose abbrev code is zero is a null entry: the terminator of a
/// sibling chain. Its `next` offset still points past it.
#[derive(Clone)]
pub struct Die {
    dwarf: *const Dwarf,
    cu_index: usize,
    position: usize,
    next_offset: usize,
    abbrev_code: u64,
    attr_locs: Vec<usize>,
}

impl fmt::Debug for Die {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Die")
            .field("position", &self.position)
            .field("abbrev_code", &self.abbrev_code)
            .finish()
    }
}

impl Die {
    fn dwarf(&self) -> &Dwarf {
        unsafe { &*self.dwarf }
    }

    fn compile_unit(&self) -> &CompileUnit {
        &self.dwarf().compile_units[self.cu_index]
    }

    pub fn cu(&self) -> &CompileUnit {
        self.compile_unit()
    }

    /// Byte offset of this DIE inside its compile unit's data.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Byte offset just past this DIE's attributes.
    pub fn next_offset(&self) -> usize {
        self.next_offset
    }

    pub fn abbrev_code(&self) -> u64 {
        self.abbrev_code
    }

    pub fn is_null(&self) -> bool {
        self.abbrev_code == 0
    }

    pub fn abbrev_entry(&self) -> Option<&Abbrev> {
        if self.is_null() {
            return None;
        }
        self.compile_unit().abbrev_table().get(&self.abbrev_code)
    }

    pub fn tag(&self) -> Option<DwarfTag> {
        self.abbrev_entry().map(|a| a.tag)
    }

    fn has_children(&self) -> bool {
        self.abbrev_entry().map_or(false, |a| a.has_children)
    }

    pub fn contains(&self, attr: DwarfAttr) -> bool {
        self.attr_index(attr).is_some()
    }

    pub fn get_attr(&self, attr: DwarfAttr) -> Result<Attr> {
        let idx = self
            .attr_index(attr)
            .ok_or(Error::MissingAttribute(attr))?;
        let abbrev = self
            .abbrev_entry()
            .expect("abbrev entry present when attribute index exists");
        Ok(Attr {
            dwarf: self.dwarf,
            cu_index: self.cu_index,
            name: abbrev.attr_specs[idx].attr,
            form: abbrev.attr_specs[idx].form,
            location: self.attr_locs[idx],
        })
    }

    fn attr_index(&self, attr: DwarfAttr) -> Option<usize> {
        self.abbrev_entry()
            .and_then(|abbrev| abbrev.attr_specs.iter().position(|spec| spec.attr == attr))
    }

    /// Iterates the direct children of this DIE. Empty for DIEs without
    /// children. The traversal follows `DW_AT_sibling` links when present
    /// and otherwise skips each child's subtree by walking it.
    pub fn children(&self) -> DieChildren {
        DieChildren {
            dwarf: self.dwarf,
            cu_index: self.cu_index,
            next_offset: self.next_offset,
            finished: !self.has_children(),
        }
    }

    /// Offset of the DIE following this one at the same nesting depth,
    /// skipping all descendants.
    fn next_sibling_offset(&self) -> Result<usize> {
        if !self.has_children() {
            return Ok(self.next_offset);
        }
        if self.contains(DW_AT_SIBLING) {
            return Ok(self.get_attr(DW_AT_SIBLING)?.as_reference()?.position());
        }

        // Walk the subtree to the null entry that terminates it
        let cu = self.compile_unit();
        let mut offset = self.next_offset;
        loop {
            let die = parse_die_at(cu, offset)?;
            if die.is_null() {
                return Ok(die.next_offset());
            }
            offset = die.next_sibling_offset()?;
        }
    }

    pub fn low_pc(&self) -> Result<FileAddr> {
        if self.contains(DW_AT_RANGES) {
            self.get_attr(DW_AT_RANGES)?
                .as_range_list()?
                .iter()
                .next()
                .map(|entry| entry.low)
                .ok_or(Error::NoLowPc)
        } else if self.contains(DW_AT_LOW_PC) {
            self.get_attr(DW_AT_LOW_PC)?.as_address()
        } else {
            Err(Error::NoLowPc)
        }
    }

    pub fn high_pc(&self) -> Result<FileAddr> {
        if self.contains(DW_AT_RANGES) {
            self.get_attr(DW_AT_RANGES)?
                .as_range_list()?
                .iter()
                .last()
                .map(|entry| entry.high)
                .ok_or(Error::NoHighPc)
        } else if self.contains(DW_AT_HIGH_PC) {
            let high_attr = self.get_attr(DW_AT_HIGH_PC)?;
            // The form decides whether high_pc is an address or an offset
            // past low_pc.
            if high_attr.form() == DW_FORM_ADDR {
                high_attr.as_address()
            } else {
                let low = self.low_pc()?;
                Ok(FileAddr::from(
                    self.dwarf().elf(),
                    low.addr() + high_attr.as_u64()?,
                ))
            }
        } else {
            Err(Error::NoHighPc)
        }
    }

    /// Whether this DIE's address coverage includes `address`. Addresses
    /// from a different ELF object never match; a DIE with neither
    /// `DW_AT_ranges` nor `DW_AT_low_pc` covers nothing.
    pub fn contains_address(&self, address: FileAddr) -> Result<bool> {
        match address.elf_file() {
            Some(elf) if elf == self.dwarf().elf() => {}
            _ => return Ok(false),
        }

        if self.contains(DW_AT_RANGES) {
            Ok(self
                .get_attr(DW_AT_RANGES)?
                .as_range_list()?
                .contains(address))
        } else if self.contains(DW_AT_LOW_PC) {
            Ok(self.low_pc()? <= address && address < self.high_pc()?)
        } else {
            Ok(false)
        }
    }

    /// The DIE's name, resolving through `DW_AT_specification` and
    /// `DW_AT_abstract_origin` when the entry itself is anonymous.
    pub fn name(&self) -> Result<Option<String>> {
        if self.contains(DW_AT_NAME) {
            return Ok(Some(self.get_attr(DW_AT_NAME)?.as_string()?));
        }
        if self.contains(DW_AT_SPECIFICATION) {
            return self.get_attr(DW_AT_SPECIFICATION)?.as_reference()?.name();
        }
        if self.contains(DW_AT_ABSTRACT_ORIGIN) {
            return self
                .get_attr(DW_AT_ABSTRACT_ORIGIN)?
                .as_reference()?
                .name();
        }
        Ok(None)
    }

    /// Source file this function was declared in; for inlined subroutines,
    /// the file of the call site.
    pub fn source_file(&self) -> Result<LineTableFile> {
        let idx = if self.tag() == Some(DW_TAG_INLINED_SUBROUTINE) {
            self.get_attr(DW_AT_CALL_FILE)?.as_u64()?
        } else {
            self.get_attr(DW_AT_DECL_FILE)?.as_u64()?
        };
        let table = self
            .cu()
            .lines()?
            .ok_or(Error::MissingAttribute(DW_AT_STMT_LIST))?;
        table
            .file(idx)
            .ok_or_else(|| Error::UnsupportedDwarf(format!("file index {idx} out of range")))
    }

    /// Declaration line; for inlined subroutines, the call-site line.
    pub fn source_line(&self) -> Result<u64> {
        if self.tag() == Some(DW_TAG_INLINED_SUBROUTINE) {
            self.get_attr(DW_AT_CALL_LINE)?.as_u64()
        } else {
            self.get_attr(DW_AT_DECL_LINE)?.as_u64()
        }
    }
}

/// Forward iterator over the direct children of a DIE.
pub struct DieChildren {
    dwarf: *const Dwarf,
    cu_index: usize,
    next_offset: usize,
    finished: bool,
}

impl Iterator for DieChildren {
    type Item = Die;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let dwarf = unsafe { &*self.dwarf };
        let cu = &dwarf.compile_units[self.cu_index];
        let die = parse_die_at(cu, self.next_offset).ok()?;
        if die.is_null() {
            self.finished = true;
            return None;
        }
        self.next_offset = die.next_sibling_offset().ok()?;
        Some(die)
    }
}

fn parse_die_at(cu: &CompileUnit, offset: usize) -> Result<Die> {
    let data = cu.data();
    if offset >= data.len() {
        return Err(Error::Truncated("DIE"));
    }

    let mut cur = Cursor::new(&data[offset..]);
    let abbrev_code = cur.read_uleb128()?;

    if abbrev_code == 0 {
        let next_offset = offset + cur.position();
        return Ok(Die {
            dwarf: cu.dwarf,
            cu_index: cu.index,
            position: offset,
            next_offset,
            abbrev_code,
            attr_locs: Vec::new(),
        });
    }

    let abbrev = cu.abbrev_table().get(&abbrev_code).ok_or_else(|| {
        Error::UnsupportedDwarf(format!("missing abbrev code {abbrev_code}"))
    })?;

    let mut attr_locs = Vec::with_capacity(abbrev.attr_specs.len());
    for spec in abbrev.attr_specs.iter() {
        attr_locs.push(offset + cur.position());
        cur.skip_form(spec.form)?;
    }

    let next_offset = offset + cur.position();

    Ok(Die {
        dwarf: cu.dwarf,
        cu_index: cu.index,
        position: offset,
        next_offset,
        abbrev_code,
        attr_locs,
    })
}

#[derive(Clone, Copy, Debug)]
pub struct RangeListEntry {
    pub low: FileAddr,
    pub high: FileAddr,
}

impl RangeListEntry {
    pub fn contains(&self, address: FileAddr) -> bool {
        self.low <= address && address < self.high
    }
}

/// A `.debug_ranges` list. Entries are decoded lazily; `(~0, base)` rows
/// retarget the walker's base address and `(0, 0)` terminates the list
/// without being yielded.
pub struct RangeList {
    dwarf: *const Dwarf,
    offset: usize,
    base_address: u64,
}

impl RangeList {
    fn dwarf(&self) -> &Dwarf {
        unsafe { &*self.dwarf }
    }

    pub fn iter(&self) -> RangeListIter<'_> {
        let ranges = self.dwarf().debug_ranges();
        let data = if self.offset <= ranges.len() {
            &ranges[self.offset..]
        } else {
            &[]
        };
        RangeListIter {
            elf: self.dwarf().elf(),
            cursor: Cursor::new(data),
            base_address: self.base_address,
            finished: false,
        }
    }

    pub fn contains(&self, address: FileAddr) -> bool {
        self.iter().any(|entry| entry.contains(address))
    }
}

pub struct RangeListIter<'a> {
    elf: &'a Elf,
    cursor: Cursor<'a>,
    base_address: u64,
    finished: bool,
}

impl Iterator for RangeListIter<'_> {
    type Item = RangeListEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let low = self.cursor.read_u64().ok()?;
            let high = self.cursor.read_u64().ok()?;
            if low == u64::MAX {
                self.base_address = high;
            } else if low == 0 && high == 0 {
                self.finished = true;
                return None;
            } else {
                return Some(RangeListEntry {
                    low: FileAddr::from(self.elf, self.base_address + low),
                    high: FileAddr::from(self.elf, self.base_address + high),
                });
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineTableFile {
    pub path: PathBuf,
    pub modification_time: u64,
    pub file_length: u64,
}

/// One row of the decoded line table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineTableEntry {
    pub address: FileAddr,
    pub file_index: u64,
    pub line: u64,
    pub column: u64,
    pub is_stmt: bool,
    pub basic_block_start: bool,
    pub end_sequence: bool,
    pub prologue_end: bool,
    pub epilogue_begin: bool,
    pub discriminator: u64,
    pub file: Option<LineTableFile>,
}

#[derive(Clone)]
struct LineTableState {
    address: FileAddr,
    file_index: u64,
    line: u64,
    column: u64,
    is_stmt: bool,
    basic_block_start: bool,
    end_sequence: bool,
    prologue_end: bool,
    epilogue_begin: bool,
    discriminator: u64,
}

impl LineTableState {
    fn new(default_is_stmt: bool, base_address: FileAddr) -> Self {
        Self {
            address: base_address,
            file_index: 1,
            line: 1,
            column: 0,
            is_stmt: default_is_stmt,
            basic_block_start: false,
            end_sequence: false,
            prologue_end: false,
            epilogue_begin: false,
            discriminator: 0,
        }
    }
}

/// The decoded header of one DWARF v4 line-number program, plus the program
/// bytes. Rows are produced by executing the program; see [`LineTable::iter`].
#[derive(Clone, Debug)]
pub struct LineTable {
    dwarf: *const Dwarf,
    cu_index: usize,
    default_is_stmt: bool,
    line_base: i8,
    line_range: u8,
    opcode_base: u8,
    include_directories: Vec<PathBuf>,
    file_names: RefCell<Vec<LineTableFile>>,
    program_offset: usize,
    program_len: usize,
}

impl LineTable {
    fn dwarf(&self) -> &Dwarf {
        unsafe { &*self.dwarf }
    }

    fn cu(&self) -> &CompileUnit {
        &self.dwarf().compile_units[self.cu_index]
    }

    fn program(&self) -> &[u8] {
        &self.dwarf().debug_line()[self.program_offset..self.program_offset + self.program_len]
    }

    /// The file at 1-based `index` in the program's file table.
    pub fn file(&self, index: u64) -> Option<LineTableFile> {
        if index == 0 {
            return None;
        }
        self.file_names.borrow().get((index - 1) as usize).cloned()
    }

    pub fn iter(&self) -> LineTableIter<'_> {
        LineTableIter::new(self)
    }

    /// The row covering `address`: the entry at or below it within a
    /// sequence, excluding end-of-sequence markers.
    pub fn get_entry_by_address(&self, address: FileAddr) -> Result<Option<LineTableEntry>> {
        let mut iter = self.iter();
        let mut prev = match iter.next() {
            Some(entry) => entry?,
            None => return Ok(None),
        };

        for entry in iter {
            let entry = entry?;
            if prev.address <= address && address < entry.address && !prev.end_sequence {
                return Ok(Some(prev));
            }
            prev = entry;
        }
        Ok(None)
    }

    /// All rows for `line` in a file matching `path`: exact match for an
    /// absolute query, trailing path-component match for a relative one.
    pub fn get_entries_by_line<P: AsRef<Path>>(
        &self,
        path: P,
        line: u64,
    ) -> Result<Vec<LineTableEntry>> {
        let mut entries = Vec::new();
        let path = path.as_ref();
        for entry in self.iter() {
            let entry = entry?;
            if entry.line == line {
                if let Some(file) = &entry.file {
                    if paths_match(&file.path, path) {
                        entries.push(entry);
                    }
                }
            }
        }
        Ok(entries)
    }

    /// The first row after the one covering `address` within the same
    /// sequence; the primitive behind source-level stepping.
    pub fn entry_after(&self, address: FileAddr) -> Result<Option<LineTableEntry>> {
        let entries = self.iter().collect::<Result<Vec<_>>>()?;

        let mut candidate_index: Option<usize> = None;

        for (idx, entry) in entries.iter().enumerate() {
            if entry.end_sequence {
                candidate_index = None;
                continue;
            }

            if entry.address > address {
                break;
            }

            candidate_index = Some(idx);

            if entry.address == address {
                break;
            }
        }

        let start = match candidate_index {
            Some(idx) => idx + 1,
            None => 0,
        };

        for entry in entries.iter().skip(start) {
            if entry.end_sequence {
                break;
            }
            return Ok(Some(entry.clone()));
        }
        Ok(None)
    }
}

/// Executes the line-number program, yielding one item per emitted row.
pub struct LineTableIter<'a> {
    table: &'a LineTable,
    cursor: Cursor<'a>,
    registers: LineTableState,
    finished: bool,
}

impl<'a> LineTableIter<'a> {
    fn new(table: &'a LineTable) -> Self {
        let program = table.program();
        let base_addr = FileAddr::from(table.dwarf().elf(), 0);
        LineTableIter {
            table,
            cursor: Cursor::new(program),
            registers: LineTableState::new(table.default_is_stmt, base_addr),
            finished: false,
        }
    }

    fn make_entry(&self) -> LineTableEntry {
        LineTableEntry {
            address: self.registers.address,
            file_index: self.registers.file_index,
            line: self.registers.line,
            column: self.registers.column,
            is_stmt: self.registers.is_stmt,
            basic_block_start: self.registers.basic_block_start,
            end_sequence: self.registers.end_sequence,
            prologue_end: self.registers.prologue_end,
            epilogue_begin: self.registers.epilogue_begin,
            discriminator: self.registers.discriminator,
            file: self.table.file(self.registers.file_index),
        }
    }

    fn clear_single_shot_flags(&mut self) {
        self.registers.basic_block_start = false;
        self.registers.prologue_end = false;
        self.registers.epilogue_begin = false;
        self.registers.discriminator = 0;
    }

    fn execute_standard_opcode(&mut self, opcode: u8) -> Result<Option<LineTableEntry>> {
        match opcode {
            DW_LNS_COPY => {
                let entry = self.make_entry();
                self.clear_single_shot_flags();
                return Ok(Some(entry));
            }
            DW_LNS_ADVANCE_PC => {
                let advance = self.cursor.read_uleb128()?;
                self.registers.address += advance as i64;
            }
            DW_LNS_ADVANCE_LINE => {
                let advance = self.cursor.read_sleb128()?;
                self.registers.line = ((self.registers.line as i64) + advance) as u64;
            }
            DW_LNS_SET_FILE => {
                self.registers.file_index = self.cursor.read_uleb128()?;
            }
            DW_LNS_SET_COLUMN => {
                self.registers.column = self.cursor.read_uleb128()?;
            }
            DW_LNS_NEGATE_STMT => {
                self.registers.is_stmt = !self.registers.is_stmt;
            }
            DW_LNS_SET_BASIC_BLOCK => {
                self.registers.basic_block_start = true;
            }
            DW_LNS_CONST_ADD_PC => {
                let adjust = ((255 - self.table.opcode_base) / self.table.line_range) as u64;
                self.registers.address += adjust as i64;
            }
            DW_LNS_FIXED_ADVANCE_PC => {
                let advance = self.cursor.read_u16()? as u64;
                self.registers.address += advance as i64;
            }
            DW_LNS_SET_PROLOGUE_END => {
                self.registers.prologue_end = true;
            }
            DW_LNS_SET_EPILOGUE_BEGIN => {
                self.registers.epilogue_begin = true;
            }
            DW_LNS_SET_ISA => {
                // Operand parsed to keep the cursor in step; value unused.
                let _ = self.cursor.read_uleb128()?;
            }
            _ => {
                return Err(Error::UnsupportedLineProgram(format!(
                    "unexpected standard opcode {opcode:#x}"
                )))
            }
        }
        Ok(None)
    }

    fn execute_extended_opcode(&mut self) -> Result<Option<LineTableEntry>> {
        let len = self.cursor.read_uleb128()? as usize;
        let before = self.cursor.position();
        let opcode = self.cursor.read_u8()?;
        let mut emitted = None;
        match opcode {
            DW_LNE_END_SEQUENCE => {
                self.registers.end_sequence = true;
                emitted = Some(self.make_entry());
                self.registers = LineTableState::new(
                    self.table.default_is_stmt,
                    FileAddr::from(self.table.dwarf().elf(), 0),
                );
            }
            DW_LNE_SET_ADDRESS => {
                let addr = self.cursor.read_u64()?;
                self.registers.address = FileAddr::from(self.table.dwarf().elf(), addr);
            }
            DW_LNE_DEFINE_FILE => {
                let file = parse_line_table_file(
                    &mut self.cursor,
                    self.table.cu(),
                    &self.table.include_directories,
                )?;
                self.table.file_names.borrow_mut().push(file);
            }
            DW_LNE_SET_DISCRIMINATOR => {
                self.registers.discriminator = self.cursor.read_uleb128()?;
            }
            _ => {
                return Err(Error::UnsupportedLineProgram(format!(
                    "unexpected extended opcode {opcode:#x}"
                )))
            }
        }

        let consumed = self.cursor.position() - before;
        if consumed < len {
            self.cursor.advance(len - consumed)?;
        }
        Ok(emitted)
    }

    fn next_entry(&mut self) -> Result<Option<LineTableEntry>> {
        loop {
            if self.cursor.is_finished() {
                return Ok(None);
            }

            let opcode = self.cursor.read_u8()?;

            let emitted = if opcode == 0 {
                self.execute_extended_opcode()?
            } else if opcode < self.table.opcode_base {
                self.execute_standard_opcode(opcode)?
            } else {
                let adjusted = opcode - self.table.opcode_base;
                let address_increment = adjusted / self.table.line_range;
                let line_increment = adjusted % self.table.line_range;
                self.registers.address += address_increment as i64;
                self.registers.line = (self.registers.line as i64
                    + self.table.line_base as i64
                    + line_increment as i64) as u64;
                let entry = self.make_entry();
                self.clear_single_shot_flags();
                Some(entry)
            };

            if emitted.is_some() {
                return Ok(emitted);
            }
        }
    }
}

impl Iterator for LineTableIter<'_> {
    type Item = Result<LineTableEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

fn paths_match(lhs: &Path, rhs: &Path) -> bool {
    if rhs.is_absolute() {
        return lhs == rhs;
    }

    let lhs_components: Vec<_> = lhs.components().collect();
    let rhs_components: Vec<_> = rhs.components().collect();

    if rhs_components.len() > lhs_components.len() {
        return false;
    }

    let start = lhs_components.len() - rhs_components.len();
    lhs_components[start..] == rhs_components
}

fn parse_line_table_file(
    cur: &mut Cursor<'_>,
    cu: &CompileUnit,
    include_directories: &[PathBuf],
) -> Result<LineTableFile> {
    let name_bytes = cur.read_cstr()?;
    let name = PathBuf::from(std::ffi::OsStr::from_bytes(name_bytes));
    let dir_index = cur.read_uleb128()? as usize;
    let modification_time = cur.read_uleb128()?;
    let file_length = cur.read_uleb128()?;

    let path = if name.is_absolute() {
        name
    } else if dir_index == 0 {
        match compilation_dir(cu)? {
            Some(dir) => dir.join(name),
            None => name,
        }
    } else if let Some(dir) = include_directories.get(dir_index - 1) {
        dir.join(name)
    } else {
        name
    };

    Ok(LineTableFile {
        path,
        modification_time,
        file_length,
    })
}

fn compilation_dir(cu: &CompileUnit) -> Result<Option<PathBuf>> {
    let root = cu.root()?;
    if !root.contains(DW_AT_COMP_DIR) {
        return Ok(None);
    }
    Ok(Some(PathBuf::from(
        root.get_attr(DW_AT_COMP_DIR)?.as_string()?,
    )))
}

/// One compile unit: a span of `.debug_info` covering the unit header and
/// its DIE tree, plus the lazily built line table.
#[derive(Clone, Debug)]
pub struct CompileUnit {
    dwarf: *const Dwarf,
    index: usize,
    offset: usize,
    size: usize,
    abbrev_offset: u32,
    line_table: RefCell<Option<LineTable>>,
}

// DWARF v4 32-bit unit header:
// unit_length:u32, version:u16, debug_abbrev_offset:u32, address_size:u8
const CU_HEADER_SIZE: usize = 11;

impl CompileUnit {
    pub fn data(&self) -> &[u8] {
        let dwarf = unsafe { &*self.dwarf };
        &dwarf.debug_info()[self.offset..self.offset + self.size]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn root(&self) -> Result<Die> {
        parse_die_at(self, CU_HEADER_SIZE)
    }

    pub fn abbrev_table(&self) -> &HashMap<u64, Abbrev> {
        let dwarf = unsafe { &*self.dwarf };
        dwarf
            .abbrev_tables
            .get(&self.abbrev_offset)
            .expect("abbrev table parsed with the compile unit")
    }

    /// This unit's line table, built on first use. `None` when the unit
    /// carries no `DW_AT_stmt_list`.
    pub fn lines(&self) -> Result<Option<LineTable>> {
        if let Some(existing) = self.line_table.borrow().clone() {
            return Ok(Some(existing));
        }

        let root = self.root()?;
        if !root.contains(DW_AT_STMT_LIST) {
            return Ok(None);
        }

        let dwarf = unsafe { &*self.dwarf };
        let debug_line = dwarf.debug_line();
        let offset = root.get_attr(DW_AT_STMT_LIST)?.as_section_offset()? as usize;
        if offset >= debug_line.len() {
            return Err(Error::Truncated("line table offset"));
        }

        let mut cursor = Cursor::new(&debug_line[offset..]);
        let unit_length = cursor.read_u32()? as usize;
        let unit_end = cursor.position() + unit_length;

        let version = cursor.read_u16()?;
        if version != 4 {
            return Err(Error::UnsupportedLineProgram(format!(
                "line table version {version}"
            )));
        }

        let header_length = cursor.read_u32()? as usize;
        let header_end = cursor.position() + header_length;

        let minimum_instruction_length = cursor.read_u8()?;
        if minimum_instruction_length != 1 {
            return Err(Error::UnsupportedLineProgram(format!(
                "minimum instruction length {minimum_instruction_length}"
            )));
        }
        let maximum_operations_per_instruction = cursor.read_u8()?;
        if maximum_operations_per_instruction != 1 {
            return Err(Error::UnsupportedLineProgram(format!(
                "{maximum_operations_per_instruction} operations per instruction"
            )));
        }

        let default_is_stmt = cursor.read_u8()? != 0;
        let line_base = cursor.read_i8()?;
        let line_range = cursor.read_u8()?;
        let opcode_base = cursor.read_u8()?;

        const EXPECTED_OPCODE_LENGTHS: [u8; 12] = [0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1];
        if opcode_base == 0 || opcode_base as usize > EXPECTED_OPCODE_LENGTHS.len() + 1 {
            return Err(Error::UnsupportedLineProgram(format!(
                "opcode base {opcode_base}"
            )));
        }
        for expected in EXPECTED_OPCODE_LENGTHS
            .iter()
            .take(opcode_base as usize - 1)
        {
            if cursor.read_u8()? != *expected {
                return Err(Error::UnsupportedLineProgram(
                    "unexpected standard opcode length".into(),
                ));
            }
        }

        let comp_dir = compilation_dir(self)?;
        let mut include_directories = Vec::new();
        while cursor.position() < header_end {
            let dir_bytes = cursor.read_cstr()?;
            if dir_bytes.is_empty() {
                break;
            }
            let dir = PathBuf::from(std::ffi::OsStr::from_bytes(dir_bytes));
            if dir.is_absolute() {
                include_directories.push(dir);
            } else if let Some(comp_dir) = &comp_dir {
                include_directories.push(comp_dir.join(dir));
            } else {
                include_directories.push(dir);
            }
        }

        let mut files = Vec::new();
        while cursor.position() < header_end {
            if cursor.remaining().first() == Some(&0) {
                cursor.advance(1)?;
                break;
            }
            files.push(parse_line_table_file(
                &mut cursor,
                self,
                &include_directories,
            )?);
        }

        if unit_end > debug_line.len() - offset || header_end > unit_end {
            return Err(Error::Truncated("line-number program"));
        }

        let table = LineTable {
            dwarf: self.dwarf,
            cu_index: self.index,
            default_is_stmt,
            line_base,
            line_range,
            opcode_base,
            include_directories,
            file_names: RefCell::new(files),
            program_offset: offset + header_end,
            program_len: unit_end - header_end,
        };

        *self.line_table.borrow_mut() = Some(table.clone());
        Ok(Some(table))
    }
}

#[derive(Clone, Copy, Debug)]
struct IndexEntry {
    cu_index: usize,
    pos: usize,
}

/// Decoder over an ELF object's DWARF v4 sections. Owns the compile-unit
/// directory and the lazily built caches; everything else is parsed on
/// demand out of the mapped sections.
#[derive(Debug)]
pub struct Dwarf {
    elf: *const Elf,
    compile_units: Vec<CompileUnit>,
    abbrev_tables: HashMap<u32, HashMap<u64, Abbrev>>,
    function_index: RefCell<Option<HashMap<String, Vec<IndexEntry>>>>,
}

impl Dwarf {
    pub fn new(elf: &Elf) -> Result<Box<Self>> {
        let mut dwarf = Box::new(Self {
            elf: elf as *const Elf,
            compile_units: Vec::new(),
            abbrev_tables: HashMap::new(),
            function_index: RefCell::new(None),
        });

        dwarf.parse_compile_units()?;
        debug!(
            compile_units = dwarf.compile_units.len(),
            "parsed .debug_info"
        );
        Ok(dwarf)
    }

    pub(crate) fn elf(&self) -> &Elf {
        unsafe { &*self.elf }
    }

    fn section(&self, name: &str) -> &[u8] {
        // Missing debug sections read as empty; every query then just misses.
        self.elf().get_section_contents(name).unwrap_or(&[])
    }

    pub fn debug_info(&self) -> &[u8] {
        self.section(".debug_info")
    }

    pub fn debug_abbrev(&self) -> &[u8] {
        self.section(".debug_abbrev")
    }

    pub fn debug_str(&self) -> &[u8] {
        self.section(".debug_str")
    }

    pub fn debug_ranges(&self) -> &[u8] {
        self.section(".debug_ranges")
    }

    pub fn debug_line(&self) -> &[u8] {
        self.section(".debug_line")
    }

    pub fn compile_units(&self) -> &[CompileUnit] {
        &self.compile_units
    }

    fn parse_compile_units(&mut self) -> Result<()> {
        // Deref outside the loop: the slices borrow the mapping, not self.
        let elf: &Elf = unsafe { &*self.elf };
        let debug_info = elf.get_section_contents(".debug_info").unwrap_or(&[]);
        let debug_abbrev = elf.get_section_contents(".debug_abbrev").unwrap_or(&[]);

        let mut offset = 0usize;
        let mut index = 0usize;
        while offset < debug_info.len() {
            let mut cur = Cursor::new(&debug_info[offset..]);
            let unit_len = cur.read_u32()?;
            if unit_len == 0xffff_ffff {
                return Err(Error::UnsupportedDwarf("DWARF64 is not supported".into()));
            }
            let version = cur.read_u16()?;
            if version != 4 {
                return Err(Error::UnsupportedDwarf(format!(
                    "DWARF version {version}"
                )));
            }
            let abbrev_offset = cur.read_u32()?;
            let address_size = cur.read_u8()?;
            if address_size != 8 {
                return Err(Error::UnsupportedDwarf(format!(
                    "address size {address_size}"
                )));
            }

            let total_size = unit_len as usize + 4;
            if offset + total_size > debug_info.len() {
                return Err(Error::Truncated("compile unit"));
            }

            if !self.abbrev_tables.contains_key(&abbrev_offset) {
                let table = parse_abbrev_table(debug_abbrev, abbrev_offset as usize)?;
                self.abbrev_tables.insert(abbrev_offset, table);
            }

            self.compile_units.push(CompileUnit {
                dwarf: self as *const _ as *const Dwarf,
                index,
                offset,
                size: total_size,
                abbrev_offset,
                line_table: RefCell::new(None),
            });

            offset += total_size;
            index += 1;
        }
        Ok(())
    }

    /// The compile unit whose root DIE covers `address`.
    pub fn compile_unit_containing_address(
        &self,
        address: FileAddr,
    ) -> Result<Option<&CompileUnit>> {
        for cu in &self.compile_units {
            if cu.root()?.contains_address(address)? {
                return Ok(Some(cu));
            }
        }
        Ok(None)
    }

    /// All functions with the given name, across every compile unit.
    /// Overloads and inlined instances each yield a separate DIE.
    pub fn find_functions(&self, name: &str) -> Result<Vec<Die>> {
        self.ensure_index()?;
        let borrow = self.function_index.borrow();
        let function_index = borrow.as_ref().expect("function index built");

        let mut found = Vec::new();
        if let Some(entries) = function_index.get(name) {
            for entry in entries {
                found.push(parse_die_at(&self.compile_units[entry.cu_index], entry.pos)?);
            }
        }
        Ok(found)
    }

    /// The `DW_TAG_subprogram` whose address coverage includes `address`.
    pub fn function_containing_address(&self, address: FileAddr) -> Result<Option<Die>> {
        self.ensure_index()?;
        let borrow = self.function_index.borrow();
        let function_index = borrow.as_ref().expect("function index built");

        for entries in function_index.values() {
            for entry in entries {
                let die = parse_die_at(&self.compile_units[entry.cu_index], entry.pos)?;
                if die.tag() == Some(DW_TAG_SUBPROGRAM) && die.contains_address(address)? {
                    return Ok(Some(die));
                }
            }
        }
        Ok(None)
    }

    /// The stack of inlined subroutines active at `address`, outermost
    /// function first.
    pub fn inline_stack_at_address(&self, address: FileAddr) -> Result<Vec<Die>> {
        let mut stack = Vec::new();
        if let Some(func) = self.function_containing_address(address)? {
            stack.push(func);
            loop {
                let mut found = None;
                for child in stack.last().expect("stack non-empty").children() {
                    if child.tag() == Some(DW_TAG_INLINED_SUBROUTINE)
                        && child.contains_address(address)?
                    {
                        found = Some(child);
                        break;
                    }
                }
                match found {
                    Some(die) => stack.push(die),
                    None => break,
                }
            }
        }
        Ok(stack)
    }

    fn ensure_index(&self) -> Result<()> {
        if self.function_index.borrow().is_some() {
            return Ok(());
        }

        let mut index = HashMap::new();
        for (cu_index, cu) in self.compile_units.iter().enumerate() {
            self.index_die(cu_index, &cu.root()?, &mut index)?;
        }
        debug!(
            functions = index.values().map(Vec::len).sum::<usize>(),
            "built function index"
        );
        *self.function_index.borrow_mut() = Some(index);
        Ok(())
    }

    // Pre-order DFS, so multimap entries for one name land in tree order.
    fn index_die(
        &self,
        cu_index: usize,
        die: &Die,
        index: &mut HashMap<String, Vec<IndexEntry>>,
    ) -> Result<()> {
        let has_range = die.contains(DW_AT_LOW_PC) || die.contains(DW_AT_RANGES);
        let is_function = matches!(
            die.tag(),
            Some(DW_TAG_SUBPROGRAM | DW_TAG_INLINED_SUBROUTINE)
        );
        if has_range && is_function {
            if let Some(name) = die.name()? {
                index.entry(name).or_default().push(IndexEntry {
                    cu_index,
                    pos: die.position(),
                });
            }
        }
        for child in die.children() {
            self.index_die(cu_index, &child, index)?;
        }
        Ok(())
    }
}

fn parse_abbrev_table(data: &[u8], offset: usize) -> Result<HashMap<u64, Abbrev>> {
    if offset >= data.len() {
        return Err(Error::Truncated("abbrev table offset"));
    }
    let mut table = HashMap::new();
    let mut cur = Cursor::new(&data[offset..]);

    loop {
        let code = cur.read_uleb128()?;
        if code == 0 {
            break;
        }
        let tag = cur.read_uleb128()?;
        let has_children = cur.read_u8()? != 0;
        let mut attr_specs = Vec::new();
        loop {
            let attr = cur.read_uleb128()?;
            let form = cur.read_uleb128()?;
            if attr == 0 && form == 0 {
                break;
            }
            attr_specs.push(AttrSpec { attr, form });
        }
        table.insert(
            code,
            Abbrev {
                code,
                tag,
                has_children,
                attr_specs,
            },
        );
    }
    Ok(table)
}
