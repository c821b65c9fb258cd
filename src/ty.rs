use std::cell::RefCell;

use crate::dwarf::{
    Die, DwarfTag, DW_ATE_BOOLEAN, DW_ATE_FLOAT, DW_ATE_SIGNED, DW_ATE_SIGNED_CHAR,
    DW_ATE_UNSIGNED, DW_ATE_UNSIGNED_CHAR, DW_ATE_UTF, DW_AT_BIT_OFFSET, DW_AT_BIT_SIZE,
    DW_AT_BYTE_SIZE, DW_AT_DATA_BIT_OFFSET, DW_AT_DATA_MEMBER_LOCATION, DW_AT_ENCODING,
    DW_AT_TYPE, DW_AT_UPPER_BOUND, DW_TAG_ARRAY_TYPE, DW_TAG_BASE_TYPE, DW_TAG_CLASS_TYPE,
    DW_TAG_CONST_TYPE, DW_TAG_ENUMERATION_TYPE, DW_TAG_MEMBER, DW_TAG_POINTER_TYPE,
    DW_TAG_PTR_TO_MEMBER_TYPE, DW_TAG_REFERENCE_TYPE, DW_TAG_RVALUE_REFERENCE_TYPE,
    DW_TAG_STRUCTURE_TYPE, DW_TAG_SUBRANGE_TYPE, DW_TAG_TYPEDEF, DW_TAG_UNION_TYPE,
    DW_TAG_VOLATILE_TYPE,
};
use crate::error::{Error, Result};
use crate::memory::ReadMemory;
use crate::types::VirtAddr;
use crate::utils::{memcpy_bits, FromBytes};

const CV_TYPEDEF_TAGS: &[DwarfTag] = &[DW_TAG_CONST_TYPE, DW_TAG_VOLATILE_TYPE, DW_TAG_TYPEDEF];
const CVREF_TYPEDEF_TAGS: &[DwarfTag] = &[
    DW_TAG_CONST_TYPE,
    DW_TAG_VOLATILE_TYPE,
    DW_TAG_TYPEDEF,
    DW_TAG_REFERENCE_TYPE,
    DW_TAG_RVALUE_REFERENCE_TYPE,
];
const ALL_STRIP_TAGS: &[DwarfTag] = &[
    DW_TAG_CONST_TYPE,
    DW_TAG_VOLATILE_TYPE,
    DW_TAG_TYPEDEF,
    DW_TAG_REFERENCE_TYPE,
    DW_TAG_RVALUE_REFERENCE_TYPE,
    DW_TAG_POINTER_TYPE,
];

/// A DWARF type DIE with its computed byte size memoized.
#[derive(Clone)]
pub struct Type {
    die: Die,
    byte_size: RefCell<Option<usize>>,
}

impl Type {
    pub fn new(die: Die) -> Self {
        Self {
            die,
            byte_size: RefCell::new(None),
        }
    }

    pub fn die(&self) -> &Die {
        &self.die
    }

    pub fn byte_size(&self) -> Result<usize> {
        if let Some(size) = *self.byte_size.borrow() {
            return Ok(size);
        }
        let size = self.compute_byte_size()?;
        *self.byte_size.borrow_mut() = Some(size);
        Ok(size)
    }

    fn compute_byte_size(&self) -> Result<usize> {
        let tag = self.die.tag();

        if tag == Some(DW_TAG_POINTER_TYPE) {
            return Ok(8);
        }
        if tag == Some(DW_TAG_PTR_TO_MEMBER_TYPE) {
            // Member function pointers carry an adjustment word
            let member_type = self.die.get_attr(DW_AT_TYPE)?.as_reference()?;
            if member_type.tag() == Some(DW_TAG_SUBRANGE_TYPE) {
                return Ok(16);
            }
            return Ok(8);
        }
        if tag == Some(DW_TAG_ARRAY_TYPE) {
            let element = Type::new(self.die.get_attr(DW_AT_TYPE)?.as_reference()?);
            let mut value_size = element.byte_size()?;
            for child in self.die.children() {
                if child.tag() == Some(DW_TAG_SUBRANGE_TYPE) {
                    value_size *= child.get_attr(DW_AT_UPPER_BOUND)?.as_u64()? as usize + 1;
                }
            }
            return Ok(value_size);
        }
        if self.die.contains(DW_AT_BYTE_SIZE) {
            return Ok(self.die.get_attr(DW_AT_BYTE_SIZE)?.as_u64()? as usize);
        }
        if self.die.contains(DW_AT_TYPE) {
            return Type::new(self.die.get_attr(DW_AT_TYPE)?.as_reference()?).byte_size();
        }
        Ok(0)
    }

    /// Follows `DW_AT_type` links while the outer tag is one of `tags`.
    pub fn strip(&self, tags: &[DwarfTag]) -> Result<Type> {
        let mut die = self.die.clone();
        while die.tag().map_or(false, |tag| tags.contains(&tag)) {
            die = die.get_attr(DW_AT_TYPE)?.as_reference()?;
        }
        Ok(Type::new(die))
    }

    pub fn strip_cv_typedef(&self) -> Result<Type> {
        self.strip(CV_TYPEDEF_TAGS)
    }

    pub fn strip_cvref_typedef(&self) -> Result<Type> {
        self.strip(CVREF_TYPEDEF_TAGS)
    }

    pub fn strip_all(&self) -> Result<Type> {
        self.strip(ALL_STRIP_TAGS)
    }

    pub fn is_char_type(&self) -> Result<bool> {
        let stripped = self.strip_cv_typedef()?;
        let die = stripped.die();
        if !die.contains(DW_AT_ENCODING) {
            return Ok(false);
        }
        let encoding = die.get_attr(DW_AT_ENCODING)?.as_u64()?;
        // Note the grouping: an unsigned_char encoding qualifies on its own,
        // without the base_type tag check applying to it.
        Ok(die.tag() == Some(DW_TAG_BASE_TYPE) && encoding == DW_ATE_SIGNED_CHAR
            || encoding == DW_ATE_UNSIGNED_CHAR)
    }
}

struct BitfieldInfo {
    bit_size: usize,
    storage_byte_size: usize,
    bit_offset: usize,
}

fn bitfield_information(member: &Die, storage_hint: usize) -> Result<Option<BitfieldInfo>> {
    if !member.contains(DW_AT_BIT_SIZE) {
        return Ok(None);
    }
    let bit_size = member.get_attr(DW_AT_BIT_SIZE)?.as_u64()? as usize;
    let storage_byte_size = if member.contains(DW_AT_BYTE_SIZE) {
        member.get_attr(DW_AT_BYTE_SIZE)?.as_u64()? as usize
    } else {
        storage_hint
    };
    let bit_offset = if member.contains(DW_AT_BIT_OFFSET) {
        // DWARF v4 counts from the storage unit's most significant bit;
        // convert to an offset from bit zero.
        storage_byte_size * 8
            - bit_size
            - member.get_attr(DW_AT_BIT_OFFSET)?.as_u64()? as usize
    } else if member.contains(DW_AT_DATA_BIT_OFFSET) {
        (member.get_attr(DW_AT_DATA_BIT_OFFSET)?.as_u64()? % 8) as usize
    } else {
        0
    };
    Ok(Some(BitfieldInfo {
        bit_size,
        storage_byte_size,
        bit_offset,
    }))
}

/// A byte buffer paired with the DWARF type describing it, optionally
/// remembering the virtual address it was read from.
#[derive(Clone)]
pub struct TypedData {
    data: Vec<u8>,
    value_type: Type,
    address: Option<VirtAddr>,
}

impl TypedData {
    pub fn new(data: Vec<u8>, value_type: Type) -> Self {
        Self {
            data,
            value_type,
            address: None,
        }
    }

    pub fn with_address(data: Vec<u8>, value_type: Type, address: VirtAddr) -> Self {
        Self {
            data,
            value_type,
            address: Some(address),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn value_type(&self) -> &Type {
        &self.value_type
    }

    pub fn address(&self) -> Option<VirtAddr> {
        self.address
    }

    /// Renders the value as a human-readable string. Process memory is only
    /// touched to peek at `char` pointer targets.
    pub fn visualize<M: ReadMemory + ?Sized>(&self, mem: &M) -> Result<String> {
        self.visualize_with_depth(mem, 0)
    }

    fn visualize_with_depth<M: ReadMemory + ?Sized>(
        &self,
        mem: &M,
        depth: usize,
    ) -> Result<String> {
        let die = self.value_type.die();
        match die.tag() {
            Some(DW_TAG_BASE_TYPE) => self.visualize_base_type(),
            Some(DW_TAG_POINTER_TYPE) => self.visualize_pointer_type(mem),
            Some(DW_TAG_PTR_TO_MEMBER_TYPE) => self.visualize_member_pointer_type(),
            Some(DW_TAG_ARRAY_TYPE) => self.visualize_array_type(mem),
            Some(DW_TAG_CLASS_TYPE | DW_TAG_STRUCTURE_TYPE | DW_TAG_UNION_TYPE) => {
                self.visualize_class_type(mem, depth)
            }
            Some(
                DW_TAG_ENUMERATION_TYPE | DW_TAG_TYPEDEF | DW_TAG_CONST_TYPE
                | DW_TAG_VOLATILE_TYPE,
            ) => {
                let inner = Type::new(die.get_attr(DW_AT_TYPE)?.as_reference()?);
                TypedData {
                    data: self.data.clone(),
                    value_type: inner,
                    address: self.address,
                }
                .visualize_with_depth(mem, depth)
            }
            other => Err(Error::UnsupportedType(format!("tag {other:#x?}"))),
        }
    }

    fn value_bytes(&self, size: usize) -> Result<&[u8]> {
        self.data
            .get(..size)
            .ok_or(Error::Truncated("typed value"))
    }

    fn visualize_base_type(&self) -> Result<String> {
        let die = self.value_type.die();
        let encoding = die.get_attr(DW_AT_ENCODING)?.as_u64()?;
        let size = self.value_type.byte_size()?;

        match encoding {
            DW_ATE_BOOLEAN => {
                let value: u8 = FromBytes::from_bytes(self.value_bytes(1)?)?;
                Ok(if value != 0 { "true" } else { "false" }.to_string())
            }
            DW_ATE_FLOAT => match size {
                4 => {
                    let value: f32 = FromBytes::from_bytes(self.value_bytes(4)?)?;
                    Ok(format!("{value}"))
                }
                8 => {
                    let value: f64 = FromBytes::from_bytes(self.value_bytes(8)?)?;
                    Ok(format!("{value}"))
                }
                16 => {
                    let value = x87_extended_to_f64(self.value_bytes(16)?);
                    Ok(format!("{value}"))
                }
                _ => Err(Error::UnsupportedType(format!(
                    "{size}-byte floating point"
                ))),
            },
            DW_ATE_SIGNED => match size {
                1 => Ok(format!("{}", i8::from_bytes(self.value_bytes(1)?)?)),
                2 => Ok(format!("{}", i16::from_bytes(self.value_bytes(2)?)?)),
                4 => Ok(format!("{}", i32::from_bytes(self.value_bytes(4)?)?)),
                8 => Ok(format!("{}", i64::from_bytes(self.value_bytes(8)?)?)),
                _ => Err(Error::UnsupportedType(format!(
                    "{size}-byte signed integer"
                ))),
            },
            DW_ATE_UNSIGNED => match size {
                1 => Ok(format!("{}", u8::from_bytes(self.value_bytes(1)?)?)),
                2 => Ok(format!("{}", u16::from_bytes(self.value_bytes(2)?)?)),
                4 => Ok(format!("{}", u32::from_bytes(self.value_bytes(4)?)?)),
                8 => Ok(format!("{}", u64::from_bytes(self.value_bytes(8)?)?)),
                _ => Err(Error::UnsupportedType(format!(
                    "{size}-byte unsigned integer"
                ))),
            },
            DW_ATE_SIGNED_CHAR => Ok(format!("{}", i8::from_bytes(self.value_bytes(1)?)?)),
            DW_ATE_UNSIGNED_CHAR => Ok(format!("{}", u8::from_bytes(self.value_bytes(1)?)?)),
            DW_ATE_UTF => Err(Error::UnsupportedType("UTF base type".into())),
            _ => Err(Error::UnsupportedType(format!(
                "base type encoding {encoding:#x}"
            ))),
        }
    }

    fn visualize_pointer_type<M: ReadMemory + ?Sized>(&self, mem: &M) -> Result<String> {
        let ptr: u64 = FromBytes::from_bytes(self.value_bytes(8)?)?;
        if ptr == 0 {
            return Ok("0x0".to_string());
        }
        let die = self.value_type.die();
        if die.contains(DW_AT_TYPE) {
            let pointee = Type::new(die.get_attr(DW_AT_TYPE)?.as_reference()?);
            if pointee.is_char_type()? {
                return Ok(format!("\"{}\"", mem.read_string(VirtAddr(ptr))?));
            }
        }
        Ok(format!("0x{ptr:x}"))
    }

    fn visualize_member_pointer_type(&self) -> Result<String> {
        let ptr: u64 = FromBytes::from_bytes(self.value_bytes(8)?)?;
        Ok(format!("0x{ptr:x}"))
    }

    fn visualize_array_type<M: ReadMemory + ?Sized>(&self, mem: &M) -> Result<String> {
        let die = self.value_type.die();
        let mut dimensions = Vec::new();
        for child in die.children() {
            if child.tag() == Some(DW_TAG_SUBRANGE_TYPE) {
                dimensions.push(child.get_attr(DW_AT_UPPER_BOUND)?.as_u64()? as usize + 1);
            }
        }
        // Reversed so the outermost dimension sits at the back, where the
        // recursion peels dimensions off.
        dimensions.reverse();
        let value_type = Type::new(die.get_attr(DW_AT_TYPE)?.as_reference()?);
        visualize_subrange(mem, &value_type, &self.data, &dimensions)
    }

    fn visualize_class_type<M: ReadMemory + ?Sized>(
        &self,
        mem: &M,
        depth: usize,
    ) -> Result<String> {
        let mut ret = String::from("{\n");
        for child in self.value_type.die().children() {
            // Note the grouping: a bit offset admits the child on its own,
            // without the member-tag check applying to it.
            let include = child.tag() == Some(DW_TAG_MEMBER)
                && child.contains(DW_AT_DATA_MEMBER_LOCATION)
                || child.contains(DW_AT_DATA_BIT_OFFSET);
            if !include {
                continue;
            }

            let indent = "\t".repeat(depth + 1);
            let byte_offset = if child.contains(DW_AT_DATA_MEMBER_LOCATION) {
                child.get_attr(DW_AT_DATA_MEMBER_LOCATION)?.as_u64()? as usize
            } else {
                child.get_attr(DW_AT_DATA_BIT_OFFSET)?.as_u64()? as usize / 8
            };
            let subtype = Type::new(child.get_attr(DW_AT_TYPE)?.as_reference()?);
            let size = subtype.byte_size()?;
            let member_bytes = self
                .data
                .get(byte_offset..byte_offset + size)
                .ok_or(Error::Truncated("member data"))?
                .to_vec();
            let member_data = TypedData::new(member_bytes, subtype).fixup_bitfield(&child)?;
            let member_str = member_data.visualize_with_depth(mem, depth + 1)?;
            let name = child.name()?.unwrap_or_else(|| "<unnamed>".to_string());
            ret += &format!("{indent}{name}: {member_str}\n");
        }
        ret += &"\t".repeat(depth);
        ret.push('}');
        Ok(ret)
    }

    /// If `member_die` declares a bitfield, extracts the field's bits into a
    /// fresh right-aligned buffer of the storage unit's size; otherwise
    /// returns the data unchanged.
    pub fn fixup_bitfield(&self, member_die: &Die) -> Result<TypedData> {
        let stripped = self.value_type.strip_cv_typedef()?;
        match bitfield_information(member_die, stripped.byte_size()?)? {
            Some(info) => {
                let mut fixed = vec![0u8; info.storage_byte_size];
                memcpy_bits(&mut fixed, 0, &self.data, info.bit_offset, info.bit_size);
                Ok(TypedData {
                    data: fixed,
                    value_type: self.value_type.clone(),
                    address: None,
                })
            }
            None => Ok(self.clone()),
        }
    }
}

fn visualize_subrange<M: ReadMemory + ?Sized>(
    mem: &M,
    value_type: &Type,
    data: &[u8],
    dimensions: &[usize],
) -> Result<String> {
    match dimensions.split_last() {
        None => {
            let elem_size = value_type.byte_size()?;
            let bytes = data
                .get(..elem_size)
                .ok_or(Error::Truncated("array element"))?;
            TypedData::new(bytes.to_vec(), value_type.clone()).visualize(mem)
        }
        Some((&size, inner)) => {
            let sub_size = inner.iter().product::<usize>() * value_type.byte_size()?;
            let mut ret = String::from("[");
            for i in 0..size {
                let subdata = data
                    .get(i * sub_size..)
                    .ok_or(Error::Truncated("array element"))?;
                ret += &visualize_subrange(mem, value_type, subdata, inner)?;
                if i != size - 1 {
                    ret += ", ";
                }
            }
            ret.push(']');
            Ok(ret)
        }
    }
}

/// Decodes an x87 80-bit extended double (stored in 16 bytes) well enough
/// to print it. The significand keeps its explicit integer bit.
fn x87_extended_to_f64(bytes: &[u8]) -> f64 {
    let significand = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let sign_exp = u16::from_le_bytes(bytes[8..10].try_into().unwrap());
    let sign = if sign_exp & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exp = (sign_exp & 0x7fff) as i32;

    if exp == 0x7fff {
        if significand << 1 == 0 {
            return sign * f64::INFINITY;
        }
        return f64::NAN;
    }
    if exp == 0 && significand == 0 {
        return sign * 0.0;
    }
    sign * significand as f64 * 2f64.powi(exp - 16383 - 63)
}
