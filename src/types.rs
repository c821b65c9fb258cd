use std::{
    cmp::Ordering,
    ops::{Add, AddAssign, Sub, SubAssign},
};

use crate::elf::Elf;

/// An address in a running process's address space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    /// Translates into `obj`'s link-time address space by removing the load
    /// bias. Returns the null file address when the virtual address does not
    /// fall inside any of `obj`'s loaded sections; no DWARF query resolves
    /// through a null address.
    pub fn to_file_addr(&self, obj: &Elf) -> FileAddr {
        if obj.get_section_containing_addr_virt(*self).is_none() {
            return FileAddr::null();
        }
        FileAddr::from(obj, self.0 - obj.load_bias().0)
    }
}

impl Add<i64> for VirtAddr {
    type Output = Self;

    fn add(self, offset: i64) -> Self {
        VirtAddr((self.0 as i64 + offset) as u64)
    }
}

impl Sub<i64> for VirtAddr {
    type Output = Self;

    fn sub(self, offset: i64) -> Self {
        VirtAddr((self.0 as i64 - offset) as u64)
    }
}

impl AddAssign<i64> for VirtAddr {
    fn add_assign(&mut self, offset: i64) {
        self.0 = (self.0 as i64 + offset) as u64;
    }
}

impl SubAssign<i64> for VirtAddr {
    fn sub_assign(&mut self, offset: i64) {
        self.0 = (self.0 as i64 - offset) as u64;
    }
}

/// An address in an ELF object's link-time address space, tagged with the
/// object it belongs to. The null address (no owning object) is the result
/// of translating a virtual address no object contains.
#[derive(Copy, Clone, Debug)]
pub struct FileAddr {
    elf: *const Elf,
    addr: u64,
}

impl FileAddr {
    pub fn from(elf: &Elf, addr: u64) -> Self {
        FileAddr {
            elf: elf as *const Elf,
            addr,
        }
    }

    pub fn null() -> Self {
        FileAddr {
            elf: std::ptr::null(),
            addr: 0,
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn is_null(&self) -> bool {
        self.elf.is_null()
    }

    /// Returns `None` for the null address.
    pub fn elf_file(&self) -> Option<&Elf> {
        unsafe { self.elf.as_ref() }
    }

    /// Translates into the process's address space by applying the load
    /// bias. Addresses outside every loaded section map to `VirtAddr(0)`.
    pub fn to_virt_addr(&self) -> VirtAddr {
        let elf = match self.elf_file() {
            Some(elf) => elf,
            None => return VirtAddr(0),
        };
        if elf.get_section_containing_addr(*self).is_none() {
            return VirtAddr(0);
        }
        VirtAddr(self.addr + elf.load_bias().0)
    }
}

impl Add<i64> for FileAddr {
    type Output = Self;

    fn add(self, offset: i64) -> Self {
        let new_addr = (self.addr as i64).wrapping_add(offset) as u64;
        FileAddr {
            elf: self.elf,
            addr: new_addr,
        }
    }
}

impl Sub<i64> for FileAddr {
    type Output = Self;

    fn sub(self, offset: i64) -> Self {
        self + (-offset)
    }
}

impl AddAssign<i64> for FileAddr {
    fn add_assign(&mut self, offset: i64) {
        self.addr = (self.addr as i64).wrapping_add(offset) as u64;
    }
}

impl SubAssign<i64> for FileAddr {
    fn sub_assign(&mut self, offset: i64) {
        self.addr = (self.addr as i64).wrapping_sub(offset) as u64;
    }
}

// Equality compares the owning object as well as the raw address.
impl PartialEq for FileAddr {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.elf == other.elf
    }
}
impl Eq for FileAddr {}

// Ordering is only meaningful within one object.
impl PartialOrd for FileAddr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for FileAddr {
    fn cmp(&self, other: &Self) -> Ordering {
        assert!(
            self.elf == other.elf,
            "Comparing FileAddr from different ELF files"
        );
        self.addr.cmp(&other.addr)
    }
}

/// A raw byte offset into an ELF object's file image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOffset {
    elf: *const Elf,
    off: u64,
}

impl FileOffset {
    pub fn new(elf: &Elf, off: u64) -> Self {
        Self {
            elf: elf as *const Elf,
            off,
        }
    }

    pub fn off(&self) -> u64 {
        self.off
    }

    pub fn elf_file(&self) -> Option<&Elf> {
        unsafe { self.elf.as_ref() }
    }
}
