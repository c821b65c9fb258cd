//! Debug-information engine for an x86-64 Linux source-level debugger.
//!
//! The crate memory-maps an ELF object and answers the queries a debugger
//! front-end needs from its DWARF v4 sections: translating between file
//! addresses, loaded virtual addresses and source lines, locating functions
//! (including inline stacks) by name or address, and rendering raw bytes
//! through their DWARF types.
//!
//! Process control, breakpoints and the like are collaborators, not part of
//! this crate; the only inward interface is [`memory::ReadMemory`], used to
//! peek at `char` pointer targets while rendering values.

pub mod dwarf;
pub mod elf;
pub mod error;
pub mod memory;
pub mod ty;
pub mod types;
pub mod utils;

pub use dwarf::{CompileUnit, Die, Dwarf, LineTable, LineTableEntry, LineTableFile, RangeList};
pub use elf::Elf;
pub use error::{Error, Result};
pub use memory::ReadMemory;
pub use ty::{Type, TypedData};
pub use types::{FileAddr, FileOffset, VirtAddr};
