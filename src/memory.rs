use crate::error::Result;
use crate::types::VirtAddr;

/// Access to the traced process's memory.
///
/// The engine only dereferences process memory in one place: peeking at the
/// target of a `char` pointer while rendering a value. The process-control
/// side of the debugger implements this trait; tests implement it over a
/// plain buffer.
pub trait ReadMemory {
    fn read_memory(&self, address: VirtAddr, amount: usize) -> Result<Vec<u8>>;

    /// Reads a NUL-terminated string starting at `address`. Reads proceed in
    /// chunks that stop at page boundaries so a string near the end of a
    /// mapping does not fault past it.
    fn read_string(&self, address: VirtAddr) -> Result<String> {
        let mut ret = Vec::new();
        let mut addr = address;
        loop {
            let up_to_next_page = (0x1000 - (addr.0 & 0xfff)) as usize;
            let chunk_size = up_to_next_page.min(1024);
            let chunk = self.read_memory(addr, chunk_size)?;
            if chunk.is_empty() {
                break;
            }
            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                ret.extend_from_slice(&chunk[..nul]);
                break;
            }
            ret.extend_from_slice(&chunk);
            addr += chunk.len() as i64;
        }
        Ok(String::from_utf8_lossy(&ret).into_owned())
    }
}
