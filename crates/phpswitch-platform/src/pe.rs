//! Architecture detection from a Windows PE header.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use log::warn;
use phpswitch_model::Arch;

const PE_OFFSET_POINTER: u64 = 0x3C;
const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;

/// Read the COFF machine field of the executable at `path`.
///
/// # Errors
/// Returns an error when the file cannot be opened or is too short.
pub fn read_machine_type(path: &Path) -> std::io::Result<u16> {
    let mut file = File::open(path)?;

    file.seek(SeekFrom::Start(PE_OFFSET_POINTER))?;
    let mut offset = [0u8; 4];
    file.read_exact(&mut offset)?;
    let pe_offset = u64::from(u32::from_le_bytes(offset));

    // Skip the "PE\0\0" signature.
    file.seek(SeekFrom::Start(pe_offset + 4))?;
    let mut machine = [0u8; 2];
    file.read_exact(&mut machine)?;
    Ok(u16::from_le_bytes(machine))
}

/// Report the architecture of a native executable. Unreadable files count as x86.
#[must_use]
pub fn inspect_arch(path: &Path) -> Arch {
    match read_machine_type(path) {
        Ok(IMAGE_FILE_MACHINE_AMD64) => Arch::X64,
        Ok(_) => Arch::X86,
        Err(error) => {
            warn!(
                "Could not read PE header of {}, assuming x86: {error}",
                path.display()
            );
            Arch::X86
        }
    }
}
