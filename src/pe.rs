//! In-memory PE image parsing
//!
//! A read-only view over a module already mapped by the loader: headers,
//! section table, and the export directory. Just enough surface to find a
//! code section and enumerate an API surface for bulk hooking.

use crate::addr::{ConstCodeAddr, IntAddr};
use crate::error::{Error, Result};

const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
const NT_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
const PE32_MAGIC: u16 = 0x10B;
const PE32PLUS_MAGIC: u16 = 0x20B;
const EXPORT_DIRECTORY_INDEX: usize = 0;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct DataDirectory {
    virtual_address: u32,
    size: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct FileHeader {
    machine: u16,
    number_of_sections: u16,
    time_date_stamp: u32,
    pointer_to_symbol_table: u32,
    number_of_symbols: u32,
    size_of_optional_header: u16,
    characteristics: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SectionHeaderRaw {
    name: [u8; 8],
    virtual_size: u32,
    virtual_address: u32,
    size_of_raw_data: u32,
    pointer_to_raw_data: u32,
    pointer_to_relocations: u32,
    pointer_to_linenumbers: u32,
    number_of_relocations: u16,
    number_of_linenumbers: u16,
    characteristics: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ExportDirectory {
    characteristics: u32,
    time_date_stamp: u32,
    major_version: u16,
    minor_version: u16,
    name: u32,
    base: u32,
    number_of_functions: u32,
    number_of_names: u32,
    address_of_functions: u32,
    address_of_names: u32,
    address_of_name_ordinals: u32,
}

/// one section of a loaded image
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub characteristics: u32,
}

impl Section {
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_address && rva < self.virtual_address + self.virtual_size
    }
}

/// one named entry of the export table
#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    /// biased ordinal as GetProcAddress understands it
    pub ordinal: u32,
    pub rva: u32,
    /// true when the entry forwards to another module instead of code
    pub forwarded: bool,
}

/// read-only view of a loader-mapped PE image
pub struct PeImage {
    base: ConstCodeAddr,
}

impl PeImage {
    /// wrap a module base address
    ///
    /// # Safety
    /// `base` must be the base of an image currently mapped in this
    /// process, and the module must stay loaded while the view is used
    pub unsafe fn from_loaded(base: IntAddr) -> Result<Self> {
        let image = Self {
            base: ConstCodeAddr::new(base),
        };

        // SAFETY: caller guarantees a mapped image
        let dos_magic = unsafe { image.base.read::<u16>() };
        if dos_magic != DOS_MAGIC {
            return Err(Error::InvalidPeImage {
                reason: "missing MZ signature",
            });
        }
        // SAFETY: as above
        let signature = unsafe { image.at(image.nt_offset()).read::<u32>() };
        if signature != NT_SIGNATURE {
            return Err(Error::InvalidPeImage {
                reason: "missing PE signature",
            });
        }

        let magic = image.optional_magic();
        if magic != PE32_MAGIC && magic != PE32PLUS_MAGIC {
            return Err(Error::InvalidPeImage {
                reason: "unknown optional header magic",
            });
        }

        Ok(image)
    }

    pub fn base(&self) -> ConstCodeAddr {
        self.base
    }

    fn at(&self, rva: u32) -> ConstCodeAddr {
        self.base.offset(rva as isize)
    }

    fn nt_offset(&self) -> u32 {
        // e_lfanew sits at 0x3C of the DOS header
        // SAFETY: validated image per from_loaded
        unsafe { self.base.offset(0x3C).read::<u32>() }
    }

    fn file_header(&self) -> FileHeader {
        // SAFETY: validated image
        unsafe { self.at(self.nt_offset() + 4).read::<FileHeader>() }
    }

    fn optional_offset(&self) -> u32 {
        self.nt_offset() + 4 + core::mem::size_of::<FileHeader>() as u32
    }

    fn optional_magic(&self) -> u16 {
        // SAFETY: validated image
        unsafe { self.at(self.optional_offset()).read::<u16>() }
    }

    fn data_directory(&self, index: usize) -> DataDirectory {
        // the directory array trails the fixed part of the optional header
        let fixed = if self.optional_magic() == PE32PLUS_MAGIC {
            112
        } else {
            96
        };
        let offset = self.optional_offset() + fixed + (index * 8) as u32;
        // SAFETY: validated image
        unsafe { self.at(offset).read::<DataDirectory>() }
    }

    /// RVA of the image entry point
    pub fn entry_point_rva(&self) -> u32 {
        // AddressOfEntryPoint sits at a fixed offset in both optional forms
        // SAFETY: validated image
        unsafe { self.at(self.optional_offset() + 16).read::<u32>() }
    }

    /// the section table
    pub fn sections(&self) -> Vec<Section> {
        let header = self.file_header();
        let first =
            self.optional_offset() + header.size_of_optional_header as u32;

        (0..header.number_of_sections as u32)
            .map(|index| {
                let offset = first + index * core::mem::size_of::<SectionHeaderRaw>() as u32;
                // SAFETY: the section table is part of the mapped headers
                let raw = unsafe { self.at(offset).read::<SectionHeaderRaw>() };
                let name_len = raw.name.iter().position(|&b| b == 0).unwrap_or(8);
                Section {
                    name: String::from_utf8_lossy(&raw.name[..name_len]).into_owned(),
                    virtual_address: raw.virtual_address,
                    virtual_size: raw.virtual_size,
                    characteristics: raw.characteristics,
                }
            })
            .collect()
    }

    /// find a section by name
    pub fn section(&self, name: &str) -> Option<Section> {
        self.sections().into_iter().find(|s| s.name == name)
    }

    /// every named entry of the export directory
    pub fn exports(&self) -> Result<Vec<Export>> {
        let directory = self.data_directory(EXPORT_DIRECTORY_INDEX);
        if directory.virtual_address == 0 {
            return Ok(Vec::new());
        }

        // SAFETY: directory RVA was produced by the loader
        let table = unsafe { self.at(directory.virtual_address).read::<ExportDirectory>() };
        let names = self.at(table.address_of_names);
        let ordinals = self.at(table.address_of_name_ordinals);
        let functions = self.at(table.address_of_functions);

        let forward_range =
            directory.virtual_address..directory.virtual_address + directory.size;

        let mut exports = Vec::with_capacity(table.number_of_names as usize);
        for index in 0..table.number_of_names {
            // SAFETY: the three parallel arrays are part of the directory
            let name_rva = unsafe { names.offset(index as isize * 4).read::<u32>() };
            // SAFETY: as above
            let ordinal_index =
                unsafe { ordinals.offset(index as isize * 2).read::<u16>() } as u32;
            if ordinal_index >= table.number_of_functions {
                continue;
            }
            // SAFETY: as above
            let rva = unsafe { functions.offset(ordinal_index as isize * 4).read::<u32>() };

            exports.push(Export {
                name: self.read_ansi_string(name_rva),
                ordinal: table.base + ordinal_index,
                rva,
                forwarded: forward_range.contains(&rva),
            });
        }
        Ok(exports)
    }

    /// absolute address of an export RVA
    pub fn rva_to_addr(&self, rva: u32) -> ConstCodeAddr {
        self.at(rva)
    }

    fn read_ansi_string(&self, rva: u32) -> String {
        let mut bytes = Vec::new();
        let mut cursor = self.at(rva);
        loop {
            // SAFETY: export names are nul-terminated strings in the image
            let byte = unsafe { cursor.read::<u8>() };
            if byte == 0 {
                break;
            }
            bytes.push(byte);
            cursor = cursor.offset(1);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynlib;

    fn kernel32() -> PeImage {
        let base = dynlib::module_handle("kernel32.dll").unwrap();
        unsafe { PeImage::from_loaded(base).unwrap() }
    }

    #[test]
    fn test_headers_and_sections() {
        let image = kernel32();
        let sections = image.sections();
        assert!(!sections.is_empty());
        assert!(image.section(".text").is_some());
    }

    #[test]
    fn test_export_rva_matches_loader() {
        let image = kernel32();
        let exports = image.exports().unwrap();
        assert!(exports.len() > 100);

        let export = exports
            .iter()
            .find(|e| e.name == "GetTickCount64")
            .expect("kernel32 exports GetTickCount64");
        assert!(!export.forwarded);

        let resolved = dynlib::get("kernel32.dll", "GetTickCount64").unwrap();
        assert_eq!(image.rva_to_addr(export.rva), resolved);
    }

    #[test]
    fn test_forwarders_flagged() {
        // kernel32 forwards a number of its exports to ntdll
        let image = kernel32();
        let exports = image.exports().unwrap();
        assert!(exports.iter().any(|e| e.forwarded));
    }

    #[test]
    fn test_rejects_non_image() {
        let garbage = [0u8; 64];
        let result = unsafe { PeImage::from_loaded(garbage.as_ptr() as IntAddr) };
        assert!(matches!(result, Err(Error::InvalidPeImage { .. })));
    }
}
