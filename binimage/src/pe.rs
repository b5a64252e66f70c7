// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;

use anyhow::{anyhow, bail, Result};
use goblin::pe::header::{machine_to_str, COFF_MACHINE_X86_64};
use goblin::pe::section_table::IMAGE_SCN_MEM_EXECUTE;
use goblin::pe::PE;
use pdb::{AddressMap, PdbInternalSectionOffset, PDB};

use crate::build_id::BuildId;
use crate::debuginfo::{DebugInfo, Function};
use crate::path::FilePath;
use crate::{Address, Image, LoadError, Offset, Section};

impl<'data> Image<'data> for PeImage<'data> {
    fn executable_path(&self) -> &FilePath {
        &self.pe_path
    }

    fn debuginfo_path(&self) -> &FilePath {
        if let Some(pdb) = &self.pdb {
            &pdb.path
        } else {
            &self.pe_path
        }
    }

    fn read(&self, offset: Offset, size: u64) -> Result<&'data [u8]> {
        if size == 0 {
            return Ok(&[]);
        }

        let size = usize::try_from(size)?;
        let (lo, available) = self.file_offset_of(offset)?;

        let read_size = usize::min(available, size);
        let hi = lo.saturating_add(read_size);

        self.pe_data
            .get(lo..hi)
            .ok_or_else(|| anyhow!("section file range exceeds image data: {:x}", offset))
    }

    fn base_address(&self) -> Address {
        self.base
    }

    fn sections(&self) -> &[Section] {
        &self.sections
    }

    fn build_id(&self) -> &BuildId {
        &self.build_id
    }

    fn entrypoint(&self) -> Option<Offset> {
        if self.pe.entry == 0 {
            return None;
        }

        Some(Offset(self.pe.entry as u64))
    }

    fn symbol_entries(&self) -> Result<BTreeSet<Offset>> {
        let mut entries = BTreeSet::new();

        // Exports may name data, so accept only code offsets.
        for export in &self.pe.exports {
            let offset = Offset(export.rva as u64);

            if self.is_executable_offset(offset) {
                entries.insert(offset);
            }
        }

        // The exception directory records the extent of every non-leaf
        // function, including unexported ones.
        if let Some(exception_data) = &self.pe.exception_data {
            for function in exception_data.functions() {
                let function = function?;
                let offset = Offset(u64::from(function.begin_address));

                if self.is_executable_offset(offset) {
                    entries.insert(offset);
                }
            }
        }

        Ok(entries)
    }

    fn executable_data(&self) -> &'data [u8] {
        self.pe_data
    }

    fn debuginfo_data(&self) -> &'data [u8] {
        if let Some(pdb) = &self.pdb {
            pdb.data
        } else {
            self.pe_data
        }
    }

    fn debuginfo(&self) -> Result<DebugInfo> {
        use symbolic::debuginfo::Object;
        use symbolic::demangle::{Demangle, DemangleOptions};

        let Some(pdb) = &self.pdb else {
            // Stripped module. Block recovery proceeds from the image alone.
            return Ok(DebugInfo::default());
        };

        let extra = self.extra_debug_info(pdb)?;
        let opts = DemangleOptions::complete();

        let object = Object::parse(pdb.data)?;
        let session = object.debug_session()?;

        let mut functions = BTreeMap::new();

        for function in session.functions() {
            let function = function?;

            let name = function.name.try_demangle(opts).into_owned();
            let offset = Offset(function.address); // Misnamed.
            let size = function.size;
            let noreturn = extra.noreturns.contains(&offset);

            let f = Function {
                name,
                noreturn,
                offset,
                size,
            };
            functions.insert(offset, f);
        }

        Ok(DebugInfo::new(functions, Some(extra.labels)))
    }
}

pub struct PeImage<'data> {
    pe: PE<'data>,
    pe_data: &'data [u8],
    pe_path: FilePath,

    pdb: Option<PdbInfo<'data>>,

    base: Address,
    sections: Vec<Section>,
    build_id: BuildId,
}

struct PdbInfo<'data> {
    pdb: RefCell<PDB<'data, Cursor<&'data [u8]>>>,
    data: &'data [u8],
    path: FilePath,
}

impl<'data> PeImage<'data> {
    pub fn new(
        pe_path: FilePath,
        pe_data: &'data [u8],
        pdb: Option<(FilePath, &'data [u8])>,
    ) -> Result<Self, LoadError> {
        let pe = PE::parse(pe_data).map_err(|e| LoadError::Malformed {
            path: pe_path.clone(),
            source: e.into(),
        })?;

        let machine = pe.header.coff_header.machine;
        if machine != COFF_MACHINE_X86_64 {
            return Err(LoadError::UnsupportedArch {
                path: pe_path,
                arch: machine_to_str(machine).to_owned(),
            });
        }

        let base = Address(pe.image_base as u64);
        let sections = pe_sections(&pe);
        let build_id = BuildId::from_image_data(pe_data);

        let pdb = pdb.and_then(|(path, data)| match PDB::open(Cursor::new(data)) {
            Ok(pdb) => Some(PdbInfo {
                pdb: RefCell::new(pdb),
                data,
                path,
            }),
            Err(err) => {
                warn!("ignoring unreadable debug info `{path}`: {err}");
                None
            }
        });

        Ok(Self {
            pe,
            pe_data,
            pe_path,
            pdb,
            base,
            sections,
            build_id,
        })
    }

    pub fn pe(&self) -> &PE<'data> {
        &self.pe
    }

    fn is_executable_offset(&self, offset: Offset) -> bool {
        self.sections
            .iter()
            .any(|s| s.executable && s.contains(&offset))
    }

    // Translate a virtual offset into a file offset and the count of bytes
    // backed by file data at and after it.
    fn file_offset_of(&self, offset: Offset) -> Result<(usize, usize)> {
        for section in &self.pe.sections {
            let virt_base = u64::from(section.virtual_address);
            let virt_size = u64::max(
                u64::from(section.virtual_size),
                u64::from(section.size_of_raw_data),
            );

            if Offset(virt_base).region(virt_size).contains(&offset.0) {
                let sec_off = offset.0 - virt_base;

                let available = u64::from(section.size_of_raw_data).saturating_sub(sec_off);
                let file_offset = u64::from(section.pointer_to_raw_data) + sec_off;

                return Ok((
                    usize::try_from(file_offset)?,
                    usize::try_from(available)?,
                ));
            }
        }

        bail!("no section data for virtual offset: {:x}", offset);
    }

    fn extra_debug_info(&self, info: &PdbInfo<'data>) -> Result<ExtraDebugInfo> {
        use pdb::{FallibleIterator, SymbolData};

        let mut extra = ExtraDebugInfo::default();

        let mut pdb = info.pdb.borrow_mut();

        let address_map = pdb.address_map()?;

        let di = pdb.debug_information()?;
        let mut modules = di.modules()?;

        while let Some(module) = modules.next()? {
            if let Some(mi) = pdb.module_info(&module)? {
                let mut symbols = mi.symbols()?;

                while let Some(symbol) = symbols.next()? {
                    match symbol.parse() {
                        Ok(SymbolData::Procedure(proc)) => {
                            if proc.flags.never {
                                let offset = to_virtual_offset(&address_map, proc.offset)?;
                                extra.noreturns.insert(offset);
                            }
                        }
                        Ok(SymbolData::Label(label)) => {
                            let offset = to_virtual_offset(&address_map, label.offset)?;
                            extra.labels.insert(offset);
                        }
                        _ => {}
                    }
                }
            }
        }

        Ok(extra)
    }
}

#[derive(Default)]
struct ExtraDebugInfo {
    /// Jump targets, typically from `switch` cases.
    pub labels: BTreeSet<Offset>,

    /// Entry offsets of functions that do not return.
    pub noreturns: BTreeSet<Offset>,
}

fn to_virtual_offset(
    address_map: &AddressMap<'_>,
    internal: PdbInternalSectionOffset,
) -> Result<Offset> {
    let rva = internal
        .to_rva(address_map)
        .ok_or_else(|| anyhow!("no virtual offset for internal section offset"))?;

    Ok(Offset(u64::from(rva.0)))
}

fn pe_sections(pe: &PE) -> Vec<Section> {
    let mut sections = Vec::new();

    for section in &pe.sections {
        let name = section.name().unwrap_or_default().to_owned();
        let executable = section.characteristics & IMAGE_SCN_MEM_EXECUTE != 0;

        sections.push(Section {
            name,
            file_offset: u64::from(section.pointer_to_raw_data),
            virt_offset: Offset(u64::from(section.virtual_address)),
            size: u64::max(
                u64::from(section.virtual_size),
                u64::from(section.size_of_raw_data),
            ),
            executable,
        });
    }

    sections
}
