// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[macro_use]
extern crate log;

use std::fmt;
use std::io::Cursor;
use std::ops::Range;

use anyhow::{anyhow as error, Result};

pub mod block;
pub mod build_id;
pub mod debuginfo;
pub mod elf;
pub mod entries;
pub mod load;
pub mod loader;
pub mod path;
pub mod pe;

#[cfg(test)]
pub(crate) mod testing;

use crate::build_id::BuildId;
use crate::debuginfo::DebugInfo;
use crate::path::FilePath;

/// A parsed on-disk module image.
///
/// Implementations exist for ELF and PE files, and both parse on any host
/// OS. Static analysis never requires the module to be loaded into a live
/// process.
pub trait Image<'data> {
    /// Path to the executable module file.
    fn executable_path(&self) -> &FilePath;

    /// Path to the file containing debug info for the executable.
    ///
    /// May be the same as the executable path, including when no separate
    /// debug info could be located.
    fn debuginfo_path(&self) -> &FilePath;

    /// Read up to `size` bytes of data at the image-relative virtual offset
    /// `offset`.
    fn read(&self, offset: Offset, size: u64) -> Result<&'data [u8]>;

    /// Nominal base load address of the module image.
    fn base_address(&self) -> Address;

    /// Section layout, with image-relative virtual offsets.
    fn sections(&self) -> &[Section];

    /// Stable identifier correlating this image with its debug info.
    fn build_id(&self) -> &BuildId;

    /// Image-relative offset of the designated entry point, if any.
    fn entrypoint(&self) -> Option<Offset>;

    /// Statically-known code entry offsets: exported and local function
    /// symbols, and relocation targets that land in executable sections.
    ///
    /// Does not consult debug info.
    fn symbol_entries(&self) -> Result<std::collections::BTreeSet<Offset>>;

    /// Raw bytes of the executable file.
    fn executable_data(&self) -> &'data [u8];

    /// Raw bytes of the file that contains debug info.
    ///
    /// May be the same as the executable data.
    fn debuginfo_data(&self) -> &'data [u8];

    /// Debugging information derived from the module and its debug info.
    fn debuginfo(&self) -> Result<DebugInfo>;
}

/// Runtime virtual address in a traced process.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Address(pub u64);

impl Address {
    pub fn offset_by(&self, offset: Offset) -> Result<Address> {
        let addr = self
            .0
            .checked_add(offset.0)
            .ok_or_else(|| error!("overflow: {:x} + {:x}", self.0, offset.0))?;

        Ok(Address(addr))
    }

    pub fn offset_from(&self, addr: Address) -> Result<Offset> {
        let offset = self
            .0
            .checked_sub(addr.0)
            .ok_or_else(|| error!("underflow: {:x} - {:x}", self.0, addr.0))?;

        Ok(Offset(offset))
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Image-relative virtual offset.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Offset(pub u64);

impl Offset {
    pub fn region(&self, size: u64) -> Range<u64> {
        let lo = self.0;
        let hi = lo.saturating_add(size);
        lo..hi
    }
}

impl fmt::LowerHex for Offset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// An entry in an image's section table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Section {
    pub name: String,
    pub file_offset: u64,
    pub virt_offset: Offset,
    pub size: u64,
    pub executable: bool,
}

impl Section {
    pub fn contains(&self, offset: &Offset) -> bool {
        self.virt_offset.region(self.size).contains(&offset.0)
    }
}

/// Errors resolving a module reference to an analyzable on-disk image.
///
/// All of these degrade coverage for the one affected module; none aborts a
/// recording run.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("unable to read module image `{path}`")]
    Io {
        path: FilePath,
        #[source]
        source: std::io::Error,
    },

    #[error("unrecognized module file format: `{0}`")]
    UnknownFormat(FilePath),

    #[error("unsupported machine architecture ({arch}) for module `{path}`")]
    UnsupportedArch { path: FilePath, arch: String },

    #[error("malformed module image `{path}`")]
    Malformed {
        path: FilePath,
        #[source]
        source: anyhow::Error,
    },
}

/// File format of an image, sniffed from its leading bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImageFormat {
    Elf,
    Pe,
}

pub fn sniff_format(data: &[u8]) -> Result<Option<ImageFormat>> {
    let mut cursor = Cursor::new(data);
    let hint = goblin::peek(&mut cursor)?;

    let format = match hint {
        goblin::Hint::Elf(..) => Some(ImageFormat::Elf),
        goblin::Hint::PE => Some(ImageFormat::Pe),
        _ => None,
    };

    Ok(format)
}
