// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeSet;

use anyhow::Result;

use crate::build_id::BuildId;
use crate::debuginfo::DebugInfo;
use crate::path::FilePath;
use crate::{Address, Image, Offset, Section};

/// Virtual offset of the fake image's one executable section.
pub const TEXT: Offset = Offset(0x1000);

/// In-memory image with a single `.text` section, for exercising static
/// analysis without a real module file.
pub struct FakeImage<'data> {
    path: FilePath,
    data: &'data [u8],
    sections: Vec<Section>,
    build_id: BuildId,
    symbols: BTreeSet<Offset>,
    entrypoint: Option<Offset>,
}

impl<'data> FakeImage<'data> {
    pub fn new(data: &'data [u8]) -> Self {
        let path = FilePath::new("/fake/module.bin").unwrap();

        let sections = vec![Section {
            name: ".text".into(),
            file_offset: 0,
            virt_offset: TEXT,
            size: data.len() as u64,
            executable: true,
        }];

        let build_id = BuildId::content_hash(data);

        Self {
            path,
            data,
            sections,
            build_id,
            symbols: BTreeSet::new(),
            entrypoint: Some(TEXT),
        }
    }

    pub fn with_symbols(data: &'data [u8], symbols: &[u64]) -> Self {
        let mut image = Self::new(data);
        image.symbols = symbols.iter().copied().map(Offset).collect();
        image
    }

    pub fn set_entrypoint(&mut self, entrypoint: Option<Offset>) {
        self.entrypoint = entrypoint;
    }
}

impl<'data> Image<'data> for FakeImage<'data> {
    fn executable_path(&self) -> &FilePath {
        &self.path
    }

    fn debuginfo_path(&self) -> &FilePath {
        &self.path
    }

    fn read(&self, offset: Offset, size: u64) -> Result<&'data [u8]> {
        let lo = (offset.0 - TEXT.0) as usize;
        let hi = usize::min(lo + size as usize, self.data.len());
        Ok(&self.data[lo..hi])
    }

    fn base_address(&self) -> Address {
        Address(0x7000_0000)
    }

    fn sections(&self) -> &[Section] {
        &self.sections
    }

    fn build_id(&self) -> &BuildId {
        &self.build_id
    }

    fn entrypoint(&self) -> Option<Offset> {
        self.entrypoint
    }

    fn symbol_entries(&self) -> Result<BTreeSet<Offset>> {
        Ok(self.symbols.clone())
    }

    fn executable_data(&self) -> &'data [u8] {
        self.data
    }

    fn debuginfo_data(&self) -> &'data [u8] {
        self.data
    }

    fn debuginfo(&self) -> Result<DebugInfo> {
        Ok(DebugInfo::default())
    }
}
