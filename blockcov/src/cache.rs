// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::Cursor;

use anyhow::Result;
use binimage::block::{self, Blocks};
use binimage::build_id::BuildId;
use binimage::{Image, Offset};
use elsa::sync::FrozenMap;
use symbolic::debuginfo::Object;
use symbolic::symcache::{SymCache, SymCacheConverter};

/// Per-build-id results of static module analysis.
///
/// Both maps populate at most once per build id and are never invalidated;
/// a build id pins the image bytes that produced the value. Losing a
/// concurrent population race wastes the duplicate work and nothing else.
#[derive(Default)]
pub struct AnalysisCache {
    blocks: FrozenMap<BuildId, Box<Blocks>>,
    symcaches: FrozenMap<BuildId, Vec<u8>>,
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recovered basic blocks of `image`, swept on first use.
    pub fn blocks(&self, image: &dyn Image) -> Result<&Blocks> {
        let id = image.build_id();

        if let Some(blocks) = self.blocks.get(id) {
            return Ok(blocks);
        }

        let debuginfo = image.debuginfo()?;
        let blocks = block::sweep_image(image, &debuginfo)?;

        Ok(self.blocks.insert(id.clone(), Box::new(blocks)))
    }

    /// Source location lookup for `image`, converted on first use.
    pub fn symbols(&self, image: &dyn Image) -> Result<SymbolView<'_>> {
        let id = image.build_id();

        let data = match self.symcaches.get(id) {
            Some(data) => data,
            None => {
                let data = convert_symcache(image)?;
                self.symcaches.insert(id.clone(), data)
            }
        };

        let symcache = SymCache::parse(data)?;

        Ok(SymbolView { symcache })
    }
}

fn convert_symcache(image: &dyn Image) -> Result<Vec<u8>> {
    let mut symcache = vec![];
    let mut converter = SymCacheConverter::new();

    let exe = Object::parse(image.executable_data())?;
    converter.process_object(&exe)?;

    let di = Object::parse(image.debuginfo_data())?;
    converter.process_object(&di)?;

    converter.serialize(&mut Cursor::new(&mut symcache))?;

    Ok(symcache)
}

/// Offset-to-source lookup over one module's cached symcache.
pub struct SymbolView<'cache> {
    symcache: SymCache<'cache>,
}

impl<'cache> SymbolView<'cache> {
    /// Resolve an image-relative offset to its source location.
    ///
    /// `None` when the offset has no symcache entry, or only a synthesized
    /// one with no real source line.
    pub fn resolve(&self, offset: Offset) -> Option<Symbol> {
        let location = self.symcache.lookup(offset.0).next()?;

        let file = location.file()?.full_path();
        let line = location.line();

        if line == 0 {
            return None;
        }

        let function = symbolic::demangle::demangle(location.function().name()).into_owned();

        Some(Symbol {
            function,
            file,
            line,
        })
    }
}

/// A resolved source location.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Symbol {
    /// Demangled name of the enclosing function. Empty when unknown.
    pub function: String,

    /// Full path of the source file.
    pub file: String,

    /// 1-indexed source line.
    pub line: u32,
}
