// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::elf::ElfImage;
use crate::loader::Loader;
use crate::path::FilePath;
use crate::pe::PeImage;
use crate::{sniff_format, Image, ImageFormat, LoadError};

pub trait LoadImage<'data>
where
    Self: Sized,
{
    fn load(loader: &'data Loader, exe_path: FilePath) -> Result<Self, LoadError>;
}

impl<'data> LoadImage<'data> for ElfImage<'data> {
    fn load(loader: &'data Loader, elf_path: FilePath) -> Result<Self, LoadError> {
        let data = loader.load(&elf_path)?;
        ElfImage::new(elf_path, data)
    }
}

impl<'data> LoadImage<'data> for PeImage<'data> {
    fn load(loader: &'data Loader, pe_path: FilePath) -> Result<Self, LoadError> {
        let pe_data = loader.load(&pe_path)?;

        let pdb = if let Some(pdb_path) = find_pdb(&pe_path) {
            let pdb_data = loader.load(&pdb_path)?;
            Some((pdb_path, pdb_data))
        } else {
            debug!("no debug info found for `{pe_path}`");
            None
        };

        PeImage::new(pe_path, pe_data, pdb)
    }
}

impl<'data> LoadImage<'data> for Box<dyn Image<'data> + 'data> {
    fn load(loader: &'data Loader, exe_path: FilePath) -> Result<Self, LoadError> {
        let exe_data = loader.load(&exe_path)?;

        let format = sniff_format(exe_data).map_err(|source| LoadError::Malformed {
            path: exe_path.clone(),
            source,
        })?;

        let image: Box<dyn Image<'data>> = match format {
            Some(ImageFormat::Elf) => {
                let image = ElfImage::load(loader, exe_path)?;
                Box::new(image)
            }
            Some(ImageFormat::Pe) => {
                let image = PeImage::load(loader, exe_path)?;
                Box::new(image)
            }
            None => {
                return Err(LoadError::UnknownFormat(exe_path));
            }
        };

        Ok(image)
    }
}

fn find_pdb(pe_path: &FilePath) -> Option<FilePath> {
    // Check if the PDB is in the same dir as the PE.
    let same_dir_path = pe_path.with_extension("pdb");

    if same_dir_path.exists() {
        return Some(same_dir_path);
    }

    None
}
