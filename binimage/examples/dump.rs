// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Result;
use clap::Parser;

use binimage::block::sweep_image;
use binimage::load::LoadImage;
use binimage::loader::Loader;
use binimage::path::FilePath;
use binimage::Image;

#[derive(Parser, Debug)]
struct Args {
    /// Path to an ELF or PE module.
    module: String,

    /// Print recovered basic blocks.
    #[arg(long)]
    blocks: bool,

    /// Print functions from debug info.
    #[arg(long)]
    functions: bool,
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    let path = FilePath::new(&args.module)?;
    let loader = Loader::new();
    let image: Box<dyn Image> = LoadImage::load(&loader, path)?;

    println!("module = {}", image.executable_path());
    println!("build id = {}", image.build_id());
    println!("base = {:x}", image.base_address());

    for section in image.sections() {
        let exec = if section.executable { "x" } else { "-" };
        println!(
            "section {:16} {:>8x}..{:<8x} {}",
            section.name,
            section.virt_offset.0,
            section.virt_offset.0 + section.size,
            exec,
        );
    }

    let debuginfo = image.debuginfo()?;

    if args.functions {
        for function in debuginfo.functions() {
            println!(
                "function {:x} size = {:x} {}",
                function.offset, function.size, function.name
            );
        }
    }

    if args.blocks {
        let blocks = sweep_image(&*image, &debuginfo)?;

        println!("{} blocks", blocks.len());

        for block in &blocks {
            println!(
                "block {:x}..{:x} {:?}",
                block.offset.0,
                block.offset.0 + block.size,
                block.terminator,
            );
        }
    }

    Ok(())
}
