// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};

use crate::debuginfo::DebugInfo;
use crate::entries::entry_points;
use crate::{Image, Offset};

/// Recover basic blocks for every executable section of `image`.
///
/// Statically recoverable entry points seed the sweep. Needs no runtime
/// information.
pub fn sweep_image(image: &dyn Image, debuginfo: &DebugInfo) -> Result<Blocks> {
    let entries = entry_points(image, debuginfo)?;

    let mut blocks = Blocks::default();

    for section in image.sections() {
        if !section.executable {
            continue;
        }

        let section_entries: Vec<Offset> = entries
            .iter()
            .copied()
            .filter(|entry| section.contains(entry))
            .collect();

        if section_entries.is_empty() {
            continue;
        }

        let section_blocks = sweep_region(
            image,
            debuginfo,
            section.virt_offset,
            section.size,
            &section_entries,
        )?;

        blocks.map.extend(&section_blocks.map);
    }

    Ok(blocks)
}

/// Recover basic blocks within the region `[offset, offset + size)`, seeded
/// by `entries`.
///
/// Two passes: the first discovers block leaders from the entry worklist,
/// the second delimits a block for each leader. Decoding is re-entrant, so
/// overlapping discovery from multiple directions converges on the same
/// boundaries, and each distinct entry offset defines its own block even
/// when its bytes overlap another block's.
pub fn sweep_region(
    image: &dyn Image,
    debuginfo: &DebugInfo,
    offset: Offset,
    size: u64,
    entries: &[Offset],
) -> Result<Blocks> {
    use iced_x86::Code;
    use iced_x86::Decoder;
    use iced_x86::FlowControl::*;

    let region = offset.region(size);

    let data = image.read(offset, size)?;
    let mut decoder = Decoder::new(64, data, 0);

    let mut visited = BTreeSet::new();

    let mut pending = Vec::new();

    // Schedule the statically known entrypoints.
    for entry in entries {
        pending.push(entry.0);
    }

    // Schedule any extra jump labels in the target region.
    for label in debuginfo.labels() {
        if !region.contains(&label.0) {
            continue;
        }

        pending.push(label.0);
    }

    while let Some(entry) = pending.pop() {
        if !region.contains(&entry) {
            continue;
        }

        if visited.contains(&entry) {
            continue;
        }

        visited.insert(entry);

        // Reset decoder for `entry`.
        let position = (entry - offset.0) as usize;

        if position > data.len() {
            // Entry lies in a virtual-only tail of the section.
            debug!("no file-backed data for entry {:x}", entry);
            continue;
        }

        decoder.set_position(position)?;
        decoder.set_ip(entry);

        // Decode instructions (starting from `entry`) until we reach a block
        // terminator or run out of valid data.
        while decoder.can_decode() {
            let inst = decoder.decode();

            match inst.flow_control() {
                IndirectBranch | IndirectCall => {
                    // Successors are unresolved, and we don't attempt dynamic
                    // target discovery.
                    break;
                }
                UnconditionalBranch => {
                    // Target is an entrypoint.
                    let target = inst.near_branch_target();
                    pending.push(target);

                    // We can't fall through to the next instruction, so don't add it to
                    // the worklist.
                    break;
                }
                ConditionalBranch => {
                    // Target is an entrypoint.
                    let target = inst.near_branch_target();
                    pending.push(target);

                    // We can fall through, so add to work list.
                    pending.push(inst.next_ip());

                    // Fall through not guaranteed, so this block is terminated.
                    break;
                }
                Return => {
                    break;
                }
                Call => {
                    let target = Offset(inst.near_branch_target());
                    pending.push(target.0);

                    // If the callee is `noreturn`, the next instruction is not
                    // reachable.
                    if !debuginfo.is_noreturn_target(target) {
                        pending.push(inst.next_ip());
                    }

                    break;
                }
                Exception => {
                    // Invalid instruction or UD.
                    break;
                }
                Interrupt => {
                    if inst.code() == Code::Int3 {
                        // Padding, treat as a terminator.
                        break;
                    }
                }
                Next => {
                    // Fall through.
                }
                XbeginXabortXend => {
                    // Not yet analyzed, so fall through.
                }
            }
        }
    }

    let mut blocks = Blocks::default();

    for &entry in &visited {
        // Reset decoder for `entry`.
        let position = (entry - offset.0) as usize;

        if position > data.len() {
            continue;
        }

        decoder.set_position(position)?;
        decoder.set_ip(entry);

        let mut terminator = Terminator::FallThrough;

        while decoder.can_decode() {
            let inst = decoder.decode();

            if inst.is_invalid() {
                // Assume that the decoder PC is in an undefined state. Reset it so we can
                // just query the decoder to get the exclusive upper bound on loop exit.
                decoder.set_ip(inst.ip());
                debug!("non-code bytes at {:x}", inst.ip());
                terminator = Terminator::Invalid;
                break;
            }

            match inst.flow_control() {
                IndirectBranch | IndirectCall => {
                    terminator = Terminator::Indirect;
                    break;
                }
                UnconditionalBranch => {
                    terminator = Terminator::Jump;
                    break;
                }
                ConditionalBranch => {
                    terminator = Terminator::ConditionalBranch;
                    break;
                }
                Return => {
                    terminator = Terminator::Return;
                    break;
                }
                Call => {
                    terminator = Terminator::Call;
                    break;
                }
                Exception => {
                    // Ensure that the decoder PC points to the first instruction outside
                    // of the block.
                    //
                    // By doing this, we always exclude UD instructions from blocks.
                    decoder.set_ip(inst.ip());
                    terminator = Terminator::Invalid;
                    break;
                }
                Interrupt => {
                    if inst.code() == Code::Int3 {
                        terminator = Terminator::Invalid;
                        break;
                    }
                }
                Next => {
                    // Fall through.
                }
                XbeginXabortXend => {
                    // Not yet analyzed, so fall through.
                }
            }

            // Based only on instruction semantics, we'd continue. But if the
            // next offset is a known block entrypoint, we're at a terminator.
            if visited.contains(&inst.next_ip()) {
                break;
            }
        }

        let end = decoder.ip();
        let size = end.saturating_sub(entry);

        if size > 0 {
            let offset = Offset(entry);
            let block = Block::new(offset, size, terminator);
            blocks.map.insert(offset, block);
        } else {
            warn!("dropping empty block {:x}..{:x}", entry, end);
        }
    }

    Ok(blocks)
}

/// Why a block ended where it did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Terminator {
    /// The next offset is another block's entry.
    FallThrough,

    /// Unconditional jump with a statically known target.
    Jump,

    /// Conditional branch; both the target and fall-through are successors.
    ConditionalBranch,

    /// Call site; the callee and (for returning callees) the fall-through
    /// are successors.
    Call,

    Return,

    /// Indirect jump or call; successors are unresolved.
    Indirect,

    /// Undecodable bytes or a trap instruction.
    Invalid,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Block {
    pub offset: Offset,
    pub size: u64,
    pub terminator: Terminator,
}

impl Block {
    pub fn new(offset: Offset, size: u64, terminator: Terminator) -> Self {
        Self {
            offset,
            size,
            terminator,
        }
    }

    pub fn contains(&self, offset: &Offset) -> bool {
        self.offset.region(self.size).contains(&offset.0)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Blocks {
    pub map: BTreeMap<Offset, Block>,
}

impl Blocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.map.values()
    }

    pub fn offsets(&self) -> impl Iterator<Item = Offset> + '_ {
        self.map.keys().copied()
    }

    pub fn find(&self, offset: &Offset) -> Option<&Block> {
        self.map.values().find(|b| b.contains(offset))
    }

    pub fn extend<'b>(&mut self, blocks: impl IntoIterator<Item = &'b Block>) {
        for &b in blocks.into_iter() {
            self.map.insert(b.offset, b);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<'b> IntoIterator for &'b Blocks {
    type Item = &'b Block;
    type IntoIter = std::collections::btree_map::Values<'b, Offset, Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.map.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use crate::debuginfo::Function;
    use crate::testing::{FakeImage, TEXT};

    fn sweep(data: &[u8], entries: &[u64]) -> Blocks {
        sweep_with_debuginfo(data, entries, DebugInfo::default())
    }

    fn sweep_with_debuginfo(data: &[u8], entries: &[u64], debuginfo: DebugInfo) -> Blocks {
        let image = FakeImage::new(data);
        let entries: Vec<Offset> = entries.iter().copied().map(Offset).collect();

        sweep_region(&image, &debuginfo, TEXT, data.len() as u64, &entries).unwrap()
    }

    fn block(blocks: &Blocks, offset: u64) -> Block {
        *blocks
            .map
            .get(&Offset(offset))
            .unwrap_or_else(|| panic!("no block at {offset:x}"))
    }

    #[test]
    fn test_sweep_if_else() {
        #[rustfmt::skip]
        let data = [
            0x31, 0xc0,             // 1000: xor eax, eax
            0x85, 0xff,             // 1002: test edi, edi
            0x74, 0x04,             // 1004: je 0x100a
            0xff, 0xc0,             // 1006: inc eax
            0xeb, 0x02,             // 1008: jmp 0x100c
            0xff, 0xc8,             // 100a: dec eax
            0xc3,                   // 100c: ret
        ];

        let blocks = sweep(&data, &[0x1000]);

        assert_eq!(blocks.len(), 4);
        assert_eq!(
            block(&blocks, 0x1000),
            Block::new(Offset(0x1000), 6, Terminator::ConditionalBranch)
        );
        assert_eq!(
            block(&blocks, 0x1006),
            Block::new(Offset(0x1006), 4, Terminator::Jump)
        );
        assert_eq!(
            block(&blocks, 0x100a),
            Block::new(Offset(0x100a), 2, Terminator::FallThrough)
        );
        assert_eq!(
            block(&blocks, 0x100c),
            Block::new(Offset(0x100c), 1, Terminator::Return)
        );
    }

    #[test]
    fn test_sweep_call_ends_block() {
        #[rustfmt::skip]
        let data = [
            0xe8, 0x04, 0x00, 0x00, 0x00,   // 1000: call 0x1009
            0x31, 0xc0,                     // 1005: xor eax, eax
            0xeb, 0x00,                     // 1007: jmp 0x1009
            0xc3,                           // 1009: ret
        ];

        let blocks = sweep(&data, &[0x1000]);

        assert_eq!(blocks.len(), 3);
        assert_eq!(
            block(&blocks, 0x1000),
            Block::new(Offset(0x1000), 5, Terminator::Call)
        );

        // The call's return site starts a block of its own.
        assert_eq!(
            block(&blocks, 0x1005),
            Block::new(Offset(0x1005), 4, Terminator::Jump)
        );

        // So does the callee.
        assert_eq!(
            block(&blocks, 0x1009),
            Block::new(Offset(0x1009), 1, Terminator::Return)
        );
    }

    #[test]
    fn test_sweep_noreturn_call_has_no_return_site() {
        #[rustfmt::skip]
        let data = [
            0xe8, 0x03, 0x00, 0x00, 0x00,   // 1000: call 0x1008
            0xcc, 0xcc, 0xcc,               // 1005: padding
            0xc3,                           // 1008: ret
        ];

        let mut functions = BTreeMap::new();
        functions.insert(
            Offset(0x1008),
            Function {
                name: "abort_now".into(),
                offset: Offset(0x1008),
                size: 1,
                noreturn: true,
            },
        );
        let debuginfo = DebugInfo::new(functions, None);

        let blocks = sweep_with_debuginfo(&data, &[0x1000], debuginfo);

        assert_eq!(blocks.len(), 2);
        assert_eq!(
            block(&blocks, 0x1000),
            Block::new(Offset(0x1000), 5, Terminator::Call)
        );
        assert_eq!(
            block(&blocks, 0x1008),
            Block::new(Offset(0x1008), 1, Terminator::Return)
        );

        // The padding after the noreturn call is not reachable.
        assert!(!blocks.map.contains_key(&Offset(0x1005)));
    }

    #[test]
    fn test_sweep_indirect_jump_has_no_successors() {
        #[rustfmt::skip]
        let data = [
            0xff, 0xe0,     // 1000: jmp rax
            0xc3,           // 1002: ret (unreachable)
        ];

        let blocks = sweep(&data, &[0x1000]);

        assert_eq!(blocks.len(), 1);
        assert_eq!(
            block(&blocks, 0x1000),
            Block::new(Offset(0x1000), 2, Terminator::Indirect)
        );
    }

    #[test]
    fn test_sweep_indirect_call_ends_block() {
        #[rustfmt::skip]
        let data = [
            0x31, 0xc0,     // 1000: xor eax, eax
            0xff, 0xd0,     // 1002: call rax
            0xc3,           // 1004: ret
        ];

        let blocks = sweep(&data, &[0x1000]);

        assert_eq!(blocks.len(), 1);
        assert_eq!(
            block(&blocks, 0x1000),
            Block::new(Offset(0x1000), 4, Terminator::Indirect)
        );
    }

    #[test]
    fn test_sweep_undecodable_bytes_delimit_block() {
        #[rustfmt::skip]
        let data = [
            0x31, 0xc0,     // 1000: xor eax, eax
            0x0f, 0x0b,     // 1002: ud2
        ];

        let blocks = sweep(&data, &[0x1000]);

        assert_eq!(blocks.len(), 1);

        // The trapping instruction is excluded.
        assert_eq!(
            block(&blocks, 0x1000),
            Block::new(Offset(0x1000), 2, Terminator::Invalid)
        );
    }

    #[test]
    fn test_sweep_overlapping_entries_get_own_blocks() {
        #[rustfmt::skip]
        let data = [
            0xb8, 0xff, 0xc0, 0xc3, 0x90,   // 1000: mov eax, 0x90c3c0ff
            0xc3,                           // 1005: ret
        ];

        let blocks = sweep(&data, &[0x1000, 0x1001]);

        // Decoding from 0x1001 yields `inc eax; ret` inside the bytes of the
        // mov's operand. Both renderings are kept.
        assert_eq!(blocks.len(), 2);
        assert_eq!(
            block(&blocks, 0x1000),
            Block::new(Offset(0x1000), 6, Terminator::Return)
        );
        assert_eq!(
            block(&blocks, 0x1001),
            Block::new(Offset(0x1001), 3, Terminator::Return)
        );
    }

    #[test]
    fn test_sweep_drops_empty_blocks() {
        let data = [0xc3]; // 1000: ret

        let blocks = sweep(&data, &[0x1000, 0x1001]);

        assert_eq!(blocks.len(), 1);
        assert!(!blocks.map.contains_key(&Offset(0x1001)));
    }

    #[test]
    fn test_sweep_loop_reconverges() {
        #[rustfmt::skip]
        let data = [
            0x31, 0xc9,             // 1000: xor ecx, ecx
            0xff, 0xc1,             // 1002: inc ecx
            0x83, 0xf9, 0x0a,       // 1004: cmp ecx, 10
            0x75, 0xf9,             // 1007: jne 0x1002
            0xc3,                   // 1009: ret
        ];

        let blocks = sweep(&data, &[0x1000]);

        assert_eq!(blocks.len(), 3);
        assert_eq!(
            block(&blocks, 0x1000),
            Block::new(Offset(0x1000), 2, Terminator::FallThrough)
        );
        assert_eq!(
            block(&blocks, 0x1002),
            Block::new(Offset(0x1002), 7, Terminator::ConditionalBranch)
        );
        assert_eq!(
            block(&blocks, 0x1009),
            Block::new(Offset(0x1009), 1, Terminator::Return)
        );
    }

    #[test]
    fn test_sweep_image_covers_executable_sections_only() {
        #[rustfmt::skip]
        let data = [
            0xc3,           // 1000: ret
        ];

        let image = FakeImage::new(&data);
        let blocks = sweep_image(&image, &DebugInfo::default()).unwrap();

        assert_eq!(blocks.len(), 1);
        assert_eq!(
            block(&blocks, 0x1000),
            Block::new(Offset(0x1000), 1, Terminator::Return)
        );
    }
}
