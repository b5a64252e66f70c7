// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeSet;

use anyhow::Result;

use crate::debuginfo::DebugInfo;
use crate::{Image, Offset, Section};

/// Collect statically recoverable code entry points for `image`.
///
/// The union of: the designated image entrypoint, symbol table and
/// relocation entries, debug info functions and labels, and targets of
/// direct calls found by a linear scan of executable sections. Offsets
/// outside of executable sections are discarded.
pub fn entry_points(image: &dyn Image, debuginfo: &DebugInfo) -> Result<BTreeSet<Offset>> {
    let mut entries = BTreeSet::new();

    if let Some(entry) = image.entrypoint() {
        entries.insert(entry);
    }

    entries.extend(image.symbol_entries()?);

    for function in debuginfo.functions() {
        entries.insert(function.offset);
    }

    entries.extend(debuginfo.labels());

    for section in image.sections() {
        if !section.executable {
            continue;
        }

        scan_call_targets(image, section, &mut entries)?;
    }

    // The scan over-approximates, and symbols may name data.
    entries.retain(|entry| {
        image
            .sections()
            .iter()
            .any(|s| s.executable && s.contains(entry))
    });

    Ok(entries)
}

/// Linearly decode `section`, collecting the target of every direct call.
///
/// The scan does not follow control flow, so some decoded instructions are
/// really data or operand tails. That over-approximation is deliberate:
/// spurious targets decode to droppable blocks, while a missed target is a
/// silent coverage hole.
fn scan_call_targets(
    image: &dyn Image,
    section: &Section,
    entries: &mut BTreeSet<Offset>,
) -> Result<()> {
    use iced_x86::{Decoder, FlowControl};

    let data = image.read(section.virt_offset, section.size)?;

    let mut decoder = Decoder::new(64, data, 0);
    decoder.set_ip(section.virt_offset.0);

    while decoder.can_decode() {
        let inst = decoder.decode();

        if inst.flow_control() == FlowControl::Call {
            entries.insert(Offset(inst.near_branch_target()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::testing::{FakeImage, TEXT};

    #[test]
    fn test_entry_points_include_call_targets() {
        #[rustfmt::skip]
        let data = [
            0xe8, 0x04, 0x00, 0x00, 0x00,   // 1000: call 0x1009
            0x31, 0xc0,                     // 1005: xor eax, eax
            0xeb, 0x00,                     // 1007: jmp 0x1009
            0xc3,                           // 1009: ret
        ];

        let image = FakeImage::new(&data);
        let entries = entry_points(&image, &DebugInfo::default()).unwrap();

        assert!(entries.contains(&TEXT));
        assert!(entries.contains(&Offset(0x1009)));
    }

    #[test]
    fn test_entry_points_union_symbols_and_entrypoint() {
        #[rustfmt::skip]
        let data = [
            0xc3,   // 1000: ret
            0xc3,   // 1001: ret
            0xc3,   // 1002: ret
        ];

        let image = FakeImage::with_symbols(&data, &[0x1001, 0x1002]);
        let entries = entry_points(&image, &DebugInfo::default()).unwrap();

        let expected: BTreeSet<Offset> =
            [0x1000, 0x1001, 0x1002].into_iter().map(Offset).collect();

        assert_eq!(entries, expected);
    }

    #[test]
    fn test_entry_points_drop_non_code_offsets() {
        let data = [0xc3]; // 1000: ret

        // Symbol outside of any executable section, like a data export.
        let image = FakeImage::with_symbols(&data, &[0x5000]);
        let entries = entry_points(&image, &DebugInfo::default()).unwrap();

        let expected: BTreeSet<Offset> = [Offset(0x1000)].into_iter().collect();

        assert_eq!(entries, expected);
    }

    #[test]
    fn test_entry_points_without_entrypoint() {
        let data = [0xc3];

        let mut image = FakeImage::with_symbols(&data, &[0x1000]);
        image.set_entrypoint(None);

        let entries = entry_points(&image, &DebugInfo::default()).unwrap();

        assert_eq!(entries.len(), 1);
        assert!(entries.contains(&Offset(0x1000)));
    }
}
