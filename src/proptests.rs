// src/proptests.rs
//
// Randomized checks of the cursor arithmetic the whole transport leans on.

use std::collections::VecDeque;

use proptest::prelude::*;

use crate::cache::decode_program_payload;
use crate::cache::CompiledProgram;
use crate::command::{CommandHeader, CommandKind};
use crate::ring::{free_words, has_pending, Cursor, RingSpan, PTR_MASK};
use crate::types::DeviceAddr;

fn arb_span() -> impl Strategy<Value = RingSpan> {
    (1u32..64, 4u32..48).prop_map(|(start, words)| RingSpan::new(start, start + words))
}

fn arb_kind() -> impl Strategy<Value = CommandKind> {
    prop_oneof![
        Just(CommandKind::RunProgram),
        Just(CommandKind::WriteBuffer),
        Just(CommandKind::ReadBuffer),
        Just(CommandKind::Barrier),
        Just(CommandKind::Wrap),
    ]
}

proptest! {
    /// Packing a cursor into its register word and back is lossless for any
    /// position the mask can hold.
    #[test]
    fn packed_cursor_roundtrip(pos in 0u32..=PTR_MASK, parity: bool) {
        let cursor = Cursor::new(pos, parity);
        prop_assert_eq!(Cursor::from_packed(cursor.packed()), cursor);
    }

    /// After advancing a cursor by arbitrary steps, its position is the total
    /// distance modulo capacity and its parity records whether the wrap count
    /// is odd.
    #[test]
    fn advance_is_modular_with_parity_as_wrap_count(
        span in arb_span(),
        steps in prop::collection::vec(1u32..8, 0..64),
    ) {
        let mut cursor = Cursor::at_start(span);
        let mut wraps = 0u32;
        let mut total = 0u32;
        for step in steps {
            let step = step.min(span.words());
            if cursor.advance(step, span) {
                wraps += 1;
            }
            total += step;
        }
        prop_assert_eq!(cursor.pos(), span.start() + total % span.words());
        prop_assert_eq!(cursor.parity(), wraps % 2 == 1);
    }

    /// Free space plus outstanding records always equals ring capacity, for
    /// any interleaving of pushes and pops, and pending-ness tracks
    /// occupancy exactly. This is what makes the full ring (equal positions,
    /// opposite parity) distinguishable from the empty one.
    #[test]
    fn occupancy_is_conserved_across_any_interleaving(
        span in arb_span(),
        ops in prop::collection::vec((any::<bool>(), 1u32..6), 1..128),
    ) {
        let mut write = Cursor::at_start(span);
        let mut read = Cursor::at_start(span);
        let mut outstanding: VecDeque<u32> = VecDeque::new();
        let mut occupied = 0u32;

        for (is_push, words) in ops {
            if is_push {
                let words = words.min(span.words());
                if free_words(write, read, span) >= words {
                    write.advance(words, span);
                    outstanding.push_back(words);
                    occupied += words;
                }
            } else if let Some(words) = outstanding.pop_front() {
                read.advance(words, span);
                occupied -= words;
            }
            prop_assert_eq!(free_words(write, read, span), span.words() - occupied);
            prop_assert_eq!(has_pending(write, read), occupied > 0);
        }
    }

    /// Headers survive the wire for every representable field combination.
    #[test]
    fn command_header_roundtrip(
        kind in arb_kind(),
        seq: u64,
        payload_bytes in 0u32..1 << 20,
        completion_bytes in 0u32..1 << 16,
    ) {
        let header = CommandHeader::new(kind, seq, payload_bytes, completion_bytes);
        prop_assert_eq!(CommandHeader::decode(&header.encode()).unwrap(), header);
    }

    /// A bound program's payload decodes back to the exact instruction and
    /// argument words, for any sizes of either.
    #[test]
    fn program_payload_roundtrip(
        instructions in prop::collection::vec(any::<u32>(), 0..32),
        addrs in prop::collection::vec(any::<u32>(), 0..8),
    ) {
        let base = vec![0u32; addrs.len()];
        let program = CompiledProgram::new(instructions.clone(), base, |args, addresses| {
            for (i, addr) in addresses.iter().enumerate() {
                args.set(i, addr.get());
            }
        });
        let addresses: Vec<DeviceAddr> = addrs.iter().copied().map(DeviceAddr::new).collect();
        let bound = program.bind(&addresses);
        let (got_instr, got_args) = decode_program_payload(&bound.encode_payload()).unwrap();
        prop_assert_eq!(got_instr, instructions);
        prop_assert_eq!(got_args, addrs);
    }
}
