// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use comm_channel_rs::utils::dump_bytes;

#[test]
fn mixed_frame_dump() {
    let frame = b"#Message 1;\r\n";
    assert_eq!(dump_bytes(frame), "#Message 1;<0D><0A>");
}

#[test]
fn every_byte_is_accounted_for() {
    // Each input byte produces exactly one token: itself or `<HH>`.
    let data: Vec<u8> = (0u8..=255).collect();
    let dump = dump_bytes(&data);
    let printable = (32..=126).count();
    let escaped = 256 - printable;
    assert_eq!(dump.len(), printable + escaped * 4);
}

#[test]
fn hex_digits_are_uppercase() {
    assert_eq!(dump_bytes(&[0xAB, 0x0E]), "<AB><0E>");
}
