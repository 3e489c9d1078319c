// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Start-byte/end-sequence framing.
pub mod delimited;
/// The decoder/encoder traits framers implement.
pub mod framing;
/// Pull-to-push read loop with dynamic timeouts.
pub mod handler;
/// Fixed-delimiter line framing.
pub mod line;
pub mod reader;
pub mod writer;

/// Line-framed string reader (the workhorse of the tests and demos).
pub type StringLineReader = reader::MessageReader<line::StringLineDecoder>;
/// Line-framed string writer.
pub type StringLineWriter = writer::MessageWriter<line::StringLineEncoder>;
/// Delimited string reader.
pub type StringDelimitedReader =
    reader::MessageReader<delimited::StringDelimitedDecoder>;
/// Delimited string writer.
pub type StringDelimitedWriter =
    writer::MessageWriter<delimited::StringDelimitedEncoder>;
