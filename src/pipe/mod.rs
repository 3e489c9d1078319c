// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Error/completion reaction hooks for the stable pipes.
pub mod behavior;
/// Pending-frame buffer with partial-delivery bookkeeping.
pub mod buffer;
/// The byte source/sink traits transports implement.
pub mod byte_pipe;
/// Shared error taxonomy.
pub mod error;
/// Read/flush result types.
pub mod result;
pub mod stable_reader;
pub mod stable_writer;
/// Source/sink adapters over tokio streams.
pub mod stream;
