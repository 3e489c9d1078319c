// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Memory transport configuration and impl.
pub mod channel_impl;
/// Process-wide endpoint directory and its byte pipes.
pub mod endpoint;
