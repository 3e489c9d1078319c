// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// TCP transport configuration and impl.
pub mod channel_impl;
