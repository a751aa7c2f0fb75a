// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire framing and codecs for the tracker link: the binary keep-alive
//! frame, the CSV location record stream and the textual command grammar.

/// Textual `$name+TAG=args` command/reply grammar.
pub mod command;
/// 8-byte binary keep-alive frame.
pub mod keepalive;
/// 11-field CSV location records and event kinds.
pub mod location;
