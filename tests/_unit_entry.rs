// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

#![allow(clippy::all)]

mod unit_tests {
    use std::fs;

    use anyhow::Result;
    use hex::FromHex;

    // Helper to load a hex fixture and decode it to a byte vector.
    fn load_fixture(path: &str) -> Result<Vec<u8>> {
        let s = fs::read_to_string(path)?;
        let cleaned = s.trim().replace(|c: char| c.is_whitespace(), "");
        Ok(Vec::from_hex(&cleaned)?)
    }

    pub mod test_codec;
    pub mod test_geocache;
    pub mod test_presets;
    pub mod test_ratelimit;
    pub mod test_translate;
}
