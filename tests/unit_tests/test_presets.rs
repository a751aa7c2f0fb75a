// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, fs, path::PathBuf};

use trackerd::presets::{PRESET_SUBDIR, Preset, PresetRegistry};

fn data_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("trackerd-{tag}-{}", std::process::id()));
    fs::create_dir_all(dir.join(PRESET_SUBDIR)).expect("mkdir");
    dir
}

const ROAMTRACK: &str = "Enable roaming tracking\n\
    Switches the device to GPRS roaming and starts continuous\n\
    tracking until told otherwise.\n\
    set roam 1\n\
    set track 1,60,0,0,0,3,0\n\
    do test [PIN]\n";

#[test]
fn registry_lists_and_fetches() {
    let dir = data_dir("presets-list");
    fs::write(dir.join(PRESET_SUBDIR).join("roamtrack.preset"), ROAMTRACK).expect("write");
    fs::write(
        dir.join(PRESET_SUBDIR).join("broken.preset"),
        "description only, no commands\n",
    )
    .expect("write");

    let registry = PresetRegistry::new(&dir);
    let loaded = registry.refresh().expect("refresh");
    assert_eq!(loaded, 1, "broken preset is skipped");

    let listing = registry.list();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].0, "roamtrack");
    assert_eq!(listing[0].1, "Enable roaming tracking");

    let preset = registry.get("roamtrack").expect("present");
    assert_eq!(preset.commands.len(), 3);

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn refresh_picks_up_new_files() {
    let dir = data_dir("presets-refresh");
    let registry = PresetRegistry::new(&dir);
    assert_eq!(registry.refresh().expect("refresh"), 0);

    fs::write(dir.join(PRESET_SUBDIR).join("roamtrack.preset"), ROAMTRACK).expect("write");
    assert_eq!(registry.refresh().expect("refresh"), 1);
    assert!(registry.get("roamtrack").is_some());

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn pin_placeholder_expansion() {
    let preset = Preset::parse("roamtrack", ROAMTRACK).expect("parse");
    let commands = preset.expand_commands(&HashMap::from([(
        "PIN".to_string(),
        "1234".to_string(),
    )]));
    assert_eq!(commands[0], "set roam 1");
    assert_eq!(commands[2], "do test 1234");

    // Unmatched placeholders survive verbatim.
    let untouched = preset.expand_commands(&HashMap::new());
    assert_eq!(untouched[2], "do test [PIN]");
}
