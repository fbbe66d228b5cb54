// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use classq::batch::stages::substitute;
use classq::batch::ImportReport;
use classq::AppConfig;

#[derive(Arbitrary, Debug)]
struct Input<'a> {
    json: &'a str,
    template: &'a str,
    value: &'a str,
}

fuzz_target!(|input: Input| {
    // configuration and importer output both arrive as untrusted JSON
    if let Ok(config) = serde_json::from_str::<AppConfig>(input.json) {
        let _ = config.validate();
    }
    let _ = serde_json::from_str::<ImportReport>(input.json);

    let vars = [("frames", input.value.to_string()), ("max_frame", input.value.to_string())];
    let _ = substitute(input.template, &vars);
});
