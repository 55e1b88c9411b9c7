//! Template parser fuzz target: arbitrary text through the parser and macro expander
//! with missing macros allowed, so expansion runs on every reference the grammar accepts.
//! Must not panic or overflow the stack.
//! Build with: cargo fuzz run parser_fuzz (requires nightly and cargo fuzz).

#![cfg_attr(fuzzing, no_main)]

#[cfg(fuzzing)]
use libfuzzer_sys::fuzz_target;

#[cfg(fuzzing)]
fuzz_target!(|data: &[u8]| {
    let s = match std::str::from_utf8(data) {
        Ok(x) => x,
        Err(_) => return,
    };
    let _ = dbmsi::parse(s);
    let options = dbmsi::ParseOptions {
        allow_missing: true,
        ..dbmsi::ParseOptions::default()
    };
    let _ = dbmsi::parse_with_macros(s, dbmsi::MacroScope::new(), options);
});

#[cfg(not(fuzzing))]
fn main() {
    eprintln!("Build with: cargo fuzz run parser_fuzz");
}
