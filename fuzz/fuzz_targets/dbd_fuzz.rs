//! DBD schema fuzz target: arbitrary text through the schema parser and menu resolution.
//! Build with: cargo fuzz run dbd_fuzz (requires nightly and cargo fuzz).

#![cfg_attr(fuzzing, no_main)]

#[cfg(fuzzing)]
use libfuzzer_sys::fuzz_target;

#[cfg(fuzzing)]
fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = dbmsi::Schema::parse_str(s, "fuzz.dbd");
    }
});

#[cfg(not(fuzzing))]
fn main() {
    eprintln!("Build with: cargo fuzz run dbd_fuzz");
}
