//! Expand template databases.
//!
//! Usage:
//!   dbmsi [OPTIONS] [INPUT]
//!   dbmsi -I db -M "P=IOC:,M=m1" --dbd app.dbd -o out.db -MD motor.template
//!
//! Exit code 0 on success, 1 on usage errors, 2 when parsing or validation fails.

use dbmsi::cli::Cli;
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};

fn main() {
    let cli = match Cli::load() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(1);
        }
        Err(e) => e.exit(),
    };

    let level = if cli.verbose { LevelFilter::Debug } else { LevelFilter::Warn };
    let config = ConfigBuilder::new()
        .set_time_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .build();
    if let Err(e) = TermLogger::init(level, config, TerminalMode::Stderr, ColorChoice::Auto) {
        eprintln!("dbmsi: could not initialise logging: {}", e);
    }

    if let Err(e) = cli.run() {
        log::debug!("failed: {:?}", e);
        eprintln!("dbmsi: {:#}", e);
        std::process::exit(e.exit_code());
    }
}
