//! Config validation CLI tool
//!
//! Validates a rollcalld configuration file and reports any errors.

use rollcall_util::default_config_path;
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates a rollcalld configuration file.");
            eprintln!("If no path is provided, uses: {}", default_path.display());
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match rollcall_config::load_config(&config_path) {
        Ok(policy) => {
            let monitor = &policy.monitor;
            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", rollcall_config::CURRENT_CONFIG_VERSION);
            println!(
                "  Class hours: {}-{}",
                monitor.class_window.start, monitor.class_window.end
            );
            match monitor.lunch_window {
                Some(lunch) => println!("  Lunch: {}-{}", lunch.start, lunch.end),
                None => println!("  Lunch: none"),
            }
            println!("  Daily reset: {}", monitor.daily_reset_time);
            println!(
                "  Camera-off threshold: {}m, cooldown: {}m",
                monitor.camera_off_threshold.as_secs() / 60,
                monitor.alert_cooldown.as_secs() / 60
            );
            println!(
                "  Leave threshold: {}m, cooldown: {}m",
                monitor.leave_alert_threshold.as_secs() / 60,
                monitor.leave_alert_cooldown.as_secs() / 60
            );
            println!(
                "  Relay: {}",
                policy
                    .relay
                    .as_ref()
                    .map(|r| r.presence_channel.as_str())
                    .unwrap_or("not configured")
            );
            println!(
                "  Notifier: {}",
                if policy.notifier.is_some() { "configured" } else { "not configured" }
            );
            println!("  Holidays: {}", policy.calendar.holidays.len());
            println!("  Seed students: {}", policy.students.len());

            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                rollcall_config::ConfigError::ReadError(io_err) => {
                    eprintln!("Failed to read file: {}", io_err);
                }
                rollcall_config::ConfigError::ParseError(parse_err) => {
                    eprintln!("TOML parse error:");
                    eprintln!("  {}", parse_err);
                }
                rollcall_config::ConfigError::ValidationFailed { errors } => {
                    eprintln!("Validation errors ({}):", errors.len());
                    for err in errors {
                        eprintln!("  - {}", err);
                    }
                }
                rollcall_config::ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver,
                        rollcall_config::CURRENT_CONFIG_VERSION
                    );
                }
            }
            ExitCode::from(1)
        }
    }
}
