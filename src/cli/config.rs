use crate::config::{default_user_config_path, load_config};
use std::fs;
use std::path::PathBuf;

const SAMPLE_CONFIG: &str = include_str!("../../samples/config.yml");
const SYSTEM_CONFIG: &str = "/etc/replay-cache/config.yml";

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    if stdout {
        print!("{}", SAMPLE_CONFIG);
        return Ok(());
    }

    // Prefer ~/.config/replay-cache/config.yml, fall back to /etc
    let config_path = match default_user_config_path() {
        Some(user_config) => match user_config.parent().map(fs::create_dir_all) {
            Some(Err(_)) => {
                eprintln!("Warning: Could not create {}", user_config.display());
                eprintln!("Falling back to {}", SYSTEM_CONFIG);
                PathBuf::from(SYSTEM_CONFIG)
            }
            _ => user_config,
        },
        None => PathBuf::from(SYSTEM_CONFIG),
    };

    if config_path.exists() {
        return Err(format!(
            "config file already exists at {}; remove it first or use --stdout",
            config_path.display()
        )
        .into());
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&config_path, SAMPLE_CONFIG)?;

    println!("Config file written to {}", config_path.display());
    Ok(())
}

pub fn validate(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;

    println!("Validating config file: {}", path.display());
    match load_config(&path) {
        Ok(_) => {
            println!("✓ Config is valid");
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Config validation failed:\n{}", e);
            std::process::exit(1);
        }
    }
}
