//! The validate-config command

use crate::config;
use crate::domain::Result;
use clap::Args;

/// Arguments for the validate-config command
#[derive(Args, Debug, Default)]
pub struct ValidateArgs {}

impl ValidateArgs {
    /// Load, validate and print the resolved configuration
    pub async fn execute(&self) -> Result<()> {
        let config = config::load_config()?;

        println!("Configuration is valid.");
        println!("  database:    {}", redact(&config.underpass_db_url));
        println!("  schema:      {}", config.db_schema);
        println!(
            "  planet:      {}",
            config
                .planet_server
                .clone()
                .unwrap_or_else(|| config.planet_servers[0].domain.clone())
        );
        println!("  frequency:   {}", config.frequency);
        println!("  concurrency: {}", config.concurrency);
        println!(
            "  stats:       {}",
            if config.stats_enabled { "on" } else { "off" }
        );
        println!(
            "  validation:  {}",
            if config.validation_enabled {
                config.validator.as_str()
            } else {
                "off"
            }
        );
        Ok(())
    }
}

fn redact(url: &str) -> String {
    match url.split_once('@') {
        Some((_, rest)) => format!("postgresql://***@{rest}"),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact() {
        assert_eq!(
            redact("postgresql://u:p@db.example.org/underpass"),
            "postgresql://***@db.example.org/underpass"
        );
        assert_eq!(redact("localhost/underpass"), "localhost/underpass");
    }
}
