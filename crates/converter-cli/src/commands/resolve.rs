//! Validate and resolve commands.

use anyhow::{Context, Result};
use converter_core::Config;

/// Resolve every predefined job and report the outcome per job.
pub fn validate(config: &Config) -> Result<()> {
    config.validate()?;

    let resolver = config.resolver();
    let mut jobs: Vec<_> = config.jobs.iter().filter(|j| !j.is_prototype()).collect();
    jobs.sort_by(|a, b| a.name.cmp(&b.name));
    for job in jobs {
        let effective = resolver.resolve(job)?;
        println!(
            "  {} -> {}/{} ({})",
            effective.name,
            effective.rawdata_source.name,
            effective.rawdata_source.topic,
            effective.target_storage
        );
    }

    println!("Configuration is valid");
    Ok(())
}

/// Print the effective configuration of one job as JSON.
pub fn resolve(config: &Config, job: &str) -> Result<()> {
    let effective = config
        .resolver()
        .resolve_named(job)
        .with_context(|| format!("Failed to resolve job config '{}'", job))?;
    println!("{}", serde_json::to_string_pretty(&effective)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        [[rawdata_sources]]
        name = "memory"

        [[jobs]]
        name = "base"
        prototype = true
        [jobs.rawdata_source]
        name = "memory"
        [jobs.target_storage]
        root = "memory://"

        [[jobs]]
        name = "freg"
        parent = "base"
        [jobs.rawdata_source]
        topic = "freg"
        [jobs.target_storage]
        path = "/kilde/freg"
        version = "1"
    "#;

    #[test]
    fn test_validate_and_resolve() {
        let config = Config::from_toml(CONFIG).unwrap();
        validate(&config).unwrap();
        resolve(&config, "freg").unwrap();
        assert!(resolve(&config, "missing").is_err());
    }
}
