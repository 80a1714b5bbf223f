use anyhow::bail;
use relaycell_core::config::AgentProfile;
use relaycell_core::Config;

use super::Env;

/// Show the effective configuration as pretty-printed JSON.
pub fn show(env: &Env) -> anyhow::Result<()> {
    let json = serde_json::to_value(&env.config)?;
    let exists = if env.config_file.exists() {
        ""
    } else {
        " (not written yet, showing defaults)"
    };

    println!();
    println!("📋 Current Configuration");
    println!("  File: {}{}", env.config_file.display(), exists);
    println!("  Database: {}", env.config.db_path(&env.paths).display());
    println!();
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

/// A starting config with a two-agent roster.
fn starter_config() -> Config {
    let mut config = Config::default();
    let mut planner = AgentProfile::new("planner");
    planner.description = "Breaks requests down and delegates the parts".to_string();
    let mut researcher = AgentProfile::new("researcher");
    researcher.description = "Looks things up and reports findings".to_string();
    config.agents.roster = vec![planner, researcher];
    config
}

pub fn init(env: &Env, force: bool) -> anyhow::Result<()> {
    if env.config_file.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite",
            env.config_file.display()
        );
    }
    env.paths.ensure_dirs()?;
    starter_config().save(&env.config_file)?;
    println!("✅ Wrote {}", env.config_file.display());
    println!("   Add an API key under \"providers\" before running `relaycell ask`.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starter_config_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        starter_config().save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        loaded.validate().unwrap();
        assert_eq!(loaded.agents.roster.len(), 2);
        assert!(loaded.profile("planner").is_some());
        assert_eq!(loaded.agents.defaults.max_tool_depth, 10);
    }
}
