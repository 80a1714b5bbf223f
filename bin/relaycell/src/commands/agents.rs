use anyhow::{anyhow, bail};
use relaycell_storage::{Agent, Store};

use super::Env;

fn require_agent(store: &Store, name: &str) -> anyhow::Result<Agent> {
    store
        .get_agent(name)?
        .ok_or_else(|| anyhow!("unknown agent '{}'", name))
}

/// Stored agents, plus roster entries that have not run yet.
pub fn list(env: &Env) -> anyhow::Result<()> {
    let store = env.open_store()?;
    let stored = store.list_agents()?;

    println!();
    println!("🤖 Agents ({} stored)", stored.len());
    println!();
    for agent in &stored {
        let roster = if env.config.profile(&agent.name).is_some() {
            " [roster]"
        } else {
            ""
        };
        println!(
            "  #{:<4} {:<20} {:<8}{}",
            agent.id,
            agent.name,
            agent.kind.as_str(),
            roster
        );
    }

    let idle: Vec<&str> = env
        .config
        .agents
        .roster
        .iter()
        .filter(|p| !stored.iter().any(|a| a.name == p.name))
        .map(|p| p.name.as_str())
        .collect();
    if !idle.is_empty() {
        println!();
        println!("  Not yet started: {}", idle.join(", "));
    }
    println!();
    Ok(())
}

pub fn history(env: &Env, a: &str, b: &str, limit: usize) -> anyhow::Result<()> {
    let store = env.open_store()?;
    let first = require_agent(&store, a)?;
    let second = require_agent(&store, b)?;
    let messages = store.history_for(first.id, second.id, limit)?;

    if messages.is_empty() {
        println!("No messages between {} and {}.", a, b);
        return Ok(());
    }

    println!();
    for msg in &messages {
        let speaker = if msg.from_agent_id == first.id { a } else { b };
        let masked = if msg.masked { " (masked)" } else { "" };
        println!("[{}] {} via {}{}:", msg.created_at, speaker, msg.channel, masked);
        println!("  {}", msg.content.replace('\n', "\n  "));
    }
    println!();
    Ok(())
}

pub fn clear_history(env: &Env, a: &str, b: &str) -> anyhow::Result<()> {
    let store = env.open_store()?;
    let first = require_agent(&store, a)?;
    let second = require_agent(&store, b)?;
    let removed = store.clear_history(first.id, second.id)?;
    println!("✅ Removed {} message(s) between {} and {}.", removed, a, b);
    Ok(())
}

pub fn rename(env: &Env, old: &str, new: &str) -> anyhow::Result<()> {
    if new.trim().is_empty() {
        bail!("new agent name must not be empty");
    }
    let store = env.open_store()?;
    store.rename_agent(old, new)?;
    println!("✅ Renamed {} to {}.", old, new);
    if env.config.profile(old).is_some() {
        println!(
            "   Note: '{}' is still listed in {}; update the roster too.",
            old,
            env.config_file.display()
        );
    }
    Ok(())
}
