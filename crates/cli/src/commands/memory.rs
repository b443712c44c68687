//! `taskpilot memory` — Inspect or clear persisted session memory.

use taskpilot_memory::{MemoryEntry, Order};

use super::load_config;

fn describe(entry: &MemoryEntry) -> String {
    let patterns = entry
        .patterns
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(" → ");
    format!(
        "{} [{}] {}\n    task:    {}\n    pattern: {}\n    outcome: {}",
        entry.finished_at.format("%Y-%m-%d %H:%M:%S"),
        entry.status,
        entry.run_id,
        entry.task,
        if patterns.is_empty() { "-" } else { patterns.as_str() },
        entry.outcome,
    )
}

pub async fn show(limit: usize) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let memory = taskpilot_gateway::session_memory(&config);
    let entries = memory.recent(limit, Order::OldestFirst).await;

    if let Some(path) = &config.memory.path {
        println!("Session memory ({})", path.display());
    }
    if entries.is_empty() {
        println!("   No remembered runs.");
        return Ok(());
    }
    for entry in &entries {
        println!("  {}", describe(entry));
    }
    println!();
    println!("   {} of {} entries (capacity {})", entries.len(), memory.len().await, memory.capacity());

    Ok(())
}

pub async fn clear() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let memory = taskpilot_gateway::session_memory(&config);
    let forgotten = memory.len().await;
    memory.clear().await?;
    println!("Cleared {forgotten} remembered run(s).");
    Ok(())
}
