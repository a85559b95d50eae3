use std::path::Path;

use anyhow::Context;

use crate::config::GridConfig;

pub fn check(config_path: &Path) -> anyhow::Result<()> {
    let grid = GridConfig::from_file(config_path)?;
    grid.validate()
        .with_context(|| format!("invalid grid in {}", config_path.display()))?;

    let encoding = grid.encoding();
    let selector = grid.selector_config()?;
    println!(
        "✓ {}: {}-of-{} encoding, happy at {}",
        config_path.display(),
        encoding.needed,
        encoding.total,
        encoding.happy
    );
    println!(
        "  timeouts: query {:?}, negotiate {:?}",
        selector.query_timeout, selector.negotiate_timeout
    );
    for server in &grid.servers {
        let capacity = server
            .capacity
            .map_or_else(|| "unlimited".to_string(), |c| format!("{c} bytes"));
        let overcommit = if server.overcommit.unwrap_or(false) {
            ", overcommitting"
        } else {
            ""
        };
        println!("  {} ({:?}, {capacity}{overcommit})", server.id, server.state);
    }
    if grid.servers.len() < encoding.happy as usize {
        println!(
            "  note: {} server(s) can never satisfy happiness {}",
            grid.servers.len(),
            encoding.happy
        );
    }

    Ok(())
}
