use std::path::Path;

use anyhow::Context;
use tracing::info;

use sharegrid_placement::{ServerSelector, UploadParams};

use crate::config::GridConfig;
use crate::encode;

pub async fn put(file: &Path, config_path: &Path, format: &str) -> anyhow::Result<()> {
    let grid = GridConfig::from_file(config_path)?;
    grid.validate()
        .with_context(|| format!("invalid grid in {}", config_path.display()))?;

    let data =
        std::fs::read(file).with_context(|| format!("cannot read {}", file.display()))?;
    let encoding = grid.encoding();
    let storage_index = encode::storage_index_for(&data);
    let shares = encode::encode(&data, &encoding)?;
    info!(
        file = %file.display(),
        %storage_index,
        bytes = data.len(),
        share_size = shares.first().map_or(0, |s| s.len()),
        "file encoded"
    );

    let selector = ServerSelector::new(grid.selector_config()?);
    let candidates = grid.candidates();
    let plan = selector
        .select_and_place(&UploadParams::new(storage_index, encoding), &candidates, &shares)
        .await
        .with_context(|| format!("upload of {} failed", file.display()))?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        _ => {
            print!("{plan}");
        }
    }

    Ok(())
}
