use std::io::{self, Write};

use anyhow::{Context, Result};
use tracing::info;

use crate::cli::FilterArgs;
use crate::commands::{open_stores, resolve_paths};
use crate::pipeline::moderation::{ModerationSnapshot, ServingRow, apply_serving_moderation_filters};
use crate::util::{read_json, write_json_pretty};

pub fn run(args: FilterArgs) -> Result<()> {
    let rows: Vec<ServingRow> = read_json(&args.input)
        .with_context(|| format!("failed to read serving rows from {}", args.input.display()))?;
    let stores = open_stores(&resolve_paths(&args.store))?;
    let snapshot = ModerationSnapshot::load(&stores.connection)?;

    let input_rows = rows.len();
    let (kept, counters) =
        apply_serving_moderation_filters(rows, &snapshot.denylist, &snapshot.blocklist);

    info!(
        marker = "filter",
        stage = "filter",
        status = "pass",
        input_rows,
        counters = %serde_json::json!(counters),
        "serving filter applied"
    );

    match &args.output {
        Some(path) => write_json_pretty(path, &kept)?,
        None => {
            let mut output = io::BufWriter::new(io::stdout().lock());
            serde_json::to_writer_pretty(&mut output, &kept)
                .context("failed to serialize filtered rows")?;
            writeln!(output)?;
            output.flush()?;
        }
    }
    Ok(())
}
