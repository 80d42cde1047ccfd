use anyhow::{Result, bail};
use tracing::info;

use crate::cli::{SeedArgs, SeedStrategy};
use crate::commands::resolve_paths;
use crate::pipeline::seed::{FixtureSeeder, SampledSeeder, SyntheticSeeder, fixture_state_path};
use crate::semantic::resolve_model_config;

pub fn run(args: SeedArgs) -> Result<()> {
    let mut paths = resolve_paths(&args.store);
    if let Some(source_dir) = &args.source_dir {
        paths.source_dir = source_dir.clone();
    }

    let seeder: Box<dyn FixtureSeeder> = match args.strategy {
        SeedStrategy::Synthetic => Box::new(SyntheticSeeder::new(
            paths.clone(),
            resolve_model_config(&args.model_id),
        )),
        SeedStrategy::Sampled => {
            let Some(from_dir) = &args.sample_from else {
                bail!("--sample-from is required with --strategy sampled");
            };
            if from_dir == &paths.source_dir {
                bail!(
                    "--sample-from must differ from the source directory {}",
                    paths.source_dir.display()
                );
            }
            Box::new(SampledSeeder::new(paths.clone(), from_dir, args.sample_size))
        }
    };

    let state = seeder.seed()?;
    info!(
        strategy = %state.strategy,
        hosts = state.hosts.len(),
        source_dir = %state.source_dir,
        state = %fixture_state_path(&paths).display(),
        "seed completed"
    );
    Ok(())
}
