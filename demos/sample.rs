use std::io::Write;

use clap::Parser;
use ddpm2d::{utils::get_device, DiffusionConfig, DiffusionModule, SimpleNet, SimpleNetConfig};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration of a freshly initialised model.
    #[arg(long, default_value = "src/config.default.toml")]
    config: String,

    /// Checkpoint written by `DiffusionModule::save`, takes precedence over `--config`.
    #[arg(long)]
    checkpoint: Option<String>,

    /// Where to save the model after sampling.
    #[arg(long)]
    save: Option<String>,

    /// Number of 2-D points to generate.
    #[arg(long, default_value = "1000")]
    num_samples: i64,

    #[arg(long, default_value = "9527")]
    seed: i64,

    /// CSV file for the generated points, stdout when absent.
    #[arg(long)]
    output: Option<String>,

    #[arg(long)]
    cpu: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let Args { config, checkpoint, save, num_samples, seed, output, cpu } = Args::parse();
    let device = if cpu { tch::Device::Cpu } else { get_device() };

    tch::manual_seed(seed);
    let module = match checkpoint {
        Some(path) => DiffusionModule::<SimpleNet>::load(path, device)?,
        None => {
            let cfg = DiffusionConfig::<SimpleNetConfig>::from_file(config)?;
            DiffusionModule::<SimpleNet>::new(cfg, device)?
        }
    };

    let start = std::time::Instant::now();
    let points = module.p_sample_loop(&[num_samples, 2]).to_device(tch::Device::Cpu);
    tracing::info!(
        steps = module.var_scheduler.num_train_timesteps(),
        elapsed = ?start.elapsed(),
        "sampled {num_samples} points"
    );

    let points = Vec::<f32>::try_from(&points.view([-1]))?;
    let mut out: Box<dyn Write> = match output {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(std::io::stdout().lock()),
    };
    writeln!(out, "x,y")?;
    for point in points.chunks(2) {
        writeln!(out, "{},{}", point[0], point[1])?;
    }

    if let Some(path) = save {
        module.save(path)?;
    }
    Ok(())
}
