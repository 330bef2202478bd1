//! RustZImage CLI
//!
//! Служебные команды: расписание планировщика, аудит весов, проверка устройства.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flow_diffusion::{FlowMatchEulerScheduler, SchedulerConfig};
use zimage_core::config::load_json_config;
use zimage_core::{
    ModelMetadata, TRANSFORMER_KEY_ALIASES, TransformerConfig, VaeConfig, audit_weights,
    create_device, require_qk_norm_sentinels, sync_barrier,
};

#[derive(Parser)]
#[command(name = "zimage")]
#[command(author, version, about = "RustZImage: Z-Image text-to-image tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the sigma/timestep schedule for a request size
    Schedule {
        /// Number of denoising steps
        #[arg(long, default_value_t = ModelMetadata::RECOMMENDED_INFERENCE_STEPS)]
        steps: usize,

        #[arg(long, default_value_t = ModelMetadata::RECOMMENDED_WIDTH)]
        width: usize,

        #[arg(long, default_value_t = ModelMetadata::RECOMMENDED_HEIGHT)]
        height: usize,

        /// diffusers `scheduler_config.json` (по умолчанию пресет Z-Image Turbo)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Вывести JSON вместо таблицы
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Check a safetensors checkpoint against a list of expected parameter names
    Audit {
        /// Path to the `.safetensors` file
        #[arg(long)]
        weights: PathBuf,

        /// Text file with one expected parameter name per line
        #[arg(long)]
        expected: PathBuf,

        /// Префикс ключей в чекпоинте (например, `model`)
        #[arg(long, default_value = "")]
        prefix: String,

        /// Минимальная доля найденных параметров (0..=1)
        #[arg(long, default_value_t = 1.0)]
        min_coverage: f64,

        /// Сколько примеров missing/extra показать
        #[arg(long, default_value_t = 10)]
        sample: usize,

        /// `transformer/config.json`: чекпоинт проверяется как трансформер
        /// (qk-norm ключи обязательны при `qk_norm`, принимаются `cap_embedder.*`)
        #[arg(long)]
        transformer_config: Option<PathBuf>,
    },

    /// Run a simple test to verify the setup
    Test {
        /// Device to use (cpu, metal, cuda)
        #[arg(long, default_value = "cpu")]
        device: String,
    },
}

#[derive(Serialize)]
struct ScheduleReport {
    steps: usize,
    latent_height: usize,
    latent_width: usize,
    mu: Option<f64>,
    sigmas: Vec<f64>,
    timesteps: Vec<f64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Schedule {
            steps,
            width,
            height,
            config,
            json,
        } => {
            let scheduler_config = match &config {
                Some(path) => SchedulerConfig::from_file(path)
                    .with_context(|| format!("Не удалось загрузить {}", path.display()))?,
                None => SchedulerConfig::z_image_turbo(),
            };

            let divisor = VaeConfig::default().latent_divisor();
            let latent_h = (height / divisor).max(1);
            let latent_w = (width / divisor).max(1);
            let mu = scheduler_config.mu_for_latent(latent_h, latent_w);
            let scheduler = FlowMatchEulerScheduler::new(steps, &scheduler_config, mu)?;

            let report = ScheduleReport {
                steps,
                latent_height: latent_h,
                latent_width: latent_w,
                mu,
                sigmas: scheduler.sigmas().to_vec(),
                timesteps: scheduler.timesteps().to_vec(),
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }

            println!("🗓️  Flow-match schedule");
            println!("======================");
            println!("Latent: {latent_h}x{latent_w}");
            match mu {
                Some(mu) => println!("Dynamic shift mu: {mu:.4}"),
                None => println!("Static shift: {}", scheduler_config.shift),
            }
            println!();
            println!("{:>4}  {:>10}  {:>8}  {:>10}", "step", "timestep", "sigma", "model t");
            for (i, t) in report.timesteps.iter().enumerate() {
                println!(
                    "{:>4}  {:>10.3}  {:>8.5}  {:>10.5}",
                    i,
                    t,
                    report.sigmas[i],
                    (1000.0 - t) / 1000.0
                );
            }
            println!("{:>4}  {:>10}  {:>8.5}", "end", "-", report.sigmas[steps]);
            Ok(())
        }

        Commands::Audit {
            weights,
            expected,
            prefix,
            min_coverage,
            sample,
            transformer_config,
        } => {
            let names = std::fs::read_to_string(&expected)
                .with_context(|| format!("Не удалось прочитать {}", expected.display()))?;
            let tensors = candle_core::safetensors::load(&weights, &candle_core::Device::Cpu)
                .with_context(|| format!("Не удалось загрузить {}", weights.display()))?;

            let aliases: &[(&str, &str)] = match &transformer_config {
                Some(path) => {
                    let config: TransformerConfig = load_json_config(path)
                        .with_context(|| format!("Не удалось прочитать {}", path.display()))?;
                    require_qk_norm_sentinels(&tensors, &prefix, &config)?;
                    TRANSFORMER_KEY_ALIASES
                }
                None => &[],
            };

            let expected_names = names.lines().map(str::trim).filter(|l| !l.is_empty());
            let summary = audit_weights(expected_names, &tensors, &prefix, aliases, sample);

            println!("🔍 Weights audit: {}", weights.display());
            println!("   matched: {}", summary.matched);
            println!("   missing: {}", summary.missing.len());
            println!("   extra:   {}", summary.extra.len());
            println!("   coverage: {:.2}%", summary.coverage() * 100.0);

            summary.ensure_coverage(min_coverage)?;
            println!("✅ Coverage OK");
            Ok(())
        }

        Commands::Test { device } => {
            println!("🧪 RustZImage - Setup Test");
            println!("==========================");
            println!("Testing {device} device...");

            let device = create_device(&device)?;
            let start = Instant::now();

            let a = candle_core::Tensor::randn(0f32, 1f32, (2, 3), &device)?;
            let b = candle_core::Tensor::randn(0f32, 1f32, (3, 4), &device)?;
            let c = a.matmul(&b)?;

            // Один Euler-шаг на устройстве: проверяет планировщик и барьер синхронизации.
            let scheduler = FlowMatchEulerScheduler::new(2, &SchedulerConfig::z_image_turbo(), None)?;
            let latent = candle_core::Tensor::randn(0f32, 1f32, (1, 16, 4, 4), &device)?;
            let next = scheduler.step(&latent, 0, &latent)?;
            sync_barrier(&device)?;

            info!(elapsed = ?start.elapsed(), "device smoke test");
            println!("✅ Test passed. matmul: {:?}, step: {:?}", c.dims(), next.dims());
            Ok(())
        }
    }
}
