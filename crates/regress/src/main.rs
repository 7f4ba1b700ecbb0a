//! Regression runner entry point
//!
//! Run with: cargo run --bin regress -- --venv "$VIRTUAL_ENV"

use std::path::PathBuf;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tutorial_regress::{HarnessConfig, RegressionRunner, SuiteResult};

#[derive(Parser, Debug)]
#[command(name = "regress")]
#[command(about = "Re-run tutorial example programs and check their documented output")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "regress.toml")]
    config: PathBuf,

    /// Isolated environment the subjects run in
    #[arg(long, env = "VIRTUAL_ENV")]
    venv: Option<PathBuf>,

    /// Root of the example program corpus
    #[arg(long)]
    examples_root: Option<PathBuf>,

    /// Golden reference files
    #[arg(long)]
    reference_dir: Option<PathBuf>,

    /// Subject catalog directory
    #[arg(short, long)]
    subjects: Option<PathBuf>,

    /// Output directory for results
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Run only subjects with this tag
    #[arg(short, long)]
    tag: Option<String>,

    /// Run only a specific subject by name
    #[arg(short, long)]
    name: Option<String>,

    /// Keep every subject's outputs, not only those of failures
    #[arg(long)]
    keep_artifacts: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Django version for the web project: a version or "unpinned"
    #[arg(long)]
    django_version: Option<String>,

    /// Matplotlib version: a version or "unpinned"
    #[arg(long)]
    matplotlib_version: Option<String>,

    /// Plotly version: a version or "unpinned"
    #[arg(long)]
    plotly_version: Option<String>,

    /// Pygame version: a version or "unpinned"
    #[arg(long)]
    pygame_version: Option<String>,
}

impl Args {
    /// Command-line values take precedence over the config file
    fn into_config(self) -> anyhow::Result<(HarnessConfig, Option<String>, Option<String>)> {
        let mut config = HarnessConfig::load(&self.config)?;

        if self.venv.is_some() {
            config.venv_root = self.venv;
        }
        if let Some(dir) = self.examples_root {
            config.examples_root = dir;
        }
        if let Some(dir) = self.reference_dir {
            config.reference_dir = dir;
        }
        if let Some(dir) = self.subjects {
            config.subjects_dir = dir;
        }
        if let Some(dir) = self.output {
            config.output_dir = dir;
        }
        config.keep_artifacts |= self.keep_artifacts;

        let overrides = [
            ("django", self.django_version),
            ("matplotlib", self.matplotlib_version),
            ("plotly", self.plotly_version),
            ("pygame", self.pygame_version),
        ];
        for (library, version) in overrides {
            if let Some(version) = version {
                config.pins.insert(library.to_string(), version);
            }
        }

        Ok((config, self.tag, self.name))
    }
}

fn main() {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let result = tokio::runtime::Runtime::new()
        .map_err(anyhow::Error::from)
        .and_then(|rt| rt.block_on(async_main(args)));

    match result {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    }
}

async fn async_main(args: Args) -> anyhow::Result<bool> {
    let (config, tag, name) = args.into_config()?;
    info!("tutorial-regress v{}", env!("CARGO_PKG_VERSION"));
    for (library, version) in &config.pins {
        info!("Requested {} version: {}", library, version);
    }

    let mut runner = RegressionRunner::with_config(config);

    let results: SuiteResult = if let Some(name) = name {
        runner.run_named(&name).await?
    } else if let Some(tag) = tag {
        runner.run_tagged(&tag).await?
    } else {
        runner.run_all().await?
    };

    runner.write_results(&results)?;

    Ok(results.failed == 0)
}
