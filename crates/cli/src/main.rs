//! raster2sensor CLI - UAV raster imagery to SensorThings observations

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use raster2sensor_parallel::ProcessingMode;
use raster2sensor_pipeline::config::HttpConfig;
use raster2sensor_pipeline::{
    add_datastreams, create_plots, fetch_plots, write_sample_config, ConfigFormat,
    ConfigOverrides, Pipeline, PipelineConfig, RunContext, Selection,
};
use raster2sensor_sensorthings::{CancelFlag, HttpRegistry, ProcessesClient, SensorThingsApi};

// ─── CLI structure ──────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "raster2sensor")]
#[command(author, version, about = "Publish vegetation index statistics of trial plots to a SensorThings API", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit log lines as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Worker threads for per-plot statistics (0 = all cores, 1 = sequential)
    #[arg(long, global = true, default_value = "0")]
    threads: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute vegetation indices for every configured image and publish
    /// per-plot statistics as observations
    ProcessImages {
        /// Configuration file (.yml, .yaml or .json)
        #[arg(short, long)]
        config: PathBuf,
        /// Override the configured trial id
        #[arg(long)]
        trial_id: Option<String>,
        /// Only these indices (name or process alias, comma separated)
        #[arg(long, value_delimiter = ',')]
        indices: Option<Vec<String>>,
        /// Only these images (path or file name, comma separated)
        #[arg(long, value_delimiter = ',')]
        images: Option<Vec<String>>,
        /// Compute and validate everything but write nothing to the registry
        #[arg(long)]
        dry_run: bool,
        /// Also write every derived index raster to this directory
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Print the run summary as JSON
        #[arg(long)]
        summary_json: bool,
    },
    /// Write a sample configuration file
    CreateSampleConfig {
        /// Output file
        #[arg(short, long, default_value = "config.yml")]
        output: PathBuf,
        /// yaml or json
        #[arg(short, long, value_enum, default_value = "yaml")]
        format: FormatArg,
    },
    /// Trial plots in the SensorThings registry
    Plots {
        #[command(subcommand)]
        command: PlotsCommands,
    },
    /// OGC API Processes catalog
    Processes {
        #[command(subcommand)]
        command: ProcessesCommands,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Yaml,
    Json,
}

impl From<FormatArg> for ConfigFormat {
    fn from(f: FormatArg) -> Self {
        match f {
            FormatArg::Yaml => ConfigFormat::Yaml,
            FormatArg::Json => ConfigFormat::Json,
        }
    }
}

// ─── Plots subcommands ──────────────────────────────────────────────────

#[derive(Subcommand)]
enum PlotsCommands {
    /// List the trial's plots as a GeoJSON FeatureCollection
    Fetch {
        #[arg(short, long, conflicts_with = "sensorthingsapi_url")]
        config: Option<PathBuf>,
        #[arg(long)]
        trial_id: Option<String>,
        #[arg(long)]
        sensorthingsapi_url: Option<String>,
        /// Write the GeoJSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Register a Thing and every configured Datastream for each plot
    Create {
        #[arg(short, long)]
        config: PathBuf,
        /// Plots file (overrides `plots_file`)
        #[arg(long)]
        file_path: Option<PathBuf>,
        #[command(flatten)]
        overrides: TrialOverrides,
        #[arg(long)]
        dry_run: bool,
    },
    /// Register every configured Datastream for the trial's existing Things
    AddDatastreams {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        trial_id: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Args)]
struct TrialOverrides {
    #[arg(long)]
    trial_id: Option<String>,
    #[arg(long)]
    plot_id_field: Option<String>,
    #[arg(long)]
    treatment_id_field: Option<String>,
    #[arg(long)]
    year: Option<i32>,
    #[arg(long)]
    sensorthingsapi_url: Option<String>,
}

// ─── Processes subcommands ──────────────────────────────────────────────

#[derive(Args)]
struct ProcessesEndpoint {
    #[arg(short, long, conflicts_with = "pygeoapi_url")]
    config: Option<PathBuf>,
    #[arg(long)]
    pygeoapi_url: Option<String>,
}

#[derive(Subcommand)]
enum ProcessesCommands {
    /// List available processes
    Fetch {
        #[command(flatten)]
        endpoint: ProcessesEndpoint,
    },
    /// Show the description of one process
    Describe {
        #[command(flatten)]
        endpoint: ProcessesEndpoint,
        #[arg(long)]
        process_id: String,
    },
    /// Execute a process with inputs read from a JSON file
    Execute {
        #[command(flatten)]
        endpoint: ProcessesEndpoint,
        #[arg(long)]
        process_id: String,
        /// JSON file holding the `inputs` object
        #[arg(long)]
        input_file: PathBuf,
        /// Write the result here instead of stdout
        #[arg(long)]
        output_file: Option<PathBuf>,
    },
}

// ─── Helpers ────────────────────────────────────────────────────────────

fn setup_logging(verbose: bool, json: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        tracing::subscriber::set_global_default(builder.json().finish())
            .expect("setting default subscriber failed");
    } else {
        tracing::subscriber::set_global_default(builder.finish())
            .expect("setting default subscriber failed");
    }
}

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg} [{elapsed}]")
            .expect("valid spinner template"),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Cancel `flag` on Ctrl-C. In-flight requests finish; no new ones start.
fn cancel_on_ctrl_c(flag: CancelFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight requests");
            flag.cancel();
        }
    });
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    PipelineConfig::load(path)
        .with_context(|| format!("Failed to load configuration {}", path.display()))
}

fn registry(url: &str, http: &HttpConfig) -> Result<Arc<dyn SensorThingsApi>> {
    let registry =
        HttpRegistry::new(url, http.timeout()).context("Failed to create SensorThings client")?;
    Ok(Arc::new(registry))
}

fn processes_client(endpoint: ProcessesEndpoint) -> Result<ProcessesClient> {
    let (url, http) = match endpoint.config {
        Some(path) => {
            let config = load_config(&path)?;
            (config.processes_url()?, config.http)
        }
        None => match endpoint.pygeoapi_url {
            Some(url) => (url, HttpConfig::default()),
            None => anyhow::bail!("Either --config or --pygeoapi-url is required"),
        },
    };
    ProcessesClient::new(&url, http.timeout(), http.retry_policy())
        .context("Failed to create processes client")
}

fn write_or_print(value: &serde_json::Value, output: Option<&Path>) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            std::fs::write(path, text)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), "written");
        }
        None => println!("{}", text),
    }
    Ok(())
}

// ─── Commands ───────────────────────────────────────────────────────────

async fn run(cli: Cli) -> Result<i32> {
    let mode = ProcessingMode::from_threads(cli.threads);

    match cli.command {
        Commands::ProcessImages {
            config,
            trial_id,
            indices,
            images,
            dry_run,
            output_dir,
            summary_json,
        } => {
            let mut config = load_config(&config)?;
            config.apply(ConfigOverrides {
                trial_id,
                ..Default::default()
            });
            let plan = config
                .plan(&Selection { indices, images })
                .context("Invalid configuration")?;
            if let Some(dir) = &output_dir {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }

            let ctx = RunContext::new(dry_run).with_mode(mode);
            cancel_on_ctrl_c(ctx.cancel.clone());
            let api = registry(&plan.sensorthingsapi_url, &plan.http)?;

            let mut pipeline = Pipeline::new(plan, ctx, api);
            if let Some(dir) = output_dir {
                pipeline = pipeline.with_output_dir(dir);
            }

            let pb = spinner("Processing images...");
            let start = Instant::now();
            let summary = pipeline.run().await;
            pb.finish_and_clear();
            let summary = summary.context("Run aborted")?;
            info!(elapsed = ?start.elapsed(), "done");

            if summary_json {
                println!("{}", summary.to_json()?);
            } else {
                print!("{}", summary);
            }
            Ok(summary.exit_code())
        }

        Commands::CreateSampleConfig { output, format } => {
            write_sample_config(&output, format.into())
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Sample configuration created: {}", output.display());
            Ok(0)
        }

        Commands::Plots { command } => match command {
            PlotsCommands::Fetch {
                config,
                trial_id,
                sensorthingsapi_url,
                output,
            } => {
                let mut config = match config {
                    Some(path) => load_config(&path)?,
                    None => PipelineConfig {
                        sensorthingsapi_url,
                        ..Default::default()
                    },
                };
                config.apply(ConfigOverrides {
                    trial_id,
                    ..Default::default()
                });
                let trial_id = config.trial_id()?.to_string();
                let api = registry(&config.sensorthings_url()?, &config.http)?;

                let ctx = RunContext::new(false).with_mode(mode);
                cancel_on_ctrl_c(ctx.cancel.clone());
                let pb = spinner("Fetching plots...");
                let fc =
                    fetch_plots(api.as_ref(), &trial_id, config.http.retry_policy(), &ctx).await;
                pb.finish_and_clear();
                write_or_print(&fc.context("Failed to fetch plots")?, output.as_deref())?;
                Ok(0)
            }

            PlotsCommands::Create {
                config,
                file_path,
                overrides,
                dry_run,
            } => {
                let mut config = load_config(&config)?;
                config.apply(ConfigOverrides {
                    trial_id: overrides.trial_id,
                    plot_id_field: overrides.plot_id_field,
                    treatment_id_field: overrides.treatment_id_field,
                    year: overrides.year,
                    sensorthingsapi_url: overrides.sensorthingsapi_url,
                    pygeoapi_url: None,
                    plots_file: file_path,
                });
                let api = registry(&config.sensorthings_url()?, &config.http)?;

                let ctx = RunContext::new(dry_run).with_mode(mode);
                cancel_on_ctrl_c(ctx.cancel.clone());
                let pb = spinner("Registering plots...");
                let summary = create_plots(&config, &ctx, api).await;
                pb.finish_and_clear();
                let summary = summary.context("Failed to register plots")?;
                print!("{}", summary);
                Ok(summary.exit_code())
            }

            PlotsCommands::AddDatastreams {
                config,
                trial_id,
                dry_run,
            } => {
                let mut config = load_config(&config)?;
                config.apply(ConfigOverrides {
                    trial_id,
                    ..Default::default()
                });
                let api = registry(&config.sensorthings_url()?, &config.http)?;

                let ctx = RunContext::new(dry_run).with_mode(mode);
                cancel_on_ctrl_c(ctx.cancel.clone());
                let pb = spinner("Adding datastreams...");
                let summary = add_datastreams(&config, &ctx, api).await;
                pb.finish_and_clear();
                let summary = summary.context("Failed to add datastreams")?;
                print!("{}", summary);
                Ok(summary.exit_code())
            }
        },

        Commands::Processes { command } => match command {
            ProcessesCommands::Fetch { endpoint } => {
                let client = processes_client(endpoint)?;
                let processes = client.fetch().await.context("Failed to fetch processes")?;
                write_or_print(&processes, None)?;
                Ok(0)
            }
            ProcessesCommands::Describe {
                endpoint,
                process_id,
            } => {
                let client = processes_client(endpoint)?;
                let description = client
                    .describe(&process_id)
                    .await
                    .with_context(|| format!("Failed to describe process {}", process_id))?;
                write_or_print(&description, None)?;
                Ok(0)
            }
            ProcessesCommands::Execute {
                endpoint,
                process_id,
                input_file,
                output_file,
            } => {
                let text = std::fs::read_to_string(&input_file)
                    .with_context(|| format!("Failed to read {}", input_file.display()))?;
                let mut inputs: serde_json::Value =
                    serde_json::from_str(&text).context("Input file is not valid JSON")?;
                // Accept both a bare inputs object and {"inputs": {...}}
                if let Some(inner) = inputs.get_mut("inputs").map(serde_json::Value::take) {
                    inputs = inner;
                }

                let client = processes_client(endpoint)?;
                let pb = spinner(&format!("Executing {}...", process_id));
                let result = client.execute(&process_id, inputs).await;
                pb.finish_and_clear();
                let result =
                    result.with_context(|| format!("Failed to execute process {}", process_id))?;
                write_or_print(&result, output_file.as_deref())?;
                Ok(0)
            }
        },
    }
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.log_json);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime");

    let code = match runtime.and_then(|rt| rt.block_on(run(cli))) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
