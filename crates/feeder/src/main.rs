use std::{
    io::Write as _,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use reedline::{DefaultPrompt, DefaultPromptSegment, Reedline, Signal};
use tokio::io::BufReader;
use vplot_geom::{Calibration, TriangleModel};
use vplot_pipeline::{
    HardwareSink, MotionSink, MotorBackend, Pipeline, SimulatedSink, Status, TracePoint,
};

use crate::config::PlotterConfig;

mod config;
mod svg;

const TICK: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(about = "Drives a two-cord V-plotter")]
struct Cli {
    /// The plotter configuration (defaults to ./vplot.toml, if it exists).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plots a file of motion commands.
    Plot {
        path: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Reads motion commands from a prompt.
    Interactive {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Cleans up a file of motion commands without plotting it.
    Postprocess {
        input: PathBuf,
        /// Where to write the result (defaults to stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Moves shorter than this (in mm) are dropped.
        #[arg(long, default_value_t = 1.0)]
        min_segment: f64,
    },
}

#[derive(Args)]
struct RunArgs {
    /// The measured length of the left cord, in mm.
    #[arg(long, requires = "right")]
    left: Option<f64>,
    /// The measured length of the right cord, in mm.
    #[arg(long, requires = "left")]
    right: Option<f64>,
    /// Overrides the configured motor backend ("hardware" or "simulated").
    #[arg(long)]
    backend: Option<MotorBackend>,
    /// Writes the simulated trace to this SVG file.
    #[arg(long)]
    svg: Option<PathBuf>,
}

enum Source {
    File(PathBuf),
    Interactive,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PlotterConfig> {
    match path {
        Some(path) => PlotterConfig::load(Some(path)),
        None => {
            let default = config::default_path();
            PlotterConfig::load(default.exists().then_some(default.as_path()))
        }
    }
}

/// Queues every command in the file, returning how many there were.
async fn plot_file<S: MotionSink>(pipeline: &Pipeline<S>, path: &Path) -> anyhow::Result<usize> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let len = file.metadata().await?.len();

    let bar = ProgressBar::new(len).with_style(ProgressStyle::with_template(
        "{bar:40} {bytes}/{total_bytes} ({eta})",
    )?);
    let count = pipeline
        .feed(BufReader::new(bar.wrap_async_read(file)))
        .await?;
    bar.finish_and_clear();
    Ok(count)
}

fn prompt() -> DefaultPrompt {
    DefaultPrompt::new(
        DefaultPromptSegment::Basic("vplot".to_owned()),
        DefaultPromptSegment::Empty,
    )
}

async fn interactive<S: MotionSink>(pipeline: &Pipeline<S>) -> anyhow::Result<()> {
    eprintln!("Enter motion commands (G0, G2, G28, M3, M4), 'status' or 'quit'.");
    let mut reed = Reedline::create();
    let prompt = prompt();
    loop {
        let line = match reed.read_line(&prompt)? {
            Signal::Success(s) => s,
            Signal::CtrlC | Signal::CtrlD => break,
        };
        let line = line.trim();
        match line {
            "quit" => break,
            "status" => {
                eprintln!("{}", pipeline.plotter_state());
                eprintln!("Queued commands:  {}", pipeline.queued_commands());
            }
            _ => pipeline.submit_line(line).await?,
        }
    }
    Ok(())
}

async fn run<S: MotionSink>(
    calib: Calibration,
    config: &PlotterConfig,
    sink: S,
    source: &Source,
) -> anyhow::Result<(S, Status)> {
    let pipeline = Pipeline::start(TriangleModel::new(calib), sink, config.pipeline());
    let fed = match source {
        Source::File(path) => plot_file(&pipeline, path).await.map(Some),
        Source::Interactive => interactive(&pipeline).await.map(|()| None),
    };

    // The file is queued, but the planner and motors are probably still busy.
    let spinner = match &fed {
        Ok(Some(count)) => {
            let bar =
                ProgressBar::new_spinner().with_message(format!("plotting {count} commands..."));
            bar.enable_steady_tick(TICK);
            Some(bar)
        }
        _ => None,
    };

    // Drain what was queued even if feeding failed halfway.
    let res = pipeline.shutdown().await;
    if let Some(bar) = spinner {
        bar.finish_with_message("done!");
    }
    // A motor stage that failed to start also makes feeding fail, so its
    // error is the interesting one.
    let (sink, status) = res?;
    fed?;
    eprintln!("{status}");
    Ok((sink, status))
}

// The port itself is opened by the motor stage, when it starts.
#[cfg(feature = "rpi")]
fn hardware_sink(
    config: &PlotterConfig,
) -> anyhow::Result<HardwareSink<vplot_motors::rpi::RpiGpio>> {
    Ok(HardwareSink::connect(vplot_motors::rpi::RpiGpio::new, config.hardware()))
}

#[cfg(not(feature = "rpi"))]
fn hardware_sink(
    _config: &PlotterConfig,
) -> anyhow::Result<HardwareSink<vplot_motors::mock::MockGpio>> {
    Err(anyhow::anyhow!(
        "this build has no hardware support (rebuild with the `rpi` feature)"
    ))
}

async fn run_backend(
    config: &PlotterConfig,
    run_args: &RunArgs,
    source: Source,
) -> anyhow::Result<()> {
    let cords = run_args.left.zip(run_args.right).map(|(l, r)| [l, r]);
    let calib = config.calibration(cords)?;
    log::info!(
        "origin is at ({:.2}, {:.2}) from the left anchor",
        calib.origin.x,
        calib.origin.y
    );

    match run_args.backend.unwrap_or(config.backend) {
        MotorBackend::Hardware => {
            if run_args.svg.is_some() {
                log::warn!("--svg only applies to the simulated backend");
            }
            let sink = hardware_sink(config)?;
            run(calib, config, sink, &source).await?;
        }
        MotorBackend::Simulated => {
            let sink = SimulatedSink::new(
                TriangleModel::new(calib),
                config.servo_pos_up,
                config.servo_pos_down,
            );
            let (sink, _) = run(calib, config, sink, &source).await?;
            if let Some(path) = &run_args.svg {
                let trace: Vec<TracePoint> = sink.trace().snapshot();
                svg::write_trace(path, &trace, &calib)?;
            }
        }
    }
    Ok(())
}

fn postprocess(input: &Path, output: Option<&Path>, min_segment: f64) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let processed = vplot_protocol::post_process_lines(content.lines(), min_segment);

    let mut out: Box<dyn std::io::Write> = match output {
        Some(path) => Box::new(std::io::BufWriter::new(
            std::fs::File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => Box::new(std::io::stdout().lock()),
    };
    for line in processed.lines() {
        writeln!(out, "{line}")?;
    }
    out.flush()?;

    eprintln!(
        "{} lines in, {} commands out",
        processed.original_len,
        processed.commands.len()
    );
    match processed.bounding_box {
        Some(b) => eprintln!(
            "bounding box: ({}, {}) to ({}, {})",
            b.min.x, b.min.y, b.max.x, b.max.y
        ),
        None => eprintln!("no moves"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Plot { path, run } => run_backend(&config, &run, Source::File(path)).await,
        Command::Interactive { run } => run_backend(&config, &run, Source::Interactive).await,
        Command::Postprocess {
            input,
            output,
            min_segment,
        } => postprocess(&input, output.as_deref(), min_segment),
    }
}
