//! streamsafe - command line front end
//!
//! `redact` blurs a single image, `process` runs an offline job with a
//! progress bar, `health` queries a running streamsafed.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use streamsafe::format::{format_detection_count, format_duration, processing_speed};
use streamsafe::jobs::{JobService, JobSpec, JobStatus};
use streamsafe::{
    ui, DetectionSettings, Frame, Quality, StreamSafeClient, StreamSafeConfig, StreamSafeProcessor,
};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(author, version, about = "Privacy redaction for video and images")]
struct Args {
    /// Output mode: auto, plain, or pretty.
    #[arg(long, default_value = "auto", value_name = "MODE", global = true)]
    ui: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Redact a single image.
    Redact {
        #[arg(long, value_name = "PATH")]
        input: PathBuf,
        #[arg(long, value_name = "PATH")]
        output: PathBuf,
        /// Comma-separated kinds to redact (plates, signs, blocks).
        #[arg(long, default_value = "plates,signs,blocks")]
        enable: String,
    },
    /// Redact videos, image folders or stub:// sources into image sequences.
    Process {
        #[arg(long = "input", value_name = "URI", required = true)]
        inputs: Vec<String>,
        #[arg(long, value_name = "DIR")]
        out: Option<PathBuf>,
        /// Output quality preset: low, medium, high, ultra.
        #[arg(long, default_value = "medium")]
        quality: String,
        #[arg(long, default_value = "plates,signs,blocks")]
        enable: String,
    },
    /// Query a running streamsafed.
    Health {
        #[arg(long, env = "STREAMSAFE_URL", default_value = "http://127.0.0.1:8000")]
        url: String,
        #[arg(long, env = "STREAMSAFE_API_TOKEN_PATH", value_name = "PATH")]
        token_file: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    match args.command {
        Command::Redact {
            input,
            output,
            enable,
        } => redact(&ui, &input, &output, &enable),
        Command::Process {
            inputs,
            out,
            quality,
            enable,
        } => process(&ui, inputs, out, &quality, &enable),
        Command::Health { url, token_file } => health(&url, token_file),
    }
}

fn redact(ui: &ui::Ui, input: &Path, output: &Path, enable: &str) -> Result<()> {
    let settings = DetectionSettings::from_csv(enable)?;
    let config = StreamSafeConfig::load()?;

    let mut processor = {
        let _stage = ui.stage("Loading detectors");
        StreamSafeProcessor::from_config(&config.detectors)?
    };
    let mut frame = {
        let _stage = ui.stage("Reading image");
        let image = image::open(input)
            .with_context(|| format!("open {}", input.display()))?
            .to_rgb8();
        Frame::new(image, 0)
    };
    let report = {
        let _stage = ui.stage("Redacting");
        processor.process_still(&mut frame, &settings)
    };
    {
        let _stage = ui.stage("Writing output");
        frame
            .image()
            .save(output)
            .with_context(|| format!("write {}", output.display()))?;
    }
    println!(
        "{} ({} regions blurred) -> {}",
        format_detection_count(report.detection_count() as u64),
        report.redacted_regions,
        output.display()
    );
    Ok(())
}

fn process(
    ui: &ui::Ui,
    inputs: Vec<String>,
    out: Option<PathBuf>,
    quality: &str,
    enable: &str,
) -> Result<()> {
    let settings = DetectionSettings::from_csv(enable)?;
    let quality = Quality::parse_or_default(quality);
    let config = StreamSafeConfig::load()?;
    let output_root = out.unwrap_or_else(|| config.jobs.output_dir.clone());

    let factory = StreamSafeProcessor::factory(config.detectors.clone());
    let service = JobService::new(factory, output_root, config.source.clone(), config.jobs.history_cap);
    let spec = JobSpec::batch(inputs, settings, quality);
    let id = service.submit(spec)?;
    service.start(&id)?;

    let started = Instant::now();
    let mut progress = ui.progress(&format!("Job {}", id));
    let job = loop {
        let job = service
            .get(&id)?
            .ok_or_else(|| anyhow!("job {} disappeared", id))?;
        let fps = processing_speed(job.processed_frames, started.elapsed().as_secs_f64());
        progress.update(job.progress, &job.current_stage, fps, job.eta_seconds());
        if job.status.is_terminal() {
            break job;
        }
        std::thread::sleep(POLL_INTERVAL);
    };
    service.join(&id)?;

    match job.status {
        JobStatus::Completed => {
            progress.finish(&format!(
                "✔ {} frames in {}",
                job.processed_frames,
                format_duration(job.duration())
            ));
            println!("{}", serde_json::to_string_pretty(&job.output)?);
            Ok(())
        }
        JobStatus::Cancelled => {
            progress.finish("cancelled");
            Err(anyhow!("job {} cancelled", id))
        }
        _ => {
            progress.finish("failed");
            Err(anyhow!(
                "job {} failed: {}",
                id,
                job.error_message.as_deref().unwrap_or("unknown error")
            ))
        }
    }
}

fn health(url: &str, token_file: Option<PathBuf>) -> Result<()> {
    let token = match token_file {
        Some(path) => Some(
            std::fs::read_to_string(&path)
                .with_context(|| format!("read token file {}", path.display()))?
                .trim()
                .to_string(),
        ),
        None => None,
    };
    let client = StreamSafeClient::new(url, token);
    let health = client.health()?;
    println!("{}", serde_json::to_string_pretty(&health)?);
    Ok(())
}
