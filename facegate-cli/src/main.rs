use clap::{Parser, Subcommand};
use facegate_core::config::Config;
use facegate_core::native::NativeVision;
use facegate_core::record::{EnrollmentStore, RecordDocument};
use facegate_core::store::ModelStore;
use facegate_core::{Command, FaceLogin, Response, RunOutcome};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::thread;

#[derive(Parser)]
#[command(name = "facegate")]
#[command(about = "Face login with on-the-fly enrollment", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Use this configuration file instead of the default lookup chain
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a login session against the camera
    Run,
    /// List saved models
    Models,
    /// List enrollment records
    Records,
    /// Predict the subject in an image file with the most recent model
    Predict {
        /// Image file
        image: PathBuf,
    },
    /// Capture a snapshot with detected faces outlined
    Snapshot {
        /// Output file path
        output: PathBuf,
    },
    /// List video capture devices
    Devices,
    /// Show configuration
    Config {
        /// Validate configuration
        #[arg(long)]
        validate: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .init();

    let config = match &cli.config {
        Some(path) => Config::load_file(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Run => cmd_run(config),
        Commands::Models => cmd_models(&config),
        Commands::Records => cmd_records(&config),
        Commands::Predict { image } => cmd_predict(&config, image),
        Commands::Snapshot { output } => cmd_snapshot(config, output),
        Commands::Devices => cmd_devices(),
        Commands::Config { validate } => cmd_config(&config, validate),
    }
}

fn cmd_run(config: Config) -> anyhow::Result<()> {
    let mut login = FaceLogin::new(config)?;
    let (tx, rx) = mpsc::channel();
    spawn_key_reader(tx);

    println!("Look at the camera and hold still.");
    println!("Keys: q quit, r reset, t train, s save, f minimal model, l load, ? status, start/stop");

    let outcome = login.run(&rx, print_response)?;

    match outcome {
        RunOutcome::LoggedIn(report) => {
            println!();
            println!("✓ Login successful after {:.1}s", report.elapsed.as_secs_f64());
            println!("Training samples: {}", report.training_samples);
            if let Some(record) = report.record {
                println!("Record: {}", record.record_path.display());
            }
            if let Some(model) = report.model {
                println!("Model: {}", model.archive_path.display());
            }
        }
        RunOutcome::Quit => println!("Stopped."),
        RunOutcome::CameraLost => anyhow::bail!("camera stopped delivering frames"),
    }

    Ok(())
}

/// Forward stdin lines to the runner as commands
fn spawn_key_reader(tx: Sender<Command>) {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let command = match line.trim() {
                "q" => Command::Quit,
                "r" => Command::Reset,
                "t" => Command::Train,
                "s" => Command::SaveModel,
                "f" => Command::MinimalModel,
                "l" => Command::LoadModel,
                "?" => Command::Status,
                "start" => Command::StartCapture,
                "stop" => Command::StopCapture,
                "" => continue,
                other => {
                    eprintln!("Unknown key: {}", other);
                    continue;
                }
            };
            if tx.send(command).is_err() || command == Command::Quit {
                break;
            }
        }
    });
}

fn print_response(response: &Response) {
    match response {
        Response::Ack => println!("ok"),
        Response::Status(status) => match serde_json::to_string_pretty(status) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to encode status: {}", e),
        },
        Response::ModelSaved(saved) => {
            println!(
                "✓ Model saved: {} ({} samples)",
                saved.archive_path.display(),
                saved.metadata.training_samples
            );
        }
        Response::ModelLoaded(path) => println!("✓ Model loaded: {}", path.display()),
        Response::Quit => {}
    }
}

fn cmd_models(config: &Config) -> anyhow::Result<()> {
    let models = ModelStore::new(&config.storage.models_dir).list()?;

    if models.is_empty() {
        println!("No models saved in {}", config.storage.models_dir.display());
        return Ok(());
    }

    println!("{:<45} {:<10} {:<22} {}", "Model", "Samples", "Type", "Saved At");
    println!("{}", "-".repeat(100));
    for model in models {
        println!(
            "{:<45} {:<10} {:<22} {}",
            model.model_filename, model.training_samples, model.model_type, model.timestamp
        );
    }

    Ok(())
}

fn cmd_records(config: &Config) -> anyhow::Result<()> {
    let store = EnrollmentStore::new(&config.storage.images_dir, &config.storage.records_dir);
    let records = store.list()?;

    if records.is_empty() {
        println!("No enrollment records in {}", config.storage.records_dir.display());
        return Ok(());
    }

    println!("{:<18} {:<10} {:<8} {}", "Timestamp", "Quality", "Frames", "Image");
    println!("{}", "-".repeat(80));
    for saved in records {
        match &saved.document {
            RecordDocument::Complete(record) => println!(
                "{:<18} {:<10.3} {:<8} {}",
                record.timestamp,
                record.quality_score,
                record.stability_frames,
                record.face_image_filename
            ),
            RecordDocument::Degraded(record) => println!(
                "{:<18} {:<10} {:<8} {} (error: {})",
                record.timestamp, "-", "-", record.face_image_filename, record.error
            ),
        }
    }

    Ok(())
}

fn cmd_predict(config: &Config, image: PathBuf) -> anyhow::Result<()> {
    let frame = image::open(&image)?.to_rgb8();
    let mut vision = NativeVision::new(&config.detection);
    let models = ModelStore::new(&config.storage.models_dir);

    let (rect, prediction) =
        facegate_core::predict_image(&mut vision, &models, &frame, config.training.patch_size)?;

    println!("Face at ({}, {}) {}x{}", rect.x, rect.y, rect.width, rect.height);
    println!("Label: {}", prediction.label);
    println!("Distance: {:.2}", prediction.distance);

    Ok(())
}

fn cmd_snapshot(config: Config, output: PathBuf) -> anyhow::Result<()> {
    println!("Capturing snapshot to: {}", output.display());

    let mut login = FaceLogin::new(config)?;
    let faces = login.snapshot(&output)?;

    println!("✓ Snapshot saved: {}", output.display());
    println!("Faces: {}", faces);

    Ok(())
}

fn cmd_devices() -> anyhow::Result<()> {
    let devices = facegate_core::capture::list_devices()?;

    if devices.is_empty() {
        println!("No video devices found");
        return Ok(());
    }
    for device in devices {
        println!("{}", device);
    }

    Ok(())
}

fn cmd_config(config: &Config, validate: bool) -> anyhow::Result<()> {
    if validate {
        config.validate()?;
        println!("✓ Configuration is valid");
        return Ok(());
    }

    println!("Configuration:");
    println!();

    println!("[camera]");
    println!("  device = {:?}", config.camera.device);
    println!("  resolution = {}x{}", config.camera.width, config.camera.height);
    println!("  backends = {:?}", config.camera.backends);
    println!("  mirror = {}", config.camera.mirror);
    println!();

    println!("[detection]");
    println!("  model = {:?}", config.detection.model_path);
    println!(
        "  confidence_threshold = {}",
        config.detection.confidence_threshold
    );
    println!("  min_face_size = {}", config.detection.min_face_size);
    println!();

    println!("[session]");
    println!("  required_dwell = {}s", config.session.required_dwell_secs);
    println!("  completion_quality = {}", config.session.completion_quality);
    println!("  face_lost_grace = {}s", config.session.face_lost_grace_secs);
    println!("  required_stable_frames = {}", config.session.required_stable_frames);
    println!();

    println!("[training]");
    println!("  acceptance_quality = {}", config.training.acceptance_quality);
    println!("  min_samples = {}", config.training.min_samples);
    println!("  forced_sample_count = {}", config.training.forced_sample_count);
    println!();

    println!("[storage]");
    println!("  images_dir = {:?}", config.storage.images_dir);
    println!("  records_dir = {:?}", config.storage.records_dir);
    println!("  models_dir = {:?}", config.storage.models_dir);

    Ok(())
}
