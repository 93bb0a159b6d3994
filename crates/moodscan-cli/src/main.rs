use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use moodscan_core::{AnalyzeOptions, DetectorBackend, EmotionAnalyzer, OnnxEmotionAnalyzer};
use serde_json::Value;
use std::path::{Path, PathBuf};

const DEFAULT_URL: &str = "http://127.0.0.1:6969";

#[derive(Parser)]
#[command(name = "moodscan", about = "moodscan facial emotion analysis CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyse an image locally, without the daemon
    Analyze {
        /// Image file to analyse
        image: PathBuf,
        /// Directory containing the ONNX models
        #[arg(long)]
        model_dir: Option<PathBuf>,
        /// Face detector to run before classification (scrfd or skip)
        #[arg(long, default_value = "scrfd")]
        detector: DetectorBackend,
        /// Fail when no face is detected instead of analysing the whole image
        #[arg(long)]
        enforce_detection: bool,
        /// Print full per-face results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Upload an image to a running moodscand and print the dominant emotion
    Predict {
        /// Image file to upload
        image: PathBuf,
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },
    /// Show daemon status
    Status {
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze { image, model_dir, detector, enforce_detection, json } => {
            let model_dir = model_dir.unwrap_or_else(moodscan_core::default_model_dir);
            analyze(&image, &model_dir, detector, enforce_detection, json)
        }
        Commands::Predict { image, url } => predict(&image, &url).await,
        Commands::Status { url } => status(&url).await,
    }
}

fn analyze(
    image: &Path,
    model_dir: &Path,
    detector: DetectorBackend,
    enforce_detection: bool,
    json: bool,
) -> Result<()> {
    let mut analyzer = OnnxEmotionAnalyzer::load(model_dir, detector, 1)
        .with_context(|| format!("failed to load models from {}", model_dir.display()))?;
    let faces = analyzer.analyze(image, &AnalyzeOptions { enforce_detection })?;
    tracing::debug!(faces = faces.len(), "analysis complete");

    if json {
        println!("{}", serde_json::to_string_pretty(&faces)?);
        return Ok(());
    }

    for (i, face) in faces.iter().enumerate() {
        let region = face.region;
        println!(
            "face {i}: {} ({:.1}%) at {}x{}+{}+{}",
            face.dominant_emotion,
            face.emotion.get(face.dominant_emotion),
            region.w,
            region.h,
            region.x,
            region.y,
        );
    }
    Ok(())
}

async fn predict(image: &Path, url: &str) -> Result<()> {
    let filename = image
        .file_name()
        .and_then(|n| n.to_str())
        .context("image path has no usable file name")?
        .to_string();
    let bytes = tokio::fs::read(image)
        .await
        .with_context(|| format!("failed to read {}", image.display()))?;

    let part = reqwest::multipart::Part::bytes(bytes).file_name(filename);
    let form = reqwest::multipart::Form::new().part("file", part);

    let response = reqwest::Client::new()
        .post(endpoint(url, "predict"))
        .multipart(form)
        .send()
        .await
        .with_context(|| format!("failed to reach moodscand at {url}"))?;
    let status = response.status();
    let body: Value = response.json().await.context("invalid response body")?;

    if !status.is_success() {
        bail!("{status}: {}", field(&body, "detail"));
    }
    println!("{}", field(&body, "result"));
    Ok(())
}

async fn status(url: &str) -> Result<()> {
    let body: Value = match reqwest::get(endpoint(url, "health")).await {
        Ok(response) => response.error_for_status()?.json().await?,
        Err(e) => {
            tracing::debug!(error = %e, "health request failed");
            println!("moodscand: not reachable at {url}");
            return Ok(());
        }
    };
    println!(
        "moodscand {} ({}), detector: {}",
        field(&body, "version"),
        field(&body, "status"),
        field(&body, "detector"),
    );
    Ok(())
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{path}", base.trim_end_matches('/'))
}

fn field<'a>(body: &'a Value, key: &str) -> &'a str {
    body.get(key).and_then(Value::as_str).unwrap_or("<missing>")
}
