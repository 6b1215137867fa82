//! Reference host: generates one material from the command line.
//!
//! ```text
//! texforge-worker "weathered oak planks" [checkpoint]
//! ```
//!
//! Reads [`PipelineConfig`] from the environment (and `.env`). Extra
//! variables:
//!
//! | Env Var                | Meaning                                        |
//! |------------------------|------------------------------------------------|
//! | `TEXFORGE_CHECKPOINT`  | Checkpoint when not given as an argument       |
//! | `TEXFORGE_MAPS`        | Comma-separated maps for texture-only output   |
//! | `TEXFORGE_OUTPUT_DIR`  | Directory to write the finished images into    |

use std::path::PathBuf;

use anyhow::{bail, Context};
use texforge_comfyui::events::GenerationEvent;
use texforge_core::job::JobState;
use texforge_core::materializer::{MaterializeRequest, ResultMaterializer};
use texforge_core::params::{GenerationInputs, OutputKind, TextureMap};
use texforge_pipeline::{GenerationSession, PipelineConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Logs the control group and optionally writes the images to disk.
struct FileMaterializer {
    output_dir: Option<PathBuf>,
}

impl ResultMaterializer for FileMaterializer {
    type Output = Vec<PathBuf>;
    type Error = std::io::Error;

    fn materialize(&mut self, request: MaterializeRequest<'_>) -> Result<Self::Output, Self::Error> {
        if let Some(group) = request.control_group() {
            for (socket, value) in group {
                tracing::info!(material = request.name, socket, ?value, "Control");
            }
        }

        let Some(dir) = &self.output_dir else {
            return Ok(Vec::new());
        };
        std::fs::create_dir_all(dir)?;

        let mut written = Vec::new();
        for (index, (map, asset)) in request.maps().enumerate() {
            let file = match map {
                Some(map) => format!("{}_{}.png", request.name, map.as_str()),
                None if index == 0 => format!("{}.png", request.name),
                None => format!("{}_{index}.png", request.name),
            };
            let path = dir.join(file);
            std::fs::write(&path, &asset.bytes)?;
            tracing::info!(path = %path.display(), width = asset.width, height = asset.height, "Wrote image");
            written.push(path);
        }
        Ok(written)
    }
}

fn parse_maps(raw: &str) -> anyhow::Result<Vec<TextureMap>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            serde_json::from_value(serde_json::Value::String(s.to_string()))
                .with_context(|| format!("unknown texture map {s:?}"))
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "texforge_worker=debug,texforge_pipeline=debug,texforge_comfyui=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let mut inputs = GenerationInputs::default();
    if let Some(prompt) = args.next() {
        inputs.params.prompt = prompt;
    }
    inputs.params.checkpoint = match args.next().or_else(|| std::env::var("TEXFORGE_CHECKPOINT").ok()) {
        Some(checkpoint) => checkpoint,
        None => bail!("no checkpoint given (argument or TEXFORGE_CHECKPOINT)"),
    };
    if let Ok(raw) = std::env::var("TEXFORGE_MAPS") {
        let maps = parse_maps(&raw)?;
        if !maps.is_empty() {
            inputs.output = OutputKind::TextureOnly { maps };
        }
    }

    let config = PipelineConfig::from_env()?;
    let mut session = GenerationSession::new(config)?;

    let mut events = session.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                GenerationEvent::JobProgress { fraction, .. } => {
                    tracing::info!(percent = (fraction * 100.0).round(), "Progress");
                }
                other => tracing::debug!(event = ?other, "Generation event"),
            }
        }
    });

    let backend = session.connect(None).await?;
    tracing::info!(
        url = %backend.url,
        checkpoints = backend.capabilities.checkpoints().count(),
        "Connected",
    );

    let mut handle = session.generate(&inputs).await?;
    tracing::info!(
        request_id = %handle.request().id,
        seed = handle.request().seed(),
        prompt = %handle.request().bound.effective_prompt,
        "Generating",
    );

    let state = tokio::select! {
        state = session.wait(&mut handle) => state?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, cancelling job");
            session.cancel(&mut handle).await?;
            JobState::Cancelled
        }
    };
    if state != JobState::Succeeded {
        session.shutdown().await;
        bail!("generation ended {state}");
    }

    let finished = session.finish(&mut handle).await?;
    let mut materializer = FileMaterializer {
        output_dir: std::env::var("TEXFORGE_OUTPUT_DIR").ok().map(PathBuf::from),
    };
    let written = session.materialize(&mut materializer, &finished)?;
    tracing::info!(
        entry_id = finished.entry_id,
        images = finished.assets.len(),
        written = written.len(),
        "Generation finished",
    );

    session.shutdown().await;
    Ok(())
}
