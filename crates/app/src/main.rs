use std::{cell::RefCell, path::PathBuf, rc::Rc};

use clap::{Parser, Subcommand};
use companion_core::{
    lipsync::SharedTarget, AppConfig, Clock, Emotion, FileFetcher, LipSyncController,
    LipSyncTarget, LoadTicket, ManualClock, ModelProbe, ModelViewer, OpenOutcome, Phoneme,
    PhonemeSource, PinyinPhonemes, RendererRegistry, SystemClock, TickStatus,
};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> companion_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::from_json_file(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Probe { path } => run_probe(config, path).await,
        Commands::Inspect { path, emotion } => run_inspect(config, path, emotion).await,
        Commands::Lipsync {
            text,
            pinyin,
            step_ms,
        } => run_lipsync(config, &text, pinyin, step_ms),
    }
}

async fn run_probe(config: AppConfig, path: PathBuf) -> companion_core::Result<()> {
    let probe = ModelProbe::inspect(
        &path,
        Rc::new(FileFetcher),
        LoadTicket::detached(),
        config.viewer.load_timeout_ms,
    )
    .await?;
    let registry = RendererRegistry::with_defaults();
    match registry.select(&probe) {
        Some(name) => println!("{name}"),
        None => {
            tracing::warn!(path = %path.display(), "no renderer accepts this file");
            println!("unsupported");
        }
    }
    Ok(())
}

async fn run_inspect(
    config: AppConfig,
    path: PathBuf,
    emotion: Option<Emotion>,
) -> companion_core::Result<()> {
    tracing::info!(path = %path.display(), "inspecting model");
    let viewer = ModelViewer::new(
        config,
        RendererRegistry::with_defaults(),
        Rc::new(FileFetcher),
        Rc::new(SystemClock::new()),
    );

    let metadata = match viewer.open(&path).await? {
        OpenOutcome::Opened(metadata) => metadata,
        OpenOutcome::Unsupported | OpenOutcome::Superseded => {
            println!("unsupported");
            return Ok(());
        }
    };

    let Some((capabilities, parts, expression)) = viewer.with_renderer(|renderer| {
        let parts = renderer
            .outfit()
            .map(|outfit| outfit.outfit_parts())
            .unwrap_or_default();
        let expression = emotion.and_then(|emotion| renderer.set_from_emotion(emotion));
        (renderer.capabilities(), parts, expression)
    }) else {
        return Ok(());
    };

    let report = serde_json::json!({
        "model": metadata,
        "capabilities": capabilities,
        "outfit": parts,
        "emotion": emotion.map(|emotion| serde_json::json!({
            "emotion": emotion,
            "expression": expression,
        })),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    viewer.close();
    Ok(())
}

/// Records every mouth change with the simulated time it happened at.
struct PrintedMouth {
    clock: Rc<ManualClock>,
}

impl LipSyncTarget for PrintedMouth {
    fn set_mouth_shape(&mut self, phoneme: Phoneme, weight: f32) {
        println!(
            "{}",
            serde_json::json!({ "t": self.clock.now_ms(), "phoneme": phoneme, "weight": weight })
        );
    }

    fn reset_mouth(&mut self) {
        println!(
            "{}",
            serde_json::json!({ "t": self.clock.now_ms(), "phoneme": Phoneme::Closed, "weight": 0.0 })
        );
    }
}

fn run_lipsync(
    config: AppConfig,
    text: &str,
    pinyin: bool,
    step_ms: f64,
) -> companion_core::Result<()> {
    let clock = Rc::new(ManualClock::default());
    let target: SharedTarget = Rc::new(RefCell::new(PrintedMouth {
        clock: clock.clone(),
    }));
    let mut controller = LipSyncController::new(config.lip_sync, clock.clone())
        .with_handoff(config.viewer.target_handoff);
    controller.set_target(Some(Rc::downgrade(&target)));

    if pinyin {
        let tags = PinyinPhonemes.tags(text);
        tracing::info!(?tags, "tagged text");
        controller.process_chunk_with_phonemes(text, Some(&tags));
    } else {
        controller.process_chunk(text);
    }
    controller.on_complete();

    let step_ms = step_ms.max(1.0);
    // A closing frame plus the grace window always ends playback well before
    // this bound.
    let limit = (text.chars().count() as f64 + 100.0) * 1_000.0;
    while clock.now_ms() < limit {
        clock.advance(step_ms);
        if controller.tick() == TickStatus::Idle {
            break;
        }
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Desktop companion model tools", long_about = None)]
struct Cli {
    /// JSON configuration file; defaults apply to anything it leaves out.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print which renderer would handle a model file.
    Probe {
        path: PathBuf,
    },
    /// Load a model and print its metadata as JSON.
    Inspect {
        path: PathBuf,
        /// Also resolve the expression shown for this emotion.
        #[arg(short, long)]
        emotion: Option<Emotion>,
    },
    /// Simulate lip sync for a piece of text and print each mouth change.
    Lipsync {
        text: String,
        /// Tag the text through pinyin finals instead of the character heuristic.
        #[arg(long)]
        pinyin: bool,
        /// Simulated frame interval.
        #[arg(long, default_value_t = 16.0)]
        step_ms: f64,
    },
}
