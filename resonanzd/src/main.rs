//! Resonanz Daemon - long-running neurofeedback engine service
//!
//! The daemon owns one engine and exposes its command surface to clients:
//! - command submission (show-random, measure, optimize, execute, measure-program, stop)
//! - status polling (status string, busy flag, engine snapshot)
//! - runtime parameters and model-directory maintenance
//!
//! Protocol: one JSON request per line, one JSON response per line.
//!
//! Storage locations:
//! - Linux: ~/.local/share/resonanz/
//! - Windows: %APPDATA%\Resonanz\
//! - MacOS: ~/Library/Application Support/Resonanz/

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::result::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use resonanz::analysis::{DeltaStatistics, ModelAnalysis};
use resonanz::prelude::*;
use resonanz::program::ProgramStats;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

mod paths;
mod settings;

use paths::AppPaths;
use settings::{DeviceChoice, Settings};

// ═══════════════════════════════════════════════════════════════════════════
// Protocol Messages
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Request {
    GetStatus,
    GetSignals,
    ShowRandom {
        #[serde(default)]
        media: Option<MediaSources>,
    },
    Measure {
        #[serde(default)]
        media: Option<MediaSources>,
    },
    Optimize {
        #[serde(default)]
        media: Option<MediaSources>,
    },
    Execute {
        #[serde(default)]
        media: Option<MediaSources>,
        targets: Vec<SignalTarget>,
        #[serde(default)]
        flags: ExecuteFlags,
    },
    MeasureProgram {
        media_file: PathBuf,
        signals: Vec<String>,
        length: usize,
    },
    Stop,
    SetParameter {
        name: String,
        value: String,
    },
    GetConfig,
    GetMeasuredProgram,
    InvalidateMeasuredProgram,
    GetProgramStats,
    AnalyzeModels {
        #[serde(default)]
        media: Option<MediaSources>,
    },
    DeltaStatistics {
        #[serde(default)]
        media: Option<MediaSources>,
    },
    DeleteModelData {
        #[serde(default)]
        model_dir: Option<PathBuf>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Response {
    Status(StatusReply),
    Signals { device_id: String, names: Vec<String> },
    Config(EngineConfig),
    MeasuredProgram { program: Option<Vec<Vec<f32>>> },
    ProgramStats(ProgramStats),
    Analysis(ModelAnalysis),
    Deltas(DeltaStatistics),
    Success { message: String },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusReply {
    status: String,
    busy: bool,
    snapshot: EngineSnapshot,
}

// ═══════════════════════════════════════════════════════════════════════════
// Daemon State
// ═══════════════════════════════════════════════════════════════════════════

struct DaemonState {
    engine: Engine,
    paths: AppPaths,
}

impl DaemonState {
    fn new(settings: &Settings, paths: AppPaths) -> Result<Self, EngineError> {
        let device: Box<dyn Device> = match settings.device {
            DeviceChoice::None => Box::new(NoDevice::new(settings.channels)),
            DeviceChoice::Random => Box::new(RandomDevice::new(settings.channels, settings.seed)),
        };
        let presenter = HeadlessPresenter::new().with_sound_parameters(settings.sound_params);
        let mut config = EngineConfig::default();
        config.seed = settings.seed;
        let engine = Engine::start(
            device,
            Box::new(presenter),
            Arc::new(DirCatalog),
            Arc::new(FileStore),
            config,
        )?;
        Ok(Self { engine, paths })
    }

    fn media(&self, media: Option<MediaSources>) -> MediaSources {
        media.unwrap_or_else(|| self.paths.default_media())
    }

    fn status(&self) -> StatusReply {
        StatusReply {
            status: self.engine.status(),
            busy: self.engine.is_busy(),
            snapshot: self.engine.snapshot(),
        }
    }

    fn handle(&self, request: Request) -> Response {
        let accepted = |what: &str, r: resonanz::error::Result<()>| match r {
            Ok(()) => Response::Success {
                message: format!("{what} accepted"),
            },
            Err(e) => Response::Error { message: e.to_string() },
        };
        match request {
            Request::GetStatus => Response::Status(self.status()),
            Request::GetSignals => Response::Signals {
                device_id: self.engine.device_id().to_string(),
                names: self.engine.signal_names().to_vec(),
            },
            Request::ShowRandom { media } => accepted("show-random", self.engine.show_random(self.media(media))),
            Request::Measure { media } => accepted("measure", self.engine.measure(self.media(media))),
            Request::Optimize { media } => accepted("optimize", self.engine.optimize(self.media(media))),
            Request::Execute { media, targets, flags } => {
                accepted("execute", self.engine.execute(self.media(media), targets, flags))
            }
            Request::MeasureProgram {
                media_file,
                signals,
                length,
            } => accepted(
                "measure-program",
                self.engine.measure_program(&media_file, signals, length),
            ),
            Request::Stop => accepted("stop", self.engine.stop()),
            Request::SetParameter { name, value } => match self.engine.set_parameter(&name, &value) {
                Ok(()) => Response::Success {
                    message: format!("{name} = {value}"),
                },
                Err(e) => Response::Error { message: e.to_string() },
            },
            Request::GetConfig => Response::Config(self.engine.config()),
            Request::GetMeasuredProgram => Response::MeasuredProgram {
                program: self.engine.measured_program(),
            },
            Request::InvalidateMeasuredProgram => {
                self.engine.invalidate_measured_program();
                Response::Success {
                    message: "Measured program cleared".to_string(),
                }
            }
            Request::GetProgramStats => Response::ProgramStats(self.engine.program_statistics()),
            Request::AnalyzeModels { media } => match self.engine.analyze_models(&self.media(media)) {
                Ok(a) => Response::Analysis(a),
                Err(e) => Response::Error { message: e.to_string() },
            },
            Request::DeltaStatistics { media } => match self.engine.delta_statistics(&self.media(media)) {
                Ok(d) => Response::Deltas(d),
                Err(e) => Response::Error { message: e.to_string() },
            },
            Request::DeleteModelData { model_dir } => {
                let dir = model_dir.unwrap_or_else(|| self.paths.models_dir());
                match self.engine.delete_model_data(&dir) {
                    Ok(n) => Response::Success {
                        message: format!("Removed {n} files from {}", dir.display()),
                    },
                    Err(e) => Response::Error { message: e.to_string() },
                }
            }
            // Handled by the connection loop.
            Request::Shutdown => Response::Success {
                message: "Shutting down".to_string(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Client Handler
// ═══════════════════════════════════════════════════════════════════════════

/// Engine calls scan catalogs and model directories, so they run on the
/// blocking pool rather than on a runtime worker.
async fn dispatch(state: &Arc<DaemonState>, request: Request) -> Response {
    let state = Arc::clone(state);
    match tokio::task::spawn_blocking(move || state.handle(request)).await {
        Ok(response) => response,
        Err(e) => Response::Error {
            message: format!("Request handler failed: {e}"),
        },
    }
}

async fn handle_client(
    stream: TcpStream,
    state: Arc<DaemonState>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(Request::Shutdown) => {
                info!("Shutdown requested by client");
                shutdown.cancel();
                state.handle(Request::Shutdown)
            }
            Ok(request) => dispatch(&state, request).await,
            Err(e) => Response::Error {
                message: format!("Invalid request: {e}"),
            },
        };

        writer.write_all(serde_json::to_string(&response)?.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════

/// Console output plus a plain-text copy in the data directory.
fn init_logging(paths: &AppPaths) {
    let log_path = paths.log_file();
    let (file_layer, open_error) = match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
            None,
        ),
        Err(e) => (None, Some(e)),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    match open_error {
        None => info!("Logging to {:?}", log_path),
        Some(e) => warn!("Log file {:?} unavailable: {}", log_path, e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::from_env()?;
    let paths = AppPaths::new()?;
    init_logging(&paths);
    info!("Data directory: {:?}", paths.data_dir());
    info!("Model directory: {:?}", paths.models_dir());

    let state = Arc::new(DaemonState::new(&settings, paths)?);
    let shutdown = CancellationToken::new();

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received");
                shutdown.cancel();
            }
        });
    }

    let listener = TcpListener::bind(settings.addr).await?;
    info!("Resonanz daemon listening on {}", settings.addr);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                info!("Client connected: {}", addr);
                let state = Arc::clone(&state);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, state, shutdown).await {
                        error!("Client handler error: {}", e);
                    }
                });
            }
        }
    }

    // Let the last response flush, then stop the engine off the async runtime.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let joined = tokio::task::spawn_blocking(move || state.engine.shutdown(Duration::from_secs(5))).await?;
    if let Err(e) = joined {
        warn!("Engine did not stop cleanly: {}", e);
    }
    info!("Resonanz daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(tag: &str) -> (Arc<DaemonState>, PathBuf) {
        let root = std::env::temp_dir().join(format!("resonanzd-{tag}-{}", std::process::id()));
        let paths = AppPaths::at(root.clone()).unwrap();
        let settings = Settings {
            addr: "127.0.0.1:0".parse().unwrap(),
            device: DeviceChoice::None,
            channels: 2,
            sound_params: 0,
            seed: Some(1),
        };
        (Arc::new(DaemonState::new(&settings, paths).unwrap()), root)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn requests_are_served_from_the_blocking_pool() {
        let (state, root) = state("dispatch");
        match dispatch(&state, Request::GetSignals).await {
            Response::Signals { names, .. } => assert_eq!(names.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        // The default picture directory is empty, so there is nothing to show.
        match dispatch(&state, Request::Measure { media: None }).await {
            Response::Error { .. } | Response::Success { .. } => {}
            other => panic!("unexpected {other:?}"),
        }
        match dispatch(&state, Request::Stop).await {
            Response::Success { message } => assert!(message.contains("stop")),
            other => panic!("unexpected {other:?}"),
        }
        state.engine.shutdown(Duration::from_secs(2)).unwrap();
        std::fs::remove_dir_all(&root).unwrap();
    }
}
