use chrono::{Local, NaiveDateTime};
use image::DynamicImage;
use roster_core::{
    Announcer, CaptureError, CheckInOutcome, FaceError, GalleryEntry, ImageSource, MatchResult, RegistrationError,
    RosterService, ServiceConfig, ServiceError, Silent, StorageError,
};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::camera::{CameraSettings, CameraSource};
use crate::config::Config;
use crate::speech::{SpeechQueue, SpeechSettings};
use crate::store::SqliteAttendanceStore;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Face(#[from] FaceError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("attendance database: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Where the engine gets the picture for a request.
pub enum ImageInput {
    Camera,
    Still(DynamicImage),
}

/// Snapshot of the loaded service.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub strategy: String,
    pub signature: String,
    pub detector: String,
    pub min_face_size: u32,
    pub gallery_dir: PathBuf,
    pub cache_path: PathBuf,
    pub identities: usize,
}

/// Messages sent from the command handlers to the engine thread.
enum EngineRequest {
    Register {
        identity: String,
        input: ImageInput,
        reply: oneshot::Sender<Result<GalleryEntry, EngineError>>,
    },
    Recognize {
        input: ImageInput,
        reply: oneshot::Sender<Result<Vec<MatchResult>, EngineError>>,
    },
    CheckIn {
        input: ImageInput,
        reply: oneshot::Sender<Result<Vec<CheckInOutcome>, EngineError>>,
    },
    List {
        reply: oneshot::Sender<Vec<String>>,
    },
    Remove {
        identity: String,
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    Rebuild {
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn register(&self, identity: String, input: ImageInput) -> Result<GalleryEntry, EngineError> {
        self.call(|reply| EngineRequest::Register { identity, input, reply }).await?
    }

    pub async fn recognize(&self, input: ImageInput) -> Result<Vec<MatchResult>, EngineError> {
        self.call(|reply| EngineRequest::Recognize { input, reply }).await?
    }

    pub async fn check_in(&self, input: ImageInput) -> Result<Vec<CheckInOutcome>, EngineError> {
        self.call(|reply| EngineRequest::CheckIn { input, reply }).await?
    }

    pub async fn list(&self) -> Result<Vec<String>, EngineError> {
        self.call(|reply| EngineRequest::List { reply }).await
    }

    pub async fn remove(&self, identity: String) -> Result<usize, EngineError> {
        self.call(|reply| EngineRequest::Remove { identity, reply }).await?
    }

    pub async fn rebuild(&self) -> Result<usize, EngineError> {
        self.call(|reply| EngineRequest::Rebuild { reply }).await?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await
    }
}

/// Everything the engine thread builds its state from.
struct EngineSetup {
    service: ServiceConfig,
    db_path: PathBuf,
    camera: CameraSettings,
    speech: Option<SpeechSettings>,
}

/// Spawn the engine on a dedicated OS thread.
///
/// The face models, the gallery, the attendance database and the camera
/// all live on that thread. Resolves once the gallery is loaded, or with
/// the startup error.
pub async fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let setup = EngineSetup {
        service: config.service_config(),
        db_path: config.db_path.clone(),
        camera: config.camera_settings(),
        speech: config.audio.enable_audio.then(|| config.speech_settings()),
    };

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), EngineError>>();

    std::thread::Builder::new()
        .name("roster-engine".into())
        .spawn(move || {
            let (mut service, mut camera) = match start(setup) {
                Ok(parts) => {
                    let _ = ready_tx.send(Ok(()));
                    parts
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                handle(&mut service, &mut camera, req);
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    ready_rx.await.map_err(|_| EngineError::ChannelClosed)??;
    Ok(EngineHandle { tx })
}

fn start(setup: EngineSetup) -> Result<(RosterService, CameraSource), EngineError> {
    let store = SqliteAttendanceStore::open(&setup.db_path)?;
    tracing::info!(path = %setup.db_path.display(), "attendance database ready");

    let announcer: Box<dyn Announcer> = match setup.speech {
        Some(settings) => Box::new(SpeechQueue::new(settings)),
        None => {
            tracing::info!("audio feedback disabled");
            Box::new(Silent)
        }
    };

    let service = RosterService::open(&setup.service, Box::new(store), announcer)?;
    tracing::info!(
        strategy = %service.kind(),
        identities = service.gallery().len(),
        "roster service ready"
    );

    Ok((service, CameraSource::new(setup.camera)))
}

fn handle(service: &mut RosterService, camera: &mut CameraSource, req: EngineRequest) {
    match req {
        EngineRequest::Register { identity, input, reply } => {
            let result = capture(camera, input).and_then(|image| Ok(service.register(&identity, &image)?));
            let _ = reply.send(result);
        }
        EngineRequest::Recognize { input, reply } => {
            let result = match input {
                ImageInput::Camera => service.recognize_from(camera),
                ImageInput::Still(image) => service.recognize(&image),
            };
            let _ = reply.send(result.map_err(EngineError::from));
        }
        EngineRequest::CheckIn { input, reply } => {
            let now = now();
            let result = match input {
                ImageInput::Camera => service.check_in_from(camera, now),
                ImageInput::Still(image) => service.check_in(&image, now),
            };
            let _ = reply.send(result.map_err(EngineError::from));
        }
        EngineRequest::List { reply } => {
            let _ = reply.send(service.list_identities());
        }
        EngineRequest::Remove { identity, reply } => {
            let _ = reply.send(service.remove(&identity).map_err(EngineError::from));
        }
        EngineRequest::Rebuild { reply } => {
            let _ = reply.send(service.rebuild().map_err(EngineError::from));
        }
        EngineRequest::Status { reply } => {
            let gallery = service.gallery();
            let pipeline = gallery.pipeline();
            let _ = reply.send(EngineStatus {
                strategy: gallery.kind().to_string(),
                signature: pipeline.signature(),
                detector: pipeline.detector_name().to_string(),
                min_face_size: pipeline.min_face_size(),
                gallery_dir: gallery.dir().to_path_buf(),
                cache_path: gallery.cache_path(),
                identities: gallery.len(),
            });
        }
    }
}

/// Registration needs a frame; unlike recognition a failed capture is an error.
fn capture(camera: &mut CameraSource, input: ImageInput) -> Result<DynamicImage, EngineError> {
    match input {
        ImageInput::Still(image) => Ok(image),
        ImageInput::Camera => Ok(camera.capture()?),
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}
