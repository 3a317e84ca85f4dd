use presence_core::{
    AttendanceLedger, AttendanceUpdate, EmbeddingExtractor, ExtractionError, Gallery,
    GalleryError, OnnxExtractor, PipelineError, RecognitionBatch, RecognitionPipeline, RgbImage,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;

/// Requests queued ahead of the engine before callers wait on `send`.
const ENGINE_QUEUE_DEPTH: usize = 4;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model error: {0}")]
    Extractor(#[from] ExtractionError),
    #[error("gallery error: {0}")]
    Gallery(#[from] GalleryError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("cannot spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Recognize {
        image: RgbImage,
        reply: oneshot::Sender<Result<RecognitionBatch, PipelineError>>,
    },
    MarkAttendance {
        image: RgbImage,
        reply: oneshot::Sender<Result<AttendanceUpdate, PipelineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    gallery: Arc<Gallery>,
}

impl EngineHandle {
    /// Classify every face in `image`; attendance is left alone.
    pub async fn recognize(&self, image: RgbImage) -> Result<RecognitionBatch, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Recognize {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Mark every recognized face in `image` present.
    pub async fn mark_attendance(&self, image: RgbImage) -> Result<AttendanceUpdate, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::MarkAttendance {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// The gallery the engine matches against.
    pub fn gallery(&self) -> &Arc<Gallery> {
        &self.gallery
    }
}

/// Load the gallery and both ONNX models, then spawn the engine.
///
/// Fails fast at startup if any artifact is unavailable.
pub fn spawn_engine(config: &Config, ledger: Arc<AttendanceLedger>) -> Result<EngineHandle, EngineError> {
    let gallery = Arc::new(Gallery::load(&config.gallery_path(), &config.labels_path())?);
    tracing::info!(
        entries = gallery.len(),
        known_students = gallery.known_students().len(),
        "gallery loaded"
    );

    let scrfd_path = config.scrfd_model_path();
    let facenet_path = config.facenet_model_path();
    let extractor = OnnxExtractor::load(&scrfd_path, &facenet_path)?;
    tracing::info!(scrfd = %scrfd_path, facenet = %facenet_path, "models loaded");

    let pipeline = RecognitionPipeline::new(extractor, gallery, config.pipeline.clone());
    tracing::info!(vote_neighbors = pipeline.vote_neighbors(), "commit vote size");
    spawn(pipeline, ledger)
}

/// Run `pipeline` on a dedicated OS thread, serving requests in arrival order.
pub fn spawn<E>(
    mut pipeline: RecognitionPipeline<E>,
    ledger: Arc<AttendanceLedger>,
) -> Result<EngineHandle, EngineError>
where
    E: EmbeddingExtractor + Send + 'static,
{
    let gallery = Arc::clone(pipeline.gallery());
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(ENGINE_QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("presence-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Recognize { image, reply } => {
                        let _ = reply.send(pipeline.recognize(&image));
                    }
                    EngineRequest::MarkAttendance { image, reply } => {
                        let _ = reply.send(pipeline.mark_attendance(&image, &ledger));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, gallery })
}
