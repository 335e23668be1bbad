use rollcall_core::{ExtractError, FaceExtractor, FaceObservation};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("extraction exceeded its {0:?} budget")]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
}

/// Messages sent from service calls to the engine thread.
enum EngineRequest {
    Extract {
        photo: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<FaceObservation>, ExtractError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    budget: Duration,
}

impl EngineHandle {
    /// Detect faces and compute their signatures.
    ///
    /// Waiting is bounded by the extraction budget; a late result is
    /// discarded and reported as [`EngineError::Timeout`].
    pub async fn extract(&self, photo: Vec<u8>) -> Result<Vec<FaceObservation>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let round_trip = async {
            self.tx
                .send(EngineRequest::Extract {
                    photo,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            let faces = reply_rx.await.map_err(|_| EngineError::ChannelClosed)??;
            Ok::<_, EngineError>(faces)
        };

        match tokio::time::timeout(self.budget, round_trip).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(self.budget)),
        }
    }
}

/// Spawn the extraction engine on a dedicated OS thread.
///
/// The extractor is owned by the thread and serves one photo at a time.
pub fn spawn_engine(
    mut extractor: Box<dyn FaceExtractor>,
    budget: Duration,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Extract { photo, reply } => {
                        if reply.is_closed() {
                            tracing::debug!("caller gave up before extraction; skipping");
                            continue;
                        }
                        let started = std::time::Instant::now();
                        let result = extractor.extract(&photo);
                        tracing::debug!(
                            bytes = photo.len(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            faces = result.as_ref().map(|f| f.len()).ok(),
                            "extraction finished"
                        );
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, budget })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{FaceRegion, Signature};

    struct CountingExtractor;

    impl FaceExtractor for CountingExtractor {
        fn extract(&mut self, photo: &[u8]) -> Result<Vec<FaceObservation>, ExtractError> {
            if photo.is_empty() {
                return Err(ExtractError::Backend("empty photo".into()));
            }
            Ok((0..photo.len())
                .map(|index| FaceObservation {
                    index,
                    region: FaceRegion {
                        x: 0.0,
                        y: 0.0,
                        width: 10.0,
                        height: 10.0,
                        confidence: 0.9,
                    },
                    signature: Signature::new(vec![1.0]),
                })
                .collect())
        }
    }

    struct SleepyExtractor(Duration);

    impl FaceExtractor for SleepyExtractor {
        fn extract(&mut self, _photo: &[u8]) -> Result<Vec<FaceObservation>, ExtractError> {
            std::thread::sleep(self.0);
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_extract_round_trip() {
        let engine = spawn_engine(Box::new(CountingExtractor), Duration::from_secs(5)).unwrap();
        let faces = engine.extract(vec![1, 2, 3]).await.unwrap();
        assert_eq!(faces.len(), 3);
        assert_eq!(faces[2].index, 2);
    }

    #[tokio::test]
    async fn test_extract_error_propagates() {
        let engine = spawn_engine(Box::new(CountingExtractor), Duration::from_secs(5)).unwrap();
        let err = engine.extract(Vec::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Extract(ExtractError::Backend(_))));
    }

    #[tokio::test]
    async fn test_extract_timeout() {
        let engine = spawn_engine(
            Box::new(SleepyExtractor(Duration::from_millis(300))),
            Duration::from_millis(20),
        )
        .unwrap();
        let err = engine.extract(vec![0]).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }
}
