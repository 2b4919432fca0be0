//! One-job-at-a-time guard over capture and replay, with the strings the
//! HTTP traffic endpoints return.

use crate::capture::{Capture, CaptureConfig};
use crate::replay::{Replay, ReplayConfig};
use crate::{Result, TrafficError};

#[derive(Default)]
pub struct JobManager {
    capture: Capture,
    replay: Replay,
}

impl JobManager {
    pub fn new() -> Self {
        JobManager {
            capture: Capture::new(),
            replay: Replay::new(),
        }
    }

    pub fn capture(&self) -> &Capture {
        &self.capture
    }

    pub fn replay(&self) -> &Replay {
        &self.replay
    }

    pub fn start_capture(&self, cfg: CaptureConfig) -> Result<()> {
        if self.replay.is_running() {
            return Err(TrafficError::JobRunning("replay".to_owned()));
        }
        self.capture.start(cfg)
    }

    pub fn start_replay(&self, cfg: ReplayConfig) -> Result<()> {
        if self.capture.is_running() {
            return Err(TrafficError::JobRunning("capture".to_owned()));
        }
        self.replay.start(cfg)
    }

    /// Cancels whichever job is running.
    pub fn stop(&self) -> &'static str {
        if self.capture.is_running() {
            self.capture.stop(Some("manually stopped".to_owned()));
        }
        if self.replay.is_running() {
            self.replay.stop(Some("manually stopped".to_owned()));
        }
        "stopped"
    }

    /// One line describing the current job, empty when none runs. Served by
    /// the traffic `show` endpoint.
    pub fn jobs(&self) -> String {
        if self.capture.is_running() {
            let (progress, err) = self.capture.progress();
            let output = self
                .capture
                .output()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            return match err {
                Some(err) => format!("capture, output: {output}, err: {err}"),
                None => format!("capture, output: {output}, progress: {:.0}%", progress * 100.0),
            };
        }
        if self.replay.is_running() {
            let (progress, err) = self.replay.progress();
            let input = self
                .replay
                .input()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            return match err {
                Some(err) => format!("replay, input: {input}, err: {err}"),
                None => format!("replay, input: {input}, progress: {:.0}%", progress * 100.0),
            };
        }
        String::new()
    }

    pub async fn close(&self) {
        self.capture.close().await;
        self.replay.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capture_blocks_replay_and_vice_versa() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = JobManager::new();
        mgr.start_capture(CaptureConfig::new(dir.path().join("out")))
            .unwrap();
        assert!(mgr.jobs().starts_with("capture"));

        let replay_cfg = ReplayConfig {
            input: dir.path().to_path_buf(),
            username: "u".to_owned(),
            backend_addr: "127.0.0.1:4000".to_owned(),
            ..Default::default()
        };
        assert!(matches!(
            mgr.start_replay(replay_cfg),
            Err(TrafficError::JobRunning(_))
        ));

        assert_eq!(mgr.stop(), "stopped");
        mgr.close().await;
        assert!(mgr.jobs().is_empty());
    }
}
