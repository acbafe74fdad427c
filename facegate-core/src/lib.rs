pub mod capture;
pub mod config;
pub mod detect;
pub mod lbph;
pub mod native;
pub mod quality;
pub mod record;
pub mod session;
pub mod stability;
pub mod store;
pub mod stream;
pub mod training;
pub mod vision;

#[cfg(test)]
pub(crate) mod testing;

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect as DrawRect;
use session::{LoginReport, LoginSession, SessionError, SessionStatus, TickOutcome};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};
use store::{ModelStore, SavedModel};
use stream::{CameraBackend, FrameSource, StreamSettings};
use thiserror::Error;
use vision::{select_best, training_patch, Prediction, Rect, VisionProvider};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Camera error: {0}")]
    Capture(#[from] capture::CaptureError),
    #[error("Vision error: {0}")]
    Vision(#[from] vision::VisionError),
    #[error("Storage error: {0}")]
    Storage(#[from] store::StorageError),
    #[error("Training error: {0}")]
    Training(#[from] training::TrainingError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("No face detected in frame")]
    NoFaceInFrame,
    #[error("{0}")]
    Other(String),
}

/// Process-facing controls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartCapture,
    StopCapture,
    Reset,
    Train,
    SaveModel,
    MinimalModel,
    LoadModel,
    Status,
    Quit,
}

#[derive(Debug, Clone)]
pub enum Response {
    Ack,
    Status(SessionStatus),
    ModelSaved(SavedModel),
    ModelLoaded(PathBuf),
    Quit,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    LoggedIn(LoginReport),
    Quit,
    /// The camera stopped delivering frames and could not be reopened
    CameraLost,
}

/// One camera feeding one login session
pub struct FaceLogin {
    config: config::Config,
    source: FrameSource,
    session: LoginSession,
    last_seq: Option<u64>,
    capture_wanted: bool,
}

impl FaceLogin {
    /// Wire up the V4L2 camera and the native vision provider
    pub fn new(config: config::Config) -> Result<Self, Error> {
        let backends = capture::V4lBackend::from_config(&config.camera)?;
        let vision = native::NativeVision::new(&config.detection);
        Ok(Self::with_parts(config, backends, Box::new(vision)))
    }

    pub fn with_parts(
        config: config::Config,
        backends: Vec<Box<dyn CameraBackend>>,
        vision: Box<dyn VisionProvider>,
    ) -> Self {
        let source = FrameSource::new(backends, StreamSettings::from(&config.camera));
        let session = LoginSession::new(&config, vision);

        Self {
            config,
            source,
            session,
            last_seq: None,
            capture_wanted: false,
        }
    }

    pub fn session(&self) -> &LoginSession {
        &self.session
    }

    pub fn start_capture(&mut self) -> Result<(), Error> {
        self.source.start()?;
        self.capture_wanted = true;
        Ok(())
    }

    pub fn stop_capture(&mut self) {
        self.capture_wanted = false;
        self.source.release();
        self.last_seq = None;
    }

    /// Process the newest frame if it has not been seen yet
    pub fn step(&mut self, now: Instant) -> Option<TickOutcome> {
        let frame = self.source.get_frame()?;
        if self.last_seq == Some(frame.seq) {
            return None;
        }
        self.last_seq = Some(frame.seq);

        let image = self.oriented(frame.image);
        Some(self.session.tick(&image, now))
    }

    pub fn handle(&mut self, command: Command) -> Result<Response, Error> {
        log::debug!("Handling command {:?}", command);

        let response = match command {
            Command::StartCapture => {
                self.start_capture()?;
                Response::Ack
            }
            Command::StopCapture => {
                self.stop_capture();
                Response::Ack
            }
            Command::Reset => {
                self.session.reset();
                Response::Ack
            }
            Command::Train => Response::ModelSaved(self.session.force_train()?),
            Command::SaveModel => Response::ModelSaved(self.session.force_save()?),
            Command::MinimalModel => Response::ModelSaved(self.session.force_minimal_model()?),
            Command::LoadModel => Response::ModelLoaded(self.session.load_latest_model()?),
            Command::Status => Response::Status(self.session.status(Instant::now())),
            Command::Quit => Response::Quit,
        };

        Ok(response)
    }

    /// Drive the session until login completes, `Quit` arrives or the camera
    /// is gone for good. `report` sees every command response.
    pub fn run<F>(&mut self, commands: &Receiver<Command>, mut report: F) -> Result<RunOutcome, Error>
    where
        F: FnMut(&Response),
    {
        if let Err(e) = self.start_capture() {
            log::error!("Failed to start camera: {}", e);
            self.stop_capture();
            return Err(e);
        }
        log::info!("Face login started");

        let poll = self.config.session.poll_interval();

        loop {
            if self.drain_commands(commands, &mut report) {
                self.stop_capture();
                return Ok(RunOutcome::Quit);
            }

            if self.capture_wanted && !self.source.is_running() {
                log::error!("Camera stopped delivering frames");
                self.stop_capture();
                return Ok(RunOutcome::CameraLost);
            }

            if let Some(TickOutcome::LoginCompleted(login)) = self.step(Instant::now()) {
                self.hold_success(commands, &mut report);
                self.stop_capture();
                return Ok(RunOutcome::LoggedIn(login));
            }

            thread::sleep(poll);
        }
    }

    /// Keep the success state visible for the configured window; `Quit`
    /// cuts it short
    fn hold_success<F: FnMut(&Response)>(&mut self, commands: &Receiver<Command>, report: &mut F) {
        let deadline = Instant::now() + self.config.session.success_hold();
        let poll = self.config.session.poll_interval().max(Duration::from_millis(1));

        while Instant::now() < deadline {
            if self.drain_commands(commands, report) {
                return;
            }
            thread::sleep(poll);
        }
    }

    /// Handle every pending command; true when `Quit` was among them
    fn drain_commands<F: FnMut(&Response)>(&mut self, commands: &Receiver<Command>, report: &mut F) -> bool {
        loop {
            let command = match commands.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return false,
            };

            match self.handle(command) {
                Ok(Response::Quit) => return true,
                Ok(response) => report(&response),
                Err(e) => log::warn!("Command {:?} failed: {}", command, e),
            }
        }
    }

    /// Grab one frame, outline every detected face and save the result
    pub fn snapshot(&mut self, path: &Path) -> Result<usize, Error> {
        let was_running = self.source.is_running();
        self.source.start()?;

        let deadline = Instant::now() + self.config.camera.join_timeout().max(Duration::from_secs(2));
        let frame = loop {
            if let Some(frame) = self.source.get_frame() {
                break frame;
            }
            if Instant::now() >= deadline {
                if !was_running {
                    self.source.release();
                }
                return Err(Error::Other("No camera frame arrived".to_string()));
            }
            thread::sleep(Duration::from_millis(10));
        };

        if !was_running {
            self.source.release();
        }

        let mut image = self.oriented(frame.image);
        let faces = self.session.detect(&image)?;
        for face in &faces {
            draw_face(&mut image, &face.rect);
        }

        image
            .save(path)
            .map_err(|e| Error::Storage(store::StorageError::Image(e)))?;
        log::info!("Snapshot with {} faces saved to: {}", faces.len(), path.display());
        Ok(faces.len())
    }

    fn oriented(&self, image: RgbImage) -> RgbImage {
        if self.config.camera.mirror {
            image::imageops::flip_horizontal(&image)
        } else {
            image
        }
    }
}

/// Run the most recent saved model on the best face in `image`
pub fn predict_image(
    vision: &mut dyn VisionProvider,
    models: &ModelStore,
    image: &RgbImage,
    patch_size: u32,
) -> Result<(Rect, Prediction), Error> {
    let path = models
        .most_recent()
        .ok_or_else(|| store::StorageError::ModelNotFound(models.dir().to_path_buf()))?;
    let recognizer = models.load(&path, &*vision)?;

    let faces = vision.detect_faces(image)?;
    let face = select_best(&faces, vision.reports_confidence()).ok_or(Error::NoFaceInFrame)?;
    let rect = face
        .rect
        .clamp_to(image.width(), image.height())
        .ok_or(Error::NoFaceInFrame)?;
    let region = rect.crop(image).ok_or(Error::NoFaceInFrame)?;

    let prediction = recognizer.predict(&training_patch(&region, patch_size))?;
    log::debug!(
        "Predicted label {} at distance {:.2}",
        prediction.label,
        prediction.distance
    );
    Ok((rect, prediction))
}

fn draw_face(image: &mut RgbImage, rect: &Rect) {
    if rect.width == 0 || rect.height == 0 {
        return;
    }
    let outline = DrawRect::at(rect.x, rect.y).of_size(rect.width, rect.height);
    draw_hollow_rect_mut(image, outline, Rgb([0, 255, 0]));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{face, FakeBackend, ScriptedVision, VisionProbe};
    use image::GenericImageView;
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn quick_config(dir: &TempDir) -> config::Config {
        let mut config = config::Config::default();
        config.session.required_dwell_secs = 0.2;
        config.session.success_hold_secs = 0.05;
        config.session.poll_interval_ms = 1;
        config.camera.retry_delay_ms = 1;
        config.camera.reopen_delay_ms = 1;
        config.camera.max_reopen_attempts = 1;
        config.storage.images_dir = dir.path().join("images");
        config.storage.records_dir = dir.path().join("records");
        config.storage.models_dir = dir.path().join("models");
        config
    }

    fn login(dir: &TempDir, backend: FakeBackend) -> (FaceLogin, VisionProbe) {
        let (vision, probe) = ScriptedVision::new();
        let login = FaceLogin::with_parts(quick_config(dir), vec![Box::new(backend)], Box::new(vision));
        (login, probe)
    }

    #[test]
    fn test_run_until_login() {
        let dir = TempDir::new().unwrap();
        let (mut login, probe) = login(&dir, FakeBackend::working("fake"));
        probe.show(vec![face(4, 4, 16)]);
        let (_tx, rx) = mpsc::channel();

        let outcome = login.run(&rx, |_| {}).unwrap();
        let RunOutcome::LoggedIn(report) = outcome else {
            panic!("expected a completed login, got {:?}", outcome);
        };
        assert!(report.elapsed >= Duration::from_millis(200));
        assert!(report.record.is_some());
        assert!(dir.path().join("models/latest_face_model.bin").is_file());
        assert!(login.session().is_finished());
    }

    #[test]
    fn test_quit_command_stops_run() {
        let dir = TempDir::new().unwrap();
        let (mut login, _probe) = login(&dir, FakeBackend::working("fake"));
        let (tx, rx) = mpsc::channel();
        tx.send(Command::Status).unwrap();
        tx.send(Command::Quit).unwrap();

        let mut responses = Vec::new();
        let outcome = login.run(&rx, |r| responses.push(r.clone())).unwrap();
        assert!(matches!(outcome, RunOutcome::Quit));
        assert!(matches!(responses.as_slice(), [Response::Status(_)]));
    }

    #[test]
    fn test_camera_loss_ends_run() {
        let dir = TempDir::new().unwrap();
        let backend = FakeBackend {
            frames_per_open: Some(0),
            ..FakeBackend::working("dead")
        };
        let (mut login, _probe) = login(&dir, backend);
        let (_tx, rx) = mpsc::channel();

        assert!(matches!(login.run(&rx, |_| {}).unwrap(), RunOutcome::CameraLost));
    }

    #[test]
    fn test_run_fails_without_camera() {
        let dir = TempDir::new().unwrap();
        let (mut login, _probe) = login(&dir, FakeBackend::broken("none"));
        let (_tx, rx) = mpsc::channel();
        assert!(matches!(login.run(&rx, |_| {}), Err(Error::Capture(_))));
    }

    #[test]
    fn test_step_skips_repeated_frames() {
        let dir = TempDir::new().unwrap();
        let (mut login, _probe) = login(&dir, FakeBackend::working("fake"));
        assert!(login.step(Instant::now()).is_none());

        login.handle(Command::StartCapture).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while login.step(Instant::now()).is_none() {
            assert!(Instant::now() < deadline, "no frame arrived");
            thread::sleep(Duration::from_millis(1));
        }

        login.handle(Command::StopCapture).unwrap();
        assert!(login.step(Instant::now()).is_none());
    }

    #[test]
    fn test_command_errors_are_reported() {
        let dir = TempDir::new().unwrap();
        let (mut login, _probe) = login(&dir, FakeBackend::working("fake"));

        assert!(matches!(login.handle(Command::Train), Err(Error::Session(_))));
        assert!(matches!(login.handle(Command::LoadModel), Err(Error::Session(_))));
        assert!(matches!(login.handle(Command::Reset).unwrap(), Response::Ack));

        let Response::Status(status) = login.handle(Command::Status).unwrap() else {
            panic!("expected status");
        };
        assert_eq!(status.status_text, session::STATUS_LOOKING);
        assert!(!status.login_successful);
    }

    #[test]
    fn test_predict_image_with_minimal_model() {
        let dir = TempDir::new().unwrap();
        let (mut vision, probe) = ScriptedVision::new();
        let models = ModelStore::new(dir.path().join("models"));
        let frame = crate::testing::textured_frame(64, 48, 7);

        let missing = predict_image(&mut vision, &models, &frame, 200);
        assert!(matches!(missing, Err(Error::Storage(_))));

        let region = frame.view(10, 10, 30, 30).to_image();
        let mut samples = training::SampleAccumulator::new(&config::TrainingConfig::default());
        training::publish_minimal_model(&vision, &models, &mut samples, &region, 5).unwrap();

        assert!(matches!(
            predict_image(&mut vision, &models, &frame, 200),
            Err(Error::NoFaceInFrame)
        ));

        probe.show(vec![face(10, 10, 30)]);
        let (rect, prediction) = predict_image(&mut vision, &models, &frame, 200).unwrap();
        assert_eq!(rect, Rect::new(10, 10, 30, 30));
        assert_eq!(prediction.label, 1);
        assert!(prediction.distance < 1e-3);
    }

    #[test]
    fn test_snapshot_outlines_faces() {
        let dir = TempDir::new().unwrap();
        let (mut login, probe) = login(&dir, FakeBackend::working("fake"));
        probe.show(vec![face(2, 2, 10), face(15, 5, 8)]);

        let path = dir.path().join("snapshot.png");
        assert_eq!(login.snapshot(&path).unwrap(), 2);

        let saved = image::open(&path).unwrap().to_rgb8();
        assert_eq!(saved.get_pixel(2, 2).0, [0, 255, 0]);
    }
}
