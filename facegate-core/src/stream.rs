//! Background frame acquisition.
//!
//! A dedicated thread keeps reading from the camera and publishes only the
//! most recent frame. Consumers never block on the camera; they get a clone of
//! whatever arrived last, or nothing.

use crate::capture::CaptureError;
use crate::config::CameraConfig;
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// An open camera
pub trait CameraDevice: Send {
    fn read_frame(&mut self) -> Result<RgbImage, CaptureError>;
}

/// One way of opening the camera (a device plus a pixel format)
pub trait CameraBackend: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self) -> Result<Box<dyn CameraDevice>, CaptureError>;
}

#[derive(Debug, Clone)]
pub struct Frame {
    /// Increases by one for every frame the capture thread publishes
    pub seq: u64,
    pub image: RgbImage,
    pub captured_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub read_failure_threshold: u32,
    pub max_reopen_attempts: u32,
    pub retry_delay: Duration,
    pub reopen_delay: Duration,
    pub join_timeout: Duration,
}

impl From<&CameraConfig> for StreamSettings {
    fn from(config: &CameraConfig) -> Self {
        Self {
            read_failure_threshold: config.read_failure_threshold.max(1),
            max_reopen_attempts: config.max_reopen_attempts,
            retry_delay: config.retry_delay(),
            reopen_delay: config.reopen_delay(),
            join_timeout: config.join_timeout(),
        }
    }
}

pub struct FrameSource {
    backends: Arc<Vec<Box<dyn CameraBackend>>>,
    settings: StreamSettings,
    latest: Arc<Mutex<Option<Frame>>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FrameSource {
    pub fn new(backends: Vec<Box<dyn CameraBackend>>, settings: StreamSettings) -> Self {
        Self {
            backends: Arc::new(backends),
            settings,
            latest: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Open the first backend that works and start the capture thread.
    /// Calling this while already running does nothing.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.is_running() {
            return Ok(());
        }
        self.release();

        let device = open_first(&self.backends)?;

        // Fresh shared state per run, so a detached thread from an earlier
        // run can never publish into this one
        self.running = Arc::new(AtomicBool::new(true));
        self.latest = Arc::new(Mutex::new(None));

        let worker = CaptureLoop {
            backends: Arc::clone(&self.backends),
            settings: self.settings,
            latest: Arc::clone(&self.latest),
            running: Arc::clone(&self.running),
        };

        let handle = thread::Builder::new()
            .name("facegate-capture".to_string())
            .spawn(move || worker.run(device));

        match handle {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(CaptureError::Io(e))
            }
        }
    }

    /// Copy of the newest frame, if any has arrived
    pub fn get_frame(&self) -> Option<Frame> {
        lock(&self.latest).clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && self.running.load(Ordering::SeqCst)
    }

    /// Stop the capture thread and drop the last frame. Waits at most the
    /// configured join timeout; a thread stuck in a driver call is detached.
    pub fn release(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + self.settings.join_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }

            if handle.is_finished() {
                if handle.join().is_err() {
                    log::error!("Capture thread panicked");
                }
                log::debug!("Capture thread stopped");
            } else {
                log::warn!(
                    "Capture thread did not stop within {:?}, detaching it",
                    self.settings.join_timeout
                );
            }
        }

        *lock(&self.latest) = None;
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.release();
    }
}

struct CaptureLoop {
    backends: Arc<Vec<Box<dyn CameraBackend>>>,
    settings: StreamSettings,
    latest: Arc<Mutex<Option<Frame>>>,
    running: Arc<AtomicBool>,
}

impl CaptureLoop {
    fn run(self, device: Box<dyn CameraDevice>) {
        let mut device = Some(device);
        let mut seq = 0u64;
        let mut failures = 0u32;
        let mut reopen_attempts = 0u32;

        while self.running.load(Ordering::SeqCst) {
            let Some(camera) = device.as_mut() else {
                if reopen_attempts >= self.settings.max_reopen_attempts {
                    log::error!(
                        "Camera could not be reopened after {} attempts, stopping capture",
                        reopen_attempts
                    );
                    break;
                }
                reopen_attempts += 1;
                thread::sleep(self.settings.reopen_delay);

                match open_first(&self.backends) {
                    Ok(reopened) => {
                        log::info!("Camera reopened (attempt {})", reopen_attempts);
                        device = Some(reopened);
                        failures = 0;
                    }
                    Err(e) => log::warn!("Camera reopen attempt {} failed: {}", reopen_attempts, e),
                }
                continue;
            };

            match camera.read_frame() {
                Ok(image) => {
                    failures = 0;
                    reopen_attempts = 0;
                    seq += 1;

                    *lock(&self.latest) = Some(Frame {
                        seq,
                        image,
                        captured_at: Instant::now(),
                    });
                }
                Err(e) => {
                    failures += 1;
                    log::debug!("Frame read failed ({} in a row): {}", failures, e);

                    if failures >= self.settings.read_failure_threshold {
                        log::warn!("{} consecutive read failures, reopening camera", failures);
                        device = None;
                    } else {
                        thread::sleep(self.settings.retry_delay);
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }
}

/// Try each backend in order and return the first device that opens
fn open_first(backends: &[Box<dyn CameraBackend>]) -> Result<Box<dyn CameraDevice>, CaptureError> {
    let mut errors = Vec::new();

    for backend in backends {
        match backend.open() {
            Ok(device) => {
                log::info!("Camera opened with backend {}", backend.name());
                return Ok(device);
            }
            Err(e) => {
                log::warn!("Camera backend {} failed: {}", backend.name(), e);
                errors.push(format!("{}: {}", backend.name(), e));
            }
        }
    }

    Err(CaptureError::NoBackend(errors.join("; ")))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
