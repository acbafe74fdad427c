use crate::config::CameraConfig;
use crate::stream::{CameraBackend, CameraDevice};
use image::{ImageBuffer, RgbImage};
use std::fs;
use thiserror::Error;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture as V4lCapture;
use v4l::{Device, FourCC};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to open camera device: {0}")]
    DeviceOpen(String),
    #[error("Failed to capture frame: {0}")]
    Capture(String),
    #[error("Frame conversion failed: {0}")]
    Conversion(String),
    #[error("No camera backend could be opened: {0}")]
    NoBackend(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opens a V4L2 device with one specific pixel format
pub struct V4lBackend {
    name: String,
    device: String,
    width: u32,
    height: u32,
    fourcc: FourCC,
    warmup_frames: u32,
}

impl V4lBackend {
    pub fn new(config: &CameraConfig, fourcc: &str) -> Result<Self, CaptureError> {
        let code: [u8; 4] = fourcc
            .as_bytes()
            .try_into()
            .map_err(|_| CaptureError::DeviceOpen(format!("Invalid FourCC '{}'", fourcc)))?;

        Ok(Self {
            name: format!("{}:{}", config.device, fourcc),
            device: config.device.clone(),
            width: config.width,
            height: config.height,
            fourcc: FourCC::new(&code),
            warmup_frames: config.warmup_frames,
        })
    }

    /// One backend per configured pixel format, in preference order
    pub fn from_config(config: &CameraConfig) -> Result<Vec<Box<dyn CameraBackend>>, CaptureError> {
        config
            .backends
            .iter()
            .map(|fourcc| Self::new(config, fourcc).map(|b| Box::new(b) as Box<dyn CameraBackend>))
            .collect()
    }
}

impl CameraBackend for V4lBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> Result<Box<dyn CameraDevice>, CaptureError> {
        let index = device_index(&self.device)?;
        let device = Device::new(index)
            .map_err(|e| CaptureError::DeviceOpen(format!("{}: {}", self.device, e)))?;

        let mut format = device
            .format()
            .map_err(|e| CaptureError::DeviceOpen(format!("Failed to get format: {}", e)))?;
        format.width = self.width;
        format.height = self.height;
        format.fourcc = self.fourcc;

        let actual = device
            .set_format(&format)
            .map_err(|e| CaptureError::DeviceOpen(format!("Failed to set format: {}", e)))?;

        if actual.fourcc != self.fourcc {
            return Err(CaptureError::DeviceOpen(format!(
                "{} not supported (driver chose {})",
                self.fourcc, actual.fourcc
            )));
        }

        log::info!(
            "Camera initialized: {}x{} {}",
            actual.width,
            actual.height,
            actual.fourcc
        );

        let mut camera = V4lDevice {
            device,
            width: actual.width,
            height: actual.height,
            format: actual.fourcc,
        };

        // The first frames after opening are often black or badly exposed
        for _ in 0..self.warmup_frames {
            if let Err(e) = camera.read_frame() {
                log::debug!("Warmup frame failed: {}", e);
            }
        }

        Ok(Box::new(camera))
    }
}

struct V4lDevice {
    device: Device,
    width: u32,
    height: u32,
    format: FourCC,
}

impl CameraDevice for V4lDevice {
    fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
        let mut stream = MmapStream::with_buffers(&self.device, v4l::buffer::Type::VideoCapture, 4)
            .map_err(|e| CaptureError::Capture(format!("Failed to create stream: {}", e)))?;

        let (buf, _meta) = stream
            .next()
            .map_err(|e| CaptureError::Capture(format!("Failed to capture frame: {}", e)))?;

        match self.format.str() {
            Ok("MJPG") => decode_mjpeg(buf),
            Ok("YUYV") => decode_yuyv(buf, self.width, self.height),
            _ => Err(CaptureError::Conversion(format!(
                "Unsupported pixel format: {}",
                self.format
            ))),
        }
    }
}

/// "/dev/video2" or "2" -> 2
fn device_index(path: &str) -> Result<usize, CaptureError> {
    path.trim_start_matches("/dev/video")
        .parse::<usize>()
        .map_err(|_| CaptureError::DeviceOpen(format!("Not a V4L2 device path: {}", path)))
}

fn decode_mjpeg(data: &[u8]) -> Result<RgbImage, CaptureError> {
    let img = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)
        .map_err(|e| CaptureError::Conversion(format!("MJPEG decode failed: {}", e)))?;

    Ok(img.to_rgb8())
}

/// YUYV packs two pixels in four bytes: Y0 U Y1 V
fn decode_yuyv(data: &[u8], width: u32, height: u32) -> Result<RgbImage, CaptureError> {
    let width = width as usize;
    let height = height as usize;

    if data.len() < width * height * 2 {
        return Err(CaptureError::Conversion("YUYV buffer too small".to_string()));
    }

    let mut rgb_data = vec![0u8; width * height * 3];

    for y in 0..height {
        for x in 0..(width / 2) {
            let yuyv_offset = (y * width * 2) + (x * 4);
            let rgb_offset = (y * width * 3) + (x * 2 * 3);

            let y0 = data[yuyv_offset] as i32;
            let u = data[yuyv_offset + 1] as i32 - 128;
            let y1 = data[yuyv_offset + 2] as i32;
            let v = data[yuyv_offset + 3] as i32 - 128;

            for (i, luma) in [y0, y1].into_iter().enumerate() {
                let offset = rgb_offset + i * 3;
                rgb_data[offset] = (luma + ((1436 * v) >> 10)).clamp(0, 255) as u8;
                rgb_data[offset + 1] = (luma - ((354 * u + 732 * v) >> 10)).clamp(0, 255) as u8;
                rgb_data[offset + 2] = (luma + ((1814 * u) >> 10)).clamp(0, 255) as u8;
            }
        }
    }

    ImageBuffer::from_raw(width as u32, height as u32, rgb_data)
        .ok_or_else(|| CaptureError::Conversion("Failed to create RGB image".to_string()))
}

/// Enumerate /dev/video* nodes
pub fn list_devices() -> Result<Vec<String>, CaptureError> {
    let mut devices = Vec::new();

    for entry in fs::read_dir("/dev")
        .map_err(|e| CaptureError::DeviceOpen(format!("Failed to read /dev: {}", e)))?
    {
        let path = entry?.path();
        let is_video = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("video"))
            .unwrap_or(false);

        if is_video {
            if let Some(path_str) = path.to_str() {
                devices.push(path_str.to_string());
            }
        }
    }

    devices.sort();
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_device_index() {
        assert_eq!(device_index("/dev/video2").unwrap(), 2);
        assert_eq!(device_index("0").unwrap(), 0);
        assert!(device_index("/dev/sda").is_err());
    }

    #[test]
    fn test_backends_follow_configured_order() {
        let config = Config::default().camera;
        let backends = V4lBackend::from_config(&config).unwrap();
        let names: Vec<&str> = backends.iter().map(|b| b.name()).collect();
        assert_eq!(names, vec!["/dev/video0:MJPG", "/dev/video0:YUYV"]);
    }

    #[test]
    fn test_invalid_fourcc_rejected() {
        let config = Config::default().camera;
        assert!(V4lBackend::new(&config, "MJPEG").is_err());
    }

    #[test]
    fn test_decode_yuyv_gray() {
        // Neutral chroma gives gray pixels equal to luma
        let data = [100u8, 128, 200, 128, 50, 128, 0, 128];
        let rgb = decode_yuyv(&data, 2, 2).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [100, 100, 100]);
        assert_eq!(rgb.get_pixel(1, 0).0, [200, 200, 200]);
        assert_eq!(rgb.get_pixel(1, 1).0, [0, 0, 0]);
        assert!(decode_yuyv(&data[..4], 2, 2).is_err());
    }

    #[test]
    fn test_list_devices() {
        // Needs /dev; just make sure enumeration does not error out
        match list_devices() {
            Ok(devices) => println!("Found {} camera devices", devices.len()),
            Err(e) => println!("Could not list devices: {}", e),
        }
    }

    #[test]
    #[ignore] // Requires actual camera hardware
    fn test_camera_capture() {
        let config = Config::default().camera;
        let backends = V4lBackend::from_config(&config).unwrap();
        let mut device = backends[0].open().expect("Failed to open camera");
        let frame = device.read_frame().expect("Failed to capture frame");
        assert!(frame.width() > 0);
    }
}
