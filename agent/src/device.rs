use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub temperature: f64,
    pub humidity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareStep<'a> {
    Download(&'a str),
    Replace,
    Restart,
}

/// Board access: sensors on one side, light and firmware actuators on the other
pub trait Device: Send + Sync {
    fn read_sensors(&self) -> SensorReading;

    fn firmware_version(&self) -> String;

    fn set_light(&self, value: i64);

    fn blink_light(&self);

    /// Returns false when the step could not be completed
    fn update_firmware_step(&self, step: FirmwareStep<'_>) -> bool;
}

/// Stand-in for a real board, producing plausible readings
pub struct SimulatedDevice {
    rng: Mutex<StdRng>,
    firmware_version: Mutex<String>,
    downloaded: Mutex<Option<String>>,
    light: AtomicI64,
    blinks: AtomicUsize,
}

impl SimulatedDevice {
    pub fn new(firmware_version: impl Into<String>) -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
            firmware_version: Mutex::new(firmware_version.into()),
            downloaded: Mutex::new(None),
            light: AtomicI64::new(0),
            blinks: AtomicUsize::new(0),
        }
    }

    pub fn light(&self) -> i64 {
        self.light.load(Ordering::SeqCst)
    }

    pub fn blinks(&self) -> usize {
        self.blinks.load(Ordering::SeqCst)
    }
}

impl Device for SimulatedDevice {
    fn read_sensors(&self) -> SensorReading {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        SensorReading {
            temperature: rng.gen_range(15.0..35.0),
            humidity: rng.gen_range(30.0..80.0),
        }
    }

    fn firmware_version(&self) -> String {
        self.firmware_version
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_light(&self, value: i64) {
        info!("Light status set to {}", value);
        self.light.store(value, Ordering::SeqCst);
    }

    fn blink_light(&self) {
        info!("Blinking light");
        self.blinks.fetch_add(1, Ordering::SeqCst);
    }

    fn update_firmware_step(&self, step: FirmwareStep<'_>) -> bool {
        match step {
            FirmwareStep::Download(uri) => {
                if !(uri.starts_with("http://") || uri.starts_with("https://")) {
                    warn!("Refusing to download firmware from {:?}", uri);
                    return false;
                }
                info!("Downloaded firmware package {}", uri);
                *self.downloaded.lock().unwrap_or_else(|e| e.into_inner()) = Some(uri.to_string());
                true
            }
            FirmwareStep::Replace => {
                let downloaded = self.downloaded.lock().unwrap_or_else(|e| e.into_inner()).take();
                match downloaded {
                    Some(uri) => {
                        let package = uri.rsplit('/').next().unwrap_or(&uri).to_string();
                        info!("Replacing firmware with {}", package);
                        *self.firmware_version.lock().unwrap_or_else(|e| e.into_inner()) = package;
                        true
                    }
                    None => false,
                }
            }
            FirmwareStep::Restart => {
                info!("Restarting device");
                true
            }
        }
    }
}
