use thiserror::Error;

/// One normalised polar return as delivered by any hardware family.
/// Quality is vendor-normalised to 0..=127.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSample {
    pub angle: f32,
    pub distance: f32,
    pub quality: i32,
}

/// Immutable per-model characteristics, fixed once a device is opened.
#[derive(Debug, Clone, Copy)]
pub struct DeviceSpec {
    pub max_range: f32,
    pub num_samples: usize,
    pub scan_freq: f32,
    pub min_quality: i32,
    pub env_min_quality: i32,
}

impl Default for DeviceSpec {
    fn default() -> Self {
        DeviceSpec {
            max_range: 100.0,
            num_samples: 720,
            scan_freq: 10.0,
            min_quality: 0,
            env_min_quality: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub detected_device_type: String,
    pub serial: String,
    pub firmware: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotorCommand {
    State(bool),
    Pwm(u32),
    Speed(f32),
}

#[derive(Debug, Error)]
pub enum ScanSourceError {
    #[error("device node {0} not found")]
    NotFound(String),
    #[error("unsupported baud rate {0}")]
    BadBaud(u32),
    #[error("driver rejected device {0}: {1}")]
    Rejected(String, String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Contract implemented once per hardware family (serial framing lives below
/// this boundary) and by the file/virtual drivers.
pub trait ScanSource: Send {
    fn open(&mut self, device_path: &str, baud_hint: u32) -> Result<DeviceSpec, ScanSourceError>;

    fn close(&mut self);

    /// Pull the next full revolution of samples. Returns false when nothing
    /// arrived within `timeout_ms`; `out` is only valid on true.
    fn grab_scan(&mut self, out: &mut Vec<RawSample>, timeout_ms: u64) -> bool;

    fn set_motor(&mut self, _cmd: MotorCommand) {}

    fn ping_info(&self) -> DeviceInfo;

    /// Whether the stage may power-cycle this device through the platform
    /// power control file before declaring it failed.
    fn supports_power_control(&self) -> bool {
        false
    }
}

/// Synthetic source producing a constant-radius wall, optionally with
/// obstacle rays injected per scan. Used by tests and simulation mode.
pub struct SimulatedSource {
    pub spec: DeviceSpec,
    pub wall_distance: f32,
    pub wall_quality: i32,
    /// (bin index, distance) overrides applied to every scan
    pub obstacles: Vec<(usize, f32)>,
    open: bool,
}

impl SimulatedSource {
    pub fn new(spec: DeviceSpec, wall_distance: f32) -> Self {
        SimulatedSource {
            spec,
            wall_distance,
            wall_quality: 80,
            obstacles: Vec::new(),
            open: false,
        }
    }
}

impl ScanSource for SimulatedSource {
    fn open(&mut self, _device_path: &str, _baud_hint: u32) -> Result<DeviceSpec, ScanSourceError> {
        self.open = true;
        Ok(self.spec)
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn grab_scan(&mut self, out: &mut Vec<RawSample>, _timeout_ms: u64) -> bool {
        if !self.open {
            return false;
        }
        let n = self.spec.num_samples;
        out.clear();
        out.reserve(n);
        for i in 0..n {
            let angle = i as f32 / n as f32 * std::f32::consts::TAU;
            let distance = self
                .obstacles
                .iter()
                .find(|(bin, _)| *bin == i)
                .map(|(_, d)| *d)
                .unwrap_or(self.wall_distance);
            out.push(RawSample {
                angle,
                distance,
                quality: self.wall_quality,
            });
        }
        true
    }

    fn ping_info(&self) -> DeviceInfo {
        DeviceInfo {
            detected_device_type: "simulation".to_string(),
            serial: "SIM0".to_string(),
            firmware: String::new(),
        }
    }
}
