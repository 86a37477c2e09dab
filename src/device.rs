use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};

use crate::environment::{EnvParams, EnvironmentModel};
use crate::geometry::{self, polar_to_cart, Transform2};
use crate::sample_buffer::SampleBuffer;
use crate::scan_source::{DeviceInfo, DeviceSpec, RawSample, ScanSource};
use crate::segmentation::{self, Blobs, ObjectParams};
use crate::util::getmsec;

/// Rings kept for temporal denoising: the current scan plus two history
/// frames.
pub const NUM_SAMPLE_BUFFERS: usize = 3;

const NO_DATA_CLEAR_MSEC: u64 = 1_000;
const NO_DATA_FAIL_MSEC: u64 = 30_000;
const REOPEN_BACKOFF_MSEC: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Closed,
    Opening,
    Ready,
    Failed,
    PoweringUp,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Device path or virtual identifier, e.g. `/dev/ttyUSB0`
    pub name: String,
    pub baud_hint: u32,
    /// Explicit environment file; errors are reported only when set
    pub env_file: Option<PathBuf>,
    /// Explicit matrix file; errors are reported only when set
    pub matrix_file: Option<PathBuf>,
    /// Linear range correction `d' = d * (c1 + c2 * d)`
    pub char1: f32,
    pub char2: f32,
    pub object: ObjectParams,
    pub env: EnvParams,
    pub env_threshold: f32,
    pub object_detection: bool,
    pub object_tracking: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            name: String::new(),
            baud_hint: 0,
            env_file: None,
            matrix_file: None,
            char1: 1.0,
            char2: 0.0,
            object: ObjectParams::default(),
            env: EnvParams::default(),
            env_threshold: 0.2,
            object_detection: true,
            object_tracking: true,
        }
    }
}

#[derive(Debug, Default)]
struct RollingAverage {
    hist: [f32; 8],
    index: usize,
    filled: usize,
}

impl RollingAverage {
    fn push(&mut self, val: f32) {
        self.hist[self.index] = val;
        self.index = (self.index + 1) % self.hist.len();
        self.filled = (self.filled + 1).min(self.hist.len());
    }

    fn average(&self) -> f32 {
        if self.filled == 0 {
            return 0.0;
        }
        self.hist[..self.filled].iter().sum::<f32>() / self.filled as f32
    }
}

#[derive(Debug, Default)]
struct ScanStats {
    tick_start: u64,
    frames_in_sec: u32,
    fps: f32,
    avg_fps: RollingAverage,
    avg_samples: RollingAverage,
}

impl ScanStats {
    fn tick(&mut self, now: u64, samples: usize) {
        self.avg_samples.push(samples as f32);
        self.frames_in_sec += 1;
        if self.tick_start == 0 {
            self.tick_start = now;
        } else if now - self.tick_start >= 1000 {
            self.fps = self.frames_in_sec as f32 * 1000.0 / (now - self.tick_start) as f32;
            self.avg_fps.push(self.fps);
            self.frames_in_sec = 0;
            self.tick_start = now;
        }
    }
}

pub struct DeviceState {
    pub spec: DeviceSpec,
    pub info: DeviceInfo,
    pub status: DeviceStatus,
    pub error_msg: String,

    rings: Vec<SampleBuffer>,
    ring_index: usize,
    pub env: EnvironmentModel,
    pub objects: Blobs,
    accum: SampleBuffer,
    max_accum_count: u32,
    pub accumulating: bool,

    matrix: Transform2,
    matrix_inverse: Transform2,
    device_matrix: Transform2,
    view_matrix: Transform2,

    pub config: DeviceConfig,
    oid_counter: u32,
    env_scan_until: u64,
    pub timestamp: u64,
    pub frame_count: u64,
    received_time: u64,
    data_received: bool,
    data_valid: bool,
    use_temporal_denoise: bool,
    stats: ScanStats,
}

impl DeviceState {
    fn new(config: DeviceConfig) -> Self {
        let spec = DeviceSpec::default();
        DeviceState {
            rings: (0..NUM_SAMPLE_BUFFERS)
                .map(|_| SampleBuffer::new(spec.num_samples))
                .collect(),
            ring_index: 0,
            env: EnvironmentModel::new(spec.num_samples),
            objects: Blobs::default(),
            accum: SampleBuffer::new(spec.num_samples),
            max_accum_count: 0,
            accumulating: false,
            matrix: geometry::identity(),
            matrix_inverse: geometry::identity(),
            device_matrix: geometry::identity(),
            view_matrix: geometry::identity(),
            config,
            oid_counter: 0,
            env_scan_until: 0,
            timestamp: 0,
            frame_count: 0,
            received_time: 0,
            data_received: false,
            data_valid: false,
            use_temporal_denoise: true,
            spec,
            info: DeviceInfo::default(),
            status: DeviceStatus::Closed,
            error_msg: String::new(),
            stats: ScanStats::default(),
        }
    }

    /// Install the model characteristics, sizing all buffers. Called on
    /// open; virtual devices receive their spec from the wire.
    pub fn set_spec(&mut self, spec: DeviceSpec) {
        self.spec = spec;
        self.rings = (0..NUM_SAMPLE_BUFFERS)
            .map(|_| SampleBuffer::new(spec.num_samples))
            .collect();
        self.env = EnvironmentModel::new(spec.num_samples);
        self.accum = SampleBuffer::new(spec.num_samples);
        self.ring_index = 0;
    }

    /// Ring `k`: the scan `k` frames back; ring 0 is the latest.
    pub fn ring(&self, k: usize) -> &SampleBuffer {
        &self.rings[(self.ring_index + k) % self.rings.len()]
    }

    fn ring_mut(&mut self, k: usize) -> &mut SampleBuffer {
        let i = (self.ring_index + k) % self.rings.len();
        &mut self.rings[i]
    }

    pub fn matrix(&self) -> &Transform2 {
        &self.matrix
    }

    pub fn matrix_inverse(&self) -> &Transform2 {
        &self.matrix_inverse
    }

    pub fn device_matrix(&self) -> &Transform2 {
        &self.device_matrix
    }

    pub fn view_matrix(&self) -> &Transform2 {
        &self.view_matrix
    }

    pub fn accum(&self) -> &SampleBuffer {
        &self.accum
    }

    fn is_temp_noise(&self, bin: usize) -> bool {
        for k in 1..self.rings.len() {
            if self.ring(k)[bin].source_quality <= self.spec.min_quality {
                return true;
            }
        }
        false
    }

    /// Validity used by the environment-adaption path (denoise always on).
    pub fn scan_valid(&self, bin: usize) -> bool {
        let sample = &self.ring(0)[bin];
        sample.quality > self.spec.min_quality
            && !(self.use_temporal_denoise && self.is_temp_noise(bin))
            && !self
                .env
                .is_env_sample(sample, &self.spec, self.config.env_threshold)
    }

    /// Validity used for object detection; accumulation mode skips the
    /// temporal filter since averaging already suppresses flicker.
    pub fn is_valid(&self, bin: usize) -> bool {
        let sample = &self.ring(0)[bin];
        sample.quality > self.spec.min_quality
            && !self
                .env
                .is_env_sample(sample, &self.spec, self.config.env_threshold)
            && (self.accumulating || !(self.use_temporal_denoise && self.is_temp_noise(bin)))
    }

    fn valid_mask(&self) -> Vec<bool> {
        (0..self.ring(0).len()).map(|i| self.is_valid(i)).collect()
    }

    fn scan_valid_mask(&self) -> Vec<bool> {
        (0..self.ring(0).len()).map(|i| self.scan_valid(i)).collect()
    }

    /// The C1 push: rotate the ring, bin the raw returns, apply the range
    /// characteristic and transform into world space.
    fn push_scan(&mut self, nodes: &[RawSample], now: u64) {
        self.timestamp = now;
        self.frame_count = self.frame_count.wrapping_add(1);
        self.stats.tick(now, nodes.len());

        self.ring_index = (self.ring_index + self.rings.len() - 1) % self.rings.len();
        let (char1, char2) = (self.config.char1, self.config.char2);
        let matrix = self.matrix;

        let current = self.ring_mut(0);
        for sample in current.iter_mut() {
            sample.quality = -1;
            sample.oid = 0;
            sample.touched = false;
        }

        for (i, node) in nodes.iter().enumerate().rev() {
            let bin = current.index_by_angle(node.angle);
            let sample = &mut current[bin];
            sample.source_index = i;
            sample.source_quality = node.quality;
            sample.touched = true;
            sample.quality = node.quality;
            sample.angle = node.angle;
            sample.distance = node.distance * (char1 + char2 * node.distance);
            sample.coord = matrix * polar_to_cart(sample.angle, sample.distance);
        }
        self.data_valid = true;
    }

    fn accumulate(&mut self) {
        let mask = self.scan_valid_mask();
        let num = self.ring(0).len();
        for i in 0..num {
            if !mask[i] {
                continue;
            }
            let sample = self.ring(0)[i];
            let matrix = self.matrix;
            let accum = &mut self.accum[i];

            let alpha = 1.0 / accum.accum_count as f32;
            accum.angle = sample.angle;
            accum.distance = sample.distance;
            accum.quality = sample.quality;
            accum.oid = 0;
            accum.accum_count += 1;
            if accum.accum_count > self.max_accum_count {
                self.max_accum_count = accum.accum_count;
            }
            // running positional average over the registration window
            let coord = matrix * polar_to_cart(accum.angle, accum.distance);
            accum.coord = crate::geometry::Point2::new(
                coord.x * alpha + accum.coord.x * (1.0 - alpha),
                coord.y * alpha + accum.coord.y * (1.0 - alpha),
            );
        }
    }

    /// Drop accumulated bins seen in too few scans; the threshold adapts to
    /// the measured frame and sample rate.
    pub fn cleanup_accum(&mut self, register_sec: u32) {
        let mut threshold = (register_sec * 3) as f32;

        let avg_fps = self.stats.avg_fps.average();
        if avg_fps > 0.0 {
            let avg_samples = self.stats.avg_samples.average();
            let mut thres = register_sec as f32 * avg_fps * avg_samples / 1150.0 / 5.7;
            const MAX_THRES: f32 = 9.0;
            if thres < MAX_THRES {
                thres = (thres / MAX_THRES).sqrt() * MAX_THRES;
            }
            threshold = thres.round();
        }

        if self.max_accum_count > 0 {
            let thres = ((self.max_accum_count as f32 - 3.0) * 0.3).max(3.0);
            threshold = thres.round();
        }

        for i in 0..self.accum.len() {
            if (self.accum[i].accum_count as f32) < threshold {
                self.accum[i].quality = 0;
            }
        }
    }

    pub fn set_accum(&mut self, set: bool) {
        if set == self.accumulating {
            return;
        }
        self.accumulating = set;
        if set {
            self.max_accum_count = 0;
            for i in 0..self.accum.len() {
                self.accum[i].accum_count = 1;
                self.accum[i].quality = 0;
            }
        }
    }

    /// Detect blobs over the accumulated buffer instead of the live ring;
    /// used when closing a registration pass.
    pub fn detect_accum_objects(&mut self) {
        let valid: Vec<bool> = (0..self.accum.len())
            .map(|i| self.accum[i].quality > self.spec.min_quality)
            .collect();
        let detected = segmentation::detect_objects(
            &mut self.accum,
            &valid,
            &self.config.object,
            &self.matrix_inverse,
        );
        let previous = std::mem::take(&mut self.objects);
        self.objects = segmentation::track_objects(
            detected,
            &previous,
            &mut self.accum,
            &self.config.object,
            self.config.object_tracking,
            &mut self.oid_counter,
        );
        self.objects.set_timestamp(self.timestamp);
    }

    fn detect(&mut self, now: u64) {
        if !self.config.object_detection {
            return;
        }
        if self.env.scanning {
            self.objects = Blobs::default();
            return;
        }
        let valid = self.valid_mask();
        let matrix_inverse = self.matrix_inverse;
        let params = self.config.object;
        let tracking = self.config.object_tracking;
        let mut oid_counter = self.oid_counter;

        let ring_index = self.ring_index;
        let samples = &mut self.rings[ring_index];
        let detected = segmentation::detect_objects(samples, &valid, &params, &matrix_inverse);
        let previous = std::mem::take(&mut self.objects);
        self.objects = segmentation::track_objects(
            detected,
            &previous,
            samples,
            &params,
            tracking,
            &mut oid_counter,
        );
        self.oid_counter = oid_counter;
        self.objects.set_timestamp(now);
    }

    fn adapt_env(&mut self, now: u64) {
        if !self.config.env.adapt || self.config.env.adapt_sec <= 0.0 || self.env.scanning {
            return;
        }
        let mask = self.scan_valid_mask();
        let ring_index = self.ring_index;
        let env_params = self.config.env;
        let samples = &self.rings[ring_index];
        self.env.adapt(samples, &mask, &env_params, now);
        let (spec, matrix) = (self.spec, self.matrix);
        let device_type = self.info.detected_device_type.clone();
        self.env.process(&spec, &env_params, &matrix, &device_type);
    }

    /// One full frame: bin, accumulate, learn or detect, adapt.
    pub fn process_scan(&mut self, nodes: &[RawSample], now: u64) {
        self.push_scan(nodes, now);

        if self.accumulating {
            self.accumulate();
        }

        if self.env.scanning {
            let ring_index = self.ring_index;
            let spec = self.spec;
            let samples = std::mem::replace(&mut self.rings[ring_index], SampleBuffer::new(0));
            self.env.learn(&samples, &spec, now);
            self.rings[ring_index] = samples;

            if now >= self.env_scan_until {
                let (spec, env_params, matrix) = (self.spec, self.config.env, self.matrix);
                let device_type = self.info.detected_device_type.clone();
                self.env.process(&spec, &env_params, &matrix, &device_type);
                self.env.scanning = false;
                info!("environment scan finished");
            }
        } else {
            self.detect(now);
            if self.data_valid {
                self.adapt_env(now);
            }
        }
    }

    fn clear_samples(&mut self) {
        for sample in self.ring_mut(0).iter_mut() {
            sample.quality = -1;
            sample.touched = false;
        }
        self.objects = Blobs::default();
    }

    fn apply_transform(&mut self, delta: &Transform2) {
        if geometry::is_identity(delta) {
            return;
        }
        for ring in self.rings.iter_mut() {
            ring.transform(delta);
        }
        self.env.transform(delta);
        if self.accumulating {
            self.accum.transform(delta);
        }
        self.objects.transform(delta);
    }

    pub fn set_matrix(&mut self, m: Transform2) {
        if m == self.matrix {
            return;
        }
        let delta = m * self.matrix_inverse;
        self.apply_transform(&delta);
        self.matrix = m;
        self.matrix_inverse = m.inverse();
    }

    pub fn set_device_matrix(&mut self, device_matrix: Transform2) {
        if device_matrix == self.device_matrix {
            return;
        }
        self.device_matrix = device_matrix;
        self.set_matrix(self.view_matrix * self.device_matrix);
    }

    pub fn set_view_matrix(&mut self, view_matrix: Transform2) {
        if view_matrix == self.view_matrix {
            return;
        }
        self.view_matrix = view_matrix;
        self.set_matrix(self.view_matrix * self.device_matrix);
    }

    pub fn begin_env_scan(&mut self, seconds: f32, now: u64) {
        self.env.begin_scan(&self.spec, now);
        self.env_scan_until = now + (seconds * 1000.0) as u64;
    }

    /// Candidate registration markers from the most recent blob list.
    pub fn markers(&self, max_marker_distance: f32) -> Vec<Blobs> {
        let valid = self.valid_mask();
        self.objects
            .markers(self.ring(0), &valid, max_marker_distance)
    }

    /// Marker candidates over the accumulated registration buffer.
    pub fn accum_markers(&self, max_marker_distance: f32) -> Vec<Blobs> {
        let valid: Vec<bool> = (0..self.accum.len())
            .map(|i| self.accum[i].quality > self.spec.min_quality)
            .collect();
        self.objects.markers(&self.accum, &valid, max_marker_distance)
    }

    pub fn write_matrix_file(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let file = File::create(path).with_context(|| format!("writing {}", path.display()))?;
        let mut out = BufWriter::new(file);
        for m in [&self.device_matrix, &self.view_matrix] {
            let c = geometry::to_six(m);
            writeln!(out, "{} {} {} {} {} {}", c[0], c[1], c[2], c[3], c[4], c[5])?;
        }
        Ok(())
    }

    pub fn read_matrix_file(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path).with_context(|| format!("reading {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut matrices = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let values: Vec<f32> = line
                .split_whitespace()
                .map(|v| v.parse())
                .collect::<std::result::Result<_, _>>()
                .with_context(|| format!("parsing {}", path.display()))?;
            if values.len() != 6 {
                return Err(anyhow!("{}: expected 6 floats per line", path.display()));
            }
            matrices.push(geometry::from_six(&[
                values[0], values[1], values[2], values[3], values[4], values[5],
            ]));
        }
        if matrices.len() != 2 {
            return Err(anyhow!("{}: expected 2 matrix lines", path.display()));
        }
        self.set_device_matrix(matrices[0]);
        self.set_view_matrix(matrices[1]);
        Ok(())
    }
}

struct Shared {
    state: Mutex<DeviceState>,
    exit_thread: AtomicBool,
    should_open: AtomicBool,
}

/// One sensor: owns its driver handle, scan rings, environment model, blob
/// list and the scan thread. All cross-thread access goes through one mutex
/// with brief critical sections.
pub struct DeviceStage {
    pub id: String,
    shared: Arc<Shared>,
    source: Option<Box<dyn ScanSource>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl DeviceStage {
    pub fn new(id: &str, config: DeviceConfig, source: Box<dyn ScanSource>) -> Self {
        DeviceStage {
            id: id.to_string(),
            shared: Arc::new(Shared {
                state: Mutex::new(DeviceState::new(config)),
                exit_thread: AtomicBool::new(false),
                should_open: AtomicBool::new(false),
            }),
            source: Some(source),
            thread: None,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.shared.state.lock().unwrap()
    }

    pub fn status(&self) -> DeviceStatus {
        self.lock().status
    }

    pub fn is_ready(&self) -> bool {
        self.status() == DeviceStatus::Ready
    }

    /// Lock-free from the caller's perspective: a brief lock and clone.
    pub fn get_objects(&self) -> Blobs {
        self.lock().objects.clone()
    }

    /// Start the scan thread; connection happens asynchronously with
    /// retries.
    pub fn open(&mut self) {
        self.shared.should_open.store(true, Ordering::SeqCst);
        if self.thread.is_some() {
            return;
        }
        let Some(mut source) = self.source.take() else {
            warn!("device {}: already shut down, not reopening", self.id);
            return;
        };
        let shared = Arc::clone(&self.shared);
        let id = self.id.clone();
        self.thread = Some(
            thread::Builder::new()
                .name(format!("scan-{id}"))
                .spawn(move || scan_thread(&id, shared, source.as_mut()))
                .expect("failed to spawn scan thread"),
        );
    }

    /// Signal the thread to stop and rejoin it.
    pub fn close(&mut self) {
        self.shared.should_open.store(false, Ordering::SeqCst);
        self.shared.exit_thread.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        self.shared.exit_thread.store(false, Ordering::SeqCst);
    }

    /// Feed a scan without a thread; used by virtual devices and tests.
    pub fn inject_scan(&self, nodes: &[RawSample], timestamp: u64) {
        let mut state = self.lock();
        if state.status == DeviceStatus::Closed {
            state.status = DeviceStatus::Ready;
        }
        state.received_time = timestamp;
        state.data_received = true;
        state.process_scan(nodes, timestamp);
    }

    pub fn env_scan(&self, seconds: f32) {
        let mut state = self.lock();
        // injected scans drive a synthetic timeline; fall back to the wall
        // clock before the first frame
        let now = if state.timestamp > 0 {
            state.timestamp
        } else {
            getmsec()
        };
        state.begin_env_scan(seconds, now);
    }

    pub fn env_save(&self, path: &Path) -> Result<()> {
        let state = self.lock();
        let inverse = *state.matrix_inverse();
        state.env.write_file(path, &inverse)
    }

    pub fn env_load(&self, path: &Path) -> Result<()> {
        let mut state = self.lock();
        let (spec, env_params, matrix) = (state.spec, state.config.env, *state.matrix());
        let device_type = state.info.detected_device_type.clone();
        let now = getmsec();
        state
            .env
            .read_file(path, &spec, &env_params, &matrix, &device_type, now)
    }

    pub fn env_reset(&self) {
        let mut state = self.lock();
        let spec = state.spec;
        state.env.reset(&spec);
    }

    pub fn set_accum(&self, set: bool) {
        self.lock().set_accum(set);
    }

    pub fn set_matrix(&self, m: Transform2) {
        self.lock().set_matrix(m);
    }

    pub fn set_device_matrix(&self, m: Transform2) {
        self.lock().set_device_matrix(m);
    }

    pub fn set_view_matrix(&self, m: Transform2) {
        self.lock().set_view_matrix(m);
    }
}

impl Drop for DeviceStage {
    fn drop(&mut self) {
        self.close();
    }
}

fn scan_thread(id: &str, shared: Arc<Shared>, source: &mut dyn ScanSource) {
    let mut nodes: Vec<RawSample> = Vec::new();
    let mut opened = false;
    let mut last_open_attempt = 0u64;

    while !shared.exit_thread.load(Ordering::SeqCst) {
        let should_open = shared.should_open.load(Ordering::SeqCst);

        if should_open && !opened {
            let now = getmsec();
            if now - last_open_attempt < REOPEN_BACKOFF_MSEC {
                thread::sleep(Duration::from_millis(100));
                continue;
            }
            last_open_attempt = now;

            let (name, baud) = {
                let mut state = shared.state.lock().unwrap();
                state.status = DeviceStatus::Opening;
                (state.config.name.clone(), state.config.baud_hint)
            };
            match source.open(&name, baud) {
                Ok(spec) => {
                    let mut state = shared.state.lock().unwrap();
                    state.set_spec(spec);
                    state.info = source.ping_info();
                    state.status = DeviceStatus::Ready;
                    state.received_time = getmsec();
                    opened = true;
                    info!(
                        "device {id}: opened as {} ({} samples @ {} Hz)",
                        state.info.detected_device_type, spec.num_samples, spec.scan_freq
                    );

                    let env_file = state.config.env_file.clone();
                    let matrix_file = state.config.matrix_file.clone();
                    drop(state);
                    load_config_files(id, &shared, env_file, matrix_file);
                }
                Err(e) => {
                    let mut state = shared.state.lock().unwrap();
                    state.status = if source.supports_power_control() {
                        DeviceStatus::PoweringUp
                    } else {
                        DeviceStatus::Failed
                    };
                    state.error_msg = e.to_string();
                    error!("device {id}: open failed: {e}");
                }
            }
            continue;
        }

        if !should_open && opened {
            source.set_motor(crate::scan_source::MotorCommand::State(false));
            source.close();
            opened = false;
            shared.state.lock().unwrap().status = DeviceStatus::Closed;
            continue;
        }

        if !opened {
            thread::sleep(Duration::from_millis(100));
            continue;
        }

        let got = source.grab_scan(&mut nodes, 20);
        let now = getmsec();

        if got {
            let mut state = shared.state.lock().unwrap();
            state.received_time = now;
            if !state.data_received {
                state.data_received = true;
                state.error_msg.clear();
            }
            state.process_scan(&nodes, now);
        } else {
            let mut state = shared.state.lock().unwrap();
            let silent = now.saturating_sub(state.received_time);
            if silent > NO_DATA_CLEAR_MSEC {
                state.clear_samples();
                if silent > NO_DATA_FAIL_MSEC && state.data_received {
                    state.data_received = false;
                    state.error_msg = "no data".to_string();
                    warn!("device {id}: no data for {} s, reopening", silent / 1000);
                    drop(state);
                    source.close();
                    opened = false;
                    continue;
                }
            }
            drop(state);
            thread::sleep(Duration::from_micros(500));
        }
    }

    if opened {
        source.set_motor(crate::scan_source::MotorCommand::State(false));
        source.close();
        shared.state.lock().unwrap().status = DeviceStatus::Closed;
    }
}

fn load_config_files(
    id: &str,
    shared: &Arc<Shared>,
    env_file: Option<PathBuf>,
    matrix_file: Option<PathBuf>,
) {
    if let Some(path) = matrix_file {
        let mut state = shared.state.lock().unwrap();
        if let Err(e) = state.read_matrix_file(&path) {
            error!("device {id}: {e}");
        }
    }
    if let Some(path) = env_file {
        let mut state = shared.state.lock().unwrap();
        let (spec, env_params, matrix) = (state.spec, state.config.env, *state.matrix());
        let device_type = state.info.detected_device_type.clone();
        let now = getmsec();
        if let Err(e) = state
            .env
            .read_file(&path, &spec, &env_params, &matrix, &device_type, now)
        {
            error!("device {id}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample_buffer::angle_by_index;
    use crate::scan_source::SimulatedSource;

    fn wall_nodes(n: usize, distance: f32, quality: i32) -> Vec<RawSample> {
        (0..n)
            .map(|i| RawSample {
                angle: angle_by_index(i, n),
                distance,
                quality,
            })
            .collect()
    }

    fn test_config() -> DeviceConfig {
        DeviceConfig {
            object: ObjectParams {
                min_extent: 0.0,
                ..ObjectParams::default()
            },
            ..DeviceConfig::default()
        }
    }

    fn test_stage(num_samples: usize) -> DeviceStage {
        let spec = DeviceSpec {
            num_samples,
            max_range: 12.0,
            ..DeviceSpec::default()
        };
        let stage = DeviceStage::new(
            "test",
            test_config(),
            Box::new(SimulatedSource::new(spec, 2.0)),
        );
        stage.lock().set_spec(spec);
        stage
    }

    #[test]
    fn env_learn_then_obstacle_yields_one_object() {
        let n = 360;
        let stage = test_stage(n);
        let wall = wall_nodes(n, 2.0, 80);
        stage.inject_scan(&wall, 1000);
        stage.env_scan(2.0);

        // 2 s of wall scans at 10 Hz
        for frame in 1..22u64 {
            stage.inject_scan(&wall, 1000 + frame * 100);
        }
        assert!(!stage.lock().env.scanning);

        // a few adjacent bins step closer
        let mut scan = wall_nodes(n, 2.0, 80);
        scan[100].distance = 1.2;
        scan[101].distance = 1.2;
        scan[102].distance = 1.2;
        for frame in 22..25u64 {
            stage.inject_scan(&scan, 1000 + frame * 100);
        }

        let objects = stage.get_objects();
        assert_eq!(objects.len(), 1);
        let center_angle = crate::geometry::angle_of(&objects.0[0].center);
        let expected = angle_by_index(100, n);
        assert!((center_angle - expected).abs() < 0.1);
    }

    #[test]
    fn matrix_change_moves_existing_coords() {
        let n = 90;
        let stage = test_stage(n);
        stage.inject_scan(&wall_nodes(n, 2.0, 80), 0);
        let before = stage.lock().ring(0)[0].coord;
        stage.set_device_matrix(geometry::translation(1.0, 0.0));
        let after = stage.lock().ring(0)[0].coord;
        assert!((after.x - before.x - 1.0).abs() < 1e-5);
    }

    #[test]
    fn matrix_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.txt");
        let stage = test_stage(16);
        stage.set_device_matrix(geometry::translation(0.5, -1.0) * geometry::rot_z(0.3));
        stage.set_view_matrix(geometry::translation(2.0, 0.0));
        stage.lock().write_matrix_file(&path).unwrap();

        let other = test_stage(16);
        other.lock().read_matrix_file(&path).unwrap();
        let a = geometry::to_six(other.lock().device_matrix());
        let b = geometry::to_six(stage.lock().device_matrix());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn thread_opens_and_scans() {
        let spec = DeviceSpec {
            num_samples: 90,
            ..DeviceSpec::default()
        };
        let mut stage = DeviceStage::new(
            "sim",
            test_config(),
            Box::new(SimulatedSource::new(spec, 2.0)),
        );
        stage.open();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if stage.is_ready() && stage.lock().frame_count > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(stage.is_ready());
        assert!(stage.lock().frame_count > 0);
        stage.close();
        assert_eq!(stage.status(), DeviceStatus::Closed);
    }

    #[test]
    fn accum_cleanup_drops_sparse_bins() {
        let n = 90;
        let stage = test_stage(n);
        stage.set_accum(true);
        let wall = wall_nodes(n, 2.0, 80);
        for frame in 0..20u64 {
            stage.inject_scan(&wall, frame * 100);
        }
        let mut state = stage.lock();
        // bins touched every frame survive
        state.cleanup_accum(10);
        assert!(state.accum()[10].quality > 0);
    }
}
