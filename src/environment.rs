use std::path::Path;

use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};

use crate::geometry::{polar_to_cart, Transform2};
use crate::sample_buffer::{Sample, SampleBuffer};
use crate::scan_source::DeviceSpec;

/// Distance written into bins the smoothing pass considers empty; far enough
/// that subtraction never classifies a real return as environment.
const FAR_DISTANCE: f32 = 1024.0;

fn mix(x: f32, a: f32, b: f32) -> f32 {
    (1.0 - x) * a + x * b
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvParams {
    /// Time in sec used to scan the environment
    pub scan_sec: f32,
    /// Time in sec a bin must see a further reading before it is re-learned
    pub adapt_sec: f32,
    /// Switches environment adaption on or off
    pub adapt: bool,
    /// Distance from the learned value in which a sample is still environmental
    pub threshold: f32,
    /// Distance between samples used for eroding and smoothing
    pub filter_min_distance: f32,
    /// Angular size (radians) of the erode/smooth filter
    pub filter_size: f32,
}

impl Default for EnvParams {
    fn default() -> Self {
        EnvParams {
            scan_sec: 15.0,
            adapt_sec: 30.0,
            adapt: false,
            threshold: 0.2,
            filter_min_distance: 0.5,
            filter_size: 0.75,
        }
    }
}

/// Per-angle minimum-distance map of the static surroundings.
///
/// `raw` holds the learned minima, `env` the eroded+smoothed version used for
/// subtraction, `depth` the adapting lower envelope. All three live in world
/// coordinates while loaded; the file format stores device coordinates.
pub struct EnvironmentModel {
    env: SampleBuffer,
    raw: SampleBuffer,
    eroded: SampleBuffer,
    depth: SampleBuffer,
    timestamps: Vec<u64>,
    pub valid: bool,
    pub use_env: bool,
    pub scanning: bool,
    pub scan_started: u64,
}

impl EnvironmentModel {
    pub fn new(num_samples: usize) -> Self {
        EnvironmentModel {
            env: SampleBuffer::new(num_samples),
            raw: SampleBuffer::new(num_samples),
            eroded: SampleBuffer::new(num_samples),
            depth: SampleBuffer::new(num_samples),
            timestamps: vec![0; num_samples],
            valid: false,
            use_env: true,
            scanning: false,
            scan_started: 0,
        }
    }

    pub fn num_samples(&self) -> usize {
        self.env.len()
    }

    pub fn env(&self) -> &SampleBuffer {
        &self.env
    }

    pub fn raw(&self) -> &SampleBuffer {
        &self.raw
    }

    /// Arm a fresh environment scan: every bin forgets its minimum.
    pub fn begin_scan(&mut self, spec: &DeviceSpec, timestamp: u64) {
        let far = spec.max_range * 10.0;
        for i in 0..self.env.len() {
            let angle = self.env.angle_by_index(i);
            for buf in [&mut self.env, &mut self.raw, &mut self.depth] {
                buf[i].quality = -1;
                buf[i].angle = angle;
                buf[i].distance = far;
            }
            self.timestamps[i] = timestamp;
        }
        self.valid = true;
        self.scanning = true;
        self.scan_started = timestamp;
    }

    /// Confidence that a return belongs to the static environment. Learned
    /// minima are only written when this reaches 1.
    pub fn confidence(&self, sample: &Sample, spec: &DeviceSpec) -> f32 {
        if spec.env_min_quality <= 0 {
            return 1.0;
        }
        let quality = (sample.quality - spec.env_min_quality) as f32
            / (127 - spec.env_min_quality) as f32;
        let distance = sample.distance / (spec.max_range * 1.1);
        quality.powf(1.8) + distance.powf(0.25)
    }

    /// Fold the current scan into the learned minima.
    pub fn learn(&mut self, samples: &SampleBuffer, spec: &DeviceSpec, timestamp: u64) {
        for i in 0..samples.len() {
            let sample = samples[i];
            if sample.distance.is_nan() {
                continue;
            }
            let ang = self.env.index_by_angle(sample.angle);
            if sample.quality > spec.env_min_quality
                && self.confidence(&sample, spec) >= 1.0
                && (self.env[ang].quality <= 0 || sample.distance < self.env[ang].distance)
            {
                for buf in [&mut self.env, &mut self.raw] {
                    buf[ang].quality = sample.quality;
                    buf[ang].distance = sample.distance;
                    buf[ang].coord = sample.coord;
                }
                self.timestamps[ang] = timestamp;
            }
        }
        self.valid = true;
    }

    fn erode(&mut self, spec: &DeviceSpec, params: &EnvParams, steps: usize) {
        let n = self.raw.len();
        for ang in 0..n {
            let mut dst = self.raw[ang];
            for k in 1..steps {
                for idx in [
                    self.raw.wrap_index(ang as i64 - k as i64),
                    self.raw.wrap_index(ang as i64 + k as i64),
                ] {
                    let nb = self.raw[idx];
                    if nb.quality <= spec.min_quality {
                        continue;
                    }
                    let fresh = dst.quality <= spec.min_quality;
                    if fresh
                        || ((nb.distance - dst.distance).abs() < params.filter_min_distance
                            && nb.distance < dst.distance)
                    {
                        if fresh {
                            dst.angle = self.raw.angle_by_index(ang);
                        }
                        dst.quality = nb.quality;
                        dst.distance = nb.distance;
                    }
                }
            }
            self.eroded[ang] = dst;
        }
    }

    fn smooth(&mut self, spec: &DeviceSpec, params: &EnvParams, steps: usize, matrix: &Transform2) {
        let n = self.eroded.len();
        let steps_m1 = if steps <= 1 { 1.0 } else { (steps - 1) as f32 };
        let mut distances = vec![0.0f32; n];

        for ang in 0..n {
            let sample = self.eroded[ang];
            if sample.quality <= spec.min_quality {
                distances[ang] = FAR_DISTANCE;
                continue;
            }
            let sample_distance = sample.distance;
            let mut distance = sample_distance;
            let mut sum = sample_distance;
            let mut count = 1;
            for k in (1..steps).rev() {
                let alpha = 1.0 - 0.3 * k as f32 / steps_m1;
                for idx in [
                    self.eroded.wrap_index(ang as i64 - k as i64),
                    self.eroded.wrap_index(ang as i64 + k as i64),
                ] {
                    let nb = self.eroded[idx];
                    if nb.quality > spec.min_quality
                        && sample_distance - nb.distance < params.filter_min_distance
                        && nb.distance < distance
                    {
                        distance = mix(alpha, sample_distance, nb.distance);
                        sum += distance;
                        count += 1;
                    }
                }
            }
            if distance < 0.01 {
                sum = FAR_DISTANCE * count as f32;
            }
            distances[ang] = sum / count as f32;
        }

        for ang in 0..n {
            let sample = &mut self.eroded[ang];
            sample.distance = distances[ang];
            sample.coord = matrix * polar_to_cart(sample.angle, sample.distance);
        }
    }

    /// Erode + smooth the learned minima into the subtraction map. Some
    /// chipsets (`ms200`, `st27`) deliver pre-filtered data and take the raw
    /// map verbatim.
    pub fn process(
        &mut self,
        spec: &DeviceSpec,
        params: &EnvParams,
        matrix: &Transform2,
        device_type: &str,
    ) {
        if device_type == "ms200" || device_type == "st27" {
            for ang in 0..self.raw.len() {
                let mut sample = self.raw[ang];
                sample.coord = matrix * polar_to_cart(sample.angle, sample.distance);
                self.env[ang] = sample;
            }
        } else {
            let steps = (params.filter_size / std::f32::consts::TAU
                * self.raw.len() as f32)
                .round() as usize;
            self.erode(spec, params, steps.max(1));
            self.smooth(spec, params, steps.max(1), matrix);
            for ang in 0..self.eroded.len() {
                self.env[ang] = self.eroded[ang];
            }
        }
        self.valid = true;
    }

    /// Slowly re-learn static changes: bins that keep reporting beyond the
    /// depth envelope for longer than `adapt_sec` overwrite the raw map.
    /// Transients refresh nothing and age out of the envelope instead.
    pub fn adapt(
        &mut self,
        samples: &SampleBuffer,
        valid: &[bool],
        params: &EnvParams,
        timestamp: u64,
    ) {
        let threshold = params.threshold;
        let depth_time = (params.adapt_sec * 1000.0) as u64;

        for i in 0..samples.len() {
            let sample = samples[i];
            if !sample.touched || !valid[i] || sample.distance.is_nan() {
                continue;
            }
            let ang = self.depth.index_by_angle(sample.angle);
            let z = sample.distance;
            let dz = self.depth[ang].distance;

            if self.depth[ang].quality < 0 {
                // first sighting arms the bin
                self.depth[ang] = sample;
                self.depth[ang].distance = z - threshold;
                self.timestamps[ang] = timestamp;
            } else if z < dz {
                self.depth[ang].distance = z;
                self.timestamps[ang] = timestamp;
            } else if z > dz + threshold {
                if timestamp.saturating_sub(self.timestamps[ang]) > depth_time {
                    // static change, re-learn the bin
                    self.raw[ang] = sample;
                    self.depth[ang].distance = z - threshold;
                    self.timestamps[ang] = timestamp;
                }
            } else {
                self.timestamps[ang] = timestamp;
            }
        }
    }

    /// Background classification for subtraction: beyond the learned minimum
    /// less the threshold means environment.
    pub fn is_env_sample(&self, sample: &Sample, spec: &DeviceSpec, threshold: f32) -> bool {
        if !self.valid || !self.use_env {
            return false;
        }
        let ang = self.env.index_by_angle(sample.angle);
        self.env[ang].quality > spec.min_quality
            && sample.distance > self.env[ang].distance - threshold
    }

    pub fn reset(&mut self, spec: &DeviceSpec) {
        let far = spec.max_range * 10.0;
        for i in 0..self.env.len() {
            let angle = self.env.angle_by_index(i);
            for buf in [&mut self.env, &mut self.raw, &mut self.depth] {
                buf[i].quality = -1;
                buf[i].angle = angle;
                buf[i].distance = far;
            }
        }
        self.valid = false;
    }

    /// Apply a transform change to the loaded maps.
    pub fn transform(&mut self, m: &Transform2) {
        if !self.valid {
            return;
        }
        self.env.transform(m);
        self.raw.transform(m);
    }

    /// Env files store the raw map in device coordinates.
    pub fn write_file(&self, path: &Path, matrix_inverse: &Transform2) -> Result<()> {
        let mut device_space = self.raw.clone();
        device_space.transform(matrix_inverse);
        device_space.write_file(path)
    }

    pub fn read_file(
        &mut self,
        path: &Path,
        spec: &DeviceSpec,
        params: &EnvParams,
        matrix: &Transform2,
        device_type: &str,
        timestamp: u64,
    ) -> Result<()> {
        self.raw.read_file(path)?;
        self.raw.transform(matrix);
        for ts in self.timestamps.iter_mut() {
            *ts = timestamp;
        }
        self.process(spec, params, matrix, device_type);
        info!("read environment file {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry;

    fn spec(num_samples: usize) -> DeviceSpec {
        DeviceSpec {
            max_range: 12.0,
            num_samples,
            scan_freq: 10.0,
            min_quality: 0,
            env_min_quality: 0,
        }
    }

    fn wall_scan(num_samples: usize, distance: f32, quality: i32) -> SampleBuffer {
        let mut buf = SampleBuffer::new(num_samples);
        for i in 0..num_samples {
            let angle = buf.angle_by_index(i);
            buf[i].quality = quality;
            buf[i].angle = angle;
            buf[i].distance = distance;
            buf[i].coord = polar_to_cart(angle, distance);
            buf[i].touched = true;
        }
        buf
    }

    #[test]
    fn learn_keeps_minimum() {
        let spec = spec(16);
        let mut env = EnvironmentModel::new(16);
        env.begin_scan(&spec, 1000);
        env.learn(&wall_scan(16, 2.0, 80), &spec, 1000);
        env.learn(&wall_scan(16, 3.0, 80), &spec, 1100);
        for i in 0..16 {
            assert!((env.raw()[i].distance - 2.0).abs() < 1e-6);
        }
        env.learn(&wall_scan(16, 1.5, 80), &spec, 1200);
        for i in 0..16 {
            assert!((env.raw()[i].distance - 1.5).abs() < 1e-6);
        }
    }

    #[test]
    fn nan_never_degrades_a_bin() {
        let spec = spec(16);
        let mut env = EnvironmentModel::new(16);
        env.begin_scan(&spec, 1000);
        env.learn(&wall_scan(16, 2.0, 80), &spec, 1000);
        let mut scan = wall_scan(16, 1.0, 80);
        scan[3].distance = f32::NAN;
        env.learn(&scan, &spec, 1100);
        assert!((env.raw()[3].distance - 2.0).abs() < 1e-6);
        assert!((env.raw()[4].distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn subtraction_classifies_wall_not_obstacle() {
        let spec = spec(32);
        let params = EnvParams {
            threshold: 0.2,
            ..EnvParams::default()
        };
        let mut env = EnvironmentModel::new(32);
        env.begin_scan(&spec, 1000);
        env.learn(&wall_scan(32, 2.0, 80), &spec, 1000);
        env.process(&spec, &params, &geometry::identity(), "");
        env.scanning = false;

        let mut scan = wall_scan(32, 2.0, 80);
        scan[5].distance = 1.2;
        scan[5].coord = polar_to_cart(scan[5].angle, 1.2);

        assert!(!env.is_env_sample(&scan[5], &spec, params.threshold));
        for i in 0..32 {
            if i != 5 {
                assert!(env.is_env_sample(&scan[i], &spec, params.threshold));
            }
        }
    }

    #[test]
    fn adapt_relearns_persistent_change() {
        let spec = spec(16);
        let params = EnvParams {
            adapt: true,
            adapt_sec: 1.0,
            threshold: 0.2,
            ..EnvParams::default()
        };
        let mut env = EnvironmentModel::new(16);
        env.begin_scan(&spec, 0);
        env.learn(&wall_scan(16, 1.0, 80), &spec, 0);

        let valid = vec![true; 16];
        // arm the depth envelope at 1 m
        env.adapt(&wall_scan(16, 1.0, 80), &valid, &params, 0);
        // wall moves away to 3 m; within adapt_sec nothing is re-learned
        env.adapt(&wall_scan(16, 3.0, 80), &valid, &params, 500);
        assert!((env.raw()[4].distance - 1.0).abs() < 1e-6);
        // after adapt_sec the raw map follows
        env.adapt(&wall_scan(16, 3.0, 80), &valid, &params, 1500);
        assert!(env.raw()[4].distance > 2.0);
    }

    #[test]
    fn adapt_tracks_closer_readings_immediately() {
        let spec = spec(8);
        let params = EnvParams {
            adapt: true,
            threshold: 0.2,
            ..EnvParams::default()
        };
        let mut env = EnvironmentModel::new(8);
        env.begin_scan(&spec, 0);
        let valid = vec![true; 8];
        env.adapt(&wall_scan(8, 2.0, 80), &valid, &params, 0);
        env.adapt(&wall_scan(8, 1.0, 80), &valid, &params, 100);
        for i in 0..8 {
            assert!(env.depth_distance(i) <= 1.0 + 1e-6);
        }
    }

    impl EnvironmentModel {
        fn depth_distance(&self, i: usize) -> f32 {
            self.depth[i].distance
        }
    }
}
