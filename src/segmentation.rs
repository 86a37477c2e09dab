use serde::{Deserialize, Serialize};

use crate::geometry::{self, angle_of, Point2, Transform2, Vector2};
use crate::sample_buffer::{wrap_index, SampleBuffer};

/// Curvature saturates at this fraction of a quarter turn.
const MAX_CURVATURE: f32 = 0.75;
/// Blobs whose interior samples scatter further than this (relative to the
/// chord) are dropped from marker candidates.
const MAX_LINE_SCATTER: f32 = 0.75;

const OID_MAX: u32 = 99;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectParams {
    /// Max distance between samples to be united to a single object
    pub max_distance: f32,
    /// Min extent of a group of samples to be reported as an object
    pub min_extent: f32,
    /// Extent of a group of samples to be split into several objects (0 = off)
    pub max_extent: f32,
    /// Max distance between blob centres to carry the object id across frames
    pub track_distance: f32,
}

impl Default for ObjectParams {
    fn default() -> Self {
        ObjectParams {
            max_distance: 0.35,
            min_extent: 0.1,
            max_extent: 0.0,
            track_distance: 0.5,
        }
    }
}

/// A contiguous run of valid samples treated as one object chord.
#[derive(Debug, Clone)]
pub struct Blob {
    pub lower_index: usize,
    /// May exceed the bin count when the run wraps past 0 degrees.
    pub higher_index: usize,
    pub lower_coord: Point2,
    pub higher_coord: Point2,
    pub center: Point2,
    /// Normalised device-space direction towards the blob centre.
    pub normal: Vector2,
    pub extent: f32,
    /// How far the closest sample protrudes from the chord towards the
    /// device, when in (0, 1) metres.
    pub closest: f32,
    pub curvature: f32,
    pub is_split: bool,
    pub oid: u32,
    pub timestamp: u64,
}

impl Blob {
    fn new(lower_index: usize, higher_index: usize, extent: f32) -> Self {
        Blob {
            lower_index,
            higher_index,
            lower_coord: Point2::origin(),
            higher_coord: Point2::origin(),
            center: Point2::origin(),
            normal: Vector2::zeros(),
            extent,
            closest: 0.0,
            curvature: 0.0,
            is_split: false,
            oid: 0,
            timestamp: 0,
        }
    }

    fn update_center(&mut self) {
        self.center = Point2::new(
            0.5 * (self.lower_coord.x + self.higher_coord.x),
            0.5 * (self.lower_coord.y + self.higher_coord.y),
        );
    }

    pub fn distance_to(&self, other: &Blob) -> f32 {
        geometry::distance(&self.center, &other.center)
    }

    pub fn transform(&mut self, m: &Transform2) {
        self.lower_coord = m * self.lower_coord;
        self.higher_coord = m * self.higher_coord;
        self.center = m * self.center;
    }

    pub fn translate(&mut self, offset: &Vector2) {
        self.lower_coord += offset;
        self.higher_coord += offset;
        self.center += offset;
    }
}

/// Blob list of one frame, ordered by centre angle after detection.
#[derive(Debug, Clone, Default)]
pub struct Blobs(pub Vec<Blob>);

impl Blobs {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Blob> {
        self.0.iter()
    }

    pub fn transform(&mut self, m: &Transform2) {
        if geometry::is_identity(m) {
            return;
        }
        for blob in self.0.iter_mut() {
            blob.transform(m);
        }
    }

    pub fn translate(&mut self, offset: &Vector2) {
        for blob in self.0.iter_mut() {
            blob.translate(offset);
        }
    }

    pub fn set_timestamp(&mut self, timestamp: u64) {
        for blob in self.0.iter_mut() {
            blob.timestamp = timestamp;
        }
    }

    pub fn sort_by_angle(&mut self) {
        self.0.sort_by(|a, b| {
            angle_of(&a.center)
                .partial_cmp(&angle_of(&b.center))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    pub fn center(&self) -> Point2 {
        let mut center = Vector2::zeros();
        for blob in self.0.iter() {
            center += blob.center.coords;
        }
        if !self.0.is_empty() {
            center /= self.0.len() as f32;
        }
        Point2::from(center)
    }

    /// Minimum summed centre distance over all pairings; used by the
    /// registration solver on equally-sized lists.
    pub fn distance(&self, other: &Blobs) -> f32 {
        let mut min_distance = 1000.0;
        if self.len() != other.len() || self.is_empty() {
            return min_distance;
        }
        let mut index: Vec<usize> = (0..other.len()).collect();
        loop {
            let mut distance = 0.0;
            for (i, &j) in index.iter().enumerate() {
                distance += self.0[i].distance_to(&other.0[j]);
            }
            if distance < min_distance {
                min_distance = distance;
            }
            if !next_permutation(&mut index) {
                break;
            }
        }
        min_distance
    }

    /// Drop blobs whose samples scatter too far off the chord.
    pub fn unscatter(&self, samples: &SampleBuffer, valid: &[bool]) -> Blobs {
        Blobs(
            self.0
                .iter()
                .filter(|blob| line_scatter(blob, samples, valid) <= MAX_LINE_SCATTER)
                .cloned()
                .collect(),
        )
    }

    /// All unordered blob pairs close enough to be a registration marker.
    pub fn markers(
        &self,
        samples: &SampleBuffer,
        valid: &[bool],
        max_marker_distance: f32,
    ) -> Vec<Blobs> {
        let candidates = self.unscatter(samples, valid);
        let mut markers = Vec::new();
        for a in 0..candidates.len().saturating_sub(1) {
            for b in a + 1..candidates.len() {
                if candidates.0[a].distance_to(&candidates.0[b]) < max_marker_distance {
                    let mut pair = Blobs(vec![
                        candidates.0[a].clone(),
                        candidates.0[b].clone(),
                    ]);
                    pair.sort_by_angle();
                    markers.push(pair);
                }
            }
        }
        markers
    }
}

/// JSON wire form of one device's blob list, as exchanged with hub-style
/// consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlobRecord {
    pub id: u32,
    pub x: f32,
    pub y: f32,
    pub size: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlobFrame {
    pub timestamp: u64,
    pub frame_id: u64,
    pub num_blobs: usize,
    pub blobs: Vec<BlobRecord>,
}

impl BlobFrame {
    pub fn from_blobs(blobs: &Blobs, timestamp: u64, frame_id: u64) -> Self {
        let records: Vec<BlobRecord> = blobs
            .iter()
            .map(|blob| BlobRecord {
                id: blob.oid,
                x: blob.center.x,
                y: blob.center.y,
                size: blob.extent,
            })
            .collect();
        BlobFrame {
            timestamp,
            frame_id,
            num_blobs: records.len(),
            blobs: records,
        }
    }
}

fn next_permutation(index: &mut [usize]) -> bool {
    if index.len() < 2 {
        return false;
    }
    let mut i = index.len() - 1;
    while i > 0 && index[i - 1] >= index[i] {
        i -= 1;
    }
    if i == 0 {
        return false;
    }
    let mut j = index.len() - 1;
    while index[j] <= index[i - 1] {
        j -= 1;
    }
    index.swap(i - 1, j);
    index[i..].reverse();
    true
}

/// Mean perpendicular distance of interior samples to the blob chord,
/// normalised by chord length.
pub fn line_scatter(blob: &Blob, samples: &SampleBuffer, valid: &[bool]) -> f32 {
    let n = samples.len();
    let lower = samples[blob.lower_index % n].coord;
    let chord = samples[blob.higher_index % n].coord - lower;
    let line_length = chord.norm();
    if line_length <= 0.0 {
        return 0.0;
    }
    let dir = chord / line_length;

    let mut sum = 0.0;
    let mut count = 0;
    for index in blob.lower_index + 1..blob.higher_index {
        let i = index % n;
        if !valid[i] {
            continue;
        }
        let p = samples[i].coord - lower;
        // 2D cross product magnitude = distance to the chord line
        sum += (p.x * dir.y - p.y * dir.x).abs();
        count += 1;
    }
    if count > 0 {
        sum /= count as f32;
        sum /= line_length;
    }
    sum
}

/// Curvature from three smoothed points (first sample, centroid, last
/// sample), normalised to [0, 1].
pub fn curvature_of_span(
    samples: &SampleBuffer,
    valid: &[bool],
    lower_index: usize,
    higher_index: usize,
) -> Option<f32> {
    let n = samples.len();
    let mut first = None;
    let mut last = None;
    let mut sum = Vector2::zeros();
    let mut count = 0;

    for index in lower_index..=higher_index {
        let i = index % n;
        if !valid[i] {
            continue;
        }
        let coord = samples[i].coord;
        if first.is_none() {
            first = Some(coord);
        }
        last = Some(coord);
        sum += coord.coords;
        count += 1;
    }

    if count < 2 {
        return None;
    }
    if count == 2 {
        return Some(0.0);
    }

    let first = first.unwrap();
    let last = last.unwrap();
    let centroid = Point2::from(sum / count as f32);

    let mut v0 = centroid - first;
    let mut v1 = last - centroid;
    if v0.norm() <= 0.0 || v1.norm() <= 0.0 {
        return Some(0.0);
    }
    v0 = v0.normalize();
    v1 = v1.normalize();

    let cross = v0.x * v1.y - v0.y * v1.x;
    let curv = cross.clamp(-1.0, 1.0).asin() / std::f32::consts::FRAC_PI_2 / MAX_CURVATURE;
    Some(curv.clamp(0.0, 1.0))
}

struct DetectContext<'a> {
    samples: &'a SampleBuffer,
    valid: &'a [bool],
    params: &'a ObjectParams,
    matrix_inverse: &'a Transform2,
}

impl<'a> DetectContext<'a> {
    /// Re-derive the valid end points and closest distance of a span and add
    /// the resulting blob(s).
    fn add_span(&self, objects: &mut Vec<Blob>, lower_index: usize, higher_index: usize) -> bool {
        let n = self.samples.len();
        let mut closest = 1000.0f32;
        let mut l_index = None;
        let mut h_index = None;

        for index in (lower_index..=higher_index).rev() {
            let i = index % n;
            if self.valid[i] && self.samples[i].oid != 0 {
                if h_index.is_none() {
                    h_index = Some(i);
                } else {
                    l_index = Some(i);
                }
                closest = closest.min(self.samples[i].distance);
            }
        }

        let (Some(l), Some(h)) = (l_index, h_index) else {
            return false;
        };
        let extent = geometry::distance(&self.samples[l].coord, &self.samples[h].coord);
        self.add_object(objects, l, h, extent, closest, true);
        true
    }

    fn add_object(
        &self,
        objects: &mut Vec<Blob>,
        lower_index: usize,
        higher_index: usize,
        extent: f32,
        closest: f32,
        is_split: bool,
    ) {
        let n = self.samples.len();
        let h_unwrapped = if higher_index < lower_index {
            higher_index + n
        } else {
            higher_index
        };
        let index_range = h_unwrapped - lower_index;

        if self.params.max_extent > 0.0 && extent > self.params.max_extent {
            let mut num = (extent / self.params.max_extent).ceil() as usize;
            if num == 1 {
                num = 2;
            }

            let mut split = Vec::new();
            let mut success = true;

            if num == 2 {
                // split where the two sub-chords are most curved
                let l_probe = (lower_index as f32 + 0.25 * index_range as f32).round() as usize;
                let h_probe = (lower_index as f32 + 0.75 * index_range as f32).round() as usize;

                let mut max_curvature = 0.0;
                let mut max_index = None;
                for index in l_probe..=h_probe {
                    if let (Some(c1), Some(c2)) = (
                        curvature_of_span(self.samples, self.valid, lower_index, index),
                        curvature_of_span(self.samples, self.valid, index, h_unwrapped),
                    ) {
                        let curvature = c1.abs() + c2.abs();
                        if curvature > max_curvature {
                            max_curvature = curvature;
                            max_index = Some(index);
                        }
                    }
                }

                if let Some(split_index) = max_index {
                    success &= self.add_span(&mut split, lower_index, split_index);
                    success &= self.add_span(&mut split, split_index, h_unwrapped);
                } else {
                    success = false;
                }
            } else {
                let mut last_index = lower_index;
                for i in 0..num {
                    let next_index = lower_index
                        + ((i + 1) as f32 * index_range as f32 / num as f32) as usize;
                    success &= self.add_span(&mut split, last_index, next_index);
                    last_index = next_index + 1;
                }
            }

            if success && !split.is_empty() {
                objects.append(&mut split);
                return;
            }
        }

        let mut blob = Blob::new(lower_index, h_unwrapped, extent);
        blob.is_split = is_split;
        blob.lower_coord = self.samples[lower_index % n].coord;
        blob.higher_coord = self.samples[higher_index % n].coord;
        blob.update_center();

        let device_center = self.matrix_inverse * blob.center;
        let range = device_center.coords.norm();
        if closest < 1000.0 {
            let protrusion = range - closest;
            if protrusion > 0.0 && protrusion < 1.0 {
                blob.closest = protrusion;
            }
        }
        blob.normal = if range > 0.0 {
            device_center.coords / range
        } else {
            Vector2::zeros()
        };

        objects.push(blob);
    }
}

/// Group the valid samples of the current scan into blobs. Writes per-bin
/// object ids back into `samples`.
pub fn detect_objects(
    samples: &mut SampleBuffer,
    valid: &[bool],
    params: &ObjectParams,
    matrix_inverse: &Transform2,
) -> Blobs {
    let n = samples.len();
    let mut oid_count = 1u32;
    let mut last_oid = oid_count;
    let mut last_coord: Option<Point2> = None;

    // provisional ids: a gap above max_distance starts a new object
    for i in (0..n).rev() {
        if !valid[i] {
            samples[i].oid = 0;
            continue;
        }
        if let Some(prev) = last_coord {
            if geometry::distance(&samples[i].coord, &prev) > params.max_distance {
                oid_count += 1;
                last_oid = oid_count;
            }
        }
        samples[i].oid = last_oid;
        last_coord = Some(samples[i].coord);
    }

    // make object ids continuous across the 0 degree wrap
    for i in (0..n).rev() {
        if samples[i].oid == 0 {
            break;
        }
        let prev_oid = samples[wrap_index(i as i64 + 1, n)].oid;
        if prev_oid == 0 {
            break;
        }
        samples[i].oid = prev_oid;
    }

    // anchor the walk at the first bin after the wrapped run
    let mut index_offset: i64 = -1;
    for i in 0..n / 2 {
        if samples[i].oid != 0 {
            if index_offset == -1 || samples[index_offset as usize].oid == samples[i].oid {
                index_offset = i as i64;
            } else {
                break;
            }
        }
    }

    let ctx = DetectContext {
        samples,
        valid,
        params,
        matrix_inverse,
    };
    let mut detected: Vec<Blob> = Vec::new();

    let mut lower: Option<usize> = None;
    let mut higher: Option<usize> = None;
    let mut closest = 1000.0f32;

    for count in (1..n).rev() {
        let i = wrap_index(count as i64 + index_offset, n);
        let sample = &samples[i];
        if sample.oid == 0 {
            continue;
        }
        match (lower, higher) {
            (None, _) | (_, None) => {
                higher = Some(i);
                lower = Some(i);
                closest = sample.distance;
            }
            (Some(l), Some(_)) if samples[l].oid == sample.oid => {
                lower = Some(i);
                closest = closest.min(sample.distance);
            }
            (Some(l), Some(h)) => {
                let extent = geometry::distance(&samples[l].coord, &samples[h].coord);
                if extent >= params.min_extent {
                    ctx.add_object(&mut detected, l, h, extent, closest, false);
                }
                higher = Some(i);
                lower = Some(i);
                closest = 1000.0;
            }
        }
    }

    if let (Some(l), Some(h)) = (lower, higher) {
        if l != h {
            let extent = geometry::distance(&samples[l].coord, &samples[h].coord);
            if extent >= params.min_extent {
                ctx.add_object(&mut detected, l, h, extent, closest, false);
            }
        }
    }

    for i in 0..n {
        samples[i].oid = 0;
    }

    let mut blobs = Blobs(detected);
    for blob in blobs.0.iter_mut() {
        blob.curvature =
            curvature_of_span(samples, valid, blob.lower_index, blob.higher_index).unwrap_or(0.0);
    }
    blobs
}

fn next_oid(counter: &mut u32) -> u32 {
    *counter = (*counter % OID_MAX) + 1;
    *counter
}

/// Carry object ids from the previous frame onto freshly detected blobs by
/// greedy nearest-centre matching, then write the ids into the sample bins.
pub fn track_objects(
    mut detected: Blobs,
    previous: &Blobs,
    samples: &mut SampleBuffer,
    params: &ObjectParams,
    tracking_enabled: bool,
    oid_counter: &mut u32,
) -> Blobs {
    if !tracking_enabled || detected.is_empty() || previous.is_empty() {
        for (i, blob) in detected.0.iter_mut().enumerate() {
            blob.oid = if tracking_enabled {
                next_oid(oid_counter)
            } else {
                i as u32 + 1
            };
        }
    } else {
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (di, d) in detected.0.iter().enumerate() {
            for (oi, o) in previous.0.iter().enumerate() {
                let distance = d.distance_to(o);
                if distance <= params.track_distance {
                    pairs.push((distance, di, oi));
                }
            }
        }
        pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut detected_used = vec![false; detected.len()];
        let mut previous_used = vec![false; previous.len()];
        for (_, di, oi) in pairs {
            if !detected_used[di] && !previous_used[oi] {
                detected.0[di].oid = previous.0[oi].oid;
                detected_used[di] = true;
                previous_used[oi] = true;
            }
        }
        for (di, used) in detected_used.iter().enumerate() {
            if !used {
                detected.0[di].oid = next_oid(oid_counter);
            }
        }
    }

    let n = samples.len();
    for blob in detected.0.iter() {
        for index in blob.lower_index..=blob.higher_index {
            samples[index % n].oid = blob.oid;
        }
    }

    detected.sort_by_angle();
    detected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{identity, polar_to_cart};
    use crate::sample_buffer::angle_by_index;

    fn scan_with_obstacle(n: usize, wall: f32, bins: &[usize], obstacle: f32) -> SampleBuffer {
        let mut buf = SampleBuffer::new(n);
        for i in 0..n {
            let angle = angle_by_index(i, n);
            let distance = if bins.contains(&i) { obstacle } else { wall };
            buf[i].quality = 80;
            buf[i].angle = angle;
            buf[i].distance = distance;
            buf[i].coord = polar_to_cart(angle, distance);
            buf[i].touched = true;
        }
        buf
    }

    #[test]
    fn single_obstacle_yields_single_blob() {
        let n = 360;
        let mut samples = scan_with_obstacle(n, 10.0, &[40, 41, 42, 43], 1.0);
        // only the obstacle bins count as valid (wall subtracted)
        let valid: Vec<bool> = (0..n).map(|i| (40..=43).contains(&i)).collect();
        let params = ObjectParams {
            min_extent: 0.01,
            ..ObjectParams::default()
        };
        let blobs = detect_objects(&mut samples, &valid, &params, &identity());
        assert_eq!(blobs.len(), 1);
        let blob = &blobs.0[0];
        assert!(blob.extent > 0.0);
        let expected_angle = angle_by_index(41, n);
        assert!((angle_of(&blob.center) - expected_angle).abs() < 0.1);
    }

    #[test]
    fn gap_splits_objects() {
        let n = 360;
        let mut samples = scan_with_obstacle(n, 10.0, &[40, 41, 42, 120, 121], 2.0);
        let valid: Vec<bool> =
            (0..n).map(|i| [40, 41, 42, 120, 121].contains(&i)).collect();
        let params = ObjectParams {
            min_extent: 0.01,
            ..ObjectParams::default()
        };
        let blobs = detect_objects(&mut samples, &valid, &params, &identity());
        assert_eq!(blobs.len(), 2);
    }

    #[test]
    fn wrap_continuity_at_zero_degrees() {
        let n = 360;
        let bins = [358usize, 359, 0, 1];
        let mut samples = scan_with_obstacle(n, 10.0, &bins, 2.0);
        let valid: Vec<bool> = (0..n).map(|i| bins.contains(&i)).collect();
        let params = ObjectParams {
            min_extent: 0.01,
            ..ObjectParams::default()
        };
        let blobs = detect_objects(&mut samples, &valid, &params, &identity());
        assert_eq!(blobs.len(), 1);
    }

    #[test]
    fn short_chord_is_dropped() {
        let n = 360;
        let mut samples = scan_with_obstacle(n, 10.0, &[50], 2.0);
        let valid: Vec<bool> = (0..n).map(|i| i == 50).collect();
        let params = ObjectParams::default();
        let blobs = detect_objects(&mut samples, &valid, &params, &identity());
        assert!(blobs.is_empty());
    }

    #[test]
    fn oversized_blob_is_split() {
        let n = 360;
        let bins: Vec<usize> = (30..90).collect();
        let mut samples = scan_with_obstacle(n, 10.0, &bins, 2.0);
        let valid: Vec<bool> = (0..n).map(|i| bins.contains(&i)).collect();
        let params = ObjectParams {
            min_extent: 0.01,
            max_extent: 0.8,
            ..ObjectParams::default()
        };
        let blobs = detect_objects(&mut samples, &valid, &params, &identity());
        assert!(blobs.len() >= 2);
        assert!(blobs.iter().all(|b| b.is_split));
    }

    #[test]
    fn tracking_carries_oid() {
        let n = 360;
        let params = ObjectParams {
            min_extent: 0.01,
            ..ObjectParams::default()
        };
        let mut oid_counter = 0;

        let mut samples = scan_with_obstacle(n, 10.0, &[40, 41, 42], 2.0);
        let valid: Vec<bool> = (0..n).map(|i| (40..=42).contains(&i)).collect();
        let detected = detect_objects(&mut samples, &valid, &params, &identity());
        let previous = track_objects(
            detected,
            &Blobs::default(),
            &mut samples,
            &params,
            true,
            &mut oid_counter,
        );
        let first_oid = previous.0[0].oid;
        assert!(first_oid > 0);

        // object moves one bin over
        let mut samples = scan_with_obstacle(n, 10.0, &[41, 42, 43], 2.0);
        let valid: Vec<bool> = (0..n).map(|i| (41..=43).contains(&i)).collect();
        let detected = detect_objects(&mut samples, &valid, &params, &identity());
        let tracked = track_objects(
            detected,
            &previous,
            &mut samples,
            &params,
            true,
            &mut oid_counter,
        );
        assert_eq!(tracked.0[0].oid, first_oid);
    }

    #[test]
    fn marker_needs_two_blobs() {
        let n = 360;
        let bins = [40usize, 41, 42];
        let mut samples = scan_with_obstacle(n, 10.0, &bins, 2.0);
        let valid: Vec<bool> = (0..n).map(|i| bins.contains(&i)).collect();
        let params = ObjectParams {
            min_extent: 0.01,
            ..ObjectParams::default()
        };
        let blobs = detect_objects(&mut samples, &valid, &params, &identity());
        assert_eq!(blobs.len(), 1);
        assert!(blobs.markers(&samples, &valid, 2.5).is_empty());
    }

    #[test]
    fn blob_frame_json_round_trip() {
        let n = 360;
        let bins = [40usize, 41, 42];
        let mut samples = scan_with_obstacle(n, 10.0, &bins, 2.0);
        let valid: Vec<bool> = (0..n).map(|i| bins.contains(&i)).collect();
        let params = ObjectParams {
            min_extent: 0.01,
            ..ObjectParams::default()
        };
        let mut oid_counter = 0;
        let detected = detect_objects(&mut samples, &valid, &params, &identity());
        let blobs = track_objects(
            detected,
            &Blobs::default(),
            &mut samples,
            &params,
            true,
            &mut oid_counter,
        );

        let frame = BlobFrame::from_blobs(&blobs, 1_000, 7);
        let json = serde_json::to_string(&frame).unwrap();
        let back: BlobFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(frame, back);
        assert_eq!(back.num_blobs, 1);
        assert!(back.blobs[0].id > 0);
    }

    #[test]
    fn marker_pair_within_distance() {
        let n = 720;
        let bins = [100usize, 101, 102, 140, 141, 142];
        let mut samples = scan_with_obstacle(n, 10.0, &bins, 2.0);
        let valid: Vec<bool> = (0..n).map(|i| bins.contains(&i)).collect();
        let params = ObjectParams {
            min_extent: 0.005,
            ..ObjectParams::default()
        };
        let blobs = detect_objects(&mut samples, &valid, &params, &identity());
        assert_eq!(blobs.len(), 2);
        let markers = blobs.markers(&samples, &valid, 2.5);
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].len(), 2);
    }
}
