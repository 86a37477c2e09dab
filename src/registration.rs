use log::info;
use serde::{Deserialize, Serialize};

use crate::device::DeviceStage;
use crate::geometry::{self, angle_of, Transform2, Vector2};
use crate::segmentation::Blobs;

/// Coarse and fine rotation probes per translation sample.
const NUM_ROTATION_SAMPLES_COARSE: usize = 51;
const NUM_ROTATION_SAMPLES_FINE: usize = 27;
/// Fibonacci-spiral translation probes around the marker centroids.
const NUM_TRANSLATION_SAMPLES: usize = 125;
const MAX_TRANSLATION_RADIUS: f32 = 0.025;
const ROTATION_RANGE: f32 = 20.0 / 180.0 * std::f32::consts::PI;
/// Rounds of transitive closure over the pairwise transform graph.
const CLOSURE_ROUNDS: usize = 10;

/// Object parameters forced while accumulating marker scans.
const REGISTER_OBJECT_MAX_DISTANCE: f32 = 0.07;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterParams {
    /// Seconds of accumulation per registration pass
    pub sec: u32,
    /// Max distance between the two blobs of a marker
    pub max_object_distance_of_markers: f32,
    /// Max residual for a pairwise transform to be accepted
    pub marker_match_difference: f32,
}

impl Default for RegisterParams {
    fn default() -> Self {
        RegisterParams {
            sec: 10,
            max_object_distance_of_markers: 2.5,
            marker_match_difference: 0.1,
        }
    }
}

fn phi(i: usize) -> f32 {
    i as f32 * (1.0 + 5.0f32.sqrt()) / 2.0
}

/// Best rotation aligning `me` onto `other` around the anchor blob, probed
/// by walking every blob of `me` onto the first blob of `other`.
fn calc_rotation_to(
    me: &Blobs,
    other: &Blobs,
    angle_offset: f32,
) -> Option<(f32, f32)> {
    if me.len() != other.len() || me.is_empty() {
        return None;
    }

    let ot_angle = angle_of(&other.0[0].center);
    let mut ot = other.clone();
    let mut me = me.clone();
    ot.transform(&geometry::rot_z(-ot_angle));
    me.transform(&geometry::rot_z(-ot_angle));

    let mut min_angle = 0.0;
    let mut min_distance = 1000.0;
    let mut angle = angle_offset;

    for i in 0..me.len() {
        let me_angle = angle_of(&me.0[i].center);
        angle -= me_angle;

        me.transform(&geometry::rot_z(-me_angle + angle_offset));
        let mut distance = me.distance(&ot);
        distance *= distance;
        me.transform(&geometry::rot_z(-angle_offset));

        if distance < min_distance {
            min_angle = angle;
            min_distance = distance;
        }
    }

    Some((min_angle, min_distance))
}

/// Probe `num_samples` offsets over `angle_range` (each also at +π) and keep
/// the best rotation found so far.
fn calc_rotation_range_to(
    me: &Blobs,
    other: &Blobs,
    min_angle: &mut f32,
    min_distance: &mut f32,
    angle_range: f32,
    angle_offset: &mut f32,
    num_samples: usize,
) -> bool {
    if me.len() != other.len() || me.is_empty() {
        return false;
    }

    let offset = *angle_offset;
    for i in (0..num_samples).rev() {
        let sample_offset =
            offset - 0.5 * angle_range + i as f32 * angle_range / num_samples as f32;

        for probe in [sample_offset, sample_offset + std::f32::consts::PI] {
            if let Some((angle, distance)) = calc_rotation_to(me, other, probe) {
                if distance < *min_distance {
                    *min_angle = angle;
                    *min_distance = distance;
                    *angle_offset = probe;
                }
            }
        }
    }
    true
}

/// Search the rigid transform taking `me` onto `other`, exploring coarse and
/// fine rotations from a Fibonacci spiral of translation offsets. Updates
/// the matrices when a lower residual is found.
fn calc_transform_to(
    me: &Blobs,
    other: &Blobs,
    me_matrix: &mut Transform2,
    ot_matrix: &mut Transform2,
    min_distance: &mut f32,
) -> bool {
    if me.len() != other.len() || me.is_empty() {
        return false;
    }

    let me_center = me.center();
    let ot_center = other.center();

    let radius_weight = if NUM_TRANSLATION_SAMPLES > 1 {
        MAX_TRANSLATION_RADIUS / ((NUM_TRANSLATION_SAMPLES - 1) as f32).sqrt()
    } else {
        0.0
    };

    for i in 0..NUM_TRANSLATION_SAMPLES {
        let mut me_probe = me.clone();
        let mut ot_probe = other.clone();

        let spiral_angle = phi(i);
        let radius = (i as f32).sqrt() * radius_weight;
        let me_offset = Vector2::new(radius * spiral_angle.cos(), radius * spiral_angle.sin());

        me_probe.translate(&(-me_center.coords + me_offset));
        ot_probe.translate(&-ot_center.coords);

        let mut angle = 0.0;
        let mut distance = 1000.0;
        let mut angle_offset = 0.0;

        if calc_rotation_range_to(
            &me_probe,
            &ot_probe,
            &mut angle,
            &mut distance,
            ROTATION_RANGE,
            &mut angle_offset,
            NUM_ROTATION_SAMPLES_COARSE,
        ) && calc_rotation_range_to(
            &me_probe,
            &ot_probe,
            &mut angle,
            &mut distance,
            ROTATION_RANGE / 30.0,
            &mut angle_offset,
            NUM_ROTATION_SAMPLES_FINE,
        ) && distance < *min_distance
        {
            *min_distance = distance;
            *ot_matrix = geometry::translation(-ot_center.x, -ot_center.y);
            *me_matrix = geometry::rot_z(angle) * geometry::translation(-me_center.x, -me_center.y);
        }
    }

    true
}

/// Best transform over every marker-pair combination of two devices.
pub fn markers_transform(
    me_markers: &[Blobs],
    ot_markers: &[Blobs],
    me_matrix: &mut Transform2,
    ot_matrix: &mut Transform2,
) -> f32 {
    let mut min_distance = 1000.0;
    for me in me_markers {
        for ot in ot_markers {
            calc_transform_to(me, ot, me_matrix, ot_matrix, &mut min_distance);
        }
    }
    min_distance
}

#[derive(Debug, Clone, Copy)]
struct BasisChange {
    matrix: Transform2,
    error: f32,
    valid: bool,
}

impl Default for BasisChange {
    fn default() -> Self {
        BasisChange {
            matrix: geometry::identity(),
            error: 0.0,
            valid: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct RegistrationReport {
    pub complete: bool,
    /// Human-readable trail of edges chosen or missing
    pub message: String,
}

/// Solves the per-device matrices that bring every stage into device 0's
/// frame, from pairwise marker matches plus transitive closure.
pub struct RegistrationSolver {
    pub params: RegisterParams,
    saved_object_params: Vec<(f32, f32)>,
}

impl RegistrationSolver {
    pub fn new(params: RegisterParams) -> Self {
        RegistrationSolver {
            params,
            saved_object_params: Vec::new(),
        }
    }

    /// Enter accumulation mode with tightened object parameters.
    pub fn start(&mut self, devices: &mut [DeviceStage]) {
        self.saved_object_params.clear();
        for device in devices.iter_mut() {
            let mut state = device.lock();
            self.saved_object_params
                .push((state.config.object.max_distance, state.config.object.max_extent));
            state.config.object.max_distance = REGISTER_OBJECT_MAX_DISTANCE;
            state.config.object.max_extent = 0.0;
            state.set_accum(true);
        }
    }

    /// Leave accumulation mode, solve the transform graph and apply it.
    pub fn finish(&mut self, devices: &mut [DeviceStage]) -> RegistrationReport {
        let n = devices.len();
        let mut report = RegistrationReport::default();
        let mut basis: Vec<Vec<BasisChange>> = (0..n)
            .map(|d| {
                let mut row = vec![BasisChange::default(); n];
                row[d].valid = true;
                row
            })
            .collect();

        // collect device-space markers from the accumulated buffers
        let mut markers: Vec<Vec<Blobs>> = Vec::with_capacity(n);
        for device in devices.iter_mut() {
            let mut state = device.lock();
            state.cleanup_accum(self.params.sec);
            state.detect_accum_objects();
            let mut device_markers =
                state.accum_markers(self.params.max_object_distance_of_markers);
            let inverse = *state.matrix_inverse();
            for marker in device_markers.iter_mut() {
                marker.transform(&inverse);
            }
            markers.push(device_markers);
        }

        for d0 in (1..n).rev() {
            for d1 in (0..d0).rev() {
                let mut me_matrix = geometry::identity();
                let mut ot_matrix = geometry::identity();
                let distance = markers_transform(
                    &markers[d1],
                    &markers[d0],
                    &mut me_matrix,
                    &mut ot_matrix,
                );
                report.message.push_str(&format!(
                    "id({}) m={} -> id({}) m={} distance={}\n",
                    d1,
                    markers[d1].len(),
                    d0,
                    markers[d0].len(),
                    distance
                ));

                if distance < self.params.marker_match_difference {
                    let error = distance * distance;
                    let dev1_to_dev0 = ot_matrix.inverse() * me_matrix;
                    basis[d1][d0] = BasisChange {
                        matrix: dev1_to_dev0,
                        error,
                        valid: true,
                    };
                    basis[d0][d1] = BasisChange {
                        matrix: dev1_to_dev0.inverse(),
                        error,
                        valid: true,
                    };
                }
            }
        }

        let complete = close_graph(&mut basis, &mut report.message);
        report.complete = complete;
        report
            .message
            .push_str(if complete { "complete\n" } else { "incomplete\n" });

        if complete {
            let identity = geometry::identity();
            for (d1, device) in devices.iter_mut().enumerate() {
                for d0 in 0..n {
                    if basis[d1][d0].valid {
                        let mut state = device.lock();
                        state.set_device_matrix(basis[d1][d0].matrix);
                        state.set_view_matrix(identity);
                        break;
                    }
                }
            }
        }

        // restore live-tracking object parameters and leave accumulation
        for (device, (max_distance, max_extent)) in
            devices.iter_mut().zip(self.saved_object_params.drain(..))
        {
            let mut state = device.lock();
            state.config.object.max_distance = max_distance;
            state.config.object.max_extent = max_extent;
            state.set_accum(false);
        }

        info!(
            "registration {}",
            if report.complete { "complete" } else { "incomplete" }
        );
        report
    }
}

/// Replace direct edges whenever a two-hop path has lower error; missing
/// edges after closure make the pass incomplete.
fn close_graph(basis: &mut [Vec<BasisChange>], message: &mut String) -> bool {
    let n = basis.len();
    for _step in 0..CLOSURE_ROUNDS {
        for i in 0..n.saturating_sub(1) {
            for j in i + 1..n {
                for k in 0..n {
                    if !basis[i][k].valid || !basis[k][j].valid {
                        continue;
                    }
                    let error = basis[i][k].error + basis[k][j].error;
                    if !basis[i][j].valid || error < basis[i][j].error {
                        message.push_str(&format!(
                            "{} id({}) -> id({}) via id({}) (error={})\n",
                            if basis[i][j].valid {
                                "overwriting"
                            } else {
                                "choosing   "
                            },
                            i,
                            j,
                            k,
                            error
                        ));
                        let matrix = basis[k][j].matrix * basis[i][k].matrix;
                        basis[i][j] = BasisChange {
                            matrix,
                            error,
                            valid: true,
                        };
                        basis[j][i] = BasisChange {
                            matrix: matrix.inverse(),
                            error,
                            valid: true,
                        };
                    }
                }
            }
        }
    }

    let mut complete = true;
    for i in 0..n.saturating_sub(1) {
        for j in i + 1..n {
            if !basis[i][j].valid {
                message.push_str(&format!("missing transformation: id({}) -> id({})\n", i, j));
                complete = false;
            }
        }
    }
    complete
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{distance, rot_z, translation, Point2};
    use crate::segmentation::Blob;

    fn blob_at(x: f32, y: f32) -> Blob {
        let mut blob = Blob {
            lower_index: 0,
            higher_index: 0,
            lower_coord: Point2::new(x - 0.025, y),
            higher_coord: Point2::new(x + 0.025, y),
            center: Point2::new(x, y),
            normal: crate::geometry::Vector2::new(0.0, 1.0),
            extent: 0.05,
            closest: 0.0,
            curvature: 0.0,
            is_split: false,
            oid: 0,
            timestamp: 0,
        };
        blob.center = Point2::new(x, y);
        blob
    }

    fn marker(a: (f32, f32), b: (f32, f32)) -> Blobs {
        let mut pair = Blobs(vec![blob_at(a.0, a.1), blob_at(b.0, b.1)]);
        pair.sort_by_angle();
        pair
    }

    #[test]
    fn identical_markers_align_with_zero_residual() {
        let me = marker((0.0, 2.0), (1.5, 2.0));
        let ot = marker((0.0, 2.0), (1.5, 2.0));
        let mut me_matrix = geometry::identity();
        let mut ot_matrix = geometry::identity();
        let residual = markers_transform(
            &[me.clone()],
            &[ot],
            &mut me_matrix,
            &mut ot_matrix,
        );
        assert!(residual < 0.01, "residual {residual}");
    }

    #[test]
    fn translated_marker_recovers_offset() {
        // the same two pillars seen from a device displaced by (0.5, -0.25)
        let world = marker((0.0, 2.0), (1.5, 2.0));
        let mut seen = world.clone();
        seen.translate(&crate::geometry::Vector2::new(-0.5, 0.25));

        let mut me_matrix = geometry::identity();
        let mut ot_matrix = geometry::identity();
        let residual =
            markers_transform(&[seen.clone()], &[world.clone()], &mut me_matrix, &mut ot_matrix);
        assert!(residual < 0.1, "residual {residual}");

        let to_world = ot_matrix.inverse() * me_matrix;
        for (blob, expect) in seen.iter().zip(world.iter()) {
            let mapped = to_world * blob.center;
            assert!(
                distance(&mapped, &expect.center) < 0.1,
                "mapped {:?} vs {:?}",
                mapped,
                expect.center
            );
        }
    }

    #[test]
    fn rotated_marker_recovers_rotation() {
        let world = marker((0.0, 2.0), (1.5, 2.0));
        let mut seen = world.clone();
        // small rotation within the probed range
        seen.transform(&(translation(0.2, 0.0) * rot_z(0.08)));

        let mut me_matrix = geometry::identity();
        let mut ot_matrix = geometry::identity();
        let residual =
            markers_transform(&[seen.clone()], &[world.clone()], &mut me_matrix, &mut ot_matrix);
        assert!(residual < 0.1, "residual {residual}");

        let to_world = ot_matrix.inverse() * me_matrix;
        for (blob, expect) in seen.iter().zip(world.iter()) {
            let mapped = to_world * blob.center;
            assert!(distance(&mapped, &expect.center) < 0.1);
        }
    }

    #[test]
    fn closure_fills_missing_edges() {
        let mut basis: Vec<Vec<BasisChange>> = (0..3)
            .map(|d| {
                let mut row = vec![BasisChange::default(); 3];
                row[d].valid = true;
                row
            })
            .collect();
        let m01 = translation(1.0, 0.0);
        let m12 = translation(0.0, 2.0);
        basis[0][1] = BasisChange {
            matrix: m01,
            error: 0.01,
            valid: true,
        };
        basis[1][0] = BasisChange {
            matrix: m01.inverse(),
            error: 0.01,
            valid: true,
        };
        basis[1][2] = BasisChange {
            matrix: m12,
            error: 0.01,
            valid: true,
        };
        basis[2][1] = BasisChange {
            matrix: m12.inverse(),
            error: 0.01,
            valid: true,
        };

        let mut message = String::new();
        assert!(close_graph(&mut basis, &mut message));
        assert!(basis[0][2].valid);
        let p = basis[0][2].matrix * Point2::origin();
        assert!(distance(&p, &Point2::new(1.0, 2.0)) < 1e-4);
    }

    #[test]
    fn incomplete_graph_reports_missing_edge() {
        let mut basis: Vec<Vec<BasisChange>> = (0..3)
            .map(|d| {
                let mut row = vec![BasisChange::default(); 3];
                row[d].valid = true;
                row
            })
            .collect();
        basis[0][1].valid = true;
        basis[1][0].valid = true;

        let mut message = String::new();
        assert!(!close_graph(&mut basis, &mut message));
        assert!(message.contains("missing transformation"));
    }
}
