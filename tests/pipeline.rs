use lidar2d_fusion::device::{DeviceConfig, DeviceStage};
use lidar2d_fusion::frame::obj_flags;
use lidar2d_fusion::geometry::{angle_of, distance, Point2};
use lidar2d_fusion::observer::file::PackedFileObserver;
use lidar2d_fusion::observer::Observer;
use lidar2d_fusion::packed::PackedReader;
use lidar2d_fusion::player::PackedPlayer;
use lidar2d_fusion::registration::{RegisterParams, RegistrationSolver};
use lidar2d_fusion::sample_buffer::index_by_angle;
use lidar2d_fusion::scan_source::{DeviceSpec, RawSample, SimulatedSource};
use lidar2d_fusion::segmentation::ObjectParams;
use lidar2d_fusion::tracker::{MultiStageTracker, StageObject, TrackParams};

const NUM_SAMPLES: usize = 720;

fn test_spec() -> DeviceSpec {
    DeviceSpec {
        max_range: 12.0,
        num_samples: NUM_SAMPLES,
        scan_freq: 10.0,
        min_quality: 0,
        env_min_quality: 0,
    }
}

fn pillar_device(id: &str) -> DeviceStage {
    let config = DeviceConfig {
        object: ObjectParams {
            min_extent: 0.02,
            ..ObjectParams::default()
        },
        ..DeviceConfig::default()
    };
    let stage = DeviceStage::new(
        id,
        config,
        Box::new(SimulatedSource::new(test_spec(), 4.0)),
    );
    stage.lock().set_spec(test_spec());
    stage
}

/// A scan where only a few pillars return anything; each pillar covers a
/// small fan of adjacent bins.
fn pillar_scan(device_pos: (f32, f32), pillars: &[(f32, f32)]) -> Vec<RawSample> {
    let mut nodes: Vec<RawSample> = (0..NUM_SAMPLES)
        .map(|i| RawSample {
            angle: i as f32 / NUM_SAMPLES as f32 * std::f32::consts::TAU,
            distance: 0.0,
            quality: 0,
        })
        .collect();

    for (px, py) in pillars {
        let local = Point2::new(px - device_pos.0, py - device_pos.1);
        let range = distance(&local, &Point2::origin());
        let center_bin = index_by_angle(angle_of(&local), NUM_SAMPLES) as i64;
        for offset in -2..=2i64 {
            let bin = ((center_bin + offset + NUM_SAMPLES as i64) % NUM_SAMPLES as i64) as usize;
            nodes[bin].distance = range;
            nodes[bin].quality = 80;
        }
    }
    nodes
}

/// Two devices looking at the same pair of pillars from different poses;
/// the registration pass recovers device 1's offset.
#[test]
fn registration_of_two_devices() {
    let pillars = [(0.2, 2.0), (1.7, 2.0)];
    let dev1_pos = (0.5, 0.0);

    let mut stages = vec![pillar_device("dev0"), pillar_device("dev1")];
    let mut solver = RegistrationSolver::new(RegisterParams::default());
    solver.start(&mut stages);

    let scan0 = pillar_scan((0.0, 0.0), &pillars);
    let scan1 = pillar_scan(dev1_pos, &pillars);
    for frame in 0..20u64 {
        let ts = 1_000 + frame * 100;
        stages[0].inject_scan(&scan0, ts);
        stages[1].inject_scan(&scan1, ts);
    }

    let report = solver.finish(&mut stages);
    assert!(report.complete, "registration failed:\n{}", report.message);

    // applying the solved matrix to device 1's view of a pillar must land
    // on device 0's view of it
    let state = stages[1].lock();
    let matrix = *state.device_matrix();
    for (px, py) in pillars {
        let local = Point2::new(px - dev1_pos.0, py - dev1_pos.1);
        let mapped = matrix * local;
        let expected = Point2::new(px, py);
        assert!(
            distance(&mapped, &expected) < 0.1,
            "pillar ({px},{py}) mapped to {mapped:?}"
        );
    }
}

/// Scans through tracker, recorder and player: what was tracked is what
/// comes back out of the packed file.
#[test]
fn track_record_replay_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.pkd");

    let stage = pillar_device("dev0");
    let mut tracker = MultiStageTracker::new(TrackParams {
        min_active_time: 300,
        ..TrackParams::default()
    });
    tracker.start(1_000);

    {
        let mut recorder = PackedFileObserver::new("packedfile", path.to_str().unwrap());
        recorder.start(1_000);

        // a pillar drifting sideways for 2 s at 10 Hz
        for frame in 0..20u64 {
            let ts = 1_000 + frame * 100;
            let x = 0.6 + frame as f32 * 0.02;
            let scan = pillar_scan((0.0, 0.0), &[(x, 2.0)]);
            stage.inject_scan(&scan, ts);

            let objects: Vec<StageObject> = stage
                .get_objects()
                .iter()
                .map(|blob| StageObject {
                    pos: blob.center,
                    size: blob.extent,
                    split_prob: 0.0,
                })
                .collect();
            tracker.set_stage_objects("dev0", objects, ts);
            let fused = tracker.unite(ts);
            recorder.observe(&fused, true);
        }
        recorder.stop(3_100);
    }

    let mut player = PackedPlayer::new(PackedReader::open(&path).unwrap());
    let mut frames = Vec::new();
    while let Some(frame) = player.next_frame().unwrap() {
        frames.push(frame);
    }
    assert!(!frames.is_empty());

    // activation takes min_active_time, after that every frame has the object
    let tracked: Vec<_> = frames.iter().filter(|f| !f.is_empty()).collect();
    assert!(tracked.len() >= 10, "only {} tracked frames", tracked.len());
    for frame in tracked.iter() {
        assert_eq!(frame.len(), 1);
        let object = frame.objects.values().next().unwrap();
        assert_eq!(object.id, 1);
        assert!(object.flags & obj_flags::TOUCHED != 0);
        // positions round-trip at centimetre resolution
        assert!(object.y > 1.8 && object.y < 2.2, "y = {}", object.y);
        assert!(object.x > 0.4 && object.x < 1.2, "x = {}", object.x);
    }

    // timestamps are monotone
    for pair in frames.windows(2) {
        assert!(pair[1].timestamp >= pair[0].timestamp);
    }
}
