use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::Parser;
use env_logger::Env;
use log::{debug, error, info, warn};

use lidar2d_fusion::config::ProcessConfig;
use lidar2d_fusion::device::{DeviceConfig, DeviceStage};
use lidar2d_fusion::observer::file::{FileObserver, PackedFileObserver};
use lidar2d_fusion::observer::net::{OscObserver, UdpObserver};
use lidar2d_fusion::observer::ObserverBus;
use lidar2d_fusion::player::PlaybackEngine;
use lidar2d_fusion::registration::RegistrationSolver;
use lidar2d_fusion::scan_source::{DeviceSpec, SimulatedSource};
use lidar2d_fusion::tracker::{MultiStageTracker, StageObject};
use lidar2d_fusion::util::getmsec;

mod cli;
use cli::Cli;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler = handle_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as usize);
        libc::signal(libc::SIGHUP, handler as usize);
        libc::signal(libc::SIGTERM, handler as usize);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn build_observers(cli: &Cli) -> ObserverBus {
    let mut bus = ObserverBus::default();

    if let Some(file) = &cli.log_file {
        bus.add(Box::new(FileObserver::new("file", file)));
    }
    if let Some(file) = &cli.packed_file {
        bus.add(Box::new(PackedFileObserver::new("packedfile", file)));
    }
    if let Some(address) = &cli.udp {
        bus.add(Box::new(UdpObserver::new("udp", address)));
    }
    if let Some(address) = &cli.osc {
        let mut observer = OscObserver::new("osc", address);
        if let Some(scheme_file) = &cli.scheme_file {
            match std::fs::read_to_string(scheme_file) {
                Ok(text) => {
                    observer.base.set_scheme(&text);
                }
                Err(e) => error!("scheme file {}: {e}", scheme_file.display()),
            }
        }
        bus.add(Box::new(observer));
    }
    bus
}

/// Replay recorded frames straight into the observers.
fn run_playback(cli: &Cli, mut bus: ObserverBus) -> anyhow::Result<()> {
    let paths: Vec<(String, PathBuf)> = cli
        .playback
        .iter()
        .enumerate()
        .map(|(i, p)| (format!("file{i}"), p.clone()))
        .collect();
    let mut engine = PlaybackEngine::open(&paths)?;
    engine.set_play_pos(cli.playback_pos)?;
    bus.start(engine.clock.time_stamp());

    while !SHUTDOWN.load(Ordering::SeqCst) && !engine.at_end() {
        for (id, frame) in engine.tick()? {
            debug!("playback {id}: frame with {} objects", frame.len());
            bus.observe(&frame, false);
        }
    }

    bus.stop(engine.clock.time_stamp());
    bus.flush();
    Ok(())
}

/// Live pipeline: device stages feed the tracker, the tracker feeds the
/// observers.
fn run_live(cli: &Cli, config: &ProcessConfig, mut bus: ObserverBus) -> anyhow::Result<()> {
    let device_config = DeviceConfig {
        object: config.object,
        env: config.env,
        env_threshold: config.env.threshold,
        ..DeviceConfig::default()
    };

    let mut stages: Vec<DeviceStage> = Vec::new();
    for id in cli.simulate.iter() {
        let source = SimulatedSource::new(DeviceSpec::default(), 4.0);
        let mut stage = DeviceStage::new(id, device_config.clone(), Box::new(source));
        stage.open();
        stages.push(stage);
    }
    if stages.is_empty() {
        warn!("no devices configured, nothing to track");
        return Ok(());
    }

    if cli.env_scan {
        info!("scanning environment for {} s", config.env.scan_sec);
        for stage in stages.iter() {
            stage.env_scan(config.env.scan_sec);
        }
        thread::sleep(Duration::from_secs_f32(config.env.scan_sec + 1.0));
    }

    if cli.register {
        let mut solver = RegistrationSolver::new(config.register);
        info!("registration: accumulating for {} s", config.register.sec);
        solver.start(&mut stages);
        thread::sleep(Duration::from_secs(config.register.sec as u64));
        let report = solver.finish(&mut stages);
        info!("registration result:\n{}", report.message);
        if report.complete {
            for stage in stages.iter() {
                let state = stage.lock();
                let path = config.config_file_name(&format!("{}.matrix", stage.id));
                if let Err(e) = state.write_matrix_file(&path) {
                    error!("device {}: {e}", stage.id);
                }
            }
        } else {
            warn!("registration incomplete, keeping previous matrices");
        }
    }

    let mut tracker = MultiStageTracker::new(config.track);
    let now = getmsec();
    tracker.start(now);
    bus.start(now);

    while !SHUTDOWN.load(Ordering::SeqCst) {
        let mut frame_time = 0u64;
        for stage in stages.iter() {
            let (objects, timestamp) = {
                let state = stage.lock();
                (state.objects.clone(), state.timestamp)
            };
            // the fused frame runs on the newest device timestamp
            if timestamp > frame_time {
                frame_time = timestamp;
            }
            let stage_objects: Vec<StageObject> = objects
                .iter()
                .map(|blob| StageObject {
                    pos: blob.center,
                    size: blob.extent,
                    split_prob: if blob.is_split { blob.curvature } else { 0.0 },
                })
                .collect();
            tracker.set_stage_objects(&stage.id, stage_objects, timestamp);
        }

        if frame_time > 0 {
            let frame = tracker.unite(frame_time);
            bus.observe(&frame, false);
        }
        thread::sleep(Duration::from_millis(20));
    }

    info!("shutting down {} device stages", stages.len());
    for stage in stages.iter_mut() {
        stage.close();
    }
    bus.stop(getmsec());
    bus.flush();
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    // Initialize the logger from the environment
    env_logger::Builder::from_env(Env::default().default_filter_or(&cli.log_level)).init();

    debug!("started; args: {:?}", cli);
    install_signal_handlers();

    let mut config = match ProcessConfig::load(std::path::Path::new(&cli.config_path)) {
        Ok(config) => config,
        Err(e) => {
            // invalid values are fatal during startup
            error!("error loading config: {e}");
            std::process::exit(1);
        }
    };
    cli.apply_to(&mut config);

    let bus = build_observers(&cli);

    let result = if !cli.playback.is_empty() {
        run_playback(&cli, bus)
    } else {
        run_live(&cli, &config, bus)
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}
