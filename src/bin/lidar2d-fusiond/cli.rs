use std::path::PathBuf;

use clap::{command, Parser};

use lidar2d_fusion::config::ProcessConfig;

// Some defaults; some of which can be overridden via CLI args
const CONFIG_FILE_PATH: &str = "./fusion.json";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Where to load the pipeline config
    #[arg(long="configPath", default_value_t=String::from(CONFIG_FILE_PATH))]
    pub config_path: String,

    #[arg(long = "loglevel", default_value_t=String::from("info"))]
    pub log_level: String,

    /// Simulated devices to create (repeatable): a device id
    #[arg(long = "simulate")]
    pub simulate: Vec<String>,

    /// Packed files to play back instead of live devices (repeatable)
    #[arg(long = "playback")]
    pub playback: Vec<PathBuf>,

    /// Start playback at this fraction of the recording
    #[arg(long = "playback.pos", default_value_t = 0.0)]
    pub playback_pos: f32,

    /// Scan the environment for lidar.env.scanSec seconds on startup
    #[arg(long = "envScan")]
    pub env_scan: bool,

    /// Run a registration pass on startup and save the solved matrices
    #[arg(long = "register")]
    pub register: bool,

    /// JSON-lines log observer output file ("-" for stdout)
    #[arg(long = "logFile")]
    pub log_file: Option<String>,

    /// Packed recorder output file
    #[arg(long = "packedFile")]
    pub packed_file: Option<String>,

    /// UDP observer destination, host:port
    #[arg(long = "udp")]
    pub udp: Option<String>,

    /// OSC observer destination, host:port
    #[arg(long = "osc")]
    pub osc: Option<String>,

    /// Scheme file applied to the OSC observer
    #[arg(long = "schemeFile")]
    pub scheme_file: Option<PathBuf>,

    // -------- TRACKING
    /// Max distance between objects to be united to a single layer
    #[arg(long = "track.uniteDistance")]
    pub track_unite_distance: Option<f32>,

    /// Max distance between objects to be identified as the same object
    #[arg(long = "track.trackDistance")]
    pub track_track_distance: Option<f32>,

    /// If a trackable is dropped, search this factor of trackDistance for a younger one
    #[arg(long = "track.trackOldestFactor")]
    pub track_oldest_factor: Option<f32>,

    /// If a trackable is dropped, keep it latent in the closest neighbour
    #[arg(long = "track.latentDistance")]
    pub track_latent_distance: Option<f32>,

    /// Keep latent ids for this many seconds
    #[arg(long = "track.latentLifeTime")]
    pub track_latent_life_time: Option<f32>,

    /// Max object size before splitting
    #[arg(long = "track.objectMaxSize")]
    pub track_object_max_size: Option<f32>,

    /// Weight of motion prediction in consecutive frames
    #[arg(long = "track.trackMotionPredict")]
    pub track_motion_predict: Option<f32>,

    /// Seconds to keep an undetected object before it is dropped
    #[arg(long = "track.keepTime")]
    pub track_keep_time: Option<f32>,

    /// Min seconds an object has to be active before it is reported
    #[arg(long = "track.minActiveTime")]
    pub track_min_active_time: Option<f32>,

    /// Fraction of minActiveTime the object has to be continuously detected
    #[arg(long = "track.minActiveFraction")]
    pub track_min_active_fraction: Option<f32>,

    /// Filter weight between old and new values. 0 = copy, 1 = no change
    #[arg(long = "track.trackFilterWeight")]
    pub track_filter_weight: Option<f32>,

    /// Smoothing of values. 0 = copy, 1 = no change
    #[arg(long = "track.trackSmoothing")]
    pub track_smoothing: Option<f32>,

    /// Distance calculation: 0 = 3D, 1 = 2D
    #[arg(long = "track.distance2D")]
    pub track_distance_2d: Option<bool>,

    /// Seconds inside a private area until marked as private
    #[arg(long = "track.privateTimeout")]
    pub track_private_timeout: Option<f32>,

    /// Seconds immobile until marked as immobile
    #[arg(long = "track.immobileTimeout")]
    pub track_immobile_timeout: Option<f32>,

    /// Metres moved to not be regarded as immobile
    #[arg(long = "track.immobileDistance")]
    pub track_immobile_distance: Option<f32>,

    // -------- ENVIRONMENT
    /// Seconds used to scan the environment
    #[arg(long = "lidar.env.scanSec")]
    pub env_scan_sec: Option<f32>,

    /// Seconds used to adapt the environment
    #[arg(long = "lidar.env.adaptSec")]
    pub env_adapt_sec: Option<f32>,

    /// Distance from the measured value in which a sample is environmental
    #[arg(long = "lidar.env.threshold")]
    pub env_threshold: Option<f32>,

    /// Switches environment adaption on=1 or off=0
    #[arg(long = "lidar.env.adapt")]
    pub env_adapt: Option<bool>,

    /// Distance between samples used for eroding and smoothing
    #[arg(long = "lidar.env.filterMinDistance")]
    pub env_filter_min_distance: Option<f32>,

    /// Size of the angular filter used for eroding and smoothing
    #[arg(long = "lidar.env.filterSize")]
    pub env_filter_size: Option<f32>,

    // -------- OBJECTS
    /// Max distance between samples to be united to a single object
    #[arg(long = "lidar.object.maxDistance")]
    pub object_max_distance: Option<f32>,

    /// Min extent of a group of samples to be reported as an object
    #[arg(long = "lidar.object.minExtent")]
    pub object_min_extent: Option<f32>,

    /// Extent of a group of samples to be split into several objects
    #[arg(long = "lidar.object.maxExtent")]
    pub object_max_extent: Option<f32>,

    /// Max distance for carrying the object id across frames
    #[arg(long = "lidar.object.trackDistance")]
    pub object_track_distance: Option<f32>,

    // -------- REGISTRATION
    /// Seconds of accumulation per registration pass
    #[arg(long = "lidar.register.sec")]
    pub register_sec: Option<u32>,

    /// Max distance between the two blobs of a marker
    #[arg(long = "lidar.register.maxObjectDistanceOfMarkers")]
    pub register_max_marker_distance: Option<f32>,

    /// Max residual for a pairwise transform to be accepted
    #[arg(long = "lidar.register.markerMatchDifference")]
    pub register_marker_match_difference: Option<f32>,
}

impl Cli {
    /// Fold CLI overrides into a loaded config; seconds-denominated args
    /// are stored as milliseconds.
    pub fn apply_to(&self, config: &mut ProcessConfig) {
        let track = &mut config.track;
        if let Some(v) = self.track_unite_distance {
            track.unite_distance = v;
        }
        if let Some(v) = self.track_track_distance {
            track.track_distance = v;
        }
        if let Some(v) = self.track_oldest_factor {
            track.track_oldest_factor = v;
        }
        if let Some(v) = self.track_latent_distance {
            track.latent_distance = v;
        }
        if let Some(v) = self.track_latent_life_time {
            track.latent_life_time = (v * 1000.0) as u64;
        }
        if let Some(v) = self.track_object_max_size {
            track.object_max_size = v;
        }
        if let Some(v) = self.track_motion_predict {
            track.track_motion_predict = v;
        }
        if let Some(v) = self.track_keep_time {
            track.keep_time = (v * 1000.0) as u64;
        }
        if let Some(v) = self.track_min_active_time {
            track.min_active_time = (v * 1000.0) as u64;
        }
        if let Some(v) = self.track_min_active_fraction {
            track.min_active_fraction = v;
        }
        if let Some(v) = self.track_filter_weight {
            track.track_filter_weight = v;
        }
        if let Some(v) = self.track_smoothing {
            track.track_smoothing = v;
        }
        if let Some(v) = self.track_distance_2d {
            track.distance_2d = v;
        }
        if let Some(v) = self.track_private_timeout {
            track.private_timeout = (v * 1000.0) as u64;
        }
        if let Some(v) = self.track_immobile_timeout {
            track.immobile_timeout = (v * 1000.0) as u64;
        }
        if let Some(v) = self.track_immobile_distance {
            track.immobile_distance = v;
        }

        let env = &mut config.env;
        if let Some(v) = self.env_scan_sec {
            env.scan_sec = v;
        }
        if let Some(v) = self.env_adapt_sec {
            env.adapt_sec = v;
        }
        if let Some(v) = self.env_threshold {
            env.threshold = v;
        }
        if let Some(v) = self.env_adapt {
            env.adapt = v;
        }
        if let Some(v) = self.env_filter_min_distance {
            env.filter_min_distance = v;
        }
        if let Some(v) = self.env_filter_size {
            env.filter_size = v;
        }

        let object = &mut config.object;
        if let Some(v) = self.object_max_distance {
            object.max_distance = v;
        }
        if let Some(v) = self.object_min_extent {
            object.min_extent = v;
        }
        if let Some(v) = self.object_max_extent {
            object.max_extent = v;
        }
        if let Some(v) = self.object_track_distance {
            object.track_distance = v;
        }

        let register = &mut config.register;
        if let Some(v) = self.register_sec {
            register.sec = v;
        }
        if let Some(v) = self.register_max_marker_distance {
            register.max_object_distance_of_markers = v;
        }
        if let Some(v) = self.register_marker_match_difference {
            register.marker_match_difference = v;
        }
    }
}
