pub mod config;
pub mod device;
pub mod environment;
pub mod frame;
pub mod geometry;
pub mod groups;
pub mod observer;
pub mod packed;
pub mod player;
pub mod registration;
pub mod sample_buffer;
pub mod scan_source;
pub mod segmentation;
pub mod sink;
pub mod track_uuid;
pub mod tracker;
pub mod util;

pub use geometry::{Point2, Transform2, Vector2};
