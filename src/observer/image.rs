use log::error;
use map_range::MapRange;

use crate::frame::TrackedFrame;
use crate::sink::{ImageSink, MessageWriter};
use crate::util::getmsec;

use super::{BaseObserver, Observer, ObserverOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMode {
    /// Accumulate presence per cell
    HeatMap,
    /// Accumulate only positions that changed since the last frame
    FlowMap,
}

/// Rasterising accumulator: every observed position increments a grid cell,
/// the grid is handed to the [`ImageSink`] on stop and reset. Covers the
/// heat/flow map observers; actual image encoding lives behind the sink.
pub struct ImageObserver {
    pub base: BaseObserver,
    sink: Box<dyn ImageSink>,
    mode: ImageMode,
    width: usize,
    height: usize,
    /// World metres per pixel
    resolution: f32,
    origin_x: f32,
    origin_y: f32,
    pixels: Vec<f32>,
    last_positions: Vec<(u32, f32, f32)>,
}

struct NullWriter;

impl MessageWriter for NullWriter {
    fn write(&mut self, _messages: &[String], _timestamp: u64) -> anyhow::Result<()> {
        Ok(())
    }
}

impl ImageObserver {
    pub fn new(
        name: &str,
        sink: Box<dyn ImageSink>,
        mode: ImageMode,
        width: usize,
        height: usize,
        resolution: f32,
    ) -> Self {
        let options = ObserverOptions {
            continuous: true,
            full_frame: true,
            is_json: false,
            is_threaded: false,
            use_latent: false,
            ..ObserverOptions::default()
        };
        ImageObserver {
            base: BaseObserver::new(name, options, Box::new(NullWriter)),
            sink,
            mode,
            width,
            height,
            resolution,
            origin_x: -(width as f32) * resolution / 2.0,
            origin_y: -(height as f32) * resolution / 2.0,
            pixels: vec![0.0; width * height],
            last_positions: Vec::new(),
        }
    }

    fn cell(&self, x: f32, y: f32) -> Option<usize> {
        let extent_x = self.width as f32 * self.resolution;
        let extent_y = self.height as f32 * self.resolution;
        let px = x
            .map_range(self.origin_x..self.origin_x + extent_x, 0.0..self.width as f32)
            .floor();
        let py = y
            .map_range(self.origin_y..self.origin_y + extent_y, 0.0..self.height as f32)
            .floor();
        if px < 0.0 || py < 0.0 || px >= self.width as f32 || py >= self.height as f32 {
            return None;
        }
        Some(py as usize * self.width + px as usize)
    }

    fn accumulate(&mut self, frame: &TrackedFrame) {
        let mut positions = Vec::with_capacity(frame.objects.len());
        for object in frame.objects.values() {
            if object.is_latent() {
                continue;
            }
            positions.push((object.id, object.x, object.y));

            let count = match self.mode {
                ImageMode::HeatMap => true,
                ImageMode::FlowMap => {
                    // only moving objects leave traces
                    match self
                        .last_positions
                        .iter()
                        .find(|(id, _, _)| *id == object.id)
                    {
                        Some((_, lx, ly)) => {
                            (object.x - lx).abs() > f32::EPSILON
                                || (object.y - ly).abs() > f32::EPSILON
                        }
                        None => true,
                    }
                }
            };
            if count {
                if let Some(cell) = self.cell(object.x, object.y) {
                    self.pixels[cell] += 1.0;
                }
            }
        }
        self.last_positions = positions;
    }

    fn write_out(&mut self) {
        if let Err(e) = self
            .sink
            .write_image(self.width, self.height, &self.pixels)
        {
            error!("image observer {}: {e}", self.base.name);
        }
    }
}

impl Observer for ImageObserver {
    fn base(&self) -> &BaseObserver {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseObserver {
        &mut self.base
    }

    fn observe(&mut self, frame: &TrackedFrame, force: bool) -> bool {
        if !self.base.observe(frame, force) {
            return false;
        }
        self.accumulate(frame);
        true
    }

    fn stop(&mut self, timestamp: u64) -> bool {
        let timestamp = if timestamp == 0 { getmsec() } else { timestamp };
        if !self.base.stop(timestamp) {
            return false;
        }
        self.write_out();
        true
    }

    fn reset(&mut self, timestamp: u64) {
        self.base.reset(timestamp);
        self.write_out();
        self.pixels.fill(0.0);
        self.last_positions.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::frame::{obj_flags, FrameObject};
    use crate::track_uuid::TrackUuid;

    #[derive(Clone, Default)]
    struct CaptureImageSink {
        images: Arc<Mutex<Vec<(usize, usize, Vec<f32>)>>>,
    }

    impl ImageSink for CaptureImageSink {
        fn write_image(&mut self, width: usize, height: usize, pixels: &[f32]) -> anyhow::Result<()> {
            self.images
                .lock()
                .unwrap()
                .push((width, height, pixels.to_vec()));
            Ok(())
        }
    }

    fn frame(positions: &[(u32, f32, f32)], timestamp: u64) -> TrackedFrame {
        let mut frame = TrackedFrame {
            timestamp,
            frame_id: timestamp,
            uuid: TrackUuid::new(1, 0),
            objects: Default::default(),
        };
        for (id, x, y) in positions {
            frame.insert(FrameObject {
                id: *id,
                uuid: TrackUuid::new(1, *id),
                timestamp,
                x: *x,
                y: *y,
                size: 0.5,
                flags: obj_flags::TOUCHED,
            });
        }
        frame
    }

    #[test]
    fn heatmap_accumulates_presence() {
        let sink = CaptureImageSink::default();
        let images = sink.images.clone();
        let mut observer =
            ImageObserver::new("heatmap", Box::new(sink), ImageMode::HeatMap, 10, 10, 1.0);
        observer.start(1_000);
        for i in 0..5u64 {
            observer.observe(&frame(&[(1, 0.5, 0.5)], 1_100 + i * 100), false);
        }
        observer.stop(2_000);

        let images = images.lock().unwrap();
        assert_eq!(images.len(), 1);
        let (w, h, pixels) = &images[0];
        assert_eq!((*w, *h), (10, 10));
        // world (0.5, 0.5) lands in the cell right of centre
        let cell = 5 * 10 + 5;
        assert_eq!(pixels[cell], 5.0);
        assert_eq!(pixels.iter().sum::<f32>(), 5.0);
    }

    #[test]
    fn flowmap_ignores_standing_objects() {
        let sink = CaptureImageSink::default();
        let images = sink.images.clone();
        let mut observer =
            ImageObserver::new("flowmap", Box::new(sink), ImageMode::FlowMap, 10, 10, 1.0);
        observer.start(1_000);
        observer.observe(&frame(&[(1, 0.5, 0.5)], 1_100), false);
        // standing still: no further counts
        observer.observe(&frame(&[(1, 0.5, 0.5)], 1_200), false);
        observer.observe(&frame(&[(1, 0.5, 0.5)], 1_300), false);
        observer.stop(2_000);

        let images = images.lock().unwrap();
        let (_, _, pixels) = &images[0];
        assert_eq!(pixels.iter().sum::<f32>(), 1.0);
    }
}
