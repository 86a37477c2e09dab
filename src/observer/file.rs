use std::fs::File;
use std::path::PathBuf;

use log::{error, info};

use crate::frame::TrackedFrame;
use crate::packed::{BinaryFrame, Header, HeaderType, PackedWriter};
use crate::sink::FileWriter;
use crate::util::{apply_date_to_string, getmsec};

use super::{BaseObserver, Observer, ObserverOptions};

/// JSON-lines logger writing one message per tracker event into a
/// date-templated file. Threaded so slow disks never stall the tracker.
pub struct FileObserver {
    pub base: BaseObserver,
}

impl FileObserver {
    pub fn new(name: &str, file_template: &str) -> Self {
        let options = ObserverOptions {
            continuous: false,
            full_frame: false,
            is_json: true,
            is_threaded: true,
            ..ObserverOptions::default()
        };
        let mut base = BaseObserver::new(
            name,
            options,
            Box::new(FileWriter::new(file_template)),
        );
        base.filter
            .parse(
                "timestamp=ts,action,start,stop,frame,regions,objects,type,enter,move,leave,x,y,z,size,id,lifespan,count",
            )
            .expect("default file filter must parse");
        FileObserver { base }
    }
}

impl Observer for FileObserver {
    fn base(&self) -> &BaseObserver {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseObserver {
        &mut self.base
    }
}

/// Writes the packed binary stream: a Start record on start, one Frame
/// record per observed frame, a Stop record on stop. Date templates in the
/// file name roll the file over at the template boundary.
pub struct PackedFileObserver {
    pub base: BaseObserver,
    file_template: String,
    last_file_name: String,
    writer: Option<PackedWriter<File>>,
}

impl PackedFileObserver {
    pub fn new(name: &str, file_template: &str) -> Self {
        let options = ObserverOptions {
            continuous: true,
            full_frame: true,
            is_json: false,
            is_threaded: false,
            use_latent: true,
            max_fps: 5.0,
            ..ObserverOptions::default()
        };
        // the base is used for lifecycle state only; packed frames bypass
        // the message formatting entirely
        let base = BaseObserver::new(name, options, Box::new(NullWriter));
        PackedFileObserver {
            base,
            file_template: file_template.to_string(),
            last_file_name: String::new(),
            writer: None,
        }
    }

    fn check_file(&mut self, timestamp: u64) -> bool {
        let name = apply_date_to_string(&self.file_template, timestamp);
        if name != self.last_file_name {
            self.writer = None;
        }
        if self.writer.is_none() {
            match PackedWriter::append(&PathBuf::from(&name)) {
                Ok(writer) => {
                    info!("packed file observer writing to {name}");
                    self.writer = Some(writer);
                    self.last_file_name = name;
                }
                Err(e) => {
                    error!("packed file observer: {e}");
                    return false;
                }
            }
        }
        true
    }
}

struct NullWriter;

impl crate::sink::MessageWriter for NullWriter {
    fn write(&mut self, _messages: &[String], _timestamp: u64) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Observer for PackedFileObserver {
    fn base(&self) -> &BaseObserver {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseObserver {
        &mut self.base
    }

    fn observe(&mut self, frame: &TrackedFrame, force: bool) -> bool {
        // clamp the frame rate the way the original recorder does
        let max_fps = self.base.options.max_fps.clamp(5.0, 100.0);
        let time_diff = frame.timestamp as i64 - self.base.timestamp as i64;
        if !force && time_diff > 0 && 1000.0 / time_diff as f32 > max_fps {
            return false;
        }
        if !self.base.is_started() {
            return false;
        }
        self.base.timestamp = frame.timestamp;
        self.base.frame_id = frame.frame_id;

        if !self.base.options.reporting || !self.check_file(frame.timestamp) {
            return false;
        }

        let mut packed = BinaryFrame::new(frame.timestamp, frame.uuid);
        for object in frame.objects.values() {
            packed.add(object.id, object.x, object.y, object.size, object.flags);
        }
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.put_frame(&packed) {
                error!("packed file observer: {e}");
                self.writer = None;
                return false;
            }
        }
        true
    }

    fn start(&mut self, timestamp: u64) -> bool {
        let timestamp = if timestamp == 0 { getmsec() } else { timestamp };
        if !self.base.start(timestamp) {
            return false;
        }
        if self.base.options.reporting && self.check_file(timestamp) {
            if let Some(writer) = self.writer.as_mut() {
                let _ = writer.put_header(&Header::new(timestamp, HeaderType::Start));
            }
        }
        true
    }

    fn stop(&mut self, timestamp: u64) -> bool {
        let timestamp = if timestamp == 0 { getmsec() } else { timestamp };
        if !self.base.stop(timestamp) {
            return false;
        }
        if self.base.options.reporting && self.check_file(timestamp) {
            if let Some(writer) = self.writer.as_mut() {
                let _ = writer.put_header(&Header::new(timestamp, HeaderType::Stop));
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{obj_flags, FrameObject};
    use crate::packed::{PackedReader, Record};
    use crate::track_uuid::TrackUuid;

    fn frame(id: u32, x: f32, timestamp: u64) -> TrackedFrame {
        let mut frame = TrackedFrame {
            timestamp,
            frame_id: 1,
            uuid: TrackUuid::new(1, 0),
            objects: Default::default(),
        };
        frame.insert(FrameObject {
            id,
            uuid: TrackUuid::new(1, id),
            timestamp,
            x,
            y: 1.0,
            size: 0.5,
            flags: obj_flags::TOUCHED,
        });
        frame
    }

    #[test]
    fn packed_observer_writes_start_frames_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.pkd");
        {
            let mut observer = PackedFileObserver::new("packedfile", path.to_str().unwrap());
            observer.start(1_000);
            observer.observe(&frame(1, 0.5, 1_400), false);
            observer.observe(&frame(1, 0.6, 1_800), false);
            observer.stop(2_000);
        }

        let mut reader = PackedReader::open(&path).unwrap();
        let mut starts = 0;
        let mut frames = 0;
        let mut stops = 0;
        while let Some(record) = reader.next_record().unwrap() {
            match record {
                Record::Start(_) => starts += 1,
                Record::Frame(f) => {
                    frames += 1;
                    assert_eq!(f.binaries.len(), 1);
                }
                Record::Stop(_) => stops += 1,
            }
        }
        assert_eq!((starts, frames, stops), (1, 2, 1));
    }

    #[test]
    fn file_observer_logs_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        {
            let mut observer = FileObserver::new("file", path.to_str().unwrap());
            observer.start(1_000);
            observer.observe(&frame(1, 0.5, 1_100), false);
            observer.observe(&frame(1, 1.2, 1_200), false);
            observer.stop(1_300);
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("enter"));
        assert!(content.contains("\"ts\""));
        // the default file filter renames timestamp to ts
        assert!(!content.contains("\"timestamp\""));
    }
}
