use crate::sink::MessageWriter;

use super::{BaseObserver, Observer, ObserverOptions};

pub type MessageCallback = Box<dyn FnMut(&str, u64) + Send>;

struct CallbackWriter {
    callback: MessageCallback,
}

impl MessageWriter for CallbackWriter {
    fn write(&mut self, messages: &[String], timestamp: u64) -> anyhow::Result<()> {
        for msg in messages {
            (self.callback)(msg, timestamp);
        }
        Ok(())
    }
}

/// Hands every formatted message to an embedded callback, the hook for
/// scripting runtimes. Field access goes through the same scheme engine and
/// value registry as every other templated observer.
pub struct CallbackObserver {
    pub base: BaseObserver,
}

impl CallbackObserver {
    pub fn new(name: &str, callback: MessageCallback) -> Self {
        let options = ObserverOptions {
            continuous: true,
            full_frame: false,
            is_json: false,
            is_threaded: false,
            ..ObserverOptions::default()
        };
        CallbackObserver {
            base: BaseObserver::new(name, options, Box::new(CallbackWriter { callback })),
        }
    }
}

impl Observer for CallbackObserver {
    fn base(&self) -> &BaseObserver {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseObserver {
        &mut self.base
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::frame::{obj_flags, FrameObject, TrackedFrame};
    use crate::track_uuid::TrackUuid;

    #[test]
    fn callback_receives_scheme_messages() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let mut observer = CallbackObserver::new(
            "script",
            Box::new(move |msg, _ts| sink.lock().unwrap().push(msg.to_string())),
        );
        observer
            .base_mut()
            .set_scheme("(objectEnter) enter <id> <enter>\n");
        observer.start(1_000);

        let mut frame = TrackedFrame {
            timestamp: 1_100,
            frame_id: 1,
            uuid: TrackUuid::new(1, 0),
            objects: Default::default(),
        };
        frame.insert(FrameObject {
            id: 4,
            uuid: TrackUuid::new(1, 4),
            timestamp: 1_100,
            x: 0.0,
            y: 0.0,
            size: 0.3,
            flags: obj_flags::TOUCHED,
        });
        observer.observe(&frame, false);

        let msgs = received.lock().unwrap();
        assert_eq!(msgs.as_slice(), &["enter 4 enter".to_string()]);
    }
}
