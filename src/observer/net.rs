use anyhow::Result;

use crate::sink::{MessageSink, MessageWriter, SinkWriter, UdpWriter};

use super::{BaseObserver, Observer, ObserverOptions};

/// JSON messages as single UDP datagrams.
pub struct UdpObserver {
    pub base: BaseObserver,
}

impl UdpObserver {
    pub fn new(name: &str, address: &str) -> Self {
        let options = ObserverOptions {
            continuous: true,
            full_frame: false,
            is_json: true,
            is_threaded: false,
            ..ObserverOptions::default()
        };
        UdpObserver {
            base: BaseObserver::new(name, options, Box::new(UdpWriter::new(address))),
        }
    }
}

impl Observer for UdpObserver {
    fn base(&self) -> &BaseObserver {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseObserver {
        &mut self.base
    }
}

/// Encode one OSC message: padded address, type tags and arguments.
/// Arguments are typed from their spelling: integers become `i`, numbers
/// with a decimal point `f`, everything else `s`.
pub fn encode_osc_message(line: &str) -> Vec<u8> {
    fn pad(buf: &mut Vec<u8>) {
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
    }

    let mut parts = line.split_whitespace();
    let address = parts.next().unwrap_or("/");
    let args: Vec<&str> = parts.collect();

    let mut tags = String::from(",");
    let mut arg_bytes: Vec<u8> = Vec::new();
    for arg in args.iter() {
        if let Ok(i) = arg.parse::<i32>() {
            tags.push('i');
            arg_bytes.extend_from_slice(&i.to_be_bytes());
        } else if arg.contains('.') && arg.parse::<f32>().is_ok() {
            tags.push('f');
            let f: f32 = arg.parse().unwrap();
            arg_bytes.extend_from_slice(&f.to_be_bytes());
        } else {
            tags.push('s');
            arg_bytes.extend_from_slice(arg.as_bytes());
            arg_bytes.push(0);
            pad(&mut arg_bytes);
        }
    }

    let mut message = Vec::new();
    message.extend_from_slice(address.as_bytes());
    message.push(0);
    pad(&mut message);
    message.extend_from_slice(tags.as_bytes());
    message.push(0);
    pad(&mut message);
    message.extend_from_slice(&arg_bytes);
    message
}

/// Wrap several OSC messages into a `#bundle` with an immediate time tag.
pub fn encode_osc_bundle(messages: &[Vec<u8>]) -> Vec<u8> {
    let mut bundle = Vec::new();
    bundle.extend_from_slice(b"#bundle\0");
    bundle.extend_from_slice(&1u64.to_be_bytes()); // immediate
    for message in messages {
        bundle.extend_from_slice(&(message.len() as u32).to_be_bytes());
        bundle.extend_from_slice(message);
    }
    bundle
}

struct OscWriter {
    udp: UdpWriter,
}

impl MessageWriter for OscWriter {
    fn write(&mut self, messages: &[String], _timestamp: u64) -> Result<()> {
        if messages.len() == 1 {
            self.udp.send_datagram(&encode_osc_message(&messages[0]));
            return Ok(());
        }
        let encoded: Vec<Vec<u8>> = messages.iter().map(|m| encode_osc_message(m)).collect();
        self.udp.send_datagram(&encode_osc_bundle(&encoded));
        Ok(())
    }
}

/// Scheme-driven OSC sender. Every fired scheme line becomes one OSC
/// message; multiple lines per frame are sent as a bundle.
pub struct OscObserver {
    pub base: BaseObserver,
}

impl OscObserver {
    pub fn new(name: &str, address: &str) -> Self {
        let options = ObserverOptions {
            continuous: true,
            full_frame: false,
            is_json: false,
            is_threaded: false,
            ..ObserverOptions::default()
        };
        let mut base = BaseObserver::new(
            name,
            options,
            Box::new(OscWriter {
                udp: UdpWriter::new(address),
            }),
        );
        base.filter
            .parse("frame,frame_id,frame_end,object,move,x,y,size,id")
            .expect("default osc filter must parse");
        OscObserver { base }
    }
}

impl Observer for OscObserver {
    fn base(&self) -> &BaseObserver {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseObserver {
        &mut self.base
    }
}

/// Binary broadcast over an externally provided transport: every frame is
/// shipped whole as a MsgPack payload, latent shadows included.
pub struct PackedWebSocketObserver {
    pub base: BaseObserver,
    sink: Box<dyn MessageSink>,
}

impl PackedWebSocketObserver {
    pub fn new(name: &str, sink: Box<dyn MessageSink>) -> Self {
        let options = ObserverOptions {
            continuous: true,
            full_frame: true,
            is_json: false,
            is_threaded: false,
            use_latent: true,
            ..ObserverOptions::default()
        };
        PackedWebSocketObserver {
            base: BaseObserver::new(name, options, Box::new(NullWriter)),
            sink,
        }
    }
}

struct NullWriter;

impl MessageWriter for NullWriter {
    fn write(&mut self, _messages: &[String], _timestamp: u64) -> Result<()> {
        Ok(())
    }
}

impl Observer for PackedWebSocketObserver {
    fn base(&self) -> &BaseObserver {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseObserver {
        &mut self.base
    }

    fn observe(&mut self, frame: &crate::frame::TrackedFrame, force: bool) -> bool {
        if !self.base.observe(frame, force) {
            return false;
        }
        match frame.to_msgpack() {
            Ok(payload) => {
                if let Err(e) = self.sink.send("binary", &payload) {
                    log::warn!("packed websocket observer: {e}");
                }
                true
            }
            Err(e) => {
                log::error!("packed websocket observer: {e}");
                false
            }
        }
    }
}

/// Broadcast observer over an externally provided transport; JSON frames
/// are handed to the sink as `text` payloads.
pub struct WebSocketObserver {
    pub base: BaseObserver,
}

impl WebSocketObserver {
    pub fn new(name: &str, sink: Box<dyn MessageSink>) -> Self {
        let options = ObserverOptions {
            continuous: true,
            full_frame: true,
            is_json: true,
            is_threaded: true,
            ..ObserverOptions::default()
        };
        WebSocketObserver {
            base: BaseObserver::new(name, options, Box::new(SinkWriter::new("text", sink))),
        }
    }
}

impl Observer for WebSocketObserver {
    fn base(&self) -> &BaseObserver {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseObserver {
        &mut self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn osc_address_is_padded() {
        let msg = encode_osc_message("/obj/3 1.5 2");
        // "/obj/3\0" padded to 8 bytes, then ",fi\0"
        assert_eq!(&msg[..8], b"/obj/3\0\0");
        assert_eq!(&msg[8..12], b",fi\0");
        assert_eq!(msg.len() % 4, 0);
    }

    #[test]
    fn osc_types_from_spelling() {
        let msg = encode_osc_message("/a 1 1.0 x");
        let tag_start = 4; // "/a\0\0"
        assert_eq!(&msg[tag_start..tag_start + 4], b",ifs");
    }

    #[test]
    fn bundle_contains_all_messages() {
        let a = encode_osc_message("/a 1");
        let b = encode_osc_message("/b 2");
        let bundle = encode_osc_bundle(&[a.clone(), b.clone()]);
        assert_eq!(&bundle[..8], b"#bundle\0");
        assert_eq!(bundle.len(), 16 + 4 + a.len() + 4 + b.len());
    }

    #[test]
    fn packed_websocket_ships_msgpack_frames() {
        use crate::frame::{obj_flags, FrameObject, TrackedFrame};
        use crate::track_uuid::TrackUuid;
        use std::sync::{Arc, Mutex};

        #[derive(Clone, Default)]
        struct CaptureSink {
            payloads: Arc<Mutex<Vec<Vec<u8>>>>,
        }

        impl MessageSink for CaptureSink {
            fn send(&mut self, kind: &str, payload: &[u8]) -> Result<()> {
                assert_eq!(kind, "binary");
                self.payloads.lock().unwrap().push(payload.to_vec());
                Ok(())
            }

            fn is_open(&self) -> bool {
                true
            }
        }

        let sink = CaptureSink::default();
        let payloads = sink.payloads.clone();
        let mut observer = PackedWebSocketObserver::new("ws", Box::new(sink));
        observer.start(1_000);

        let mut frame = TrackedFrame {
            timestamp: 1_100,
            frame_id: 1,
            uuid: TrackUuid::new(1, 0),
            objects: Default::default(),
        };
        frame.insert(FrameObject {
            id: 6,
            uuid: TrackUuid::new(1, 6),
            timestamp: 1_100,
            x: 1.0,
            y: 2.0,
            size: 0.4,
            flags: obj_flags::TOUCHED,
        });
        observer.observe(&frame, false);

        let payloads = payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        let decoded = TrackedFrame::from_msgpack(&payloads[0]).unwrap();
        assert_eq!(decoded, frame);
    }
}
