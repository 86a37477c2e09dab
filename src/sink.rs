use std::fs::OpenOptions;
use std::io::Write;
use std::net::UdpSocket;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::warn;

use crate::util::{apply_date_to_string, getmsec};

/// Reconnect attempts of a failed sink are spaced at least this far apart.
const RECONNECT_INTERVAL_MSEC: u64 = 1_000;

/// Transport abstraction consumed by observers whose wire protocol lives in
/// an external library (WebSocket broadcast, MQTT publish).
pub trait MessageSink: Send {
    fn send(&mut self, kind: &str, payload: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
    fn is_open(&self) -> bool;
}

/// Raster abstraction for the image accumulator observers; the concrete
/// encoder lives outside this crate.
pub trait ImageSink: Send {
    /// `pixels` is row-major, `width * height` accumulated hit counts.
    fn write_image(&mut self, width: usize, height: usize, pixels: &[f32]) -> Result<()>;
}

/// Formatted-message consumer driven by an observer (directly or through
/// its queue thread).
pub trait MessageWriter: Send {
    fn write(&mut self, messages: &[String], timestamp: u64) -> Result<()>;
}

/// Append-only line writer with `%daily`-style file name templates; `-`
/// writes to stdout.
pub struct FileWriter {
    template: String,
}

impl FileWriter {
    pub fn new(template: &str) -> Self {
        FileWriter {
            template: template.to_string(),
        }
    }
}

impl MessageWriter for FileWriter {
    fn write(&mut self, messages: &[String], timestamp: u64) -> Result<()> {
        let name = apply_date_to_string(&self.template, timestamp);
        if name == "-" {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for msg in messages {
                writeln!(out, "{msg}")?;
            }
            return Ok(());
        }

        let path = PathBuf::from(&name);
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        for msg in messages {
            writeln!(file, "{msg}")?;
        }
        Ok(())
    }
}

/// One datagram per message; send failures mark the socket disconnected and
/// reconnects are rate-limited.
pub struct UdpWriter {
    address: String,
    socket: Option<UdpSocket>,
    last_connect_attempt: u64,
}

impl UdpWriter {
    pub fn new(address: &str) -> Self {
        UdpWriter {
            address: address.to_string(),
            socket: None,
            last_connect_attempt: 0,
        }
    }

    fn connect(&mut self) -> Option<&UdpSocket> {
        if self.socket.is_none() {
            let now = getmsec();
            if now - self.last_connect_attempt < RECONNECT_INTERVAL_MSEC {
                return None;
            }
            self.last_connect_attempt = now;
            match UdpSocket::bind("0.0.0.0:0").and_then(|s| {
                s.connect(&self.address)?;
                Ok(s)
            }) {
                Ok(socket) => self.socket = Some(socket),
                Err(e) => {
                    warn!("udp {}: {e}", self.address);
                    return None;
                }
            }
        }
        self.socket.as_ref()
    }

    pub fn send_datagram(&mut self, payload: &[u8]) {
        let address = self.address.clone();
        if let Some(socket) = self.connect() {
            if let Err(e) = socket.send(payload) {
                warn!("udp {address}: {e}");
                self.socket = None;
            }
        }
    }
}

impl MessageWriter for UdpWriter {
    fn write(&mut self, messages: &[String], _timestamp: u64) -> Result<()> {
        for msg in messages {
            self.send_datagram(msg.as_bytes());
        }
        Ok(())
    }
}

/// Adapts a [`MessageSink`] to the message-writer shape used by observers.
pub struct SinkWriter {
    kind: String,
    sink: Box<dyn MessageSink>,
}

impl SinkWriter {
    pub fn new(kind: &str, sink: Box<dyn MessageSink>) -> Self {
        SinkWriter {
            kind: kind.to_string(),
            sink,
        }
    }
}

impl MessageWriter for SinkWriter {
    fn write(&mut self, messages: &[String], _timestamp: u64) -> Result<()> {
        for msg in messages {
            self.sink.send(&self.kind, msg.as_bytes())?;
        }
        self.sink.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn file_writer_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let mut writer = FileWriter::new(path.to_str().unwrap());
        writer.write(&["one".to_string()], 0).unwrap();
        writer.write(&["two".to_string()], 0).unwrap();

        let mut content = String::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "one\ntwo\n");
    }

    #[test]
    fn udp_writer_reaches_local_socket() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_millis(500)))
            .unwrap();
        let addr = receiver.local_addr().unwrap();

        let mut writer = UdpWriter::new(&addr.to_string());
        writer.write(&["hello".to_string()], 0).unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");
    }
}
