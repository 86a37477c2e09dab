use anyhow::{anyhow, Result};
use log::warn;
use paho_mqtt as mqtt;

use crate::sink::MessageWriter;
use crate::util::getmsec;

use super::{BaseObserver, Observer, ObserverOptions};

const QOS: i32 = 1;
const RECONNECT_INTERVAL_MSEC: u64 = 1_000;

struct MqttWriter {
    client: mqtt::Client,
    topic: String,
    last_connect_attempt: u64,
}

impl MqttWriter {
    fn connect(host: &str, topic: &str) -> Result<Self> {
        let client = mqtt::Client::new(host.to_string())
            .map_err(|e| anyhow!("creating mqtt client: {e}"))?;
        let options = mqtt::ConnectOptionsBuilder::new().finalize();
        if let Err(e) = client.connect(options) {
            warn!("mqtt {host}: initial connect failed: {e}");
        }
        Ok(MqttWriter {
            client,
            topic: topic.to_string(),
            last_connect_attempt: getmsec(),
        })
    }

    fn ensure_connected(&mut self) -> bool {
        if self.client.is_connected() {
            return true;
        }
        let now = getmsec();
        if now - self.last_connect_attempt < RECONNECT_INTERVAL_MSEC {
            return false;
        }
        self.last_connect_attempt = now;
        self.client.reconnect().is_ok()
    }
}

impl MessageWriter for MqttWriter {
    fn write(&mut self, messages: &[String], _timestamp: u64) -> Result<()> {
        if !self.ensure_connected() {
            return Ok(());
        }
        for msg in messages {
            let message = mqtt::Message::new(&self.topic, msg.as_bytes(), QOS);
            if let Err(e) = self.client.publish(message) {
                warn!("mqtt publish on {}: {e}", self.topic);
                break;
            }
        }
        Ok(())
    }
}

/// Publishes JSON frame messages on an MQTT topic; send failures mark the
/// connection down and reconnects are rate-limited.
pub struct MqttObserver {
    pub base: BaseObserver,
}

impl MqttObserver {
    pub fn new(name: &str, host: &str, topic: &str) -> Result<Self> {
        let options = ObserverOptions {
            continuous: false,
            full_frame: true,
            is_json: true,
            is_threaded: true,
            ..ObserverOptions::default()
        };
        let writer = MqttWriter::connect(host, topic)?;
        Ok(MqttObserver {
            base: BaseObserver::new(name, options, Box::new(writer)),
        })
    }
}

impl Observer for MqttObserver {
    fn base(&self) -> &BaseObserver {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseObserver {
        &mut self.base
    }
}
