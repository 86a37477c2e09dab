use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;

use crate::frame::{obj_flags, FrameObject, TrackedFrame};
use crate::packed::{BinaryFrame, Header, HeaderType, PackedError, PackedReader};
use crate::track_uuid::TrackUuid;
use crate::util::getmsec;

/// Pacing sleeps are capped; a larger gap leaves the cursor parked for the
/// next tick.
const MAX_PACING_SLEEP_MSEC: u64 = 750;

/// Outcome of one paced grab attempt.
#[derive(Debug)]
pub enum GrabResult {
    Frame(TrackedFrame),
    Start(Header),
    Stop(Header),
    /// The next frame is still in the future or the stream is exhausted
    Pending,
}

/// Replays one packed stream with frame decoding and time-synced pacing.
pub struct PackedPlayer<R: Read + Seek> {
    pub reader: PackedReader<R>,
    pub frame_id: u64,
}

impl PackedPlayer<std::io::BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let reader = PackedReader::new(std::io::BufReader::new(file))?;
        Ok(PackedPlayer {
            reader,
            frame_id: 0,
        })
    }
}

impl<R: Read + Seek> PackedPlayer<R> {
    pub fn new(reader: PackedReader<R>) -> Self {
        PackedPlayer {
            reader,
            frame_id: 0,
        }
    }

    pub fn begin_time(&self) -> u64 {
        self.reader.begin_time
    }

    pub fn current_time(&self) -> u64 {
        self.reader.current_time
    }

    pub fn timestamp(&self) -> u64 {
        self.reader.timestamp()
    }

    pub fn play_pos(&mut self) -> f32 {
        self.reader.play_pos()
    }

    pub fn is_eof(&mut self) -> bool {
        self.reader.is_eof()
    }

    /// Seek to a fraction of the stream; returns the stream time there.
    pub fn play(&mut self, fraction: f32) -> Result<u64, PackedError> {
        self.reader.play(fraction)
    }

    /// Binary-search to the record closest to `play_time`.
    pub fn sync_to(&mut self, play_time: u64) -> Result<u64, PackedError> {
        self.reader.sync_to(play_time)
    }

    /// Decode a wire frame into tracked objects; per-object UUIDs derive
    /// from the frame UUID and the numeric id.
    pub fn decode_frame(frame: &BinaryFrame, frame_id: u64) -> TrackedFrame {
        let mut decoded = TrackedFrame {
            timestamp: frame.header.timestamp,
            frame_id,
            uuid: frame.uuid,
            objects: Default::default(),
        };
        let flag_mask =
            obj_flags::TOUCHED | obj_flags::PRIVATE | obj_flags::LATENT | obj_flags::IMMOBILE;
        for binary in frame.binaries.iter() {
            let (x, y, size) = binary.values();
            decoded.insert(FrameObject {
                id: binary.tid,
                uuid: TrackUuid::with_tid(&frame.uuid, binary.tid),
                timestamp: frame.header.timestamp,
                x,
                y,
                size,
                flags: binary.flags & flag_mask,
            });
        }
        decoded
    }

    /// Next frame record regardless of timing; for offline consumption.
    pub fn next_frame(&mut self) -> Result<Option<TrackedFrame>, PackedError> {
        while let Some(record) = self.reader.next_record()? {
            if let crate::packed::Record::Frame(frame) = record {
                self.frame_id += 1;
                return Ok(Some(Self::decode_frame(&frame, self.frame_id)));
            }
        }
        Ok(None)
    }

    /// Paced read: deliver the next frame once its stream time has come,
    /// sleeping short gaps away and parking on long ones.
    pub fn grab_frame(&mut self, timestamp: u64) -> Result<GrabResult, PackedError> {
        if self.reader.is_eof() {
            return Ok(GrabResult::Pending);
        }
        let timestamp = if timestamp == 0 { getmsec() } else { timestamp };
        self.reader.current_time = timestamp.saturating_sub(self.reader.start_time);

        loop {
            let pos = self.reader.tell()?;
            let header = match self.reader.read_header() {
                Ok(Some(header)) => header,
                Ok(None) => {
                    self.reader.seek(pos)?;
                    if self.reader.sync().is_err() {
                        return Ok(GrabResult::Pending);
                    }
                    match self.reader.read_header() {
                        Ok(Some(header)) => header,
                        _ => return Ok(GrabResult::Pending),
                    }
                }
                Err(PackedError::Truncated) => return Ok(GrabResult::Pending),
                Err(e) => return Err(e),
            };

            match header.header_type() {
                HeaderType::Start => return Ok(GrabResult::Start(header)),
                HeaderType::Stop => return Ok(GrabResult::Stop(header)),
                HeaderType::Unknown => {
                    self.reader.seek(pos + 4)?;
                    continue;
                }
                HeaderType::Frame => {}
            }

            let frame = self.reader.read_frame(header)?;
            if frame.header.timestamp < self.reader.begin_time {
                continue;
            }

            let record_time = frame.header.timestamp - self.reader.begin_time;
            if record_time < self.reader.current_time {
                // behind the clock: skip forward
                continue;
            }

            let time_diff = record_time - self.reader.current_time;
            if time_diff >= MAX_PACING_SLEEP_MSEC {
                // too far in the future: park the cursor for the next tick
                self.reader.seek(pos)?;
                thread::sleep(Duration::from_millis(10));
                return Ok(GrabResult::Pending);
            }

            if time_diff > 0 {
                thread::sleep(Duration::from_millis(time_diff));
            }
            self.reader.current_time = getmsec().saturating_sub(self.reader.start_time);
            self.frame_id += 1;
            return Ok(GrabResult::Frame(Self::decode_frame(&frame, self.frame_id)));
        }
    }
}

/// Process-wide playback clock; all fields are atomics so device threads
/// read it without locking.
#[derive(Debug, Default)]
pub struct PlaybackClock {
    play_pos_bits: AtomicU32,
    current_time: AtomicI64,
    time_stamp: AtomicU64,
    time_stamp_ref: AtomicU64,
    paused: AtomicBool,
}

impl PlaybackClock {
    pub fn play_pos(&self) -> f32 {
        f32::from_bits(self.play_pos_bits.load(Ordering::SeqCst))
    }

    pub fn set_play_pos(&self, pos: f32) {
        self.play_pos_bits.store(pos.to_bits(), Ordering::SeqCst);
    }

    pub fn current_time(&self) -> i64 {
        self.current_time.load(Ordering::SeqCst)
    }

    pub fn set_current_time(&self, time: i64) {
        self.current_time.store(time, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused_flag(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn set_time_stamp(&self, timestamp: u64) {
        self.time_stamp.store(timestamp, Ordering::SeqCst);
        self.time_stamp_ref.store(getmsec(), Ordering::SeqCst);
    }

    /// Wall-clock mapped stream timestamp; frozen while paused.
    pub fn time_stamp(&self) -> u64 {
        let ts = self.time_stamp.load(Ordering::SeqCst);
        if ts == 0 {
            return 0;
        }
        if self.is_paused() {
            return ts;
        }
        ts + getmsec().saturating_sub(self.time_stamp_ref.load(Ordering::SeqCst))
    }
}

/// Time-synced playback over one packed file per virtual device. One player
/// is the sync source; seeks go through it and every other player
/// binary-searches to the matching record.
pub struct PlaybackEngine<R: Read + Seek> {
    pub players: Vec<(String, PackedPlayer<R>)>,
    pub sync_index: usize,
    pub clock: Arc<PlaybackClock>,
}

impl PlaybackEngine<std::io::BufReader<File>> {
    pub fn open(paths: &[(String, std::path::PathBuf)]) -> Result<Self> {
        let mut players = Vec::with_capacity(paths.len());
        for (id, path) in paths {
            players.push((id.clone(), PackedPlayer::open(path)?));
        }
        Ok(PlaybackEngine {
            players,
            sync_index: 0,
            clock: Arc::new(PlaybackClock::default()),
        })
    }
}

impl<R: Read + Seek> PlaybackEngine<R> {
    pub fn new(players: Vec<(String, PackedPlayer<R>)>) -> Self {
        PlaybackEngine {
            players,
            sync_index: 0,
            clock: Arc::new(PlaybackClock::default()),
        }
    }

    /// Seek every stream to `fraction` of the sync source.
    pub fn set_play_pos(&mut self, fraction: f32) -> Result<(), PackedError> {
        if self.players.is_empty() {
            return Ok(());
        }
        let now = getmsec();

        let current_time = {
            let (_, sync_player) = &mut self.players[self.sync_index];
            let t = sync_player.play(fraction)?;
            sync_player.reader.start_time = now.saturating_sub(t);
            t
        };
        let begin_time = self.players[self.sync_index].1.begin_time();

        for (i, (id, player)) in self.players.iter_mut().enumerate() {
            if i == self.sync_index {
                continue;
            }
            player.reader.start_time = now.saturating_sub(current_time);
            player.reader.begin_time = begin_time;
            let t = player.sync_to(current_time)?;
            info!("playback {id}: synced to {t} ms");
        }

        let (_, sync_player) = &mut self.players[self.sync_index];
        self.clock.set_play_pos(sync_player.play_pos());
        self.clock.set_current_time(current_time as i64);
        self.clock.set_time_stamp(sync_player.timestamp());
        Ok(())
    }

    pub fn set_paused(&mut self, paused: bool) -> Result<(), PackedError> {
        if paused == self.clock.is_paused() {
            return Ok(());
        }
        self.clock.set_paused_flag(paused);
        if !paused {
            // the clock resumes from the frozen position
            let pos = self.clock.play_pos();
            self.set_play_pos(pos)?;
        }
        Ok(())
    }

    /// One paced pass over all players; frames come back tagged with their
    /// device id.
    pub fn tick(&mut self) -> Result<Vec<(String, TrackedFrame)>, PackedError> {
        if self.clock.is_paused() {
            thread::sleep(Duration::from_millis(10));
            return Ok(Vec::new());
        }
        let timestamp = self.clock.time_stamp();
        let mut frames = Vec::new();
        let sync_index = self.sync_index;

        for (i, (id, player)) in self.players.iter_mut().enumerate() {
            if let GrabResult::Frame(frame) = player.grab_frame(timestamp)? {
                if i == sync_index {
                    self.clock.set_play_pos(player.play_pos());
                    self.clock.set_current_time(player.current_time() as i64);
                }
                frames.push((id.clone(), frame));
            }
        }
        Ok(frames)
    }

    pub fn at_end(&mut self) -> bool {
        self.players.iter_mut().all(|(_, p)| p.is_eof())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packed::{binary_flags, BinaryFrame, Header, HeaderType, PackedWriter};
    use std::io::Cursor;

    fn stream(begin: u64, frames: usize, step: u64) -> Vec<u8> {
        let mut writer = PackedWriter::new(Vec::new());
        writer
            .put_header(&Header::new(begin, HeaderType::Start))
            .unwrap();
        for i in 0..frames {
            let ts = begin + i as u64 * step;
            let mut frame = BinaryFrame::new(ts, TrackUuid::new(begin, 0));
            frame.add(1, i as f32 * 0.1 + 0.1, 1.0, 0.5, binary_flags::TOUCHED);
            writer.put_frame(&frame).unwrap();
        }
        writer.into_inner()
    }

    fn player(bytes: Vec<u8>) -> PackedPlayer<Cursor<Vec<u8>>> {
        PackedPlayer::new(PackedReader::from_bytes(bytes).unwrap())
    }

    #[test]
    fn next_frame_decodes_objects() {
        let mut player = player(stream(5_000, 3, 100));
        let frame = player.next_frame().unwrap().unwrap();
        assert_eq!(frame.timestamp, 5_000);
        assert_eq!(frame.len(), 1);
        let object = frame.objects.values().next().unwrap();
        assert_eq!(object.id, 1);
        assert!(object.is_touched());
        // per-object uuid derives from the frame uuid
        assert_eq!(object.uuid.tid(), 1);
    }

    #[test]
    fn play_pos_reflects_seek() {
        let mut player = player(stream(5_000, 100, 100));
        player.play(0.5).unwrap();
        let pos = player.play_pos();
        assert!((pos - 0.5).abs() < 0.05, "pos {pos}");
    }

    #[test]
    fn engine_aligns_streams_on_seek() {
        // two devices recorded with the same time base
        let a = player(stream(10_000, 200, 100));
        let b = player(stream(10_000, 100, 200));
        let mut engine =
            PlaybackEngine::new(vec![("a".to_string(), a), ("b".to_string(), b)]);

        engine.set_play_pos(0.5).unwrap();
        let ta = engine.players[0].1.current_time();
        let tb = engine.players[1].1.current_time();
        assert!(
            (ta as i64 - tb as i64).unsigned_abs() < 500,
            "a at {ta}, b at {tb}"
        );
    }

    #[test]
    fn pause_freezes_the_clock() {
        let clock = PlaybackClock::default();
        clock.set_time_stamp(42_000);
        clock.set_paused_flag(true);
        let t1 = clock.time_stamp();
        std::thread::sleep(Duration::from_millis(30));
        let t2 = clock.time_stamp();
        assert_eq!(t1, t2);

        clock.set_paused_flag(false);
        std::thread::sleep(Duration::from_millis(30));
        assert!(clock.time_stamp() > t2);
    }

    #[test]
    fn grab_frame_returns_start_record_first() {
        let mut player = player(stream(5_000, 2, 100));
        // start the clock far ahead so frames are immediately due
        player.reader.start_time = 0;
        match player.grab_frame(1).unwrap() {
            GrabResult::Start(header) => assert!(header.is_type(HeaderType::Start)),
            other => panic!("expected start record, got {other:?}"),
        }
    }
}
