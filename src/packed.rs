use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::warn;
use thiserror::Error;

use crate::track_uuid::TrackUuid;
use crate::util::getmsec;

pub const HEADER_SIZE: u64 = 16;
pub const UUID_SIZE: u64 = 16;
pub const BINARY_SIZE_V1: u64 = 14;
pub const BINARY_SIZE_V2: u64 = 12;

pub const TYPE_BITS: u16 = 0x00ff;
pub const VERSION_BITS: u16 = 0xff00;

pub const VERSION_1: u16 = 0 << 8;
pub const VERSION_2: u16 = 1 << 8;

/// Resync-loss warnings are emitted at most once per file per minute.
const RESYNC_WARN_INTERVAL_MSEC: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderType {
    Unknown = 0,
    Frame = 1,
    Start = 2,
    Stop = 3,
}

pub mod binary_flags {
    pub const TOUCHED: u16 = 1 << 0;
    pub const PRIVATE: u16 = 1 << 1;
    pub const PORTAL: u16 = 1 << 2;
    pub const GREEN: u16 = 1 << 3;
    pub const LATENT: u16 = 1 << 4;
    pub const IMMOBILE: u16 = 1 << 5;
}

#[derive(Debug, Error)]
pub enum PackedError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lost synchronisation")]
    LostSync,
    #[error("truncated record")]
    Truncated,
}

/// Record header. On the wire it is preceded by a 4-byte zero guard used for
/// resynchronisation.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub flags: u16,
    pub size: u16,
    pub timestamp: u64,
}

impl Header {
    /// Writers emit V2 and keep the low 32 timestamp bits nonzero so a
    /// timestamp can never be mistaken for the zero guard.
    pub fn new(timestamp: u64, header_type: HeaderType) -> Self {
        let timestamp = if timestamp & 0xffff_ffff == 0 {
            timestamp | 1
        } else {
            timestamp
        };
        Header {
            flags: header_type as u16 | VERSION_2,
            size: 0,
            timestamp,
        }
    }

    pub fn header_type(&self) -> HeaderType {
        match self.flags & TYPE_BITS {
            1 => HeaderType::Frame,
            2 => HeaderType::Start,
            3 => HeaderType::Stop,
            _ => HeaderType::Unknown,
        }
    }

    pub fn is_type(&self, t: HeaderType) -> bool {
        self.header_type() == t
    }

    pub fn version(&self) -> u16 {
        self.flags & VERSION_BITS
    }

    pub fn timestamp_valid(&self) -> bool {
        self.timestamp > 1
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<(), PackedError> {
        out.write_u32::<LittleEndian>(0)?;
        out.write_u16::<LittleEndian>(self.flags)?;
        out.write_u16::<LittleEndian>(self.size)?;
        out.write_u64::<LittleEndian>(self.timestamp)?;
        Ok(())
    }

    /// Returns None when the zero guard does not match.
    pub fn read_from<R: Read>(input: &mut R) -> Result<Option<Header>, PackedError> {
        let zero = input.read_u32::<LittleEndian>()?;
        let flags = input.read_u16::<LittleEndian>()?;
        let size = input.read_u16::<LittleEndian>()?;
        let timestamp = input.read_u64::<LittleEndian>()?;
        if zero != 0 {
            return Ok(None);
        }
        Ok(Some(Header {
            flags,
            size,
            timestamp,
        }))
    }
}

/// One tracked object of a frame, in centimetres. Coordinates of exactly
/// zero are biased to 1 cm on encode so a zeroed field always means
/// "absent"; consumers treat the bias as exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binary {
    pub tid: u32,
    pub x: i16,
    pub y: i16,
    pub size: u16,
    pub flags: u16,
}

impl Binary {
    pub fn new(tid: u32, x: f32, y: f32, size: f32, flags: u16) -> Self {
        let mut bin = Binary {
            tid,
            x: (x * 100.0) as i16,
            y: (y * 100.0) as i16,
            size: (size * 100.0) as u16,
            flags,
        };
        if bin.x == 0 {
            bin.x = 1;
        }
        if bin.y == 0 {
            bin.y = 1;
        }
        if bin.size == 0 {
            bin.size = 1;
        }
        bin
    }

    pub fn values(&self) -> (f32, f32, f32) {
        (
            self.x as f32 / 100.0,
            self.y as f32 / 100.0,
            self.size as f32 / 100.0,
        )
    }

    pub fn write_v2<W: Write>(&self, out: &mut W) -> Result<(), PackedError> {
        out.write_u32::<LittleEndian>(self.tid)?;
        out.write_i16::<LittleEndian>(self.x)?;
        out.write_i16::<LittleEndian>(self.y)?;
        out.write_u16::<LittleEndian>(self.size)?;
        out.write_u16::<LittleEndian>(self.flags)?;
        Ok(())
    }

    pub fn read_v2<R: Read>(input: &mut R) -> Result<Binary, PackedError> {
        Ok(Binary {
            tid: input.read_u32::<LittleEndian>()?,
            x: input.read_i16::<LittleEndian>()?,
            y: input.read_i16::<LittleEndian>()?,
            size: input.read_u16::<LittleEndian>()?,
            flags: input.read_u16::<LittleEndian>()?,
        })
    }

    pub fn read_v1<R: Read>(input: &mut R) -> Result<Binary, PackedError> {
        let tid = input.read_u16::<LittleEndian>()? as u32;
        let x = input.read_i16::<LittleEndian>()?;
        let y = input.read_i16::<LittleEndian>()?;
        let size = input.read_u16::<LittleEndian>()?;
        let flags = input.read_u16::<LittleEndian>()?;
        let _one = input.read_u16::<LittleEndian>()?;
        Ok(Binary {
            tid,
            x,
            y,
            size,
            flags,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BinaryFrame {
    pub header: Header,
    pub uuid: TrackUuid,
    pub binaries: Vec<Binary>,
}

impl BinaryFrame {
    pub fn new(timestamp: u64, uuid: TrackUuid) -> Self {
        BinaryFrame {
            header: Header::new(timestamp, HeaderType::Frame),
            uuid,
            binaries: Vec::new(),
        }
    }

    pub fn add(&mut self, tid: u32, x: f32, y: f32, size: f32, flags: u16) {
        self.binaries.push(Binary::new(tid, x, y, size, flags));
    }
}

/// Append-only packed stream writer; always emits V2 records.
pub struct PackedWriter<W: Write> {
    out: W,
}

impl PackedWriter<File> {
    pub fn append(path: &Path) -> Result<Self, PackedError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(PackedWriter { out: file })
    }
}

impl<W: Write> PackedWriter<W> {
    pub fn new(out: W) -> Self {
        PackedWriter { out }
    }

    pub fn put_header(&mut self, header: &Header) -> Result<(), PackedError> {
        header.write_to(&mut self.out)?;
        self.out.flush()?;
        Ok(())
    }

    pub fn put_frame(&mut self, frame: &BinaryFrame) -> Result<(), PackedError> {
        let mut header = frame.header;
        header.size = frame.binaries.len() as u16;
        header.write_to(&mut self.out)?;
        self.out.write_all(frame.uuid.as_bytes())?;
        for binary in frame.binaries.iter() {
            binary.write_v2(&mut self.out)?;
        }
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Streaming reader over a packed file with byte-position seeks, header
/// resynchronisation and timestamp binary search.
pub struct PackedReader<R: Read + Seek> {
    inner: R,
    pub file_size: u64,
    pub begin_time: u64,
    pub start_time: u64,
    pub current_time: u64,
    last_resync_warn: u64,
}

impl PackedReader<Cursor<Vec<u8>>> {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, PackedError> {
        PackedReader::new(Cursor::new(bytes))
    }
}

impl PackedReader<File> {
    pub fn open(path: &Path) -> Result<Self, PackedError> {
        PackedReader::new(File::open(path)?)
    }
}

impl<R: Read + Seek> PackedReader<R> {
    pub fn new(mut inner: R) -> Result<Self, PackedError> {
        let file_size = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;

        let mut reader = PackedReader {
            inner,
            file_size,
            begin_time: 0,
            start_time: getmsec(),
            current_time: 0,
            last_resync_warn: 0,
        };

        // first valid header carries the file's begin time
        if let Some(header) = reader.resync_header()? {
            reader.begin_time = header.timestamp;
        }
        reader.seek(0)?;
        Ok(reader)
    }

    pub fn tell(&mut self) -> Result<u64, PackedError> {
        Ok(self.inner.stream_position()?)
    }

    pub fn seek(&mut self, pos: u64) -> Result<(), PackedError> {
        self.inner.seek(SeekFrom::Start(pos.min(self.file_size)))?;
        Ok(())
    }

    pub fn is_eof(&mut self) -> bool {
        self.tell().map(|pos| pos >= self.file_size).unwrap_or(true)
    }

    pub fn play_pos(&mut self) -> f32 {
        if self.file_size == 0 {
            return 0.0;
        }
        self.tell().unwrap_or(0) as f32 / self.file_size as f32
    }

    pub fn timestamp(&self) -> u64 {
        self.begin_time + self.current_time
    }

    /// Read a header at the cursor; the cursor moves past it on success and
    /// stays consumed on failure (callers resync).
    pub fn read_header(&mut self) -> Result<Option<Header>, PackedError> {
        if self.tell()? + HEADER_SIZE > self.file_size {
            return Err(PackedError::Truncated);
        }
        Ok(Header::read_from(&mut self.inner)?)
    }

    /// Advance 4 bytes at a time until a Frame or Start header lines up;
    /// leaves the cursor at the header. Returns None at end of stream.
    fn resync_header(&mut self) -> Result<Option<Header>, PackedError> {
        let mut warned = false;
        loop {
            let pos = self.tell()?;
            if pos + HEADER_SIZE > self.file_size {
                return Ok(None);
            }
            match self.read_header()? {
                Some(header)
                    if header.is_type(HeaderType::Frame) || header.is_type(HeaderType::Start) =>
                {
                    self.seek(pos)?;
                    return Ok(Some(header));
                }
                _ => {
                    if !warned {
                        let now = getmsec();
                        if now - self.last_resync_warn > RESYNC_WARN_INTERVAL_MSEC {
                            warn!("packed stream out of sync at byte {pos}, resyncing");
                            self.last_resync_warn = now;
                        }
                        warned = true;
                    }
                    self.seek(pos + 4)?;
                }
            }
        }
    }

    /// Land on the next valid header and return the stream time there.
    pub fn sync(&mut self) -> Result<u64, PackedError> {
        match self.resync_header()? {
            Some(header) => {
                self.current_time = header.timestamp.saturating_sub(self.begin_time);
                Ok(self.current_time)
            }
            None => Err(PackedError::LostSync),
        }
    }

    /// Seek to `fraction` of the file, 4-byte aligned, and resync. Returns
    /// the stream time at the landing header.
    pub fn play(&mut self, fraction: f32) -> Result<u64, PackedError> {
        let mut pos = (fraction.clamp(0.0, 1.0) as f64 * self.file_size as f64) as u64;
        pos -= pos % 4;
        self.seek(pos)?;
        self.sync()
    }

    /// Binary search on stream time using repeated [`play`].
    pub fn sync_to(&mut self, play_time: u64) -> Result<u64, PackedError> {
        let mut ltime = 0.0f64;
        let mut rtime = 1.0f64;
        let mut last_pos = u64::MAX;

        while ltime < rtime {
            let time = 0.5 * (rtime + ltime);
            let t = match self.play(time as f32) {
                Ok(t) => t,
                // probed past the last record
                Err(PackedError::LostSync) => {
                    rtime = time;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let pos = self.tell()?;
            if pos == last_pos {
                return Ok(t);
            }
            last_pos = pos;

            use std::cmp::Ordering::*;
            match t.cmp(&play_time) {
                Greater => rtime = time,
                Less => ltime = time,
                Equal => return Ok(t),
            }
        }
        Ok(self.current_time)
    }

    /// Read the frame payload that follows `header`.
    pub fn read_frame(&mut self, header: Header) -> Result<BinaryFrame, PackedError> {
        let mut uuid_bytes = [0u8; 16];
        self.inner.read_exact(&mut uuid_bytes)?;

        let mut binaries = Vec::with_capacity(header.size as usize);
        for _ in 0..header.size {
            let binary = if header.version() == VERSION_1 {
                Binary::read_v1(&mut self.inner)?
            } else {
                Binary::read_v2(&mut self.inner)?
            };
            binaries.push(binary);
        }
        Ok(BinaryFrame {
            header,
            uuid: TrackUuid::from_bytes(uuid_bytes),
            binaries,
        })
    }

    /// Next record at the cursor, resyncing past damage.
    pub fn next_record(&mut self) -> Result<Option<Record>, PackedError> {
        loop {
            let pos = self.tell()?;
            if pos + HEADER_SIZE > self.file_size {
                return Ok(None);
            }
            let header = match self.read_header()? {
                Some(header) => header,
                None => {
                    self.seek(pos + 4)?;
                    continue;
                }
            };
            match header.header_type() {
                HeaderType::Frame => return Ok(Some(Record::Frame(self.read_frame(header)?))),
                HeaderType::Start => return Ok(Some(Record::Start(header))),
                HeaderType::Stop => return Ok(Some(Record::Stop(header))),
                HeaderType::Unknown => {
                    self.seek(pos + 4)?;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum Record {
    Start(Header),
    Stop(Header),
    Frame(BinaryFrame),
}
