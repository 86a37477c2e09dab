use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::ops::{Index, IndexMut};
use std::path::Path;

use anyhow::{anyhow, Context, Result};

use crate::geometry::{self, Point2, Transform2};

/// One angular bin. `quality < 0` means the bin holds no return.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub quality: i32,
    pub angle: f32,
    pub distance: f32,
    pub coord: Point2,
    pub source_quality: i32,
    pub source_index: usize,
    pub oid: u32,
    pub touched: bool,
    pub accum_count: u32,
}

impl Default for Sample {
    fn default() -> Self {
        Sample {
            quality: -1,
            angle: 0.0,
            distance: 0.0,
            coord: Point2::origin(),
            source_quality: -1,
            source_index: 0,
            oid: 0,
            touched: false,
            accum_count: 0,
        }
    }
}

impl Sample {
    pub fn has_return(&self) -> bool {
        self.quality >= 0
    }
}

/// Ring of angular bins; bin `i` covers azimuth `i/len * 2π`.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    samples: Vec<Sample>,
}

impl SampleBuffer {
    pub fn new(num_samples: usize) -> Self {
        let mut samples = Vec::with_capacity(num_samples);
        for i in 0..num_samples {
            samples.push(Sample {
                angle: angle_by_index(i, num_samples),
                ..Sample::default()
            });
        }
        SampleBuffer { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Sample> {
        self.samples.iter_mut()
    }

    pub fn index_by_angle(&self, angle: f32) -> usize {
        index_by_angle(angle, self.samples.len())
    }

    pub fn wrap_index(&self, index: i64) -> usize {
        wrap_index(index, self.samples.len())
    }

    pub fn angle_by_index(&self, index: usize) -> f32 {
        angle_by_index(index, self.samples.len())
    }

    /// Apply `m` to every bin coordinate.
    pub fn transform(&mut self, m: &Transform2) {
        if geometry::is_identity(m) {
            return;
        }
        for s in self.samples.iter_mut() {
            s.coord = m * s.coord;
        }
    }

    /// Environment file format: one line per bin, `x y angle distance quality`.
    pub fn write_file(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
            }
        }
        let file = File::create(path).with_context(|| format!("writing {}", path.display()))?;
        let mut out = BufWriter::new(file);
        for s in self.samples.iter() {
            writeln!(
                out,
                "{} {} {} {} {}",
                s.coord.x, s.coord.y, s.angle, s.distance, s.quality
            )?;
        }
        Ok(())
    }

    /// Counterpart of [`write_file`]. The line count is the implicit
    /// `num_samples` and must match this buffer.
    pub fn read_file(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path).with_context(|| format!("reading {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut count = 0;
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if i >= self.samples.len() {
                return Err(anyhow!(
                    "{}: more records than the {} angular bins",
                    path.display(),
                    self.samples.len()
                ));
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 5 {
                return Err(anyhow!("{}:{}: expected 5 fields", path.display(), i + 1));
            }
            let s = &mut self.samples[i];
            s.coord = Point2::new(fields[0].parse()?, fields[1].parse()?);
            s.angle = fields[2].parse()?;
            s.distance = fields[3].parse()?;
            s.quality = fields[4].parse()?;
            count += 1;
        }
        if count != self.samples.len() {
            return Err(anyhow!(
                "{}: {} records for {} angular bins",
                path.display(),
                count,
                self.samples.len()
            ));
        }
        Ok(())
    }
}

impl Index<usize> for SampleBuffer {
    type Output = Sample;

    fn index(&self, index: usize) -> &Sample {
        &self.samples[index]
    }
}

impl IndexMut<usize> for SampleBuffer {
    fn index_mut(&mut self, index: usize) -> &mut Sample {
        &mut self.samples[index]
    }
}

pub fn index_by_angle(angle: f32, num_samples: usize) -> usize {
    let n = num_samples as f32;
    let mut rel = angle / std::f32::consts::TAU;
    rel -= rel.floor();
    (rel * n).round() as usize % num_samples
}

pub fn wrap_index(index: i64, num_samples: usize) -> usize {
    let n = num_samples as i64;
    (((index % n) + n) % n) as usize
}

pub fn angle_by_index(index: usize, num_samples: usize) -> f32 {
    index as f32 / num_samples as f32 * std::f32::consts::TAU
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::translation;

    #[test]
    fn angle_index_round_trip() {
        let n = 720;
        for i in [0usize, 1, 359, 360, 719] {
            assert_eq!(index_by_angle(angle_by_index(i, n), n), i);
        }
    }

    #[test]
    fn wrap_index_negative() {
        assert_eq!(wrap_index(-1, 720), 719);
        assert_eq!(wrap_index(720, 720), 0);
        assert_eq!(wrap_index(1441, 720), 1);
    }

    #[test]
    fn transform_moves_coords() {
        let mut buf = SampleBuffer::new(4);
        buf[0].coord = Point2::new(1.0, 0.0);
        buf.transform(&translation(2.0, 0.5));
        assert!((buf[0].coord.x - 3.0).abs() < 1e-6);
        assert!((buf[0].coord.y - 0.5).abs() < 1e-6);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.txt");
        let mut buf = SampleBuffer::new(8);
        for i in 0..8 {
            buf[i].quality = i as i32 * 10;
            buf[i].distance = 1.0 + i as f32 * 0.25;
            buf[i].coord = Point2::new(i as f32, -(i as f32));
        }
        buf.write_file(&path).unwrap();

        let mut loaded = SampleBuffer::new(8);
        loaded.read_file(&path).unwrap();
        for i in 0..8 {
            assert_eq!(loaded[i].quality, buf[i].quality);
            assert!((loaded[i].distance - buf[i].distance).abs() < 1e-6);
            assert!((loaded[i].coord.x - buf[i].coord.x).abs() < 1e-6);
        }
    }

    #[test]
    fn read_rejects_wrong_bin_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.txt");
        SampleBuffer::new(4).write_file(&path).unwrap();
        let mut other = SampleBuffer::new(8);
        assert!(other.read_file(&path).is_err());
    }
}
