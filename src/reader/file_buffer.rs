//! Sample files on disk, and typed access to their bytes.
//!
//! Visibility samples are stored as little-endian `f32` real/imaginary pairs
//! (8 bytes each), flag samples as a single byte (0 or 1).

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Read, Seek, SeekFrom, Write},
    ops::Range,
    path::{Path, PathBuf},
};

use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use marlu::c32;

use crate::io::error::IOError;

/// Bytes per visibility sample.
pub const DATA_SAMPLE_BYTES: u64 = 8;
/// Bytes per flag sample.
pub const FLAG_SAMPLE_BYTES: u64 = 1;

/// Read-only view of encoded visibility samples.
#[derive(Debug, Clone, Copy)]
pub struct DataSamples<'a> {
    bytes: &'a [u8],
}

impl<'a> DataSamples<'a> {
    /// Wrap encoded samples.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// The number of whole samples.
    pub fn len(&self) -> usize {
        self.bytes.len() / DATA_SAMPLE_BYTES as usize
    }

    /// Whether there are no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample `index`, or `None` past the end.
    pub fn get(&self, index: usize) -> Option<c32> {
        let start = index.checked_mul(DATA_SAMPLE_BYTES as usize)?;
        let sample = self.bytes.get(start..start + DATA_SAMPLE_BYTES as usize)?;
        Some(c32::new(
            LittleEndian::read_f32(&sample[..4]),
            LittleEndian::read_f32(&sample[4..]),
        ))
    }
}

/// Read-only view of encoded flag samples.
#[derive(Debug, Clone, Copy)]
pub struct FlagSamples<'a> {
    bytes: &'a [u8],
}

impl<'a> FlagSamples<'a> {
    /// Wrap encoded samples.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// The number of samples.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether there are no samples.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Sample `index`, or `None` past the end.
    pub fn get(&self, index: usize) -> Option<bool> {
        self.bytes.get(index).map(|&b| b != 0)
    }
}

/// Append the encoding of `values` to `out`.
pub fn encode_data<I: IntoIterator<Item = c32>>(values: I, out: &mut Vec<u8>) {
    let mut sample = [0_u8; DATA_SAMPLE_BYTES as usize];
    for value in values {
        LittleEndian::write_f32(&mut sample[..4], value.re);
        LittleEndian::write_f32(&mut sample[4..], value.im);
        out.extend_from_slice(&sample);
    }
}

/// Append the encoding of `values` to `out`.
pub fn encode_flags<I: IntoIterator<Item = bool>>(values: I, out: &mut Vec<u8>) {
    out.extend(values.into_iter().map(u8::from));
}

/// A file of fixed-width samples.
#[derive(Debug)]
pub struct SampleFile {
    path: PathBuf,
    file: File,
    sample_bytes: u64,
    len: u64,
}

impl SampleFile {
    /// Create (or truncate) a file of `len` zeroed samples.
    ///
    /// # Errors
    ///
    /// Will return [`IOError::TempFileCreate`] if the file can't be created or
    /// sized.
    pub fn create(path: &Path, len: u64, sample_bytes: u64) -> Result<Self, IOError> {
        trace!("creating {} with {} samples", path.display(), len);
        let create_err = |err| IOError::TempFileCreate {
            path: path.display().to_string(),
            err,
            source_file: file!(),
            source_line: line!(),
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(create_err)?;
        file.set_len(len * sample_bytes).map_err(create_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            sample_bytes,
            len,
        })
    }

    /// Open an existing file for reading and writing.
    ///
    /// # Errors
    ///
    /// Will return [`IOError::TempFileAccess`] if the file can't be opened.
    pub fn open(path: &Path, sample_bytes: u64) -> Result<Self, IOError> {
        let access_err = |err| IOError::TempFileAccess {
            path: path.display().to_string(),
            err,
            source_file: file!(),
            source_line: line!(),
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(access_err)?;
        let bytes = file.metadata().map_err(access_err)?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            sample_bytes,
            len: bytes / sample_bytes,
        })
    }

    /// The location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The number of samples in the file.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the file holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn access_err(&self, err: std::io::Error) -> IOError {
        IOError::TempFileAccess {
            path: self.path.display().to_string(),
            err,
            source_file: file!(),
            source_line: line!(),
        }
    }

    fn check_bounds(&self, samples: &Range<u64>) -> Result<(), IOError> {
        if samples.start > samples.end || samples.end > self.len {
            return Err(IOError::TempFileBounds {
                path: self.path.display().to_string(),
                start: samples.start,
                end: samples.end,
                len: self.len,
            });
        }
        Ok(())
    }

    /// Read the encoded samples `samples`.
    ///
    /// # Errors
    ///
    /// Will return [`IOError::TempFileBounds`] for ranges outside the file, or
    /// [`IOError::TempFileAccess`] if reading fails.
    pub fn read_samples(&mut self, samples: Range<u64>) -> Result<Vec<u8>, IOError> {
        self.check_bounds(&samples)?;
        let mut bytes = vec![0; ((samples.end - samples.start) * self.sample_bytes) as usize];
        self.file
            .seek(SeekFrom::Start(samples.start * self.sample_bytes))
            .map_err(|e| self.access_err(e))?;
        self.file
            .read_exact(&mut bytes)
            .map_err(|e| self.access_err(e))?;
        Ok(bytes)
    }

    /// Overwrite samples starting at sample `first` with `bytes`, which must
    /// be whole samples.
    ///
    /// # Errors
    ///
    /// Will return [`IOError::TempFileBounds`] for writes past the end, or
    /// [`IOError::TempFileAccess`] if writing fails.
    pub fn write_samples(&mut self, first: u64, bytes: &[u8]) -> Result<(), IOError> {
        let count = bytes.len() as u64 / self.sample_bytes;
        self.check_bounds(&(first..first + count))?;
        self.file
            .seek(SeekFrom::Start(first * self.sample_bytes))
            .map_err(|e| self.access_err(e))?;
        self.file.write_all(bytes).map_err(|e| self.access_err(e))
    }

    /// Flush written samples to disk.
    ///
    /// # Errors
    ///
    /// Will return [`IOError::TempFileAccess`] if syncing fails.
    pub fn sync(&mut self) -> Result<(), IOError> {
        self.file.sync_data().map_err(|e| self.access_err(e))
    }

    /// A write buffer over this file holding up to `capacity` bytes.
    pub fn buffered(&mut self, capacity: usize) -> ReorderedFileBuffer<'_> {
        ReorderedFileBuffer {
            file: self,
            capacity,
            entries: Vec::new(),
            bytes: Vec::new(),
        }
    }
}

/// Collects writes at arbitrary positions of a [`SampleFile`] and performs
/// them in file order once `capacity` bytes are pending.
///
/// Writes still pending when the buffer is dropped are lost; call
/// [`ReorderedFileBuffer::finish`].
#[derive(Debug)]
pub struct ReorderedFileBuffer<'a> {
    file: &'a mut SampleFile,
    capacity: usize,
    /// (first sample, byte offset in `bytes`, byte length)
    entries: Vec<(u64, usize, usize)>,
    bytes: Vec<u8>,
}

impl ReorderedFileBuffer<'_> {
    /// Queue `bytes` for samples starting at `first`.
    ///
    /// # Errors
    ///
    /// Will return [`IOError`] if a flush triggered by this write fails.
    pub fn write_at(&mut self, first: u64, bytes: &[u8]) -> Result<(), IOError> {
        self.entries.push((first, self.bytes.len(), bytes.len()));
        self.bytes.extend_from_slice(bytes);
        if self.bytes.len() >= self.capacity {
            self.flush()?;
        }
        Ok(())
    }

    /// Write all pending data.
    ///
    /// # Errors
    ///
    /// Will return [`IOError`] if a write is out of bounds or fails.
    pub fn flush(&mut self) -> Result<(), IOError> {
        if self.entries.is_empty() {
            return Ok(());
        }
        trace!(
            "flushing {} writes ({} bytes) to {}",
            self.entries.len(),
            self.bytes.len(),
            self.file.path.display()
        );
        self.entries.sort_by_key(|&(first, _, _)| first);
        let sample_bytes = self.file.sample_bytes;
        let end = self
            .entries
            .iter()
            .map(|&(first, _, len)| first + len as u64 / sample_bytes)
            .max()
            .unwrap_or(0);
        self.file.check_bounds(&(self.entries[0].0..end))?;

        let path = self.file.path.display().to_string();
        let access_err = |err| IOError::TempFileAccess {
            path: path.clone(),
            err,
            source_file: file!(),
            source_line: line!(),
        };
        let mut writer = BufWriter::with_capacity(1 << 20, &self.file.file);
        let mut position = None;
        for &(first, offset, len) in &self.entries {
            let byte_pos = first * sample_bytes;
            if position != Some(byte_pos) {
                writer
                    .seek(SeekFrom::Start(byte_pos))
                    .map_err(access_err)?;
            }
            writer
                .write_all(&self.bytes[offset..offset + len])
                .map_err(access_err)?;
            position = Some(byte_pos + len as u64);
        }
        writer.flush().map_err(access_err)?;
        self.entries.clear();
        self.bytes.clear();
        Ok(())
    }

    /// Write all pending data and release the file.
    ///
    /// # Errors
    ///
    /// see [`ReorderedFileBuffer::flush`]
    pub fn finish(mut self) -> Result<(), IOError> {
        self.flush()
    }
}
