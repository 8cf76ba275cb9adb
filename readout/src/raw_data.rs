/*!
Durable storage of read-out chunks.

A raw data store with stem `S` consists of

- `S.raw`   little-endian `u32` data words,
- `S.meta`  one 32-byte row per chunk
  `index_start u32, index_stop u32, timestamp_start f64, timestamp_stop f64, error u32, length u32`,
- `S.param` one little-endian `i64` per declared scan parameter per chunk,
- `S.json`  header with the declared scan parameters and attribute groups.

[`RawDataFile`] rotates to a new store when watched scan parameters change
or when the word table would grow past its row ceiling. All operations are
serialized by one mutex so the read-out worker and the run control may share
a file.
*/

use crate::error::SinkError;
use crate::fifo_readout::DataChunk;
use crate::live::{LiveHeader, LivePublisher};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub const FORMAT_VERSION: u32 = 1;
pub const META_ROW_BYTES: usize = 32;
const WORD_BYTES: usize = 4;
const PARAM_BYTES: usize = 8;

pub type Result<T> = std::result::Result<T, SinkError>;

/// How an existing store is treated on open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Start an empty store, replacing existing files
    Write,
    /// Continue an existing store, creating it if missing
    Append,
}

/// When a change of scan parameters starts a new store
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RotatePolicy {
    #[default]
    Never,
    AnyChange,
    OnChange(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct SinkOptions {
    /// Maximum number of words per store before a continuation is opened
    pub max_rows: u64,
    /// Address of the live publisher, e.g. "0.0.0.0:5500"
    pub live_address: Option<String>,
    /// Pending live frames before new ones are dropped
    pub live_queue: usize,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            max_rows: u32::MAX as u64,
            live_address: None,
            live_queue: 1000,
        }
    }
}

/// Per-chunk metadata row
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetaRow {
    pub index_start: u32,
    pub index_stop: u32,
    pub timestamp_start: f64,
    pub timestamp_stop: f64,
    pub error: u32,
    pub length: u32,
}

impl MetaRow {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.index_start);
        buf.put_u32_le(self.index_stop);
        buf.put_f64_le(self.timestamp_start);
        buf.put_f64_le(self.timestamp_stop);
        buf.put_u32_le(self.error);
        buf.put_u32_le(self.length);
    }

    fn get(buf: &mut impl Buf) -> Self {
        Self {
            index_start: buf.get_u32_le(),
            index_stop: buf.get_u32_le(),
            timestamp_start: buf.get_f64_le(),
            timestamp_stop: buf.get_f64_le(),
            error: buf.get_u32_le(),
            length: buf.get_u32_le(),
        }
    }
}

/// Contents of `S.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreHeader {
    pub format_version: u32,
    pub scan_parameters: Vec<String>,
    #[serde(default)]
    pub groups: BTreeMap<String, serde_json::Value>,
    pub created: String,
}

fn part(stem: &Path, extension: &str) -> PathBuf {
    let mut name: OsString = stem.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

fn suffixed(stem: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = stem.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn write_header(stem: &Path, header: &StoreHeader) -> Result<()> {
    fs::write(part(stem, "json"), serde_json::to_vec_pretty(header)?)?;
    Ok(())
}

fn read_header(stem: &Path) -> Result<StoreHeader> {
    let path = part(stem, "json");
    if !path.exists() {
        return Err(SinkError::NotFound(stem.to_path_buf()));
    }
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

/// One open store
struct Store {
    stem: PathBuf,
    header: StoreHeader,
    raw: BufWriter<File>,
    meta: BufWriter<File>,
    param: Option<BufWriter<File>>,
    words: u64,
    rows: u64,
}

impl Store {
    fn create(stem: &Path, scan_parameters: &[String], groups: BTreeMap<String, serde_json::Value>) -> Result<Self> {
        if let Some(parent) = stem.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let header = StoreHeader {
            format_version: FORMAT_VERSION,
            scan_parameters: scan_parameters.to_vec(),
            groups,
            created: chrono::Utc::now().to_rfc3339(),
        };
        write_header(stem, &header)?;
        let param = if scan_parameters.is_empty() {
            None
        } else {
            Some(BufWriter::new(File::create(part(stem, "param"))?))
        };
        debug!("Created raw data store {}", stem.display());
        Ok(Self {
            stem: stem.to_path_buf(),
            header,
            raw: BufWriter::new(File::create(part(stem, "raw"))?),
            meta: BufWriter::new(File::create(part(stem, "meta"))?),
            param,
            words: 0,
            rows: 0,
        })
    }

    fn reopen(stem: &Path, scan_parameters: &[String]) -> Result<Self> {
        let header = read_header(stem)?;
        if header.scan_parameters != scan_parameters {
            return Err(SinkError::ParameterMismatch {
                path: stem.to_path_buf(),
                found: header.scan_parameters,
                expected: scan_parameters.to_vec(),
            });
        }
        let raw_len = fs::metadata(part(stem, "raw"))?.len();
        let meta_len = fs::metadata(part(stem, "meta"))?.len();
        if raw_len % WORD_BYTES as u64 != 0 || meta_len % META_ROW_BYTES as u64 != 0 {
            return Err(SinkError::Corrupt {
                path: stem.to_path_buf(),
                reason: format!("truncated tables ({} raw bytes, {} meta bytes)", raw_len, meta_len),
            });
        }
        let append = |extension: &str| -> Result<BufWriter<File>> {
            Ok(BufWriter::new(OpenOptions::new().create(true).append(true).open(part(stem, extension))?))
        };
        let param = if scan_parameters.is_empty() { None } else { Some(append("param")?) };
        let store = Self {
            stem: stem.to_path_buf(),
            header,
            raw: append("raw")?,
            meta: append("meta")?,
            param,
            words: raw_len / WORD_BYTES as u64,
            rows: meta_len / META_ROW_BYTES as u64,
        };
        info!(
            "📂 Reopened raw data store {} ({} words, {} chunks)",
            stem.display(),
            store.words,
            store.rows
        );
        Ok(store)
    }

    fn append(&mut self, chunk: &DataChunk, parameters: &[i64]) -> Result<MetaRow> {
        let length = chunk.words.len();
        let row = MetaRow {
            index_start: self.words as u32,
            index_stop: (self.words + length as u64) as u32,
            timestamp_start: chunk.timestamp_start,
            timestamp_stop: chunk.timestamp_stop,
            error: chunk.error_code,
            length: length as u32,
        };

        let mut buf = BytesMut::with_capacity(length * WORD_BYTES);
        for &word in &chunk.words {
            buf.put_u32_le(word);
        }
        self.raw.write_all(&buf)?;

        buf.clear();
        row.put(&mut buf);
        self.meta.write_all(&buf)?;

        if let Some(param) = self.param.as_mut() {
            buf.clear();
            for &value in parameters {
                buf.put_i64_le(value);
            }
            param.write_all(&buf)?;
        }

        self.words += length as u64;
        self.rows += 1;
        Ok(row)
    }

    fn flush(&mut self) -> Result<()> {
        self.raw.flush()?;
        self.meta.flush()?;
        if let Some(param) = self.param.as_mut() {
            param.flush()?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.flush()?;
        write_header(&self.stem, &self.header)?;
        info!("💾 Closed raw data store {}", self.stem.display());
        info!("   Words: {}", self.words);
        info!("   Chunks: {}", self.rows);
        Ok(())
    }
}

struct Inner {
    base: PathBuf,
    mode: OpenMode,
    /// Name of the current store before any continuation suffix
    series: PathBuf,
    continuation: u32,
    store: Option<Store>,
    scan_parameters: Vec<String>,
    values: Vec<i64>,
    last_values: Option<Vec<i64>>,
    filenames: Vec<PathBuf>,
    max_rows: u64,
}

impl Inner {
    fn store(&mut self) -> Result<&mut Store> {
        self.store.as_mut().ok_or(SinkError::Closed)
    }

    fn rotate(&mut self, stem: PathBuf) -> Result<()> {
        let groups = match self.store.take() {
            Some(store) => {
                let groups = store.header.groups.clone();
                store.finish()?;
                groups
            }
            None => return Err(SinkError::Closed),
        };
        // stores written earlier in this session, or by a previous session
        // in append mode, are continued instead of truncated
        let reuse = self.filenames.contains(&stem)
            || (self.mode == OpenMode::Append && part(&stem, "json").exists());
        let store = if reuse {
            let mut store = Store::reopen(&stem, &self.scan_parameters)?;
            store.header.groups.extend(groups);
            store
        } else {
            Store::create(&stem, &self.scan_parameters, groups)?
        };
        info!("🔄 Rotated raw data to {}", stem.display());
        if !self.filenames.contains(&stem) {
            self.filenames.push(stem);
        }
        self.store = Some(store);
        Ok(())
    }

    /// Stem named from the watched parameters' current values
    fn parameter_stem(&self, watched: &[usize]) -> PathBuf {
        let suffix: String = watched
            .iter()
            .map(|&i| format!("_{}_{}", self.scan_parameters[i], self.values[i]))
            .collect();
        suffixed(&self.base, &suffix)
    }
}

/// Rotating raw data writer with an optional live mirror
pub struct RawDataFile {
    inner: Mutex<Inner>,
    live: Option<LivePublisher>,
}

impl RawDataFile {
    pub fn open(path: impl AsRef<Path>, mode: OpenMode, scan_parameters: &[&str], options: SinkOptions) -> Result<Self> {
        let base = path.as_ref().to_path_buf();
        let scan_parameters: Vec<String> = scan_parameters.iter().map(|s| s.to_string()).collect();

        let store = match mode {
            OpenMode::Append if part(&base, "json").exists() => Store::reopen(&base, &scan_parameters)?,
            _ => {
                let store = Store::create(&base, &scan_parameters, BTreeMap::new())?;
                info!("💾 Opened raw data store {}", base.display());
                store
            }
        };

        let live = match options.live_address.as_deref() {
            Some(address) => Some(LivePublisher::bind(address, options.live_queue)?),
            None => None,
        };

        let values = vec![0; scan_parameters.len()];
        Ok(Self {
            inner: Mutex::new(Inner {
                series: base.clone(),
                filenames: vec![base.clone()],
                base,
                mode,
                continuation: 0,
                store: Some(store),
                scan_parameters,
                values,
                last_values: None,
                max_rows: options.max_rows.max(1),
            }),
            live,
        })
    }

    /// Store one chunk together with the current scan parameter values.
    ///
    /// Parameters not passed keep their previous value. Unknown keys are
    /// rejected before anything is written.
    pub fn append(
        &self,
        chunk: &DataChunk,
        scan_parameters: &BTreeMap<String, i64>,
        rotate: &RotatePolicy,
        flush: bool,
    ) -> Result<()> {
        let mut inner = self.lock();
        inner.store()?;

        let mut updates = Vec::with_capacity(scan_parameters.len());
        for (name, &value) in scan_parameters {
            match inner.scan_parameters.iter().position(|p| p == name) {
                Some(index) => updates.push((index, value)),
                None => return Err(SinkError::UnknownScanParameter(name.clone())),
            }
        }
        let watched: Vec<usize> = match rotate {
            RotatePolicy::Never => Vec::new(),
            RotatePolicy::AnyChange => (0..inner.scan_parameters.len()).collect(),
            RotatePolicy::OnChange(names) => {
                let mut watched = Vec::with_capacity(names.len());
                for name in names {
                    match inner.scan_parameters.iter().position(|p| p == name) {
                        Some(index) => watched.push(index),
                        None => return Err(SinkError::UnknownScanParameter(name.clone())),
                    }
                }
                watched.sort_unstable();
                watched
            }
        };
        for (index, value) in updates {
            inner.values[index] = value;
        }

        let changed = inner
            .last_values
            .as_ref()
            .map(|last| watched.iter().any(|&i| last[i] != inner.values[i]))
            .unwrap_or(false);
        if changed {
            let stem = inner.parameter_stem(&watched);
            inner.series = stem.clone();
            inner.continuation = 0;
            inner.rotate(stem)?;
        }

        let length = chunk.words.len() as u64;
        let max_rows = inner.max_rows;
        // reused continuation stores may already be full
        loop {
            let words = inner.store()?.words;
            if words == 0 || words + length <= max_rows {
                break;
            }
            inner.continuation += 1;
            let stem = suffixed(&inner.series, &format!("_{}", inner.continuation));
            inner.rotate(stem)?;
        }

        let values = inner.values.clone();
        let store = inner.store()?;
        store.append(chunk, &values)?;
        if flush {
            store.flush()?;
        }
        inner.last_values = Some(values);

        if let Some(live) = &self.live {
            let parameters = inner
                .scan_parameters
                .iter()
                .cloned()
                .zip(inner.values.iter().copied())
                .collect();
            let header = LiveHeader::readout_data(
                chunk.words.len(),
                chunk.timestamp_start,
                chunk.timestamp_stop,
                chunk.error_code,
                parameters,
            );
            live.publish(&header, &chunk.words);
        }
        Ok(())
    }

    /// Attach an attribute group to the current store; it is copied to
    /// every store opened by a later rotation.
    pub fn set_group(&self, name: &str, value: serde_json::Value) -> Result<()> {
        let mut inner = self.lock();
        let store = inner.store()?;
        store.header.groups.insert(name.to_string(), value);
        write_header(&store.stem, &store.header)
    }

    pub fn flush(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.store()?.flush()
    }

    /// Finish the current store. Further appends fail with `Closed`.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.store.take() {
            Some(store) => store.finish(),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().store.is_none()
    }

    /// Stems of all stores written so far, in creation order
    pub fn filenames(&self) -> Vec<PathBuf> {
        self.lock().filenames.clone()
    }

    pub fn live_address(&self) -> Option<std::net::SocketAddr> {
        self.live.as_ref().map(LivePublisher::local_addr)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // a panic while holding the lock leaves the files consistent up to the last write
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for RawDataFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close raw data store: {}", e);
        }
    }
}

/// Fully loaded raw data store
#[derive(Debug, Clone)]
pub struct RawDataReader {
    pub header: StoreHeader,
    pub words: Vec<u32>,
    pub meta: Vec<MetaRow>,
    pub parameters: Vec<Vec<i64>>,
}

impl RawDataReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let stem = path.as_ref();
        let header = read_header(stem)?;
        let corrupt = |reason: String| SinkError::Corrupt {
            path: stem.to_path_buf(),
            reason,
        };

        let raw = fs::read(part(stem, "raw"))?;
        if raw.len() % WORD_BYTES != 0 {
            return Err(corrupt(format!("{} raw bytes is not a whole number of words", raw.len())));
        }
        let mut buf = &raw[..];
        let mut words = Vec::with_capacity(raw.len() / WORD_BYTES);
        while buf.has_remaining() {
            words.push(buf.get_u32_le());
        }

        let meta_bytes = fs::read(part(stem, "meta"))?;
        if meta_bytes.len() % META_ROW_BYTES != 0 {
            return Err(corrupt(format!("{} meta bytes is not a whole number of rows", meta_bytes.len())));
        }
        let mut buf = &meta_bytes[..];
        let mut meta = Vec::with_capacity(meta_bytes.len() / META_ROW_BYTES);
        while buf.has_remaining() {
            meta.push(MetaRow::get(&mut buf));
        }
        if let Some(last) = meta.last() {
            if last.index_stop as usize != words.len() {
                return Err(corrupt(format!(
                    "last chunk ends at word {} but {} words are stored",
                    last.index_stop,
                    words.len()
                )));
            }
        }

        let mut parameters = Vec::new();
        let columns = header.scan_parameters.len();
        if columns > 0 {
            let param_bytes = fs::read(part(stem, "param"))?;
            let row_bytes = columns * PARAM_BYTES;
            if param_bytes.len() != meta.len() * row_bytes {
                return Err(corrupt(format!(
                    "{} parameter bytes for {} chunks of {} parameters",
                    param_bytes.len(),
                    meta.len(),
                    columns
                )));
            }
            let mut buf = &param_bytes[..];
            while buf.has_remaining() {
                parameters.push((0..columns).map(|_| buf.get_i64_le()).collect());
            }
        }

        Ok(Self {
            header,
            words,
            meta,
            parameters,
        })
    }

    /// Words of chunk `row`
    pub fn chunk(&self, row: usize) -> Option<&[u32]> {
        let meta = self.meta.get(row)?;
        self.words.get(meta.index_start as usize..meta.index_stop as usize)
    }

    /// Value of scan parameter `name` for chunk `row`
    pub fn parameter(&self, row: usize, name: &str) -> Option<i64> {
        let column = self.header.scan_parameters.iter().position(|p| p == name)?;
        self.parameters.get(row).map(|values| values[column])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chunk(words: Vec<u32>, t: f64) -> DataChunk {
        DataChunk {
            words,
            timestamp_start: t,
            timestamp_stop: t + 0.05,
            error_code: 0,
        }
    }

    fn params(pairs: &[(&str, i64)]) -> BTreeMap<String, i64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = TempDir::new().unwrap();
        let stem = dir.path().join("run");
        let file = RawDataFile::open(&stem, OpenMode::Write, &["PlsrDAC"], SinkOptions::default()).unwrap();

        let mut total = 0;
        for n in 1..=5u32 {
            let words: Vec<u32> = (0..n * 3).collect();
            total += words.len();
            file.append(&chunk(words, n as f64), &params(&[("PlsrDAC", n as i64 * 10)]), &RotatePolicy::Never, false)
                .unwrap();
        }
        file.close().unwrap();

        let reader = RawDataReader::open(&stem).unwrap();
        assert_eq!(reader.meta.len(), 5);
        assert_eq!(reader.words.len(), total);
        let summed: u32 = reader.meta.iter().map(|m| m.index_stop - m.index_start).sum();
        assert_eq!(summed as usize, total);
        assert_eq!(reader.parameter(4, "PlsrDAC"), Some(50));
        assert_eq!(reader.chunk(1), Some(&[0, 1, 2, 3, 4, 5][..]));
        assert_eq!(reader.meta[2].timestamp_start, 3.0);
    }

    #[test]
    fn test_rotation_on_parameter_change() {
        let dir = TempDir::new().unwrap();
        let stem = dir.path().join("scan");
        let file = RawDataFile::open(&stem, OpenMode::Write, &["PlsrDAC", "step"], SinkOptions::default()).unwrap();
        let policy = RotatePolicy::OnChange(vec!["PlsrDAC".to_string()]);

        for i in 0..6 {
            let dac = if i < 4 { 100 } else { 200 };
            file.append(&chunk(vec![i; 4], i as f64), &params(&[("PlsrDAC", dac), ("step", i as i64)]), &policy, true)
                .unwrap();
        }
        file.close().unwrap();

        let names = file.filenames();
        assert_eq!(names.len(), 2);
        assert_eq!(names[1], dir.path().join("scan_PlsrDAC_200"));
        let rows: usize = names.iter().map(|n| RawDataReader::open(n).unwrap().meta.len()).sum();
        assert_eq!(rows, 6);
        let second = RawDataReader::open(&names[1]).unwrap();
        assert_eq!(second.meta[0].index_start, 0);
        assert_eq!(second.parameter(0, "step"), Some(4));
    }

    #[test]
    fn test_unknown_scan_parameter() {
        let dir = TempDir::new().unwrap();
        let file = RawDataFile::open(dir.path().join("run"), OpenMode::Write, &["PlsrDAC"], SinkOptions::default()).unwrap();
        let result = file.append(&chunk(vec![1], 0.0), &params(&[("Vthin", 5)]), &RotatePolicy::Never, false);
        assert!(matches!(result, Err(SinkError::UnknownScanParameter(name)) if name == "Vthin"));
        file.close().unwrap();
        assert!(RawDataReader::open(dir.path().join("run")).unwrap().meta.is_empty());
    }

    #[test]
    fn test_append_mode_reuses_store() {
        let dir = TempDir::new().unwrap();
        let stem = dir.path().join("run");
        {
            let file = RawDataFile::open(&stem, OpenMode::Write, &[], SinkOptions::default()).unwrap();
            file.append(&chunk(vec![1, 2], 0.0), &BTreeMap::new(), &RotatePolicy::Never, false).unwrap();
        }
        {
            let file = RawDataFile::open(&stem, OpenMode::Append, &[], SinkOptions::default()).unwrap();
            file.append(&chunk(vec![3, 4, 5], 1.0), &BTreeMap::new(), &RotatePolicy::Never, false).unwrap();
        }
        let reader = RawDataReader::open(&stem).unwrap();
        assert_eq!(reader.words, vec![1, 2, 3, 4, 5]);
        assert_eq!(reader.meta[1].index_start, 2);
        assert_eq!(reader.meta[1].index_stop, 5);

        let mismatch = RawDataFile::open(&stem, OpenMode::Append, &["PlsrDAC"], SinkOptions::default());
        assert!(matches!(mismatch, Err(SinkError::ParameterMismatch { .. })));
    }

    #[test]
    fn test_groups_copied_on_rotation() {
        let dir = TempDir::new().unwrap();
        let stem = dir.path().join("run");
        let file = RawDataFile::open(&stem, OpenMode::Write, &["mask_step"], SinkOptions::default()).unwrap();
        file.set_group("run_conf", serde_json::json!({"mask_steps": 3})).unwrap();
        file.append(&chunk(vec![1], 0.0), &params(&[("mask_step", 0)]), &RotatePolicy::AnyChange, false).unwrap();
        file.append(&chunk(vec![2], 1.0), &params(&[("mask_step", 1)]), &RotatePolicy::AnyChange, false).unwrap();
        file.close().unwrap();

        let rotated = RawDataReader::open(dir.path().join("run_mask_step_1")).unwrap();
        assert_eq!(rotated.header.groups["run_conf"]["mask_steps"], 3);
        assert_eq!(rotated.words, vec![2]);
    }

    #[test]
    fn test_revisited_parameter_value_continues_store() {
        let dir = TempDir::new().unwrap();
        let stem = dir.path().join("scan");
        let file = RawDataFile::open(&stem, OpenMode::Write, &["PlsrDAC"], SinkOptions::default()).unwrap();

        let sweep = [100, 200, 100, 200, 100];
        for (i, &dac) in sweep.iter().enumerate() {
            file.append(&chunk(vec![dac as u32; 2], i as f64), &params(&[("PlsrDAC", dac)]), &RotatePolicy::AnyChange, false)
                .unwrap();
        }
        file.close().unwrap();

        let names = file.filenames();
        assert_eq!(
            names,
            vec![stem.clone(), dir.path().join("scan_PlsrDAC_200"), dir.path().join("scan_PlsrDAC_100")]
        );
        let rows: usize = names.iter().map(|n| RawDataReader::open(n).unwrap().meta.len()).sum();
        assert_eq!(rows, sweep.len());

        let revisited = RawDataReader::open(dir.path().join("scan_PlsrDAC_100")).unwrap();
        assert_eq!(revisited.meta.len(), 2);
        assert_eq!(revisited.meta[1].index_start, 2);
        assert_eq!(revisited.parameter(1, "PlsrDAC"), Some(100));
        assert_eq!(RawDataReader::open(dir.path().join("scan_PlsrDAC_200")).unwrap().words, vec![200; 4]);
    }

    #[test]
    fn test_append_session_continues_existing_continuation() {
        let dir = TempDir::new().unwrap();
        let stem = dir.path().join("run");
        let options = SinkOptions {
            max_rows: 10,
            ..SinkOptions::default()
        };
        {
            let file = RawDataFile::open(&stem, OpenMode::Write, &[], options.clone()).unwrap();
            for i in 0..3 {
                file.append(&chunk(vec![i; 4], i as f64), &BTreeMap::new(), &RotatePolicy::Never, false).unwrap();
            }
        }
        {
            let file = RawDataFile::open(&stem, OpenMode::Append, &[], options).unwrap();
            for i in 3..5 {
                file.append(&chunk(vec![i; 4], i as f64), &BTreeMap::new(), &RotatePolicy::Never, false).unwrap();
            }
            file.close().unwrap();
            assert_eq!(
                file.filenames(),
                vec![stem.clone(), dir.path().join("run_1"), dir.path().join("run_2")]
            );
        }

        assert_eq!(RawDataReader::open(&stem).unwrap().words.len(), 8);
        let continued = RawDataReader::open(dir.path().join("run_1")).unwrap();
        assert_eq!(continued.words, vec![2, 2, 2, 2, 3, 3, 3, 3]);
        assert_eq!(continued.meta.len(), 2);
        let rows = continued.meta.len() + RawDataReader::open(&stem).unwrap().meta.len();
        assert_eq!(rows, 4);
        // the fifth chunk did not fit into run_1 either
        assert_eq!(RawDataReader::open(dir.path().join("run_2")).unwrap().words, vec![4; 4]);
    }

    #[test]
    fn test_continuation_at_row_ceiling() {
        let dir = TempDir::new().unwrap();
        let stem = dir.path().join("run");
        let options = SinkOptions {
            max_rows: 10,
            ..SinkOptions::default()
        };
        let file = RawDataFile::open(&stem, OpenMode::Write, &[], options).unwrap();
        for i in 0..3 {
            file.append(&chunk(vec![i; 4], i as f64), &BTreeMap::new(), &RotatePolicy::Never, false).unwrap();
        }
        file.close().unwrap();

        assert_eq!(file.filenames(), vec![stem.clone(), dir.path().join("run_1")]);
        assert_eq!(RawDataReader::open(&stem).unwrap().words.len(), 8);
        assert_eq!(RawDataReader::open(dir.path().join("run_1")).unwrap().words, vec![2; 4]);
        let closed = file.append(&chunk(vec![9], 9.0), &BTreeMap::new(), &RotatePolicy::Never, false);
        assert!(matches!(closed, Err(SinkError::Closed)));
    }
}
