//! Columnar archive backend: one or more parquet files per cluster, each row
//! a full job with the meta blob as JSON and the metric blob gzip-compressed.
//!
//! Layout:
//! ```text
//! <root>/<cluster>/cc-archive-YYYY-MM-DD-NNN.parquet
//! <root>/<cluster>/cluster.json
//! <root>/version.txt
//! ```

use async_trait::async_trait;
use chrono::Utc;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use parquet::data_type::{ByteArray, ByteArrayType, Int64Type};
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::file::writer::SerializedFileWriter;
use parquet::record::RowAccessor;
use parquet::schema::parser::parse_message_type;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::models::{Cluster, JobData, JobMeta};

use super::s3::ObjectStore;
use super::{ARCHIVE_VERSION, ArchiveKey, ArchiveStore};

/// Rows buffered before a row group is flushed.
const ROW_GROUP_SIZE: usize = 64;

const SCHEMA: &str = "
    message job {
        required int64 dbid;
        required binary cluster (UTF8);
        required int64 start_time;
        required binary meta (UTF8);
        required binary data;
    }
";

/// One job as a parquet row.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub dbid: i64,
    pub cluster: String,
    pub start_time: i64,
    pub meta_json: String,
    pub data_gz: Vec<u8>,
}

impl JobRow {
    fn approx_bytes(&self) -> u64 {
        (8 + 8 + self.cluster.len() + self.meta_json.len() + self.data_gz.len()) as u64
    }
}

/// Serialize a job into its row form; the metric blob is gzip-compressed.
pub fn job_to_row(meta: &JobMeta, data: &JobData) -> AppResult<JobRow> {
    let key = ArchiveKey::from_meta(meta)?;
    let meta_json = serde_json::to_string(meta)
        .map_err(|e| AppError::Archive(format!("Cannot serialize job meta: {}", e)))?;
    let data_json = serde_json::to_vec(data)
        .map_err(|e| AppError::Archive(format!("Cannot serialize job data: {}", e)))?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&data_json)
        .and_then(|_| encoder.finish())
        .map(|data_gz| JobRow {
            dbid: key.dbid,
            cluster: key.cluster,
            start_time: key.start_time,
            meta_json,
            data_gz,
        })
        .map_err(|e| AppError::Archive(format!("Cannot compress job data: {}", e)))
}

/// Decode a row back into meta and data blobs.
pub fn row_to_job(row: &JobRow) -> AppResult<(JobMeta, JobData)> {
    let meta: JobMeta = serde_json::from_str(&row.meta_json)
        .map_err(|e| AppError::Archive(format!("Corrupt meta blob for {}: {}", row.dbid, e)))?;

    let mut decoder = GzDecoder::new(&row.data_gz[..]);
    let mut data_json = Vec::new();
    decoder
        .read_to_end(&mut data_json)
        .map_err(|e| AppError::Archive(format!("Corrupt data blob for {}: {}", row.dbid, e)))?;
    let data: JobData = serde_json::from_slice(&data_json)
        .map_err(|e| AppError::Archive(format!("Corrupt data blob for {}: {}", row.dbid, e)))?;

    Ok((meta, data))
}

/// Open writer state for one cluster. Single-writer invariant: this lives
/// behind the archive-wide mutex.
struct ClusterWriter {
    path: PathBuf,
    writer: Option<SerializedFileWriter<File>>,
    buffered: Vec<JobRow>,
    bytes_written: u64,
    seq: u32,
}

pub struct ParquetArchive {
    root: PathBuf,
    max_file_bytes: u64,
    object_store: Option<ObjectStore>,
    writers: Mutex<HashMap<String, ClusterWriter>>,
}

impl ParquetArchive {
    pub fn new(
        root: PathBuf,
        max_file_bytes: u64,
        object_store: Option<ObjectStore>,
    ) -> AppResult<Self> {
        Ok(Self {
            root,
            max_file_bytes,
            object_store,
            writers: Mutex::new(HashMap::new()),
        })
    }

    fn cluster_dir(&self, cluster: &str) -> PathBuf {
        self.root.join(cluster)
    }

    fn archive_files(&self, cluster: &str) -> AppResult<Vec<PathBuf>> {
        let dir = self.cluster_dir(cluster);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension().and_then(|e| e.to_str()) == Some("parquet")
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("cc-archive-"))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Next sequence number for today's file in this cluster directory.
    fn next_seq(&self, cluster: &str, date: &str) -> AppResult<u32> {
        let prefix = format!("cc-archive-{}-", date);
        let mut seq = 0;
        for path in self.archive_files(cluster)? {
            if let Some(name) = path.file_stem().and_then(|n| n.to_str()) {
                if let Some(n) = name.strip_prefix(&prefix).and_then(|s| s.parse::<u32>().ok()) {
                    seq = seq.max(n + 1);
                }
            }
        }
        Ok(seq)
    }

    fn open_writer(&self, cluster: &str, seq: u32) -> AppResult<(PathBuf, SerializedFileWriter<File>)> {
        let dir = self.cluster_dir(cluster);
        std::fs::create_dir_all(&dir)?;

        let date = Utc::now().format("%Y-%m-%d").to_string();
        let path = dir.join(format!("cc-archive-{}-{:03}.parquet", date, seq));

        let schema = Arc::new(
            parse_message_type(SCHEMA)
                .map_err(|e| AppError::Archive(format!("Bad parquet schema: {}", e)))?,
        );
        let props = Arc::new(WriterProperties::builder().build());
        let file = File::create(&path)?;
        let writer = SerializedFileWriter::new(file, schema, props)
            .map_err(|e| AppError::Archive(format!("Cannot open parquet writer: {}", e)))?;

        Ok((path, writer))
    }

    /// Flush buffered rows as one row group.
    fn flush_row_group(state: &mut ClusterWriter) -> AppResult<()> {
        if state.buffered.is_empty() {
            return Ok(());
        }
        let writer = state
            .writer
            .as_mut()
            .ok_or_else(|| AppError::Archive("parquet writer already sealed".to_string()))?;

        let rows = &state.buffered;
        let dbids: Vec<i64> = rows.iter().map(|r| r.dbid).collect();
        let clusters: Vec<ByteArray> = rows
            .iter()
            .map(|r| ByteArray::from(r.cluster.as_bytes().to_vec()))
            .collect();
        let start_times: Vec<i64> = rows.iter().map(|r| r.start_time).collect();
        let metas: Vec<ByteArray> = rows
            .iter()
            .map(|r| ByteArray::from(r.meta_json.as_bytes().to_vec()))
            .collect();
        let datas: Vec<ByteArray> = rows
            .iter()
            .map(|r| ByteArray::from(r.data_gz.clone()))
            .collect();

        let mut row_group = writer
            .next_row_group()
            .map_err(|e| AppError::Archive(format!("parquet row group: {}", e)))?;

        macro_rules! write_column {
            ($type:ty, $values:expr) => {{
                let mut col = row_group
                    .next_column()
                    .map_err(|e| AppError::Archive(format!("parquet column: {}", e)))?
                    .ok_or_else(|| AppError::Archive("parquet schema exhausted".to_string()))?;
                col.typed::<$type>()
                    .write_batch($values, None, None)
                    .map_err(|e| AppError::Archive(format!("parquet write: {}", e)))?;
                col.close()
                    .map_err(|e| AppError::Archive(format!("parquet column close: {}", e)))?;
            }};
        }

        write_column!(Int64Type, &dbids);
        write_column!(ByteArrayType, &clusters);
        write_column!(Int64Type, &start_times);
        write_column!(ByteArrayType, &metas);
        write_column!(ByteArrayType, &datas);

        row_group
            .close()
            .map_err(|e| AppError::Archive(format!("parquet row group close: {}", e)))?;

        state.bytes_written += state.buffered.iter().map(JobRow::approx_bytes).sum::<u64>();
        state.buffered.clear();
        Ok(())
    }

    /// Close the current file (writes the footer) and upload it when an
    /// object-store target is configured.
    fn seal(&self, cluster: &str, state: &mut ClusterWriter) -> AppResult<Option<(String, PathBuf)>> {
        Self::flush_row_group(state)?;
        if let Some(writer) = state.writer.take() {
            writer
                .close()
                .map_err(|e| AppError::Archive(format!("parquet close: {}", e)))?;
            info!(
                "Sealed parquet archive file {} ({} bytes)",
                state.path.display(),
                state.bytes_written
            );
            let filename = state
                .path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            return Ok(Some((
                ObjectStore::archive_key(cluster, &filename),
                state.path.clone(),
            )));
        }
        Ok(None)
    }

    fn read_rows(path: &Path) -> AppResult<Vec<JobRow>> {
        let file = File::open(path)?;
        let reader = SerializedFileReader::new(file)
            .map_err(|e| AppError::Archive(format!("Cannot open {}: {}", path.display(), e)))?;

        let mut rows = Vec::new();
        let iter = reader
            .get_row_iter(None)
            .map_err(|e| AppError::Archive(format!("Cannot read {}: {}", path.display(), e)))?;
        for row in iter {
            let row = row.map_err(|e| {
                AppError::Archive(format!("Corrupt row in {}: {}", path.display(), e))
            })?;
            let get = |e: parquet::errors::ParquetError| {
                AppError::Archive(format!("Corrupt row in {}: {}", path.display(), e))
            };
            rows.push(JobRow {
                dbid: row.get_long(0).map_err(get)?,
                cluster: row.get_string(1).map_err(get)?.clone(),
                start_time: row.get_long(2).map_err(get)?,
                meta_json: row.get_string(3).map_err(get)?.clone(),
                data_gz: row.get_bytes(4).map_err(get)?.data().to_vec(),
            });
        }
        Ok(rows)
    }

    /// Find one job's row: buffered rows first, then sealed and open files.
    /// Later writes win, so retries overwrite earlier attempts.
    fn find_row(&self, key: &ArchiveKey) -> AppResult<Option<JobRow>> {
        {
            let writers = self.writers.lock().expect("parquet writer mutex poisoned");
            if let Some(state) = writers.get(&key.cluster) {
                if let Some(row) = state
                    .buffered
                    .iter()
                    .rev()
                    .find(|r| r.dbid == key.dbid)
                {
                    return Ok(Some(row.clone()));
                }
            }
        }

        let mut found = None;
        for path in self.archive_files(&key.cluster)? {
            // Open (unsealed) files lack a footer and cannot be read yet.
            let Ok(rows) = Self::read_rows(&path) else {
                continue;
            };
            for row in rows {
                if row.dbid == key.dbid {
                    found = Some(row);
                }
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl ArchiveStore for ParquetArchive {
    async fn init(&self, force: bool) -> AppResult<()> {
        std::fs::create_dir_all(&self.root)?;
        let version_file = self.root.join("version.txt");
        match std::fs::read_to_string(&version_file) {
            Ok(raw) => {
                let found: u32 = raw.trim().parse().map_err(|_| {
                    AppError::Archive(format!("Unreadable version marker '{}'", raw.trim()))
                })?;
                if found != ARCHIVE_VERSION && !force {
                    return Err(AppError::Archive(format!(
                        "archive version {} does not match expected {}",
                        found, ARCHIVE_VERSION
                    )));
                }
                Ok(())
            }
            Err(_) => {
                std::fs::write(&version_file, format!("{}\n", ARCHIVE_VERSION))?;
                Ok(())
            }
        }
    }

    async fn clusters(&self) -> AppResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.path().is_dir() && entry.path().join("cluster.json").is_file() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn load_cluster_cfg(&self, cluster: &str) -> AppResult<Cluster> {
        let path = self.cluster_dir(cluster).join("cluster.json");
        let raw = std::fs::read(&path)
            .map_err(|e| AppError::Archive(format!("Cannot read {}: {}", path.display(), e)))?;
        serde_json::from_slice(&raw)
            .map_err(|e| AppError::Archive(format!("Corrupt {}: {}", path.display(), e)))
    }

    async fn has(&self, key: &ArchiveKey) -> bool {
        matches!(self.find_row(key), Ok(Some(_)))
    }

    async fn load_meta(&self, key: &ArchiveKey) -> AppResult<JobMeta> {
        let row = self
            .find_row(key)?
            .ok_or_else(|| AppError::NotFound(format!("Archived job {}", key.dbid)))?;
        Ok(row_to_job(&row)?.0)
    }

    async fn load_data(&self, key: &ArchiveKey) -> AppResult<JobData> {
        let row = self
            .find_row(key)?
            .ok_or_else(|| AppError::NotFound(format!("Archived job {}", key.dbid)))?;
        Ok(row_to_job(&row)?.1)
    }

    async fn import_job(&self, meta: &JobMeta, data: &JobData) -> AppResult<()> {
        let row = job_to_row(meta, data)?;
        let cluster = row.cluster.clone();

        let upload = {
            let mut writers = self.writers.lock().expect("parquet writer mutex poisoned");
            if !writers.contains_key(&cluster) {
                let date = Utc::now().format("%Y-%m-%d").to_string();
                let seq = self.next_seq(&cluster, &date)?;
                let (path, writer) = self.open_writer(&cluster, seq)?;
                writers.insert(
                    cluster.clone(),
                    ClusterWriter {
                        path,
                        writer: Some(writer),
                        buffered: Vec::new(),
                        bytes_written: 0,
                        seq,
                    },
                );
            }
            let state = writers
                .get_mut(&cluster)
                .expect("writer state inserted above");

            state.buffered.push(row);
            if state.buffered.len() >= ROW_GROUP_SIZE {
                Self::flush_row_group(state)?;
            }

            if state.bytes_written >= self.max_file_bytes {
                let upload = self.seal(&cluster, state)?;
                let seq = state.seq + 1;
                let (path, writer) = self.open_writer(&cluster, seq)?;
                state.path = path;
                state.writer = Some(writer);
                state.bytes_written = 0;
                state.seq = seq;
                upload
            } else {
                None
            }
        };

        if let Some((key, path)) = upload {
            if let Some(store) = &self.object_store {
                let bytes = tokio::fs::read(&path).await?;
                store.put(&key, bytes).await?;
            }
        }

        Ok(())
    }

    async fn iter_meta(&self) -> AppResult<Vec<JobMeta>> {
        let mut metas = Vec::new();
        for cluster in self.clusters().await? {
            for path in self.archive_files(&cluster)? {
                let Ok(rows) = Self::read_rows(&path) else {
                    continue;
                };
                for row in rows {
                    metas.push(row_to_job(&row)?.0);
                }
            }
        }

        let writers = self.writers.lock().expect("parquet writer mutex poisoned");
        for state in writers.values() {
            for row in &state.buffered {
                metas.push(row_to_job(row)?.0);
            }
        }

        Ok(metas)
    }

    async fn delete_job(&self, key: &ArchiveKey) -> AppResult<()> {
        let mut writers = self.writers.lock().expect("parquet writer mutex poisoned");
        if let Some(state) = writers.get_mut(&key.cluster) {
            state.buffered.retain(|r| r.dbid != key.dbid);
        }
        // Rows already flushed stay in their file; sealed files are immutable.
        warn!(
            "delete of job {} only affects unflushed rows in the columnar backend",
            key.dbid
        );
        Ok(())
    }

    async fn flush(&self) -> AppResult<()> {
        let uploads = {
            let mut writers = self.writers.lock().expect("parquet writer mutex poisoned");
            let mut uploads = Vec::new();
            for (cluster, state) in writers.iter_mut() {
                if let Some(upload) = self.seal(cluster, state)? {
                    uploads.push(upload);
                }
            }
            writers.clear();
            uploads
        };

        if let Some(store) = &self.object_store {
            for (key, path) in uploads {
                let bytes = tokio::fs::read(&path).await?;
                store.put(&key, bytes).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Float, JobMetric, JobState, MetricScope, MonitoringStatus, Resource, Series,
        SeriesStatistics, Unit,
    };

    fn sample_meta(dbid: i64) -> JobMeta {
        JobMeta {
            id: Some(dbid),
            job_id: 900 + dbid,
            cluster: "testcluster".to_string(),
            sub_cluster: Some("main".to_string()),
            partition: None,
            project: Some("proj".to_string()),
            user: "testuser".to_string(),
            array_job_id: None,
            num_nodes: 1,
            num_hwthreads: 8,
            num_acc: 0,
            exclusive: 1,
            smt: 1,
            walltime: 0,
            job_state: JobState::Completed,
            monitoring_status: MonitoringStatus::ArchivingSuccessful,
            start_time: 1000 + dbid,
            duration: 60,
            resources: vec![Resource {
                hostname: "testhost".to_string(),
                hwthreads: None,
                accelerators: None,
                configuration: None,
            }],
            meta_data: None,
            tags: None,
            statistics: HashMap::new(),
            footprint: HashMap::new(),
            energy_footprint: HashMap::new(),
            energy: 0.0,
        }
    }

    fn sample_data() -> JobData {
        let mut data: JobData = HashMap::new();
        data.entry("load_one".to_string()).or_default().insert(
            MetricScope::Node,
            JobMetric {
                unit: Unit {
                    base: String::new(),
                    prefix: None,
                },
                timestep: 60,
                series: vec![Series {
                    hostname: "testhost".to_string(),
                    id: None,
                    statistics: SeriesStatistics {
                        avg: Float(1.0),
                        min: Float(0.5),
                        max: Float(2.0),
                    },
                    data: vec![Float(0.5), Float::NAN, Float(2.0)],
                }],
                statistics_series: None,
            },
        );
        data
    }

    #[test]
    fn test_row_roundtrip_field_for_field() {
        let meta = sample_meta(1);
        let data = sample_data();

        let row = job_to_row(&meta, &data).unwrap();
        let (meta_back, data_back) = row_to_job(&row).unwrap();

        assert_eq!(meta_back, meta);
        assert_eq!(data_back, data);
    }

    #[test]
    fn test_row_data_is_gzip() {
        let row = job_to_row(&sample_meta(1), &sample_data()).unwrap();
        // RFC 1952 magic bytes
        assert_eq!(&row.data_gz[..2], &[0x1f, 0x8b]);
    }

    #[tokio::test]
    async fn test_import_flush_reload() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("testcluster")).unwrap();
        std::fs::write(dir.path().join("testcluster/cluster.json"), "{}").unwrap();

        let archive =
            ParquetArchive::new(dir.path().to_path_buf(), 1024 * 1024, None).unwrap();
        archive.init(false).await.unwrap();

        let meta = sample_meta(5);
        let data = sample_data();
        archive.import_job(&meta, &data).await.unwrap();

        // Still buffered: visible through the buffer path.
        let key = ArchiveKey::from_meta(&meta).unwrap();
        assert!(archive.has(&key).await);
        assert_eq!(archive.load_meta(&key).await.unwrap(), meta);

        // Seal and re-open: visible through the file path.
        archive.flush().await.unwrap();
        let reopened =
            ParquetArchive::new(dir.path().to_path_buf(), 1024 * 1024, None).unwrap();
        assert!(reopened.has(&key).await);
        assert_eq!(reopened.load_data(&key).await.unwrap(), data);

        let files: Vec<_> = reopened.archive_files("testcluster").unwrap();
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("cc-archive-"));
        assert!(name.ends_with("-000.parquet"));
    }

    #[tokio::test]
    async fn test_retry_overwrites_previous_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let archive =
            ParquetArchive::new(dir.path().to_path_buf(), 1024 * 1024, None).unwrap();

        let mut meta = sample_meta(9);
        archive.import_job(&meta, &sample_data()).await.unwrap();

        meta.duration = 999;
        archive.import_job(&meta, &sample_data()).await.unwrap();

        let key = ArchiveKey::from_meta(&meta).unwrap();
        let loaded = archive.load_meta(&key).await.unwrap();
        assert_eq!(loaded.duration, 999);
    }
}
