use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::observability;

/// Frames larger than this are treated as a corrupt length prefix.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Length prefix plus CRC.
const FRAME_OVERHEAD: u64 = 8;

/// Encode a single record to [len][bincode][crc32] format.
fn encode_record<E: Serialize>(writer: &mut impl Write, record: &E) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "record too large"));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Fill `buf` completely. `Ok(false)` on a short read at end of file.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next checksummed payload, or `None` where the valid prefix of the log ends.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut word = [0u8; 4];
    if !fill(reader, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !fill(reader, &mut payload)? || !fill(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

fn open_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

/// Append-only log of `E` records, one `[u32 len][bincode][u32 crc32]` frame
/// each. A torn or corrupt tail is dropped on replay.
///
/// The booking engine logs `model::Event`; the submission queue logs `queue::QueueEvent`.
pub struct Wal<E> {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    _record: PhantomData<fn(E)>,
}

impl<E: Serialize + DeserializeOwned> Wal<E> {
    /// Open for appending without reading the log. Only safe on a file that
    /// is known to end on a frame boundary; use `recover` after a restart.
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: open_append(path)?,
            path: path.to_path_buf(),
            appends_since_compact: 0,
            _record: PhantomData,
        })
    }

    /// Replay the log, cut off anything after the last valid frame and open
    /// it for appending. New records land directly after the replayed ones.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<E>)> {
        let (records, valid_len) = Self::scan(path)?;
        match OpenOptions::new().write(true).open(path) {
            Ok(file) => {
                let len = file.metadata()?.len();
                if len > valid_len {
                    tracing::warn!(
                        "{}: discarding {} bytes of torn or corrupt tail",
                        path.display(),
                        len - valid_len
                    );
                    file.set_len(valid_len)?;
                    file.sync_all()?;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok((Self::open(path)?, records))
    }

    /// Append one record and fsync.
    pub fn append(&mut self, record: &E) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Buffer a record. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, record: &E) -> io::Result<()> {
        encode_record(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write `records` to a side file and fsync it.
    fn write_compact_file(path: &Path, records: &[E]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the side file over the log and reopen.
    fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        self.writer = open_append(&self.path)?;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Rewrite the log as exactly `records`.
    pub fn compact(&mut self, records: &[E]) -> io::Result<()> {
        Self::write_compact_file(&self.path, records)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every record up to the first torn, corrupt or undecodable frame. A
    /// missing file replays as empty.
    pub fn replay(path: &Path) -> io::Result<Vec<E>> {
        Self::scan(path).map(|(records, _)| records)
    }

    /// Records of the valid prefix and its length in bytes.
    fn scan(path: &Path) -> io::Result<(Vec<E>, u64)> {
        let mut reader = match File::open(path) {
            Ok(f) => BufReader::new(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut records = Vec::new();
        let mut valid_len = 0u64;
        while let Some(payload) = read_frame(&mut reader)? {
            match bincode::deserialize::<E>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
            valid_len += FRAME_OVERHEAD + payload.len() as u64;
        }
        Ok((records, valid_len))
    }
}

// ── Group-commit writer ──────────────────────────────────

enum WriterCommand<E> {
    Append {
        record: E,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<E>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend<E> = (E, oneshot::Sender<io::Result<()>>);

/// Handle to a task that owns a `Wal`. Appends that queue up while a flush
/// is in progress share the next fsync.
pub struct WalWriter<E> {
    tx: mpsc::Sender<WriterCommand<E>>,
}

impl<E: Serialize + DeserializeOwned + Send + 'static> WalWriter<E> {
    /// Spawn the writer task. `log` labels its flush metrics.
    pub fn spawn(wal: Wal<E>, log: &'static str) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(writer_loop(wal, rx, log));
        Self { tx }
    }

    async fn request<T>(
        &self,
        cmd: WriterCommand<E>,
        response: oneshot::Receiver<T>,
    ) -> io::Result<T> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| io::Error::other("WAL writer shut down"))?;
        response
            .await
            .map_err(|_| io::Error::other("WAL writer dropped response"))
    }

    /// Returns once the record is durable.
    pub async fn append(&self, record: E) -> io::Result<()> {
        let (response, rx) = oneshot::channel();
        self.request(WriterCommand::Append { record, response }, rx)
            .await?
    }

    /// Rewrite the log as exactly `records`. Appends sent earlier are
    /// flushed first and then replaced.
    pub async fn compact(&self, records: Vec<E>) -> io::Result<()> {
        let (response, rx) = oneshot::channel();
        self.request(WriterCommand::Compact { records, response }, rx)
            .await?
    }

    pub async fn appends_since_compact(&self) -> io::Result<u64> {
        let (response, rx) = oneshot::channel();
        self.request(WriterCommand::AppendsSinceCompact { response }, rx)
            .await
    }
}

/// Pull every append already waiting behind `first`. Stops at the first
/// other command and hands it back so it runs after the batch.
fn collect_batch<E>(
    first: PendingAppend<E>,
    rx: &mut mpsc::Receiver<WriterCommand<E>>,
) -> (Vec<PendingAppend<E>>, Option<WriterCommand<E>>) {
    let mut batch = vec![first];
    while let Ok(cmd) = rx.try_recv() {
        match cmd {
            WriterCommand::Append { record, response } => batch.push((record, response)),
            other => return (batch, Some(other)),
        }
    }
    (batch, None)
}

async fn writer_loop<E: Serialize + DeserializeOwned>(
    mut wal: Wal<E>,
    mut rx: mpsc::Receiver<WriterCommand<E>>,
    log: &'static str,
) {
    while let Some(cmd) = rx.recv().await {
        let first = match cmd {
            WriterCommand::Append { record, response } => (record, response),
            other => {
                handle_other(&mut wal, other);
                continue;
            }
        };
        let (mut batch, deferred) = collect_batch(first, &mut rx);
        commit_batch(&mut wal, &mut batch, log);
        if let Some(cmd) = deferred {
            handle_other(&mut wal, cmd);
        }
    }
    tracing::debug!("{log} WAL writer stopped");
}

fn commit_batch<E: Serialize + DeserializeOwned>(
    wal: &mut Wal<E>,
    batch: &mut Vec<PendingAppend<E>>,
    log: &'static str,
) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE, "log" => log)
        .record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS, "log" => log)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("{log} WAL flush failed for {} records: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch<E: Serialize + DeserializeOwned>(
    wal: &mut Wal<E>,
    batch: &[PendingAppend<E>],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (record, _) in batch {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes don't join the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_other<E: Serialize + DeserializeOwned>(wal: &mut Wal<E>, cmd: WriterCommand<E>) {
    match cmd {
        WriterCommand::Compact { records, response } => {
            let _ = response.send(wal.compact(&records));
        }
        WriterCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WriterCommand::Append { record, response } => {
            let _ = response.send(wal.append(&record));
        }
    }
}
