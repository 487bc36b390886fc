use crate::config::Config;
use crate::record::NewRecord;
use crate::store::RecordStore;
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use serialport::{DataBits, Parity, SerialPort, StopBits};
use std::io::{self, Read};
use std::time::Duration;
use tokio::sync::mpsc;

const FRAME_QUEUE: usize = 256;
const STANDARD_BAUD_RATES: &[u32] = &[
    50, 75, 110, 134, 150, 200, 300, 600, 1200, 1800, 2400, 4800, 9600, 19200, 38400, 57600,
    115200, 230400,
];

/// One unit of output from the frame reader.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// Bytes up to (not including) the delimiter, or a partial line cut by a read timeout.
    Line(Vec<u8>),
    /// A read timeout with nothing buffered.
    Idle,
    /// The source is exhausted.
    Eof,
}

/// A frame stamped with the wall-clock second it was completed.
#[derive(Debug)]
pub struct TimedFrame {
    pub timestamp: i64,
    pub bytes: Vec<u8>,
}

/// Splits a byte stream into delimiter-terminated frames.
pub struct FrameReader<R> {
    source: R,
    delimiter: u8,
    buffer: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(source: R, delimiter: u8) -> Self {
        Self {
            source,
            delimiter,
            buffer: Vec::new(),
        }
    }

    pub fn next_frame(&mut self) -> io::Result<Frame> {
        let mut byte = [0u8; 1];
        loop {
            match self.source.read(&mut byte) {
                Ok(0) => {
                    if self.buffer.is_empty() {
                        return Ok(Frame::Eof);
                    }
                    return Ok(Frame::Line(std::mem::take(&mut self.buffer)));
                }
                Ok(_) => {
                    if byte[0] == self.delimiter {
                        return Ok(Frame::Line(std::mem::take(&mut self.buffer)));
                    }
                    self.buffer.push(byte[0]);
                }
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                    if self.buffer.is_empty() {
                        return Ok(Frame::Idle);
                    }
                    return Ok(Frame::Line(std::mem::take(&mut self.buffer)));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

pub fn is_standard_baud_rate(baud_rate: u32) -> bool {
    STANDARD_BAUD_RATES.contains(&baud_rate)
}

pub fn open_port(
    port_name: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<Box<dyn SerialPort>> {
    tracing::info!(port = %port_name, baud_rate, "opening serial port");
    if !is_standard_baud_rate(baud_rate) {
        tracing::warn!(baud_rate, "baud rate is nonstandard; this may cause issues");
    }
    let port = serialport::new(port_name, baud_rate)
        .data_bits(DataBits::Eight)
        .stop_bits(StopBits::One)
        .parity(Parity::None)
        .timeout(timeout)
        .open()
        .with_context(|| format!("failed to open serial port {port_name}"))?;
    tracing::info!(port = %port_name, "serial port open");
    Ok(port)
}

/// Reads frames on a dedicated thread and forwards completed lines to `tx`.
/// The thread ends when the source hits EOF, errors, or the receiver goes away.
pub fn spawn_frame_thread<R>(
    source: R,
    delimiter: u8,
    tx: mpsc::Sender<io::Result<TimedFrame>>,
) -> Result<std::thread::JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    std::thread::Builder::new()
        .name("serial-reader".to_string())
        .spawn(move || {
            let mut reader = FrameReader::new(source, delimiter);
            loop {
                let frame = match reader.next_frame() {
                    Ok(Frame::Line(bytes)) => TimedFrame {
                        timestamp: Utc::now().timestamp(),
                        bytes,
                    },
                    Ok(Frame::Idle) => {
                        if tx.is_closed() {
                            break;
                        }
                        continue;
                    }
                    Ok(Frame::Eof) => break,
                    Err(err) => {
                        let _ = tx.blocking_send(Err(err));
                        break;
                    }
                };
                if tx.blocking_send(Ok(frame)).is_err() {
                    break;
                }
            }
            tracing::debug!("serial reader thread exiting");
        })
        .context("failed to spawn serial reader thread")
}

/// Opens the configured port and inserts every frame until a fatal error.
pub async fn run_reader(config: Config, store: RecordStore) -> Result<()> {
    let port = open_port(
        &config.serial_port,
        config.baud_rate,
        config.serial_read_timeout,
    )?;
    tracing::info!(
        delimiter = ?char::from(config.delimiter),
        "starting serial read loop"
    );
    ingest(
        port,
        config.delimiter,
        &config.serial_port,
        config.stall_timeout,
        store,
    )
    .await
}

/// Feeds frames from `source` into the store. Fails if no frame arrives within
/// `stall_timeout`, if the source errors, or if it reaches EOF.
pub async fn ingest<R>(
    source: R,
    delimiter: u8,
    port_name: &str,
    stall_timeout: Duration,
    store: RecordStore,
) -> Result<()>
where
    R: Read + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(FRAME_QUEUE);
    let _thread = spawn_frame_thread(source, delimiter, tx)?;

    loop {
        let next = match tokio::time::timeout(stall_timeout, rx.recv()).await {
            Ok(next) => next,
            Err(_) => bail!(
                "no serial data for {}s; shutting reader down",
                stall_timeout.as_secs()
            ),
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => return Err(anyhow!(err).context("serial read failed")),
            None => bail!("serial source closed"),
        };

        let record = NewRecord::from_frame(frame.timestamp, &frame.bytes, port_name);
        tracing::info!(payload = %record.payload, "record payload");
        let id = store.insert(&record).await?;
        tracing::debug!(id, timestamp = record.timestamp, "inserted record");
    }
}
