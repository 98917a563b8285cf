//! Concurrent Stream Writer
//!
//! `Writer` turns an unbounded byte stream into a framed MinLZ stream:
//! input is partitioned into fixed-size blocks, each block is compressed
//! independently on a worker pool, and finished chunks are emitted strictly
//! in submission order.
//!
//! ## Pipeline
//!
//! ```text
//! caller ──► frontend ──► ordering queue (slots, FIFO) ──► dispatcher ──► sink
//!               │                                              ▲
//!               └──► job queue ──► encode workers ─────────────┘
//!                                   (one slot per block)
//! ```
//!
//! Submission order is the ordering contract: the frontend pushes a block's
//! completion slot onto the bounded ordering queue *before* the job becomes
//! visible to any worker, so queue position is the block's ticket no matter
//! how workers are scheduled. The single dispatcher drains slots in FIFO
//! order, writes each finished chunk to the sink, feeds the index, and
//! recycles scratch buffers. Both queues are bounded by the concurrency
//! level, which is the writer's only backpressure mechanism.
//!
//! With `concurrency(1)` no threads are spawned; blocks are compressed and
//! written inline on the caller thread.
//!
//! ## Errors
//!
//! The first error observed anywhere in the pipeline is latched and every
//! subsequent public call returns the same value. After an error no further
//! bytes reach the sink. `reset` clears the latch and starts a fresh stream.
//!
//! ## Example
//!
//! ```ignore
//! use minlz_stream::{Writer, WriterOptions};
//!
//! let mut out = Vec::new();
//! let mut writer = Writer::with_options(&mut out, WriterOptions::new().concurrency(4));
//! writer.write(b"hello world")?;
//! writer.close()?;
//! ```

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use rand::rngs::OsRng;
use rand::RngCore;

use minlz_core::block;
use minlz_core::crc;
use minlz_core::frame::{
    self, CHUNK_HEADER_SIZE, CHUNK_OVERHEAD, CHUNK_TYPE_COMPRESSED_DATA, CHUNK_TYPE_EOF,
    CHUNK_TYPE_PADDING, CHUNK_TYPE_UNCOMPRESSED_DATA, CHECKSUM_SIZE, MAX_USER_CHUNK_SIZE,
    MIN_USER_CHUNK,
};
use minlz_core::varint;
use minlz_core::BlockIndex;

use crate::error::{Error, Result};
use crate::options::{CompressionLevel, CustomEncoder, WriterOptions};
use crate::pool::BufferPool;

/// A finished chunk waiting for the dispatcher. `buf[..len]` is exactly what
/// goes to the sink; an empty payload is a flush barrier.
struct Completion {
    buf: Vec<u8>,
    len: usize,
    /// Uncompressed offset the chunk's data begins at, for the index.
    start_offset: u64,
    /// Present on flush barriers; the dispatcher signals it once the barrier
    /// has been reached.
    ack: Option<Sender<()>>,
}

/// One-shot channel carrying a block's completion; its position in the
/// ordering queue is the block's ticket.
type Slot = Receiver<Completion>;

/// Input handed to an encode worker.
enum BlockInput {
    /// Pool-owned copy; data sits at `buf[CHUNK_OVERHEAD..len]` so the
    /// buffer can be emitted as-is when the block is stored uncompressed.
    Pooled { buf: Vec<u8>, len: usize },
    /// Zero-copy slice of a caller-owned buffer (`encode_buffer`).
    Shared(Bytes),
}

struct Job {
    input: BlockInput,
    start_offset: u64,
    slot: Sender<Completion>,
}

/// State shared between the frontend, the workers, and the dispatcher.
struct Shared {
    error: ErrorCell,
    /// Bytes emitted to the sink; advanced by the dispatcher (or the caller
    /// thread on the synchronous path).
    compressed_written: AtomicU64,
    index: Mutex<Option<BlockIndex>>,
    pool: BufferPool,
}

/// First-error-wins latch guarding the whole pipeline.
#[derive(Default)]
struct ErrorCell(Mutex<Option<Error>>);

impl ErrorCell {
    fn get(&self) -> Option<Error> {
        self.0.lock().unwrap().clone()
    }

    /// Latch `err` if the cell is empty; returns the error that actually
    /// sticks, which every caller must surface.
    fn record(&self, err: Error) -> Error {
        let mut cell = self.0.lock().unwrap();
        match &*cell {
            Some(existing) => existing.clone(),
            None => {
                *cell = Some(err.clone());
                err
            }
        }
    }

    fn check(&self) -> Result<()> {
        match self.get() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn clear(&self) {
        *self.0.lock().unwrap() = None;
    }
}

/// Streaming MinLZ compressor over any byte sink.
///
/// Construct with [`Writer::new`] / [`Writer::with_options`], feed it via
/// [`write`](Writer::write), [`encode_buffer`](Writer::encode_buffer) or
/// [`read_from`](Writer::read_from), and call [`close`](Writer::close) to
/// seal the stream. A closed writer can be pointed at a new sink with
/// [`reset`](Writer::reset).
pub struct Writer<W: Write + Send + 'static> {
    shared: Arc<Shared>,
    sink: Option<Arc<Mutex<W>>>,

    block_size: usize,
    concurrency: usize,
    level: CompressionLevel,
    custom_encoder: Option<CustomEncoder>,
    flush_on_write: bool,
    create_index: bool,
    add_index: bool,
    padding: usize,
    padding_source: Box<dyn RngCore + Send>,
    /// False when an option failed; `reset` is then a no-op and the latched
    /// configuration error is surfaced on every call.
    params_ok: bool,

    /// Accumulates small writes until a block is full.
    ibuf: Vec<u8>,
    wrote_header: bool,
    /// Bytes handed to compression; advanced at submission time.
    uncompressed_written: u64,

    ordering_tx: Option<Sender<Slot>>,
    jobs_tx: Option<Sender<Job>>,
    dispatcher: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl<W: Write + Send + 'static> Writer<W> {
    /// Create a writer over `sink` with default options.
    pub fn new(sink: W) -> Self {
        Self::with_options(sink, WriterOptions::default())
    }

    /// Create a writer over `sink` with the given options. Configuration
    /// errors are latched and surfaced on the first call.
    pub fn with_options(sink: W, options: WriterOptions) -> Self {
        let mut writer = Self::from_options(options);
        writer.install(Some(sink));
        writer
    }

    /// Create a writer with no sink. Every operation fails with
    /// [`Error::NoSink`] until [`reset`](Writer::reset) installs one; useful
    /// for long-lived writers that are re-pointed per stream.
    pub fn detached(options: WriterOptions) -> Self {
        let mut writer = Self::from_options(options);
        writer.install(None);
        writer
    }

    fn from_options(mut options: WriterOptions) -> Self {
        let params_ok = options.error.is_none();
        let buf_len = CHUNK_OVERHEAD + block::max_encoded_len(options.block_size);
        let shared = Arc::new(Shared {
            error: ErrorCell::default(),
            compressed_written: AtomicU64::new(0),
            index: Mutex::new(
                options
                    .create_index
                    .then(|| BlockIndex::new(options.block_size)),
            ),
            pool: BufferPool::new(buf_len),
        });
        if let Some(err) = options.error.take() {
            shared.error.record(err);
        }
        Self {
            shared,
            sink: None,
            block_size: options.block_size,
            concurrency: options.concurrency,
            level: options.level,
            custom_encoder: options.custom_encoder,
            flush_on_write: options.flush_on_write,
            create_index: options.create_index,
            add_index: options.add_index,
            padding: options.padding,
            padding_source: options
                .padding_source
                .take()
                .unwrap_or_else(|| Box::new(OsRng)),
            params_ok,
            ibuf: Vec::with_capacity(options.block_size),
            wrote_header: false,
            uncompressed_written: 0,
            ordering_tx: None,
            jobs_tx: None,
            dispatcher: None,
            workers: Vec::new(),
        }
    }

    /// Discard all stream state and start writing to `sink`.
    ///
    /// Joins the previous pipeline, clears the sticky error, counters, input
    /// buffer and index, then spawns a fresh pipeline. A writer whose
    /// configuration failed stays inert.
    pub fn reset(&mut self, sink: W) {
        self.install(Some(sink));
    }

    fn install(&mut self, sink: Option<W>) {
        if !self.params_ok {
            return;
        }
        self.teardown_pipeline();
        self.shared.error.clear();
        self.ibuf.clear();
        self.wrote_header = false;
        self.uncompressed_written = 0;
        self.shared.compressed_written.store(0, Ordering::Relaxed);
        if let Some(index) = self.shared.index.lock().unwrap().as_mut() {
            index.reset(self.block_size);
        }

        let Some(sink) = sink else {
            self.sink = None;
            self.shared.error.record(Error::NoSink);
            return;
        };
        let sink = Arc::new(Mutex::new(sink));
        self.sink = Some(Arc::clone(&sink));

        if self.concurrency == 1 {
            tracing::debug!(block_size = self.block_size, "writer reset, synchronous path");
            return;
        }

        let (ordering_tx, ordering_rx) = bounded::<Slot>(self.concurrency);
        let (jobs_tx, jobs_rx) = bounded::<Job>(self.concurrency);

        // Thread spawning can fail under resource exhaustion. A failure
        // latches into the sticky cell like any other error, after joining
        // whatever part of the pipeline already started.
        let mut workers = Vec::with_capacity(self.concurrency);
        for worker_id in 0..self.concurrency {
            let shared = Arc::clone(&self.shared);
            let jobs = jobs_rx.clone();
            let level = self.level;
            let custom = self.custom_encoder.clone();
            let spawned = thread::Builder::new()
                .name(format!("minlz-encode-{worker_id}"))
                .spawn(move || {
                    for job in jobs.iter() {
                        run_encode_job(&shared, level, custom.as_ref(), job);
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    drop(jobs_tx);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    self.shared.error.record(err.into());
                    return;
                }
            }
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("minlz-dispatch".into())
            .spawn(move || run_dispatcher(shared, sink, ordering_rx));
        match spawned {
            Ok(handle) => self.dispatcher = Some(handle),
            Err(err) => {
                drop(jobs_tx);
                drop(ordering_tx);
                for handle in workers {
                    let _ = handle.join();
                }
                self.shared.error.record(err.into());
                return;
            }
        }
        self.workers = workers;
        self.ordering_tx = Some(ordering_tx);
        self.jobs_tx = Some(jobs_tx);
        tracing::debug!(
            concurrency = self.concurrency,
            block_size = self.block_size,
            "writer reset, pipeline started"
        );
    }

    /// Close the channels and join the dispatcher and workers. In-flight
    /// blocks drain first; whether they reach the sink depends on the sticky
    /// error state.
    fn teardown_pipeline(&mut self) {
        self.ordering_tx.take();
        self.jobs_tx.take();
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// Uncompressed bytes accepted and compressed bytes emitted since the
    /// last reset. Stable only after [`flush`](Writer::flush) or close.
    pub fn written(&self) -> (u64, u64) {
        (
            self.uncompressed_written,
            self.shared.compressed_written.load(Ordering::Relaxed),
        )
    }

    // ── Frontend ───────────────────────────────────────────────────────────

    /// Buffer `p`, spilling full blocks into the pipeline.
    ///
    /// With `flush_on_write`, `p` bypasses the buffer and becomes one or
    /// more blocks immediately.
    pub fn write(&mut self, p: &[u8]) -> Result<usize> {
        self.shared.error.check()?;
        if self.flush_on_write {
            return self.write_blocks(p);
        }
        let mut accepted = 0usize;
        let mut p = p;
        while p.len() > self.block_size - self.ibuf.len() && self.shared.error.get().is_none() {
            let n = if self.ibuf.is_empty() {
                // Large write into an empty buffer: skip the copy and feed
                // the pipeline straight from p.
                self.write_blocks(p).unwrap_or(0)
            } else {
                let space = self.block_size - self.ibuf.len();
                self.ibuf.extend_from_slice(&p[..space]);
                let buf = std::mem::take(&mut self.ibuf);
                let _ = self.write_blocks(&buf);
                self.ibuf = buf;
                self.ibuf.clear();
                space
            };
            accepted += n;
            p = &p[n..];
        }
        self.shared.error.check()?;
        self.ibuf.extend_from_slice(p);
        accepted += p.len();
        Ok(accepted)
    }

    /// Add a caller-owned buffer to the stream without copying.
    ///
    /// Blocks reference `buf` directly, so this is the fastest input path.
    /// The buffer is not appended to the input accumulator: every call
    /// produces discrete blocks.
    pub fn encode_buffer(&mut self, buf: Bytes) -> Result<()> {
        self.shared.error.check()?;
        if self.flush_on_write {
            return self.write_blocks(&buf).map(drop);
        }
        if !self.ibuf.is_empty() {
            self.async_flush()?;
        }
        if self.concurrency == 1 {
            return self.write_sync(&buf).map(drop);
        }
        self.queue_stream_header()?;
        let mut offset = 0;
        while offset < buf.len() {
            let end = buf.len().min(offset + self.block_size);
            let block = buf.slice(offset..end);
            self.submit_block(BlockInput::Shared(block), end - offset)?;
            offset = end;
        }
        Ok(())
    }

    /// Pull `reader` to EOF through the pipeline, reading directly into
    /// pooled block buffers. Returns the number of bytes consumed.
    pub fn read_from<R: io::Read>(&mut self, reader: &mut R) -> Result<u64> {
        self.shared.error.check()?;
        if !self.ibuf.is_empty() {
            self.async_flush()?;
        }
        let mut total = 0u64;
        loop {
            let mut inbuf = self.shared.pool.acquire();
            let n = match read_full(reader, &mut inbuf[CHUNK_OVERHEAD..CHUNK_OVERHEAD + self.block_size])
            {
                Ok(n) => n,
                Err(err) => {
                    self.shared.pool.release(inbuf);
                    return Err(self.shared.error.record(err.into()));
                }
            };
            if n == 0 {
                self.shared.pool.release(inbuf);
                break;
            }
            total += n as u64;
            let at_eof = n < self.block_size;
            self.write_full(inbuf, n)?;
            if at_eof {
                break;
            }
        }
        self.shared.error.check()?;
        Ok(total)
    }

    /// Insert a skippable user chunk with `id` in `0x80..=0xfe`.
    ///
    /// The chunk is ordered with the surrounding blocks but contributes no
    /// uncompressed bytes to the stream totals. Invalid parameters are
    /// returned directly without poisoning the writer.
    pub fn add_user_chunk(&mut self, id: u8, data: &[u8]) -> Result<()> {
        self.shared.error.check()?;
        if !(MIN_USER_CHUNK..=CHUNK_TYPE_PADDING).contains(&id) {
            return Err(Error::InvalidChunkId(id));
        }
        if data.len() > MAX_USER_CHUNK_SIZE {
            return Err(Error::UserChunkTooLarge(data.len()));
        }
        let mut header = [0u8; CHUNK_HEADER_SIZE];
        frame::put_chunk_header(&mut header, id, data.len());

        if self.concurrency == 1 {
            if !self.wrote_header {
                self.wrote_header = true;
                self.sink_write(&frame::stream_header(self.block_size), true)?;
            }
            // Mirror the dispatcher: the index points at the position right
            // before this chunk for the data written so far.
            if self.uncompressed_written > 0 {
                let pre = self.shared.compressed_written.load(Ordering::Relaxed);
                self.register_block(pre, self.uncompressed_written)?;
            }
            self.sink_write(&header, true)?;
            return self.sink_write(data, true);
        }

        self.queue_stream_header()?;
        let mut buf = self.shared.pool.acquire();
        buf.clear();
        buf.extend_from_slice(&header);
        buf.extend_from_slice(data);
        let len = buf.len();
        let slot = self.push_slot()?;
        let _ = slot.send(Completion {
            buf,
            len,
            start_offset: self.uncompressed_written,
            ack: None,
        });
        Ok(())
    }

    // ── Submission internals ───────────────────────────────────────────────

    /// Queue a completion slot, blocking while the pipeline is at capacity.
    /// The slot's queue position fixes the block's output order.
    fn push_slot(&self) -> Result<Sender<Completion>> {
        let ordering = self.ordering_tx.as_ref().ok_or(Error::Closed)?;
        let (slot_tx, slot_rx) = bounded::<Completion>(1);
        ordering.send(slot_rx).map_err(|_| Error::Closed)?;
        Ok(slot_tx)
    }

    /// Queue the stream header as the first ordered emission, so no
    /// separate code path races it against the first block.
    fn queue_stream_header(&mut self) -> Result<()> {
        if self.wrote_header {
            return Ok(());
        }
        self.wrote_header = true;
        let slot = self.push_slot()?;
        let header = frame::stream_header(self.block_size);
        let _ = slot.send(Completion {
            buf: header.to_vec(),
            len: header.len(),
            start_offset: self.uncompressed_written,
            ack: None,
        });
        Ok(())
    }

    /// Slot first, then the job: a worker cannot complete a block before
    /// its slot is visible to the dispatcher.
    fn submit_block(&mut self, input: BlockInput, uncompressed_len: usize) -> Result<()> {
        let slot = self.push_slot()?;
        let job = Job {
            input,
            start_offset: self.uncompressed_written,
            slot,
        };
        self.uncompressed_written += uncompressed_len as u64;
        self.jobs_tx
            .as_ref()
            .ok_or(Error::Closed)?
            .send(job)
            .map_err(|_| Error::Closed)?;
        Ok(())
    }

    /// Split `p` into blocks and run them through the pipeline (or inline
    /// when synchronous).
    fn write_blocks(&mut self, p: &[u8]) -> Result<usize> {
        if self.concurrency == 1 {
            return self.write_sync(p);
        }
        let total = p.len();
        let mut p = p;
        while !p.is_empty() {
            self.queue_stream_header()?;
            let take = p.len().min(self.block_size);
            let (chunk, rest) = p.split_at(take);
            let mut inbuf = self.shared.pool.acquire();
            inbuf[CHUNK_OVERHEAD..CHUNK_OVERHEAD + take].copy_from_slice(chunk);
            self.submit_block(
                BlockInput::Pooled {
                    buf: inbuf,
                    len: CHUNK_OVERHEAD + take,
                },
                take,
            )?;
            p = rest;
        }
        Ok(total)
    }

    /// One full pooled block from `read_from`; data at
    /// `inbuf[CHUNK_OVERHEAD..CHUNK_OVERHEAD + n]`.
    fn write_full(&mut self, inbuf: Vec<u8>, n: usize) -> Result<()> {
        if self.concurrency == 1 {
            let result = self
                .write_sync(&inbuf[CHUNK_OVERHEAD..CHUNK_OVERHEAD + n])
                .map(drop);
            self.shared.pool.release(inbuf);
            return result;
        }
        self.queue_stream_header()?;
        self.submit_block(
            BlockInput::Pooled {
                buf: inbuf,
                len: CHUNK_OVERHEAD + n,
            },
            n,
        )
    }

    // ── Synchronous path ───────────────────────────────────────────────────

    /// Compress and emit blocks inline on the caller thread. Stored blocks
    /// are written as header + raw source in two writes, skipping the copy
    /// the concurrent path has to make.
    fn write_sync(&mut self, p: &[u8]) -> Result<usize> {
        if !self.wrote_header {
            self.wrote_header = true;
            self.sink_write(&frame::stream_header(self.block_size), true)?;
        }
        let total = p.len();
        let mut p = p;
        while !p.is_empty() {
            let take = p.len().min(self.block_size);
            let (chunk, rest) = p.split_at(take);

            let mut obuf = self.shared.pool.acquire();
            let checksum = crc::masked_crc(chunk);
            let v = varint::put_uvarint(&mut obuf[CHUNK_OVERHEAD..], chunk.len() as u64);
            let n = encode_block(
                &mut obuf[CHUNK_OVERHEAD + v..],
                chunk,
                self.level,
                self.custom_encoder.as_ref(),
            );
            let (emit_len, stored) = if n > 0 {
                frame::put_chunk_header(
                    &mut obuf,
                    CHUNK_TYPE_COMPRESSED_DATA,
                    CHECKSUM_SIZE + v + n,
                );
                (CHUNK_OVERHEAD + v + n, false)
            } else {
                frame::put_chunk_header(
                    &mut obuf,
                    CHUNK_TYPE_UNCOMPRESSED_DATA,
                    CHECKSUM_SIZE + chunk.len(),
                );
                (CHUNK_OVERHEAD, true)
            };
            obuf[CHUNK_HEADER_SIZE..CHUNK_OVERHEAD].copy_from_slice(&checksum.to_le_bytes());

            let pre = self.shared.compressed_written.load(Ordering::Relaxed);
            self.sink_write(&obuf[..emit_len], true)?;
            self.register_block(pre, self.uncompressed_written)?;
            self.uncompressed_written += chunk.len() as u64;
            if stored {
                self.sink_write(chunk, true)?;
            }
            self.shared.pool.release(obuf);
            p = rest;
        }
        Ok(total)
    }

    /// Write to the sink from the caller thread, promoting short writes and
    /// latching failures. `account` adds the bytes to the compressed total.
    fn sink_write(&self, bytes: &[u8], account: bool) -> Result<()> {
        let sink = self.sink.as_ref().ok_or(Error::NoSink)?;
        let result = {
            let mut out = sink.lock().unwrap();
            write_all_chunk(&mut *out, bytes)
        };
        match result {
            Ok(()) => {
                if account {
                    self.shared
                        .compressed_written
                        .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                }
                Ok(())
            }
            Err(err) => Err(self.shared.error.record(err)),
        }
    }

    fn register_block(&self, compressed_offset: u64, uncompressed_offset: u64) -> Result<()> {
        if let Some(index) = self.shared.index.lock().unwrap().as_mut() {
            index
                .add(compressed_offset, uncompressed_offset)
                .map_err(|e| self.shared.error.record(e.into()))?;
        }
        Ok(())
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    /// Route any buffered input into the pipeline without waiting for it to
    /// reach the sink.
    ///
    /// If the stream header has not been written yet, the buffered bytes are
    /// emitted inline: a small payload followed by close never pays for a
    /// pipeline round-trip.
    pub fn async_flush(&mut self) -> Result<()> {
        self.shared.error.check()?;
        if !self.ibuf.is_empty() {
            let buf = std::mem::take(&mut self.ibuf);
            let result = if !self.wrote_header {
                self.write_sync(&buf).map(drop)
            } else {
                self.write_blocks(&buf).map(drop)
            };
            self.ibuf = buf;
            self.ibuf.clear();
            result?;
        }
        self.shared.error.check()
    }

    /// Flush buffered input and block until everything submitted so far has
    /// been handed to the sink.
    pub fn flush(&mut self) -> Result<()> {
        self.async_flush()?;
        if self.ordering_tx.is_some() {
            let slot = self.push_slot()?;
            let (ack_tx, ack_rx) = bounded::<()>(1);
            let _ = slot.send(Completion {
                buf: Vec::new(),
                len: 0,
                start_offset: self.uncompressed_written,
                ack: Some(ack_tx),
            });
            // A dropped dispatcher counts as drained; the error cell has the
            // real story either way.
            let _ = ack_rx.recv();
        }
        self.shared.error.check()
    }

    /// Seal the stream: flush, join the pipeline, then emit the EOF marker
    /// and any configured index and padding. Idempotent; later calls return
    /// `Ok` without emitting anything further.
    pub fn close(&mut self) -> Result<()> {
        self.close_inner(self.add_index).map(drop)
    }

    /// [`close`](Writer::close), returning the serialized index. Only the
    /// first call yields the index.
    pub fn close_index(&mut self) -> Result<Vec<u8>> {
        self.close_inner(true).map(Option::unwrap_or_default)
    }

    fn close_inner(&mut self, want_index: bool) -> Result<Option<Vec<u8>>> {
        // Errors here are already latched; closing continues so the
        // pipeline is always joined.
        let _ = self.flush();
        self.teardown_pipeline();

        if want_index && !self.create_index {
            return Err(Error::IndexDisabled);
        }

        let has_sink = self.sink.is_some();
        if self.shared.error.get().is_none() && has_sink {
            if !self.wrote_header {
                // An empty stream is still a well-formed stream.
                self.wrote_header = true;
                let _ = self.sink_write(&frame::stream_header(self.block_size), true);
            }

            let mut tmp = [0u8; CHUNK_HEADER_SIZE + varint::MAX_VARINT_LEN];
            tmp[0] = CHUNK_TYPE_EOF;
            let n = varint::put_uvarint(&mut tmp[CHUNK_HEADER_SIZE..], self.uncompressed_written);
            tmp[1] = n as u8;
            let _ = self.sink_write(&tmp[..CHUNK_HEADER_SIZE + n], true);
        }

        let mut index_bytes = None;
        if self.shared.error.get().is_none() && has_sink {
            if want_index {
                // With padding ahead, the final stream length is unknown;
                // the index says so instead of guessing.
                let total_compressed = (self.padding <= 1)
                    .then(|| self.shared.compressed_written.load(Ordering::Relaxed));
                let mut serialized = Vec::new();
                if let Some(index) = self.shared.index.lock().unwrap().as_ref() {
                    index.append_to(&mut serialized, self.uncompressed_written, total_compressed);
                }
                // Counted before the padding length is computed: the index
                // is part of the length being padded past.
                if self.add_index {
                    self.shared
                        .compressed_written
                        .fetch_add(serialized.len() as u64, Ordering::Relaxed);
                }
                index_bytes = Some(serialized);
            }

            if self.padding > 1 {
                let written = self.shared.compressed_written.load(Ordering::Relaxed);
                let pad = frame::padding_len(written, self.padding as u64) as usize;
                if pad > 0 {
                    let mut frame_buf = vec![0u8; pad];
                    frame::put_chunk_header(
                        &mut frame_buf,
                        CHUNK_TYPE_PADDING,
                        pad - CHUNK_HEADER_SIZE,
                    );
                    self.padding_source
                        .fill_bytes(&mut frame_buf[CHUNK_HEADER_SIZE..]);
                    tracing::debug!(pad, multiple = self.padding, "appending padding frame");
                    let _ = self.sink_write(&frame_buf, true);
                }
            }

            if self.add_index {
                if let Some(serialized) = &index_bytes {
                    if !serialized.is_empty() {
                        // Already counted above.
                        let _ = self.sink_write(serialized, false);
                    }
                }
            }
        }

        let final_err = self.shared.error.record(Error::Closed);
        tracing::debug!(
            uncompressed = self.uncompressed_written,
            compressed = self.shared.compressed_written.load(Ordering::Relaxed),
            "stream closed"
        );
        match final_err {
            Error::Closed | Error::NoSink => Ok(index_bytes),
            err => Err(err),
        }
    }
}

impl<W: Write + Send + 'static> Drop for Writer<W> {
    /// Cancellation path: without an explicit close, the latch flips to
    /// `Closed` first so draining workers and the dispatcher short-circuit
    /// instead of writing, then the pipeline is joined. Call
    /// [`close`](Writer::close) for a clean end-of-stream.
    fn drop(&mut self) {
        self.shared.error.record(Error::Closed);
        self.teardown_pipeline();
    }
}

impl<W: Write + Send + 'static> io::Write for Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Writer::write(self, buf).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        Writer::flush(self).map_err(io::Error::other)
    }
}

// ── Pipeline stages ────────────────────────────────────────────────────────

/// Run the level-selected (or custom) encoder. Returns compressed length or
/// 0 for "store uncompressed".
fn encode_block(
    dst: &mut [u8],
    src: &[u8],
    level: CompressionLevel,
    custom: Option<&CustomEncoder>,
) -> usize {
    if let Some(custom) = custom {
        let ret = custom(dst, src);
        if ret >= 0 {
            return ret as usize;
        }
    }
    match level {
        CompressionLevel::Uncompressed => 0,
        CompressionLevel::Fastest => block::encode_fastest(dst, src),
        CompressionLevel::Balanced => block::encode_balanced(dst, src),
        CompressionLevel::Smallest => block::encode_smallest(dst, src),
    }
}

/// Worker body: checksum, compress-or-store, frame, publish into the slot.
fn run_encode_job(
    shared: &Shared,
    level: CompressionLevel,
    custom: Option<&CustomEncoder>,
    job: Job,
) {
    let Job {
        input,
        start_offset,
        slot,
    } = job;

    if shared.error.get().is_some() {
        // Cancelled: recycle buffers and keep the ordering queue moving.
        if let BlockInput::Pooled { buf, .. } = input {
            shared.pool.release(buf);
        }
        let _ = slot.send(Completion {
            buf: Vec::new(),
            len: 0,
            start_offset,
            ack: None,
        });
        return;
    }

    let src_len = match &input {
        BlockInput::Pooled { len, .. } => len - CHUNK_OVERHEAD,
        BlockInput::Shared(bytes) => bytes.len(),
    };
    let mut obuf = shared.pool.acquire();
    let (checksum, v, n) = {
        let src: &[u8] = match &input {
            BlockInput::Pooled { buf, len } => &buf[CHUNK_OVERHEAD..*len],
            BlockInput::Shared(bytes) => bytes,
        };
        let checksum = crc::masked_crc(src);
        let v = varint::put_uvarint(&mut obuf[CHUNK_OVERHEAD..], src.len() as u64);
        let n = encode_block(&mut obuf[CHUNK_OVERHEAD + v..], src, level, custom);
        (checksum, v, n)
    };

    let (chunk_type, body_len) = if n > 0 {
        (CHUNK_TYPE_COMPRESSED_DATA, CHECKSUM_SIZE + v + n)
    } else {
        (CHUNK_TYPE_UNCOMPRESSED_DATA, CHECKSUM_SIZE + src_len)
    };
    let (mut out, out_len) = if n > 0 {
        if let BlockInput::Pooled { buf, .. } = input {
            shared.pool.release(buf);
        }
        (obuf, CHUNK_OVERHEAD + v + n)
    } else {
        match input {
            // The input buffer already has the data laid out after the
            // header gap: swap roles instead of copying.
            BlockInput::Pooled { buf, len } => {
                shared.pool.release(obuf);
                (buf, len)
            }
            BlockInput::Shared(bytes) => {
                obuf[CHUNK_OVERHEAD..CHUNK_OVERHEAD + bytes.len()].copy_from_slice(&bytes);
                let len = CHUNK_OVERHEAD + bytes.len();
                (obuf, len)
            }
        }
    };
    frame::put_chunk_header(&mut out, chunk_type, body_len);
    out[CHUNK_HEADER_SIZE..CHUNK_OVERHEAD].copy_from_slice(&checksum.to_le_bytes());

    let _ = slot.send(Completion {
        buf: out,
        len: out_len,
        start_offset,
        ack: None,
    });
}

/// Dispatcher body: drain slots in ticket order, write to the sink, feed the
/// index, recycle buffers, acknowledge barriers.
fn run_dispatcher<W: Write>(shared: Arc<Shared>, sink: Arc<Mutex<W>>, ordering_rx: Receiver<Slot>) {
    for slot in ordering_rx.iter() {
        let Ok(done) = slot.recv() else {
            // Producer vanished without publishing; nothing to emit.
            continue;
        };
        if done.len > 0 && shared.error.get().is_none() {
            let bytes = &done.buf[..done.len];
            let result = {
                let mut out = sink.lock().unwrap();
                write_all_chunk(&mut *out, bytes)
            };
            match result {
                Ok(()) => {
                    let pre = shared.compressed_written.load(Ordering::Relaxed);
                    if let Some(index) = shared.index.lock().unwrap().as_mut() {
                        if let Err(err) = index.add(pre, done.start_offset) {
                            shared.error.record(err.into());
                        }
                    }
                    shared
                        .compressed_written
                        .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                    tracing::trace!(
                        len = bytes.len(),
                        start_offset = done.start_offset,
                        "chunk emitted"
                    );
                }
                Err(err) => {
                    shared.error.record(err);
                }
            }
        }
        // Emission skipped or not, the buffer goes back to the pool.
        shared.pool.release(done.buf);
        if let Some(ack) = done.ack {
            let _ = ack.send(());
        }
    }
}

/// `write_all` with short writes promoted to the writer's own sentinel.
fn write_all_chunk(out: &mut impl Write, bytes: &[u8]) -> Result<()> {
    out.write_all(bytes).map_err(|err| match err.kind() {
        io::ErrorKind::WriteZero => Error::ShortWrite,
        _ => Error::from(err),
    })
}

/// Fill `buf` as far as the reader allows; a short count means EOF.
fn read_full<R: io::Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
