//! Process stdio streams whose OS pipe or socket may not exist yet.
//!
//! Runners hand out [`WritableProcessStream`] and [`ReadableProcessStream`]
//! as soon as a process is requested. Each wraps a future of the real stream;
//! operations issued before that future settles are held back and replayed in
//! arrival order once it does.

use crate::error::{ProcessError, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, oneshot, watch};
use tokio_util::bytes::{Bytes, BytesMut};
use tracing::debug;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Settles the future behind a deferred stream.
pub struct StreamResolver<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> std::fmt::Debug for StreamResolver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResolver")
            .field("abandoned", &self.tx.is_closed())
            .finish()
    }
}

impl<T> StreamResolver<T> {
    pub fn resolve(self, stream: T) {
        let _ = self.tx.send(Ok(stream));
    }

    pub fn fail(self, error: ProcessError) {
        let _ = self.tx.send(Err(error));
    }
}

fn resolver_pair<T>() -> (StreamResolver<T>, impl Future<Output = Result<T>> + Send + 'static)
where
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let future = async move {
        rx.await.unwrap_or_else(|_| {
            Err(ProcessError::StartFailed(
                "process start was abandoned".to_string(),
            ))
        })
    };
    (StreamResolver { tx }, future)
}

type SharedWriter = Arc<Mutex<Option<BoxedWriter>>>;

struct QueuedWrite {
    payload: Bytes,
    done: oneshot::Sender<Result<()>>,
}

enum WriteState {
    Pending {
        queue: VecDeque<QueuedWrite>,
        should_close: bool,
    },
    Ready(SharedWriter),
    Failed(ProcessError),
}

struct WriteShared {
    state: StdMutex<WriteState>,
    closed: AtomicBool,
}

impl WriteShared {
    fn state(&self) -> MutexGuard<'_, WriteState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

enum WriteRoute {
    Direct(SharedWriter),
    Queued(oneshot::Receiver<Result<()>>),
}

/// Writable end of a process stdin that may not be connected yet.
#[derive(Clone)]
pub struct WritableProcessStream {
    shared: Arc<WriteShared>,
}

impl std::fmt::Debug for WritableProcessStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritableProcessStream")
            .field("closed", &self.is_closed())
            .field("writable", &self.is_writable())
            .finish()
    }
}

impl WritableProcessStream {
    /// Wraps a future of the real stream. Must be called inside a tokio runtime.
    pub fn new<F>(stream: F) -> Self
    where
        F: Future<Output = Result<BoxedWriter>> + Send + 'static,
    {
        let shared = Arc::new(WriteShared {
            state: StdMutex::new(WriteState::Pending {
                queue: VecDeque::new(),
                should_close: false,
            }),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(drain_when_resolved(shared.clone(), stream));

        Self { shared }
    }

    /// A stream plus the resolver a runner uses to connect it later.
    pub fn pending() -> (StreamResolver<BoxedWriter>, Self) {
        let (resolver, future) = resolver_pair();
        (resolver, Self::new(future))
    }

    /// Writes `data`, queueing it if the underlying stream is not ready yet.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let payload = data.into();

        let route = {
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(ProcessError::StreamClosed);
            }

            let mut state = self.shared.state();
            match &mut *state {
                WriteState::Ready(writer) => WriteRoute::Direct(writer.clone()),
                WriteState::Failed(error) => return Err(error.clone()),
                WriteState::Pending { queue, .. } => {
                    let (done, rx) = oneshot::channel();
                    queue.push_back(QueuedWrite {
                        payload: payload.clone(),
                        done,
                    });
                    WriteRoute::Queued(rx)
                }
            }
        };

        match route {
            WriteRoute::Direct(writer) => {
                let mut writer = writer.lock().await;
                write_payload(writer.as_mut(), &payload).await
            }
            WriteRoute::Queued(rx) => rx.await.unwrap_or(Err(ProcessError::StreamClosed)),
        }
    }

    /// Writes `final_data` and closes the stream.
    pub async fn end(&self, final_data: impl Into<Bytes>) -> Result<()> {
        let payload = final_data.into();
        let written = if payload.is_empty() {
            Ok(())
        } else {
            self.write(payload).await
        };
        self.close();
        written
    }

    /// Closes the stream. Writes already queued are still delivered first.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut state = self.shared.state();
        match &mut *state {
            WriteState::Pending { should_close, .. } => *should_close = true,
            WriteState::Ready(writer) => release_writer(writer.clone()),
            WriteState::Failed(_) => {}
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// True once the real stream is connected and not closed.
    pub fn is_writable(&self) -> bool {
        !self.is_closed() && matches!(&*self.shared.state(), WriteState::Ready(_))
    }
}

async fn write_payload(writer: Option<&mut BoxedWriter>, payload: &[u8]) -> Result<()> {
    let writer = writer.ok_or(ProcessError::StreamClosed)?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

fn release_writer(writer: SharedWriter) {
    if let Ok(mut slot) = writer.try_lock() {
        slot.take();
        return;
    }

    // A write is in flight; drop the stream once it finishes.
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            writer.lock().await.take();
        });
    }
}

enum DrainStep {
    Write(QueuedWrite),
    Done { close: bool },
}

async fn drain_when_resolved<F>(shared: Arc<WriteShared>, stream: F)
where
    F: Future<Output = Result<BoxedWriter>>,
{
    let writer = match stream.await {
        Ok(writer) => writer,
        Err(error) => {
            let error = error.launch_failed();
            let queued = {
                let mut state = shared.state();
                let previous = std::mem::replace(&mut *state, WriteState::Failed(error.clone()));
                match previous {
                    WriteState::Pending { queue, .. } => queue,
                    _ => VecDeque::new(),
                }
            };
            for write in queued {
                let _ = write.done.send(Err(error.clone()));
            }
            return;
        }
    };

    let writer: SharedWriter = Arc::new(Mutex::new(Some(writer)));
    // Held until every queued write is out so direct writes cannot overtake them.
    let mut slot = writer.lock().await;

    loop {
        let step = {
            let mut state = shared.state();
            match &mut *state {
                WriteState::Pending {
                    queue,
                    should_close,
                } => match queue.pop_front() {
                    Some(write) => DrainStep::Write(write),
                    None => {
                        let close = *should_close;
                        *state = WriteState::Ready(writer.clone());
                        DrainStep::Done { close }
                    }
                },
                _ => DrainStep::Done { close: false },
            }
        };

        match step {
            DrainStep::Write(write) => {
                let result = write_payload(slot.as_mut(), &write.payload).await;
                let _ = write.done.send(result);
            }
            DrainStep::Done { close } => {
                if close {
                    if let Some(mut stream) = slot.take() {
                        let _ = stream.shutdown().await;
                    }
                    debug!("Closed stdin stream after flushing queued writes");
                }
                break;
            }
        }
    }
}

type SharedReader = Arc<Mutex<Option<BoxedReader>>>;

#[derive(Clone)]
enum ReadState {
    Pending,
    Ready(SharedReader),
    Failed(ProcessError),
    Closed,
}

struct ReadShared {
    state: watch::Sender<ReadState>,
    read_pending: AtomicBool,
    should_close: AtomicBool,
}

/// Readable end of a process stdout/stderr that may not be connected yet.
#[derive(Clone)]
pub struct ReadableProcessStream {
    shared: Arc<ReadShared>,
}

impl std::fmt::Debug for ReadableProcessStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadableProcessStream")
            .field("closed", &self.is_closed())
            .field("readable", &self.is_readable())
            .finish()
    }
}

struct PendingReadGuard<'a>(&'a AtomicBool);

impl Drop for PendingReadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ReadableProcessStream {
    /// Wraps a future of the real stream. Must be called inside a tokio runtime.
    pub fn new<F>(stream: F) -> Self
    where
        F: Future<Output = Result<BoxedReader>> + Send + 'static,
    {
        let (state, _) = watch::channel(ReadState::Pending);
        let shared = Arc::new(ReadShared {
            state,
            read_pending: AtomicBool::new(false),
            should_close: AtomicBool::new(false),
        });

        let resolving = shared.clone();
        tokio::spawn(async move {
            let resolved = stream.await;
            resolving.state.send_modify(|state| {
                if !matches!(state, ReadState::Pending) {
                    return;
                }
                *state = match resolved {
                    Ok(_) if resolving.should_close.load(Ordering::Acquire) => ReadState::Closed,
                    Ok(reader) => ReadState::Ready(Arc::new(Mutex::new(Some(reader)))),
                    Err(error) => ReadState::Failed(error.launch_failed()),
                };
            });
        });

        Self { shared }
    }

    /// A stream plus the resolver a runner uses to connect it later.
    pub fn pending() -> (StreamResolver<BoxedReader>, Self) {
        let (resolver, future) = resolver_pair();
        (resolver, Self::new(future))
    }

    /// Reads up to 8 KiB. `Ok(None)` means end of stream.
    pub async fn read(&self) -> Result<Option<Bytes>> {
        self.read_chunk(DEFAULT_CHUNK_SIZE).await
    }

    /// Reads up to `max_len` bytes. `Ok(None)` means end of stream.
    ///
    /// Only one read may wait for the stream to be connected; a second
    /// concurrent read in that window fails with [`ProcessError::PendingRead`].
    pub async fn read_chunk(&self, max_len: usize) -> Result<Option<Bytes>> {
        let state = self.settled_state().await?;

        let reader = match state {
            ReadState::Ready(reader) => reader,
            ReadState::Failed(error) => return Err(error),
            ReadState::Closed | ReadState::Pending => return Ok(None),
        };

        let mut slot = reader.lock().await;
        let Some(stream) = slot.as_mut() else {
            return Ok(None);
        };

        let mut buffer = BytesMut::with_capacity(max_len.max(1));
        let read = stream.read_buf(&mut buffer).await?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(buffer.freeze()))
    }

    /// Reads until end of stream.
    pub async fn read_to_end(&self) -> Result<Bytes> {
        let mut collected = BytesMut::new();
        while let Some(chunk) = self.read().await? {
            collected.extend_from_slice(&chunk);
        }
        Ok(collected.freeze())
    }

    /// Copies everything read into `out` until end of stream. Returns the byte count.
    pub async fn pipe_to<W>(&self, out: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut total = 0u64;
        while let Some(chunk) = self.read().await? {
            out.write_all(&chunk).await?;
            out.flush().await?;
            total += chunk.len() as u64;
        }
        Ok(total)
    }

    async fn settled_state(&self) -> Result<ReadState> {
        let current = self.shared.state.borrow().clone();
        if !matches!(current, ReadState::Pending) {
            return Ok(current);
        }

        if self.shared.read_pending.swap(true, Ordering::AcqRel) {
            return Err(ProcessError::PendingRead);
        }
        let _pending = PendingReadGuard(&self.shared.read_pending);

        let mut rx = self.shared.state.subscribe();
        let settled = rx
            .wait_for(|state| !matches!(state, ReadState::Pending))
            .await
            .map(|state| (*state).clone())
            .unwrap_or(ReadState::Closed);
        Ok(settled)
    }

    /// Closes the stream. Reads that are waiting resolve to end of stream.
    pub fn close(&self) {
        self.shared.should_close.store(true, Ordering::Release);
        self.shared.state.send_modify(|state| {
            if let ReadState::Ready(reader) = state {
                release_reader(reader.clone());
            }
            if !matches!(state, ReadState::Failed(_)) {
                *state = ReadState::Closed;
            }
        });
    }

    pub fn is_closed(&self) -> bool {
        self.shared.should_close.load(Ordering::Acquire)
    }

    /// True once the real stream is connected and not closed.
    pub fn is_readable(&self) -> bool {
        matches!(&*self.shared.state.borrow(), ReadState::Ready(_))
    }
}

fn release_reader(reader: SharedReader) {
    if let Ok(mut slot) = reader.try_lock() {
        slot.take();
        return;
    }

    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            reader.lock().await.take();
        });
    }
}
