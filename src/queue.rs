//! Per-socket job queue and the drain-on-writable protocol.
//!
//! A queue holds keys into the engine's [`JobPool`]. Writes that cannot go out
//! right away become jobs; every writable event drains the head job until the
//! descriptor would block, the job completes, or an error occurs. Only the head
//! job is ever written, which keeps bytes on the wire in enqueue order no matter
//! how many partial writes it takes.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, IoSlice};
use std::os::unix::fs::FileExt;

use crate::job::{Job, Span, WriteData};
use crate::pool::{JobKey, JobPool};
use crate::socket::SocketFlags;

/// Upper bound on spans handed to one `writev(2)`.
const MAX_IOV: usize = 64;

/// Where drained bytes go.
pub(crate) trait WriteTarget {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Bulk transfer from a file. `ErrorKind::Unsupported` selects the
    /// read + write fallback.
    fn send_file(&mut self, file: &File, offset: u64, len: usize) -> io::Result<usize>;

    fn set_cork(&mut self, cork: bool);
}

/// Why a drain stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Drain {
    /// Every job went out.
    Empty,
    /// The descriptor is full; resume on the next writable event.
    WouldBlock,
    /// A shutdown job reached the head of the queue.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Done,
    Blocked,
}

/// Ordered jobs of one socket.
#[derive(Debug, Default)]
pub(crate) struct JobQueue {
    keys: VecDeque<JobKey>,
    pub(crate) flags: SocketFlags,
}

impl JobQueue {
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Appends `job` at the tail of the queue.
    pub(crate) fn push(&mut self, pool: &mut JobPool, job: Job) {
        let key = pool.acquire(job);
        self.keys.push_back(key);
    }

    /// Writes `data`, queueing whatever does not go out at once.
    ///
    /// With `direct` set and an empty queue the bytes are written immediately
    /// until the target would block, and only the remainder is queued, at the
    /// offset reached. Otherwise the whole payload is queued behind the
    /// existing jobs.
    pub(crate) fn write<T: WriteTarget>(
        &mut self,
        pool: &mut JobPool,
        target: &mut T,
        data: WriteData<'_>,
        direct: bool,
    ) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let data = match data {
            WriteData::Copy(b) => WriteData::Own(b.to_vec()),
            other => other,
        };

        let mut written = 0;
        if direct && self.keys.is_empty() {
            written = write_some(target, data.as_slice())?;
            if written == data.len() {
                self.flags.would_block = false;
                return Ok(());
            }
            self.flags.would_block = true;
        }

        let span = Span::new(data.into_payload(), written);
        self.push(pool, Job::Buffer(span));
        Ok(())
    }

    /// Drains jobs in order until the queue empties or the target blocks.
    pub(crate) fn drain<T: WriteTarget>(
        &mut self,
        pool: &mut JobPool,
        target: &mut T,
        cork: bool,
        file_chunk: usize,
    ) -> io::Result<Drain> {
        if cork && self.keys.len() > 1 && !self.flags.cork {
            target.set_cork(true);
            self.flags.cork = true;
        }

        let outcome = self.drain_jobs(pool, target, file_chunk);

        match outcome {
            Ok(Drain::WouldBlock) => self.flags.would_block = true,
            _ => {
                self.flags.would_block = false;
                if self.flags.cork {
                    target.set_cork(false);
                    self.flags.cork = false;
                }
            }
        }
        outcome
    }

    fn drain_jobs<T: WriteTarget>(
        &mut self,
        pool: &mut JobPool,
        target: &mut T,
        file_chunk: usize,
    ) -> io::Result<Drain> {
        while let Some(&key) = self.keys.front() {
            let Some(record) = pool.get_mut(key) else {
                log::warn!("dropping stale job key {key:?}");
                self.keys.pop_front();
                continue;
            };
            if !record.active {
                record.active = true;
                log::trace!("job {key:?} started");
            }

            let step = match &mut record.job {
                Job::Shutdown => return Ok(Drain::Shutdown),
                Job::Buffer(span) => drain_span(target, span)?,
                Job::Vectored(spans) => drain_vectored(target, spans)?,
                Job::File {
                    file,
                    offset,
                    remaining,
                } => drain_file(target, file, offset, remaining, file_chunk)?,
            };
            if step == Step::Blocked {
                return Ok(Drain::WouldBlock);
            }

            self.keys.pop_front();
            pool.release(key);
        }
        Ok(Drain::Empty)
    }

    /// Releases every queued job back to the pool, returning how many there were.
    pub(crate) fn clear(&mut self, pool: &mut JobPool) -> usize {
        let n = self.keys.len();
        for key in self.keys.drain(..) {
            pool.release(key);
        }
        n
    }

    /// Bytes (or file offset) already written from the head job.
    #[cfg(test)]
    pub(crate) fn head_offset(&self, pool: &JobPool) -> Option<u64> {
        let record = pool.get(*self.keys.front()?)?;
        match &record.job {
            Job::Buffer(span) => Some(span.offset as u64),
            Job::Vectored(spans) => spans.front().map(|s| s.offset as u64),
            Job::File { offset, .. } => Some(*offset),
            Job::Shutdown => None,
        }
    }
}

/// Writes as much of `buf` as the target takes without blocking.
fn write_some<T: WriteTarget>(target: &mut T, buf: &[u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match target.write(&buf[n..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(k) => n += k,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

fn drain_span<T: WriteTarget>(target: &mut T, span: &mut Span) -> io::Result<Step> {
    span.offset += write_some(target, span.remaining())?;
    Ok(if span.is_done() {
        Step::Done
    } else {
        Step::Blocked
    })
}

fn drain_vectored<T: WriteTarget>(target: &mut T, spans: &mut VecDeque<Span>) -> io::Result<Step> {
    while !spans.is_empty() {
        let res = {
            let slices: Vec<IoSlice<'_>> = spans
                .iter()
                .take(MAX_IOV)
                .map(|s| IoSlice::new(s.remaining()))
                .collect();
            target.write_vectored(&slices)
        };
        match res {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => advance(spans, n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Step::Blocked),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Step::Done)
}

/// Pops spans consumed by an `n`-byte write and moves the offset of the first
/// partially written one.
fn advance(spans: &mut VecDeque<Span>, mut n: usize) {
    while n > 0 {
        let Some(front) = spans.front_mut() else {
            return;
        };
        let left = front.remaining().len();
        if n >= left {
            n -= left;
            spans.pop_front();
        } else {
            front.offset += n;
            n = 0;
        }
    }
}

fn drain_file<T: WriteTarget>(
    target: &mut T,
    file: &File,
    offset: &mut u64,
    remaining: &mut u64,
    chunk: usize,
) -> io::Result<Step> {
    let mut fallback: Option<Vec<u8>> = None;
    while *remaining > 0 {
        let len = (*remaining).min(chunk as u64) as usize;
        let res = match fallback.as_mut() {
            Some(buf) => copy_chunk(target, file, *offset, &mut buf[..len]),
            None => target.send_file(file, *offset, len),
        };
        match res {
            Ok(0) => {
                log::warn!("file ended with {remaining} bytes left to send");
                *remaining = 0;
            }
            Ok(n) => {
                *offset += n as u64;
                *remaining -= n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Unsupported && fallback.is_none() => {
                log::debug!("sendfile unavailable, copying through user space");
                fallback = Some(vec![0u8; chunk]);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Step::Blocked),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Step::Done)
}

/// One positioned read followed by one write. Only the bytes the target
/// accepted count, so a short write re-reads the rest next time.
fn copy_chunk<T: WriteTarget>(target: &mut T, file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    let n = file.read_at(buf, offset)?;
    if n == 0 {
        return Ok(0);
    }
    target.write(&buf[..n])
}
