//! Deferred write jobs and payload ownership.

use std::collections::VecDeque;
use std::fs::File;

use bytes::Bytes;

/// A write payload together with who owns its storage.
///
/// The variant decides whether the engine copies the data when it has to
/// queue it, and who releases the storage when the write is done.
///
/// ```rust
/// use bytes::Bytes;
/// use readysock::WriteData;
///
/// let header = b"HTTP/1.1 200 OK\r\n";
/// let body = Bytes::from_static(b"hello");
///
/// let parts = vec![
///     WriteData::GlobalStatic(header),
///     WriteData::AutoRelease(body.clone()),
/// ];
/// assert_eq!(parts.iter().map(|p| p.len()).sum::<usize>(), 22);
/// ```
#[derive(Debug, Clone)]
pub enum WriteData<'a> {
    /// Caller keeps the buffer. Whatever cannot be written right away is
    /// copied before the call returns.
    Static(&'a [u8]),
    /// Lives for the whole program, queued by reference.
    GlobalStatic(&'static [u8]),
    /// Shared buffer; the engine drops its reference once drained.
    AutoRelease(Bytes),
    /// The allocation moves into the engine and is freed once drained.
    Own(Vec<u8>),
    /// Duplicated immediately, so the caller may reuse the buffer at once.
    Copy(&'a [u8]),
}

impl WriteData<'_> {
    /// Payload bytes.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            WriteData::Static(b) | WriteData::Copy(b) => b,
            WriteData::GlobalStatic(b) => b,
            WriteData::AutoRelease(b) => b,
            WriteData::Own(v) => v,
        }
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Returns `true` for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converts into storage the engine may hold past the current call.
    pub(crate) fn into_payload(self) -> Payload {
        match self {
            WriteData::Static(b) | WriteData::Copy(b) => Payload::Owned(b.to_vec()),
            WriteData::GlobalStatic(b) => Payload::Global(b),
            WriteData::AutoRelease(b) => Payload::Shared(b),
            WriteData::Own(v) => Payload::Owned(v),
        }
    }
}

/// Queued payload storage.
#[derive(Debug)]
pub(crate) enum Payload {
    Global(&'static [u8]),
    Shared(Bytes),
    Owned(Vec<u8>),
}

impl Payload {
    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Global(b) => b,
            Payload::Shared(b) => b,
            Payload::Owned(v) => v,
        }
    }
}

/// Payload plus how much of it has already been written.
#[derive(Debug)]
pub(crate) struct Span {
    pub(crate) data: Payload,
    pub(crate) offset: usize,
}

impl Span {
    pub(crate) fn new(data: Payload, offset: usize) -> Self {
        Self { data, offset }
    }

    pub(crate) fn remaining(&self) -> &[u8] {
        &self.data.as_slice()[self.offset..]
    }

    pub(crate) fn is_done(&self) -> bool {
        self.offset >= self.data.as_slice().len()
    }
}

/// A deferred operation waiting for a writable descriptor.
#[derive(Debug)]
pub(crate) enum Job {
    Buffer(Span),
    /// Fully written spans are popped from the front.
    Vectored(VecDeque<Span>),
    File {
        file: File,
        offset: u64,
        remaining: u64,
    },
    Shutdown,
}

impl Job {
    pub(crate) fn vectored<'a>(parts: impl IntoIterator<Item = WriteData<'a>>) -> Job {
        Job::Vectored(
            parts
                .into_iter()
                .filter(|p| !p.is_empty())
                .map(|p| Span::new(p.into_payload(), 0))
                .collect(),
        )
    }

    pub(crate) fn is_done(&self) -> bool {
        match self {
            Job::Buffer(span) => span.is_done(),
            Job::Vectored(spans) => spans.is_empty(),
            Job::File { remaining, .. } => *remaining == 0,
            Job::Shutdown => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_borrowed_tags_copy() {
        let mut buf = vec![1u8, 2, 3];
        let payload = WriteData::Static(&buf).into_payload();
        let copied = WriteData::Copy(&buf).into_payload();
        buf[0] = 9;
        assert_eq!(payload.as_slice(), &[1, 2, 3]);
        assert_eq!(copied.as_slice(), &[1, 2, 3]);
        assert!(matches!(payload, Payload::Owned(_)));
    }

    #[test]
    fn test_global_and_shared_are_not_copied() {
        static DATA: &[u8] = b"static";
        match WriteData::GlobalStatic(DATA).into_payload() {
            Payload::Global(b) => assert_eq!(b.as_ptr(), DATA.as_ptr()),
            other => panic!("unexpected {other:?}"),
        }

        let shared = Bytes::from(vec![7u8; 64]);
        match WriteData::AutoRelease(shared.clone()).into_payload() {
            Payload::Shared(b) => assert_eq!(b.as_ptr(), shared.as_ptr()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_own_moves_allocation() {
        let v = vec![5u8; 32];
        let ptr = v.as_ptr();
        match WriteData::Own(v).into_payload() {
            Payload::Owned(v) => assert_eq!(v.as_ptr(), ptr),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_vectored_skips_empty_parts() {
        let job = Job::vectored(vec![
            WriteData::Copy(b"ab"),
            WriteData::Own(Vec::new()),
            WriteData::GlobalStatic(b"cd"),
        ]);
        match job {
            Job::Vectored(spans) => assert_eq!(spans.len(), 2),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_span_progress() {
        let mut span = Span::new(Payload::Global(b"hello"), 0);
        span.offset = 3;
        assert_eq!(span.remaining(), b"lo");
        assert!(!span.is_done());
        span.offset = 5;
        assert!(span.is_done());
        assert!(Job::Buffer(span).is_done());
    }
}
