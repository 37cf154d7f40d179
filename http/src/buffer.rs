//! writable items and write groups. the unit types of response output.

use std::{fmt, io, rc::Rc, time::Duration};

use bytes::Bytes;

/// Outcome delivered to an after-write notificator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// the group never reached the socket. Delivered when a connection dies
    /// with queued output.
    NotExecuted,
    /// the write operation failed with an io error of the given kind.
    Io(io::ErrorKind),
    /// the write operation exceeded its deadline.
    TimedOut,
}

/// One-shot callback fired once a write group has left the socket buffer,
/// or with an error when it never will.
pub type Notificator = Box<dyn FnOnce(Result<(), WriteError>)>;

/// A file segment scheduled for transmission.
///
/// The transfer is executed as a seek/read/write loop moving at most
/// `chunk_size` bytes per step, bounded in total by `timelimit`.
#[derive(Debug)]
pub struct FileTransfer {
    pub(crate) file: tokio::fs::File,
    pub(crate) offset: u64,
    pub(crate) len: u64,
    pub(crate) chunk_size: usize,
    pub(crate) timelimit: Duration,
}

impl FileTransfer {
    pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

    pub fn new(file: std::fs::File, offset: u64, len: u64) -> Self {
        Self {
            file: tokio::fs::File::from_std(file),
            offset,
            len,
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
            timelimit: Duration::from_secs(60),
        }
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        assert_ne!(size, 0, "file transfer chunk size must not be zero");
        self.chunk_size = size;
        self
    }

    pub fn timelimit(mut self, limit: Duration) -> Self {
        self.timelimit = limit;
        self
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// One element of a [WriteGroup]: a byte buffer in one of several ownership
/// shapes, or a file transfer descriptor. All variants expose a stable size.
pub enum WritableItem {
    Empty,
    /// non owning reference to bytes with static lifetime.
    Static(&'static [u8]),
    /// owned (possibly shared) byte buffer.
    Bytes(Bytes),
    /// shared owning reference to any data+size object.
    Shared(Rc<dyn AsRef<[u8]>>),
    File(FileTransfer),
}

impl fmt::Debug for WritableItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Static(bytes) => f.debug_tuple("Static").field(bytes).finish(),
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(bytes).finish(),
            Self::Shared(shared) => f.debug_tuple("Shared").field(&(**shared).as_ref()).finish(),
            Self::File(file) => f.debug_tuple("File").field(file).finish(),
        }
    }
}

impl WritableItem {
    /// Byte count this item contributes to the wire.
    pub fn size(&self) -> u64 {
        match *self {
            Self::Empty => 0,
            Self::Static(bytes) => bytes.len() as u64,
            Self::Bytes(ref bytes) => bytes.len() as u64,
            Self::Shared(ref shared) => (**shared).as_ref().len() as u64,
            Self::File(ref file) => file.size(),
        }
    }

    /// `true` for byte-buffer variants that can join a gather write.
    pub fn is_trivial(&self) -> bool {
        !matches!(*self, Self::File(_))
    }

    /// Byte slice view of a trivial item.
    ///
    /// # Panics:
    /// When called on a file transfer item.
    pub(crate) fn as_slice(&self) -> &[u8] {
        match *self {
            Self::Empty => &[],
            Self::Static(bytes) => bytes,
            Self::Bytes(ref bytes) => bytes.as_ref(),
            Self::Shared(ref shared) => (**shared).as_ref(),
            Self::File(_) => unreachable!("file transfer item has no in-memory representation"),
        }
    }
}

impl From<Bytes> for WritableItem {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&'static [u8]> for WritableItem {
    fn from(bytes: &'static [u8]) -> Self {
        Self::Static(bytes)
    }
}

impl From<FileTransfer> for WritableItem {
    fn from(file: FileTransfer) -> Self {
        Self::File(file)
    }
}

/// Ordered atomic unit of output for one request: a response or a response
/// chunk, possibly mixing byte buffers and file transfers, with an optional
/// after-write notificator.
#[derive(Default)]
pub struct WriteGroup {
    items: Vec<WritableItem>,
    after_write: Option<Notificator>,
    status_line_size: usize,
}

impl fmt::Debug for WriteGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteGroup")
            .field("items", &self.items)
            .field("after_write", &self.after_write.is_some())
            .field("status_line_size", &self.status_line_size)
            .finish()
    }
}

impl WriteGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: WritableItem) {
        self.items.push(item);
    }

    pub fn items(&self) -> &[WritableItem] {
        &self.items
    }

    pub(crate) fn items_mut(&mut self) -> &mut [WritableItem] {
        &mut self.items
    }

    /// Total byte count of all items.
    pub fn size(&self) -> u64 {
        self.items.iter().map(WritableItem::size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_notificator(&self) -> bool {
        self.after_write.is_some()
    }

    pub fn set_notificator(&mut self, notificator: Notificator) {
        self.after_write = Some(notificator);
    }

    /// Byte length of the status line and header section carried by this
    /// group. Zero for trailing parts of a response.
    pub fn status_line_size(&self) -> usize {
        self.status_line_size
    }

    pub fn set_status_line_size(&mut self, size: usize) {
        self.status_line_size = size;
    }

    /// Append all items of `other` to this group. The trailing notificator is
    /// taken over.
    ///
    /// Only legal when this group has no notificator yet and `other` carries
    /// no status line.
    pub fn merge(&mut self, mut other: WriteGroup) {
        debug_assert!(self.after_write.is_none());
        debug_assert_eq!(other.status_line_size, 0);
        self.items.append(&mut other.items);
        self.after_write = other.after_write.take();
    }

    /// Fire the notificator with the given outcome, if one is attached.
    pub fn invoke_after_write(&mut self, res: Result<(), WriteError>) {
        if let Some(notificator) = self.after_write.take() {
            notificator(res);
        }
    }
}

impl Drop for WriteGroup {
    fn drop(&mut self) {
        // a group dropped with its notificator still attached never reached
        // the socket.
        self.invoke_after_write(Err(WriteError::NotExecuted));
    }
}
