//! write-group output engine.
//!
//! A group's items are walked left to right. Runs of byte items coalesce into
//! one gather write; every file transfer item becomes its own operation, a
//! seek/read/write loop bounded by the transfer's chunk size and timelimit.

use std::{
    future::poll_fn,
    io::{self, IoSlice, SeekFrom},
    pin::{Pin, pin},
};

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt},
    time::Instant,
};
use tracing::trace;

use crate::{
    buffer::{FileTransfer, WritableItem, WriteError, WriteGroup},
    timer::{Deadline, Timeout},
};

/// ceiling on the slice vector length of one gather write.
pub(crate) const MAX_GATHER_SLICES: usize = 64;

/// Write one group to `io` and fire its notificator with the outcome.
///
/// Returns the transferred byte count, or the error that stopped the
/// transfer (already delivered to the notificator in mapped form).
pub(crate) async fn send_group<Io>(io: &mut Io, mut group: WriteGroup) -> io::Result<u64>
where
    Io: AsyncWrite + Unpin,
{
    match send_items(io, group.items_mut()).await {
        Ok(transferred) => {
            group.invoke_after_write(Ok(()));
            Ok(transferred)
        }
        Err(e) => {
            group.invoke_after_write(Err(map_write_error(&e)));
            Err(e)
        }
    }
}

fn map_write_error(e: &io::Error) -> WriteError {
    match e.kind() {
        io::ErrorKind::TimedOut => WriteError::TimedOut,
        kind => WriteError::Io(kind),
    }
}

async fn send_items<Io>(io: &mut Io, items: &mut [WritableItem]) -> io::Result<u64>
where
    Io: AsyncWrite + Unpin,
{
    let mut transferred = 0;
    let mut idx = 0;

    while idx < items.len() {
        if items[idx].is_trivial() {
            let run = items[idx..]
                .iter()
                .take(MAX_GATHER_SLICES)
                .take_while(|item| item.is_trivial())
                .count();
            transferred += write_gather(io, &items[idx..idx + run]).await?;
            idx += run;
        } else {
            let WritableItem::File(ref mut file) = items[idx] else {
                unreachable!("non-trivial writable item must be a file transfer")
            };
            transferred += write_file(io, file).await?;
            idx += 1;
        }
    }

    io.flush().await?;
    Ok(transferred)
}

async fn write_gather<Io>(io: &mut Io, items: &[WritableItem]) -> io::Result<u64>
where
    Io: AsyncWrite + Unpin,
{
    let total = items.iter().map(|item| item.size() as usize).sum::<usize>();

    let mut written = 0;
    let mut item_idx = 0;
    let mut item_off = 0;

    while written < total {
        let mut slices = Vec::with_capacity((items.len() - item_idx).min(MAX_GATHER_SLICES));
        for (i, item) in items[item_idx..].iter().enumerate() {
            let slice = item.as_slice();
            let slice = if i == 0 { &slice[item_off..] } else { slice };
            if !slice.is_empty() {
                slices.push(IoSlice::new(slice));
            }
        }

        let n = poll_fn(|cx| Pin::new(&mut *io).poll_write_vectored(cx, &slices)).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        written += n;

        // advance the (item, offset) cursor across fully written items.
        let mut rem = n;
        while rem > 0 && item_idx < items.len() {
            let avail = items[item_idx].as_slice().len() - item_off;
            if rem < avail {
                item_off += rem;
                rem = 0;
            } else {
                rem -= avail;
                item_idx += 1;
                item_off = 0;
            }
        }
    }

    Ok(total as u64)
}

async fn write_file<Io>(io: &mut Io, file: &mut FileTransfer) -> io::Result<u64>
where
    Io: AsyncWrite + Unpin,
{
    trace!(
        target: "output",
        "file transfer start: offset {} len {} chunk {}",
        file.offset,
        file.len,
        file.chunk_size
    );

    let mut deadline = pin!(Deadline::new(Instant::now() + file.timelimit));

    file.file.seek(SeekFrom::Start(file.offset)).await?;

    let mut transferred = 0u64;
    let mut buf = BytesMut::with_capacity(file.chunk_size.min(file.len as usize));

    while file.len > 0 {
        buf.clear();
        let want = file.len.min(file.chunk_size as u64) as usize;

        // short reads happen; fill the chunk before writing it out.
        while buf.len() < want {
            let mut take = (&mut file.file).take((want - buf.len()) as u64);
            let n = take.read_buf(&mut buf).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }

        io.write_all(&buf)
            .timeout(deadline.as_mut())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "file transfer timelimit exceeded"))??;

        file.offset += want as u64;
        file.len -= want as u64;
        transferred += want as u64;
    }

    Ok(transferred)
}

/// Shape of one planned write operation. The planning is pure; useful for
/// inspecting how a group splits into operations.
#[cfg(test)]
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum OpShape {
    Gather { items: usize, bytes: u64 },
    File { bytes: u64 },
}

#[cfg(test)]
pub(crate) fn plan_ops(items: &[WritableItem]) -> Vec<OpShape> {
    let mut ops = Vec::new();
    let mut idx = 0;

    while idx < items.len() {
        if items[idx].is_trivial() {
            let run = items[idx..]
                .iter()
                .take(MAX_GATHER_SLICES)
                .take_while(|item| item.is_trivial())
                .count();
            let bytes = items[idx..idx + run].iter().map(WritableItem::size).sum();
            ops.push(OpShape::Gather { items: run, bytes });
            idx += run;
        } else {
            ops.push(OpShape::File {
                bytes: items[idx].size(),
            });
            idx += 1;
        }
    }

    ops
}
