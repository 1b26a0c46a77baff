use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CodecError;

/// One contiguous slice of a source, tagged with its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u64,
    pub data: Bytes,
}

/// Number of chunks a source of `total_size` bytes splits into.
pub fn chunk_count(total_size: u64, chunk_size: usize) -> u64 {
    let chunk_size = chunk_size.max(1) as u64;
    total_size.div_ceil(chunk_size)
}

/// Reads a source sequentially in fixed-size chunks.
///
/// Every chunk is exactly `chunk_size` bytes except the final one, which holds
/// whatever remains. An empty source yields no chunks.
pub struct ChunkSplitter<R> {
    reader: R,
    chunk_size: usize,
    next_index: u64,
    done: bool,
}

impl<R: AsyncRead + Unpin> ChunkSplitter<R> {
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
            next_index: 0,
            done: false,
        }
    }

    /// Reads the next chunk. Returns `None` at end of input.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, CodecError> {
        if self.done {
            return Ok(None);
        }

        let mut buf = BytesMut::zeroed(self.chunk_size);
        let mut filled = 0;
        // A single read may return less than asked; keep going until the
        // buffer is full or the source is exhausted.
        while filled < self.chunk_size {
            let n = self
                .reader
                .read(&mut buf[filled..])
                .await
                .map_err(CodecError::Read)?;
            if n == 0 {
                self.done = true;
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);

        let chunk = Chunk {
            index: self.next_index,
            data: buf.freeze(),
        };
        self.next_index += 1;
        Ok(Some(chunk))
    }

    /// Chunks emitted so far.
    pub fn emitted(&self) -> u64 {
        self.next_index
    }
}

/// Splits an entire source into memory.
pub async fn split<R: AsyncRead + Unpin>(
    reader: R,
    chunk_size: usize,
) -> Result<Vec<Chunk>, CodecError> {
    let mut splitter = ChunkSplitter::new(reader, chunk_size);
    let mut chunks = Vec::new();
    while let Some(chunk) = splitter.next_chunk().await? {
        chunks.push(chunk);
    }
    Ok(chunks)
}

/// Copies one chunk to `out` and flushes, so the consumer sees it immediately.
pub async fn write_chunk<R, W>(index: u64, mut chunk: R, out: &mut W) -> Result<u64, CodecError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let written = tokio::io::copy(&mut chunk, &mut *out)
        .await
        .map_err(|source| CodecError::Merge { index, source })?;
    out.flush()
        .await
        .map_err(|source| CodecError::Merge { index, source })?;
    Ok(written)
}

/// Writes chunks to `out` in the order given, which must be ascending index
/// order. Stops at the first failure; bytes already flushed stay flushed.
pub async fn merge<I, R, W>(chunks: I, out: &mut W) -> Result<u64, CodecError>
where
    I: IntoIterator<Item = R>,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut total = 0;
    for (index, chunk) in chunks.into_iter().enumerate() {
        total += write_chunk(index as u64, chunk, &mut *out).await?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunk_count(0, 5), 0);
        assert_eq!(chunk_count(1, 5), 1);
        assert_eq!(chunk_count(5, 5), 1);
        assert_eq!(chunk_count(6, 5), 2);
        assert_eq!(chunk_count(12 * 1024 * 1024, 5 * 1024 * 1024), 3);
    }

    #[tokio::test]
    async fn split_sizes_every_chunk_but_the_last() {
        let data = pattern(23);
        let chunks = split(&data[..], 5).await.unwrap();

        assert_eq!(chunks.len() as u64, chunk_count(23, 5));
        let sizes: Vec<usize> = chunks.iter().map(|c| c.data.len()).collect();
        assert_eq!(sizes, vec![5, 5, 5, 5, 3]);
        let indices: Vec<u64> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn split_exact_boundary_has_no_empty_tail() {
        let data = pattern(15);
        let chunks = split(&data[..], 5).await.unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.data.len() == 5));
    }

    #[tokio::test]
    async fn empty_source_yields_no_chunks() {
        let chunks = split(&b""[..], 5).await.unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn split_fills_chunks_across_short_reads() {
        // Chain produces a short read at the seam between the two halves.
        let first = pattern(3);
        let second = pattern(9);
        let reader = (&first[..]).chain(&second[..]);
        let chunks = split(reader, 4).await.unwrap();
        let sizes: Vec<usize> = chunks.iter().map(|c| c.data.len()).collect();
        assert_eq!(sizes, vec![4, 4, 4]);
    }

    #[tokio::test]
    async fn merge_reproduces_source() {
        let data = pattern(10_000);
        let chunks = split(&data[..], 777).await.unwrap();

        let mut out = Vec::new();
        let written = merge(chunks.iter().map(|c| &c.data[..]), &mut out)
            .await
            .unwrap();

        assert_eq!(written, data.len() as u64);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn unreadable_source_is_a_read_error() {
        struct Broken;
        impl AsyncRead for Broken {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Err(std::io::Error::other("disk gone")))
            }
        }

        let err = split(Broken, 4).await.unwrap_err();
        assert!(matches!(err, CodecError::Read(_)));
    }
}
