//! Batched positional reads
//!
//! A [`BatchedReader`] takes a list of `(file offset, destination)` requests
//! and fills every destination or fails. Requests are submitted in batches
//! of at most `batch_limit()` operations, and every completed operation is
//! checked against the length it asked for.
//!
//! On Linux with glibc the batches go through `lio_listio(LIO_WAIT)`, which
//! blocks the worker thread until the whole batch has completed. Elsewhere
//! the requests are served one by one with positional reads.

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{ReportError, Result};

/// Whether this platform has a native list I/O facility.
pub const NATIVE_LIST_IO: bool = cfg!(all(target_os = "linux", target_env = "gnu"));

/// One read: fill `buffer` from `offset`.
#[derive(Debug)]
pub struct ReadRequest<'a> {
    pub offset: u64,
    pub buffer: &'a mut [u8],
}

/// Reads many disjoint file ranges.
pub trait BatchedReader: Send + Sync {
    /// Submit one batch and wait for all of it.
    fn read_batch(&self, requests: &mut [ReadRequest<'_>]) -> Result<()>;

    /// Most requests submitted at once.
    fn batch_limit(&self) -> usize;

    /// Serve every request, batch by batch.
    fn read_all(&self, requests: &mut [ReadRequest<'_>]) -> Result<()> {
        for batch in requests.chunks_mut(self.batch_limit().max(1)) {
            self.read_batch(batch)?;
        }
        Ok(())
    }
}

/// The best reader for this platform.
pub fn open_batched_reader(file: File, path: &Path, batch_limit: usize) -> Box<dyn BatchedReader> {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        Box::new(ListIoReader { file, path: path.to_path_buf(), batch_limit })
    }

    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    {
        Box::new(PositionalReader::new(file, path, batch_limit))
    }
}

fn short_read(path: &Path, offset: u64, expected: usize, got: usize) -> ReportError {
    ReportError::Io {
        path: Some(path.to_path_buf()),
        kind: std::io::ErrorKind::UnexpectedEof,
        message: format!("short read at offset {}: expected {} bytes, got {}", offset, expected, got),
    }
}

/// Serves each request with one positional read.
pub struct PositionalReader {
    #[cfg(unix)]
    file: File,
    #[cfg(not(unix))]
    file: parking_lot::Mutex<File>,
    path: PathBuf,
    batch_limit: usize,
}

impl PositionalReader {
    pub fn new(file: File, path: &Path, batch_limit: usize) -> Self {
        Self {
            #[cfg(unix)]
            file,
            #[cfg(not(unix))]
            file: parking_lot::Mutex::new(file),
            path: path.to_path_buf(),
            batch_limit,
        }
    }

    #[cfg(unix)]
    fn read_one(&self, request: &mut ReadRequest<'_>) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(request.buffer, request.offset)
    }

    #[cfg(not(unix))]
    fn read_one(&self, request: &mut ReadRequest<'_>) -> std::io::Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(request.offset))?;
        file.read_exact(request.buffer)
    }
}

impl BatchedReader for PositionalReader {
    fn read_batch(&self, requests: &mut [ReadRequest<'_>]) -> Result<()> {
        for request in requests.iter_mut() {
            self.read_one(request).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    short_read(&self.path, request.offset, request.buffer.len(), 0)
                } else {
                    ReportError::io_at(&self.path, &e, "Positional read failed")
                }
            })?;
        }
        Ok(())
    }

    fn batch_limit(&self) -> usize {
        self.batch_limit
    }
}

/// Submits each batch with `lio_listio(LIO_WAIT)`.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub struct ListIoReader {
    file: File,
    path: PathBuf,
    batch_limit: usize,
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
impl BatchedReader for ListIoReader {
    fn read_batch(&self, requests: &mut [ReadRequest<'_>]) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        if requests.is_empty() {
            return Ok(());
        }
        let fd = self.file.as_raw_fd();

        let mut blocks = Vec::with_capacity(requests.len());
        for request in requests.iter_mut() {
            let offset = libc::off_t::try_from(request.offset).map_err(|_| {
                ReportError::InvalidArgument(format!("read offset {} exceeds off_t", request.offset))
            })?;
            // SAFETY: aiocb is a plain C struct for which all-zero is a valid
            // initial state; the fields glibc reads are set below.
            let mut block: libc::aiocb = unsafe { std::mem::zeroed() };
            block.aio_fildes = fd;
            block.aio_lio_opcode = libc::LIO_READ;
            block.aio_buf = request.buffer.as_mut_ptr().cast();
            block.aio_nbytes = request.buffer.len();
            block.aio_offset = offset;
            block.aio_sigevent.sigev_notify = libc::SIGEV_NONE;
            blocks.push(block);
        }
        let list: Vec<*mut libc::aiocb> = blocks.iter_mut().map(|b| b as *mut libc::aiocb).collect();
        let count = libc::c_int::try_from(list.len())
            .map_err(|_| ReportError::InvalidArgument("read batch too large".into()))?;

        // SAFETY: every control block points into a destination buffer that
        // stays mutably borrowed for the whole call; LIO_WAIT returns only
        // after the kernel is done with all of them or reports per-op errors,
        // and any op still in flight is waited for below before returning.
        let submitted = unsafe { libc::lio_listio(libc::LIO_WAIT, list.as_ptr(), count, std::ptr::null_mut()) };
        let submit_error = (submitted != 0).then(std::io::Error::last_os_error);

        let mut failure = None;
        for (block, request) in blocks.iter_mut().zip(requests.iter()) {
            let status = loop {
                // SAFETY: block is a live control block submitted above.
                let status = unsafe { libc::aio_error(&*block) };
                if status != libc::EINPROGRESS {
                    break status;
                }
                let pending = [&*block as *const libc::aiocb];
                // SAFETY: waits on one live control block, no timeout.
                unsafe { libc::aio_suspend(pending.as_ptr(), 1, std::ptr::null()) };
            };
            // SAFETY: the op has completed, aio_return may be called once.
            let returned = unsafe { libc::aio_return(&mut *block) };
            if failure.is_some() {
                continue;
            }
            if status != 0 {
                let err = std::io::Error::from_raw_os_error(status);
                failure = Some(ReportError::io_at(&self.path, &err, "Batched read failed"));
            } else if returned < 0 || returned as usize != request.buffer.len() {
                failure = Some(short_read(
                    &self.path,
                    request.offset,
                    request.buffer.len(),
                    returned.max(0) as usize,
                ));
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }
        if let Some(err) = submit_error {
            // every op reported success, the submission error was transient
            tracing::debug!(path = %self.path.display(), error = %err, "lio_listio returned an error");
        }
        Ok(())
    }

    fn batch_limit(&self) -> usize {
        self.batch_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture(len: usize) -> (tempfile::NamedTempFile, Vec<u8>) {
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();
        (file, bytes)
    }

    fn check_reader(reader: &dyn BatchedReader, bytes: &[u8]) {
        let mut a = vec![0u8; 16];
        let mut b = vec![0u8; 100];
        let mut c = vec![0u8; 3];
        {
            let mut requests = vec![
                ReadRequest { offset: 0, buffer: &mut a },
                ReadRequest { offset: 500, buffer: &mut b },
                ReadRequest { offset: 997, buffer: &mut c },
            ];
            reader.read_all(&mut requests).unwrap();
        }
        assert_eq!(a, &bytes[0..16]);
        assert_eq!(b, &bytes[500..600]);
        assert_eq!(c, &bytes[997..1000]);
    }

    #[test]
    fn test_positional_reader() {
        let (file, bytes) = fixture(1000);
        let reader = PositionalReader::new(file.reopen().unwrap(), file.path(), 2);
        check_reader(&reader, &bytes);
    }

    #[test]
    fn test_platform_reader() {
        let (file, bytes) = fixture(1000);
        let reader = open_batched_reader(file.reopen().unwrap(), file.path(), 2);
        check_reader(reader.as_ref(), &bytes);
    }

    #[test]
    fn test_short_read_fails() {
        let (file, _) = fixture(64);
        let reader = open_batched_reader(file.reopen().unwrap(), file.path(), 8);
        let mut buffer = vec![0u8; 32];
        let mut requests = vec![ReadRequest { offset: 48, buffer: &mut buffer }];
        let err = reader.read_all(&mut requests).unwrap_err();
        assert!(matches!(err, ReportError::Io { kind: std::io::ErrorKind::UnexpectedEof, .. }));
    }
}
