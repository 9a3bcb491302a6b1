//! # Stdio routing
//!
//! Routes the module's stdout and stderr to host callbacks. The module writes
//! through `wasi_snapshot_preview1.fd_write`; descriptors 1 and 2 are split into
//! lines and handed to `print` / `print_err`. A line may arrive over several
//! writes, so each stream buffers its unterminated tail until the newline.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use wasmtime::Caller;
use wasmtime::Linker;

use crate::host::Result;
use crate::runtime::HostCtx;
use crate::runtime::read_guest;
use crate::runtime::write_guest;

const WASI_NAMESPACE: &str = "wasi_snapshot_preview1";
const ERRNO_SUCCESS: i32 = 0;
const ERRNO_BADF: i32 = 8;

/// Callback receiving one line of module output.
pub type PrintFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Output callbacks for the module's standard streams. Clones share the
/// pending partial lines.
#[derive(Clone)]
pub struct Stdio {
    print: PrintFn,
    print_err: PrintFn,
    /// Unterminated output of stdout and stderr, in that order.
    pending: Arc<Mutex<[Vec<u8>; 2]>>,
}

impl Stdio {
    pub fn new(
        print: impl Fn(&str) + Send + Sync + 'static,
        print_err: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        Self {
            print: Arc::new(print),
            print_err: Arc::new(print_err),
            pending: Arc::new(Mutex::new([Vec::new(), Vec::new()])),
        }
    }

    pub fn print(&self, line: &str) {
        (self.print)(line)
    }

    pub fn print_err(&self, line: &str) {
        (self.print_err)(line)
    }

    fn sink(&self, stream: usize) -> &PrintFn {
        match stream {
            0 => &self.print,
            _ => &self.print_err,
        }
    }

    /// Routes a raw write to the matching callback, one call per completed
    /// line. Returns false for descriptors other than stdout and stderr.
    pub fn write(&self, fd: i32, bytes: &[u8]) -> bool {
        let stream = match fd {
            1 => 0,
            2 => 1,
            _ => return false,
        };
        let lines = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let buffer = &mut pending[stream];
            buffer.extend_from_slice(bytes);
            match buffer.iter().rposition(|&b| b == b'\n') {
                Some(end) => {
                    let rest = buffer.split_off(end + 1);
                    let mut complete = std::mem::replace(buffer, rest);
                    complete.pop();
                    complete
                }
                None => return true,
            }
        };
        // Callbacks run without the lock held.
        let sink = self.sink(stream);
        for line in lines.split(|&b| b == b'\n') {
            sink(&String::from_utf8_lossy(line));
        }
        true
    }

    /// Emits whatever partial lines are still buffered.
    pub fn flush(&self) {
        let tails = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            [std::mem::take(&mut pending[0]), std::mem::take(&mut pending[1])]
        };
        for (stream, tail) in tails.iter().enumerate() {
            if !tail.is_empty() {
                self.sink(stream)(&String::from_utf8_lossy(tail));
            }
        }
    }

    /// Links `fd_write`, shadowing any earlier definition.
    pub fn link(&self, linker: &mut Linker<HostCtx>) -> Result<()> {
        let stdio = self.clone();
        linker
            .func_wrap(
                WASI_NAMESPACE,
                "fd_write",
                move |mut caller: Caller<'_, HostCtx>,
                      fd: i32,
                      iovs: i32,
                      iovs_len: i32,
                      nwritten: i32|
                      -> wasmtime::Result<i32> {
                    let mut bytes = Vec::new();
                    for i in 0..iovs_len.max(0) as u32 {
                        let iov = read_guest(&mut caller, iovs as u32 + i * 8, 8)?;
                        let ptr = u32::from_le_bytes([iov[0], iov[1], iov[2], iov[3]]);
                        let len = u32::from_le_bytes([iov[4], iov[5], iov[6], iov[7]]);
                        bytes.extend(read_guest(&mut caller, ptr, len)?);
                    }
                    if !stdio.write(fd, &bytes) {
                        return Ok(ERRNO_BADF);
                    }
                    write_guest(&mut caller, nwritten as u32, &(bytes.len() as u32).to_le_bytes())?;
                    Ok(ERRNO_SUCCESS)
                },
            )
            .map_err(|e| crate::host::Error::Link(e.to_string()))?;
        Ok(())
    }
}

impl Default for Stdio {
    fn default() -> Self {
        Self::new(
            |line| tracing::info!(target: "duckrun::stdout", "{}", line),
            |line| tracing::warn!(target: "duckrun::stderr", "{}", line),
        )
    }
}

impl std::fmt::Debug for Stdio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stdio").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture() -> (Stdio, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let out = lines.clone();
        let err = lines.clone();
        let stdio = Stdio::new(
            move |line| out.lock().unwrap().push(format!("out: {}", line)),
            move |line| err.lock().unwrap().push(format!("err: {}", line)),
        );
        (stdio, lines)
    }

    #[test]
    fn splits_lines_per_stream() {
        let (stdio, lines) = capture();
        assert!(stdio.write(1, b"first\nsecond\n"));
        assert!(stdio.write(2, b"oops\n"));
        assert!(stdio.write(1, b"\n"));
        assert_eq!(
            *lines.lock().unwrap(),
            vec!["out: first", "out: second", "err: oops", "out: "]
        );
    }

    #[test]
    fn joins_lines_split_across_writes() {
        let (stdio, lines) = capture();
        let clone = stdio.clone();
        assert!(stdio.write(1, b"par"));
        assert!(stdio.write(2, b"warn"));
        assert!(lines.lock().unwrap().is_empty());

        assert!(clone.write(1, b"tial\nnext"));
        assert!(stdio.write(2, b"ing\n"));
        // A multi-byte character cut in half by the write boundary.
        assert!(stdio.write(1, &[b' ', 0xc3]));
        assert!(stdio.write(1, &[0xa9, b'\n']));
        assert_eq!(
            *lines.lock().unwrap(),
            vec!["out: partial", "err: warning", "out: next é"]
        );

        assert!(stdio.write(2, b"tail"));
        stdio.flush();
        stdio.flush();
        assert_eq!(lines.lock().unwrap().last().map(String::as_str), Some("err: tail"));
        assert_eq!(lines.lock().unwrap().len(), 4);
    }

    #[test]
    fn rejects_other_descriptors() {
        let (stdio, lines) = capture();
        assert!(!stdio.write(3, b"data"));
        assert!(lines.lock().unwrap().is_empty());
    }
}
