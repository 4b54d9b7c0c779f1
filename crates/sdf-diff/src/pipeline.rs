//! Producer/consumer send pipeline.
//!
//! The producer runs on the calling thread (for the real diff it sits
//! in the blocking send ioctl) and writes the stream into an anonymous
//! pipe. A scoped consumer thread drives the stream parser off the
//! read end, polling a cooperative cancellation flag between commands.
//! The write end closes when the producer returns (success or not),
//! which surfaces end-of-stream to the consumer; the read end closes
//! when the consumer exits. Both closures hold on every path.

use sdf_error::{Result, SdfError};
use sdf_kernel::create_pipe;
use sdf_sendstream::{StreamHandler, StreamProgress, StreamReader};
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, error};

/// Cooperative cancellation shared between the caller and the consumer.
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Run one send/parse cycle.
///
/// `producer` receives the pipe's write end and owns it for its whole
/// run; the kernel producer issues the send ioctl against it, tests
/// write synthetic streams. Succeeds iff the producer succeeded AND the
/// consumer reached end-of-stream. Consumer panics are contained and
/// reported as `SendReceive`.
pub fn run_pipeline<P, H>(producer: P, handler: &mut H, cancel: &CancelFlag) -> Result<()>
where
    P: FnOnce(OwnedFd) -> io::Result<()>,
    H: StreamHandler + Send,
{
    let (read_end, write_end) =
        create_pipe().map_err(|err| SdfError::SendReceive(format!("pipe creation failed: {err}")))?;

    let (produced, consumed) = thread::scope(|scope| {
        let consumer = scope.spawn(move || -> Result<()> {
            let mut reader = StreamReader::new(File::from(read_end));
            loop {
                if cancel.is_cancelled() {
                    return Err(SdfError::SendReceive("diff cancelled".into()));
                }
                match reader.poll_next(handler)? {
                    StreamProgress::Handled => {}
                    StreamProgress::End => return Ok(()),
                }
            }
        });

        // The producer owns the write end; returning from it closes the
        // pipe and unblocks the consumer's final read.
        let produced = producer(write_end);
        (produced, consumer.join())
    });

    let consumed = match consumed {
        Ok(result) => result,
        Err(_) => Err(SdfError::SendReceive("stream consumer panicked".into())),
    };

    match (produced, consumed) {
        (Ok(()), Ok(())) => {
            debug!("send stream drained");
            Ok(())
        }
        (Err(err), _) => {
            error!(%err, "send request failed");
            Err(SdfError::SendReceive(format!("send request failed: {err}")))
        }
        (Ok(()), Err(err)) => {
            error!(%err, "stream processing failed");
            Err(SdfError::SendReceive(format!(
                "stream processing failed: {err}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdf_sendstream::testing::{command, stream, tlv};
    use sdf_types::{SEND_A_PATH, SEND_C_END, SEND_C_MKFILE};
    use std::io::Write;

    #[derive(Default)]
    struct Collector {
        created: Vec<String>,
    }

    impl StreamHandler for Collector {
        fn mkfile(&mut self, path: &str) -> Result<()> {
            self.created.push(path.to_owned());
            Ok(())
        }
    }

    fn write_all(fd: OwnedFd, bytes: &[u8]) -> io::Result<()> {
        let mut file = File::from(fd);
        file.write_all(bytes)
    }

    #[test]
    fn producer_and_consumer_meet_over_the_pipe() {
        let bytes = stream(&[
            command(SEND_C_MKFILE, &[tlv(SEND_A_PATH, b"a")]),
            command(SEND_C_MKFILE, &[tlv(SEND_A_PATH, b"b")]),
            command(SEND_C_END, &[]),
        ]);
        let mut handler = Collector::default();
        run_pipeline(|fd| write_all(fd, &bytes), &mut handler, &CancelFlag::new())
            .expect("pipeline");
        assert_eq!(handler.created, vec!["a", "b"]);
    }

    #[test]
    fn closed_write_end_terminates_without_end_command() {
        let bytes = stream(&[command(SEND_C_MKFILE, &[tlv(SEND_A_PATH, b"a")])]);
        let mut handler = Collector::default();
        run_pipeline(|fd| write_all(fd, &bytes), &mut handler, &CancelFlag::new())
            .expect("pipeline");
        assert_eq!(handler.created, vec!["a"]);
    }

    #[test]
    fn producer_error_wins_and_is_send_receive() {
        let mut handler = Collector::default();
        let err = run_pipeline(
            |fd| {
                drop(fd);
                Err(io::Error::other("send ioctl: EPERM"))
            },
            &mut handler,
            &CancelFlag::new(),
        )
        .unwrap_err();
        assert!(matches!(err, SdfError::SendReceive(_)));
        assert!(err.to_string().contains("send request failed"));
    }

    #[test]
    fn corrupt_stream_fails_the_pipeline() {
        let mut bytes = stream(&[
            command(SEND_C_MKFILE, &[tlv(SEND_A_PATH, b"a")]),
            command(SEND_C_END, &[]),
        ]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let mut handler = Collector::default();
        let err = run_pipeline(|fd| write_all(fd, &bytes), &mut handler, &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, SdfError::SendReceive(_)));
    }

    #[test]
    fn pre_cancelled_pipeline_reports_cancellation() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let bytes = stream(&[command(SEND_C_END, &[])]);
        let mut handler = Collector::default();
        let err =
            run_pipeline(|fd| write_all(fd, &bytes), &mut handler, &cancel).unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[test]
    fn consumer_panic_is_contained() {
        struct Panicker;
        impl StreamHandler for Panicker {
            fn mkfile(&mut self, _path: &str) -> Result<()> {
                panic!("handler blew up");
            }
        }
        let bytes = stream(&[
            command(SEND_C_MKFILE, &[tlv(SEND_A_PATH, b"a")]),
            command(SEND_C_END, &[]),
        ]);
        let mut handler = Panicker;
        let err = run_pipeline(
            |fd| {
                // EPIPE from the dead consumer is acceptable here; the
                // pipeline must still settle and report an error.
                let _ = write_all(fd, &bytes);
                Ok(())
            },
            &mut handler,
            &CancelFlag::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }
}
