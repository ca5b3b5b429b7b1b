//! Pipes to the interpreter subprocess.
//!
//! The transport owns the child process and a buffered pipe in each
//! direction. Writes are buffered and flushed explicitly before every
//! blocking read; reads always fill the requested length or fail. Any
//! failure latches: once a send, flush or receive has gone wrong, every
//! later operation fails fast without touching the pipes again.

use std::{
    env,
    ffi::{OsStr, OsString},
    io::{BufReader, BufWriter, Read, Write},
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
};

use tracing::debug;

use crate::{error::TransportError, wire::WORD_SIZE};

/// The interpreter-side command servicer, passed via `-c`.
const SERVICE_SCRIPT: &str = include_str!("service.py");

/// Environment variables naming the interpreter, in precedence order.
const INTERPRETER_ENV: [&str; 2] = ["OPHIS_PYTHON", "PYTHON"];

/// Default interpreter when neither the caller nor the environment chose.
const DEFAULT_INTERPRETER: &str = "python3";

/// Byte the service writes once it is ready to take commands.
const HELLO: u8 = b'+';

pub(crate) struct Transport {
    child: Child,
    writer: Option<BufWriter<ChildStdin>>,
    reader: Option<BufReader<ChildStdout>>,
    poisoned: bool,
    reaped: bool,
}

impl Transport {
    /// Spawns the interpreter and performs the startup handshake.
    ///
    /// The service receives its stdin/stdout as the command pipe pair, so
    /// the read-fd/write-fd arguments are fixed at 0 and 1; the script
    /// re-routes the stdio descriptors away from the protocol on its side.
    ///
    /// # Errors
    /// `Spawn` if the interpreter cannot be executed, `Handshake` if the
    /// first byte out of it is not the ready marker.
    pub(crate) fn spawn(interpreter: Option<&OsStr>) -> Result<Self, TransportError> {
        let program = interpreter.map(OsString::from).unwrap_or_else(resolve_interpreter);
        debug!(interpreter = ?program, word_size = WORD_SIZE as u64, "starting interpreter subprocess");
        let mut child = Command::new(&program)
            .arg("-c")
            .arg(SERVICE_SCRIPT)
            .arg("0")
            .arg("1")
            .arg(WORD_SIZE.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(TransportError::Spawn)?;

        // Stdio::piped always populates these on a freshly spawned child.
        let stdin = child.stdin.take().expect("child stdin requested as piped");
        let stdout = child.stdout.take().expect("child stdout requested as piped");
        let mut transport = Self {
            child,
            writer: Some(BufWriter::new(stdin)),
            reader: Some(BufReader::new(stdout)),
            poisoned: false,
            reaped: false,
        };

        let mut hello = [0u8; 1];
        match transport.recv_exact(&mut hello) {
            Ok(()) if hello[0] == HELLO => Ok(transport),
            _ => {
                // Failed before it started; reap so no child lingers. The
                // script exits on its own once the pipes close.
                transport.writer = None;
                transport.reader = None;
                transport.reaped = true;
                let _ = transport.child.wait();
                Err(TransportError::Handshake)
            }
        }
    }

    /// Queues bytes on the outbound pipe.
    pub(crate) fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let writer = self.usable_writer()?;
        if let Err(error) = writer.write_all(bytes) {
            self.poisoned = true;
            return Err(TransportError::Io(error));
        }
        Ok(())
    }

    /// Pushes queued bytes out. Must precede every blocking receive.
    pub(crate) fn flush(&mut self) -> Result<(), TransportError> {
        let writer = self.usable_writer()?;
        if let Err(error) = writer.flush() {
            self.poisoned = true;
            return Err(TransportError::Io(error));
        }
        Ok(())
    }

    /// Reads exactly `buffer.len()` bytes, failing on a short stream.
    pub(crate) fn recv_exact(&mut self, buffer: &mut [u8]) -> Result<(), TransportError> {
        if self.poisoned {
            return Err(TransportError::Poisoned);
        }
        let Some(reader) = self.reader.as_mut() else {
            return Err(TransportError::Poisoned);
        };
        if let Err(error) = reader.read_exact(buffer) {
            self.poisoned = true;
            return Err(TransportError::Io(error));
        }
        Ok(())
    }

    /// Closes both pipe ends and waits for the subprocess.
    ///
    /// # Errors
    /// `Exit` unless the child exited with status 0. The transport is
    /// unusable afterwards either way.
    pub(crate) fn quit(&mut self) -> Result<(), TransportError> {
        self.writer = None;
        self.reader = None;
        self.poisoned = true;
        self.reaped = true;
        let status = self.child.wait().map_err(TransportError::Io)?;
        debug!(?status, "interpreter subprocess finished");
        if status.success() {
            Ok(())
        } else {
            Err(TransportError::Exit(status.code()))
        }
    }

    /// Identifier of the interpreter subprocess.
    pub(crate) fn child_id(&self) -> u32 {
        self.child.id()
    }

    /// Latches the error flag without an I/O event, used when a received
    /// frame is malformed and the stream position is no longer trustable.
    pub(crate) fn poison(&mut self) {
        self.poisoned = true;
    }

    fn usable_writer(&mut self) -> Result<&mut BufWriter<ChildStdin>, TransportError> {
        if self.poisoned {
            return Err(TransportError::Poisoned);
        }
        self.writer.as_mut().ok_or(TransportError::Poisoned)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if !self.reaped {
            // Closing the command pipe makes the service exit promptly, so
            // the wait is bounded. Reaping here keeps zombies away even on
            // panic unwinds that skip the session-level termination.
            self.writer = None;
            self.reader = None;
            let _ = self.child.wait();
        }
    }
}

fn resolve_interpreter() -> OsString {
    for name in INTERPRETER_ENV {
        if let Some(value) = env::var_os(name) {
            if !value.is_empty() {
                return value;
            }
        }
    }
    OsString::from(DEFAULT_INTERPRETER)
}
