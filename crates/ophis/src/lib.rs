//! Drive a CPython subprocess as if its objects were native.
//!
//! `ophis` starts a Python interpreter in a child process and talks to it
//! over a pair of pipes with a compact request/response protocol. Every
//! interpreter value the host touches is represented by a small move-only
//! proxy ([`PyRef`]); operations on the proxy — attribute access, calls,
//! arithmetic, iteration, conversion — become protocol messages whose
//! results come back as new proxies.
//!
//! ```no_run
//! use ophis::Session;
//!
//! fn main() -> ophis::Result<()> {
//!     let py = Session::new()?;
//!     let sorted = py.global("builtins.sorted")?;
//!     let range = py.global("builtins.range")?.call1(10isize)?;
//!     for item in sorted.call1(range)?.iter()? {
//!         println!("{}", item?.to_int()?);
//!     }
//!     py.terminate()
//! }
//! ```
//!
//! Control alternates strictly between the two processes. While the host
//! awaits a reply it services interleaved calls back into host-exposed
//! functions, so either side may call into the other to any depth; see
//! [`Session::function`]. Host errors that cross into the interpreter and
//! back are re-raised by identity ([`Error::host`]).
//!
//! A session is single-threaded and a transport failure is terminal: once
//! the subprocess dies or a pipe breaks, every operation on the session
//! reports the failure.

mod args;
mod error;
mod exports;
mod hexfloat;
mod pyref;
mod session;
mod transport;
mod wire;

pub use crate::{
    args::CallArgs,
    error::{Error, HostError, PyException, Result, TransportError},
    pyref::{IntoPy, PyIter, PyRef, PyVal},
    session::Session,
    wire::RemoteIndex,
};
