//! The bridge session: dispatcher, command primitives and lifecycle.
//!
//! A session owns the interpreter subprocess, the export table and a cache
//! of interpreter globals looked up once at startup. Control alternates
//! strictly between the two processes: the host issues a command and then
//! loops on inbound frames until the terminal return or exception arrives,
//! servicing interleaved host-function calls and drop notifications along
//! the way. The loop is reentrant across host/interpreter stack frames —
//! a host function invoked mid-dispatch may drive arbitrarily deep nested
//! commands — but the session is strictly single-threaded.

use std::{
    cell::{Cell, OnceCell, RefCell},
    ffi::OsStr,
    rc::Rc,
};

use tracing::{debug, trace};

use crate::{
    args::CallArgs,
    error::{Error, HostError, PyException, Result, TransportError},
    exports::{ExportSlot, ExportTable, HostIndex},
    pyref::{IntoPy, PyRef},
    transport::Transport,
    wire::{pack_frame, unpack_word, Opcode, RemoteIndex, FRAME_SIZE, QUIT_SENTINEL, WORD_SIZE},
};

/// Python type name of the designated tunnel exception.
const TUNNEL_TYPE_NAME: &str = "HostError";

/// Interpreter globals cached at session startup.
///
/// One lookup per field keeps the protocol free of arithmetic and
/// attribute opcodes: applying an operator is an ordinary remote call
/// against the cached `operator` function.
macro_rules! prelude {
    ($($field:ident: $qualname:literal,)*) => {
        pub(crate) struct Prelude {
            $(pub(crate) $field: PyRef,)*
            /// `type("HostError", (BaseException,), {})`, minted once; host
            /// errors cross the interpreter wrapped in an instance of it.
            pub(crate) tunnel_exc: PyRef,
        }

        impl Prelude {
            fn load(session: &Session) -> Result<Self> {
                $(let $field = session.cmd_make_global($qualname)?;)*
                let tunnel_exc = mint_tunnel_type(session)?;
                Ok(Self { $($field,)* tunnel_exc })
            }
        }
    };
}

prelude! {
    none: "builtins.None",
    true_: "builtins.True",
    false_: "builtins.False",
    stop_iteration: "builtins.StopIteration",
    type_: "builtins.type",
    bool_: "builtins.bool",
    int_: "builtins.int",
    str_: "builtins.str",
    list_: "builtins.list",
    dict_: "builtins.dict",
    repr_: "builtins.repr",
    iter_: "builtins.iter",
    next_: "builtins.next",
    len_: "builtins.len",
    isinstance_: "builtins.isinstance",
    getattr_: "builtins.getattr",
    setattr_: "builtins.setattr",
    delattr_: "builtins.delattr",
    hasattr_: "builtins.hasattr",
    float_hex: "builtins.float.hex",
    float_fromhex: "builtins.float.fromhex",
    list_append: "builtins.list.append",
    list_extend: "builtins.list.extend",
    dict_update: "builtins.dict.update",
    op_contains: "operator.contains",
    op_getitem: "operator.getitem",
    op_setitem: "operator.setitem",
    op_delitem: "operator.delitem",
    op_lt: "operator.lt",
    op_le: "operator.le",
    op_eq: "operator.eq",
    op_ne: "operator.ne",
    op_ge: "operator.ge",
    op_gt: "operator.gt",
    op_not: "operator.not_",
    op_is: "operator.is_",
    op_is_not: "operator.is_not",
    op_invert: "operator.inv",
    op_neg: "operator.neg",
    op_pos: "operator.pos",
    op_add: "operator.add",
    op_and: "operator.and_",
    op_floordiv: "operator.floordiv",
    op_lshift: "operator.lshift",
    op_mod: "operator.mod",
    op_mul: "operator.mul",
    op_matmul: "operator.matmul",
    op_or: "operator.or_",
    op_pow: "operator.pow",
    op_rshift: "operator.rshift",
    op_sub: "operator.sub",
    op_truediv: "operator.truediv",
    op_xor: "operator.xor",
    op_iadd: "operator.iadd",
    op_iand: "operator.iand",
    op_ifloordiv: "operator.ifloordiv",
    op_ilshift: "operator.ilshift",
    op_imod: "operator.imod",
    op_imul: "operator.imul",
    op_imatmul: "operator.imatmul",
    op_ior: "operator.ior",
    op_ipow: "operator.ipow",
    op_irshift: "operator.irshift",
    op_isub: "operator.isub",
    op_itruediv: "operator.itruediv",
    op_ixor: "operator.ixor",
}

/// `type("HostError", (BaseException,), {})`: the one remote type minted at
/// startup whose instances carry a host error across interpreter frames.
fn mint_tunnel_type(session: &Session) -> Result<PyRef> {
    let base_exception = session.cmd_make_global("builtins.BaseException")?;
    let type_fn = session.cmd_make_global("builtins.type")?;
    let dict_fn = session.cmd_make_global("builtins.dict")?;
    let name = session.cmd_make_str(TUNNEL_TYPE_NAME)?;
    let bases = session.cmd_make_tuple(&[base_exception.index()])?;
    let namespace = session.cmd_call(dict_fn.index(), &[])?;
    session.cmd_call(type_fn.index(), &[name.index(), bases.index(), namespace.index()])
}

/// Shared state behind every [`Session`] handle and proxy back-reference.
pub(crate) struct SessionInner {
    transport: RefCell<Transport>,
    exports: RefCell<ExportTable>,
    terminated: Cell<bool>,
    prelude: OnceCell<Prelude>,
}

impl SessionInner {
    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.get()
    }

    /// Queues a drop frame without flushing; used by proxy destructors.
    pub(crate) fn queue_drop(&self, index: RemoteIndex) -> Result<(), TransportError> {
        trace!(index = index.raw(), "queue drop");
        self.transport.borrow_mut().send(&pack_frame(Opcode::DelPtr, index.raw()))
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if self.terminated.get() {
            return;
        }
        // Best-effort clean shutdown; this path must never panic. A failed
        // send is already latched, and Transport reaps the child on drop
        // either way.
        self.terminated.set(true);
        let transport = self.transport.get_mut();
        let _ = transport.send(&pack_frame(Opcode::Ret, QUIT_SENTINEL));
        let _ = transport.flush();
        let _ = transport.quit();
    }
}

/// A running interpreter subprocess and the host half of the bridge.
///
/// Handles are cheap to clone and all refer to one subprocess; the
/// subprocess is torn down when the last handle goes away (or earlier, via
/// [`terminate`](Self::terminate)). The session is single-threaded: it is
/// neither `Send` nor `Sync`, and proxies may only be used with the
/// session that produced them.
#[derive(Clone)]
pub struct Session {
    inner: Rc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    /// Starts an interpreter subprocess and readies the bridge.
    ///
    /// The interpreter binary comes from `$OPHIS_PYTHON`, then `$PYTHON`,
    /// then `python3`.
    ///
    /// # Errors
    /// Transport errors from spawning or the startup handshake, or any
    /// failure while caching the startup globals.
    pub fn new() -> Result<Self> {
        Self::start(None)
    }

    /// Like [`new`](Self::new) with an explicit interpreter binary.
    pub fn with_interpreter(interpreter: impl AsRef<OsStr>) -> Result<Self> {
        Self::start(Some(interpreter.as_ref()))
    }

    fn start(interpreter: Option<&OsStr>) -> Result<Self> {
        let transport = Transport::spawn(interpreter)?;
        let session = Self {
            inner: Rc::new(SessionInner {
                transport: RefCell::new(transport),
                exports: RefCell::new(ExportTable::new()),
                terminated: Cell::new(false),
                prelude: OnceCell::new(),
            }),
        };
        let prelude = Prelude::load(&session)?;
        let _ = session.inner.prelude.set(prelude);
        debug!("session ready");
        Ok(session)
    }

    pub(crate) fn from_inner(inner: Rc<SessionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Rc<SessionInner> {
        &self.inner
    }

    // ---- lifecycle ----

    /// Shuts the interpreter down cleanly.
    ///
    /// Idempotent: terminating an already-terminated session is a no-op.
    /// After success every proxy destructor is inert and every
    /// remote-interacting operation fails with a transport error.
    ///
    /// # Errors
    /// Transport errors from the final flush, or a nonzero interpreter
    /// exit status. The session counts as terminated even then.
    pub fn terminate(&self) -> Result<()> {
        if self.inner.terminated.get() {
            return Ok(());
        }
        debug!("terminating session");
        let sent: Result<()> = (|| {
            self.send_frame(Opcode::Ret, QUIT_SENTINEL)?;
            self.flush()?;
            Ok(())
        })();
        self.inner.terminated.set(true);
        self.inner.exports.borrow_mut().clear();
        let quit = self.inner.transport.borrow_mut().quit();
        sent?;
        quit.map_err(Error::from)
    }

    /// True once [`terminate`](Self::terminate) has run (successfully or
    /// not). A session whose subprocess crashed is *not* terminated: its
    /// operations fail with transport errors instead.
    #[must_use]
    pub fn terminated(&self) -> bool {
        self.inner.terminated.get()
    }

    /// OS process id of the interpreter subprocess, for diagnostics.
    #[must_use]
    pub fn interpreter_pid(&self) -> u32 {
        self.inner.transport.borrow().child_id()
    }

    // ---- value creation ----

    /// Makes an interpreter integer.
    pub fn int(&self, value: isize) -> Result<PyRef> {
        self.cmd_make_int(value)
    }

    /// Makes an interpreter integer wider than the machine word, from its
    /// decimal spelling.
    pub fn big_int(&self, decimal: &str) -> Result<PyRef> {
        let digits = self.cmd_make_str(decimal)?;
        self.apply(|p| &p.int_, &[digits.index()])
    }

    /// Makes an interpreter float, bit-exactly, via its canonical
    /// hexadecimal spelling.
    pub fn float(&self, value: f64) -> Result<PyRef> {
        let text = self.cmd_make_str(&crate::hexfloat::format_hex(value))?;
        self.apply(|p| &p.float_fromhex, &[text.index()])
    }

    /// A fresh handle to `True` or `False`.
    pub fn bool(&self, value: bool) -> Result<PyRef> {
        let prelude = self.prelude()?;
        if value { prelude.true_.dup() } else { prelude.false_.dup() }
    }

    /// A fresh handle to `None`.
    pub fn none(&self) -> Result<PyRef> {
        self.prelude()?.none.dup()
    }

    /// Makes an interpreter `str`.
    pub fn str(&self, text: &str) -> Result<PyRef> {
        self.cmd_make_str(text)
    }

    /// Makes an interpreter `bytes`.
    pub fn bytes(&self, data: &[u8]) -> Result<PyRef> {
        self.cmd_make_bytes(data)
    }

    /// Makes a tuple of existing values.
    pub fn tuple(&self, items: &[&PyRef]) -> Result<PyRef> {
        let mut indices = Vec::with_capacity(items.len());
        for item in items {
            if !item.belongs_to(self) {
                return Err(Error::ForeignHandle);
            }
            indices.push(item.index());
        }
        self.cmd_make_tuple(&indices)
    }

    /// Makes a list of existing values.
    pub fn list(&self, items: &[&PyRef]) -> Result<PyRef> {
        let as_tuple = self.tuple(items)?;
        self.apply(|p| &p.list_, &[as_tuple.index()])
    }

    /// Makes an empty dict.
    pub fn dict(&self) -> Result<PyRef> {
        let dict_index = self.prelude()?.dict_.index();
        self.cmd_call(dict_index, &[])
    }

    /// Looks up a global by dotted path, e.g. `"sys.argv"` or
    /// `"operator.add"`. The longest importable prefix is imported and the
    /// remainder resolved as attributes; a trailing `.*` yields the module
    /// itself.
    pub fn global(&self, qualname: &str) -> Result<PyRef> {
        self.cmd_make_global(qualname)
    }

    /// Exposes a host function as an interpreter function object.
    ///
    /// The function receives owned proxies for its arguments and returns a
    /// value or fails; failures cross into the interpreter as exceptions
    /// (see [`Error::host`] for identity-preserving payloads). The
    /// function stays registered until the interpreter collects the
    /// function object.
    pub fn function<F>(&self, function: F) -> Result<PyRef>
    where
        F: Fn(&Session, Vec<PyRef>) -> Result<PyRef> + 'static,
    {
        let host_index = self
            .inner
            .exports
            .borrow_mut()
            .register(ExportSlot::Callable(Rc::new(function)));
        let wrapper = self.cmd_make_remote(host_index)?;
        self.cmd_lambda(wrapper.index())
    }

    /// Converts any convertible host value into a proxy.
    pub fn to_object<'a>(&self, value: impl IntoPy<'a>) -> Result<PyRef> {
        value.into_py(self)?.into_owned()
    }

    /// Starts building call arguments.
    #[must_use]
    pub fn args(&self) -> CallArgs<'_, '_> {
        CallArgs::new(self)
    }

    // ---- prelude helpers ----

    pub(crate) fn prelude(&self) -> Result<&Prelude> {
        self.inner
            .prelude
            .get()
            .ok_or_else(|| Error::Protocol("prelude used before initialization".to_owned()))
    }

    /// Calls a cached prelude function with raw argument indices.
    pub(crate) fn apply(
        &self,
        pick: impl for<'p> FnOnce(&'p Prelude) -> &'p PyRef,
        args: &[RemoteIndex],
    ) -> Result<PyRef> {
        let function = pick(self.prelude()?).index();
        self.cmd_call(function, args)
    }

    pub(crate) fn truthy_of(&self, index: RemoteIndex) -> Result<bool> {
        let as_bool = self.apply(|p| &p.bool_, &[index])?;
        Ok(self.cmd_get_int(as_bool.index())? != 0)
    }

    pub(crate) fn is_stop_iteration(&self, exception: &PyRef) -> Result<bool> {
        let verdict = {
            let prelude = self.prelude()?;
            let stop = prelude.stop_iteration.index();
            let isinstance = prelude.isinstance_.index();
            self.cmd_call(isinstance, &[exception.index(), stop])?
        };
        Ok(self.cmd_get_int(verdict.index())? != 0)
    }

    /// Reads a float value through its canonical hexadecimal spelling.
    pub(crate) fn read_float(&self, index: RemoteIndex) -> Result<f64> {
        let text = self.apply(|p| &p.float_hex, &[index])?;
        let spelling = String::from_utf8(self.cmd_get_bytes(text.index())?)
            .map_err(|_| self.protocol_fault("float.hex returned non-UTF-8 text".to_owned()))?;
        crate::hexfloat::parse_hex(&spelling)
            .ok_or_else(|| self.protocol_fault(format!("float.hex returned invalid text {spelling:?}")))
    }

    // ---- command primitives (one per outbound opcode) ----

    pub(crate) fn cmd_make_int(&self, value: isize) -> Result<PyRef> {
        self.send_frame(Opcode::MakeInt, value)?;
        self.wait_for_object()
    }

    pub(crate) fn cmd_make_bytes(&self, data: &[u8]) -> Result<PyRef> {
        self.send_frame(Opcode::MakeBytes, data.len() as isize)?;
        self.send_bytes(data)?;
        self.wait_for_object()
    }

    pub(crate) fn cmd_make_str(&self, text: &str) -> Result<PyRef> {
        self.send_frame(Opcode::MakeStr, text.len() as isize)?;
        self.send_bytes(text.as_bytes())?;
        self.wait_for_object()
    }

    pub(crate) fn cmd_make_tuple(&self, items: &[RemoteIndex]) -> Result<PyRef> {
        self.send_frame(Opcode::MakeTuple, items.len() as isize)?;
        for item in items {
            self.send_word(item.raw())?;
        }
        self.wait_for_object()
    }

    pub(crate) fn cmd_make_global(&self, qualname: &str) -> Result<PyRef> {
        self.send_frame(Opcode::MakeGlobal, qualname.len() as isize)?;
        self.send_bytes(qualname.as_bytes())?;
        self.wait_for_object()
    }

    pub(crate) fn cmd_make_remote(&self, host_index: HostIndex) -> Result<PyRef> {
        self.send_frame(Opcode::MakeRemote, host_index.raw() as isize)?;
        self.wait_for_object()
    }

    pub(crate) fn cmd_call(&self, function: RemoteIndex, args: &[RemoteIndex]) -> Result<PyRef> {
        self.send_frame(Opcode::Call, args.len() as isize)?;
        self.send_word(function.raw())?;
        for arg in args {
            self.send_word(arg.raw())?;
        }
        self.wait_for_object()
    }

    pub(crate) fn cmd_starcall(
        &self,
        function: RemoteIndex,
        args: RemoteIndex,
        kwargs: RemoteIndex,
    ) -> Result<PyRef> {
        self.send_frame(Opcode::Starcall, -1)?;
        self.send_word(function.raw())?;
        self.send_word(args.raw())?;
        self.send_word(kwargs.raw())?;
        self.wait_for_object()
    }

    pub(crate) fn cmd_lambda(&self, wrapper: RemoteIndex) -> Result<PyRef> {
        self.send_frame(Opcode::Lambda, wrapper.raw())?;
        self.wait_for_object()
    }

    pub(crate) fn cmd_dup(&self, index: RemoteIndex) -> Result<PyRef> {
        self.send_frame(Opcode::Dup, index.raw())?;
        self.wait_for_object()
    }

    pub(crate) fn cmd_get_int(&self, index: RemoteIndex) -> Result<isize> {
        self.send_frame(Opcode::GetInt, index.raw())?;
        self.wait_for_ret()
    }

    pub(crate) fn cmd_get_bytes(&self, index: RemoteIndex) -> Result<Vec<u8>> {
        self.send_frame(Opcode::GetBytes, index.raw())?;
        let length = self.wait_for_ret()?;
        let length = usize::try_from(length)
            .map_err(|_| self.protocol_fault(format!("negative payload length {length}")))?;
        self.recv_payload(length)
    }

    // ---- the dispatcher ----

    /// Loops on inbound frames until the awaited return or exception.
    ///
    /// Interleaved host-call and drop frames are serviced in place; a host
    /// call recurses through user code, which may issue further commands
    /// and re-enter this loop. Each nesting level consumes exactly the
    /// reply belonging to its own command, because the service replies in
    /// strict LIFO conversation order.
    fn wait_for_ret(&self) -> Result<isize> {
        loop {
            self.flush()?;
            let (byte, argument) = self.recv_frame()?;
            match Opcode::from_byte(byte) {
                Some(Opcode::HostCall) => self.service_call(argument)?,
                Some(Opcode::DelPtr) => self.release_export(argument)?,
                Some(Opcode::Ret) => return Ok(argument),
                Some(Opcode::Exc) => return Err(self.raise_remote(argument)),
                _ => {
                    return Err(self.protocol_fault(format!(
                        "service sent invalid frame byte {byte:#04x}"
                    )))
                }
            }
        }
    }

    fn wait_for_object(&self) -> Result<PyRef> {
        let raw = self.wait_for_ret()?;
        Ok(self.adopt(raw))
    }

    fn adopt(&self, raw: isize) -> PyRef {
        PyRef::adopt(&self.inner, RemoteIndex::new(raw))
    }

    /// Handles an inbound drop of a host-exposed value.
    fn release_export(&self, argument: isize) -> Result<()> {
        let index = usize::try_from(argument)
            .map_err(|_| self.protocol_fault(format!("negative host slot {argument}")))?;
        trace!(index, "service dropped host slot");
        self.inner
            .exports
            .borrow_mut()
            .release(HostIndex::new(index))
            .map_err(|error| self.fatalize(error))
    }

    /// Services one inbound call to a host-exposed function.
    ///
    /// The function consumes ownership of every argument proxy. Exactly
    /// one reply frame (return or exception) goes out before this returns,
    /// except on fatal transport/protocol failures, which propagate and
    /// end the conversation.
    fn service_call(&self, argument: isize) -> Result<()> {
        let host_index = usize::try_from(argument)
            .map_err(|_| self.protocol_fault(format!("negative host slot {argument}")))?;
        let count = self.recv_word()?;
        let count = usize::try_from(count)
            .map_err(|_| self.protocol_fault(format!("negative argument count {count}")))?;
        let mut arguments = Vec::with_capacity(count);
        for _ in 0..count {
            let raw = self.recv_word()?;
            arguments.push(self.adopt(raw));
        }
        trace!(host_index, count, "servicing host call");
        let function = self
            .inner
            .exports
            .borrow()
            .callable(HostIndex::new(host_index))
            .map_err(|error| self.fatalize(error))?;
        match function(self, arguments) {
            Ok(value) if value.belongs_to(self) => {
                let reply = self.send_frame(Opcode::Ret, value.index().raw());
                drop(value);
                reply
            }
            // A result minted by some other session must not leak its
            // index into this conversation.
            Ok(_) => self.tunnel_host_error(HostError::new(Error::ForeignHandle)),
            Err(Error::Raised(exception)) if exception.object().belongs_to(self) => {
                let object = exception.into_object();
                let reply = self.send_frame(Opcode::Exc, object.index().raw());
                drop(object);
                reply
            }
            Err(fatal @ (Error::Transport(_) | Error::Protocol(_))) => Err(fatal),
            Err(Error::Host(payload)) => self.tunnel_host_error(payload),
            Err(other) => self.tunnel_host_error(HostError::new(other)),
        }
    }

    /// Registers a host error, wraps it remotely in the tunnel exception
    /// type and sends it as the reply.
    fn tunnel_host_error(&self, payload: HostError) -> Result<()> {
        let host_index = self
            .inner
            .exports
            .borrow_mut()
            .register(ExportSlot::Exception(payload));
        let wrapper = self.cmd_make_remote(host_index)?;
        let tunnel = self.prelude()?.tunnel_exc.index();
        let exception = self.cmd_call(tunnel, &[wrapper.index()])?;
        self.send_frame(Opcode::Exc, exception.index().raw())
        // wrapper and exception drop here; their queued drop frames ride
        // along after the exception frame, which the service reads first.
    }

    /// Turns an inbound exception frame into the error to surface.
    fn raise_remote(&self, raw: isize) -> Error {
        let exception = self.adopt(raw);
        match self.classify_exception(exception) {
            Ok(error) | Err(error) => error,
        }
    }

    /// Distinguishes a tunneled host error from a genuine interpreter
    /// exception. For the latter the description is captured eagerly so it
    /// survives termination.
    fn classify_exception(&self, exception: PyRef) -> Result<Error, Error> {
        let Some(prelude) = self.inner.prelude.get() else {
            // Startup: no host function can have run yet, so the exception
            // cannot be a tunneled host error.
            let summary = self.bootstrap_summary(&exception);
            return Ok(Error::Raised(PyException::new(exception, summary)));
        };
        let ty = self.cmd_call(prelude.type_.index(), &[exception.index()])?;
        let same = self.cmd_call(prelude.op_is.index(), &[ty.index(), prelude.tunnel_exc.index()])?;
        if self.cmd_get_int(same.index())? != 0 {
            let args_name = self.cmd_make_str("args")?;
            let args = self
                .cmd_call(prelude.getattr_.index(), &[exception.index(), args_name.index()])?;
            let zero = self.cmd_make_int(0)?;
            let wrapper = self.cmd_call(prelude.op_getitem.index(), &[args.index(), zero.index()])?;
            let field = self.cmd_make_str("host_index")?;
            let slot = self.cmd_call(prelude.getattr_.index(), &[wrapper.index(), field.index()])?;
            let host_index = self.cmd_get_int(slot.index())?;
            let host_index = usize::try_from(host_index)
                .map_err(|_| self.protocol_fault(format!("negative host slot {host_index}")))?;
            let payload = self
                .inner
                .exports
                .borrow()
                .exception(HostIndex::new(host_index))
                .map_err(|error| self.fatalize(error))?;
            return Ok(Error::Host(payload));
        }
        let summary = match self.describe(&exception) {
            Ok(summary) => summary,
            Err(fatal @ Error::Transport(_)) => return Err(fatal),
            Err(_) => String::from("<repr unavailable>"),
        };
        Ok(Error::Raised(PyException::new(exception, summary)))
    }

    pub(crate) fn describe(&self, exception: &PyRef) -> Result<String> {
        let text = self.apply(|p| &p.repr_, &[exception.index()])?;
        String::from_utf8(self.cmd_get_bytes(text.index())?)
            .map_err(|_| Error::Protocol("repr returned non-UTF-8 text".to_owned()))
    }

    /// Exception description before the prelude exists, via a one-off
    /// `repr` lookup.
    fn bootstrap_summary(&self, exception: &PyRef) -> String {
        let attempt = || -> Result<String> {
            let repr_fn = self.cmd_make_global("builtins.repr")?;
            let text = self.cmd_call(repr_fn.index(), &[exception.index()])?;
            String::from_utf8(self.cmd_get_bytes(text.index())?)
                .map_err(|_| Error::Protocol("repr returned non-UTF-8 text".to_owned()))
        };
        attempt().unwrap_or_else(|_| String::from("<exception during session startup>"))
    }

    // ---- transport shims ----

    fn send_frame(&self, op: Opcode, arg: isize) -> Result<()> {
        if self.inner.terminated.get() {
            return Err(TransportError::Terminated.into());
        }
        trace!(op = <&'static str>::from(op), arg, "frame out");
        self.inner.transport.borrow_mut().send(&pack_frame(op, arg))?;
        Ok(())
    }

    fn send_word(&self, value: isize) -> Result<()> {
        self.inner
            .transport
            .borrow_mut()
            .send(&crate::wire::pack_word(value))?;
        Ok(())
    }

    fn send_bytes(&self, data: &[u8]) -> Result<()> {
        self.inner.transport.borrow_mut().send(data)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.inner.transport.borrow_mut().flush()?;
        Ok(())
    }

    fn recv_frame(&self) -> Result<(u8, isize)> {
        let mut frame = [0u8; FRAME_SIZE];
        self.inner.transport.borrow_mut().recv_exact(&mut frame)?;
        let mut word = [0u8; WORD_SIZE];
        word.copy_from_slice(&frame[1..]);
        let argument = unpack_word(word);
        trace!(byte = frame[0], argument, "frame in");
        Ok((frame[0], argument))
    }

    fn recv_word(&self) -> Result<isize> {
        let mut word = [0u8; WORD_SIZE];
        self.inner.transport.borrow_mut().recv_exact(&mut word)?;
        Ok(unpack_word(word))
    }

    fn recv_payload(&self, length: usize) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; length];
        self.inner.transport.borrow_mut().recv_exact(&mut payload)?;
        Ok(payload)
    }

    /// Latches the transport and reports a protocol error: after a
    /// malformed frame the stream position is unknowable, so the session
    /// is done for.
    fn protocol_fault(&self, detail: String) -> Error {
        self.inner.transport.borrow_mut().poison();
        Error::Protocol(detail)
    }

    /// Latches the transport when `error` is protocol-class.
    fn fatalize(&self, error: Error) -> Error {
        if matches!(error, Error::Protocol(_)) {
            self.inner.transport.borrow_mut().poison();
        }
        error
    }
}
