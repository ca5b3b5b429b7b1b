//! Proxies for interpreter-side values.
//!
//! A [`PyRef`] owns exactly one live slot in the service's object table and
//! a weak back-reference to the session that minted it. Proxies are
//! move-only: duplicating the underlying reference is an explicit, visible
//! operation ([`PyRef::dup`]) because it costs a protocol round trip.
//! Dropping a proxy queues a drop frame; the queue rides along with the
//! next command, and because frame payloads are built only from
//! already-resolved indices, destructors can never fire in the middle of a
//! frame.
//!
//! Proxies never keep their session alive. Once the session terminates or
//! every owning handle is gone, a proxy degrades to inert: its destructor
//! does nothing and remote-interacting methods fail with a transport
//! error. This is what lets an exception proxy caught from the last
//! operation before shutdown be destroyed safely afterwards.

use std::{
    fmt,
    rc::{Rc, Weak},
};

use crate::{
    args::{CallArgs, CallPlan},
    error::{Error, Result, TransportError},
    session::{Prelude, Session, SessionInner},
    wire::RemoteIndex,
};

/// Move-only handle to a value owned by the interpreter subprocess.
pub struct PyRef {
    session: Weak<SessionInner>,
    index: RemoteIndex,
}

impl PyRef {
    pub(crate) fn adopt(session: &Rc<SessionInner>, index: RemoteIndex) -> Self {
        Self { session: Rc::downgrade(session), index }
    }

    pub(crate) fn index(&self) -> RemoteIndex {
        self.index
    }

    /// The wire token naming this value in the service's object table.
    /// Opaque; exposed for diagnostics only.
    #[must_use]
    pub fn remote_index(&self) -> RemoteIndex {
        self.index
    }

    /// True iff this proxy was minted by `session`.
    pub(crate) fn belongs_to(&self, session: &Session) -> bool {
        std::ptr::eq(self.session.as_ptr(), Rc::as_ptr(session.inner()))
    }

    /// The owning session, revived from the back-reference.
    ///
    /// # Errors
    /// Transport error once every owning [`Session`] handle is gone.
    pub fn session(&self) -> Result<Session> {
        self.session
            .upgrade()
            .map(Session::from_inner)
            .ok_or(Error::Transport(TransportError::Terminated))
    }

    /// Duplicates the handle: a second, independently owned reference to
    /// the same interpreter object.
    pub fn dup(&self) -> Result<PyRef> {
        self.session()?.cmd_dup(self.index)
    }

    // ---- reads ----

    /// Reads the value as an integer. The interpreter raises for
    /// non-integers.
    pub fn to_int(&self) -> Result<isize> {
        let session = self.session()?;
        session.cmd_get_int(self.index)
    }

    /// Reads the value as bytes; `str` values arrive UTF-8 encoded.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let session = self.session()?;
        session.cmd_get_bytes(self.index)
    }

    /// Reads a `str` (or `bytes`) value as text.
    pub fn to_text(&self) -> Result<String> {
        String::from_utf8(self.to_bytes()?)
            .map_err(|_| Error::Protocol("service returned text that is not UTF-8".to_owned()))
    }

    /// Reads the value as a float, bit-exactly, via its canonical
    /// hexadecimal spelling.
    pub fn to_f64(&self) -> Result<f64> {
        let session = self.session()?;
        session.read_float(self.index)
    }

    /// Python truthiness of the value.
    pub fn truthy(&self) -> Result<bool> {
        let session = self.session()?;
        session.truthy_of(self.index)
    }

    // ---- protocol-level builtins ----

    /// `str(self)`, as a new proxy.
    pub fn str_(&self) -> Result<PyRef> {
        self.via_prelude(|p| &p.str_, &[])
    }

    /// `repr(self)`, as a new proxy.
    pub fn repr(&self) -> Result<PyRef> {
        self.via_prelude(|p| &p.repr_, &[])
    }

    /// `type(self)`, as a new proxy.
    pub fn type_(&self) -> Result<PyRef> {
        self.via_prelude(|p| &p.type_, &[])
    }

    /// `len(self)`.
    pub fn len(&self) -> Result<isize> {
        self.via_prelude(|p| &p.len_, &[])?.to_int()
    }

    /// Starts iteration over the value per the iterator protocol. The
    /// yielded stream ends cleanly when the interpreter raises
    /// `StopIteration`.
    pub fn iter(&self) -> Result<PyIter> {
        Ok(PyIter { iterator: self.via_prelude(|p| &p.iter_, &[])? })
    }

    // ---- attributes and items ----

    /// `getattr(self, name)`.
    pub fn getattr<'a>(&self, name: impl IntoPy<'a>) -> Result<PyRef> {
        self.binary(|p| &p.getattr_, name)
    }

    /// `setattr(self, name, value)`.
    pub fn setattr<'a, 'b>(&self, name: impl IntoPy<'a>, value: impl IntoPy<'b>) -> Result<()> {
        self.ternary(|p| &p.setattr_, name, value).map(drop)
    }

    /// `delattr(self, name)`.
    pub fn delattr<'a>(&self, name: impl IntoPy<'a>) -> Result<()> {
        self.binary(|p| &p.delattr_, name).map(drop)
    }

    /// `hasattr(self, name)`.
    pub fn hasattr<'a>(&self, name: impl IntoPy<'a>) -> Result<bool> {
        self.binary(|p| &p.hasattr_, name)?.to_int().map(|flag| flag != 0)
    }

    /// `self[key]`.
    pub fn getitem<'a>(&self, key: impl IntoPy<'a>) -> Result<PyRef> {
        self.binary(|p| &p.op_getitem, key)
    }

    /// `self[key] = value`.
    pub fn setitem<'a, 'b>(&self, key: impl IntoPy<'a>, value: impl IntoPy<'b>) -> Result<()> {
        self.ternary(|p| &p.op_setitem, key, value).map(drop)
    }

    /// `del self[key]`.
    pub fn delitem<'a>(&self, key: impl IntoPy<'a>) -> Result<()> {
        self.binary(|p| &p.op_delitem, key).map(drop)
    }

    /// `item in self`.
    pub fn contains<'a>(&self, item: impl IntoPy<'a>) -> Result<bool> {
        self.binary(|p| &p.op_contains, item)?.to_int().map(|flag| flag != 0)
    }

    // ---- calls ----

    /// Calls the value with no arguments.
    pub fn call0(&self) -> Result<PyRef> {
        let session = self.session()?;
        session.cmd_call(self.index, &[])
    }

    /// Calls the value with one positional argument.
    pub fn call1<'a>(&self, argument: impl IntoPy<'a>) -> Result<PyRef> {
        let session = self.session()?;
        let argument = argument.into_py(&session)?;
        session.cmd_call(self.index, &[argument.index()])
    }

    /// Calls the value with built arguments; splats and keywords go
    /// through the starcall opcode, plain positionals through the call
    /// opcode.
    pub fn call(&self, arguments: CallArgs<'_, '_>) -> Result<PyRef> {
        let session = self.session()?;
        if !Rc::ptr_eq(arguments.session().inner(), session.inner()) {
            return Err(Error::ForeignHandle);
        }
        match arguments.finish()? {
            CallPlan::Positional(values) => {
                let indices: Vec<RemoteIndex> = values.iter().map(PyVal::index).collect();
                let result = session.cmd_call(self.index, &indices);
                drop(values);
                result
            }
            CallPlan::Star { seq, kwargs } => {
                session.cmd_starcall(self.index, seq.index(), kwargs.index())
            }
        }
    }

    /// Looks up a method by name and calls it with no arguments.
    pub fn method0(&self, name: &str) -> Result<PyRef> {
        self.getattr(name)?.call0()
    }

    /// Looks up a method by name and calls it with one argument.
    pub fn method1<'a>(&self, name: &str, argument: impl IntoPy<'a>) -> Result<PyRef> {
        self.getattr(name)?.call1(argument)
    }

    /// Looks up a method by name and calls it with built arguments.
    pub fn method(&self, name: &str, arguments: CallArgs<'_, '_>) -> Result<PyRef> {
        self.getattr(name)?.call(arguments)
    }

    // ---- identity ----

    /// `self is other`.
    pub fn is_(&self, other: &PyRef) -> Result<bool> {
        self.binary(|p| &p.op_is, other)?.to_int().map(|flag| flag != 0)
    }

    /// `self is not other`.
    pub fn is_not(&self, other: &PyRef) -> Result<bool> {
        self.binary(|p| &p.op_is_not, other)?.to_int().map(|flag| flag != 0)
    }

    // ---- unary operators ----

    /// `~self`.
    pub fn invert(&self) -> Result<PyRef> {
        self.via_prelude(|p| &p.op_invert, &[])
    }

    /// `-self`.
    pub fn neg(&self) -> Result<PyRef> {
        self.via_prelude(|p| &p.op_neg, &[])
    }

    /// `+self`.
    pub fn pos(&self) -> Result<PyRef> {
        self.via_prelude(|p| &p.op_pos, &[])
    }

    /// `not self`.
    pub fn not_(&self) -> Result<PyRef> {
        self.via_prelude(|p| &p.op_not, &[])
    }

    // ---- plumbing ----

    /// Applies a cached prelude function to `self` plus `extra` indices.
    fn via_prelude(
        &self,
        pick: impl for<'p> FnOnce(&'p Prelude) -> &'p PyRef,
        extra: &[RemoteIndex],
    ) -> Result<PyRef> {
        let session = self.session()?;
        let mut indices = Vec::with_capacity(1 + extra.len());
        indices.push(self.index);
        indices.extend_from_slice(extra);
        session.apply(pick, &indices)
    }

    fn binary<'a>(
        &self,
        pick: impl for<'p> FnOnce(&'p Prelude) -> &'p PyRef,
        rhs: impl IntoPy<'a>,
    ) -> Result<PyRef> {
        let session = self.session()?;
        let rhs = rhs.into_py(&session)?;
        let result = session.apply(pick, &[self.index, rhs.index()]);
        drop(rhs);
        result
    }

    fn ternary<'a, 'b>(
        &self,
        pick: impl for<'p> FnOnce(&'p Prelude) -> &'p PyRef,
        second: impl IntoPy<'a>,
        third: impl IntoPy<'b>,
    ) -> Result<PyRef> {
        let session = self.session()?;
        let second = second.into_py(&session)?;
        let third = third.into_py(&session)?;
        let result = session.apply(pick, &[self.index, second.index(), third.index()]);
        drop(second);
        drop(third);
        result
    }
}

/// Binary operators forwarded to cached `operator` module functions.
macro_rules! forward_binary {
    ($($(#[$doc:meta])* $method:ident => $field:ident,)*) => {
        impl PyRef {
            $(
                $(#[$doc])*
                pub fn $method<'a>(&self, rhs: impl IntoPy<'a>) -> Result<PyRef> {
                    self.binary(|p| &p.$field, rhs)
                }
            )*
        }
    };
}

/// In-place operators; these consume the handle and hand back the updated
/// value, mirroring Python's `x op= y` rebinding.
macro_rules! forward_inplace {
    ($($(#[$doc:meta])* $method:ident => $field:ident,)*) => {
        impl PyRef {
            $(
                $(#[$doc])*
                pub fn $method<'a>(self, rhs: impl IntoPy<'a>) -> Result<PyRef> {
                    self.binary(|p| &p.$field, rhs)
                }
            )*
        }
    };
}

forward_binary! {
    /// `self < rhs`.
    lt => op_lt,
    /// `self <= rhs`.
    le => op_le,
    /// `self == rhs`.
    eq_ => op_eq,
    /// `self != rhs`.
    ne_ => op_ne,
    /// `self >= rhs`.
    ge => op_ge,
    /// `self > rhs`.
    gt => op_gt,
    /// `self + rhs`.
    add => op_add,
    /// `self & rhs`.
    and_ => op_and,
    /// `self // rhs`.
    floordiv => op_floordiv,
    /// `self << rhs`.
    lshift => op_lshift,
    /// `self % rhs`.
    mod_ => op_mod,
    /// `self * rhs`.
    mul => op_mul,
    /// `self @ rhs`.
    matmul => op_matmul,
    /// `self | rhs`.
    or_ => op_or,
    /// `self ** rhs`.
    pow => op_pow,
    /// `self >> rhs`.
    rshift => op_rshift,
    /// `self - rhs`.
    sub => op_sub,
    /// `self / rhs`.
    truediv => op_truediv,
    /// `self ^ rhs`.
    xor => op_xor,
}

forward_inplace! {
    /// `self += rhs`.
    iadd => op_iadd,
    /// `self &= rhs`.
    iand => op_iand,
    /// `self //= rhs`.
    ifloordiv => op_ifloordiv,
    /// `self <<= rhs`.
    ilshift => op_ilshift,
    /// `self %= rhs`.
    imod => op_imod,
    /// `self *= rhs`.
    imul => op_imul,
    /// `self @= rhs`.
    imatmul => op_imatmul,
    /// `self |= rhs`.
    ior => op_ior,
    /// `self **= rhs`.
    ipow => op_ipow,
    /// `self >>= rhs`.
    irshift => op_irshift,
    /// `self -= rhs`.
    isub => op_isub,
    /// `self /= rhs`.
    itruediv => op_itruediv,
    /// `self ^= rhs`.
    ixor => op_ixor,
}

impl fmt::Debug for PyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PyRef")
            .field("index", &self.index.raw())
            .field("live", &(self.session.strong_count() > 0))
            .finish()
    }
}

impl Drop for PyRef {
    fn drop(&mut self) {
        let Some(inner) = self.session.upgrade() else { return };
        if !inner.is_terminated() {
            // Queued, not flushed: drop frames coast along with the next
            // command. Failures are already latched in the transport.
            let _ = inner.queue_drop(self.index);
        }
    }
}

/// A converted argument: either a fresh interpreter value or a borrow of an
/// existing proxy. Borrowed arguments cross the wire without duplication,
/// preserving object identity.
pub enum PyVal<'a> {
    Owned(PyRef),
    Borrowed(&'a PyRef),
}

impl PyVal<'_> {
    pub(crate) fn index(&self) -> RemoteIndex {
        match self {
            Self::Owned(object) => object.index(),
            Self::Borrowed(object) => object.index(),
        }
    }

    pub(crate) fn into_owned(self) -> Result<PyRef> {
        match self {
            Self::Owned(object) => Ok(object),
            Self::Borrowed(object) => object.dup(),
        }
    }
}

/// Conversion of host values into interpreter values.
///
/// Implementations for proxies verify the session match and never touch the
/// wire; scalar implementations issue the corresponding make-command.
pub trait IntoPy<'a> {
    /// Converts `self`, minting a new interpreter value where needed.
    ///
    /// # Errors
    /// [`Error::ForeignHandle`] when a proxy from another session is
    /// offered, before any bytes are sent.
    fn into_py(self, session: &Session) -> Result<PyVal<'a>>;
}

impl<'a> IntoPy<'a> for &'a PyRef {
    fn into_py(self, session: &Session) -> Result<PyVal<'a>> {
        if !self.belongs_to(session) {
            return Err(Error::ForeignHandle);
        }
        Ok(PyVal::Borrowed(self))
    }
}

impl<'a> IntoPy<'a> for PyRef {
    fn into_py(self, session: &Session) -> Result<PyVal<'a>> {
        if !self.belongs_to(session) {
            return Err(Error::ForeignHandle);
        }
        Ok(PyVal::Owned(self))
    }
}

impl<'a> IntoPy<'a> for isize {
    fn into_py(self, session: &Session) -> Result<PyVal<'a>> {
        Ok(PyVal::Owned(session.int(self)?))
    }
}

impl<'a> IntoPy<'a> for bool {
    fn into_py(self, session: &Session) -> Result<PyVal<'a>> {
        Ok(PyVal::Owned(session.bool(self)?))
    }
}

impl<'a> IntoPy<'a> for f64 {
    fn into_py(self, session: &Session) -> Result<PyVal<'a>> {
        Ok(PyVal::Owned(session.float(self)?))
    }
}

impl<'a, 'b> IntoPy<'a> for &'b str {
    fn into_py(self, session: &Session) -> Result<PyVal<'a>> {
        Ok(PyVal::Owned(session.str(self)?))
    }
}

impl<'a> IntoPy<'a> for String {
    fn into_py(self, session: &Session) -> Result<PyVal<'a>> {
        Ok(PyVal::Owned(session.str(&self)?))
    }
}

impl<'a, 'b> IntoPy<'a> for &'b [u8] {
    fn into_py(self, session: &Session) -> Result<PyVal<'a>> {
        Ok(PyVal::Owned(session.bytes(self)?))
    }
}

impl<'a> IntoPy<'a> for Vec<u8> {
    fn into_py(self, session: &Session) -> Result<PyVal<'a>> {
        Ok(PyVal::Owned(session.bytes(&self)?))
    }
}

/// Lazy iteration over an interpreter value.
///
/// Each `next` issues one remote call; the stream ends when the
/// interpreter raises `StopIteration` and keeps reporting `None` from then
/// on (the interpreter raises it again for an exhausted iterator).
pub struct PyIter {
    iterator: PyRef,
}

impl PyIter {
    /// The underlying iterator object.
    #[must_use]
    pub fn object(&self) -> &PyRef {
        &self.iterator
    }
}

impl Iterator for PyIter {
    type Item = Result<PyRef>;

    fn next(&mut self) -> Option<Self::Item> {
        let session = match self.iterator.session() {
            Ok(session) => session,
            Err(error) => return Some(Err(error)),
        };
        match session.apply(|p| &p.next_, &[self.iterator.index()]) {
            Ok(value) => Some(Ok(value)),
            Err(Error::Raised(exception)) => {
                match session.is_stop_iteration(exception.object()) {
                    Ok(true) => None,
                    Ok(false) => Some(Err(Error::Raised(exception))),
                    Err(error) => Some(Err(error)),
                }
            }
            Err(error) => Some(Err(error)),
        }
    }
}
