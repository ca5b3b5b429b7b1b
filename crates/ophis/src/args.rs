//! Call argument building.
//!
//! Arguments accumulate strictly left to right, matching the evaluation
//! order of a Python call site. As long as only plain positionals are
//! given, the call later goes out over the compact call opcode; the first
//! splat or keyword switches the builder to a remote argument list and
//! keyword dict, and the call goes out as a starcall.

use smallvec::SmallVec;

use crate::{
    error::{Error, Result},
    pyref::{IntoPy, PyRef, PyVal},
    session::Session,
};

/// Arguments for [`PyRef::call`], built fluently:
///
/// ```no_run
/// # fn demo(session: &ophis::Session, f: &ophis::PyRef, extra: &ophis::PyRef) -> ophis::Result<()> {
/// f.call(session.args().arg(1).star(extra).kw("sep", " | "))?;
/// # Ok(())
/// # }
/// ```
///
/// Builder steps that need the wire defer their failures: the first error
/// is stored and surfaced by the call itself.
pub struct CallArgs<'s, 'a> {
    session: &'s Session,
    plain: SmallVec<[PyVal<'a>; 8]>,
    seq: Option<PyRef>,
    kwargs: Option<PyRef>,
    failed: Option<Error>,
}

/// What the builder resolved to, consumed by the call path.
pub(crate) enum CallPlan<'a> {
    Positional(SmallVec<[PyVal<'a>; 8]>),
    Star { seq: PyRef, kwargs: PyRef },
}

impl<'s, 'a> CallArgs<'s, 'a> {
    pub(crate) fn new(session: &'s Session) -> Self {
        Self { session, plain: SmallVec::new(), seq: None, kwargs: None, failed: None }
    }

    pub(crate) fn session(&self) -> &'s Session {
        self.session
    }

    /// Appends one positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl IntoPy<'a>) -> Self {
        self.step(|this| {
            let value = value.into_py(this.session)?;
            match &this.seq {
                None => this.plain.push(value),
                Some(seq) => {
                    this.session.apply(|p| &p.list_append, &[seq.index(), value.index()])?;
                }
            }
            Ok(())
        });
        self
    }

    /// Splats an iterable into the positional arguments (`*iterable`).
    #[must_use]
    pub fn star(mut self, iterable: impl IntoPy<'a>) -> Self {
        self.step(|this| {
            let iterable = iterable.into_py(this.session)?;
            let seq = this.spill_positionals()?;
            this.session.apply(|p| &p.list_extend, &[seq, iterable.index()])?;
            Ok(())
        });
        self
    }

    /// Appends one keyword argument.
    #[must_use]
    pub fn kw(mut self, name: &str, value: impl IntoPy<'a>) -> Self {
        self.step(|this| {
            let name = this.session.str(name)?;
            let value = value.into_py(this.session)?;
            let kwargs = this.keyword_dict()?;
            this.session
                .apply(|p| &p.op_setitem, &[kwargs, name.index(), value.index()])?;
            Ok(())
        });
        self
    }

    /// Splats a mapping into the keyword arguments (`**mapping`).
    #[must_use]
    pub fn star_star(mut self, mapping: impl IntoPy<'a>) -> Self {
        self.step(|this| {
            let mapping = mapping.into_py(this.session)?;
            let kwargs = this.keyword_dict()?;
            this.session.apply(|p| &p.dict_update, &[kwargs, mapping.index()])?;
            Ok(())
        });
        self
    }

    pub(crate) fn finish(self) -> Result<CallPlan<'a>> {
        if let Some(error) = self.failed {
            return Err(error);
        }
        if self.seq.is_none() && self.kwargs.is_none() {
            return Ok(CallPlan::Positional(self.plain));
        }
        let seq = match self.seq {
            Some(seq) => seq,
            // Keywords only: the positionals stay a plain tuple.
            None => {
                let indices: Vec<_> = self.plain.iter().map(PyVal::index).collect();
                self.session.cmd_make_tuple(&indices)?
            }
        };
        let kwargs = match self.kwargs {
            Some(kwargs) => kwargs,
            None => self.session.dict()?,
        };
        Ok(CallPlan::Star { seq, kwargs })
    }

    /// Runs one builder step unless an earlier one failed.
    fn step(&mut self, action: impl FnOnce(&mut Self) -> Result<()>) {
        if self.failed.is_none() {
            if let Err(error) = action(self) {
                self.failed = Some(error);
            }
        }
    }

    /// Moves the accumulated plain positionals into a remote list,
    /// returning its index. Later positionals append to the list.
    fn spill_positionals(&mut self) -> Result<crate::wire::RemoteIndex> {
        if let Some(seq) = &self.seq {
            return Ok(seq.index());
        }
        let indices: Vec<_> = self.plain.iter().map(PyVal::index).collect();
        let as_tuple = self.session.cmd_make_tuple(&indices)?;
        let list = self.session.apply(|p| &p.list_, &[as_tuple.index()])?;
        let index = list.index();
        self.plain.clear();
        self.seq = Some(list);
        Ok(index)
    }

    fn keyword_dict(&mut self) -> Result<crate::wire::RemoteIndex> {
        if let Some(kwargs) = &self.kwargs {
            return Ok(kwargs.index());
        }
        let kwargs = self.session.dict()?;
        let index = kwargs.index();
        self.kwargs = Some(kwargs);
        Ok(index)
    }
}
