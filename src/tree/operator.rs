//! The operator seam.
//!
//! A modify locates the key first and only then decides what to write;
//! the decision belongs to a user-supplied [`ModifyOperator`]. The walk
//! hands it the old value (absent if the key is missing or expired) and
//! its large-value handle, and gets back a [`Decision`].
//!
//! The enum shape makes two of the consistency rules unrepresentable: only
//! `Write` can carry a new large-value handle, so a refusal or a delete
//! can never leak one. The remaining rule, that a large new value and its
//! handle name the same chain, is asserted by [`check_decision`].

use eyre::Result;

use crate::config::MAX_INLINE_VALUE_SIZE;
use crate::largeval::{self, LargeValueHandle};
use crate::storage::Transaction;
use crate::value::{LargeRef, Value};

/// What a modify should do with the located key.
pub enum Decision {
    /// Leave the tree unchanged (the walk still silently deletes an
    /// expired old value).
    Keep,
    /// Insert or replace the value. A large value must arrive with the
    /// handle of the chain the operator wrote.
    Write {
        value: Value,
        large: Option<LargeValueHandle>,
    },
    /// Delete the key if present; deleting an absent key is a no-op that
    /// still commits.
    Remove,
}

/// User extension point of the modify walk.
pub trait ModifyOperator {
    /// Populates the handle for an existing large value. The default loads
    /// the whole chain; operators that only need a prefix can do less, but
    /// the handle must be loaded when this returns.
    fn acquire_large_value(
        &mut self,
        txn: &Transaction,
        handle: &mut LargeValueHandle,
        lref: LargeRef,
    ) -> Result<()> {
        handle.load(txn, lref)
    }

    /// Decides the mutation for the located key. `old` is `None` when the
    /// key is absent or expired; `old_large` is loaded exactly when `old`
    /// is a large value.
    fn operate(
        &mut self,
        txn: &Transaction,
        old: Option<&Value>,
        old_large: &LargeValueHandle,
    ) -> Result<Decision>;

    /// When true, the engine will not overwrite the CAS tag of a new value
    /// that already carries one.
    fn cas_already_set(&self) -> bool {
        false
    }
}

/// Enforces the one rule the type system cannot: a large new value and its
/// handle must reference the same chain root.
pub(crate) fn check_decision(decision: &Decision) {
    if let Decision::Write { value, large } = decision {
        if let Some(lref) = value.large_ref() {
            let handle = large
                .as_ref()
                .expect("large new value must arrive with its chain handle");
            assert!(
                handle.is_loaded(),
                "new large-value handle must be loaded"
            );
            let handle_root = handle
                .root_ref()
                .expect("loaded handle always has a reference") // INVARIANT: loaded implies lref set
                .root;
            assert_eq!(
                handle_root, lref.root,
                "new value and its handle reference different chains"
            );
        } else {
            assert!(
                large.is_none(),
                "inline new value must not carry a large-value handle"
            );
        }
    }
}

/// Unconditional upsert; the operator behind [`crate::TreeSlice::put`].
/// Writes payloads over the inline cap as overflow chains.
pub struct SetOperator<'a> {
    bytes: &'a [u8],
    exptime: Option<u32>,
    request_cas: bool,
}

impl<'a> SetOperator<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            exptime: None,
            request_cas: false,
        }
    }

    pub fn with_exptime(mut self, exptime: u32) -> Self {
        self.exptime = Some(exptime);
        self
    }

    pub fn with_cas(mut self) -> Self {
        self.request_cas = true;
        self
    }
}

impl ModifyOperator for SetOperator<'_> {
    fn operate(
        &mut self,
        txn: &Transaction,
        _old: Option<&Value>,
        _old_large: &LargeValueHandle,
    ) -> Result<Decision> {
        let (mut value, large) = if self.bytes.len() > MAX_INLINE_VALUE_SIZE {
            let lref = largeval::write_chain(txn, self.bytes)?;
            (Value::large(lref)?, Some(LargeValueHandle::written(lref)))
        } else {
            (Value::inline(self.bytes.to_vec())?, None)
        };

        if let Some(exptime) = self.exptime {
            value.set_exptime(exptime);
        }
        if self.request_cas {
            value.request_cas();
        }

        Ok(Decision::Write { value, large })
    }
}

/// Delete-if-present; the operator behind [`crate::TreeSlice::delete`].
#[derive(Default)]
pub struct DeleteOperator {
    pub(crate) found: bool,
}

impl ModifyOperator for DeleteOperator {
    fn operate(
        &mut self,
        _txn: &Transaction,
        old: Option<&Value>,
        _old_large: &LargeValueHandle,
    ) -> Result<Decision> {
        self.found = old.is_some();
        if self.found {
            Ok(Decision::Remove)
        } else {
            Ok(Decision::Keep)
        }
    }
}
