//! Thread-local handle to the running thread's context.
//!
//! Valid only while the thread is RUNNING on some core. The core index is
//! read through the pad and is refreshed on every dispatch, so a value read
//! before a suspension point must not be reused after it.

use std::cell::RefCell;
use std::sync::Arc;

use crate::runtime::RuntimeShared;
use crate::thread::context::SwitchPad;
use crate::thread::{ThreadFlags, ThreadId};

#[derive(Clone)]
pub(crate) struct Context {
    pub rt: Arc<RuntimeShared>,
    pub id: ThreadId,
    pub flags: Arc<ThreadFlags>,
    pub pad: Arc<SwitchPad>,
}

thread_local! {
    static CURRENT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

pub(crate) fn enter(cx: Context) {
    CURRENT.with(|slot| *slot.borrow_mut() = Some(cx));
}

pub(crate) fn clear() {
    CURRENT.with(|slot| *slot.borrow_mut() = None);
}

/// The calling thread's context, or `None` on a thread the runtime does
/// not manage.
pub(crate) fn context() -> Option<Context> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// Identity of the calling lightweight thread, if any.
#[must_use]
pub fn current_id() -> Option<ThreadId> {
    CURRENT.with(|slot| slot.borrow().as_ref().map(|cx| cx.id))
}
