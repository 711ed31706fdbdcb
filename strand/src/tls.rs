//! Task-local storage.
//!
//! Keys are stable addresses: any `&'static` place can serve as one, and two
//! keys are equal iff they are the same address. Each task lazily grows a
//! key→value map; at task exit the runtime drains the map and invokes every
//! registered destructor exactly once with its stored value, repeating the
//! sweep (bounded) for values re-registered from inside a destructor.

use std::collections::HashMap;

use crate::error::NotATask;
use crate::task;

/// Identity of a storage slot. Pointer equality, like POSIX `tss` keys.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TssKey(usize);

impl TssKey {
    /// Derives a key from any stable address.
    pub fn from_addr(addr: usize) -> TssKey {
        TssKey(addr)
    }
}

impl<T> From<&'static T> for TssKey {
    fn from(place: &'static T) -> TssKey {
        TssKey(core::ptr::from_ref(place) as usize)
    }
}

/// Destructor invoked with the stored value at task exit or on [`clear`].
pub type TssDtor = fn(*mut ());

#[derive(Default)]
pub(crate) struct TssMap {
    slots: HashMap<TssKey, (*mut (), Option<TssDtor>)>,
}

/// Sweep passes before the runtime gives up on destructors that keep
/// repopulating the map.
const MAX_DTOR_PASSES: usize = 8;

impl TssMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn set(&mut self, key: TssKey, value: *mut (), dtor: Option<TssDtor>) {
        // Replacing does not invoke the old destructor, per tss semantics.
        self.slots.insert(key, (value, dtor));
    }

    fn get(&self, key: TssKey) -> *mut () {
        self.slots
            .get(&key)
            .map_or(core::ptr::null_mut(), |&(value, _)| value)
    }

    fn take(&mut self, key: TssKey) -> Option<(*mut (), Option<TssDtor>)> {
        self.slots.remove(&key)
    }

    fn take_all(&mut self) -> Vec<(*mut (), Option<TssDtor>)> {
        self.slots.drain().map(|(_, slot)| slot).collect()
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Drains the current task's map and runs the destructors, repeating while
/// they re-register values.
///
/// Destructors run with no borrow of the map held, so they are free to call
/// [`set`]/[`get`]/[`clear`] themselves; whatever they add is picked up by
/// the next pass, up to [`MAX_DTOR_PASSES`].
pub(crate) fn run_exit_dtors() {
    for _ in 0..MAX_DTOR_PASSES {
        let Ok(drained) = task::with_current_tss(TssMap::take_all) else {
            return;
        };
        if drained.is_empty() {
            return;
        }
        for (value, dtor) in drained {
            if let Some(dtor) = dtor {
                dtor(value);
            }
        }
    }

    let leftover = task::with_current_tss(|map| {
        let leftover = map.len();
        map.slots.clear();
        leftover
    });
    if let Ok(leftover) = leftover {
        if leftover > 0 {
            tracing::warn!(
                leftover,
                "task-local destructors kept repopulating the map; dropping the rest"
            );
        }
    }
}

/// Stores `value` (with an optional destructor) under `key` for the current
/// task. Any previous value is replaced *without* running its destructor.
pub fn set(key: TssKey, value: *mut (), dtor: Option<TssDtor>) -> Result<(), NotATask> {
    task::with_current_tss(|map| map.set(key, value, dtor))
}

/// The current task's value for `key`, null if unset.
pub fn get(key: TssKey) -> Result<*mut (), NotATask> {
    task::with_current_tss(|map| map.get(key))
}

/// Removes the current task's value for `key`, running its destructor if one
/// was registered.
pub fn clear(key: TssKey) -> Result<(), NotATask> {
    let slot = task::with_current_tss(|map| map.take(key))?;
    if let Some((value, Some(dtor))) = slot {
        dtor(value);
    }
    Ok(())
}
