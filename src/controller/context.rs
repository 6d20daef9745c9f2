//! Per-thread "current controller" state and the process-wide handle registry.
//!
//! Each thread has at most one bound [`ThreadController`], stored in a
//! thread local together with the thread's default [`TaskRunner`]. The
//! registry maps thread ids to [`ControllerHandle`]s so other threads can
//! wake a specific thread's loop; each thread only writes its own slot, at
//! bind and unbind time.

use super::ThreadController;
use super::handle::ControllerHandle;
use crate::task::TaskRunner;

use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::OnceLock;
use std::thread::{self, ThreadId};

thread_local! {
    /// Set by `ThreadController::bind_to_current_thread`.
    static CURRENT_CONTROLLER: RefCell<Option<Rc<ThreadController>>> = const { RefCell::new(None) };

    /// Set by the executor that owns the thread's default task queue.
    static CURRENT_TASK_RUNNER: RefCell<Option<TaskRunner>> = const { RefCell::new(None) };
}

static HANDLES: OnceLock<Mutex<HashMap<ThreadId, ControllerHandle>>> = OnceLock::new();

fn handles() -> &'static Mutex<HashMap<ThreadId, ControllerHandle>> {
    HANDLES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Installs `controller` as this thread's controller.
///
/// # Panics
///
/// Panics if another controller is already bound to this thread.
pub(crate) fn bind_current_controller(controller: Rc<ThreadController>) {
    let handle = controller.handle();

    CURRENT_CONTROLLER.with(|current| {
        let mut current = current.borrow_mut();
        assert!(
            current.is_none(),
            "a ThreadController is already bound to this thread"
        );
        *current = Some(controller);
    });

    handles().lock().insert(thread::current().id(), handle);
}

/// Removes `controller` if it is this thread's controller.
pub(crate) fn unbind_current_controller(controller: &ThreadController) {
    let removed = CURRENT_CONTROLLER.with(|current| {
        let mut current = current.borrow_mut();
        let is_current = current
            .as_ref()
            .is_some_and(|bound| std::ptr::eq(Rc::as_ptr(bound), controller));
        if is_current { current.take() } else { None }
    });

    if removed.is_some() {
        handles().lock().remove(&thread::current().id());
    }
}

pub(crate) fn current_controller() -> Option<Rc<ThreadController>> {
    CURRENT_CONTROLLER
        .try_with(|current| current.borrow().clone())
        .ok()
        .flatten()
}

pub(crate) fn handle_for_thread(thread: ThreadId) -> Option<ControllerHandle> {
    handles().lock().get(&thread).cloned()
}

/// Replaces the thread's default task runner, returning the previous one.
pub(crate) fn replace_current_task_runner(runner: Option<TaskRunner>) -> Option<TaskRunner> {
    CURRENT_TASK_RUNNER
        .try_with(|current| std::mem::replace(&mut *current.borrow_mut(), runner))
        .ok()
        .flatten()
}

pub(crate) fn current_task_runner() -> Option<TaskRunner> {
    CURRENT_TASK_RUNNER
        .try_with(|current| current.borrow().clone())
        .ok()
        .flatten()
}
