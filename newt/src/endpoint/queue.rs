use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use newt_msg::Token;

use crate::exchange::ExchangeId;
use crate::net::Inbound;
use crate::resp::Resp;

/// A unit of protocol-stage work
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Task {
  Recv(Inbound),
  Respond(ExchangeId, Resp),
  Cancel(ExchangeId),
  CancelObservation(Token),
  /// Retransmit, expire & forget whatever is due
  Tick,
}

/// FIFO of protocol-stage tasks.
///
/// Anyone may push; tasks are run one at a time, in the
/// order they were pushed.
#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
  tasks: Mutex<VecDeque<Task>>,
  ready: Condvar,
}

impl TaskQueue {
  fn lock(&self) -> MutexGuard<'_, VecDeque<Task>> {
    self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub(crate) fn push(&self, task: Task) {
    self.lock().push_back(task);
    self.ready.notify_one();
  }

  pub(crate) fn pop(&self) -> Option<Task> {
    self.lock().pop_front()
  }

  pub(crate) fn len(&self) -> usize {
    self.lock().len()
  }

  /// Drop every queued task, yielding how many there were
  pub(crate) fn clear(&self) -> usize {
    let mut tasks = self.lock();
    let n = tasks.len();
    tasks.clear();
    n
  }

  /// Wake anyone blocked in [`TaskQueue::wait`]
  pub(crate) fn wake(&self) {
    self.ready.notify_all();
  }

  /// Block until a task is queued, [`TaskQueue::wake`] is called
  /// or `timeout` elapses
  pub(crate) fn wait(&self, timeout: Duration) {
    let tasks = self.lock();
    if tasks.is_empty() {
      let _ = self.ready
                  .wait_timeout(tasks, timeout)
                  .unwrap_or_else(PoisonError::into_inner);
    }
  }
}
