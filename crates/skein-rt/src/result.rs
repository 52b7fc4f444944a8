// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Result hand-off from a job to whoever submitted it.
//!
//! A job has no return value of its own. The submitter creates a slot,
//! gives the fibre a clone, and takes the value after joining the job's
//! deadline (or after `wait_for`/`call` returns, from inside a job).

use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug)]
pub struct ResultSlot<T> {
    value: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for ResultSlot<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
        }
    }
}

impl<T> Default for ResultSlot<T> {
    fn default() -> Self {
        Self {
            value: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T> ResultSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value`, replacing any earlier one.
    pub fn set(&self, value: T) {
        *self.value.lock() = Some(value);
    }

    pub fn take(&self) -> Option<T> {
        self.value.lock().take()
    }

    pub fn is_set(&self) -> bool {
        self.value.lock().is_some()
    }
}

impl<T: Clone> ResultSlot<T> {
    pub fn get(&self) -> Option<T> {
        self.value.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_take() {
        let slot = ResultSlot::new();
        let writer = slot.clone();
        assert!(!slot.is_set());
        writer.set(42u32);
        assert!(slot.is_set());
        assert_eq!(slot.get(), Some(42));
        assert_eq!(slot.take(), Some(42));
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn visible_across_threads() {
        let slot = ResultSlot::new();
        let writer = slot.clone();
        std::thread::spawn(move || writer.set(String::from("done")))
            .join()
            .unwrap();
        assert_eq!(slot.take().as_deref(), Some("done"));
    }
}
