// Copyright 2025 hoard Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::error::Result;

/// Recurring background task shared by the persistent backends.
///
/// Runs `tick` every `interval` on a dedicated thread. Dropping the flusher signals the thread
/// and joins it: an in-progress tick is waited for, never interrupted.
pub(crate) struct Flusher {
    handle: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
}

struct Shared {
    stop: Mutex<bool>,
    cv: Condvar,
}

impl Flusher {
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            stop: Mutex::new(false),
            cv: Condvar::new(),
        });
        let inner = shared.clone();
        let handle = std::thread::Builder::new().name(name.to_string()).spawn(move || loop {
            let mut stop = inner.stop.lock();
            if !*stop {
                inner.cv.wait_for(&mut stop, interval);
            }
            if *stop {
                return;
            }
            drop(stop);
            tick();
        })?;
        Ok(Self {
            handle: Some(handle),
            shared,
        })
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        *self.shared.stop.lock() = true;
        self.shared.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_flusher_ticks_and_joins() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = ticks.clone();
        let flusher = Flusher::spawn("hoard-test-flusher", Duration::from_millis(10), move || {
            t.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

        while ticks.load(Ordering::Relaxed) < 3 {
            std::thread::sleep(Duration::from_millis(5));
        }
        drop(flusher);

        let after = ticks.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(ticks.load(Ordering::Relaxed), after);
    }
}
