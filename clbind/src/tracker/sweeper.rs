use super::Shared;
use crate::{resource_unavailable, BindError};
use log::{debug, trace};
use std::{
    sync::{Arc, Condvar, Mutex, Weak},
    thread::{self, JoinHandle},
    time::Duration,
};

/// 后台回收线程的守卫，析构时停止并等待线程退出。
pub struct Sweeper {
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

struct Signal {
    stop: Mutex<bool>,
    cond: Condvar,
}

impl Sweeper {
    pub(super) fn spawn(shared: Weak<Shared>, interval: Duration) -> Result<Self, BindError> {
        let signal = Arc::new(Signal {
            stop: Mutex::new(false),
            cond: Condvar::new(),
        });
        let handle = thread::Builder::new()
            .name("aligned-sweeper".into())
            .spawn({
                let signal = signal.clone();
                move || signal.run(shared, interval)
            })
            .map_err(|e| resource_unavailable(format!("failed to spawn sweeper: {e}")))?;
        debug!("sweeper started, interval = {interval:?}");
        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }
}

impl Signal {
    fn run(&self, shared: Weak<Shared>, interval: Duration) {
        let mut stop = self.stop.lock().unwrap();
        loop {
            stop = self
                .cond
                .wait_timeout_while(stop, interval, |stop| !*stop)
                .unwrap()
                .0;
            if *stop {
                break;
            }
            // 追踪器已经析构，剩余记录由它自己释放
            let Some(shared) = shared.upgrade() else {
                break;
            };
            let freed = shared.sweep();
            if freed > 0 {
                trace!("background sweep freed {freed}");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        *self.signal.stop.lock().unwrap() = true;
        self.signal.cond.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        debug!("sweeper stopped");
    }
}
