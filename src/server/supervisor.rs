//! Instance supervisor: the stable handle behind which instances swap.
//!
//! Readers clone the current `Arc<Instance>` and serve the whole request
//! against it; `reload` builds a replacement aside, swaps the pointer, and
//! cancels the retired instance. A failed build keeps the old instance
//! serving.

use crate::config::Config;
use crate::server::instance::Instance;
use crate::log;
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;

pub struct Supervisor {
    config: Config,
    current: Mutex<Arc<Instance>>,
}

impl Supervisor {
    /// Build the first instance. Failure here is fatal to startup.
    pub fn new(config: Config) -> Result<Supervisor> {
        let instance = Instance::build(&config)?;
        Ok(Supervisor {
            config,
            current: Mutex::new(instance),
        })
    }

    /// The instance serving right now. Each request takes one clone and
    /// never observes a swap mid-flight.
    pub fn instance(&self) -> Arc<Instance> {
        self.current.lock().clone()
    }

    /// Build a new instance and swap it in. On failure the old instance
    /// keeps serving and the error surfaces to the caller.
    pub fn reload(&self) -> Result<()> {
        let fresh = Instance::build(&self.config)?;
        let retired = {
            let mut current = self.current.lock();
            std::mem::replace(&mut *current, fresh)
        };
        log!("serve"; "reloaded: instance {} replaces {}", self.instance().id, retired.id);
        retired.cancel();
        Ok(())
    }

    /// Cancel the current instance (process shutdown).
    pub fn shutdown(&self) {
        self.instance().cancel();
    }
}
