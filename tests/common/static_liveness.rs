//! Liveness registry with a fixed, mutable set of owners.

use std::sync::{Arc, Mutex};

use sqlcoord_core::error::CoordResult;
use sqlcoord_core::traits::LivenessRegistry;

/// Reports exactly the owners it was told about.
#[derive(Debug, Clone, Default)]
pub struct StaticLiveness {
    owners: Arc<Mutex<Vec<String>>>,
}

impl StaticLiveness {
    pub fn new<S: Into<String>>(owners: impl IntoIterator<Item = S>) -> Self {
        Self {
            owners: Arc::new(Mutex::new(owners.into_iter().map(Into::into).collect())),
        }
    }

    /// Marks `owner` dead.
    pub fn kill(&self, owner: &str) {
        self.owners.lock().unwrap().retain(|o| o != owner);
    }
}

impl LivenessRegistry for StaticLiveness {
    async fn live_owners(&self) -> CoordResult<Vec<String>> {
        let owners = self.owners.lock().unwrap().clone();
        Ok(owners)
    }
}
