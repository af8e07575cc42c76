use parking_lot::{Mutex, RawMutex};
use std::collections::HashMap;
use std::sync::Arc;

pub type GameGuard = parking_lot::lock_api::ArcMutexGuard<RawMutex, ()>;

/// One mutex per game id. Operations on the same game queue up behind each
/// other; different games never contend.
#[derive(Default)]
pub struct GameLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl GameLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, game_id: &str) -> GameGuard {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(game_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_arc()
    }
}
