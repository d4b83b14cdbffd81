use crate::job::JobSet;
use crate::search::SearchCache;

/// Everything the interpreter owns: passed explicitly into the launcher,
/// reaper, and builtins rather than living in ambient globals.
pub struct State {
    pub search_cache: SearchCache,
    pub jobs: JobSet,
    pub last_status: i32,
    pub exit: Option<i32>,
}

impl State {
    pub fn new() -> State {
        State {
            search_cache: SearchCache::new(),
            jobs: JobSet::new(),
            last_status: 0,
            exit: None,
        }
    }
}
