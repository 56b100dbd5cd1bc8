mod errors;
pub use errors::{CoordinationError, Result};

mod store;
pub use store::{
    ancestors_of, leaf_of, parent_of, validate_path, ChildEvent, CoordinationStore, CreateMode,
    NodeEvent, Versioned,
};

mod watch;
pub use watch::WatchStream;

mod session;
pub use session::SessionState;

mod leadership;
pub use leadership::{Leadership, LeadershipSignal};

mod memory_store;
pub use memory_store::MemoryStore;
