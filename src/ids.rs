// This file is part of StreamVault, a live-stream recording supervisor.

//! Id generation (component C1, id half): thin, semantically-named wrappers
//! around `base::ids::IdSource` so call sites read `ids.new_recording_id()`
//! rather than a bare `new_id()` with no indication of what the id names.

use base::ids::IdSource;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct IdGenerator {
    source: Arc<dyn IdSource>,
}

impl IdGenerator {
    pub fn new(source: Arc<dyn IdSource>) -> Self {
        IdGenerator { source }
    }

    pub fn new_channel_id(&self) -> Uuid {
        self.source.new_id()
    }

    pub fn new_stream_id(&self) -> Uuid {
        self.source.new_id()
    }

    pub fn new_recording_id(&self) -> Uuid {
        self.source.new_id()
    }

    pub fn new_task_id(&self) -> Uuid {
        self.source.new_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::ids::SequentialIds;

    #[test]
    fn generated_ids_are_distinct() {
        let gen = IdGenerator::new(Arc::new(SequentialIds::new()));
        let a = gen.new_recording_id();
        let b = gen.new_task_id();
        assert_ne!(a, b);
    }
}
