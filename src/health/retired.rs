// Bounded memory of instance ids that are gone on purpose.

use std::collections::{HashSet, VecDeque};

use crate::model::InstanceId;

const RETIRED_CAPACITY: usize = 4096;

/// Ids of instances that were stopped or replaced, oldest evicted first.
#[derive(Default)]
pub(crate) struct Retired {
    order: VecDeque<InstanceId>,
    ids: HashSet<InstanceId>,
}

impl Retired {
    pub(crate) fn insert(&mut self, id: InstanceId) {
        if self.ids.insert(id.clone()) {
            self.order.push_back(id);
            if self.order.len() > RETIRED_CAPACITY {
                if let Some(old) = self.order.pop_front() {
                    self.ids.remove(&old);
                }
            }
        }
    }

    pub(crate) fn contains(&self, id: &InstanceId) -> bool {
        self.ids.contains(id)
    }
}
