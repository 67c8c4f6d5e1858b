use proptest::prelude::*;

use tasker_lanes::routing::TaskKind;

/// Any of the twelve known task kinds
pub fn task_kind_strategy() -> impl Strategy<Value = TaskKind> {
    prop::sample::select(TaskKind::ALL.to_vec())
}

/// Task type names that are not known kinds
pub fn unmapped_task_type_strategy() -> impl Strategy<Value = String> {
    "[a-z_]{1,24}".prop_filter("must not be a known task kind", |name| {
        TaskKind::ALL.iter().all(|kind| kind.as_str() != name)
    })
}

pub fn channel_name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z_]{2,15}"
}

/// Arbitrary routing tables over a small channel set
pub fn routing_table_strategy() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::vec(("[a-z_]{1,12}", channel_name_strategy()), 0..16)
}
