//! CLI command implementations.

mod config;
mod kv;
mod topology;

pub use config::{run_config, ConfigArgs, ConfigCommand};
pub use kv::{
    run_counter, run_get, run_remove, run_set, CounterArgs, GetArgs, RemoveArgs, SetArgs,
    StoreMode,
};
pub use topology::{run_topology, TopologyArgs};
