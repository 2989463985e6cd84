mod collector;
mod parallel_state;
mod rendezvous;
mod shard;

pub use collector::{assemble, CollectError, CollectedResults, ResultCollector, ResultEntry, ResultSender};
pub use parallel_state::{ParallelState, Role};
pub use rendezvous::{
    parse_dist_url, RendezvousClient, RendezvousConfig, RendezvousError, RendezvousMessage,
    RendezvousServer,
};
pub use shard::{covered_range, plan_shard, shorten, Shard, ShardError, ShardPolicy};
