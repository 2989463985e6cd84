/// Placement of one worker inside the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelState {
    node_rank: usize,
    node_count: usize,
    local_rank: usize,
    workers_per_node: usize,
}

impl Default for ParallelState {
    fn default() -> Self {
        Self {
            node_rank: 0,
            node_count: 1,
            local_rank: 0,
            workers_per_node: 1,
        }
    }
}

impl ParallelState {
    pub fn new(
        node_rank: usize,
        node_count: usize,
        local_rank: usize,
        workers_per_node: usize,
    ) -> Self {
        Self {
            node_rank,
            node_count,
            local_rank,
            workers_per_node,
        }
    }

    /// Global rank, unique across all nodes.
    pub fn rank(&self) -> usize {
        self.node_rank * self.workers_per_node + self.local_rank
    }
    pub fn world_size(&self) -> usize {
        self.node_count * self.workers_per_node
    }
    /// Rank within this node; doubles as the device ordinal.
    pub fn local_rank(&self) -> usize {
        self.local_rank
    }
    pub fn node_rank(&self) -> usize {
        self.node_rank
    }
}

/// What a task in the run is responsible for. Behavior is dispatched on the
/// role instead of on rank comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Per-node driver. The coordinator of node 0 hosts the rendezvous
    /// endpoint and owns result collection, scoring and output.
    Coordinator {
        node_rank: usize,
        hosts_rendezvous: bool,
    },
    /// One rank. `reports_progress` is set on the first worker of the
    /// rendezvous host and enables per-batch progress logs.
    Worker {
        state: ParallelState,
        reports_progress: bool,
    },
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Coordinator {
                node_rank,
                hosts_rendezvous,
            } => write!(
                f,
                "coordinator(node={}, hosts_rendezvous={})",
                node_rank, hosts_rendezvous
            ),
            Role::Worker { state, .. } => write!(
                f,
                "worker(rank={}/{}, local_rank={})",
                state.rank(),
                state.world_size(),
                state.local_rank()
            ),
        }
    }
}

impl Role {
    pub fn coordinator(node_rank: usize) -> Self {
        Role::Coordinator {
            node_rank,
            hosts_rendezvous: node_rank == 0,
        }
    }

    pub fn hosts_rendezvous(&self) -> bool {
        matches!(
            self,
            Role::Coordinator {
                hosts_rendezvous: true,
                ..
            }
        )
    }

    /// Role of a worker running outside any group, e.g. for a direct run.
    pub fn standalone_worker() -> Self {
        Role::Worker {
            state: ParallelState::default(),
            reports_progress: true,
        }
    }

    pub fn reports_progress(&self) -> bool {
        matches!(
            self,
            Role::Worker {
                reports_progress: true,
                ..
            }
        )
    }

    pub fn parallel_state(&self) -> Option<ParallelState> {
        match self {
            Role::Worker { state, .. } => Some(*state),
            Role::Coordinator { .. } => None,
        }
    }

    /// Worker roles for every device of this coordinator's node.
    pub fn local_workers(&self, node_count: usize, workers_per_node: usize) -> Vec<Role> {
        match self {
            Role::Coordinator {
                node_rank,
                hosts_rendezvous,
            } => (0..workers_per_node)
                .map(|local_rank| Role::Worker {
                    state: ParallelState::new(*node_rank, node_count, local_rank, workers_per_node),
                    reports_progress: *hosts_rendezvous && local_rank == 0,
                })
                .collect(),
            Role::Worker { .. } => Vec::new(),
        }
    }
}

#[test]
fn test_global_ranks() {
    let coordinator = Role::coordinator(1);
    assert!(!coordinator.hosts_rendezvous());
    let workers = coordinator.local_workers(2, 4);
    let ranks: Vec<usize> = workers
        .iter()
        .filter_map(Role::parallel_state)
        .map(|state| {
            assert_eq!(state.world_size(), 8);
            state.rank()
        })
        .collect();
    assert_eq!(ranks, vec![4, 5, 6, 7]);
    assert!(workers.iter().all(|w| !w.reports_progress()));
    assert!(Role::coordinator(0).hosts_rendezvous());
}

#[test]
fn test_only_the_host_reports_progress() {
    let workers = Role::coordinator(0).local_workers(2, 3);
    let reporting: Vec<bool> = workers.iter().map(Role::reports_progress).collect();
    assert_eq!(reporting, vec![true, false, false]);
    assert!(!Role::coordinator(0).reports_progress());
    assert!(Role::coordinator(0).local_workers(1, 0).is_empty());
    assert!(Role::standalone_worker().reports_progress());
    assert!(Role::standalone_worker().local_workers(1, 1).is_empty());
}
