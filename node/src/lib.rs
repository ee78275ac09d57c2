// pledger-node
// Chain orchestration, durable ledger, node roles, and the service loop

pub mod chain;
pub mod config;
pub mod genesis;
pub mod ledger;
pub mod roles;
pub mod service;

pub use chain::{Chain, ChainError};
pub use config::{ensure_node_id, NodeConfig, NodeRole};
pub use genesis::{build_genesis_block, GenesisKeys};
pub use ledger::{Ledger, LedgerError, LedgerInitConfig};
pub use roles::{Beacon, Miner, Relay, RoleConfig};
pub use service::{run_node, NodeService};
