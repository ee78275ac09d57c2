// pledger-consensus
// Ouroboros-style slot/epoch discipline and stake-weighted leader selection

pub mod clock;
pub mod ouroboros;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ouroboros::{ConsensusError, Ouroboros, OuroborosConfig, Stakeholder};
