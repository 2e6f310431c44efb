pub mod network;
pub mod peer;

pub use network::{KIM_ENDPOINT, TASK_ENDPOINT, TestNetwork, route};
pub use peer::{PeerError, TestPeer};
