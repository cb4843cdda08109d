//! In-process test harness: a loopback network with programmable fault
//! rules, a whole-group fixture, and a trivial state machine. Compiled
//! into the crate so embedders can reuse it for their own integration
//! tests.

mod group;
mod network;
mod state_machine;

use std::time::Duration;

pub use group::LocalRaftGroup;
pub use network::AlterFn;
pub use network::LocalNetwork;
pub use state_machine::SimpleStateMachine;

/// Polls `condition` until it holds or `timeout` elapses; panics on
/// timeout. The workhorse of timing-dependent assertions.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
