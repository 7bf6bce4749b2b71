//! SIGTERM handling. Kept in its own test binary: the signal reaches every
//! agent running in the process.
#![cfg(unix)]

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use gpiowatch_core::asset::AssetOperation;
use gpiowatch_core::{AgentConfig, MemoryBroker};
use gpiowatch_devices::{AgentLoop, Direction, SensorRecord};
use tokio::time::{sleep, timeout, Instant};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_sigterm_ends_agent_and_purges_registry() {
    let broker = MemoryBroker::new("sigterm");
    let (agent, handle) = AgentLoop::new(Arc::new(broker.client()), &AgentConfig::default());
    let registry = agent.registry();
    registry
        .add_or_update(
            SensorRecord::new("sensor-1", 1, Direction::Input),
            &AssetOperation::Create,
        )
        .unwrap();
    let task = tokio::spawn(agent.run());

    // Once TEST is handled the loop is past its signal setup.
    handle.send(vec!["TEST".to_string()]).await.unwrap();
    let deadline = Instant::now() + WAIT;
    while !registry.test_mode() {
        assert!(Instant::now() < deadline, "TEST was never handled");
        sleep(Duration::from_millis(10)).await;
    }

    let status = Command::new("kill")
        .args(["-TERM", &std::process::id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    timeout(WAIT, task).await.unwrap().unwrap();
    assert!(registry.is_empty());
}
