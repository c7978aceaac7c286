//! Simulated pod collection for `shoalctl watch`.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use shoal_core::ObjectMeta;
use shoal_informer::MockSource;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const NAMESPACES: [&str; 2] = ["default", "staging"];

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Pod {
    pub namespace: String,
    pub name: String,
    pub phase: Phase,
    pub restarts: u32,
}

impl ObjectMeta for Pod {
    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        Some(&self.namespace)
    }
}

fn new_pod(i: usize) -> Pod {
    Pod {
        namespace: NAMESPACES[i % NAMESPACES.len()].to_string(),
        name: format!("web-{}", i),
        phase: Phase::Pending,
        restarts: 0,
    }
}

pub fn initial(n: usize) -> Vec<Pod> {
    (0..n).map(new_pod).collect()
}

enum Change {
    Create(Pod),
    Modify(Pod),
    Remove(Pod),
}

fn pick(current: &[Pod], next_index: usize) -> Change {
    let mut rng = rand::rng();
    let roll = rng.random_range(0..100u32);
    if current.is_empty() || roll < 20 {
        return Change::Create(new_pod(next_index));
    }
    let mut pod = current[rng.random_range(0..current.len())].clone();
    if roll < 35 {
        return Change::Remove(pod);
    }
    pod.phase = match pod.phase {
        Phase::Pending => Phase::Running,
        Phase::Running if roll < 60 => Phase::Failed,
        Phase::Running => Phase::Succeeded,
        Phase::Failed => {
            pod.restarts += 1;
            Phase::Running
        }
        Phase::Succeeded => Phase::Pending,
    };
    Change::Modify(pod)
}

/// Apply one random create, modify or remove every `every` until cancelled.
pub async fn churn(source: MockSource<Pod>, start_index: usize, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    let mut next_index = start_index;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let change = pick(&source.snapshot(), next_index);
        let res = match change {
            Change::Create(pod) => {
                next_index += 1;
                source.add(pod)
            }
            Change::Modify(pod) => source.update(pod),
            Change::Remove(pod) => source.delete(pod),
        };
        match res {
            Ok(version) => debug!(version = %version, "churn applied"),
            Err(e) => warn!(error = %e, "churn rejected"),
        }
    }
}
