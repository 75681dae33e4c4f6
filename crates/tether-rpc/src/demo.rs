//! Loopback scenarios: a host engine and a guest engine wired back to back
//! over an in-memory transport.

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::time::Duration;
use tether_core::{Engine, EngineStats, MemoryTransport, RpcError};
use tracing::{debug, info, warn};

/// Outcome of one scenario, printed as a line of the report.
#[derive(Debug)]
pub struct ScenarioReport {
    pub name: &'static str,
    pub outcome: std::result::Result<Value, RpcError>,
}

impl std::fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.outcome {
            Ok(value) => write!(f, "{:<10} ok   {}", self.name, value),
            Err(e) => write!(f, "{:<10} err  {}", self.name, e),
        }
    }
}

/// Both ends of the loopback.
pub struct Loopback {
    pub host: Engine,
    guest: Option<Engine>,
    timeout: Duration,
}

impl Loopback {
    /// Connect a fresh host/guest pair and expose the guest's methods.
    pub fn connect(timeout: Duration) -> Result<Self> {
        let (host_side, guest_side) = MemoryTransport::pair();

        let host = Engine::builder().default_timeout(timeout).build()?;
        let guest = Engine::builder().default_timeout(timeout).build()?;
        register_guest_methods(&guest);

        host.start(host_side);
        guest.start(guest_side);
        info!("Loopback connected (timeout {:?})", timeout);

        Ok(Self {
            host,
            guest: Some(guest),
            timeout,
        })
    }

    async fn call(&self, name: &'static str, method: &str, args: Value) -> ScenarioReport {
        let outcome = self.host.call_async(method, args, self.timeout).await;
        match &outcome {
            Ok(value) => debug!("{} -> {}", method, value),
            Err(e) => warn!("{} failed: {}", method, e),
        }
        ScenarioReport { name, outcome }
    }

    /// Run every scenario in order. The last one drops the guest engine, so
    /// the loopback cannot be reused afterwards.
    pub async fn run(&mut self, a: i64, b: i64) -> Vec<ScenarioReport> {
        let mut reports = vec![
            self.call("add", "add", json!({"a": a, "b": b})).await,
            self.call("divide", "divide", json!({"a": a, "b": b})).await,
            self.call("ghost", "ghost", json!(null)).await,
            self.call("bad-args", "add", json!({"a": "two"})).await,
        ];

        // With the guest gone nobody answers, so the call runs into its timer.
        drop(self.guest.take());
        reports.push(self.call("orphaned", "add", json!({"a": a, "b": b})).await);

        reports
    }

    pub fn host_stats(&self) -> EngineStats {
        self.host.stats()
    }
}

fn register_guest_methods(guest: &Engine) {
    guest.register_method("add", |args| {
        let (a, b) = operands(&args)?;
        Ok(json!(a + b))
    });

    guest.register_method("divide", |args| {
        let (a, b) = operands(&args)?;
        if b == 0 {
            return Err(anyhow!("division by zero"));
        }
        Ok(json!(a / b))
    });
}

fn operands(args: &Value) -> Result<(i64, i64)> {
    let a = args["a"]
        .as_i64()
        .ok_or_else(|| anyhow!("arguments format error: 'a' must be an integer"))?;
    let b = args["b"]
        .as_i64()
        .ok_or_else(|| anyhow!("arguments format error: 'b' must be an integer"))?;
    Ok((a, b))
}
