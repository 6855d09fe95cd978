//! Probe runner with scripted outcomes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use testbed::descriptor::ReadinessProbe;
use testbed::prober::{ProbeError, ProbeRunner, ProbeTarget};

/// How a service's probe attempts behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeScript {
    /// Every attempt succeeds.
    Ready,
    /// The first `n` attempts fail, later ones succeed.
    FailTimes(u32),
    /// Every attempt fails with a connection error.
    Never,
    /// Every attempt hangs until the per-attempt timeout cuts it off.
    Hang,
}

/// [`ProbeRunner`] that answers from per-service scripts and counts attempts.
#[derive(Debug)]
pub struct ScriptedProbes {
    default: ProbeScript,
    scripts: Mutex<HashMap<String, ProbeScript>>,
    attempts: Mutex<HashMap<String, u32>>,
    /// Services in the order of their first probe attempt.
    order: Mutex<Vec<String>>,
}

impl ScriptedProbes {
    pub fn new(default: ProbeScript) -> Self {
        Self {
            default,
            scripts: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
        }
    }

    /// Every service becomes ready on the first attempt.
    pub fn all_ready() -> Self {
        Self::new(ProbeScript::Ready)
    }

    #[must_use]
    pub fn with(self, service: &str, script: ProbeScript) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(service.to_string(), script);
        self
    }

    pub fn attempts(&self, service: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(service)
            .copied()
            .unwrap_or(0)
    }

    pub fn probe_order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    fn script_for(&self, service: &str) -> ProbeScript {
        self.scripts
            .lock()
            .unwrap()
            .get(service)
            .copied()
            .unwrap_or(self.default)
    }

    /// Count the attempt and return its 1-based number.
    fn count(&self, service: &str) -> u32 {
        let mut attempts = self.attempts.lock().unwrap();
        let count = attempts.entry(service.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.order.lock().unwrap().push(service.to_string());
        }
        *count
    }
}

#[async_trait]
impl ProbeRunner for ScriptedProbes {
    async fn attempt(
        &self,
        _probe: &ReadinessProbe,
        target: &ProbeTarget<'_>,
        _timeout: Duration,
    ) -> Result<(), ProbeError> {
        let attempt = self.count(target.service);
        let refused = || ProbeError::Connect {
            address: format!("{}:{}", target.host, target.port.unwrap_or_default()),
            reason: "connection refused".to_string(),
        };

        match self.script_for(target.service) {
            ProbeScript::Ready => Ok(()),
            ProbeScript::FailTimes(n) if attempt <= n => Err(refused()),
            ProbeScript::FailTimes(_) => Ok(()),
            ProbeScript::Never => Err(refused()),
            ProbeScript::Hang => std::future::pending().await,
        }
    }
}
