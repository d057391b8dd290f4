//! Scripted environment for exercising the publisher without a network
//!
//! Every request is recorded with the (tokio) time it was made, so tests can
//! check batch contents, ordering and backoff spacing. Outcomes are scripted
//! per request, and requests can be held in flight until released.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::error::{Error, Result};

use super::client::Environment;
use super::events::EventBatch;

/// Permits handed out by `release_all`, enough for any test
const RELEASE_ALL_PERMITS: usize = 1024;

/// One request seen by the scripted environment
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub at: Instant,
    pub endpoint: String,
    pub batch: EventBatch,
}

#[derive(Debug)]
struct Script {
    outcomes: VecDeque<bool>,
    default_success: bool,
    beacon: Option<bool>,
    blocking_success: bool,
    hold: bool,
    requests: Vec<RecordedRequest>,
    beacon_batches: Vec<EventBatch>,
    blocking_batches: Vec<EventBatch>,
}

/// Test double for [`Environment`]
///
/// Defaults: asynchronous requests succeed, no beacon mechanism, blocking
/// requests succeed.
#[derive(Debug)]
pub struct ScriptedEnvironment {
    script: Mutex<Script>,
    gate: Semaphore,
}

impl Default for ScriptedEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEnvironment {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script {
                outcomes: VecDeque::new(),
                default_success: true,
                beacon: None,
                blocking_success: true,
                hold: false,
                requests: Vec::new(),
                beacon_batches: Vec::new(),
                blocking_batches: Vec::new(),
            }),
            gate: Semaphore::new(0),
        }
    }

    /// Every unscripted asynchronous request fails
    pub fn failing(self) -> Self {
        self.script().default_success = false;
        self
    }

    /// No network at all: asynchronous and blocking requests fail, no beacon
    pub fn offline(self) -> Self {
        {
            let mut script = self.script();
            script.default_success = false;
            script.blocking_success = false;
            script.beacon = None;
        }
        self
    }

    /// Provide a beacon mechanism that accepts (`true`) or refuses payloads
    pub fn with_beacon(self, accepts: bool) -> Self {
        self.script().beacon = Some(accepts);
        self
    }

    /// Queue outcomes for the next asynchronous requests, in order
    pub fn push_outcomes(&self, outcomes: &[bool]) {
        self.script().outcomes.extend(outcomes.iter().copied());
    }

    /// Change the outcome of unscripted asynchronous requests
    pub fn set_default_success(&self, success: bool) {
        self.script().default_success = success;
    }

    /// Keep subsequent asynchronous requests in flight until [`release`](Self::release)
    pub fn hold_requests(&self) {
        self.script().hold = true;
    }

    /// Let one held request complete
    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    /// Stop holding requests and let every waiting one complete
    pub fn release_all(&self) {
        self.script().hold = false;
        self.gate.add_permits(RELEASE_ALL_PERMITS);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.script().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.script().requests.len()
    }

    pub fn beacon_batches(&self) -> Vec<EventBatch> {
        self.script().beacon_batches.clone()
    }

    pub fn blocking_batches(&self) -> Vec<EventBatch> {
        self.script().blocking_batches.clone()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn decode(body: &str) -> EventBatch {
    serde_json::from_str(body).unwrap_or_default()
}

#[async_trait]
impl Environment for ScriptedEnvironment {
    async fn post_json(&self, endpoint: &str, body: String) -> Result<()> {
        let (success, hold) = {
            let mut script = self.script();
            script.requests.push(RecordedRequest {
                at: Instant::now(),
                endpoint: endpoint.to_string(),
                batch: decode(&body),
            });
            let success = script
                .outcomes
                .pop_front()
                .unwrap_or(script.default_success);
            (success, script.hold)
        };

        if hold {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }

        if success {
            Ok(())
        } else {
            Err(Error::Delivery("API error (503 Service Unavailable): scripted".to_string()))
        }
    }

    fn send_beacon(&self, _endpoint: &str, body: &str) -> Option<bool> {
        let mut script = self.script();
        let accepts = script.beacon?;
        if accepts {
            script.beacon_batches.push(decode(body));
        }
        Some(accepts)
    }

    fn post_json_blocking(&self, _endpoint: &str, body: &str) -> Result<()> {
        let mut script = self.script();
        script.blocking_batches.push(decode(body));
        if script.blocking_success {
            Ok(())
        } else {
            Err(Error::Delivery("HTTP request failed: network unreachable".to_string()))
        }
    }

    fn user_agent(&self) -> Option<String> {
        Some("scripted-environment".to_string())
    }
}
