//! Shared scripted executor for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use fleetquery::{RemoteCall, RemoteExecutor, Result, Row, WorkspaceId};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

type Responder = dyn Fn(&RemoteCall, usize) -> Result<Vec<Row>> + Send + Sync;

/// Answers calls from a closure and records every call it receives.
/// The closure gets the call and its zero-based sequence number.
pub struct ScriptedExecutor {
    responder: Box<Responder>,
    calls: Mutex<Vec<RemoteCall>>,
    delay: Option<Duration>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&RemoteCall, usize) -> Result<Vec<Row>> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
            delay: None,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Every call takes `delay` before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Most calls that were in flight at the same time
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn execute(&self, call: &RemoteCall) -> Result<Vec<Row>> {
        let seq = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(call.clone());
            calls.len() - 1
        };
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        match self.delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        (self.responder)(call, seq)
    }
}

pub fn row(value: Value) -> Row {
    value.as_object().cloned().expect("row literal must be an object")
}

pub fn ids(raw: &[&str]) -> Vec<WorkspaceId> {
    raw.iter().map(|id| WorkspaceId::from(*id)).collect()
}
