// Pending dApp request table
//
// Every request is keyed by its canonical id and settles exactly once. Ids are
// per sender: an id another port already holds open gets a port-scoped key. The correlator
// never touches ports itself: settling yields a Delivery that the session posts after
// re-checking that the sender is still connected.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};

use crate::error::{codes, ProviderError};
use crate::host::PortId;
use crate::popup::PopupRoute;
use crate::protocol::{
    DappRequest, Method, MethodClass, Outcome, RequestKey, ResponseEnvelope,
};
use crate::store::Selection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Open,
    Resolved,
    Rejected,
}

/// Where an open request is waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStage {
    /// Shown (or about to be shown) on its approval route
    Approval(PopupRoute),
    /// Parked behind the setup warning until an account and network exist
    Setup(PopupRoute),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub key: RequestKey,
    pub request: DappRequest,
    pub method: Method,
    pub sender: PortId,
    pub created_at_ms: u64,
    pub status: RequestStatus,
    pub stage: PendingStage,
    seq: u64,
}

/// A response ready to be posted to its sender
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub port: PortId,
    pub envelope: ResponseEnvelope,
}

/// What the session must do next with a submitted request
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Answer right away (immediate method, unsupported method, duplicate id)
    Reply(Delivery),
    /// Open the approval route for this request
    Approval { key: RequestKey, route: PopupRoute },
    /// No account/network selected yet; `warn` is true only the first time for this id
    Setup { key: RequestKey, warn: bool },
}

pub struct RequestCorrelator {
    pending: HashMap<RequestKey, PendingRequest>,
    warned: HashSet<RequestKey>,
    selection: Selection,
    default_chain_id: u64,
    next_seq: u64,
}

impl RequestCorrelator {
    pub fn new(default_chain_id: u64) -> Self {
        Self {
            pending: HashMap::new(),
            warned: HashSet::new(),
            selection: Selection::default(),
            default_chain_id,
            next_seq: 0,
        }
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Replace the selection; returns parked requests that can now proceed, oldest first
    pub fn set_selection(&mut self, selection: Selection) -> Vec<(RequestKey, PopupRoute)> {
        self.selection = selection;
        if !self.selection.is_complete() {
            return Vec::new();
        }

        let mut promoted: Vec<&mut PendingRequest> = self
            .pending
            .values_mut()
            .filter(|p| matches!(p.stage, PendingStage::Setup(_)))
            .collect();
        promoted.sort_by_key(|p| p.seq);

        let mut ready = Vec::with_capacity(promoted.len());
        for pending in promoted {
            if let PendingStage::Setup(route) = pending.stage {
                pending.stage = PendingStage::Approval(route);
                ready.push((pending.key.clone(), route));
            }
        }
        for (key, _) in &ready {
            self.warned.remove(key);
        }
        ready
    }

    pub fn chain_id(&self) -> u64 {
        self.selection.chain_id.unwrap_or(self.default_chain_id)
    }

    pub fn submit(&mut self, request: DappRequest, sender: PortId, now_ms: u64) -> Submission {
        let base = request.id.key();

        let Some(method) = Method::parse(&request.method) else {
            tracing::debug!("Unsupported method {} (id {})", request.method, base);
            let error = ProviderError::unsupported(&request.method);
            return Submission::Reply(Delivery {
                port: sender,
                envelope: ResponseEnvelope::new(request.id, request.method, Outcome::Error(error)),
            });
        };

        let held_elsewhere = self
            .pending
            .get(&base)
            .is_some_and(|open| open.sender != sender);
        let key = if held_elsewhere {
            base.scoped(sender)
        } else {
            base
        };
        if self.pending.contains_key(&key) {
            tracing::warn!("Duplicate request id {} from port {}", key, sender);
            let error = ProviderError::new(
                codes::INTERNAL,
                format!(
                    "request id {} is already pending on this connection",
                    request.id.key()
                ),
            );
            return Submission::Reply(Delivery {
                port: sender,
                envelope: ResponseEnvelope::new(request.id, request.method, Outcome::Error(error)),
            });
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let mut pending = PendingRequest {
            key: key.clone(),
            request,
            method,
            sender,
            created_at_ms: now_ms,
            status: RequestStatus::Open,
            stage: PendingStage::Approval(PopupRoute::Approve),
            seq,
        };

        let route = match method.class() {
            MethodClass::Immediate => {
                let answer = self.answer_immediate(method);
                pending.status = RequestStatus::Resolved;
                return Submission::Reply(Self::delivery(pending, Outcome::Result(answer)));
            }
            MethodClass::Approval(route) => route,
        };

        if self.selection.is_complete() {
            pending.stage = PendingStage::Approval(route);
            self.pending.insert(key.clone(), pending);
            Submission::Approval { key, route }
        } else {
            pending.stage = PendingStage::Setup(route);
            self.pending.insert(key.clone(), pending);
            let warn = self.warned.insert(key.clone());
            Submission::Setup { key, warn }
        }
    }

    /// Settle with a result. A second settle for the same id is a no-op.
    pub fn resolve(&mut self, key: &RequestKey, result: Value) -> Option<Delivery> {
        self.settle(key, RequestStatus::Resolved, Outcome::Result(result))
    }

    /// Settle with an error. A second settle for the same id is a no-op.
    pub fn reject(&mut self, key: &RequestKey, error: ProviderError) -> Option<Delivery> {
        self.settle(key, RequestStatus::Rejected, Outcome::Error(error))
    }

    fn settle(
        &mut self,
        key: &RequestKey,
        status: RequestStatus,
        outcome: Outcome,
    ) -> Option<Delivery> {
        let Some(mut pending) = self.pending.remove(key) else {
            tracing::debug!("Request {} already settled or unknown", key);
            return None;
        };
        pending.status = status;
        self.warned.remove(key);
        Some(Self::delivery(pending, outcome))
    }

    fn delivery(pending: PendingRequest, outcome: Outcome) -> Delivery {
        Delivery {
            port: pending.sender,
            envelope: ResponseEnvelope::new(pending.request.id, pending.request.method, outcome),
        }
    }

    pub fn fetch(&self, key: &RequestKey) -> Option<&PendingRequest> {
        self.pending
            .get(key)
            .filter(|p| p.status == RequestStatus::Open)
    }

    /// Drop every request sent by `port`; nothing is delivered
    pub fn drop_sender(&mut self, port: PortId) -> Vec<PendingRequest> {
        let keys: Vec<RequestKey> = self
            .pending
            .values()
            .filter(|p| p.sender == port)
            .map(|p| p.key.clone())
            .collect();
        let mut orphans: Vec<PendingRequest> = keys
            .iter()
            .filter_map(|key| {
                self.warned.remove(key);
                self.pending.remove(key)
            })
            .map(|mut p| {
                p.status = RequestStatus::Rejected;
                p
            })
            .collect();
        orphans.sort_by_key(|p| p.seq);
        orphans
    }

    /// Reject every request waiting on a popup (the dApp popup was closed)
    pub fn reject_waiting(&mut self, error: ProviderError) -> Vec<Delivery> {
        let mut waiting: Vec<(u64, RequestKey)> = self
            .pending
            .values()
            .map(|p| (p.seq, p.key.clone()))
            .collect();
        waiting.sort();
        waiting
            .into_iter()
            .filter_map(|(_, key)| self.reject(&key, error.clone()))
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.pending.len()
    }

    fn answer_immediate(&self, method: Method) -> Value {
        let chain_id = self.chain_id();
        match method {
            Method::ChainIdHex => json!(format!("0x{chain_id:x}")),
            Method::ChainId | Method::NetVersion => json!(chain_id.to_string()),
            Method::CurrentNetwork => json!({
                "chainId": format!("0x{chain_id:x}"),
                "name": network_name(chain_id),
            }),
            // only immediate methods reach here
            _ => Value::Null,
        }
    }
}

fn network_name(chain_id: u64) -> &'static str {
    match chain_id {
        1 => "mainnet",
        11155111 => "sepolia",
        5 => "goerli",
        17000 => "holesky",
        _ => "unknown",
    }
}
