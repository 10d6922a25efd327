//! End-to-end fan-out harness
//!
//! One producer and many requesters share a listing through a real
//! [`Broker`]. A seeded RNG decides when requesters join, which diffs the
//! producer emits and when the producer drops and comes back. At the end
//! every requester's reconstructed view must equal the broker's cache, and
//! the cache must equal what the producer last published.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

use linkbus_core::{
    DiffKind, RequestId, ResponseMessage, BASE_TAG, DISCONNECTED_TS_TAG, IS_TAG, LINK_DATA_TAG,
};
use linkbus_crypto::SessionAuthenticator;
use linkbus_runtime::{Broker, BrokerConfig};

use crate::simulator::SimulatedLink;

// ============================================================================
// REQUESTER VIEW
// ============================================================================

/// What a requester believes the listing is, rebuilt from what it received
#[derive(Clone, Debug, Default)]
pub struct ListView {
    entries: BTreeMap<String, Value>,
    disconnects: usize,
    messages: usize,
}

impl ListView {
    /// Apply one response addressed to this requester
    pub fn apply(&mut self, response: &ResponseMessage) {
        self.messages += 1;
        let Some(updates) = &response.updates else {
            return;
        };

        let refresh = updates
            .iter()
            .any(|u| matches!(DiffKind::of(u), DiffKind::Positional(IS_TAG)));
        if refresh {
            self.entries.clear();
        }

        for update in updates {
            match DiffKind::of(update) {
                DiffKind::Removal(name) => {
                    self.entries.remove(name);
                }
                DiffKind::Positional(DISCONNECTED_TS_TAG) => {
                    self.entries.clear();
                    self.disconnects += 1;
                }
                DiffKind::Positional(tag) => {
                    self.entries.insert(tag.to_string(), update.clone());
                }
                DiffKind::Unrecognized => {}
            }
        }
    }

    pub fn entries(&self) -> &BTreeMap<String, Value> {
        &self.entries
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects
    }

    pub fn messages(&self) -> usize {
        self.messages
    }
}

/// Key a list of entries by tag
pub fn keyed(entries: &[Value]) -> BTreeMap<String, Value> {
    entries
        .iter()
        .filter_map(|e| match DiffKind::of(e) {
            DiffKind::Positional(tag) => Some((tag.to_string(), e.clone())),
            _ => None,
        })
        .collect()
}

// ============================================================================
// HARNESS
// ============================================================================

#[derive(Clone, Debug)]
pub struct FanoutTestConfig {
    pub requesters: usize,
    pub steps: usize,
    /// Probability per step that the producer drops and reconnects
    pub churn: f64,
    /// Probability per step that the producer republishes everything
    pub refresh: f64,
    pub seed: u64,
}

impl Default for FanoutTestConfig {
    fn default() -> Self {
        FanoutTestConfig {
            requesters: 8,
            steps: 200,
            churn: 0.0,
            refresh: 0.05,
            seed: 7,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FanoutTestResult {
    /// Every view equals the broker cache and the cache equals the producer
    pub converged: bool,
    pub violations: Vec<String>,
    pub diffs_published: usize,
    pub reconnects: usize,
    pub messages_delivered: usize,
}

impl FanoutTestResult {
    pub fn passed(&self) -> bool {
        self.converged && self.violations.is_empty()
    }
}

struct Requester {
    link: SimulatedLink,
    rid: Option<RequestId>,
    view: ListView,
}

/// Fan-out harness around a single producer
pub struct FanoutTestHarness {
    config: FanoutTestConfig,
    rng: StdRng,
    broker: Broker,
    producer: SimulatedLink,
    /// Children the producer currently publishes
    children: BTreeMap<String, Value>,
    upstream: Option<RequestId>,
    requesters: Vec<Requester>,
    diffs_published: usize,
    reconnects: usize,
    violations: Vec<String>,
}

const PRODUCER: &str = "producer";
const CHILD_POOL: usize = 8;

impl FanoutTestHarness {
    pub fn new(config: FanoutTestConfig) -> Self {
        let authenticator = SessionAuthenticator::with_rng(StdRng::seed_from_u64(config.seed));
        let broker = Broker::with_authenticator(BrokerConfig::default(), Arc::new(authenticator))
            .unwrap_or_else(|e| panic!("default config rejected: {}", e));

        let requesters = (0..config.requesters)
            .map(|i| Requester {
                link: SimulatedLink::requester(&format!("viewer{}", i)),
                rid: None,
                view: ListView::default(),
            })
            .collect();

        FanoutTestHarness {
            rng: StdRng::seed_from_u64(config.seed.wrapping_add(1)),
            config,
            broker,
            producer: SimulatedLink::responder(PRODUCER).with_link_data(json!({"zone": "test"})),
            children: BTreeMap::new(),
            upstream: None,
            requesters,
            diffs_published: 0,
            reconnects: 0,
            violations: Vec::new(),
        }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    fn listing_path(&self) -> String {
        format!("{}/{}", self.broker.config().downstream_prefix, PRODUCER)
    }

    fn violation(&mut self, message: String) {
        self.violations.push(message);
    }

    pub fn run(&mut self) -> FanoutTestResult {
        if let Err(e) = self.producer.connect(&self.broker) {
            self.violation(format!("producer connect: {}", e));
        }
        for i in 0..self.requesters.len() {
            if let Err(e) = self.requesters[i].link.connect(&self.broker) {
                self.violation(format!("requester {} connect: {}", i, e));
            }
        }

        for _ in 0..self.config.steps {
            self.step();
            self.pump();
        }

        // Everyone joins eventually
        for i in 0..self.requesters.len() {
            if self.requesters[i].rid.is_none() {
                self.join(i);
            }
        }
        self.pump();

        let converged = self.check_convergence();
        FanoutTestResult {
            converged,
            violations: self.violations.clone(),
            diffs_published: self.diffs_published,
            reconnects: self.reconnects,
            messages_delivered: self.requesters.iter().map(|r| r.view.messages()).sum(),
        }
    }

    fn step(&mut self) {
        if self.rng.gen_bool(self.config.churn) {
            self.producer.disconnect(&self.broker);
            self.upstream = None;
            self.pump();
            if let Err(e) = self.producer.connect(&self.broker) {
                self.violation(format!("producer reconnect: {}", e));
            }
            self.reconnects += 1;
            return;
        }

        let waiting: Vec<usize> = (0..self.requesters.len())
            .filter(|&i| self.requesters[i].rid.is_none())
            .collect();
        if !waiting.is_empty() && self.rng.gen_bool(0.2) {
            let i = waiting[self.rng.gen_range(0..waiting.len())];
            self.join(i);
            return;
        }

        let Some(upstream) = self.upstream else {
            return;
        };
        let batch = if self.rng.gen_bool(self.config.refresh) {
            self.full_listing()
        } else {
            vec![self.random_diff()]
        };
        self.diffs_published += 1;
        if let Err(e) = self.producer.respond(&self.broker, upstream, batch) {
            self.violation(format!("producer respond: {}", e));
        }
    }

    fn join(&mut self, i: usize) {
        let path = self.listing_path();
        match self.requesters[i].link.list(&self.broker, &path) {
            Ok(rid) => self.requesters[i].rid = Some(rid),
            Err(e) => self.violation(format!("requester {} list: {}", i, e)),
        }
    }

    fn full_listing(&self) -> Vec<Value> {
        let mut batch = vec![json!([IS_TAG, "node"])];
        batch.extend(self.children.values().cloned());
        batch
    }

    fn random_diff(&mut self) -> Value {
        let name = format!("c{}", self.rng.gen_range(0..CHILD_POOL));
        if self.children.contains_key(&name) && self.rng.gen_bool(0.3) {
            self.children.remove(&name);
            return json!({"name": name, "change": "remove"});
        }
        let entry = json!([name, {"$is": "node", "rev": self.diffs_published}]);
        self.children.insert(name, entry.clone());
        entry
    }

    /// Deliver everything queued by the broker
    fn pump(&mut self) {
        loop {
            let requests = self.producer.take_requests();
            if requests.is_empty() {
                break;
            }
            for request in requests {
                if request.method.as_deref() != Some("list") {
                    continue;
                }
                self.upstream = Some(request.rid);
                let listing = self.full_listing();
                if let Err(e) = self.producer.respond(&self.broker, request.rid, listing) {
                    self.violation(format!("producer initial listing: {}", e));
                }
            }
        }

        let mut bad_rids = Vec::new();
        for (i, requester) in self.requesters.iter_mut().enumerate() {
            for response in requester.link.take_responses() {
                if response.rid != requester.rid {
                    bad_rids.push(format!("requester {} got rid {:?}", i, response.rid));
                    continue;
                }
                requester.view.apply(&response);
            }
        }
        self.violations.extend(bad_rids);
    }

    fn check_convergence(&mut self) -> bool {
        let Some(stream) = self
            .broker
            .streams()
            .find_producer(PRODUCER)
            .and_then(|p| p.list_stream("/"))
        else {
            self.violation("no list stream for the producer root".to_string());
            return false;
        };

        let cache = keyed(&stream.snapshot());
        let mut expected = self.children.clone();
        expected.insert(IS_TAG.to_string(), json!([IS_TAG, "node"]));
        expected.insert(BASE_TAG.to_string(), json!([BASE_TAG, self.listing_path()]));
        expected.insert(LINK_DATA_TAG.to_string(), json!([LINK_DATA_TAG, {"zone": "test"}]));

        let mut converged = true;
        if cache != expected {
            self.violation(format!("cache {:?} != published {:?}", cache, expected));
            converged = false;
        }
        for i in 0..self.requesters.len() {
            if self.requesters[i].view.entries() != &cache {
                let view = self.requesters[i].view.entries().clone();
                self.violation(format!("requester {} view {:?} != cache", i, view));
                converged = false;
            }
        }
        converged
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

/// Late joiners with no producer churn
pub fn test_basic_fanout() -> FanoutTestResult {
    FanoutTestHarness::new(FanoutTestConfig::default()).run()
}

/// Producer drops and reconnects while requesters come and go
pub fn test_producer_churn() -> FanoutTestResult {
    FanoutTestHarness::new(FanoutTestConfig {
        churn: 0.05,
        steps: 400,
        seed: 11,
        ..Default::default()
    })
    .run()
}
