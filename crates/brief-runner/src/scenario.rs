use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use brief_core::{ArtifactKind, Digest, ProducerError, QueryContext, RefreshRecord, Sentiment};
use brief_storage::{ArtifactStore, InMemoryStorage, Ledger};
use serde::Deserialize;

use crate::orchestrator::{Orchestrator, Origin, RefreshOutcome, RefreshPolicy};
use crate::producer::Producer;

/// Fixed clock for fixture runs.
pub const SCENARIO_NOW: i64 = 1_700_000_000;

#[derive(Debug, Deserialize)]
pub struct Scenario {
    pub scenario_id: String,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_timeout_ms")]
    pub producer_timeout_ms: u64,
    /// Age of the newest ledger entry; absent means an empty ledger.
    pub ledger_age_secs: Option<i64>,
    pub stored: Option<ScenarioDigest>,
    pub producer: ScenarioProducer,
    pub expected: ScenarioExpected,
}

#[derive(Debug, Deserialize)]
pub struct ScenarioDigest {
    pub summary: String,
    pub sentiment: String,
}

#[derive(Debug, Deserialize)]
pub struct ScenarioProducer {
    /// ok | network_error | upstream_error | malformed | hang
    pub result: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub sentiment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScenarioExpected {
    pub producer_invoked: bool,
    /// done | unavailable
    pub outcome: String,
    /// produced | cached | degraded
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub sentiment: Option<String>,
    pub ledger_entries: usize,
    #[serde(default)]
    pub ledger_last_age_secs: Option<i64>,
}

#[derive(Debug)]
pub struct ScenarioResult {
    pub producer_invoked: bool,
    pub producer_calls: usize,
    pub outcome: RefreshOutcome,
    pub ledger: Vec<RefreshRecord>,
    pub stored_summary: Option<String>,
}

fn default_ttl_secs() -> u64 {
    6 * 60 * 60
}

fn default_timeout_ms() -> u64 {
    1_000
}

pub fn load_scenario(dir: &Path) -> Result<Scenario> {
    let p = dir.join("scenario.yaml");
    let s = std::fs::read_to_string(&p).with_context(|| format!("read scenario.yaml: {}", p.display()))?;
    let sc: Scenario = serde_yaml::from_str(&s).with_context(|| "parse scenario.yaml")?;
    Ok(sc)
}

/// Runs one orchestrator invocation against in-memory storage seeded from the
/// fixture, with a scripted producer.
pub fn simulate(dir: &Path) -> Result<(Scenario, ScenarioResult)> {
    let sc = load_scenario(dir)?;

    let storage = Arc::new(InMemoryStorage::new());
    if let Some(age) = sc.ledger_age_secs {
        storage.append(RefreshRecord { timestamp_unix: SCENARIO_NOW - age })?;
    }
    if let Some(stored) = &sc.stored {
        storage.write(ArtifactKind::Summary, &stored.summary)?;
        storage.write(ArtifactKind::Sentiment, &stored.sentiment)?;
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let producer = scripted_producer(&sc.producer, calls.clone())?;
    let policy = RefreshPolicy {
        ttl: Duration::from_secs(sc.ttl_secs),
        producer_timeout: Duration::from_millis(sc.producer_timeout_ms),
    };
    let orch = Orchestrator::new(storage.clone(), producer, policy);

    let ctx = QueryContext { topic: "scenario".into(), query: sc.scenario_id.clone(), as_of_unix: SCENARIO_NOW };
    let report = orch.refresh(&ctx).map_err(|e| anyhow!("{}: {e}", sc.scenario_id))?;

    let stored_summary = match storage.read(ArtifactKind::Summary) {
        Ok(s) => Some(s),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e.into()),
    };
    let result = ScenarioResult {
        producer_invoked: report.producer_invoked,
        producer_calls: calls.load(Ordering::SeqCst),
        outcome: report.outcome,
        ledger: storage.history()?,
        stored_summary,
    };
    Ok((sc, result))
}

fn scripted_producer(script: &ScenarioProducer, calls: Arc<AtomicUsize>) -> Result<Arc<dyn Producer>> {
    let result: Result<Digest, ProducerError> = match script.result.as_str() {
        "ok" | "hang" => {
            let summary = script.summary.clone().ok_or_else(|| anyhow!("producer.summary required"))?;
            let label = script.sentiment.as_deref().ok_or_else(|| anyhow!("producer.sentiment required"))?;
            Ok(Digest::new(summary, Sentiment::parse_label(label)?))
        }
        "network_error" => Err(ProducerError::Network("scripted network failure".into())),
        "upstream_error" => Err(ProducerError::Upstream("scripted upstream failure".into())),
        "malformed" => Err(ProducerError::Malformed("scripted malformed output".into())),
        other => return Err(anyhow!("unknown producer result: {other}")),
    };
    let hang = script.result == "hang";
    Ok(Arc::new(move |_: &QueryContext| -> Result<Digest, ProducerError> {
        calls.fetch_add(1, Ordering::SeqCst);
        if hang {
            thread::sleep(Duration::from_secs(2));
        }
        result.clone()
    }))
}

/// Compares a simulation against the fixture's expectations; returns every mismatch.
pub fn check(sc: &Scenario, res: &ScenarioResult) -> Vec<String> {
    let exp = &sc.expected;
    let mut problems = vec![];

    if res.producer_invoked != exp.producer_invoked {
        problems.push(format!("producer invoked = {}, expected {}", res.producer_invoked, exp.producer_invoked));
    }
    if res.producer_calls > 1 {
        problems.push(format!("producer called {} times", res.producer_calls));
    }
    if res.ledger.len() != exp.ledger_entries {
        problems.push(format!("ledger has {} entries, expected {}", res.ledger.len(), exp.ledger_entries));
    }
    if let Some(age) = exp.ledger_last_age_secs {
        let actual = res.ledger.last().map(|r| SCENARIO_NOW - r.timestamp_unix);
        if actual != Some(age) {
            problems.push(format!("ledger last age = {actual:?}, expected {age}"));
        }
    }

    match (&res.outcome, exp.outcome.as_str()) {
        (RefreshOutcome::Done { digest, origin }, "done") => {
            let origin_name = match origin {
                Origin::Produced => "produced",
                Origin::Cached => "cached",
                Origin::Degraded(_) => "degraded",
            };
            if let Some(o) = &exp.origin {
                if o != origin_name {
                    problems.push(format!("origin = {origin_name}, expected {o}"));
                }
            }
            if let Some(s) = &exp.summary {
                if &digest.summary != s {
                    problems.push(format!("summary = {:?}, expected {:?}", digest.summary, s));
                }
                if res.stored_summary.as_ref() != Some(s) {
                    problems.push(format!("stored summary = {:?}, expected {:?}", res.stored_summary, s));
                }
            }
            if let Some(s) = &exp.sentiment {
                if digest.sentiment.as_str() != s {
                    problems.push(format!("sentiment = {}, expected {}", digest.sentiment, s));
                }
            }
        }
        (RefreshOutcome::Unavailable { .. }, "unavailable") => {}
        (actual, expected) => problems.push(format!("outcome = {actual:?}, expected {expected}")),
    }
    problems
}
