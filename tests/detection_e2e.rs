use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;

use coldchain_monitor::audit::{export_csv, AuditEntry, AuditEventType, AuditLogger, AuditRecord};
use coldchain_monitor::insight::{InsightGenerator, LlmInsightGenerator, LlmProvider, StaticInsightGenerator};
use coldchain_monitor::model::{
    Excursion, Policy, PolicyRules, PolicyType, Reading, RiskBand, RiskFactor, RiskScore, Severity, Shipment,
    ViolationKind,
};
use coldchain_monitor::orchestrator::{
    DetectionOrchestrator, IngestRow, IngestTarget, Ingestor, Job, SkipReason, SqliteTaskQueue, TaskQueue,
    TaskStatus, Worker,
};
use coldchain_monitor::store::{ExcursionStore, MemoryStore, SqliteStore, Stores};

const MIN: i64 = 60_000;

struct MockProvider {
    calls: AtomicUsize,
    reply: Option<String>,
}

impl MockProvider {
    fn replying(text: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            reply: Some(text.to_string()),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            reply: None,
        })
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn generate(&self, _model: &str, _prompt: String, _system: Option<String>) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.reply {
            Some(text) => Ok(text.clone()),
            None => anyhow::bail!("model endpoint unreachable"),
        }
    }
}

struct Harness {
    _db: NamedTempFile,
    stores: Stores,
    queue: Arc<dyn TaskQueue>,
    orchestrator: Arc<DetectionOrchestrator>,
}

/// Fails the first `failures` calls to `append`, then delegates.
struct FlakyAudit {
    inner: Arc<MemoryStore>,
    failures: AtomicUsize,
}

#[async_trait]
impl AuditLogger for FlakyAudit {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("audit disk full");
        }
        self.inner.append(entry).await
    }

    async fn annotate_narrative(&self, audit_id: &str, text: &str) -> Result<()> {
        self.inner.annotate_narrative(audit_id, text).await
    }

    async fn get(&self, audit_id: &str) -> Result<Option<AuditRecord>> {
        self.inner.get(audit_id).await
    }

    async fn list_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<AuditRecord>> {
        self.inner.list_between(from, to).await
    }

    async fn list_for_shipment(&self, shipment_id: &str) -> Result<Vec<AuditRecord>> {
        AuditLogger::list_for_shipment(self.inner.as_ref(), shipment_id).await
    }
}

/// Fails the first `failures` calls to `insert`, then delegates.
struct FlakyExcursions {
    inner: Arc<MemoryStore>,
    failures: AtomicUsize,
}

#[async_trait]
impl ExcursionStore for FlakyExcursions {
    async fn find_in_window(&self, shipment_id: &str, from: i64, to: i64) -> Result<Option<Excursion>> {
        self.inner.find_in_window(shipment_id, from, to).await
    }

    async fn insert(&self, excursion: &Excursion) -> Result<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("excursions table locked");
        }
        self.inner.insert(excursion).await
    }

    async fn discard(&self, excursion_id: &str) -> Result<bool> {
        self.inner.discard(excursion_id).await
    }

    async fn list_for_shipment(&self, shipment_id: &str) -> Result<Vec<Excursion>> {
        ExcursionStore::list_for_shipment(self.inner.as_ref(), shipment_id).await
    }

    async fn get_excursion(&self, excursion_id: &str) -> Result<Option<Excursion>> {
        self.inner.get_excursion(excursion_id).await
    }

    async fn resolve(&self, excursion_id: &str, at: DateTime<Utc>) -> Result<bool> {
        self.inner.resolve(excursion_id, at).await
    }

    async fn count_open(&self, shipment_id: &str) -> Result<usize> {
        self.inner.count_open(shipment_id).await
    }
}

impl Harness {
    async fn new() -> Result<Self> {
        Self::over(Stores::from_backend(Arc::new(MemoryStore::new()))).await
    }

    async fn over(stores: Stores) -> Result<Self> {
        let db = NamedTempFile::new()?;
        let queue: Arc<dyn TaskQueue> = Arc::new(SqliteTaskQueue::new(db.path()).await?);
        let orchestrator = Arc::new(DetectionOrchestrator::new(stores.clone(), queue.clone()));
        Ok(Self {
            _db: db,
            stores,
            queue,
            orchestrator,
        })
    }

    fn worker(&self, insight: Arc<dyn InsightGenerator>) -> Worker {
        Worker::new(self.stores.clone(), self.queue.clone(), self.orchestrator.clone(), insight).with_max_attempts(3)
    }

    fn narrating(&self, provider: Arc<MockProvider>) -> Worker {
        self.worker(Arc::new(LlmInsightGenerator::new(provider, "mock-model")))
    }

    async fn seed(&self, shipment_id: &str, rules: PolicyRules, readings: &[(i64, f64)]) -> Result<Policy> {
        let policy = Policy::new("test policy", rules);
        self.stores.policies.put_policy(&policy).await?;
        self.stores
            .shipments
            .put_shipment(&Shipment {
                id: shipment_id.to_string(),
                facility_id: Some("FAC-A".to_string()),
                product_type: "dairy".to_string(),
                policy_id: policy.id.clone(),
            })
            .await?;
        let readings: Vec<Reading> = readings.iter().map(|&(m, t)| Reading::new(m * MIN, t)).collect();
        self.stores.readings.append_readings(shipment_id, &readings).await?;
        Ok(policy)
    }
}

fn food() -> PolicyRules {
    PolicyRules::defaults_for(PolicyType::Food)
}

const HOUR_AT_TWELVE: [(i64, f64); 4] = [(0, 4.0), (60, 12.0), (90, 12.0), (120, 4.0)];

#[tokio::test]
async fn test_food_hour_above_max_is_one_duration_excursion() -> Result<()> {
    let h = Harness::new().await?;
    h.seed("SHP-1", food(), &HOUR_AT_TWELVE).await?;

    let report = h.orchestrator.detect("SHP-1").await?;
    assert_eq!(report.evaluated, 1);
    assert_eq!(report.recorded.len(), 1);

    let excursions = h.stores.excursions.list_for_shipment("SHP-1").await?;
    assert_eq!(excursions.len(), 1);
    let e = &excursions[0];
    assert_eq!(e.kind, ViolationKind::Duration);
    assert_eq!(e.severity, Severity::Medium);
    assert_eq!(e.rule_violated, "duration");
    assert_eq!(e.temperature, Some(12.0));
    assert_eq!(e.start_time, 60 * MIN);
    assert_eq!(e.end_time, 120 * MIN);
    assert_eq!(e.duration_minutes, 60.0);

    let audit = h.stores.audit.list_for_shipment("SHP-1").await?;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].entry.event_type, AuditEventType::ExcursionDetected);
    assert_eq!(audit[0].entry.severity, Some(Severity::Medium));
    assert_eq!(audit[0].entry.details["temperatureC"], 12.0);
    assert_eq!(audit[0].narrative, None);
    Ok(())
}

#[tokio::test]
async fn test_worker_attaches_narrative_and_scores_risk() -> Result<()> {
    let h = Harness::new().await?;
    h.seed("SHP-1", food(), &HOUR_AT_TWELVE).await?;
    let provider = MockProvider::replying("Product held at 12°C for 60 minutes; quarantine pending QA review.");

    h.queue
        .enqueue(&Job::DetectShipment {
            shipment_id: "SHP-1".to_string(),
        })
        .await?;
    // detect, then its narrative and risk jobs
    assert_eq!(h.narrating(provider.clone()).run_until_idle().await?, 3);
    assert_eq!(h.queue.count(TaskStatus::Completed).await?, 3);

    let audit = h.stores.audit.list_for_shipment("SHP-1").await?;
    assert_eq!(
        audit[0].narrative.as_deref(),
        Some("Product held at 12°C for 60 minutes; quarantine pending QA review.")
    );
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    let risk = h.stores.risk_scores.latest("SHP-1").await?.expect("risk row");
    // medium floor 45 + duration bonus 20; 60 minutes is not past twice the food threshold
    assert_eq!(risk.score_value, 65);
    assert_eq!(risk.score, RiskBand::High);
    assert!(risk.factors.is_empty());

    let csv = export_csv(&audit)?;
    assert!(csv.contains("\"excursion_detected\",\"duration\",\"medium\",\"Review and quarantine as per policy\""));
    Ok(())
}

#[tokio::test]
async fn test_second_pass_on_same_data_records_nothing() -> Result<()> {
    let h = Harness::new().await?;
    h.seed("SHP-1", food(), &HOUR_AT_TWELVE).await?;

    h.orchestrator.detect("SHP-1").await?;
    let second = h.orchestrator.detect("SHP-1").await?;

    assert!(second.recorded.is_empty());
    assert_eq!(second.duplicates, 1);
    assert_eq!(h.stores.excursions.list_for_shipment("SHP-1").await?.len(), 1);
    assert_eq!(h.stores.audit.list_for_shipment("SHP-1").await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_redelivery_does_not_duplicate() -> Result<()> {
    let h = Harness::new().await?;
    h.seed("SHP-1", food(), &HOUR_AT_TWELVE).await?;

    let passes: Vec<_> = (0..8)
        .map(|_| {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.detect("SHP-1").await })
        })
        .collect();
    for pass in passes {
        pass.await??;
    }

    assert_eq!(h.stores.excursions.list_for_shipment("SHP-1").await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_repeated_minor_sharing_a_spike_start_is_a_duplicate() -> Result<()> {
    let h = Harness::new().await?;
    let readings = [(0, 5.0), (1, 9.0), (3, 5.0), (10, 9.5), (12, 5.0)];
    h.seed("SHP-1", PolicyRules::defaults_for(PolicyType::Pharma), &readings).await?;

    // two threshold spikes plus the repeated-minor pattern starting at the first spike
    let report = h.orchestrator.detect("SHP-1").await?;
    assert_eq!(report.evaluated, 3);
    assert_eq!(report.recorded.len(), 2);
    assert_eq!(report.duplicates, 1);

    let excursions = h.stores.excursions.list_for_shipment("SHP-1").await?;
    assert!(excursions.iter().all(|e| e.kind == ViolationKind::ThresholdHigh));
    let mut starts: Vec<_> = excursions.iter().map(|e| e.start_time).collect();
    starts.sort();
    assert_eq!(starts, vec![MIN, 10 * MIN]);

    h.worker(Arc::new(StaticInsightGenerator)).run_until_idle().await?;
    let risk = h.stores.risk_scores.latest("SHP-1").await?.expect("risk row");
    // medium floor 45 + one extra excursion
    assert_eq!(risk.score_value, 55);
    assert_eq!(risk.score, RiskBand::Medium);
    assert!(risk.factors.contains(&RiskFactor::MultipleExcursions));
    Ok(())
}

#[tokio::test]
async fn test_failed_audit_write_is_completed_on_redelivery() -> Result<()> {
    let backend = Arc::new(MemoryStore::new());
    let mut stores = Stores::from_backend(backend.clone());
    stores.audit = Arc::new(FlakyAudit {
        inner: backend.clone(),
        failures: AtomicUsize::new(1),
    });
    let h = Harness::over(stores).await?;
    h.seed("SHP-1", food(), &HOUR_AT_TWELVE).await?;

    let err = h.orchestrator.detect("SHP-1").await.expect_err("audit failure propagates");
    assert!(format!("{:#}", err).contains("audit disk full"));
    assert!(h.stores.excursions.list_for_shipment("SHP-1").await?.is_empty());
    assert_eq!(h.queue.count(TaskStatus::Pending).await?, 0);

    let retry = h.orchestrator.detect("SHP-1").await?;
    assert_eq!(retry.recorded.len(), 1);
    assert_eq!(h.stores.excursions.list_for_shipment("SHP-1").await?.len(), 1);
    let audit = h.stores.audit.list_for_shipment("SHP-1").await?;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].entry.event_type, AuditEventType::ExcursionDetected);
    // narrative and risk jobs of the completed pass
    assert_eq!(h.queue.count(TaskStatus::Pending).await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_worker_retries_detection_after_persistence_failures() -> Result<()> {
    let backend = Arc::new(MemoryStore::new());
    let mut stores = Stores::from_backend(backend.clone());
    stores.excursions = Arc::new(FlakyExcursions {
        inner: backend.clone(),
        failures: AtomicUsize::new(1),
    });
    stores.audit = Arc::new(FlakyAudit {
        inner: backend.clone(),
        failures: AtomicUsize::new(1),
    });
    let h = Harness::over(stores).await?;
    h.seed("SHP-1", food(), &HOUR_AT_TWELVE).await?;

    let task_id = h
        .queue
        .enqueue(&Job::DetectShipment {
            shipment_id: "SHP-1".to_string(),
        })
        .await?;
    // excursion failure, audit failure, then a completed pass with its two jobs
    assert_eq!(h.worker(Arc::new(StaticInsightGenerator)).run_until_idle().await?, 5);
    assert_eq!(h.queue.get_status(&task_id).await?, Some(TaskStatus::Completed));
    assert_eq!(h.queue.count(TaskStatus::Failed).await?, 0);

    assert_eq!(h.stores.excursions.list_for_shipment("SHP-1").await?.len(), 1);
    assert_eq!(h.stores.audit.list_for_shipment("SHP-1").await?.len(), 1);
    assert_eq!(h.stores.risk_scores.latest("SHP-1").await?.expect("risk row").score_value, 65);
    Ok(())
}

#[tokio::test]
async fn test_full_pass_on_sqlite_backend() -> Result<()> {
    let db = NamedTempFile::new()?;
    let h = Harness::over(Stores::from_backend(Arc::new(SqliteStore::new(db.path()).await?))).await?;
    h.seed("SHP-1", food(), &HOUR_AT_TWELVE).await?;
    let provider = MockProvider::replying("Held at 12°C for an hour; quarantine the lot.");

    h.queue
        .enqueue(&Job::DetectShipment {
            shipment_id: "SHP-1".to_string(),
        })
        .await?;
    assert_eq!(h.narrating(provider.clone()).run_until_idle().await?, 3);

    let excursions = h.stores.excursions.list_for_shipment("SHP-1").await?;
    assert_eq!(excursions.len(), 1);
    assert_eq!(excursions[0].kind, ViolationKind::Duration);

    let audit = h.stores.audit.list_for_shipment("SHP-1").await?;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].narrative.as_deref(), Some("Held at 12°C for an hour; quarantine the lot."));

    let risk = h.stores.risk_scores.latest("SHP-1").await?.expect("risk row");
    assert_eq!(risk.score_value, 65);
    assert_eq!(risk.score, RiskBand::High);

    // redelivery is deduplicated by the SQL window lookup
    let again = h.orchestrator.detect("SHP-1").await?;
    assert_eq!(again.duplicates, 1);
    assert!(again.recorded.is_empty());
    assert_eq!(h.stores.excursions.list_for_shipment("SHP-1").await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_inactive_or_missing_policy_is_silent() -> Result<()> {
    let h = Harness::new().await?;
    let mut policy = h.seed("SHP-1", food(), &HOUR_AT_TWELVE).await?;
    policy.active = false;
    h.stores.policies.put_policy(&policy).await?;

    let report = h.orchestrator.detect("SHP-1").await?;
    assert_eq!(report.skipped, Some(SkipReason::InactivePolicy));
    assert!(h.stores.excursions.list_for_shipment("SHP-1").await?.is_empty());
    assert_eq!(h.queue.count(TaskStatus::Pending).await?, 0);

    h.stores
        .shipments
        .put_shipment(&Shipment {
            id: "SHP-2".to_string(),
            facility_id: None,
            product_type: "dairy".to_string(),
            policy_id: "deleted".to_string(),
        })
        .await?;
    assert_eq!(h.orchestrator.detect("SHP-2").await?.skipped, Some(SkipReason::MissingPolicy));
    assert_eq!(h.orchestrator.detect("SHP-404").await?.skipped, Some(SkipReason::UnknownShipment));
    Ok(())
}

#[tokio::test]
async fn test_clean_pass_still_lowers_risk() -> Result<()> {
    let h = Harness::new().await?;
    h.seed("SHP-1", food(), &[(0, 4.0), (10, 5.0), (20, 6.0)]).await?;
    h.stores
        .risk_scores
        .upsert(&RiskScore {
            shipment_id: "SHP-1".to_string(),
            score: RiskBand::High,
            score_value: 85,
            factors: [RiskFactor::CriticalSeverity].into_iter().collect(),
            computed_at: Utc::now(),
            ai_summary: None,
        })
        .await?;

    let report = h.orchestrator.detect("SHP-1").await?;
    assert_eq!(report.evaluated, 0);
    h.worker(Arc::new(StaticInsightGenerator)).run_until_idle().await?;

    let risk = h.stores.risk_scores.latest("SHP-1").await?.expect("risk row");
    assert_eq!(risk.score, RiskBand::Low);
    assert_eq!(risk.score_value, 10);
    assert!(risk.factors.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_narrative_failure_leaves_field_empty() -> Result<()> {
    let h = Harness::new().await?;
    h.seed("SHP-1", food(), &HOUR_AT_TWELVE).await?;
    h.orchestrator.detect("SHP-1").await?;

    let provider = MockProvider::failing();
    h.narrating(provider.clone()).run_until_idle().await?;

    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.queue.count(TaskStatus::Failed).await?, 0);
    let audit = h.stores.audit.list_for_shipment("SHP-1").await?;
    assert_eq!(audit[0].narrative, None);
    assert_eq!(h.stores.excursions.list_for_shipment("SHP-1").await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_failing_job_is_retried_then_parked() -> Result<()> {
    let h = Harness::new().await?;
    let request = coldchain_monitor::insight::NarrativeRequest {
        event_type: AuditEventType::ExcursionDetected,
        rule_violated: Some("threshold_high".to_string()),
        severity: Some(Severity::High),
        details_summary: "Temperature 11°C, duration 4 min".to_string(),
    };
    let task_id = h
        .queue
        .enqueue(&Job::ExplainAuditEntry {
            audit_id: "no-such-entry".to_string(),
            request,
        })
        .await?;

    let processed = h.narrating(MockProvider::replying("text")).run_until_idle().await?;
    assert_eq!(processed, 3);
    assert_eq!(h.queue.get_status(&task_id).await?, Some(TaskStatus::Failed));
    Ok(())
}

#[tokio::test]
async fn test_ingest_creates_shipments_and_queues_one_detection_each() -> Result<()> {
    let h = Harness::new().await?;
    let policy = Policy::new("food default", food());
    h.stores.policies.put_policy(&policy).await?;

    let target = IngestTarget {
        facility_id: Some("FAC-B".to_string()),
        policy_id: policy.id.clone(),
        product_type: "seafood".to_string(),
        source: "csv".to_string(),
    };
    let mut rows: Vec<IngestRow> = HOUR_AT_TWELVE
        .iter()
        .map(|&(m, t)| IngestRow {
            shipment_id: "SHP-1".to_string(),
            reading: Reading::new(m * MIN, t),
        })
        .collect();
    rows.push(IngestRow {
        shipment_id: "SHP-2".to_string(),
        reading: Reading::new(0, 3.0),
    });

    let summary = Ingestor::new(h.stores.clone(), h.queue.clone()).ingest(&target, rows).await?;
    assert_eq!(summary.records, 5);
    assert_eq!(summary.created_shipments, 2);
    assert_eq!(summary.shipments, vec!["SHP-1".to_string(), "SHP-2".to_string()]);
    assert_eq!(h.queue.count(TaskStatus::Pending).await?, 2);

    let ingestion = h.stores.audit.get(summary.audit_id.as_deref().expect("audit id")).await?.expect("entry");
    assert_eq!(ingestion.entry.event_type, AuditEventType::DataIngestion);
    assert_eq!(ingestion.entry.details["records"], 5);

    h.worker(Arc::new(StaticInsightGenerator)).run_until_idle().await?;
    assert_eq!(h.stores.excursions.list_for_shipment("SHP-1").await?.len(), 1);
    assert!(h.stores.excursions.list_for_shipment("SHP-2").await?.is_empty());
    assert_eq!(h.stores.risk_scores.latest("SHP-2").await?.expect("row").score_value, 10);
    Ok(())
}

#[tokio::test]
async fn test_resolving_excursion_is_logged_once() -> Result<()> {
    let h = Harness::new().await?;
    h.seed("SHP-1", food(), &HOUR_AT_TWELVE).await?;
    let report = h.orchestrator.detect("SHP-1").await?;
    let excursion_id = &report.recorded[0];

    assert!(h.orchestrator.resolve_excursion(excursion_id).await?);
    assert!(!h.orchestrator.resolve_excursion(excursion_id).await?);
    assert!(!h.orchestrator.resolve_excursion("unknown").await?);
    assert_eq!(h.stores.excursions.count_open("SHP-1").await?, 0);

    let events: Vec<_> = h
        .stores
        .audit
        .list_for_shipment("SHP-1")
        .await?
        .into_iter()
        .map(|r| r.entry.event_type)
        .collect();
    assert_eq!(events, vec![AuditEventType::ExcursionDetected, AuditEventType::ExcursionResolved]);
    Ok(())
}
