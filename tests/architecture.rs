//! Architecture Verification Suite
//!
//! Collaborators and services are shared across tasks, so they must stay
//! Send + Sync and usable behind trait objects.

#[cfg(test)]
mod architecture_tests {
    use coldchain_monitor::audit::AuditLogger;
    use coldchain_monitor::insight::{InsightGenerator, LlmProvider};
    use coldchain_monitor::orchestrator::TaskQueue;
    use coldchain_monitor::store::{ExcursionStore, PolicyStore, ReadingStore, RiskScoreStore, ShipmentStore};

    fn assert_send_sync<T: Send + Sync + ?Sized>() {}

    #[test]
    fn test_backends_are_thread_safe() {
        assert_send_sync::<coldchain_monitor::store::MemoryStore>();
        assert_send_sync::<coldchain_monitor::store::SqliteStore>();
        assert_send_sync::<coldchain_monitor::orchestrator::SqliteTaskQueue>();
    }

    #[test]
    fn test_services_are_thread_safe() {
        assert_send_sync::<coldchain_monitor::orchestrator::DetectionOrchestrator>();
        assert_send_sync::<coldchain_monitor::orchestrator::Worker>();
        assert_send_sync::<coldchain_monitor::orchestrator::Ingestor>();
        assert_send_sync::<coldchain_monitor::risk::RiskRecomputer>();
        assert_send_sync::<coldchain_monitor::insight::LlmInsightGenerator>();
        assert_send_sync::<coldchain_monitor::insight::CachedProvider>();
    }

    // Compile-time check that every seam is object safe.
    #[test]
    fn test_seams_are_object_safe() {
        assert_send_sync::<dyn ShipmentStore>();
        assert_send_sync::<dyn PolicyStore>();
        assert_send_sync::<dyn ReadingStore>();
        assert_send_sync::<dyn ExcursionStore>();
        assert_send_sync::<dyn RiskScoreStore>();
        assert_send_sync::<dyn AuditLogger>();
        assert_send_sync::<dyn TaskQueue>();
        assert_send_sync::<dyn InsightGenerator>();
        assert_send_sync::<dyn LlmProvider>();
    }

    #[test]
    fn test_evaluator_is_pure_over_inputs() {
        use coldchain_monitor::model::{PolicyRules, PolicyType, Reading};

        let rules = PolicyRules::defaults_for(PolicyType::Food);
        let readings = vec![Reading::new(0, 4.0), Reading::new(60_000, 9.0), Reading::new(120_000, 4.0)];
        let first = coldchain_monitor::evaluate(&readings, &rules);
        let second = coldchain_monitor::evaluate(&readings, &rules);
        assert_eq!(first, second);
    }
}
