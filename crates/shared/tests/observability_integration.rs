//! 可观测性模块集成测试
//!
//! 测试 metrics、tracing 和配置的核心功能。

// ============================================================================
// 指标记录测试
// ============================================================================

mod metrics_tests {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use segment_shared::observability::metrics::{
        record_candidate_evaluation, record_pushdown_query, record_rule_build,
    };

    #[test]
    fn test_record_without_recorder() {
        // 未安装 recorder 时为空操作
        record_rule_build("Customer", "ok", 0.002);
        record_candidate_evaluation("Cart", false);
        record_pushdown_query("TIMEOUT", 5.0);
    }

    #[test]
    fn test_metrics_rendered_by_prometheus() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            record_rule_build("Customer", "ok", 0.001);
            record_rule_build("Customer", "CIRCULAR_REFERENCE", 0.001);
            record_candidate_evaluation("Cart", true);
            record_pushdown_query("ok", 0.02);
        });

        let output = handle.render();
        assert!(output.contains("segment_rule_builds_total"));
        assert!(output.contains(r#"status="CIRCULAR_REFERENCE""#));
        assert!(output.contains("segment_cart_evaluations_total"));
        assert!(output.contains(r#"matched="true""#));
        assert!(output.contains(r#"segment_pushdown_queries_total{status="ok"} 1"#));
        assert!(output.contains("segment_pushdown_query_duration_seconds"));
    }

    #[test]
    fn test_metrics_with_edge_cases() {
        record_rule_build("", "", 0.0);
        record_pushdown_query("ok", f64::MAX);
        record_pushdown_query("CANCELLED", 0.0);
    }
}

// ============================================================================
// 日志测试
// ============================================================================

mod tracing_tests {
    use segment_shared::observability::tracing::init_for_tests;

    #[test]
    fn test_init_for_tests_twice() {
        init_for_tests();
        init_for_tests();
        tracing::info!(rule_set_id = 1, "test log");
    }
}

// ============================================================================
// 配置测试
// ============================================================================

mod config_tests {
    use segment_shared::observability::ObservabilityConfig;

    #[test]
    fn test_default_config() {
        let config = ObservabilityConfig::default();
        assert!(config.service_name.is_empty());
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.log_level, "info");
        assert!(!config.json_logs);
        assert!(!config.metrics_enabled);
    }

    #[test]
    fn test_config_from_env() {
        // 使用默认值，因为环境变量可能未设置
        let config = ObservabilityConfig::from_env("segment-preview");
        assert_eq!(config.service_name, "segment-preview");
    }

    #[test]
    fn test_custom_config() {
        let config = ObservabilityConfig {
            service_name: "segment-preview".to_string(),
            log_level: "debug".to_string(),
            json_logs: true,
            metrics_enabled: true,
            metrics_port: 9091,
        };

        assert_eq!(config.metrics_port, 9091);
        assert_eq!(config.log_level, "debug");
        assert!(config.json_logs);
        assert!(config.metrics_enabled);
    }
}

// ============================================================================
// Guard 测试
// ============================================================================

mod guard_tests {
    use segment_shared::observability::ObservabilityGuard;

    #[test]
    fn test_empty_guard() {
        let guard = ObservabilityGuard::empty();
        drop(guard);
    }
}
