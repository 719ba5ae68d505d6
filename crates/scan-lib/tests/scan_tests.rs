//! End-to-end scan tests against a mocked Prometheus API

use async_trait::async_trait;
use mockito::Matcher;
use scan_lib::{
    ClusterContext, Container, DiscoveryError, ErrorKind, GatewayConfig, NamespaceFilter,
    PrometheusGateway, RecommendedValue, ResourceAllocation, ResourceType, RetryPolicy,
    ScanOrchestrator, ScanRequest, ScanStatus, Severity, Workload, WorkloadDiscoverer,
    WorkloadKind,
};
use std::sync::Arc;
use std::time::Duration;

const MIB: f64 = 1024.0 * 1024.0;

struct StaticDiscoverer;

#[async_trait]
impl WorkloadDiscoverer for StaticDiscoverer {
    async fn discover(
        &self,
        cluster: &ClusterContext,
        _filter: &NamespaceFilter,
    ) -> Result<Vec<Workload>, DiscoveryError> {
        if cluster.name != "prod" {
            return Err(DiscoveryError::Unreachable("connection refused".into()));
        }
        Ok(vec![Workload {
            cluster: cluster.name.clone(),
            namespace: "shop".into(),
            kind: WorkloadKind::Deployment,
            name: "api".into(),
            containers: vec![Container {
                name: "app".into(),
                resources: ResourceAllocation {
                    cpu_request: Some(1.0),
                    cpu_limit: None,
                    memory_request: Some(512.0 * MIB),
                    memory_limit: Some(512.0 * MIB),
                },
            }],
            pods: vec!["api-7d9f-abcde".into()],
        }])
    }
}

fn matrix(values: &[f64]) -> String {
    let points: Vec<String> = values
        .iter()
        .enumerate()
        .map(|(i, v)| format!("[{}, \"{}\"]", 1_700_000_000 + i * 60, v))
        .collect();
    format!(
        r#"{{"status":"success","data":{{"resultType":"matrix","result":[{{"metric":{{"pod":"api-7d9f-abcde"}},"values":[{}]}}]}}}}"#,
        points.join(",")
    )
}

fn gateway() -> PrometheusGateway {
    PrometheusGateway::new(GatewayConfig {
        query_timeout: Duration::from_secs(5),
        retry: RetryPolicy::none(),
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_scan_against_prometheus() {
    let mut server = mockito::Server::new_async().await;
    let cpu: Vec<f64> = (1..=10).map(|i| i as f64 * 0.05).collect();
    let memory: Vec<f64> = (1..=10).map(|i| (400.0 + i as f64) * MIB).collect();

    server
        .mock("POST", "/api/v1/query_range")
        .match_body(Matcher::Regex("container_cpu_usage_seconds_total".into()))
        .with_status(200)
        .with_body(matrix(&cpu))
        .create_async()
        .await;
    server
        .mock("POST", "/api/v1/query_range")
        .match_body(Matcher::Regex("container_memory_working_set_bytes".into()))
        .with_status(200)
        .with_body(matrix(&memory))
        .create_async()
        .await;
    server
        .mock("POST", "/api/v1/query")
        .with_status(200)
        .with_body(
            r#"{"status":"success","data":{"resultType":"vector","result":[{"metric":{},"value":[1700000000,"1"]}]}}"#,
        )
        .create_async()
        .await;

    let url = server.url().parse().unwrap();
    let clusters = vec![
        ClusterContext::new("prod", url),
        ClusterContext::new("staging", "http://127.0.0.1:1".parse().unwrap()),
    ];
    let orchestrator = ScanOrchestrator::new(Arc::new(StaticDiscoverer), Arc::new(gateway()));
    let request = ScanRequest::new(clusters)
        .with_strategy("percentile", serde_json::json!({"min_samples": 10}))
        .with_window(Duration::from_secs(600), Duration::from_secs(60))
        .with_timeout(Duration::from_secs(30));

    let report = orchestrator.run_scan(request).await.unwrap();

    assert_eq!(report.status(), ScanStatus::Partial);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].kind, ErrorKind::Discovery);
    assert_eq!(report.errors[0].scope.cluster(), "staging");

    assert_eq!(report.recommendations.len(), 2);
    let cpu_rec = &report.recommendations[0];
    assert_eq!(cpu_rec.resource, ResourceType::Cpu);
    assert_eq!(cpu_rec.limit, RecommendedValue::Unset);
    assert_eq!(cpu_rec.sample_count, 10);
    // 1 core requested against roughly 0.55 recommended
    assert_eq!(cpu_rec.severity, Severity::Warning);

    let mem_rec = &report.recommendations[1];
    assert_eq!(mem_rec.resource, ResourceType::Memory);
    assert_eq!(mem_rec.oom_kills, 1);
    assert_eq!(mem_rec.severity, Severity::Critical);
    assert!(mem_rec.limit.as_value().unwrap() >= 512.0 * MIB * 1.25);

    assert_eq!(report.metadata.strategy.name, "percentile");
    assert_eq!(report.metadata.strategy.settings["min_samples"], 10);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["recommendations"][0]["request"]["state"], "value");
    assert_eq!(json["recommendations"][0]["limit"]["state"], "unset");
}

#[tokio::test]
async fn test_backend_errors_become_item_errors() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/v1/query_range")
        .with_status(400)
        .with_body(r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#)
        .create_async()
        .await;

    let orchestrator = ScanOrchestrator::new(Arc::new(StaticDiscoverer), Arc::new(gateway()));
    let request = ScanRequest::new(vec![ClusterContext::new(
        "prod",
        server.url().parse().unwrap(),
    )])
    .with_resources(vec![ResourceType::Cpu])
    .with_window(Duration::from_secs(600), Duration::from_secs(60));

    let report = orchestrator.run_scan(request).await.unwrap();
    assert_eq!(report.status(), ScanStatus::Failed);
    assert!(report.recommendations.is_empty());
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].kind, ErrorKind::Query);
}
