//! Tests for metric sampling, CSV dumps and the collection loop
//!
//! Remote commands are answered by a mock command runner with canned
//! outputs, so no cluster is needed.

#[cfg(test)]
mod metric_tests {
    use crate::metrics::{Field, Metric, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn divide_by_ten(param: &Value) -> anyhow::Result<Value> {
        match param {
            Value::Int(v) => Ok(Value::Int(v / 10)),
            other => anyhow::bail!("not an int: {}", other),
        }
    }

    #[tokio::test]
    async fn test_cartesian_expansion() {
        let mut metric = Metric::new("test")
            .with_field(Field::constant("foo", 10))
            .with_field(Field::per_param(
                "cpu",
                "param",
                vec![Value::from(50), Value::from(30)],
                |param| Ok(Value::from(param.as_f64().unwrap_or_default() / 10.0)),
            ))
            .with_field(Field::constant("bar", 20))
            .with_field(Field::per_param(
                "other",
                "param2",
                vec![Value::from(100), Value::from(200)],
                divide_by_ten,
            ));

        assert_eq!(
            metric.field_names(),
            vec!["foo", "param", "cpu", "bar", "param2", "other"]
        );

        assert_eq!(metric.sample().await.unwrap(), 4);

        let expected: Vec<Vec<Value>> = vec![
            vec![10.into(), 50.into(), 5.0.into(), 20.into(), 100.into(), 10.into()],
            vec![10.into(), 50.into(), 5.0.into(), 20.into(), 200.into(), 20.into()],
            vec![10.into(), 30.into(), 3.0.into(), 20.into(), 100.into(), 10.into()],
            vec![10.into(), 30.into(), 3.0.into(), 20.into(), 200.into(), 20.into()],
        ];
        assert_eq!(metric.samples(), expected.as_slice());
    }

    #[tokio::test]
    async fn test_scalar_fields_one_row_per_sample() {
        let counter = Arc::new(AtomicUsize::new(0));
        let calls = counter.clone();
        let mut metric = Metric::new("scalars")
            .with_field(Field::constant("size", 3))
            .with_field(Field::variable_fn("tick", move || {
                Ok(Value::from(calls.fetch_add(1, Ordering::SeqCst)))
            }));

        for _ in 0..5 {
            metric.sample().await.unwrap();
        }

        assert_eq!(metric.samples().len(), 5);
        assert!(metric
            .samples()
            .iter()
            .all(|row| row.len() == metric.field_names().len()));
        assert_eq!(metric.samples()[4], vec![Value::from(3), Value::from(4)]);
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_multidimensional_field_k_rows() {
        let nodes = vec![Value::from("a"), Value::from("b"), Value::from("c")];
        let mut metric = Metric::new("per_node")
            .with_field(Field::constant("total_nodes", 3))
            .with_field(Field::per_param("mem", "node", nodes, |_| Ok(Value::from(7))))
            .with_field(Field::constant("control_plane", 1));

        assert_eq!(metric.sample().await.unwrap(), 3);
        let rows = metric.samples();
        assert_eq!(rows.len(), 3);
        for (row, node) in rows.iter().zip(["a", "b", "c"]) {
            assert_eq!(
                row,
                &vec![Value::from(3), Value::from(node), Value::from(7), Value::from(1)]
            );
        }
    }

    #[tokio::test]
    async fn test_no_fields_yields_no_rows() {
        let mut metric = Metric::new("empty");
        assert_eq!(metric.sample().await.unwrap(), 0);
        assert!(metric.samples().is_empty());
    }

    #[tokio::test]
    async fn test_producer_error_propagates() {
        let mut metric = Metric::new("broken")
            .with_field(Field::constant("foo", 1))
            .with_field(Field::variable_fn("bar", || anyhow::bail!("process not found")));

        let err = metric.sample().await.unwrap_err();
        assert!(err.to_string().contains("bar"));
        assert!(err.to_string().contains("process not found"));
        assert!(metric.samples().is_empty());
    }

    #[tokio::test]
    async fn test_dump_appends_and_writes_header_once() {
        let dir = TempDir::new().unwrap();

        let mut first = Metric::new("test")
            .with_field(Field::constant("foo", 1))
            .with_field(Field::constant("bar", 2.5));
        first.sample().await.unwrap();
        let path = first.dump(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("metric-test.csv"));

        let mut second = Metric::new("test")
            .with_field(Field::constant("foo", 3))
            .with_field(Field::constant("bar", "text"));
        second.sample().await.unwrap();
        second.sample().await.unwrap();
        second.dump(dir.path()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "foo,bar\n1,2.5\n3,text\n3,text\n");
    }

    #[tokio::test]
    async fn test_dump_before_sample_writes_header_only() {
        let dir = TempDir::new().unwrap();
        let metric = Metric::new("fresh")
            .with_field(Field::constant("foo", 1))
            .with_field(Field::per_param("value", "node", vec![Value::from("n")], |_| {
                Ok(Value::from(1))
            }));

        let path = metric.dump(dir.path()).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "foo,node,value\n");
    }

    #[tokio::test]
    async fn test_clear_keeps_file() {
        let dir = TempDir::new().unwrap();
        let mut metric = Metric::new("cleared").with_field(Field::constant("foo", 1));
        metric.sample().await.unwrap();
        let path = metric.dump(dir.path()).unwrap();

        metric.clear();
        assert!(metric.samples().is_empty());
        assert_eq!(std::fs::read_to_string(path).unwrap(), "foo\n1\n");
    }

    #[test]
    fn test_remove_field() {
        let mut metric = Metric::new("labelled")
            .with_field(Field::constant("foo", 1))
            .with_field(Field::constant("workload", "idle"));

        assert!(metric.remove_field("workload").is_some());
        assert!(metric.remove_field("workload").is_none());
        assert_eq!(metric.field_names(), vec!["foo"]);
        assert_eq!(metric.to_string(), "Metric[labelled]");
    }

    #[test]
    fn test_float_formatting() {
        let formatted: Vec<String> = [0.25, 1.0, 0.0001, 1e-5, 2.5e-7, 1.5e16, 123456.0]
            .iter()
            .map(|v| Value::from(*v).to_string())
            .collect();
        assert_eq!(
            formatted,
            vec!["0.25", "1.0", "0.0001", "1e-05", "2.5e-07", "1.5e+16", "123456.0"]
        );
        assert_eq!(Value::from(f64::NAN).to_string(), "nan");
        assert_eq!(Value::from(f64::INFINITY).to_string(), "inf");
    }

    #[tokio::test]
    async fn test_dump_small_floats() {
        let dir = TempDir::new().unwrap();
        let mut metric = Metric::new("tiny").with_field(Field::constant("latency", 0.00001));
        metric.sample().await.unwrap();
        let path = metric.dump(dir.path()).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "latency\n1e-05\n");
    }
}

#[cfg(test)]
mod collector_tests {
    use crate::metrics::{CollectorError, Field, Metric, MetricsCollector, SharedMetric, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn counting_metric(name: &str, calls: Arc<AtomicUsize>) -> SharedMetric {
        Metric::new(name)
            .with_field(Field::variable_fn("tick", move || {
                Ok(Value::from(calls.fetch_add(1, Ordering::SeqCst)))
            }))
            .into_shared()
    }

    /// Succeeds `ok_calls` times, then fails with "boom"
    fn failing_metric(ok_calls: usize) -> SharedMetric {
        let calls = AtomicUsize::new(0);
        Metric::new("failing")
            .with_field(Field::variable_fn("value", move || {
                if calls.fetch_add(1, Ordering::SeqCst) < ok_calls {
                    Ok(Value::from(1))
                } else {
                    anyhow::bail!("boom")
                }
            }))
            .into_shared()
    }

    #[tokio::test]
    async fn test_samples_at_least_once_and_dumps() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let metric = counting_metric("counter", calls.clone());

        let mut collector = MetricsCollector::builder()
            .metric(metric.clone())
            .poll_period(Duration::from_millis(10))
            .store_at(dir.path().join("run"))
            .build();

        collector
            .collect_during(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            })
            .await
            .unwrap();

        let sampled = calls.load(Ordering::SeqCst);
        assert!(sampled >= 1);
        assert!(metric.lock().await.samples().is_empty());

        let content = std::fs::read_to_string(dir.path().join("run").join("metric-counter.csv")).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines[0], "tick");
        assert_eq!(lines.len(), sampled + 1);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut collector = MetricsCollector::builder()
            .metric(counting_metric("counter", calls))
            .poll_period(Duration::from_millis(10))
            .build();

        assert!(collector.start());
        assert!(collector.is_running());
        assert!(!collector.start());

        collector.stop().await.unwrap();
        assert!(!collector.is_running());
    }

    #[tokio::test]
    async fn test_sampling_error_propagates_on_stop() {
        let dir = TempDir::new().unwrap();
        let mut collector = MetricsCollector::builder()
            .metric(failing_metric(2))
            .poll_period(Duration::from_millis(5))
            .store_at(dir.path())
            .build();

        let err = collector
            .collect_during(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        let collector_err = err.downcast_ref::<CollectorError>().unwrap();
        assert!(matches!(collector_err, CollectorError::Sampling { metric, .. } if metric == "failing"));
        assert!(format!("{:#}", err).contains("boom"));

        // Rows sampled before the failure are still dumped
        let content = std::fs::read_to_string(dir.path().join("metric-failing.csv")).unwrap();
        assert_eq!(content, "value\n1\n1\n");
    }

    #[tokio::test]
    async fn test_sampling_error_takes_precedence_over_workload_error() {
        let mut collector = MetricsCollector::builder()
            .metric(failing_metric(0))
            .poll_period(Duration::from_millis(5))
            .build();

        let err = collector
            .collect_during(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err::<(), _>(anyhow::anyhow!("workload failed"))
            })
            .await
            .unwrap_err();

        assert!(err.downcast_ref::<CollectorError>().is_some());
    }

    #[tokio::test]
    async fn test_workload_error_still_dumps() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut collector = MetricsCollector::builder()
            .metric(counting_metric("counter", calls))
            .poll_period(Duration::from_millis(10))
            .store_at(dir.path())
            .build();

        let err = collector
            .collect_during(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err::<(), _>(anyhow::anyhow!("workload failed"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "workload failed");
        assert!(dir.path().join("metric-counter.csv").exists());
    }

    #[tokio::test]
    async fn test_stop_observed_while_sleeping() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut collector = MetricsCollector::builder()
            .metric(counting_metric("counter", calls.clone()))
            .poll_period(Duration::from_secs(3600))
            .build();

        collector.start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(5), collector.stop())
            .await
            .expect("stop should not wait for the poll period")
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_metrics_sampled_in_registration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let metric = |name: &'static str| {
            let order = order.clone();
            Metric::new(name)
                .with_field(Field::variable_fn("v", move || {
                    order.lock().unwrap().push(name);
                    Ok(Value::from(0))
                }))
                .into_shared()
        };

        let mut collector = MetricsCollector::builder()
            .metrics([metric("first"), metric("second")])
            .poll_period(Duration::from_secs(3600))
            .build();

        collector.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        collector.stop().await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }
}

#[cfg(test)]
mod cluster_metric_tests {
    use crate::cluster::testing::{cluster_with, MockKube, MockRunner, UnitFactory};
    use crate::cluster::Microk8sCluster;
    use crate::metrics::{
        dqlite_cpu, dqlite_memory, ApiServerLatency, Checkpoint, Value, API_SERVER_LATENCY_BUCKET,
        API_SERVER_METRICS_COMMAND, DQLITE_CPU_COMMAND, DQLITE_MEMORY_COMMAND,
    };
    use std::sync::Arc;

    const METRICS: &str = r#"apiserver_request_duration_seconds_bucket{component="",dry_run="",group="",resource="",scope="",subresource="/readyz",verb="GET",version="",le="0.05"} 6
apiserver_request_duration_seconds_bucket{component="",dry_run="",group="",resource="",scope="",subresource="/readyz",verb="GET",version="",le="0.1"} 6
apiserver_request_duration_seconds_bucket{component="",dry_run="",group="",resource="",scope="",subresource="/readyz",verb="GET",version="",le="+Inf"} 6
apiserver_request_duration_seconds_bucket{component="",dry_run="",group="",resource="pods",scope="",subresource="",verb="WATCH",version="",le="+Inf"} 40
"#;

    fn two_node_cluster(runner: Arc<MockRunner>) -> Microk8sCluster {
        let info = UnitFactory::default().cluster_info(2, 0);
        cluster_with(info, runner, Arc::new(MockKube::new()))
    }

    #[tokio::test]
    async fn test_dqlite_memory_metric() {
        let runner = Arc::new(MockRunner::new());
        runner.respond(
            DQLITE_MEMORY_COMMAND,
            r#"[{"UnitId":"name_1","Stdout":"4\n"},{"UnitId":"name_0","Stdout":"3\n"}]"#,
        );
        let cluster = two_node_cluster(runner.clone());

        let mut metric = dqlite_memory(&cluster);
        assert_eq!(
            metric.field_names(),
            vec!["total_nodes", "control_plane", "node", "memory_KB"]
        );
        metric.sample().await.unwrap();

        assert_eq!(
            metric.samples(),
            &[
                vec![Value::from(2), Value::from(2), Value::from("name_0"), Value::from(3)],
                vec![Value::from(2), Value::from(2), Value::from("name_1"), Value::from(4)],
            ]
        );
        // A single batched call for all control plane nodes
        assert_eq!(runner.calls(), vec![("name_0,name_1".to_string(), DQLITE_MEMORY_COMMAND.to_string())]);
    }

    #[tokio::test]
    async fn test_dqlite_cpu_metric() {
        let runner = Arc::new(MockRunner::new());
        runner.respond(
            DQLITE_CPU_COMMAND,
            r#"[{"UnitId":"name_0","Stdout":"5.0\n"},{"UnitId":"name_1","Stdout":"5.0\n"}]"#,
        );
        let cluster = two_node_cluster(runner);

        let mut metric = dqlite_cpu(&cluster);
        metric.sample().await.unwrap();

        let values: Vec<_> = metric.samples().iter().map(|row| row[3].clone()).collect();
        assert_eq!(values, vec![Value::from(5.0), Value::from(5.0)]);
    }

    #[tokio::test]
    async fn test_dqlite_missing_unit_output_fails() {
        let runner = Arc::new(MockRunner::new());
        runner.respond(DQLITE_MEMORY_COMMAND, r#"[{"UnitId":"name_0","Stdout":"3\n"}]"#);
        let cluster = two_node_cluster(runner);

        let err = dqlite_memory(&cluster).sample().await.unwrap_err();
        assert!(format!("{}", err).contains("no output from name_1"));
    }

    #[tokio::test]
    async fn test_dqlite_command_failure_fails_sample() {
        let runner = Arc::new(MockRunner::new());
        runner.fail_on(DQLITE_CPU_COMMAND);
        let cluster = two_node_cluster(runner);

        assert!(dqlite_cpu(&cluster).sample().await.is_err());
    }

    #[tokio::test]
    async fn test_api_server_latency_metric() {
        let runner = Arc::new(MockRunner::new());
        runner.respond(API_SERVER_METRICS_COMMAND, METRICS);
        let cluster = two_node_cluster(runner.clone());

        let latency = Arc::new(ApiServerLatency::new(cluster));
        let mut metric = latency.metric(&[50, 95, 99]).unwrap();
        assert_eq!(metric.name(), "api_server_latency");
        assert_eq!(
            metric.field_names(),
            vec!["total_nodes", "control_plane", "percentile", "latency", "total_requests"]
        );

        metric.sample().await.unwrap();
        let expected: Vec<Vec<Value>> = [50, 95, 99]
            .iter()
            .map(|p| vec![2.into(), 2.into(), Value::from(*p), 0.05.into(), 6.into()])
            .collect();
        assert_eq!(metric.samples(), expected.as_slice());

        // Percentiles and request count share one fetch
        assert_eq!(runner.calls().len(), 1);
        assert!(API_SERVER_LATENCY_BUCKET.starts_with("apiserver_request_duration_seconds"));
    }

    #[tokio::test]
    async fn test_api_server_latency_checkpoint() {
        let runner = Arc::new(MockRunner::new());
        runner.respond(API_SERVER_METRICS_COMMAND, METRICS);
        let cluster = two_node_cluster(runner.clone());

        let latency = Arc::new(ApiServerLatency::new(cluster));
        let mut metric = latency.metric(&[50]).unwrap();

        latency.checkpoint().await.unwrap();
        // Nothing happened since the checkpoint
        metric.sample().await.unwrap();
        let idle = &metric.samples()[0];
        assert!(matches!(idle[3], Value::Float(v) if v.is_nan()));
        assert_eq!(idle[4], Value::from(0));

        let more = METRICS.replace("} 6", "} 8");
        runner.respond(API_SERVER_METRICS_COMMAND, &more);
        metric.sample().await.unwrap();
        assert_eq!(
            metric.samples()[1],
            vec![2.into(), 2.into(), Value::from(50), 0.05.into(), 2.into()]
        );
    }

    #[tokio::test]
    async fn test_idle_interval_dumps_nan_row() {
        let runner = Arc::new(MockRunner::new());
        runner.respond(API_SERVER_METRICS_COMMAND, METRICS);
        let cluster = two_node_cluster(runner);

        let latency = Arc::new(ApiServerLatency::new(cluster));
        let mut metric = latency.metric(&[50, 99]).unwrap();
        latency.checkpoint().await.unwrap();
        metric.sample().await.unwrap();

        let dir = tempfile::TempDir::new().unwrap();
        let path = metric.dump(dir.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "total_nodes,control_plane,percentile,latency,total_requests\n2,2,50,nan,0\n2,2,99,nan,0\n"
        );
    }

    #[test]
    fn test_api_server_latency_rejects_invalid_percentile() {
        let cluster = two_node_cluster(Arc::new(MockRunner::new()));
        let latency = Arc::new(ApiServerLatency::new(cluster));
        assert!(latency.metric(&[50, 100]).is_err());
    }
}
