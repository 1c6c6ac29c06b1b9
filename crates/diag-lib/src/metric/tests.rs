//! Tests for metric slicing

#[cfg(test)]
mod block_tests {
    use crate::metric::{
        block_seconds, endpoint_dir, estimate_size, metric_file_name, query_with_labels,
        sub_windows, MAX_BLOCK_SECS, MIN_BLOCK_SECS,
    };
    use crate::models::{CollectWindow, MetricFilter};
    use chrono::{DateTime, Duration, Utc};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn t(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_block_seconds_clamps() {
        assert_eq!(block_seconds(0, 10_000), None);
        assert_eq!(block_seconds(1, 10_000), Some(MAX_BLOCK_SECS));
        assert_eq!(block_seconds(10_000, 10_000), Some(3600));
        assert_eq!(block_seconds(1_000_000, 10_000), Some(MIN_BLOCK_SECS));
        // zero limit falls back to the default
        assert_eq!(block_seconds(10_000, 0), Some(3600));
    }

    #[test]
    fn test_sub_windows_walk_backward() {
        let w = CollectWindow::new(t("2024-01-01T00:00:00Z"), t("2024-01-01T00:10:00Z")).unwrap();
        let pieces = sub_windows(&w, 300);
        assert_eq!(
            pieces,
            vec![
                (t("2024-01-01T00:05:00Z"), t("2024-01-01T00:10:00Z")),
                (t("2024-01-01T00:00:00Z"), t("2024-01-01T00:05:00Z")),
            ]
        );

        let w = CollectWindow::new(t("2024-01-01T00:00:00Z"), t("2024-01-01T00:11:40Z")).unwrap();
        let pieces = sub_windows(&w, 300);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[2], (t("2024-01-01T00:00:00Z"), t("2024-01-01T00:01:40Z")));

        let at = t("2024-01-01T00:00:00Z");
        assert!(sub_windows(&CollectWindow::new(at, at).unwrap(), 300).is_empty());
    }

    #[test]
    fn test_names_and_selectors() {
        assert_eq!(
            metric_file_name("up", t("2024-01-01T00:00:00Z"), t("2024-01-01T00:10:00Z"), true),
            "up_2024-01-01T00:00:00Z_2024-01-01T00:10:00Z.json.zst"
        );
        assert_eq!(endpoint_dir("10.0.0.9:9090"), "10.0.0.9-9090");
        assert_eq!(endpoint_dir("http://10.0.0.9:9090/"), "10.0.0.9-9090");

        let mut labels = BTreeMap::new();
        assert_eq!(query_with_labels("up", &labels), "up");
        labels.insert("tidb_cluster".to_string(), "basic".to_string());
        assert_eq!(query_with_labels("up", &labels), r#"up{tidb_cluster="basic"}"#);
    }

    #[test]
    fn test_estimate_size() {
        // 11 * 100 metrics * 4 instances * 600s * 2.5%
        assert_eq!(estimate_size(100, 4, 600), 66_000);
        assert_eq!(estimate_size(0, 4, 600), 0);
        assert_eq!(estimate_size(10, 4, 0), 0);
    }

    proptest! {
        #[test]
        fn prop_block_within_bounds(series in 1u64..5_000_000, limit in 1u64..100_000) {
            let b = block_seconds(series, limit).unwrap();
            prop_assert!((MIN_BLOCK_SECS..=MAX_BLOCK_SECS).contains(&b));
            if b > MIN_BLOCK_SECS {
                prop_assert!(b as u128 * series as u128 <= 3600 * limit as u128);
            }
        }

        #[test]
        fn prop_sub_windows_cover_window(secs in 1i64..200_000, block in 300i64..7200) {
            let start = t("2024-01-01T00:00:00Z");
            let w = CollectWindow::new(start, start + Duration::seconds(secs)).unwrap();
            let pieces = sub_windows(&w, block);
            prop_assert_eq!(pieces.first().unwrap().1, w.end);
            prop_assert_eq!(pieces.last().unwrap().0, w.start);
            for pair in pieces.windows(2) {
                prop_assert_eq!(pair[0].0, pair[1].1);
            }
            for (a, b) in &pieces {
                prop_assert!((*b - *a).num_seconds() <= block);
            }
        }

        #[test]
        fn prop_filter_inclusion(
            metrics in proptest::collection::vec("[a-c]{1,4}", 0..20),
            include in proptest::collection::vec("[a-c]{1,2}", 0..3),
            exclude in proptest::collection::vec("[a-c]{1,2}", 0..3),
        ) {
            let filter = MetricFilter { include: include.clone(), exclude: exclude.clone() };
            let kept = filter.apply(&metrics);
            let expected: Vec<String> = metrics
                .iter()
                .filter(|m| {
                    (include.is_empty() || include.iter().any(|p| m.starts_with(p.as_str())))
                        && !exclude.iter().any(|e| m.starts_with(e.as_str()))
                })
                .cloned()
                .collect();
            prop_assert_eq!(kept, expected);
        }
    }
}

#[cfg(test)]
mod slicer_tests {
    use crate::http::{HttpFetcher, HttpOptions};
    use crate::metric::{MetricSlicer, SliceOptions};
    use crate::models::{CollectWindow, MetricFilter};
    use chrono::{DateTime, Utc};
    use mockito::Matcher;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    const SERIES_2: &str = r#"{"status":"success","data":[{"__name__":"m","a":"1"},{"__name__":"m","a":"2"}]}"#;
    const QUERY_BODY: &str = r#"{"status":"success","data":{"resultType":"matrix","result":[]}}"#;

    fn window(from: &str, to: &str) -> CollectWindow {
        let p = |s: &str| DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc);
        CollectWindow::new(p(from), p(to)).unwrap()
    }

    fn ten_minutes() -> CollectWindow {
        window("2024-01-01T00:00:00Z", "2024-01-01T00:10:00Z")
    }

    fn slicer(endpoints: Vec<String>, opts: SliceOptions) -> MetricSlicer {
        MetricSlicer::new(HttpFetcher::new(&HttpOptions::default()).unwrap(), endpoints, opts)
    }

    async fn catalog_mock(server: &mut mockito::ServerGuard, names: &[&str]) -> mockito::Mock {
        let body = serde_json::json!({"status": "success", "data": names}).to_string();
        server
            .mock("GET", "/api/v1/label/__name__/values")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_filtered_metrics_are_dumped() {
        let mut server = mockito::Server::new_async().await;
        let _catalog = catalog_mock(&mut server, &["storage_x", "storage_y", "sql_a", "net_b"]).await;
        let _series = server
            .mock("GET", "/api/v1/series")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(SERIES_2)
            .create_async()
            .await;
        let queries = server
            .mock("POST", "/api/v1/query")
            .match_body(Matcher::Regex(r"%5B600s%5D".to_string()))
            .with_status(200)
            .with_body(QUERY_BODY)
            .expect(3)
            .create_async()
            .await;

        let mut opts = SliceOptions::new(ten_minutes());
        opts.filter = MetricFilter::from_prefixes(["storage_", "sql_"]);
        opts.compress = false;
        let slicer = slicer(vec![server.url()], opts);

        let (endpoint, metrics) = slicer.catalog().await.unwrap();
        assert_eq!(endpoint, server.url());
        assert_eq!(metrics, vec!["storage_x", "storage_y", "sql_a"]);

        let dir = TempDir::new().unwrap();
        let report = slicer
            .slice(&metrics, dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        queries.assert_async().await;
        assert_eq!(report.files, 3);
        assert_eq!(report.failed_queries, 0);

        let host_dir = dir
            .path()
            .join("monitor/metrics")
            .join(server.host_with_port().replace(':', "-"));
        let mut names: Vec<String> = std::fs::read_dir(&host_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "sql_a_2024-01-01T00:00:00Z_2024-01-01T00:10:00Z.json",
                "storage_x_2024-01-01T00:00:00Z_2024-01-01T00:10:00Z.json",
                "storage_y_2024-01-01T00:00:00Z_2024-01-01T00:10:00Z.json",
            ]
        );
        let body = std::fs::read_to_string(host_dir.join(&names[0])).unwrap();
        assert_eq!(body, QUERY_BODY);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_every_endpoint_gets_its_own_dump() {
        let mut first = mockito::Server::new_async().await;
        let mut second = mockito::Server::new_async().await;
        let mut mocks = Vec::new();
        for server in [&mut first, &mut second] {
            mocks.push(
                server
                    .mock("GET", "/api/v1/series")
                    .match_query(Matcher::Any)
                    .with_status(200)
                    .with_body(SERIES_2)
                    .create_async()
                    .await,
            );
            mocks.push(
                server
                    .mock("POST", "/api/v1/query")
                    .with_status(200)
                    .with_body(QUERY_BODY)
                    .expect(2)
                    .create_async()
                    .await,
            );
        }

        let mut opts = SliceOptions::new(ten_minutes());
        opts.compress = false;
        let slicer = slicer(vec![first.url(), second.url()], opts);
        let metrics = vec!["up".to_string(), "tikv_x".to_string()];

        let dir = TempDir::new().unwrap();
        let report = slicer
            .slice(&metrics, dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        for mock in &mocks {
            mock.assert_async().await;
        }
        assert_eq!(report.files, 4);
        assert_eq!(report.failed_queries, 0);

        for server in [&first, &second] {
            let host_dir = dir
                .path()
                .join("monitor/metrics")
                .join(server.host_with_port().replace(':', "-"));
            let mut names: Vec<String> = std::fs::read_dir(&host_dir)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            assert_eq!(
                names,
                vec![
                    "tikv_x_2024-01-01T00:00:00Z_2024-01-01T00:10:00Z.json",
                    "up_2024-01-01T00:00:00Z_2024-01-01T00:10:00Z.json",
                ]
            );
        }
    }

    #[tokio::test]
    async fn test_failed_sub_window_is_retried_then_dropped() {
        let mut server = mockito::Server::new_async().await;
        let _catalog = catalog_mock(&mut server, &["up"]).await;
        let _series = server
            .mock("GET", "/api/v1/series")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(SERIES_2)
            .create_async()
            .await;
        let failing = server
            .mock("POST", "/api/v1/query")
            .with_status(500)
            .with_body("boom")
            .expect(3)
            .create_async()
            .await;

        let slicer = slicer(vec![server.url()], SliceOptions::new(ten_minutes()));
        let dir = TempDir::new().unwrap();
        let report = slicer
            .slice(&["up".to_string()], dir.path(), &CancellationToken::new())
            .await
            .unwrap();

        failing.assert_async().await;
        assert_eq!(report.files, 0);
        assert_eq!(report.failed_queries, 1);
    }

    #[tokio::test]
    async fn test_empty_window_issues_no_queries() {
        let mut server = mockito::Server::new_async().await;
        let catalog = catalog_mock(&mut server, &["up"]).await;
        let _series = server
            .mock("GET", "/api/v1/series")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(SERIES_2)
            .create_async()
            .await;
        let queries = server
            .mock("POST", "/api/v1/query")
            .expect(0)
            .create_async()
            .await;

        let w = window("2024-01-01T00:00:00Z", "2024-01-01T00:00:00Z");
        let slicer = slicer(vec![server.url()], SliceOptions::new(w));
        let (_, metrics) = slicer.catalog().await.unwrap();
        let report = slicer
            .slice(&metrics, TempDir::new().unwrap().path(), &CancellationToken::new())
            .await
            .unwrap();

        catalog.assert_async().await;
        queries.assert_async().await;
        assert_eq!(report.files, 0);
    }

    #[tokio::test]
    async fn test_metric_without_series_is_skipped() {
        let mut server = mockito::Server::new_async().await;
        let _series = server
            .mock("GET", "/api/v1/series")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"status":"success","data":[]}"#)
            .create_async()
            .await;
        let queries = server
            .mock("POST", "/api/v1/query")
            .expect(0)
            .create_async()
            .await;

        let slicer = slicer(vec![server.url()], SliceOptions::new(ten_minutes()));
        let report = slicer
            .slice(&["idle".to_string()], TempDir::new().unwrap().path(), &CancellationToken::new())
            .await
            .unwrap();
        queries.assert_async().await;
        assert_eq!(report.idle_metrics, 1);
    }

    #[tokio::test]
    async fn test_catalog_falls_back_to_next_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let _catalog = catalog_mock(&mut server, &["up"]).await;

        let slicer = slicer(
            vec!["http://127.0.0.1:1".to_string(), server.url()],
            SliceOptions::new(ten_minutes()),
        );
        let (endpoint, metrics) = slicer.catalog().await.unwrap();
        assert_eq!(endpoint, server.url());
        assert_eq!(metrics, vec!["up"]);
    }

    #[tokio::test]
    async fn test_catalog_fails_when_no_endpoint_answers() {
        let slicer = slicer(vec![], SliceOptions::new(ten_minutes()));
        assert!(slicer.catalog().await.is_err());
    }

    #[tokio::test]
    async fn test_alerts_are_saved_compressed() {
        let mut server = mockito::Server::new_async().await;
        let alerts = server
            .mock("POST", "/api/v1/query")
            .match_body(Matcher::UrlEncoded("query".to_string(), "ALERTS".to_string()))
            .with_status(200)
            .with_body(QUERY_BODY)
            .create_async()
            .await;

        let slicer = slicer(vec![server.url()], SliceOptions::new(ten_minutes()));
        let dir = TempDir::new().unwrap();
        let written = slicer.alerts(dir.path()).await.unwrap();
        alerts.assert_async().await;

        assert_eq!(written.len(), 1);
        assert!(written[0].ends_with(format!(
            "monitor/alerts/{}/alerts.json.zst",
            server.host_with_port().replace(':', "-")
        )));
        let raw = std::fs::read(&written[0]).unwrap();
        assert_eq!(zstd::decode_all(&raw[..]).unwrap(), QUERY_BODY.as_bytes());
    }
}
