//! Tests for the remote executor and its transfer throttle

#[cfg(test)]
mod executor_tests {
    use crate::error::DiagError;
    use crate::executor::{
        normalize_arch, shell_quote, sudo_wrap, Direction, HelperCache, HelperSpec, Transfer,
    };
    use crate::http::{HttpFetcher, HttpOptions};
    use crate::testutil::{mock_executor, sample_cluster, MockState};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn transfer(direction: Direction, src: &str, dst: &str) -> Transfer {
        Transfer {
            src: src.to_string(),
            dst: dst.to_string(),
            direction,
            limit_kbps: 0,
            compress: false,
        }
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(sudo_wrap("dmesg"), "sudo -H -n bash -c 'dmesg'");
    }

    #[tokio::test]
    async fn test_connections_are_reused_per_host() {
        let dir = TempDir::new().unwrap();
        let cluster = sample_cluster();
        let (executor, state) =
            mock_executor(&cluster, MockState::default(), dir.path(), dir.path());

        executor.mkdir("10.0.0.1", "/tmp/diag").await.unwrap();
        executor.shell("10.0.0.1", "ss -lanp", false).await.unwrap();
        executor.rmdir("10.0.0.1", "/tmp/diag").await.unwrap();
        executor.shell("10.0.0.2", "true", false).await.unwrap();

        assert_eq!(state.connects.load(Ordering::SeqCst), 2);
        assert_eq!(
            state.commands_on("10.0.0.1"),
            vec![
                "mkdir -p '/tmp/diag'".to_string(),
                "ss -lanp".to_string(),
                "rm -rf '/tmp/diag'".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_shell_checked_reports_remote_exit() {
        let dir = TempDir::new().unwrap();
        let cluster = sample_cluster();
        let state = MockState {
            failing: ["sysctl".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let (executor, _) = mock_executor(&cluster, state, dir.path(), dir.path());

        let out = executor.shell("10.0.0.1", "sysctl -a", false).await.unwrap();
        assert_eq!(out.code, 1);

        let err = executor
            .shell_checked("10.0.0.1", "sysctl -a", false)
            .await
            .unwrap_err();
        assert!(matches!(err, DiagError::RemoteExit { code: 1, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_host_fails_every_operation() {
        let dir = TempDir::new().unwrap();
        let cluster = sample_cluster();
        let state = MockState {
            unreachable: ["10.0.0.2".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let (executor, _) = mock_executor(&cluster, state, dir.path(), dir.path());

        let err = executor.mkdir("10.0.0.2", "/tmp/x").await.unwrap_err();
        assert_eq!(err.kind(), "unreachable");
        assert!(executor.mkdir("10.0.0.1", "/tmp/x").await.is_ok());
    }

    #[tokio::test]
    async fn test_copy_file_honors_cancellation() {
        let dir = TempDir::new().unwrap();
        let cluster = sample_cluster();
        let (executor, state) =
            mock_executor(&cluster, MockState::default(), dir.path(), dir.path());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let dst = dir.path().join("out.log");
        let err = executor
            .copy_file(
                "10.0.0.1",
                &transfer(Direction::Download, "/remote/a.log", dst.to_str().unwrap()),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DiagError::Cancelled));
        assert_eq!(state.transfer_count(), 0);
    }

    #[tokio::test]
    async fn test_copy_component_sends_cached_helper() {
        let helpers = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        std::fs::write(helpers.path().join("scraper"), b"#!/bin/sh\n").unwrap();

        let cluster = sample_cluster();
        let (executor, state) =
            mock_executor(&cluster, MockState::default(), cache.path(), helpers.path());

        let spec = HelperSpec::new(
            "scraper",
            "0.1.0",
            std::env::consts::OS,
            normalize_arch(std::env::consts::ARCH),
        );
        let dst = executor
            .copy_component("10.0.0.3", &spec, "/tmp/diag-s/bin", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(dst, "/tmp/diag-s/bin/scraper");

        let cached = executor.cache().path_of(&spec);
        assert!(cached.exists());

        let transfers = state.transfers.lock().unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].1.src, cached.to_string_lossy());
        assert_eq!(transfers[0].1.direction, Direction::Upload);
        drop(transfers);
        assert!(state
            .commands_on("10.0.0.3")
            .contains(&"chmod 755 '/tmp/diag-s/bin/scraper'".to_string()));
    }

    #[tokio::test]
    async fn test_missing_foreign_helper_without_mirror_fails() {
        let dir = TempDir::new().unwrap();
        let cluster = sample_cluster();
        let (executor, _) = mock_executor(&cluster, MockState::default(), dir.path(), dir.path());

        let spec = HelperSpec::new("scraper", "0.1.0", "plan9", "mips");
        let err = executor.download(&spec, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), "io");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_downloads_fill_cache_once() {
        let helpers = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let body = vec![7u8; 8 * 1024 * 1024];
        std::fs::write(helpers.path().join("scraper"), &body).unwrap();

        let fetcher = HttpFetcher::new(&HttpOptions::default()).unwrap();
        let cache = Arc::new(
            HelperCache::new(root.path(), None, fetcher).with_sibling_dir(helpers.path()),
        );
        let spec = HelperSpec::new(
            "scraper",
            "0.1.0",
            std::env::consts::OS,
            normalize_arch(std::env::consts::ARCH),
        );

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let spec = spec.clone();
            handles.push(tokio::spawn(async move {
                cache.download(&spec, &CancellationToken::new()).await
            }));
        }
        for handle in handles {
            let path = handle.await.unwrap().unwrap();
            assert_eq!(path, cache.path_of(&spec));
        }

        let cached = cache.path_of(&spec);
        assert_eq!(std::fs::metadata(&cached).unwrap().len(), body.len() as u64);
        let leftovers: Vec<_> = std::fs::read_dir(cached.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_download_leaves_cache_empty() {
        let helpers = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        std::fs::write(helpers.path().join("scraper"), b"#!/bin/sh\n").unwrap();

        let fetcher = HttpFetcher::new(&HttpOptions::default()).unwrap();
        let cache = HelperCache::new(root.path(), None, fetcher).with_sibling_dir(helpers.path());
        let spec = HelperSpec::new(
            "scraper",
            "0.1.0",
            std::env::consts::OS,
            normalize_arch(std::env::consts::ARCH),
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = cache.download(&spec, &cancel).await.unwrap_err();
        assert!(matches!(err, DiagError::Cancelled));
        assert!(!cache.path_of(&spec).exists());

        // A later call is not stuck on the failed fill
        let path = cache.download(&spec, &CancellationToken::new()).await.unwrap();
        assert!(path.exists());
    }
}

#[cfg(test)]
mod throttle_tests {
    use crate::executor::{copy_throttled, Throttle};
    use std::io::Cursor;
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_unlimited_copy_is_exact() {
        let data = vec![1u8; 100_000];
        let mut out = Vec::new();
        let n = copy_throttled(
            &mut Cursor::new(&data),
            &mut out,
            &Throttle::unlimited(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(n, 100_000);
        assert_eq!(out, data);
    }

    #[test]
    fn test_limit_bounds_average_throughput() {
        // 80 Kbit/s = 10240 bytes per second with a one-second burst
        let throttle = Throttle::new(80);
        assert_eq!(throttle.chunk_size(), 10_240);

        let data = vec![0u8; 25_600];
        let mut out = Vec::new();
        let start = Instant::now();
        copy_throttled(
            &mut Cursor::new(&data),
            &mut out,
            &throttle,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(out.len(), data.len());
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[test]
    fn test_cancelled_copy_stops() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut out = Vec::new();
        let err = copy_throttled(
            &mut Cursor::new(vec![0u8; 10]),
            &mut out,
            &Throttle::unlimited(),
            &cancel,
        )
        .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Interrupted);
        assert!(out.is_empty());
    }
}
