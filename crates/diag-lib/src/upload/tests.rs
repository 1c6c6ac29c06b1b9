//! Tests for the upload service client

#[cfg(test)]
mod uploader_tests {
    use crate::error::DiagError;
    use crate::packager::{generate_header, package_uuid, Compression, Encryption, PackageHeader};
    use crate::upload::{chunk_count, ClinicClient, History, UploadOptions, Uploader};
    use mockito::Matcher;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn write_package(dir: &Path, body_len: usize) -> PathBuf {
        let header = PackageHeader {
            cluster_id: "42".into(),
            cluster_type: "tidb-cluster".into(),
            encryption: Encryption::None,
            compression: Compression::Zstd,
            ext: String::new(),
        };
        let mut bytes = generate_header(&header).unwrap();
        bytes.extend((0..body_len).map(|i| (i % 251) as u8));
        let path = dir.join("diag-test.diag");
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn client(server: &mockito::Server) -> ClinicClient {
        ClinicClient::new(reqwest::Client::new(), server.url(), "tok")
    }

    fn query(uuid: &str, pairs: &[(&str, &str)]) -> Matcher {
        let mut all = vec![Matcher::UrlEncoded("uuid".into(), uuid.into())];
        all.extend(
            pairs
                .iter()
                .map(|(k, v)| Matcher::UrlEncoded(k.to_string(), v.to_string())),
        );
        Matcher::AllOf(all)
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, 1024), 0);
        assert_eq!(chunk_count(1024, 1024), 1);
        assert_eq!(chunk_count(1025, 1024), 2);
        assert_eq!(chunk_count(300, 0), 0);
    }

    #[tokio::test]
    async fn test_resumed_upload_sends_only_missing_chunks() {
        let dir = TempDir::new().unwrap();
        let package = write_package(dir.path(), 5 * 1024 + 100);
        let uuid = package_uuid(&package, None).unwrap();
        let mut server = mockito::Server::new_async().await;

        let precreate = server
            .mock("POST", "/clinic/api/v1/diag/precreate")
            .match_query(query(&uuid, &[("length", "5220"), ("encryption", "none"), ("compression", "zstd")]))
            .match_header("authorization", "Bearer tok")
            .match_header("x-clinic-client", "upload")
            .with_status(200)
            .with_body(r#"{"Partseq": 4, "BlockBytes": 1024}"#)
            .create_async()
            .await;
        let chunk5 = server
            .mock("POST", "/clinic/api/v1/diag/upload")
            .match_query(query(&uuid, &[("sequence", "5"), ("length", "1024")]))
            .match_header("content-type", "application/octet-stream")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let chunk6 = server
            .mock("POST", "/clinic/api/v1/diag/upload")
            .match_query(query(&uuid, &[("sequence", "6"), ("length", "100")]))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let flush = server
            .mock("POST", "/clinic/api/v1/diag/flush")
            .match_query(query(&uuid, &[("issue", "ISSUE-1")]))
            .with_status(200)
            .with_body(r#"{"result": "https://clinic.example/diag/files?uuid=abc"}"#)
            .expect(1)
            .create_async()
            .await;

        let history_dir = dir.path().join("home");
        let uploader = Uploader::new(client(&server)).with_history(&history_dir);
        let mut opts = UploadOptions::new(&package);
        opts.issue = Some("ISSUE-1".into());
        let url = uploader
            .upload(&opts, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(url, "https://clinic.example/diag/files?uuid=abc");
        precreate.assert_async().await;
        chunk5.assert_async().await;
        chunk6.assert_async().await;
        flush.assert_async().await;
        assert_eq!(History::load(&history_dir).unwrap().entries(), &[url]);
    }

    #[tokio::test]
    async fn test_complete_upload_goes_straight_to_flush() {
        let dir = TempDir::new().unwrap();
        let package = write_package(dir.path(), 2048);
        let mut server = mockito::Server::new_async().await;

        let _precreate = server
            .mock("POST", "/clinic/api/v1/diag/precreate")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"sequence": 2, "blockbytes": 1024}"#)
            .create_async()
            .await;
        let chunks = server
            .mock("POST", "/clinic/api/v1/diag/upload")
            .match_query(Matcher::Any)
            .with_status(200)
            .expect(0)
            .create_async()
            .await;
        let _flush = server
            .mock("POST", "/clinic/api/v1/diag/flush")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("https://clinic.example/diag/files?uuid=done")
            .create_async()
            .await;

        let url = Uploader::new(client(&server))
            .upload(&UploadOptions::new(&package), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(url, "https://clinic.example/diag/files?uuid=done");
        chunks.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_chunk_aborts_before_flush() {
        let dir = TempDir::new().unwrap();
        let package = write_package(dir.path(), 3 * 1024);
        let uuid = package_uuid(&package, None).unwrap();
        let mut server = mockito::Server::new_async().await;

        let _precreate = server
            .mock("POST", "/clinic/api/v1/diag/precreate")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"sequence": 0, "blockbytes": 1024}"#)
            .create_async()
            .await;
        let mut _accepted = Vec::new();
        for seq in ["1", "3"] {
            _accepted.push(
                server
                    .mock("POST", "/clinic/api/v1/diag/upload")
                    .match_query(query(&uuid, &[("sequence", seq)]))
                    .with_status(200)
                    .create_async()
                    .await,
            );
        }
        let _bad = server
            .mock("POST", "/clinic/api/v1/diag/upload")
            .match_query(query(&uuid, &[("sequence", "2")]))
            .with_status(500)
            .with_body("disk full")
            .create_async()
            .await;
        let flush = server
            .mock("POST", "/clinic/api/v1/diag/flush")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let mut opts = UploadOptions::new(&package);
        opts.concurrency = 1;
        let err = Uploader::new(client(&server))
            .upload(&opts, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            DiagError::Http { status, body } => {
                assert_eq!(status, 500);
                assert!(body.contains("chunk 2"), "{}", body);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        flush.assert_async().await;
    }

    #[tokio::test]
    async fn test_precreate_status_mapping() {
        let dir = TempDir::new().unwrap();
        let package = write_package(dir.path(), 10);

        for (status, body) in [(401, ""), (403, ""), (400, "bad alias")] {
            let mut server = mockito::Server::new_async().await;
            let _m = server
                .mock("POST", "/clinic/api/v1/diag/precreate")
                .match_query(Matcher::Any)
                .with_status(status)
                .with_body(body)
                .create_async()
                .await;
            let err = Uploader::new(client(&server))
                .upload(&UploadOptions::new(&package), &CancellationToken::new())
                .await
                .unwrap_err();
            match (status, err) {
                (401, DiagError::AuthFailed { .. }) => {}
                (403, DiagError::ServerReject(msg)) => assert!(msg.contains("forbidden")),
                (400, DiagError::ServerReject(msg)) => assert!(msg.contains("bad alias")),
                (s, other) => panic!("status {s} mapped to {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_oversized_block_is_rejected() {
        let dir = TempDir::new().unwrap();
        let package = write_package(dir.path(), 10);
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/clinic/api/v1/diag/precreate")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"sequence": 0, "blockbytes": 104857600}"#)
            .create_async()
            .await;
        let err = Uploader::new(client(&server))
            .upload(&UploadOptions::new(&package), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DiagError::ServerReject(_)));
    }
}

#[cfg(test)]
mod download_tests {
    use crate::upload::{
        parse_download_url, split_ranges, ByteRange, ClinicClient, DownloadOptions, Downloader,
        History, HISTORY_LIMIT,
    };
    use mockito::Matcher;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    const CONTENT: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123";

    async fn server_with_head() -> (mockito::ServerGuard, mockito::Mock) {
        let mut server = mockito::Server::new_async().await;
        let head = server
            .mock("HEAD", "/api/internal/files/pkg-1")
            .with_status(200)
            .with_header("accept-ranges", "bytes")
            .with_header("content-length", "30")
            .with_header("content-disposition", "attachment; filename=\"pkg.diag\"")
            .with_body(CONTENT)
            .create_async()
            .await;
        (server, head)
    }

    async fn range_mock(server: &mut mockito::ServerGuard, from: usize, to: usize, hits: usize) -> mockito::Mock {
        server
            .mock("GET", "/api/internal/files/pkg-1")
            .match_header("range", format!("bytes={}-{}", from, to).as_str())
            .with_status(206)
            .with_body(&CONTENT[from..=to])
            .expect(hits)
            .create_async()
            .await
    }

    #[test]
    fn test_split_ranges() {
        assert!(split_ranges(0, 50).is_empty());
        assert_eq!(split_ranges(30, 50), vec![ByteRange { from: 0, to: 29 }]);
        assert_eq!(
            split_ranges(100, 50),
            vec![ByteRange { from: 0, to: 49 }, ByteRange { from: 50, to: 99 }]
        );
        let many = split_ranges(1000, 1);
        assert_eq!(many.len(), 10);
        assert_eq!(many.last().unwrap().to, 999);
        assert_eq!(many.iter().map(|r| r.len()).sum::<u64>(), 1000);
    }

    #[test]
    fn test_parse_download_url() {
        let (endpoint, uuid) =
            parse_download_url("https://clinic.example.com/diag/files?uuid=abc-def").unwrap();
        assert_eq!(endpoint, "https://clinic.example.com");
        assert_eq!(uuid, "abc-def");
        assert!(parse_download_url("https://clinic.example.com/other").is_err());
    }

    #[tokio::test]
    async fn test_download_in_ranges() {
        let (mut server, _head) = server_with_head().await;
        let parts = vec![
            range_mock(&mut server, 0, 9, 1).await,
            range_mock(&mut server, 10, 19, 1).await,
            range_mock(&mut server, 20, 29, 1).await,
        ];

        let dir = TempDir::new().unwrap();
        let downloader =
            Downloader::new(ClinicClient::new(reqwest::Client::new(), server.url(), "tok")).with_range_size(10);
        let path = downloader
            .download(
                "pkg-1",
                &DownloadOptions {
                    dest_dir: dir.path().to_path_buf(),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("pkg.diag"));
        assert_eq!(std::fs::read(&path).unwrap(), CONTENT);
        assert!(!dir.path().join("pkg.diag.tmp").exists());
        for p in parts {
            p.assert_async().await;
        }
    }

    #[tokio::test]
    async fn test_download_resumes_written_ranges() {
        let (mut server, _head) = server_with_head().await;
        let first = range_mock(&mut server, 0, 9, 0).await;
        let rest = vec![
            range_mock(&mut server, 10, 19, 1).await,
            range_mock(&mut server, 20, 29, 1).await,
        ];

        let dir = TempDir::new().unwrap();
        let mut partial = CONTENT[..10].to_vec();
        partial.resize(CONTENT.len(), 0);
        std::fs::write(dir.path().join("pkg.diag.tmp"), partial).unwrap();

        let downloader =
            Downloader::new(ClinicClient::new(reqwest::Client::new(), server.url(), "tok")).with_range_size(10);
        let path = downloader
            .download(
                "pkg-1",
                &DownloadOptions {
                    dest_dir: dir.path().to_path_buf(),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), CONTENT);
        first.assert_async().await;
        for p in rest {
            p.assert_async().await;
        }
    }

    #[tokio::test]
    async fn test_ids_by_alias() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/api/internal/files/alias/incident")
            .match_header("authorization", Matcher::Regex("Bearer .+".into()))
            .with_status(200)
            .with_body(r#"{"Ids": ["a", "b"]}"#)
            .create_async()
            .await;
        let _empty = server
            .mock("GET", "/api/internal/files/cluster/7")
            .with_status(200)
            .with_body(r#"{"ids": []}"#)
            .create_async()
            .await;

        let downloader = Downloader::new(ClinicClient::new(reqwest::Client::new(), server.url(), "tok"));
        assert_eq!(downloader.ids_by_alias("incident").await.unwrap(), vec!["a", "b"]);
        assert!(downloader.ids_by_cluster("7").await.is_err());
    }

    #[test]
    fn test_history_keeps_newest_ten() {
        let dir = TempDir::new().unwrap();
        let mut history = History::load(dir.path()).unwrap();
        for i in 0..12 {
            history.push(&format!("https://clinic.example/diag/files?uuid={}", i));
        }
        history.store().unwrap();

        let loaded = History::load(dir.path()).unwrap();
        assert_eq!(loaded.entries().len(), HISTORY_LIMIT);
        assert!(loaded.entries()[0].ends_with("uuid=11"));
        assert!(loaded.entries()[9].ends_with("uuid=2"));
    }
}
