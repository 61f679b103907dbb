//! State-machine guards and failure paths that need no PostgreSQL
//! binaries: everything here fails before a child process could exist.

use embedded_pg::{Config, EmbeddedPostgres, Error};

#[tokio::test]
async fn stop_without_start_has_no_side_effects() {
    let mut server = EmbeddedPostgres::new(Config::default());
    let err = server.stop().await.expect_err("stop must be rejected");

    assert!(matches!(err, Error::NotStarted));
    assert_eq!(err.to_string(), "server has not been started");
}

#[tokio::test]
async fn occupied_port_is_reported_before_anything_is_fetched() {
    let listener = std::net::TcpListener::bind("127.0.0.1:9887").expect("bind port 9887");

    let mut server = EmbeddedPostgres::new(Config::default().port(9887));
    let err = server.start().await.expect_err("start must be rejected");

    assert_eq!(err.to_string(), "process already listening on port 9887");
    drop(listener);

    // The guard failure leaves the controller reusable.
    let err = server.stop().await.expect_err("no server is running");
    assert!(matches!(err, Error::NotStarted));
}

#[tokio::test]
async fn fetch_404_surfaces_the_requested_version() {
    let mut repository = mockito::Server::new_async().await;
    let _mock = repository
        .mock("GET", mockito::Matcher::Any)
        .with_status(404)
        .create_async()
        .await;

    let temp = tempfile::tempdir().expect("tempdir");
    let cache_path = temp.path().join("archive.txz");
    let config = Config::default()
        .port(54_361)
        .version("13.1.0".into())
        .binary_repository_url(repository.url())
        .cache_path(cache_path.to_str().expect("utf8 cache path"));

    let mut server = EmbeddedPostgres::new(config);
    let err = server.start().await.expect_err("404 must fail the start");

    assert_eq!(err.to_string(), "no version found matching 13.1.0");
}

#[tokio::test]
async fn checksum_mismatch_aborts_the_start() {
    let mut repository = mockito::Server::new_async().await;
    let _jar = repository
        .mock(
            "GET",
            mockito::Matcher::Regex(r"\.jar$".to_owned()),
        )
        .with_status(200)
        .with_body("these bytes do not hash to the sidecar value")
        .create_async()
        .await;
    let _sidecar = repository
        .mock(
            "GET",
            mockito::Matcher::Regex(r"\.sha256$".to_owned()),
        )
        .with_status(200)
        .with_body("0000000000000000000000000000000000000000000000000000000000000000")
        .create_async()
        .await;

    let temp = tempfile::tempdir().expect("tempdir");
    let cache_path = temp.path().join("archive.txz");
    let config = Config::default()
        .port(54_362)
        .binary_repository_url(repository.url())
        .cache_path(cache_path.to_str().expect("utf8 cache path"));

    let mut server = EmbeddedPostgres::new(config);
    let err = server.start().await.expect_err("bad checksum must fail");

    assert_eq!(err.to_string(), "downloaded checksums do not match");
    assert!(!cache_path.exists(), "nothing may be cached on mismatch");
}

#[tokio::test]
async fn unreachable_repository_is_a_connect_error() {
    // Port 1 is reserved and never listening.
    let base = "http://127.0.0.1:1";
    let temp = tempfile::tempdir().expect("tempdir");
    let cache_path = temp.path().join("archive.txz");
    let config = Config::default()
        .port(54_363)
        .binary_repository_url(base)
        .cache_path(cache_path.to_str().expect("utf8 cache path"));

    let mut server = EmbeddedPostgres::new(config);
    let err = server.start().await.expect_err("dead endpoint must fail");

    assert_eq!(err.to_string(), format!("unable to connect to {base}"));
}
