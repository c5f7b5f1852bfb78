use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    http::StatusCode,
    routing::get,
    Router,
};
use jobrelay::error::ExecutionError;
use jobrelay::worker::{HttpRecipeSource, RecipeSource};

const RECIPE: &str = "FROM alpine:3.19\nCMD [\"true\"]\n";

async fn serve_recipes() -> SocketAddr {
    let app = Router::new()
        .route("/hello.Dockerfile", get(|| async { RECIPE }))
        .route(
            "/broken",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        )
        .route("/big", get(|| async { "x".repeat(64 * 1024) }))
        .route(
            "/chunked",
            get(|| async {
                // no content-length: the cap must trip while reading
                let chunks = (0..64).map(|_| Ok::<_, std::io::Error>(Bytes::from(vec![b'y'; 1024])));
                Body::from_stream(tokio_stream::iter(chunks))
            }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                RECIPE
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_fetch_returns_body() {
    let addr = serve_recipes().await;
    let source = HttpRecipeSource::new(Duration::from_secs(2)).unwrap();

    let body = source
        .fetch(&format!("http://{}/hello.Dockerfile", addr))
        .await
        .unwrap();
    assert_eq!(body, RECIPE.as_bytes());
}

#[tokio::test]
async fn test_fetch_non_success_is_fetch_error() {
    let addr = serve_recipes().await;
    let source = HttpRecipeSource::new(Duration::from_secs(2)).unwrap();

    let missing = source.fetch(&format!("http://{}/missing", addr)).await;
    match missing {
        Err(ExecutionError::Fetch(msg)) => assert!(msg.contains("404")),
        other => panic!("expected fetch error, got {:?}", other),
    }

    let broken = source.fetch(&format!("http://{}/broken", addr)).await;
    match broken {
        Err(ExecutionError::Fetch(msg)) => assert!(msg.contains("500")),
        other => panic!("expected fetch error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_fetch_times_out() {
    let addr = serve_recipes().await;
    let source = HttpRecipeSource::new(Duration::from_millis(200)).unwrap();

    let started = std::time::Instant::now();
    let result = source.fetch(&format!("http://{}/slow", addr)).await;
    assert!(matches!(result, Err(ExecutionError::Fetch(_))));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_fetch_rejects_oversized_body() {
    let addr = serve_recipes().await;
    let source = HttpRecipeSource::new(Duration::from_secs(2))
        .unwrap()
        .with_max_bytes(16 * 1024);

    for path in ["big", "chunked"] {
        match source.fetch(&format!("http://{}/{}", addr, path)).await {
            Err(ExecutionError::Fetch(msg)) => assert!(msg.contains("exceeds"), "{}: {}", path, msg),
            other => panic!("{}: expected fetch error, got {:?}", path, other),
        }
    }

    // a recipe under the cap still comes through
    let body = source
        .fetch(&format!("http://{}/hello.Dockerfile", addr))
        .await
        .unwrap();
    assert_eq!(body, RECIPE.as_bytes());
}
