//! Redirect state machine integration tests.

use bytes::Bytes;
use polyglot_fetch::{
    Body, Context, Error, RedirectMode, RequestBody, RequestOptions,
};

mod helpers;
use helpers::mock_server::{redirect_response, text_response, MockServer};

/// `/hop/N` redirects to `/hop/N-1`; `/hop/0` answers 200.
async fn countdown_server(status: u16) -> MockServer {
    MockServer::start(move |req| {
        let n: u32 = req
            .path
            .strip_prefix("/hop/")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        if n == 0 {
            text_response(200, "OK", "landed")
        } else {
            redirect_response(status, &format!("/hop/{}", n - 1))
        }
    })
    .await
}

#[tokio::test]
async fn test_follow_redirect_chain() {
    let server = countdown_server(302).await;
    let ctx = Context::new();

    let url = format!("{}/hop/3", server.url());
    let mut resp = ctx.fetch(&url, RequestOptions::new()).await.unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.text().await.unwrap(), "landed");
    assert_eq!(
        resp.effective_url.as_ref().unwrap().path(),
        "/hop/0",
        "effective URL records the final hop"
    );
    assert_eq!(server.request_count(), 4);
}

#[tokio::test]
async fn test_follow_limit_exceeded() {
    let server = countdown_server(302).await;
    let ctx = Context::new();

    let url = format!("{}/hop/5", server.url());
    let err = ctx
        .fetch(&url, RequestOptions::new().follow(4))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MaxRedirect { count: 4, .. }));
    // 1 initial + 4 followed, the fifth hop is never dispatched.
    assert_eq!(server.request_count(), 5);
}

#[tokio::test]
async fn test_follow_zero_disallows_redirects() {
    let server = countdown_server(301).await;
    let ctx = Context::new();

    let url = format!("{}/hop/1", server.url());
    let err = ctx
        .fetch(&url, RequestOptions::new().follow(0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MaxRedirect { count: 0, .. }));
    assert_eq!(server.request_count(), 1);
}

#[tokio::test]
async fn test_manual_mode_returns_3xx_with_absolute_location() {
    let server = MockServer::start(|_req| redirect_response(302, "/next?page=2")).await;
    let ctx = Context::new();

    let resp = ctx
        .fetch(
            &server.url(),
            RequestOptions::new().redirect(RedirectMode::Manual),
        )
        .await
        .unwrap();
    assert_eq!(resp.status, 302);
    assert_eq!(
        resp.location().unwrap(),
        format!("{}/next?page=2", server.url())
    );
}

#[tokio::test]
async fn test_error_mode_fails_on_redirect() {
    let server = MockServer::start(|_req| redirect_response(301, "/elsewhere")).await;
    let ctx = Context::new();

    let err = ctx
        .fetch(
            &server.url(),
            RequestOptions::new().redirect(RedirectMode::Error),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoRedirect(_)));
}

#[tokio::test]
async fn test_redirect_without_location_is_returned() {
    let server = MockServer::start(|_req| {
        b"HTTP/1.1 302 Found\r\ncontent-length: 0\r\n\r\n".to_vec()
    })
    .await;
    let ctx = Context::new();

    let resp = ctx
        .fetch(&server.url(), RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(resp.status, 302);
}

#[tokio::test]
async fn test_303_post_becomes_get_without_body() {
    let server = MockServer::start(|req| {
        if req.path == "/submit" {
            redirect_response(303, "/result")
        } else {
            text_response(200, "OK", "done")
        }
    })
    .await;
    let ctx = Context::new();

    let url = format!("{}/submit", server.url());
    let mut resp = ctx
        .fetch(
            &url,
            RequestOptions::new()
                .method(http::Method::POST)
                .body(Bytes::from_static(b"form payload")),
        )
        .await
        .unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.text().await.unwrap(), "done");

    let seen = server.requests();
    assert_eq!(seen[0].method, "POST");
    assert_eq!(seen[1].method, "GET");
    assert_eq!(seen[1].path, "/result");
    assert!(seen[1].body.is_empty());
    assert!(seen[1].header("content-length").is_none());
}

#[tokio::test]
async fn test_301_post_becomes_get() {
    let server = MockServer::start(|req| {
        if req.path == "/old" {
            redirect_response(301, "/new")
        } else {
            text_response(200, "OK", "moved")
        }
    })
    .await;
    let ctx = Context::new();

    let url = format!("{}/old", server.url());
    ctx.fetch(
        &url,
        RequestOptions::new()
            .method(http::Method::POST)
            .body("data"),
    )
    .await
    .unwrap();

    let seen = server.requests();
    assert_eq!(seen[1].method, "GET");
    assert!(seen[1].body.is_empty());
}

#[tokio::test]
async fn test_307_preserves_method_and_body() {
    let server = MockServer::start(|req| {
        if req.path == "/old" {
            redirect_response(307, "/new")
        } else {
            let body = String::from_utf8_lossy(&req.body).to_string();
            text_response(200, "OK", &body)
        }
    })
    .await;
    let ctx = Context::new();

    let url = format!("{}/old", server.url());
    let mut resp = ctx
        .fetch(
            &url,
            RequestOptions::new()
                .method(http::Method::POST)
                .body("replayed body"),
        )
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "replayed body");

    let seen = server.requests();
    assert_eq!(seen[1].method, "POST");
    assert_eq!(seen[1].body, b"replayed body");
}

#[tokio::test]
async fn test_307_with_stream_body_is_unsupported() {
    let server = MockServer::start(|_req| redirect_response(307, "/new")).await;
    let ctx = Context::new();

    let (tx, stream) = Body::channel();
    tokio::spawn(async move {
        tx.send(Bytes::from_static(b"one-shot")).await;
    });

    let err = ctx
        .fetch(
            &server.url(),
            RequestOptions::new()
                .method(http::Method::POST)
                .body(RequestBody::Stream(stream)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedRedirect(_)));
}

#[tokio::test]
async fn test_303_with_stream_body_is_followed() {
    let server = MockServer::start(|req| {
        if req.path == "/upload" {
            redirect_response(303, "/done")
        } else {
            text_response(200, "OK", "ok")
        }
    })
    .await;
    let ctx = Context::new();

    let (tx, stream) = Body::channel();
    tokio::spawn(async move {
        tx.send(Bytes::from_static(b"streamed")).await;
    });

    let url = format!("{}/upload", server.url());
    let mut resp = ctx
        .fetch(
            &url,
            RequestOptions::new()
                .method(http::Method::POST)
                .body(RequestBody::Stream(stream)),
        )
        .await
        .unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.text().await.unwrap(), "ok");
    assert_eq!(server.requests()[1].method, "GET");
}

#[tokio::test]
async fn test_cross_origin_redirect() {
    let target = MockServer::start(|_req| text_response(200, "OK", "other origin")).await;
    let target_url = format!("{}/landing", target.url());
    let source = MockServer::start(move |_req| redirect_response(302, &target_url)).await;
    let ctx = Context::new();

    let mut resp = ctx
        .fetch(&source.url(), RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "other origin");
    assert_eq!(source.request_count(), 1);
    assert_eq!(target.request_count(), 1);
    assert_eq!(
        resp.effective_url.as_ref().unwrap().port().unwrap(),
        target.port()
    );
}

#[tokio::test]
async fn test_invalid_location_fails() {
    let server = MockServer::start(|_req| {
        // A scheme-relative location with an invalid host.
        redirect_response(302, "http://[bad")
    })
    .await;
    let ctx = Context::new();

    let err = ctx
        .fetch(&server.url(), RequestOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRedirectUrl(_)));
}
