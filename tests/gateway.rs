use bytes::Bytes;
use cgi_gateway::{
    config::{ChunkedBodyMode, RouteConfig},
    request::{Framing, RequestBody},
    server::Gateway,
    CgiCoordinator, CgiRequest, Config, ScriptTarget,
};
use futures::stream;
use hyper::{body::HttpBody, header, Body, Request, Response, StatusCode};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

const GRACE: Duration = Duration::from_millis(200);

fn scripts() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/scripts")
}

fn config() -> Config {
    Config {
        server_name: Some("localhost".into()),
        kill_grace_ms: GRACE.as_millis() as u64,
        ..Config::default()
    }
}

fn target(name: &str, timeout: Duration) -> ScriptTarget {
    ScriptTarget {
        script_name: format!("/cgi-bin/{}", name),
        path_info: String::new(),
        root: scripts(),
        script_path: scripts().join(name),
        interpreter: Some(PathBuf::from("/bin/sh")),
        working_dir: scripts(),
        timeout,
    }
}

fn get(uri: &str) -> CgiRequest {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    CgiRequest::from_hyper(req, "127.0.0.1:40000".parse().unwrap())
}

fn post(uri: &str, content_type: &str, body: &'static [u8]) -> CgiRequest {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap();
    CgiRequest::from_hyper(req, "127.0.0.1:40000".parse().unwrap())
}

async fn text(res: Response<Body>) -> String {
    let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

async fn run(script: &str, req: CgiRequest) -> Response<Body> {
    CgiCoordinator::new(&config())
        .handle(req, &target(script, Duration::from_secs(5)))
        .await
}

#[tokio::test]
async fn form_post_reaches_script_verbatim() {
    let res = run(
        "echo.sh",
        post(
            "/cgi-bin/echo.sh",
            "application/x-www-form-urlencoded",
            b"name=Alice&message=Hi!",
        ),
    )
    .await;

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[header::CONTENT_TYPE], "text/plain");
    assert_eq!(
        text(res).await,
        "method=POST\n\
         length=22\n\
         type=application/x-www-form-urlencoded\n\
         query=\n\
         gateway=CGI/1.1\n\
         body=name=Alice&message=Hi!"
    );
}

#[tokio::test]
async fn get_has_empty_body_and_raw_query() {
    let res = run("echo.sh", get("/cgi-bin/echo.sh?q=a%20b&x=1")).await;
    assert_eq!(
        text(res).await,
        "method=GET\nlength=\ntype=\nquery=q=a%20b&x=1\ngateway=CGI/1.1\nbody="
    );
}

#[tokio::test]
async fn status_header_overrides_status() {
    let res = run("teapot.sh", get("/cgi-bin/teapot.sh")).await;
    assert_eq!(res.status().as_u16(), 418);
    assert!(!res.headers().contains_key("status"));
    assert_eq!(text(res).await, "short and stout\n");
}

#[tokio::test]
async fn redirect_through_router() {
    let mut route = RouteConfig::new("/cgi-bin", scripts());
    route.interpreters.insert(".sh".into(), PathBuf::from("/bin/sh"));
    let gateway = Gateway::new(&Config {
        routes: vec![route],
        ..config()
    });

    let req = Request::builder()
        .uri("/cgi-bin/redirect.sh?type=redirect")
        .body(Body::empty())
        .unwrap();
    let res = gateway.handle(req, "127.0.0.1:40000".parse().unwrap()).await;

    assert_eq!(res.status(), StatusCode::FOUND);
    assert_eq!(res.headers()[header::LOCATION], "/");
}

#[tokio::test]
async fn missing_content_type_defaults_to_html() {
    let res = run("bare.sh", get("/cgi-bin/bare.sh")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[header::CONTENT_TYPE], "text/html");
    assert_eq!(res.headers()["x-script"], "bare");
    assert_eq!(text(res).await, "<p>no content type</p>\n");
}

#[tokio::test]
async fn flushed_output_arrives_progressively() {
    let mut res = run("progressive.sh", get("/cgi-bin/progressive.sh")).await;
    assert_eq!(res.status(), StatusCode::OK);

    let first = res.body_mut().data().await.unwrap().unwrap();
    let first_at = Instant::now();
    let second = res.body_mut().data().await.unwrap().unwrap();
    let second_at = Instant::now();

    assert_eq!(&first[..], b"first\n");
    assert_eq!(&second[..], b"second\n");
    assert!(second_at - first_at >= Duration::from_millis(700));
    assert!(res.body_mut().data().await.is_none());
}

#[tokio::test]
async fn sleeper_is_killed_and_answered_with_timeout() {
    let coordinator = CgiCoordinator::new(&config());
    let timeout = Duration::from_millis(500);
    let started = Instant::now();

    let res = coordinator
        .handle(get("/cgi-bin/sleeper.sh"), &target("sleeper.sh", timeout))
        .await;

    assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(started.elapsed() < timeout + GRACE * 2 + Duration::from_millis(500));

    tokio::time::sleep(GRACE * 3).await;
    assert_eq!(coordinator.active_processes(), 0);
}

#[tokio::test]
async fn timeout_after_headers_truncates_body() {
    let res = CgiCoordinator::new(&config())
        .handle(
            get("/cgi-bin/late_sleeper.sh"),
            &target("late_sleeper.sh", Duration::from_millis(500)),
        )
        .await;

    assert_eq!(res.status(), StatusCode::OK);
    assert!(hyper::body::to_bytes(res.into_body()).await.is_err());
}

#[tokio::test]
async fn silent_script_is_bad_gateway() {
    let res = run("empty.sh", get("/cgi-bin/empty.sh")).await;
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn failing_script_is_server_error() {
    let res = run("failing.sh", get("/cgi-bin/failing.sh")).await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn output_without_blank_line_is_served_as_body() {
    let res = run("unterminated.sh", get("/cgi-bin/unterminated.sh")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[header::CONTENT_TYPE], "text/html");
    assert_eq!(text(res).await, "plain output without headers");
}

#[tokio::test]
async fn stderr_never_reaches_the_client() {
    let res = run("stderr.sh", get("/cgi-bin/stderr.sh")).await;
    assert_eq!(text(res).await, "clean body\n");
}

#[tokio::test]
async fn missing_script_is_server_error() {
    let res = run("does_not_exist.sh", get("/cgi-bin/does_not_exist.sh")).await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn large_body_to_script_that_never_reads_does_not_hang() {
    static BIG: [u8; 1 << 20] = [b'x'; 1 << 20];
    let res = run(
        "ignores_input.sh",
        post("/cgi-bin/ignores_input.sh", "application/octet-stream", &BIG),
    )
    .await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(text(res).await, "ignored\n");
}

#[tokio::test]
async fn large_body_is_delivered_in_full() {
    static BIG: [u8; 1 << 20] = [b'y'; 1 << 20];
    let res = run(
        "big_reader.sh",
        post("/cgi-bin/big_reader.sh", "application/octet-stream", &BIG),
    )
    .await;
    assert_eq!(text(res).await.trim(), (1 << 20).to_string());
}

#[tokio::test]
async fn chunked_body_is_decoded_before_the_script_sees_it() {
    let mut req = get("/cgi-bin/echo.sh");
    req.head.method = hyper::Method::POST;
    req.body = RequestBody::new(
        Framing::Chunked,
        stream::iter(vec![
            Ok(Bytes::from_static(b"5\r\nname=\r\n")),
            Ok(Bytes::from_static(b"5\r\nAlice\r\n0\r\n\r\n")),
        ]),
    );

    let res = run("echo.sh", req).await;
    assert_eq!(
        text(res).await,
        "method=POST\nlength=10\ntype=\nquery=\ngateway=CGI/1.1\nbody=name=Alice"
    );
}

#[tokio::test]
async fn malformed_chunked_body_is_bad_request() {
    let coordinator = CgiCoordinator::new(&config());
    let mut req = get("/cgi-bin/echo.sh");
    req.body = RequestBody::from_bytes(Framing::Chunked, &b"nope\r\n"[..]);

    let res = coordinator
        .handle(req, &target("echo.sh", Duration::from_secs(5)))
        .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(coordinator.active_processes(), 0);
}

#[tokio::test]
async fn streamed_body_reads_until_eof_without_length() {
    let coordinator = CgiCoordinator::new(&Config {
        chunked_body: ChunkedBodyMode::Stream,
        ..config()
    });
    let mut req = get("/cgi-bin/echo.sh");
    req.body = RequestBody::new(
        Framing::Unframed,
        stream::iter(vec![
            Ok(Bytes::from_static(b"part one, ")),
            Ok(Bytes::from_static(b"part two")),
        ]),
    );

    let res = coordinator
        .handle(req, &target("echo.sh", Duration::from_secs(5)))
        .await;
    assert_eq!(
        text(res).await,
        "method=GET\nlength=unset\ntype=\nquery=\ngateway=CGI/1.1\nbody=part one, part two"
    );
}

#[tokio::test]
async fn pipelines_are_isolated() {
    let coordinator = CgiCoordinator::new(&config());
    let sleeper = target("sleeper.sh", Duration::from_millis(400));
    let echo = target("echo.sh", Duration::from_secs(5));

    let (slow, fast) = tokio::join!(
        coordinator.handle(get("/cgi-bin/sleeper.sh"), &sleeper),
        coordinator.handle(get("/cgi-bin/echo.sh?who=fast"), &echo),
    );

    assert_eq!(slow.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(fast.status(), StatusCode::OK);
    assert!(text(fast).await.contains("query=who=fast\n"));
}

#[tokio::test]
async fn admission_limit_rejects_overflow() {
    let coordinator = Arc::new(CgiCoordinator::new(&Config {
        max_processes: Some(1),
        ..config()
    }));

    let holder = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .handle(
                    get("/cgi-bin/sleeper.sh"),
                    &target("sleeper.sh", Duration::from_millis(1500)),
                )
                .await
                .status()
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(coordinator.active_processes(), 1);

    let res = coordinator
        .handle(
            get("/cgi-bin/echo.sh"),
            &target("echo.sh", Duration::from_millis(300)),
        )
        .await;
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(holder.await.unwrap(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn client_disconnect_stops_the_script() {
    let coordinator = CgiCoordinator::new(&config());
    let mut res = coordinator
        .handle(
            get("/cgi-bin/ticker.sh"),
            &target("ticker.sh", Duration::from_secs(30)),
        )
        .await;
    let first = res.body_mut().data().await.unwrap().unwrap();
    assert!(first.starts_with(b"tick\n"));
    assert_eq!(coordinator.active_processes(), 1);
    drop(res);

    let started = Instant::now();
    while coordinator.active_processes() > 0 {
        assert!(started.elapsed() < Duration::from_secs(3), "script outlived its client");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn quiet_script_is_stopped_when_client_leaves() {
    let coordinator = CgiCoordinator::new(&config());
    let mut res = coordinator
        .handle(
            get("/cgi-bin/late_sleeper.sh"),
            &target("late_sleeper.sh", Duration::from_secs(30)),
        )
        .await;
    let first = res.body_mut().data().await.unwrap().unwrap();
    assert_eq!(&first[..], b"started\n");
    assert_eq!(coordinator.active_processes(), 1);
    drop(res);

    let started = Instant::now();
    while coordinator.active_processes() > 0 {
        assert!(
            started.elapsed() < GRACE * 3 + Duration::from_millis(500),
            "script outlived its client"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn body_ends_when_stdout_closes_before_exit() {
    let coordinator = CgiCoordinator::new(&config());
    let started = Instant::now();
    let res = coordinator
        .handle(
            get("/cgi-bin/closes_stdout.sh"),
            &target("closes_stdout.sh", Duration::from_secs(3)),
        )
        .await;

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(text(res).await, "done\n");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(coordinator.active_processes(), 1);
}

#[tokio::test]
async fn endless_stderr_line_does_not_stall_the_response() {
    let res = run("noisy_stderr.sh", get("/cgi-bin/noisy_stderr.sh")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(text(res).await, "still fine\n");
}

#[tokio::test]
async fn declared_content_length_does_not_truncate_body() {
    let res = run("wrong_length.sh", get("/cgi-bin/wrong_length.sh")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert!(!res.headers().contains_key(header::CONTENT_LENGTH));
    assert_eq!(text(res).await, "hello\n");
}
