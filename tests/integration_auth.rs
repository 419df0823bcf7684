use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use httpc::{AuthConfig, Client, EnvGetter};

#[derive(Clone)]
struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl MockResponse {
    fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_owned(), "application/json".to_owned())],
            body: body.as_bytes().to_vec(),
        }
    }

    fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
struct CapturedRequest {
    method: String,
    headers: BTreeMap<String, String>,
    body: String,
}

struct MockServer {
    base_url: String,
    served: Arc<AtomicUsize>,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl MockServer {
    fn start(responses: Vec<MockResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("read local address");
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let served = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let served_clone = Arc::clone(&served);
        let captured_clone = Arc::clone(&captured);
        let stop_clone = Arc::clone(&stop);

        let join = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(8);
            let mut response_index = 0;

            while response_index < responses.len()
                && Instant::now() < deadline
                && !stop_clone.load(Ordering::SeqCst)
            {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        if let Ok(request) = read_request(&mut stream) {
                            captured_clone
                                .lock()
                                .expect("lock captured requests")
                                .push(request);
                        }
                        served_clone.fetch_add(1, Ordering::SeqCst);
                        let response = &responses[response_index];
                        response_index += 1;
                        let _ = write_response(&mut stream, response);
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            base_url: format!("http://{address}"),
            served,
            captured,
            stop,
            join: Some(join),
        }
    }

    fn served_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    fn requests(&self) -> Vec<CapturedRequest> {
        self.captured
            .lock()
            .expect("lock captured requests")
            .clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<CapturedRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;

    let mut raw = Vec::new();
    let mut chunk = [0_u8; 1024];
    while !raw.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);
    }

    let header_end = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|index| index + 4)
        .unwrap_or(raw.len());
    let head = String::from_utf8_lossy(&raw[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let method = lines
        .next()
        .unwrap_or_default()
        .split(' ')
        .next()
        .unwrap_or_default()
        .to_owned();

    let mut headers = BTreeMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(": ") {
            headers.insert(name.to_ascii_lowercase(), value.to_owned());
        }
    }

    let content_length = headers
        .get("content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = raw[header_end..].to_vec();
    while body.len() < content_length {
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok(CapturedRequest {
        method,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

fn write_response(stream: &mut TcpStream, response: &MockResponse) -> std::io::Result<()> {
    let mut head = format!(
        "HTTP/1.1 {} X\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        response.body.len()
    );
    for (name, value) in &response.headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    stream.write_all(head.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()
}

fn oauth2_config(token_url: &str) -> AuthConfig {
    serde_json::from_str(&format!(
        r#"{{
            "type": "oauth2",
            "tokenUrl": "{token_url}",
            "clientId": "svc-client",
            "clientSecret": {{"env": "OAUTH_CLIENT_SECRET"}},
            "scopes": ["read", "write"]
        }}"#
    ))
    .expect("oauth2 config")
}

fn secret_env() -> EnvGetter {
    Arc::new(|name| (name == "OAUTH_CLIENT_SECRET").then(|| "s3cret".to_owned()))
}

#[tokio::test]
async fn first_authenticate_fetches_token_and_caches_it() {
    let token_server = MockServer::start(vec![MockResponse::json(
        200,
        r#"{"access_token":"T","token_type":"Bearer","expires_in":3600}"#,
    )]);
    let api_server = MockServer::start(vec![MockResponse::empty(200), MockResponse::empty(200)]);

    let env = secret_env();
    let authenticator = oauth2_config(&format!("{}/token", token_server.base_url))
        .build(&env)
        .expect("authenticator");

    let client = Client::builder()
        .authenticator(authenticator)
        .build()
        .expect("client");

    client
        .get(format!("{}/v1/a", api_server.base_url))
        .send()
        .await
        .expect("first response");
    client
        .get(format!("{}/v1/b", api_server.base_url))
        .send()
        .await
        .expect("second response");

    // A single token request serves both API calls.
    assert_eq!(token_server.served_count(), 1);

    let token_requests = token_server.requests();
    assert_eq!(token_requests[0].method, "POST");
    assert_eq!(
        token_requests[0]
            .headers
            .get("content-type")
            .map(String::as_str),
        Some("application/x-www-form-urlencoded")
    );
    assert!(token_requests[0].body.contains("grant_type=client_credentials"));
    assert!(token_requests[0].body.contains("client_id=svc-client"));
    assert!(token_requests[0].body.contains("client_secret=s3cret"));
    assert!(token_requests[0].body.contains("scope=read+write"));

    for request in api_server.requests() {
        assert_eq!(
            request.headers.get("authorization").map(String::as_str),
            Some("Bearer T")
        );
    }
}

#[tokio::test]
async fn stale_token_is_refreshed_transparently() {
    // expires_in below the refresh skew makes the token stale immediately.
    let token_server = MockServer::start(vec![
        MockResponse::json(200, r#"{"access_token":"T1","token_type":"Bearer","expires_in":1}"#),
        MockResponse::json(200, r#"{"access_token":"T2","token_type":"Bearer","expires_in":1}"#),
    ]);
    let api_server = MockServer::start(vec![MockResponse::empty(200), MockResponse::empty(200)]);

    let env = secret_env();
    let authenticator = oauth2_config(&format!("{}/token", token_server.base_url))
        .build(&env)
        .expect("authenticator");
    let client = Client::builder()
        .authenticator(authenticator)
        .build()
        .expect("client");

    client
        .get(format!("{}/v1/a", api_server.base_url))
        .send()
        .await
        .expect("first response");
    client
        .get(format!("{}/v1/b", api_server.base_url))
        .send()
        .await
        .expect("second response");

    assert_eq!(token_server.served_count(), 2);
    let authorization: Vec<String> = api_server
        .requests()
        .into_iter()
        .filter_map(|request| request.headers.get("authorization").cloned())
        .collect();
    assert_eq!(authorization, vec!["Bearer T1", "Bearer T2"]);
}

#[tokio::test]
async fn token_endpoint_failure_surfaces_as_auth_error() {
    let token_server = MockServer::start(vec![MockResponse::json(
        401,
        r#"{"error":"invalid_client"}"#,
    )]);
    let api_server = MockServer::start(vec![MockResponse::empty(200)]);

    let env = secret_env();
    let authenticator = oauth2_config(&format!("{}/token", token_server.base_url))
        .build(&env)
        .expect("authenticator");
    let client = Client::builder()
        .authenticator(authenticator)
        .build()
        .expect("client");

    let error = client
        .get(format!("{}/v1/a", api_server.base_url))
        .send()
        .await
        .expect_err("token exchange must fail");

    match error {
        httpc::Error::TokenExchange { message } => {
            assert!(message.contains("401"), "message: {message}");
            assert!(message.contains("invalid_client"), "message: {message}");
        }
        other => panic!("unexpected error: {other}"),
    }
    // The API call never happened.
    assert_eq!(api_server.served_count(), 0);
}

#[tokio::test]
async fn derived_scheme_comes_from_token_type() {
    let token_server = MockServer::start(vec![MockResponse::json(
        200,
        r#"{"access_token":"mac-token","token_type":"MAC","expires_in":3600}"#,
    )]);
    let api_server = MockServer::start(vec![MockResponse::empty(200)]);

    let env = secret_env();
    let authenticator = oauth2_config(&format!("{}/token", token_server.base_url))
        .build(&env)
        .expect("authenticator");
    let client = Client::builder()
        .authenticator(authenticator)
        .build()
        .expect("client");

    client
        .get(format!("{}/v1/a", api_server.base_url))
        .send()
        .await
        .expect("response");

    // Unknown schemes are prepended verbatim (lowercased from token_type).
    assert_eq!(
        api_server.requests()[0]
            .headers
            .get("authorization")
            .map(String::as_str),
        Some("mac mac-token")
    );
}
