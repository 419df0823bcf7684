use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, HeaderValue, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue, global};
use opentelemetry_http::HeaderInjector;
use tokio::io::AsyncReadExt;
use tracing::{Level, debug, error, info};

use crate::Result;
use crate::auth::Authenticator;
use crate::connect::ConnectionInfo;
use crate::content_encoding;
use crate::error::{Error, ProblemDetails};
use crate::metrics::ActiveRequestGuard;
use crate::request::{HttpClientProvider, Request, RequestBody, RequestOptions};
use crate::response::Response;
use crate::trace::{AttemptTracer, tracer};
use crate::util::{
    ParsedUrl, is_content_type_debuggable, metric_attributes, parse_relative_or_http_url,
    protocol_version, telemetry_headers,
};

/// Everything the retry loop needs to know about one attempt beyond the
/// result itself: headers for `Retry-After`, captured telemetry headers for
/// the final log line, and the resolved target for late span attributes.
struct AttemptOutcome {
    result: Result<Response>,
    response_headers: Option<HeaderMap>,
    request_headers: BTreeMap<String, String>,
    response_header_log: BTreeMap<String, String>,
    target: Option<Uri>,
}

impl AttemptOutcome {
    fn from_error(error: Error) -> Self {
        Self {
            result: Err(error),
            response_headers: None,
            request_headers: BTreeMap::new(),
            response_header_log: BTreeMap::new(),
            target: None,
        }
    }
}

struct AttemptContext<'a> {
    request: &'a Request,
    options: &'a RequestOptions,
    authenticator: Option<&'a Arc<dyn Authenticator>>,
    body: Option<&'a Bytes>,
    attempt: u32,
    outer_cx: &'a Context,
    request_id: &'a str,
    span_path: &'a str,
}

/// Execute a request end to end: outer span, optional body compression,
/// overall deadline, and the retry loop around per-attempt dispatch.
pub(crate) async fn execute(
    mut request: Request,
    provider: Arc<dyn HttpClientProvider>,
) -> Result<Response> {
    if request.method.is_empty() {
        return Err(Error::RequestMethodRequired);
    }

    let options = provider.request_options().clone();
    let started_at = Instant::now();
    let request_id = current_request_id();
    let is_debug = tracing::enabled!(Level::DEBUG);

    // Streaming bodies are read fully once so every retry replays the same
    // bytes from a restartable source.
    let mut body_bytes: Option<Bytes> = match request.body.take() {
        None => None,
        Some(RequestBody::Bytes(bytes)) => Some(bytes),
        Some(RequestBody::Stream(mut reader)) => {
            let mut buffered = Vec::new();
            if let Err(source) = reader.read_to_end(&mut buffered).await {
                error!(
                    request_id = %request_id,
                    "type" = "http-client",
                    url = %request.url,
                    method = %request.method,
                    error = %source,
                    "failed to read request body"
                );
                return Err(Error::ReadRequestBody { source });
            }
            Some(Bytes::from(buffered))
        }
    };

    let request_content_type = request
        .headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let debug_body_text = match &body_bytes {
        Some(bytes)
            if is_debug && !bytes.is_empty() && is_content_type_debuggable(&request_content_type) =>
        {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
        _ => None,
    };

    let endpoint = match parse_relative_or_http_url(&request.url) {
        Ok(endpoint) => endpoint,
        Err(parse_error) => {
            error!(
                request_id = %request_id,
                "type" = "http-client",
                url = %request.url,
                method = %request.method,
                error = %parse_error,
                latency = started_at.elapsed().as_secs_f64(),
                "invalid request url"
            );
            return Err(parse_error);
        }
    };

    let span_tracer = tracer();
    let outer_span = span_tracer
        .span_builder("request")
        .with_kind(SpanKind::Internal)
        .start_with_context(&span_tracer, &Context::current());
    let outer_cx = Context::current().with_span(outer_span);

    outer_cx
        .span()
        .set_attribute(KeyValue::new("network.protocol.name", "http"));
    outer_cx.span().set_attribute(KeyValue::new(
        "http.request.method",
        request.method.clone(),
    ));
    outer_cx
        .span()
        .set_attribute(KeyValue::new("url.full", request.url.clone()));
    if let Some(timeout) = request.timeout
        && !timeout.is_zero()
    {
        outer_cx.span().set_attribute(KeyValue::new(
            "http.request.timeout",
            format!("{timeout:?}"),
        ));
    }
    if let Some(body_text) = &debug_body_text {
        outer_cx
            .span()
            .set_attribute(KeyValue::new("http.request.body", body_text.clone()));
        debug!(
            request_id = %request_id,
            "type" = "http-client",
            url = %request.url,
            method = %request.method,
            size = body_text.len(),
            body = %body_text,
            "request body"
        );
    }

    let mut duration_attributes = vec![KeyValue::new(
        "http.request.method",
        request.method.clone(),
    )];
    let span_path;
    match &endpoint {
        ParsedUrl::Absolute(parsed) => {
            span_path = parsed.path().to_owned();
            if let Some(host) = parsed.host_str() {
                duration_attributes.push(KeyValue::new("server.address", host.to_owned()));
                if let Some(port) = parsed.port_or_known_default() {
                    duration_attributes.push(KeyValue::new("server.port", i64::from(port)));
                }
            }
            duration_attributes.push(KeyValue::new("url.scheme", parsed.scheme().to_owned()));
            for attribute in &duration_attributes {
                outer_cx.span().set_attribute(attribute.clone());
            }
        }
        ParsedUrl::Relative => {
            span_path = request
                .url
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_owned();
        }
    }
    if let Some(hook) = &options.custom_attributes {
        let extra = hook(&request);
        for attribute in &extra {
            outer_cx.span().set_attribute(attribute.clone());
        }
        duration_attributes.extend(extra);
    }

    // Compress the body when the caller declared a supported coding; strip
    // the header and send uncompressed otherwise.
    if let Some(encoding) = request
        .headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
    {
        if !content_encoding::is_encoding_supported(&encoding) {
            request.headers.remove(CONTENT_ENCODING);
        } else if let Some(raw) = &body_bytes {
            match content_encoding::compress(&encoding, raw) {
                Ok(compressed) => body_bytes = Some(compressed),
                Err(codec_error) => {
                    let compress_error = Error::Compress {
                        encoding: codec_error.encoding,
                        message: codec_error.message,
                    };
                    let message = "failed to compress request body";
                    error!(
                        request_id = %request_id,
                        "type" = "http-client",
                        url = %request.url,
                        method = %request.method,
                        error = %compress_error,
                        latency = started_at.elapsed().as_secs_f64(),
                        message
                    );
                    outer_cx.span().set_status(Status::error(message));
                    outer_cx.span().record_error(&compress_error);
                    outer_cx.span().end();
                    options
                        .metrics
                        .request_duration
                        .record(started_at.elapsed().as_secs_f64(), &duration_attributes);
                    return Err(compress_error);
                }
            }
        }
    }

    let authenticator = request
        .authenticator
        .clone()
        .or_else(|| options.authenticator.clone());
    let deadline = request
        .timeout
        .filter(|timeout| !timeout.is_zero())
        .map(|timeout| tokio::time::Instant::now() + timeout);
    let retry_policy = request.retry.clone();

    let mut attempt: u32 = 0;
    let mut outcome = loop {
        let attempt_context = AttemptContext {
            request: &request,
            options: &options,
            authenticator: authenticator.as_ref(),
            body: body_bytes.as_ref(),
            attempt,
            outer_cx: &outer_cx,
            request_id: &request_id,
            span_path: &span_path,
        };
        let attempt_future = do_attempt(attempt_context, provider.as_ref());
        let outcome = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, attempt_future).await {
                Ok(outcome) => outcome,
                Err(_) => AttemptOutcome::from_error(Error::Timeout {
                    timeout_ms: request.timeout.unwrap_or_default().as_millis(),
                }),
            },
            None => attempt_future.await,
        };

        let Some(policy) = &retry_policy else {
            break outcome;
        };

        let (status, attempt_error) = match &outcome.result {
            Ok(response) => (Some(response.status_code()), None),
            Err(attempt_error) => (attempt_error.status_code(), Some(attempt_error)),
        };
        if matches!(
            attempt_error,
            Some(Error::Timeout { .. }) | Some(Error::Canceled)
        ) {
            break outcome;
        }
        if attempt + 1 >= policy.max_attempts_value().max(1) {
            break outcome;
        }
        if !policy.should_retry(status, attempt_error) {
            break outcome;
        }

        let delay = policy.delay(attempt, outcome.response_headers.as_ref());
        if let Some(deadline) = deadline
            && tokio::time::Instant::now() + delay >= deadline
        {
            break outcome;
        }

        debug!(
            request_id = %request_id,
            "type" = "http-client",
            url = %request.url,
            method = %request.method,
            attempt,
            delay_ms = delay.as_millis() as u64,
            status = status.map(|status| status.as_u16()),
            "retrying request"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    };

    finish_execute(
        &mut outcome,
        &request,
        &options,
        &outer_cx,
        &request_id,
        started_at,
        duration_attributes,
        matches!(endpoint, ParsedUrl::Relative),
        is_debug,
    )
    .await;

    outcome.result
}

/// Final span/log/metric bookkeeping shared by every exit from the retry
/// loop. Records `http.client.request.duration` exactly once.
#[allow(clippy::too_many_arguments)]
async fn finish_execute(
    outcome: &mut AttemptOutcome,
    request: &Request,
    options: &RequestOptions,
    outer_cx: &Context,
    request_id: &str,
    started_at: Instant,
    mut duration_attributes: Vec<KeyValue>,
    endpoint_was_relative: bool,
    is_debug: bool,
) {
    let request_headers = std::mem::take(&mut outcome.request_headers);
    let response_header_log = std::mem::take(&mut outcome.response_header_log);

    match &mut outcome.result {
        Ok(response) => {
            let status = response.status_code();
            let status_attribute =
                KeyValue::new("http.response.status_code", i64::from(status.as_u16()));
            outer_cx.span().set_attribute(status_attribute.clone());
            duration_attributes.push(status_attribute);
            duration_attributes.push(KeyValue::new(
                "network.protocol.version",
                protocol_version(response.version()),
            ));

            if endpoint_was_relative
                && let Some(target) = &outcome.target
            {
                let mut late_attributes = Vec::new();
                if let Some(host) = target.host() {
                    late_attributes.push(KeyValue::new("server.address", host.to_owned()));
                }
                if let Some(port) = crate::util::default_port(target.scheme_str(), target.port_u16())
                {
                    late_attributes.push(KeyValue::new("server.port", i64::from(port)));
                }
                if let Some(scheme) = target.scheme_str() {
                    late_attributes.push(KeyValue::new("url.scheme", scheme.to_owned()));
                }
                for attribute in &late_attributes {
                    outer_cx.span().set_attribute(attribute.clone());
                }
                duration_attributes.extend(late_attributes);
            }

            let mut response_size = response.content_length().unwrap_or_default();
            let response_content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_owned();
            if is_debug
                && !response.is_body_read()
                && response.has_body()
                && is_content_type_debuggable(&response_content_type)
            {
                match response.read_bytes().await {
                    Ok(bytes) => {
                        let body_text = String::from_utf8_lossy(&bytes).into_owned();
                        response_size = bytes.len() as u64;
                        outer_cx
                            .span()
                            .set_attribute(KeyValue::new("http.response.body", body_text.clone()));
                        debug!(
                            request_id = %request_id,
                            "type" = "http-client",
                            status = status.as_u16(),
                            size = response_size,
                            body = %body_text,
                            "response body"
                        );
                        response.reattach_body(bytes);
                    }
                    Err(read_error) => {
                        error!(
                            request_id = %request_id,
                            "type" = "http-client",
                            url = %request.url,
                            method = %request.method,
                            error = %read_error,
                            latency = started_at.elapsed().as_secs_f64(),
                            "failed to read response body"
                        );
                        outcome.result = Err(read_error);
                        outer_cx
                            .span()
                            .set_status(Status::error("failed to read response body"));
                        outer_cx.span().end();
                        options
                            .metrics
                            .request_duration
                            .record(started_at.elapsed().as_secs_f64(), &duration_attributes);
                        return;
                    }
                }
            }

            info!(
                request_id = %request_id,
                "type" = "http-client",
                url = %request.url,
                method = %request.method,
                status = status.as_u16(),
                size = response_size,
                request_headers = ?request_headers,
                response_headers = ?response_header_log,
                latency = started_at.elapsed().as_secs_f64(),
                "http request completed"
            );
        }
        Err(final_error) => {
            let message = match final_error.status_code() {
                Some(status) => format!("http request failed with status {status}"),
                None => "http request failed".to_owned(),
            };
            error!(
                request_id = %request_id,
                "type" = "http-client",
                url = %request.url,
                method = %request.method,
                error = %final_error,
                request_headers = ?request_headers,
                response_headers = ?response_header_log,
                latency = started_at.elapsed().as_secs_f64(),
                message
            );
            if let Some(status) = final_error.status_code() {
                outer_cx.span().set_attribute(KeyValue::new(
                    "http.response.status_code",
                    i64::from(status.as_u16()),
                ));
                duration_attributes.push(KeyValue::new(
                    "http.response.status_code",
                    i64::from(status.as_u16()),
                ));
            }
            outer_cx
                .span()
                .set_status(Status::error("http request failed"));
            outer_cx.span().record_error(final_error);
        }
    }

    outer_cx.span().end();
    options
        .metrics
        .request_duration
        .record(started_at.elapsed().as_secs_f64(), &duration_attributes);
}

/// One dispatch attempt: acquire a dispatcher, trace it, build and
/// authenticate the underlying request, send, and classify the result.
async fn do_attempt(ctx: AttemptContext<'_>, provider: &dyn HttpClientProvider) -> AttemptOutcome {
    let dispatcher = match provider.dispatcher() {
        Ok(dispatcher) => dispatcher,
        Err(dispatch_error) => return AttemptOutcome::from_error(dispatch_error),
    };

    let span_name = if ctx.options.trace_high_cardinality_path {
        format!("{} {}", ctx.request.method, ctx.span_path)
    } else {
        ctx.request.method.clone()
    };
    let mut tracer = AttemptTracer::start(
        ctx.outer_cx,
        span_name,
        ctx.options.detailed_trace,
        ctx.options.metrics.clone(),
    );
    if ctx.attempt > 0 {
        tracer.set_attribute(KeyValue::new(
            "http.request.resend_count",
            i64::from(ctx.attempt),
        ));
    }
    tracer.set_attribute(KeyValue::new("network.protocol.name", "http"));
    tracer.set_attribute(KeyValue::new(
        "user_agent.original",
        ctx.options.user_agent.clone(),
    ));

    let body = Full::new(ctx.body.cloned().unwrap_or_default());
    let mut underlying = match dispatcher
        .new_request(&ctx.request.method, &ctx.request.url, body)
        .await
    {
        Ok(underlying) => underlying,
        Err(build_error) => {
            tracer.error("failed to create request", &build_error);
            tracer.end();
            log_attempt(&ctx, None, Some(&build_error), &tracer);
            return AttemptOutcome::from_error(build_error);
        }
    };

    // Caller headers override per name but keep their own multi-values.
    for name in ctx.request.headers.keys() {
        underlying.headers_mut().remove(name);
    }
    for (name, value) in &ctx.request.headers {
        underlying.headers_mut().append(name.clone(), value.clone());
    }

    if let Some(authenticator) = ctx.authenticator
        && let Err(auth_error) = authenticator.authenticate(&mut underlying).await
    {
        tracer.error("failed to authenticate request", &auth_error);
        tracer.end();
        log_attempt(&ctx, None, Some(&auth_error), &tracer);
        return AttemptOutcome::from_error(auth_error);
    }

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(tracer.context(), &mut HeaderInjector(underlying.headers_mut()));
    });
    if let Ok(user_agent) = HeaderValue::from_str(&ctx.options.user_agent) {
        underlying.headers_mut().insert(USER_AGENT, user_agent);
    }

    let target = underlying.uri().clone();
    let mut metric_attrs = metric_attributes(&ctx.request.method, &target);
    let _active_guard =
        ActiveRequestGuard::enter(ctx.options.metrics.clone(), metric_attrs.clone());
    if ctx.options.metric_high_cardinality_path {
        metric_attrs.push(KeyValue::new("url.path", target.path().to_owned()));
    }
    for attribute in &metric_attrs {
        tracer.set_attribute(attribute.clone());
    }
    tracer.set_attribute(KeyValue::new("url.full", target.to_string()));
    tracer.set_metric_attributes(metric_attrs.clone());

    let request_headers = telemetry_headers(
        underlying.headers(),
        ctx.options.allowed_trace_request_headers.as_deref(),
    );
    set_header_attributes(&tracer, "http.request.header", &request_headers);
    let request_body_len = ctx.body.map_or(0, Bytes::len);

    let raw = match dispatcher.send(underlying).await {
        Ok(raw) => raw,
        Err(send_error) => {
            tracer.error("failed to execute request", &send_error);
            tracer.end();
            log_attempt(&ctx, None, Some(&send_error), &tracer);
            return AttemptOutcome {
                result: Err(send_error),
                response_headers: None,
                request_headers,
                response_header_log: BTreeMap::new(),
                target: Some(target),
            };
        }
    };

    let status = raw.status();
    let status_attribute = KeyValue::new("http.response.status_code", i64::from(status.as_u16()));
    let version_attribute =
        KeyValue::new("network.protocol.version", protocol_version(raw.version()));
    metric_attrs.push(status_attribute.clone());
    metric_attrs.push(version_attribute.clone());
    tracer.set_attribute(status_attribute);
    tracer.set_attribute(version_attribute);
    tracer.set_metric_attributes(metric_attrs.clone());

    if let Some(info) = raw.extensions().get::<ConnectionInfo>().cloned() {
        tracer.observe_connection(&info);
    }
    tracer.record_first_byte();
    if let Some(peer) = tracer.remote_addr() {
        tracer.set_attribute(KeyValue::new("network.peer.address", peer.ip().to_string()));
        tracer.set_attribute(KeyValue::new("network.peer.port", i64::from(peer.port())));
    }

    if request_body_len > 0 {
        ctx.options
            .metrics
            .request_body_size
            .record(request_body_len as u64, &metric_attrs);
        tracer.set_attribute(KeyValue::new(
            "http.request.body.size",
            request_body_len as i64,
        ));
    }
    let content_length = raw
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    if let Some(length) = content_length
        && length > 0
    {
        ctx.options
            .metrics
            .response_body_size
            .record(length, &metric_attrs);
        tracer.set_attribute(KeyValue::new("http.response.body.size", length as i64));
    }

    let response_header_log = telemetry_headers(
        raw.headers(),
        ctx.options.allowed_trace_response_headers.as_deref(),
    );
    set_header_attributes(&tracer, "http.response.header", &response_header_log);

    let retry_headers = raw.headers().clone();
    let remote_addr = tracer.remote_addr();
    let (parts, incoming) = raw.into_parts();

    let body_absent = ctx.request.method.eq_ignore_ascii_case("HEAD")
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
        || status.is_informational();

    let result = if body_absent {
        if status.as_u16() >= 400 {
            let problem = ProblemDetails::from_no_content_response(status, &parts.headers);
            let message = problem.title.clone();
            let problem_error = Error::problem(problem);
            tracer.error(&message, &problem_error);
            Err(problem_error)
        } else {
            tracer.ok();
            Ok(Response::new(parts, None, remote_addr))
        }
    } else if status.as_u16() >= 400 {
        read_error_response(status, parts, incoming, &mut tracer).await
    } else {
        tracer.ok();
        Ok(Response::new(parts, Some(incoming), remote_addr))
    };

    tracer.end();
    log_attempt(&ctx, Some(status), result.as_ref().err(), &tracer);

    AttemptOutcome {
        result,
        response_headers: Some(retry_headers),
        request_headers,
        response_header_log,
        target: Some(target),
    }
}

/// Read, decompress, and decode the body of a failed response into a
/// problem-details error. The body is consumed; the caller has nothing
/// left to close.
async fn read_error_response(
    status: StatusCode,
    parts: http::response::Parts,
    incoming: hyper::body::Incoming,
    tracer: &mut AttemptTracer,
) -> Result<Response> {
    let raw_body = match incoming.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(collect_error) => {
            let read_error = Error::ReadBody {
                source: Box::new(collect_error),
            };
            tracer.error("failed to read response body", &read_error);
            return Err(read_error);
        }
    };

    let decoded = match parts
        .headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
    {
        Some(encoding) => match content_encoding::decode(encoding, raw_body) {
            Ok(decoded) => decoded,
            Err(codec_error) => {
                let decompress_error = Error::Decompress {
                    encoding: codec_error.encoding,
                    message: codec_error.message,
                };
                tracer.error("failed to decompress response body", &decompress_error);
                return Err(decompress_error);
            }
        },
        None => raw_body,
    };

    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let problem = ProblemDetails::from_response(status, &parts.headers, content_type, &decoded);
    let message = problem.title.clone();
    let problem_error = Error::problem(problem);
    tracer.error(&message, &problem_error);
    Err(problem_error)
}

fn set_header_attributes(
    tracer: &AttemptTracer,
    prefix: &str,
    headers: &BTreeMap<String, String>,
) {
    for (name, value) in headers {
        tracer.set_attribute(KeyValue::new(format!("{prefix}.{name}"), value.clone()));
    }
}

fn log_attempt(
    ctx: &AttemptContext<'_>,
    status: Option<StatusCode>,
    attempt_error: Option<&Error>,
    tracer: &AttemptTracer,
) {
    if !tracing::enabled!(Level::DEBUG) {
        return;
    }
    debug!(
        request_id = ctx.request_id,
        "type" = "http-client",
        url = %ctx.request.url,
        method = %ctx.request.method,
        attempt = ctx.attempt,
        status = status.map(|status| status.as_u16()),
        error = attempt_error.map(tracing::field::display),
        latency = tracer.total_time().as_secs_f64(),
        "request attempt finished"
    );
}

fn current_request_id() -> String {
    let current = Context::current();
    let span_context = current.span().span_context().clone();
    if span_context.is_valid() {
        span_context.trace_id().to_string()
    } else {
        uuid::Uuid::new_v4().to_string()
    }
}
