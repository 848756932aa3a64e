//! Fetch-style redirect state machine.
//!
//! Layers the redirect rules for 301/302/303/307/308 over the
//! dispatcher. Every hop re-enters the full dispatcher, so a redirect
//! target may negotiate a different protocol than the hop before it.

use http::header::{CONTENT_LENGTH, LOCATION};
use http::{HeaderValue, Method, StatusCode};
use url::Url;

use crate::context::Context;
use crate::dispatch::dispatch;
use crate::error::{Error, Result};
use crate::request::{RedirectMode, RequestBody, RequestOptions};
use crate::response::Response;

pub(crate) async fn fetch(
    ctx: &Context,
    url: &str,
    options: RequestOptions,
) -> Result<Response> {
    let url = Url::parse(url)?;
    let timeout = options.timeout;
    let run = run(ctx, url, options);
    match timeout {
        Some(deadline) => tokio::time::timeout(deadline, run)
            .await
            .map_err(|_| Error::timeout("request deadline elapsed"))?,
        None => run.await,
    }
}

async fn run(ctx: &Context, url: Url, options: RequestOptions) -> Result<Response> {
    let RequestOptions {
        method,
        mut headers,
        body,
        redirect,
        follow,
        compress,
        signal,
        timeout: _,
    } = options;

    let follow = follow.unwrap_or(RequestOptions::DEFAULT_FOLLOW);
    let compress = compress.unwrap_or(true);

    let mut url = url;
    let mut method = method;
    let mut body = body;
    // The stream was handed to the wire on its first hop; that fact
    // outlives the body slot.
    let mut body_is_stream = body.as_ref().map(|b| b.is_stream()).unwrap_or(false);
    let mut counter: u32 = 0;

    loop {
        if let Some(signal) = &signal {
            if signal.aborted() {
                return Err(Error::Abort);
            }
        }

        let mut response = dispatch(
            ctx,
            &url,
            &method,
            headers.clone(),
            &mut body,
            compress,
            signal.clone(),
        )
        .await?;

        if !is_redirect_status(response.status) {
            return Ok(response.with_url(url));
        }

        match redirect {
            RedirectMode::Error => {
                return Err(Error::NoRedirect(url.to_string()));
            }
            RedirectMode::Manual => {
                // Hand the 3xx back, but with an absolute location.
                if let Some(absolute) = response
                    .location()
                    .and_then(|location| url.join(location).ok())
                {
                    if let Ok(value) = HeaderValue::from_str(absolute.as_str()) {
                        response.headers.insert(LOCATION, value);
                    }
                }
                return Ok(response.with_url(url));
            }
            RedirectMode::Follow => {}
        }

        let Some(location) = response.location().map(str::to_string) else {
            // A 3xx without a location is a terminal response.
            return Ok(response.with_url(url));
        };

        if counter >= follow {
            return Err(Error::MaxRedirect {
                url: url.to_string(),
                count: counter,
            });
        }

        let next = url
            .join(&location)
            .map_err(|_| Error::InvalidRedirectUrl(location.clone()))?;

        let status = response.status;
        if status != StatusCode::SEE_OTHER && body_is_stream {
            // The stream went out on the first hop and cannot be replayed.
            return Err(Error::UnsupportedRedirect(url.to_string()));
        }

        if status == StatusCode::SEE_OTHER
            || ((status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND)
                && method == Method::POST)
        {
            method = Method::GET;
            body = None;
            body_is_stream = false;
            headers.remove(CONTENT_LENGTH);
        }

        tracing::debug!(from = %url, to = %next, %status, "following redirect");
        counter += 1;
        url = next;
    }
}

fn is_redirect_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}
