//! Web access: cookie binding and forward-auth.
//!
//! `/authorize-app/{session_id}` sets the session cookie on the platform
//! domain and redirects into the job's virtual host
//! (`{prefix}{job_id}-{rank}.{domain}`). From then on the reverse proxy calls
//! `/app-authorization` before forwarding each request to a job host; a 200
//! lets the request through, anything else blocks it.
//!
//! On success the response carries a `Cookie` header with the session and
//! refresh-token cookies removed. The proxy copies it onto the upstream
//! request, so the job never sees platform credentials.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{debug, info};

use crate::config::WebConfig;
use crate::error::{Error, Result};
use crate::jobs::JobDirectory;
use crate::sessions::{JobRank, SessionType};
use crate::util::normalize_host;
use crate::AppState;

/// `GET /authorize-app/{session_id}`: bind the browser to a job replica.
pub async fn authorize_app(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let target = state
        .sessions
        .resolve(&session_id, SessionType::Web)
        .await
        .ok_or_else(|| Error::not_found("Session not found"))?;

    let web = &state.config.web;
    let secure = is_https(&headers);
    let location = if web.local_dev {
        local_redirect(&state, &target).await?
    } else {
        let scheme = if secure { "https" } else { "http" };
        format!(
            "{scheme}://{}{}-{}.{}/",
            web.prefix, target.job_id, target.rank, web.domain
        )
    };

    let cookie = session_cookie(web, &session_id, secure);

    info!(
        job_id = %target.job_id,
        rank = target.rank,
        "Web session authorized, redirecting to {location}"
    );
    Ok((
        StatusCode::FOUND,
        [(header::LOCATION, location), (header::SET_COOKIE, cookie)],
    )
        .into_response())
}

/// `Set-Cookie` value for a web session.
///
/// Browsers refuse a `Domain` without a dot (`localhost`), so such a domain
/// yields a host-only cookie.
fn session_cookie(web: &WebConfig, session_id: &str, secure: bool) -> String {
    let max_age = web.cookie_max_age_days.saturating_mul(24 * 60 * 60);
    let mut cookie = format!("{}={session_id};", web.cookie_name);
    if web.domain.contains('.') {
        cookie.push_str(&format!(" Domain={};", web.domain));
    }
    cookie.push_str(&format!(" Path=/; Max-Age={max_age}; HttpOnly"));
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// `ANY /app-authorization[/...]`: forward-auth check for one proxied request.
pub async fn app_authorization(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(header::HOST))
        .and_then(|v| v.to_str().ok())
        .map(normalize_host)
        .unwrap_or_default();
    if host.is_empty() {
        return Error::forbidden().into_response();
    }

    if state.jobs.is_ingress_domain(&host).await {
        return StatusCode::OK.into_response();
    }

    let web = &state.config.web;
    let Some(target) = parse_job_host(&host, &web.prefix, &web.domain) else {
        debug!("Forward-auth denied: {host} is not a job host");
        return Error::forbidden().into_response();
    };

    let cookies = request_cookies(&headers);
    let Some(session_id) = cookies
        .iter()
        .find(|(name, _)| *name == web.cookie_name)
        .map(|(_, value)| *value)
    else {
        debug!("Forward-auth denied for {host}: no session cookie");
        return Error::forbidden().into_response();
    };

    match state.sessions.resolve(session_id, SessionType::Web).await {
        Some(resolved) if resolved == target => {}
        _ => {
            debug!("Forward-auth denied for {host}: session does not grant this job");
            return Error::forbidden().into_response();
        }
    }

    let forwarded: Vec<String> = cookies
        .iter()
        .filter(|(name, _)| *name != web.cookie_name && *name != web.refresh_cookie_name)
        .map(|(name, value)| format!("{name}={value}"))
        .collect();
    // Always set, even when empty, so the proxy replaces the original header.
    let cookie_header =
        HeaderValue::from_str(&forwarded.join("; ")).unwrap_or(HeaderValue::from_static(""));
    (StatusCode::OK, [(header::COOKIE, cookie_header)]).into_response()
}

/// Whether the browser reached the platform over HTTPS.
fn is_https(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
}

/// Decode `{prefix}{job_id}-{rank}.{domain}` into the job replica it names.
fn parse_job_host(host: &str, prefix: &str, domain: &str) -> Option<JobRank> {
    let suffix = format!(".{}", domain.to_ascii_lowercase());
    let label = host
        .strip_prefix(&prefix.to_ascii_lowercase())?
        .strip_suffix(&suffix)?;
    let (job_id, rank) = label.rsplit_once('-')?;
    if job_id.is_empty() {
        return None;
    }
    Some(JobRank {
        job_id: job_id.to_string(),
        rank: rank.parse().ok()?,
    })
}

/// All `name=value` pairs from every `Cookie` header, in order.
fn request_cookies(headers: &HeaderMap) -> Vec<(&str, &str)> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some((name.trim(), value.trim()))
        })
        .filter(|(name, _)| !name.is_empty())
        .collect()
}

/// Node-local URL for the job's web service, used in local development.
async fn local_redirect(state: &AppState, target: &JobRank) -> Result<String> {
    let job = state
        .jobs
        .find_job(&target.job_id)
        .await
        .ok_or_else(|| Error::not_found(format!("Job {} not found", target.job_id)))?;
    let namespace = job.namespace(&state.config.cluster.namespace);
    let service = format!("{}-{}", job.workload, target.rank);
    let web_port = job.resources.web_port.unwrap_or(80);
    let node_port = state
        .cluster
        .node_port(namespace, &service, web_port)
        .await?
        .ok_or_else(|| Error::not_found(format!("No node port for {service}:{web_port}")))?;
    let ip = local_ip(state).await?;
    Ok(format!("http://{ip}:{node_port}/"))
}

/// This machine's address: configured, probed over HTTP, or the local end of
/// a UDP route. Resolved once per process.
async fn local_ip(state: &AppState) -> Result<String> {
    if let Some(ip) = &state.config.web.local_ip {
        return Ok(ip.clone());
    }
    let probe_url = state.config.web.local_ip_probe_url.clone();
    state
        .local_ip
        .get_or_try_init(|| async move {
            let ip = if let Some(url) = probe_url {
                let body = reqwest::get(&url).await?.error_for_status()?.text().await?;
                body.trim().to_string()
            } else {
                let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect("8.8.8.8:80").await?;
                socket.local_addr()?.ip().to_string()
            };
            info!("Local development address: {ip}");
            Ok::<_, Error>(ip)
        })
        .await
        .cloned()
}
