use anyhow::{Context, Result, bail};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response as HttpResponse};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{PUBLIC_ORG, load_config, load_credentials};
use crate::earthdata::{CMR_URL, DEFAULT_MAX_RESOURCES};
use crate::error::{fatal, format_http_error};
use crate::record::{
    DefinitionSource, FieldType, FieldValue, Record, RecordDefinition, RecordStreamParser,
    decode_record,
};
use crate::util::{media_type, service_url, urljoin};

/// HTTP transport used to reach the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Host name (optionally `host:port`) of the SlideRule service.
    pub domain: String,
    /// Provisioning system organization; `None` talks to `domain` directly.
    pub organization: Option<String>,
    pub protocol: Protocol,
    /// Whether to verify TLS certificates.
    pub verify: bool,
    /// Fixed address for the service host, bypassing DNS.
    pub address: Option<IpAddr>,
}

impl ClientConfig {
    /// The protocol defaults to `https` when an organization is given and to
    /// `http` otherwise.
    pub fn new(domain: impl Into<String>, organization: Option<String>) -> Self {
        let protocol = if organization.is_some() {
            Protocol::Https
        } else {
            Protocol::Http
        };
        Self {
            domain: domain.into(),
            organization,
            protocol,
            verify: true,
            address: None,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Sends requests for the service host (`{organization}.{domain}` or
    /// `domain`) to `address` instead of resolving it.
    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    fn service_host(&self) -> String {
        let domain = self.domain.trim_end_matches('/');
        let domain = domain.split(':').next().unwrap_or(domain);
        match &self.organization {
            Some(org) => format!("{}.{}", org, domain),
            None => domain.to_string(),
        }
    }
}

/// Session setup done by [`Client::connect`].
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Cluster size to request from the provisioning system.
    pub desired_nodes: Option<u32>,
    /// Minutes the requested nodes are kept.
    pub time_to_live: Option<u32>,
    /// Server plugins that must be compatible with this client.
    pub plugins: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(crate::config::PUBLIC_URL, Some(PUBLIC_ORG.to_string()))
    }
}

/// Handler invoked for every record of a given type instead of collecting it.
pub type RecordCallback = Box<dyn FnMut(&Record) + Send>;
pub type Callbacks = HashMap<String, RecordCallback>;

/// Body of a `source` call, decoded according to its content type.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Json(Value),
    Records(Vec<Record>),
}

impl Response {
    pub fn into_json(self) -> Result<Value> {
        match self {
            Response::Json(v) => Ok(v),
            Response::Records(_) => bail!("expected a JSON response, got a record stream"),
        }
    }

    pub fn into_records(self) -> Result<Vec<Record>> {
        match self {
            Response::Records(r) => Ok(r),
            Response::Json(_) => bail!("expected a record stream, got a JSON response"),
        }
    }
}

pub(crate) struct Tokens {
    pub(crate) access: String,
    pub(crate) refresh: String,
    pub(crate) expires: Instant,
}

impl std::fmt::Debug for Tokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokens")
            .field("access", &"<redacted>")
            .field("refresh", &"<redacted>")
            .field("expires", &self.expires)
            .finish()
    }
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct TokenResponse {
    access: String,
    refresh: String,
    access_lifetime: Value,
}

impl TokenResponse {
    fn into_tokens(self) -> Tokens {
        let lifetime = self
            .access_lifetime
            .as_f64()
            .or_else(|| self.access_lifetime.as_str().and_then(|s| s.parse().ok()))
            .unwrap_or(0.0);
        Tokens {
            access: self.access,
            refresh: self.refresh,
            expires: Instant::now() + Duration::from_secs_f64((lifetime / 2.0).max(0.0)),
        }
    }
}

enum Attempt {
    Done(Response),
    Interrupted(String),
}

#[derive(Debug, Clone)]
pub struct Client {
    pub(crate) domain: String,
    pub(crate) organization: Option<String>,
    protocol: Protocol,

    pub(crate) timeout: Duration,
    attempts: usize,
    pub(crate) poll_interval: Duration,
    verbose: bool,
    progress: bool,
    ps_url: String,
    pub(crate) cmr_url: String,
    pub(crate) max_resources: usize,

    pub(crate) http: HttpClient,
    definitions: Arc<Mutex<HashMap<String, Arc<RecordDefinition>>>>,
    tokens: Arc<Mutex<Option<Tokens>>>,
}

impl Client {
    /// Creates a client from environment variables and/or `.sliderulerc`, then
    /// runs [`Client::connect`] with default options.
    pub fn from_env() -> Result<Self> {
        let client = Self::new(None, None, None)?;
        client.connect(&InitOptions::default())?;
        Ok(client)
    }

    /// Creates a client using (in order of precedence):
    /// - explicit `domain`/`organization` arguments (`Some(None)` disables the organization)
    /// - environment variables `SLIDERULE_DOMAIN` / `SLIDERULE_ORGANIZATION` / `SLIDERULE_PROTOCOL`
    /// - config file from `SLIDERULE_RC` or `.sliderulerc`
    /// - the public service
    pub fn new(
        domain: Option<String>,
        organization: Option<Option<String>>,
        verify: Option<bool>,
    ) -> Result<Self> {
        Self::init(load_config(domain, organization, verify)?)
    }

    /// Configures a client for the given service; no network I/O happens here.
    pub fn init(cfg: ClientConfig) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("sliderule-rs/{}", env!("CARGO_PKG_VERSION")))
                .unwrap_or(HeaderValue::from_static("sliderule-rs")),
        );

        let mut builder = HttpClient::builder()
            .default_headers(default_headers)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120));

        if !cfg.verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(ip) = cfg.address {
            builder = builder.resolve(&cfg.service_host(), SocketAddr::new(ip, 0));
        }

        let http = builder.build().context("failed to build HTTP client")?;

        Ok(Self {
            ps_url: format!("https://ps.{}", cfg.domain.trim_end_matches('/')),
            domain: cfg.domain,
            organization: cfg.organization,
            protocol: cfg.protocol,
            timeout: Duration::from_secs(120),
            attempts: 3,
            poll_interval: Duration::from_secs(10),
            cmr_url: CMR_URL.to_string(),
            max_resources: DEFAULT_MAX_RESOURCES,
            verbose: false,
            progress: false,
            http,
            definitions: Arc::new(Mutex::new(HashMap::new())),
            tokens: Arc::new(Mutex::new(None)),
        })
    }

    /// Read timeout for a single request.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of attempts made on connection errors and timeouts (at least one).
    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Interval between cluster capacity checks in [`Client::scaleout`].
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Forward server log and exception records to `tracing`.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Overrides the provisioning system base URL (default `https://ps.<domain>`).
    pub fn with_provisioning_url(mut self, url: impl Into<String>) -> Self {
        self.ps_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Overrides the CMR search base URL (default [`CMR_URL`]).
    pub fn with_cmr_url(mut self, url: impl Into<String>) -> Self {
        self.cmr_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Largest number of granules a CMR search may return.
    pub fn with_max_resources(mut self, max: usize) -> Self {
        self.max_resources = max;
        self
    }

    /// Logs in to the provisioning system (when an organization is set),
    /// scales the cluster to `opts.desired_nodes`, and checks this client
    /// against the server and `opts.plugins`.
    ///
    /// Returns the [`Client::check_version`] status.
    pub fn connect(&self, opts: &InitOptions) -> Result<bool> {
        if self.organization.is_some() {
            self.authenticate(None, None)?;
        }
        self.scaleout(opts.desired_nodes, opts.time_to_live)?;
        let plugins: Vec<&str> = opts.plugins.iter().map(String::as_str).collect();
        self.check_version(&plugins)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn organization(&self) -> Option<&str> {
        self.organization.as_deref()
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Calls the service endpoint `api` with `parm` as the JSON request body.
    ///
    /// Normal services are requested with GET, stream services with POST.
    pub fn source<T: Serialize>(&self, api: &str, parm: &T, stream: bool) -> Result<Response> {
        self.source_with_callbacks(api, parm, stream, &mut Callbacks::new())
    }

    /// Like [`Client::source`], but records whose type has an entry in
    /// `callbacks` are handed to it instead of being returned.
    pub fn source_with_callbacks<T: Serialize>(
        &self,
        api: &str,
        parm: &T,
        stream: bool,
        callbacks: &mut Callbacks,
    ) -> Result<Response> {
        self.request("/source", api, parm, stream, callbacks, false)
    }

    pub(crate) fn request<T: Serialize>(
        &self,
        path: &str,
        api: &str,
        parm: &T,
        stream: bool,
        callbacks: &mut Callbacks,
        silence: bool,
    ) -> Result<Response> {
        let body = serde_json::to_string(parm).context("failed to serialize request parameters")?;
        let url = service_url(
            self.protocol,
            self.organization.as_deref(),
            &self.domain,
            path,
            api,
        );

        for attempt in 1..=self.attempts {
            let method = if stream { Method::POST } else { Method::GET };
            let mut req = self
                .http
                .request(method, &url)
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone())
                .timeout(self.timeout);
            if self.organization.is_some() {
                if let Some(token) = self.access_token()? {
                    req = req.bearer_auth(token);
                }
            }

            let resp = match req.send() {
                Ok(resp) => resp,
                Err(e) if e.is_builder() => {
                    return Err(e).with_context(|| format!("invalid request to {}", url));
                }
                Err(e) => {
                    debug!(url = %url, attempt, error = %e, "request failed");
                    if !silence {
                        error!("{} ...retrying request", describe_transport_error(&e, &url));
                    }
                    continue;
                }
            };

            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().unwrap_or_default();
                return Err(format_http_error(status, &url, &text));
            }

            match self.parse_response(resp, callbacks)? {
                Attempt::Done(rsps) => return Ok(rsps),
                Attempt::Interrupted(reason) => {
                    debug!(url = %url, attempt, reason = %reason, "response interrupted");
                    if !silence {
                        error!(
                            "Unexpected termination of response from endpoint {} ...retrying request",
                            url
                        );
                    }
                }
            }
        }

        Err(fatal("Unable to complete request due to errors"))
    }

    fn parse_response(
        &self,
        mut resp: HttpResponse,
        callbacks: &mut Callbacks,
    ) -> Result<Attempt> {
        let format = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(media_type)
            .unwrap_or_default();

        match format.as_str() {
            "application/json" | "text/plain" => {
                let mut raw = Vec::new();
                if let Err(e) = resp.read_to_end(&mut raw) {
                    return Ok(Attempt::Interrupted(e.to_string()));
                }
                let value = serde_json::from_slice(&raw)
                    .with_context(|| format!("failed to parse JSON response from {}", resp.url()))?;
                Ok(Attempt::Done(Response::Json(value)))
            }
            "application/octet-stream" => self.parse_native(resp, callbacks),
            other => Err(fatal(format!("unsupported content type: {}", other))),
        }
    }

    fn parse_native(&self, mut resp: HttpResponse, callbacks: &mut Callbacks) -> Result<Attempt> {
        let started = Instant::now();
        let mut parser = RecordStreamParser::new();
        let mut recs = Vec::new();

        let pb = if self.progress {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) =
                ProgressStyle::with_template("{spinner:.green} {pos} records received ({elapsed})")
            {
                pb.set_style(style);
            }
            Some(pb)
        } else {
            None
        };

        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = match resp.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    if let Some(pb) = &pb {
                        pb.abandon();
                    }
                    return Ok(Attempt::Interrupted(e.to_string()));
                }
            };

            for raw in parser.push(&buf[..n])? {
                let rec = decode_record(&raw.rectype, &raw.data, self)?;
                self.dispatch(rec, callbacks, &mut recs);
                if let Some(pb) = &pb {
                    pb.inc(1);
                }
            }
        }

        if parser.pending_bytes() > 0 {
            warn!(
                bytes = parser.pending_bytes(),
                "response ended inside a record; partial record discarded"
            );
        }
        if let Some(pb) = &pb {
            pb.finish_and_clear();
        }
        debug!(
            records = recs.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "record stream parsed"
        );

        Ok(Attempt::Done(Response::Records(recs)))
    }

    fn dispatch(&self, rec: Record, callbacks: &mut Callbacks, recs: &mut Vec<Record>) {
        if let Some(cb) = callbacks.get_mut(&rec.rectype) {
            cb(&rec);
            return;
        }
        match rec.rectype.as_str() {
            "eventrec" | "exceptrec" => self.log_server_record(&rec),
            _ => recs.push(rec),
        }
    }

    fn log_server_record(&self, rec: &Record) {
        if !self.verbose {
            return;
        }

        let level = rec.get("level").and_then(FieldValue::as_i64).unwrap_or(1);
        let msg = if rec.rectype == "exceptrec" {
            let code = rec.get("code").and_then(FieldValue::as_i64).unwrap_or(-1);
            let text = rec.get("text").and_then(FieldValue::as_str).unwrap_or("");
            if code >= 0 {
                format!("Exception <{}>: {}", code, text)
            } else {
                text.to_string()
            }
        } else {
            rec.get("attr")
                .and_then(FieldValue::as_str)
                .unwrap_or("")
                .to_string()
        };

        match level {
            0 => debug!(target: "sliderule::server", "{}", msg),
            1 => info!(target: "sliderule::server", "{}", msg),
            2 => warn!(target: "sliderule::server", "{}", msg),
            _ => error!(target: "sliderule::server", "{}", msg),
        }
    }

    /// Record definition of `rectype`, fetched once and cached.
    pub fn record_definition(&self, rectype: &str) -> Result<Arc<RecordDefinition>> {
        {
            let cache = self.definitions.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(def) = cache.get(rectype) {
                return Ok(def.clone());
            }
        }

        let doc = self
            .source("definition", &serde_json::json!({ "rectype": rectype }), false)?
            .into_json()?;
        let def = Arc::new(RecordDefinition::from_json(rectype, &doc)?);
        self.definitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(rectype.to_string(), def.clone());
        Ok(def)
    }

    /// Type name of `field` in `rectype`, if the record has such a field.
    pub fn field_type(&self, rectype: &str, field: &str) -> Result<Option<FieldType>> {
        let def = self.record_definition(rectype)?;
        Ok(def.field(field).map(|f| f.field_type.clone()))
    }

    /// Logs in to the provisioning system for this client's organization.
    ///
    /// Credentials come from the arguments, then `PS_USERNAME`/`PS_PASSWORD`,
    /// then the `ps.<domain>` entry of `~/.netrc`. Returns `false` when no
    /// credentials are found or the login is rejected.
    pub fn authenticate(&self, username: Option<&str>, password: Option<&str>) -> Result<bool> {
        let Some(org) = self.organization.as_deref() else {
            return Ok(true);
        };

        let machine = format!("ps.{}", self.domain);
        let creds = match (username, password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => {
                Some((u.to_string(), p.to_string()))
            }
            _ => load_credentials(&machine)?,
        };

        let Some((username, password)) = creds else {
            if org != PUBLIC_ORG {
                warn!("Unable to retrieve username and password for machine {}", machine);
            }
            return Ok(false);
        };

        let rqst = serde_json::json!({
            "username": username,
            "password": password,
            "org_name": org,
        });
        match self.ps_call::<TokenResponse>(Method::POST, "/api/org_token/", None, Some(&rqst)) {
            Ok(rsps) => {
                *self.tokens.lock().unwrap_or_else(|e| e.into_inner()) = Some(rsps.into_tokens());
                info!(organization = org, "authenticated to provisioning system");
                Ok(true)
            }
            Err(e) => {
                error!("Unable to authenticate user {} to {}: {:#}", username, self.ps_url, e);
                Ok(false)
            }
        }
    }

    /// Current access token, refreshed first if it has expired.
    pub(crate) fn access_token(&self) -> Result<Option<String>> {
        let mut guard = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tokens) = guard.as_mut() else {
            return Ok(None);
        };

        if Instant::now() > tokens.expires {
            let rqst = serde_json::json!({ "refresh": tokens.refresh });
            let rsps: TokenResponse = self
                .ps_call(
                    Method::POST,
                    "/api/org_token/refresh/",
                    Some(&tokens.access),
                    Some(&rqst),
                )
                .context("failed to refresh provisioning system token")?;
            *tokens = rsps.into_tokens();
            debug!("provisioning system token refreshed");
        }

        Ok(Some(tokens.access.clone()))
    }

    pub(crate) fn ps_call<TResp: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        bearer: Option<&str>,
        body: Option<&Value>,
    ) -> Result<TResp> {
        let url = urljoin(&self.ps_url, path);
        let mut req: RequestBuilder = self.http.request(method, &url).timeout(self.timeout);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req
            .send()
            .with_context(|| format!("could not connect to {}", url))?;
        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        if !status.is_success() {
            return Err(format_http_error(status, &url, &text));
        }

        serde_json::from_str::<TResp>(&text)
            .with_context(|| format!("failed to parse API JSON (url={}, status={})", url, status))
    }
}

impl DefinitionSource for Client {
    fn definition(&self, rectype: &str) -> Result<Arc<RecordDefinition>> {
        self.record_definition(rectype)
    }
}

fn describe_transport_error(e: &reqwest::Error, url: &str) -> String {
    if e.is_timeout() {
        format!("Timed-out waiting for response from endpoint {}", url)
    } else if e.is_connect() {
        format!("Connection error to endpoint {}", url)
    } else if e.is_body() || e.is_decode() {
        format!("Unexpected termination of response from endpoint {}", url)
    } else {
        format!("Request to {} failed ({})", url, e)
    }
}
