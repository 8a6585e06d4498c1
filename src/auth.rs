//! OAuth2 installed-app authorization and the on-disk token store.

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::Client;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::Endpoints;
use crate::error::Error;
use crate::remote::google::HTTP_TIMEOUT;
use crate::vdir;

pub const OAUTH_SCOPES: &[&str] = &[
    "openid",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/contacts.readonly",
    "https://www.googleapis.com/auth/carddav",
];

const AUTHORIZE_COMMAND: &str = "gcardvault authorize";
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);
/// Tokens this close to expiry are refreshed ahead of use.
const EXPIRY_SKEW: time::Duration = time::Duration::seconds(60);

/// Authorized-user token, stored as JSON in `<conf_dir>/<user>.token.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// RFC 3339 timestamp. A token without one never expires locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
}

impl Credentials {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read token file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid token file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw.trim()).context("failed to parse authorized user token")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize token")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        vdir::write_atomic_private(path, self.to_json()?.as_bytes())
            .with_context(|| format!("failed to save token to {}", path.display()))
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        let Some(expiry) = self.expiry.as_deref() else {
            return false;
        };
        match OffsetDateTime::parse(expiry, &Rfc3339) {
            Ok(expiry) => now + EXPIRY_SKEW >= expiry,
            Err(err) => {
                log::warn!("unreadable token expiry '{}': {}", expiry, err);
                true
            }
        }
    }

    pub fn is_valid(&self, now: OffsetDateTime) -> bool {
        !self.token.is_empty() && !self.is_expired(now)
    }

    fn apply_token_response(&mut self, response: TokenResponse, now: OffsetDateTime) -> Result<()> {
        self.token = response.access_token;
        if response.refresh_token.is_some() {
            self.refresh_token = response.refresh_token;
        }
        if let Some(scope) = response.scope {
            self.scopes = scope.split_whitespace().map(str::to_string).collect();
        }
        self.expiry = match response.expires_in {
            Some(seconds) => Some(
                (now + time::Duration::seconds(seconds))
                    .format(&Rfc3339)
                    .context("failed to format token expiry")?,
            ),
            None => None,
        };
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    email: String,
}

/// Google OAuth2 for installed applications.
pub struct GoogleOAuth2 {
    http: Client,
    endpoints: Endpoints,
    client_id: Option<String>,
    client_secret: Option<String>,
    scopes: Vec<String>,
}

impl GoogleOAuth2 {
    pub fn new(
        endpoints: Endpoints,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoints,
            client_id,
            client_secret,
            scopes: OAUTH_SCOPES.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Return usable credentials for `user`, and whether a new authorization was needed.
    pub fn get_credentials(&self, token_file: &Path, user: &str) -> Result<(Credentials, bool)> {
        let now = OffsetDateTime::now_utc();
        let stored = if token_file.exists() {
            Some(Credentials::from_file(token_file)?)
        } else {
            None
        };

        match stored {
            Some(mut credentials) if credentials.is_expired(now) && credentials.refresh_token.is_some() => {
                self.refresh(&mut credentials)?;
                credentials.save(token_file)?;
                println!("Credentials refreshed, token saved to {}", token_file.display());
                Ok((credentials, false))
            }
            Some(credentials) if credentials.is_valid(now) => Ok((credentials, false)),
            _ => Ok((self.authorize_and_save(token_file, user)?, true)),
        }
    }

    /// Authorize `user` and write the token to `token_file`.
    ///
    /// Without a browser the user is asked to paste a token produced by
    /// `gcardvault authorize` on another machine.
    pub fn authorize_and_save(&self, token_file: &Path, user: &str) -> Result<Credentials> {
        let credentials = if is_headless() {
            println!(
                "\nNo web browser detected. Google's OAuth2 authorization cannot proceed in headless mode.\n\n\
                 On a machine with a web browser, run the following to generate a token and paste it below:\n   \
                 {AUTHORIZE_COMMAND} {user}\n\n\
                 This is a one-time operation. If successful, gcardvault can proceed in headless mode\n\
                 from this point forward.\n"
            );
            println!("Paste the token here:");
            let credentials = read_pasted_token(io::stdin().lock())?;
            self.validate_user(&credentials, user)?;
            credentials
        } else {
            self.run_authorization_flow(user)?
        };

        credentials.save(token_file)?;
        println!("Authorization successful, token saved to {}", token_file.display());
        Ok(credentials)
    }

    /// Authorize `user` and print the token for pasting into a headless machine.
    pub fn authorize_and_export(&self, user: &str) -> Result<Credentials> {
        if is_headless() {
            return Err(Error::HeadlessAuthorization.into());
        }

        let credentials = self.run_authorization_flow(user)?;
        println!(
            "\nAuthorization successful, paste the following into your remote machine --->\n{}\n<--- end paste\n",
            credentials.to_json()?
        );
        Ok(credentials)
    }

    pub fn request_user_email(&self, credentials: &Credentials) -> Result<String> {
        let info: UserInfo = self
            .http
            .get(&self.endpoints.userinfo)
            .bearer_auth(&credentials.token)
            .send()
            .context("userinfo request failed")?
            .error_for_status()
            .context("userinfo endpoint returned an error")?
            .json()
            .context("failed to decode userinfo response")?;
        Ok(info.email)
    }

    fn validate_user(&self, credentials: &Credentials, user: &str) -> Result<()> {
        let email = self.request_user_email(credentials)?;
        if email.trim().to_lowercase() != user.trim().to_lowercase() {
            return Err(Error::UserMismatch {
                expected: user.to_string(),
                actual: email,
            }
            .into());
        }
        Ok(())
    }

    fn client_credentials(&self) -> Result<(&str, &str)> {
        let client_id = self.client_id.as_deref().ok_or_else(|| {
            anyhow!("an OAuth client id is required (--client-id or GCARDVAULT_CLIENT_ID)")
        })?;
        let client_secret = self.client_secret.as_deref().ok_or_else(|| {
            anyhow!("an OAuth client secret is required (--client-secret or GCARDVAULT_CLIENT_SECRET)")
        })?;
        Ok((client_id, client_secret))
    }

    fn refresh(&self, credentials: &mut Credentials) -> Result<()> {
        log::info!("refreshing expired access token");

        let refresh_token = credentials
            .refresh_token
            .clone()
            .ok_or_else(|| anyhow!("token has no refresh token"))?;
        let client_id = credentials
            .client_id
            .clone()
            .or_else(|| self.client_id.clone())
            .ok_or_else(|| anyhow!("token has no client id to refresh with"))?;
        let client_secret = credentials
            .client_secret
            .clone()
            .or_else(|| self.client_secret.clone())
            .unwrap_or_default();

        let response = self.post_token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
        ])?;
        credentials.apply_token_response(response, OffsetDateTime::now_utc())
    }

    fn run_authorization_flow(&self, user: &str) -> Result<Credentials> {
        let (client_id, client_secret) = self.client_credentials()?;

        let listener =
            TcpListener::bind("127.0.0.1:0").context("failed to start the local callback server")?;
        let port = listener.local_addr()?.port();
        let redirect_uri = format!("http://127.0.0.1:{port}/");
        let state = uuid::Uuid::new_v4().to_string();

        let url = authorization_url(
            &self.endpoints.auth,
            client_id,
            &redirect_uri,
            &self.scopes,
            &state,
            user,
        )?;
        println!("Please visit this URL: {url}");
        if let Err(err) = open_browser(url.as_str()) {
            log::warn!("could not open a browser: {}", err);
        }

        let code = wait_for_callback(&listener, &state, CALLBACK_TIMEOUT)?;
        log::debug!("received authorization code");

        let response = self.post_token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ])?;

        let mut credentials = Credentials {
            token_uri: Some(self.endpoints.token.clone()),
            client_id: Some(client_id.to_string()),
            client_secret: Some(client_secret.to_string()),
            scopes: self.scopes.clone(),
            ..Credentials::default()
        };
        credentials.apply_token_response(response, OffsetDateTime::now_utc())?;

        self.validate_user(&credentials, user)?;
        Ok(credentials)
    }

    fn post_token_request(&self, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&self.endpoints.token)
            .form(form)
            .send()
            .context("token request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("token endpoint returned {status}: {}", body.trim());
        }

        response.json().context("failed to decode token response")
    }
}

pub fn authorization_url(
    auth_url: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &[String],
    state: &str,
    login_hint: &str,
) -> Result<Url> {
    let scope = scopes.join(" ");
    Url::parse_with_params(
        auth_url,
        &[
            ("response_type", "code"),
            ("client_id", client_id),
            ("redirect_uri", redirect_uri),
            ("scope", scope.as_str()),
            ("state", state),
            ("login_hint", login_hint),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ],
    )
    .with_context(|| format!("invalid authorization endpoint {auth_url}"))
}

/// Read a single line of pasted token JSON.
fn read_pasted_token(mut input: impl BufRead) -> Result<Credentials> {
    let mut line = String::new();
    input
        .read_line(&mut line)
        .context("failed to read the pasted token")?;
    Credentials::from_json(&line)
}

/// `true` when no browser can be launched for the consent screen.
fn is_headless() -> bool {
    headless_from_env(|name| std::env::var(name).ok())
}

fn headless_from_env(var: impl Fn(&str) -> Option<String>) -> bool {
    if cfg!(any(target_os = "macos", target_os = "windows")) {
        return false;
    }
    let set = |name: &str| var(name).is_some_and(|value| !value.trim().is_empty());
    !(set("BROWSER") || set("DISPLAY") || set("WAYLAND_DISPLAY"))
}

fn open_browser(url: &str) -> io::Result<()> {
    if let Ok(browser) = std::env::var("BROWSER") {
        if !browser.trim().is_empty() {
            std::process::Command::new(browser).arg(url).spawn()?;
            return Ok(());
        }
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg(url).spawn()?;
    }
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("cmd")
            .args(["/C", "start", "", url])
            .spawn()?;
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        std::process::Command::new("xdg-open").arg(url).spawn()?;
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Callback {
    Code { code: String, state: Option<String> },
    Denied(String),
    Unrelated,
}

/// Interpret the request line of a redirect, e.g. `GET /?code=..&state=.. HTTP/1.1`.
fn parse_callback(request_line: &str) -> Callback {
    let Some(target) = request_line.split_whitespace().nth(1) else {
        return Callback::Unrelated;
    };
    let Ok(url) = Url::parse(&format!("http://127.0.0.1{target}")) else {
        return Callback::Unrelated;
    };

    let mut code = None;
    let mut state = None;
    let mut error = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            _ => {}
        }
    }

    match (code, error) {
        (Some(code), _) => Callback::Code { code, state },
        (None, Some(error)) => Callback::Denied(error),
        (None, None) => Callback::Unrelated,
    }
}

fn wait_for_callback(listener: &TcpListener, expected_state: &str, timeout: Duration) -> Result<String> {
    listener
        .set_nonblocking(true)
        .context("failed to configure the local callback server")?;
    let start = Instant::now();

    loop {
        if start.elapsed() > timeout {
            bail!("timed out waiting for the authorization redirect");
        }

        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
            Err(err) => return Err(err).context("callback server accept failed"),
        };
        stream.set_nonblocking(false).ok();
        stream.set_read_timeout(Some(Duration::from_secs(5))).ok();

        let mut request_line = String::new();
        if BufReader::new(&stream).read_line(&mut request_line).is_err() {
            continue;
        }

        match parse_callback(&request_line) {
            Callback::Code { code, state } => {
                if state.as_deref() != Some(expected_state) {
                    respond(&stream, "400 Bad Request", "Authorization failed: state mismatch.");
                    bail!("authorization redirect carried an unexpected state");
                }
                respond(&stream, "200 OK", "The auth flow is complete. You may close this window.");
                return Ok(code);
            }
            Callback::Denied(error) => {
                respond(&stream, "200 OK", "Authorization was not granted. You may close this window.");
                bail!("authorization was denied: {error}");
            }
            Callback::Unrelated => respond(&stream, "404 Not Found", "Not found."),
        }
    }
}

fn respond(mut stream: &TcpStream, status: &str, message: &str) {
    let body = format!("<html><body><p>{message}</p></body></html>");
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.flush();
}
