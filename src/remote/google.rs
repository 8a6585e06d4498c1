//! Blocking HTTP client for the People API and Google's CardDAV endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;

use super::people::CONTACT_RESOURCE_PAGE_SIZE;
use super::{ConnectionsPage, ContactsRemote};
use crate::config::Endpoints;

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

const CONNECTIONS_PATH: &str = "/v1/people/me/connections";

pub struct GoogleApi {
    client: Client,
    endpoints: Endpoints,
}

impl GoogleApi {
    pub fn new(endpoints: Endpoints) -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("gcardvault/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, endpoints })
    }

    fn addressbook_url(&self, principal: &str) -> String {
        format!(
            "{}/carddav/v1/principals/{}/lists/default/",
            self.endpoints.carddav, principal
        )
    }
}

impl ContactsRemote for GoogleApi {
    fn request_contact_list(&self, token: &str, page_token: Option<&str>) -> Result<ConnectionsPage> {
        let url = format!("{}{}", self.endpoints.people_api, CONNECTIONS_PATH);
        let page_size = CONTACT_RESOURCE_PAGE_SIZE.to_string();

        let mut query: Vec<(&str, &str)> = vec![
            ("sources", "READ_SOURCE_TYPE_CONTACT"),
            ("personFields", "metadata,names"),
            ("sortOrder", "FIRST_NAME_ASCENDING"),
            ("pageSize", page_size.as_str()),
        ];
        if let Some(page_token) = page_token {
            query.push(("pageToken", page_token));
        }

        self.client
            .get(&url)
            .bearer_auth(token)
            .query(&query)
            .send()
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()
            .context("People API returned an error")?
            .json::<ConnectionsPage>()
            .context("failed to decode People API response")
    }

    fn request_carddav_report(&self, token: &str, principal: &str, body: &str) -> Result<String> {
        let url = self.addressbook_url(principal);
        let method = Method::from_bytes(b"REPORT").context("invalid HTTP method")?;

        self.client
            .request(method, &url)
            .bearer_auth(token)
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(body.to_string())
            .send()
            .with_context(|| format!("REPORT request to {url} failed"))?
            .error_for_status()
            .context("CardDAV server returned an error")?
            .text()
            .context("failed to read CardDAV response")
    }
}
