//! Remote Google services and the seam the sync engine talks through.
//!
//! This module provides:
//! - `ContactsRemote` trait for the two raw calls the vault makes
//! - `GoogleApi`, the HTTP implementation of that trait
//! - People API wire types and the contact enumeration built on them
//! - CardDAV multiget batching and multistatus parsing

pub mod carddav;
pub mod google;
pub mod people;

use anyhow::Result;
use serde::Deserialize;

/// One page of `people.connections.list`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionsPage {
    pub connections: Vec<Person>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Person {
    pub resource_name: Option<String>,
    pub metadata: PersonMetadata,
    pub names: Vec<Name>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PersonMetadata {
    pub sources: Vec<Source>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Source {
    #[serde(rename = "type")]
    pub source_type: Option<String>,
    pub id: Option<String>,
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Name {
    pub display_name: Option<String>,
    pub metadata: FieldMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FieldMetadata {
    pub source: Option<Source>,
}

/// Raw request/response calls against Google's contact services.
///
/// Pagination, batching and interpretation of the results live in
/// [`people`] and [`carddav`], so implementations only move bytes.
pub trait ContactsRemote {
    /// Fetch one page of the authenticated user's connections.
    fn request_contact_list(&self, token: &str, page_token: Option<&str>) -> Result<ConnectionsPage>;

    /// Send an `addressbook-multiget` REPORT and return the multistatus XML.
    fn request_carddav_report(&self, token: &str, principal: &str, body: &str) -> Result<String>;
}
