//! The remote contact record as seen by the sync engine.

pub const VCARD_EXTENSION: &str = ".vcf";

const CARDDAV_CONTACT_HREF_PREFIX: &str = "/carddav/v1/principals";
const UNNAMED_PREFIX: &str = "contact";

/// A contact enumerated from the People API.
///
/// `id` is the stable key. `file_name` is derived from the display name and
/// therefore changes whenever the contact is renamed remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: String,
    /// Display name, falling back to `id` when the contact has none.
    pub name: String,
    pub principal: String,
    pub etag: String,
    pub file_name: String,
    pub carddav_href: String,
}

impl Contact {
    pub fn new(id: &str, name: Option<&str>, principal: &str, etag: &str) -> Self {
        let name = name.map(str::trim).filter(|n| !n.is_empty());

        let prefix = match name {
            Some(name) => sanitize_filename(&normalize_name(name)),
            None => UNNAMED_PREFIX.to_string(),
        };

        Self {
            id: id.to_string(),
            name: name.unwrap_or(id).to_string(),
            principal: principal.to_string(),
            etag: etag.to_string(),
            file_name: format!("{prefix}_{}{VCARD_EXTENSION}", id.to_lowercase()),
            carddav_href: carddav_href(principal, id),
        }
    }

    /// Key used for every lookup against the cache and the output directory.
    pub fn key(&self) -> String {
        self.id.to_lowercase()
    }
}

/// Path of a contact's vCard resource under the default address book.
pub fn carddav_href(principal: &str, contact_id: &str) -> String {
    format!("{CARDDAV_CONTACT_HREF_PREFIX}/{principal}/lists/default/{contact_id}")
}

/// Lowercase and join whitespace-separated tokens with underscores.
fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}

/// Sanitize a string for use as a filename
///
/// Leading dots become `_` so the file is never hidden from the directory scan.
fn sanitize_filename(s: &str) -> String {
    let mut leading = true;
    s.chars()
        .map(|c| {
            leading &= c == '.';
            match c {
                '.' if leading => '_',
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                _ => c,
            }
        })
        .collect()
}
