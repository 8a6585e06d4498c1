//! Contact enumeration over the People API.

use anyhow::{Context, Result};

use super::{ContactsRemote, Person};
use crate::contact::Contact;

/// Page size requested from `people.connections.list`.
pub const CONTACT_RESOURCE_PAGE_SIZE: u32 = 500;

const CONTACT_SOURCE_TYPE: &str = "CONTACT";

/// List every contact owned by `principal`, following page tokens to the end.
pub fn list_contacts<R: ContactsRemote + ?Sized>(
    remote: &R,
    token: &str,
    principal: &str,
) -> Result<Vec<Contact>> {
    let mut contacts = Vec::new();
    let mut next_page_token: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = remote
            .request_contact_list(token, next_page_token.as_deref())
            .with_context(|| format!("failed to list contacts (page {})", pages + 1))?;
        pages += 1;

        log::debug!("contact list page {} has {} connection(s)", pages, page.connections.len());
        contacts.extend(
            page.connections
                .iter()
                .filter_map(|person| contact_from_person(person, principal)),
        );

        match page.next_page_token {
            Some(next) if !next.is_empty() => next_page_token = Some(next),
            _ => break,
        }
    }

    Ok(contacts)
}

/// Build a contact from a connection, or `None` if it has no personal contact source
/// (for example a directory profile the user never saved).
pub fn contact_from_person(person: &Person, principal: &str) -> Option<Contact> {
    let source = person
        .metadata
        .sources
        .iter()
        .find(|source| source.source_type.as_deref() == Some(CONTACT_SOURCE_TYPE));

    let (id, etag) = match source {
        Some(source) => match (&source.id, &source.etag) {
            (Some(id), Some(etag)) => (id, etag),
            _ => {
                log::warn!(
                    "skipping connection {} with incomplete contact source",
                    person.resource_name.as_deref().unwrap_or("<unnamed>")
                );
                return None;
            }
        },
        None => {
            log::debug!(
                "skipping connection {} without a contact source",
                person.resource_name.as_deref().unwrap_or("<unnamed>")
            );
            return None;
        }
    };

    let display_name = person
        .names
        .iter()
        .find(|name| {
            name.metadata
                .source
                .as_ref()
                .and_then(|source| source.source_type.as_deref())
                == Some(CONTACT_SOURCE_TYPE)
        })
        .and_then(|name| name.display_name.as_deref());

    Some(Contact::new(id, display_name, principal, etag))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::remote::ConnectionsPage;

    fn person(value: serde_json::Value) -> Person {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn prefers_contact_sourced_name() {
        let p = person(serde_json::json!({
            "resourceName": "people/c1",
            "metadata": {"sources": [
                {"type": "PROFILE", "id": "p1", "etag": "pe"},
                {"type": "CONTACT", "id": "AB12", "etag": "\"e1\""}
            ]},
            "names": [
                {"displayName": "Profile Name", "metadata": {"source": {"type": "PROFILE", "id": "p1"}}},
                {"displayName": "Jane Doe", "metadata": {"source": {"type": "CONTACT", "id": "AB12"}}}
            ]
        }));

        let contact = contact_from_person(&p, "me@example.com").unwrap();
        assert_eq!(contact.id, "AB12");
        assert_eq!(contact.etag, "\"e1\"");
        assert_eq!(contact.name, "Jane Doe");
        assert_eq!(contact.file_name, "jane_doe_ab12.vcf");
    }

    #[test]
    fn name_without_contact_source_is_absent() {
        let p = person(serde_json::json!({
            "metadata": {"sources": [{"type": "CONTACT", "id": "AB12", "etag": "e1"}]},
            "names": [{"displayName": "Profile Name", "metadata": {"source": {"type": "PROFILE"}}}]
        }));

        let contact = contact_from_person(&p, "me@example.com").unwrap();
        assert_eq!(contact.name, "AB12");
        assert_eq!(contact.file_name, "contact_ab12.vcf");
    }

    #[test]
    fn profile_only_connection_is_skipped() {
        let p = person(serde_json::json!({
            "metadata": {"sources": [{"type": "DOMAIN_PROFILE", "id": "d1", "etag": "e"}]},
            "names": [{"displayName": "Colleague", "metadata": {"source": {"type": "DOMAIN_PROFILE"}}}]
        }));
        assert!(contact_from_person(&p, "me@example.com").is_none());

        let incomplete = person(serde_json::json!({
            "metadata": {"sources": [{"type": "CONTACT", "id": "x"}]}
        }));
        assert!(contact_from_person(&incomplete, "me@example.com").is_none());
    }

    struct PagedRemote {
        pages: Vec<ConnectionsPage>,
        requested: RefCell<Vec<Option<String>>>,
    }

    impl ContactsRemote for PagedRemote {
        fn request_contact_list(&self, _token: &str, page_token: Option<&str>) -> Result<ConnectionsPage> {
            self.requested.borrow_mut().push(page_token.map(str::to_string));
            let index = page_token.map(|t| t.parse::<usize>().unwrap()).unwrap_or(0);
            Ok(self.pages[index].clone())
        }

        fn request_carddav_report(&self, _token: &str, _principal: &str, _body: &str) -> Result<String> {
            unreachable!("not used by enumeration")
        }
    }

    fn page(ids: &[&str], next: Option<&str>) -> ConnectionsPage {
        let connections: Vec<_> = ids
            .iter()
            .map(|id| serde_json::json!({"metadata": {"sources": [{"type": "CONTACT", "id": id, "etag": "e"}]}}))
            .collect();
        serde_json::from_value(serde_json::json!({
            "connections": connections,
            "nextPageToken": next,
        }))
        .unwrap()
    }

    #[test]
    fn follows_page_tokens_until_exhausted() {
        let remote = PagedRemote {
            pages: vec![page(&["a", "b"], Some("1")), page(&["c"], Some("2")), page(&[], None)],
            requested: RefCell::new(Vec::new()),
        };

        let contacts = list_contacts(&remote, "tok", "me@example.com").unwrap();
        let ids: Vec<_> = contacts.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(
            *remote.requested.borrow(),
            vec![None, Some("1".to_string()), Some("2".to_string())]
        );
    }

    #[test]
    fn empty_page_without_connections_field() {
        let remote = PagedRemote {
            pages: vec![serde_json::from_str("{}").unwrap()],
            requested: RefCell::new(Vec::new()),
        };
        assert!(list_contacts(&remote, "tok", "me@example.com").unwrap().is_empty());
    }
}
