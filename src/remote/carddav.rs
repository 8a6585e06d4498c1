//! CardDAV `addressbook-multiget` batching and multistatus parsing.

use std::collections::HashMap;

use anyhow::{Context, Result};
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use super::ContactsRemote;
use crate::contact::Contact;
use crate::error::Error;

/// Maximum number of hrefs sent in one REPORT request.
pub const CARDDAV_REPORT_PAGE_SIZE: usize = 250;

const DAV_NS: &str = "DAV:";
const CARDDAV_NS: &str = "urn:ietf:params:xml:ns:carddav";

/// Download the vCards of `contacts`, keyed by CardDAV href.
///
/// Every batch must account for all of its hrefs, otherwise the whole fetch fails
/// naming the first missing contact. `on_batch` is called with the size of each
/// completed batch.
pub fn fetch_vcards<R: ContactsRemote + ?Sized>(
    remote: &R,
    token: &str,
    principal: &str,
    contacts: &[Contact],
    mut on_batch: impl FnMut(usize),
) -> Result<HashMap<String, String>> {
    let mut vcards = HashMap::with_capacity(contacts.len());

    for (index, batch) in contacts.chunks(CARDDAV_REPORT_PAGE_SIZE).enumerate() {
        log::debug!("requesting vCard batch {} ({} contact(s))", index + 1, batch.len());

        let body = multiget_body(batch.iter().map(|contact| contact.carddav_href.as_str()));
        let xml = remote
            .request_carddav_report(token, principal, &body)
            .with_context(|| format!("failed to download vCard batch {}", index + 1))?;
        let mut received = parse_multistatus(&xml)?;

        for contact in batch {
            let vcard = received
                .remove(&contact.carddav_href)
                .ok_or_else(|| Error::VcardNotDownloaded {
                    name: contact.name.clone(),
                })?;
            vcards.insert(contact.carddav_href.clone(), vcard);
        }

        on_batch(batch.len());
    }

    Ok(vcards)
}

/// Build the REPORT body requesting `address-data` for each href.
pub fn multiget_body<'a>(hrefs: impl IntoIterator<Item = &'a str>) -> String {
    let mut body = String::new();
    body.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    body.push_str(&format!(
        "<card:addressbook-multiget xmlns:d=\"{DAV_NS}\" xmlns:card=\"{CARDDAV_NS}\">\n"
    ));
    body.push_str("    <d:prop>\n        <card:address-data />\n    </d:prop>\n");
    for href in hrefs {
        body.push_str("    <d:href>");
        body.push_str(&escape(href));
        body.push_str("</d:href>\n");
    }
    body.push_str("</card:addressbook-multiget>\n");
    body
}

#[derive(Clone, Copy)]
enum Field {
    Href,
    Status,
    AddressData,
}

/// Collect `href -> address-data` for every propstat whose status is 200.
///
/// Elements are matched by local name; the payload is unescaped but otherwise
/// returned exactly as sent.
pub fn parse_multistatus(xml: &str) -> Result<HashMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    let mut vcards = HashMap::new();

    let mut field: Option<Field> = None;
    let mut text = String::new();
    let mut href: Option<String> = None;
    let mut status: Option<String> = None;
    let mut address_data: Option<String> = None;
    let mut payload: Option<String> = None;

    loop {
        match reader
            .read_event()
            .with_context(|| format!("malformed multistatus response at byte {}", reader.buffer_position()))?
        {
            Event::Start(e) => {
                let next = match e.local_name().as_ref() {
                    b"response" => {
                        href = None;
                        payload = None;
                        None
                    }
                    b"propstat" => {
                        status = None;
                        address_data = None;
                        None
                    }
                    b"href" => Some(Field::Href),
                    b"status" => Some(Field::Status),
                    b"address-data" => Some(Field::AddressData),
                    _ => None,
                };
                if next.is_some() {
                    text.clear();
                    field = next;
                }
            }
            Event::Text(t) if field.is_some() => {
                text.push_str(&t.unescape().context("invalid escape in multistatus response")?);
            }
            Event::CData(c) if field.is_some() => {
                text.push_str(&String::from_utf8_lossy(&c));
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"href" | b"status" | b"address-data" => match field.take() {
                    Some(Field::Href) => href = Some(text.trim().to_string()),
                    Some(Field::Status) => status = Some(text.trim().to_string()),
                    Some(Field::AddressData) => address_data = Some(std::mem::take(&mut text)),
                    None => {}
                },
                b"propstat" => {
                    if status.as_deref().is_some_and(is_success_status) {
                        if let Some(data) = address_data.take().filter(|d| !d.is_empty()) {
                            payload = Some(data);
                        }
                    }
                }
                b"response" => {
                    if let (Some(href), Some(payload)) = (href.take(), payload.take()) {
                        vcards.insert(href, payload);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(vcards)
}

/// `HTTP/1.1 200 OK` style status line.
fn is_success_status(status: &str) -> bool {
    status.split_whitespace().nth(1) == Some("200")
}
