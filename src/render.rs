//! Template renderer — pure `{{ key }}` substitution.
//!
//! Keys with the `contact.` prefix resolve from the contact record; all
//! other keys resolve from the flat variable map. Unresolved keys render
//! as empty string, never an error.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::model::Contact;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").unwrap());

/// Replace every `{{ key }}` occurrence in `text`.
pub fn render(text: &str, contact: &Contact, variables: &HashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures| {
            let key = &caps[1];
            match key.strip_prefix("contact.") {
                Some(field) => contact_field(contact, field).unwrap_or_default(),
                None => variables.get(key).cloned().unwrap_or_default(),
            }
        })
        .into_owned()
}

fn contact_field(contact: &Contact, field: &str) -> Option<String> {
    match field {
        "email" => Some(contact.email.clone()),
        "name" => contact.name.clone(),
        "first_name" => contact.first_name.clone(),
        "last_name" => contact.last_name.clone(),
        "company" => contact.company.clone(),
        "phone" => contact.phone.clone(),
        _ => None,
    }
}
