//! Markup extraction for the browser-oriented endpoints.
//!
//! The platform has no API surface; tokens are scraped out of page markup.
//! The exact markup shape is unstable, so extraction lives behind the
//! [`MarkupAdapter`] trait and the rest of the crate only depends on its
//! contract: each function returns `Some` with the extracted value or `None`
//! when the page does not carry it (logged-out page, changed markup).

use std::sync::Arc;

use regex::Regex;

/// Extracts tokens from platform markup.
///
/// Implement this to track a markup revision the built-in [`DefaultMarkup`]
/// does not understand; pass it via
/// [`CredentialStore::with_markup`](crate::CredentialStore::with_markup) or
/// [`RoomOptions`](crate::RoomOptions).
pub trait MarkupAdapter: Send + Sync {
    /// Anti-forgery token embedded in the login form.
    fn login_fkey(&self, html: &str) -> Option<String>;

    /// Room-scoped anti-forgery token embedded in a chat page.
    fn room_fkey(&self, html: &str) -> Option<String>;

    /// Chat user id taken from the signed-in profile link. `None` on a
    /// logged-out page.
    fn profile_user_id(&self, html: &str) -> Option<u64>;
}

/// Shared, reference-counted markup adapter.
pub type ArcMarkupAdapter = Arc<dyn MarkupAdapter>;

/// Regex-based adapter for the current markup revision.
///
/// Both hosts embed the fkey as an `<input>` tag whose `id` or `name`
/// attribute is `fkey`; the signed-in user id appears in the topbar profile
/// link `/users/<id>/...`.
pub struct DefaultMarkup {
    input_tag: Regex,
    value_attr: Regex,
    profile_href: Regex,
}

impl DefaultMarkup {
    pub fn new() -> Self {
        Self {
            // attribute order inside the tag is not stable across pages
            input_tag: Regex::new(r"<input[^>]+>").expect("valid input tag pattern"),
            value_attr: Regex::new(r#"value\s*=\s*"([^"]+)""#).expect("valid value pattern"),
            profile_href: Regex::new(r#"href\s*=\s*"/users/(\d+)"#)
                .expect("valid profile href pattern"),
        }
    }

    fn fkey_input_value(&self, html: &str) -> Option<String> {
        for tag in self.input_tag.find_iter(html) {
            let tag = tag.as_str();
            if !tag.contains(r#""fkey""#) && !tag.contains("'fkey'") {
                continue;
            }
            if let Some(caps) = self.value_attr.captures(tag) {
                return Some(caps[1].to_string());
            }
        }
        None
    }
}

impl Default for DefaultMarkup {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkupAdapter for DefaultMarkup {
    fn login_fkey(&self, html: &str) -> Option<String> {
        self.fkey_input_value(html)
    }

    fn room_fkey(&self, html: &str) -> Option<String> {
        self.fkey_input_value(html)
    }

    fn profile_user_id(&self, html: &str) -> Option<u64> {
        let caps = self.profile_href.captures(html)?;
        caps[1].parse().ok()
    }
}
