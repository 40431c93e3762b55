//! Orion Browser - headless Chrome cookie harvesting for the screener.
//!
//! The HTTP fetcher falls back to this crate when the screener API blocks
//! plain requests. A real browser renders the UI page, the table columns are
//! expanded and scrolled, and the resulting cookies are handed back as a
//! [`CookieJar`].

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod cookies;
pub mod error;
pub mod harvester;

pub use cookies::CookieJar;
pub use error::BrowserError;
pub use harvester::{sleep_bounded, ChromeHarvester, CookieHarvester};
