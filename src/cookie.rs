//! Test cookies.
//!
//! Every connection belonging to a test, control and data alike, starts by
//! sending the same cookie so the server can tell which test it belongs to.

use rand::Rng;
use rand::distr::{Alphanumeric, Distribution};

use crate::params::{COOKIE_SIZE, COOKIE_WIRE_SIZE};

/// Generate a cookie from the thread-local RNG.
pub fn make_cookie() -> String {
    make_cookie_with(&mut rand::rng())
}

/// Generate a cookie from `rng`: [`COOKIE_SIZE`] characters from
/// `[A-Za-z0-9]` followed by a NUL byte.
pub fn make_cookie_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut cookie = String::with_capacity(COOKIE_WIRE_SIZE);
    cookie.extend(
        Alphanumeric
            .sample_iter(rng)
            .take(COOKIE_SIZE)
            .map(char::from),
    );
    cookie.push('\0');
    cookie
}

/// The printable part of a cookie received on the wire, `None` unless the
/// buffer is exactly one cookie long and NUL terminated.
pub fn parse_cookie(wire: &[u8]) -> Option<String> {
    match wire.split_last() {
        Some((0, token)) if wire.len() == COOKIE_WIRE_SIZE => {
            Some(String::from_utf8_lossy(token).into_owned())
        }
        _ => None,
    }
}

/// The printable part of a cookie, for logs and map keys.
pub fn token(cookie: &str) -> &str {
    cookie.trim_end_matches('\0')
}
