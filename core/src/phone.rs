//! Phone number canonical forms.
//!
//! Two forms exist and they are not interchangeable:
//! - the bare form (`normalize`): the last 10 digits, used as the key of the
//!   verification registry and for duplicate detection;
//! - the dialing form (`with_country_code`): bare digits prefixed with the
//!   country code, used in `wa.me` links and protocol URLs.

pub const COUNTRY_CODE: &str = "91";
pub const BARE_DIGITS: usize = 10;
pub const MIN_DIGITS: usize = 7;
pub const MAX_DIGITS: usize = 15;

const WA_ME_PREFIX: &str = "https://wa.me/";
const PROTOCOL_PREFIX: &str = "whatsapp://send?phone=";

/// Every ASCII digit of `raw`, in order.
pub fn digits(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Strips non-digits and keeps the last 10 digits.
pub fn normalize(raw: &str) -> String {
    let clean = digits(raw);
    if clean.len() <= BARE_DIGITS {
        return clean;
    }
    clean[clean.len() - BARE_DIGITS..].to_string()
}

/// Dialing form: the bare form prefixed with the country code. Trunk and
/// international prefixes (`0…`, `0091…`, `+91…`) all collapse to the same
/// result.
pub fn with_country_code(raw: &str) -> String {
    let bare = normalize(raw);
    if bare.is_empty() {
        return bare;
    }
    format!("{}{}", COUNTRY_CODE, bare)
}

pub fn is_valid_length(number: &str) -> bool {
    (MIN_DIGITS..=MAX_DIGITS).contains(&number.len())
}

/// True when both inputs reduce to the same non-empty bare form.
pub fn same_number(a: &str, b: &str) -> bool {
    let left = normalize(a);
    !left.is_empty() && left == normalize(b)
}

/// Keys tried, in order, when looking a number up in the registry: the raw
/// digits, the digits without a leading country code, and the digits with a
/// country code added to a bare 10-digit form.
pub fn lookup_candidates(raw: &str) -> Vec<String> {
    let clean = digits(raw);
    if clean.is_empty() {
        return Vec::new();
    }
    let mut out = vec![clean.clone()];
    if clean.starts_with(COUNTRY_CODE) && clean.len() == BARE_DIGITS + COUNTRY_CODE.len() {
        out.push(clean[COUNTRY_CODE.len()..].to_string());
    }
    if clean.len() == BARE_DIGITS {
        out.push(format!("{}{}", COUNTRY_CODE, clean));
    }
    out
}

pub fn wa_me_link(dialing: &str) -> String {
    format!("{}{}", WA_ME_PREFIX, digits(dialing))
}

pub fn protocol_url(dialing: &str) -> String {
    format!("{}{}", PROTOCOL_PREFIX, digits(dialing))
}

/// Digits of a `https://wa.me/<digits>` link, or every digit of the input for
/// anything else.
pub fn number_from_link(link: &str) -> String {
    match link.strip_prefix(WA_ME_PREFIX) {
        Some(rest) => rest.chars().take_while(|c| c.is_ascii_digit()).collect(),
        None => digits(link),
    }
}

/// Converts a `wa.me` link into the protocol URL the desktop app accepts,
/// carrying over a `text` query parameter. Protocol URLs pass through.
pub fn to_protocol_url(url: &str) -> Option<String> {
    if url.starts_with("whatsapp://") {
        return Some(url.to_string());
    }
    let rest = url.strip_prefix(WA_ME_PREFIX)?;
    let (number, query) = match rest.split_once('?') {
        Some((number, query)) => (number, Some(query)),
        None => (rest, None),
    };
    let mut out = protocol_url(number);
    if let Some(text) = query.and_then(|q| q.split('&').find_map(|p| p.strip_prefix("text="))) {
        out.push_str("&text=");
        out.push_str(text);
    }
    Some(out)
}
