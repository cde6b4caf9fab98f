use wa_sender_core::phone::{
    digits, is_valid_length, lookup_candidates, normalize, number_from_link, protocol_url, same_number,
    to_protocol_url, wa_me_link, with_country_code,
};

#[test]
fn normalize_keeps_last_ten_digits() {
    assert_eq!(normalize("+91 98765-43210"), "9876543210");
    assert_eq!(normalize("0091 9876543210"), "9876543210");
    assert_eq!(normalize("(987) 654 3210"), "9876543210");
    assert_eq!(normalize("12345"), "12345");
    assert_eq!(normalize("no digits"), "");
}

#[test]
fn normalize_is_idempotent() {
    for raw in ["+91 98765 43210", "919876543210", "98765", "+1 (555) 010-9999", ""] {
        let once = normalize(raw);
        assert_eq!(normalize(&once), once);
        if digits(raw).len() >= 10 {
            assert_eq!(once.len(), 10);
        }
    }
}

#[test]
fn with_country_code_prefixes_once() {
    assert_eq!(with_country_code("9876543210"), "919876543210");
    assert_eq!(with_country_code("+91 98765 43210"), "919876543210");
    // a bare ten digit number that happens to start with 91 still gets the prefix
    assert_eq!(with_country_code("9123456789"), "919123456789");
    assert_eq!(with_country_code(""), "");
}

#[test]
fn trunk_and_international_prefixes_share_one_dialing_form() {
    for raw in ["09876543210", "0091 98765 43210", "+91-98765-43210", "919876543210", "9876543210"] {
        assert_eq!(with_country_code(raw), "919876543210", "input {}", raw);
        assert_eq!(wa_me_link(&with_country_code(raw)), "https://wa.me/919876543210");
    }
}

#[test]
fn both_canonical_forms_agree_on_identity() {
    assert!(same_number("919876543210", "98765 43210"));
    assert!(!same_number("9876543210", "9876543211"));
    assert!(!same_number("", ""));
}

#[test]
fn length_bounds_are_inclusive() {
    assert!(!is_valid_length("123456"));
    assert!(is_valid_length("1234567"));
    assert!(is_valid_length("123456789012345"));
    assert!(!is_valid_length("1234567890123456"));
}

#[test]
fn lookup_candidates_follow_three_strategies() {
    assert_eq!(lookup_candidates("919876543210"), vec!["919876543210", "9876543210"]);
    assert_eq!(lookup_candidates("9876543210"), vec!["9876543210", "919876543210"]);
    assert_eq!(lookup_candidates("12345678"), vec!["12345678"]);
    assert!(lookup_candidates("abc").is_empty());
}

#[test]
fn links_use_dialing_form() {
    assert_eq!(wa_me_link("919876543210"), "https://wa.me/919876543210");
    assert_eq!(protocol_url("+91 98765 43210"), "whatsapp://send?phone=919876543210");
    assert_eq!(number_from_link("https://wa.me/919876543210?text=hi"), "919876543210");
    assert_eq!(
        to_protocol_url("https://wa.me/919876543210?text=Hello%20there").as_deref(),
        Some("whatsapp://send?phone=919876543210&text=Hello%20there")
    );
    assert_eq!(
        to_protocol_url("whatsapp://send?phone=1").as_deref(),
        Some("whatsapp://send?phone=1")
    );
    assert_eq!(to_protocol_url("https://example.com"), None);
}
