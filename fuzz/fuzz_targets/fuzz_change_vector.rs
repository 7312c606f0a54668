//! Fuzz target for change vector parsing and comparison.
//!
//! Parsing never panics, and anything that parses keeps the comparison
//! invariants.

#![no_main]

use doc_replication::{Causality, ChangeVector};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;
    let (Ok(a), Ok(b)) = (a.parse::<ChangeVector>(), b.parse::<ChangeVector>()) else {
        return;
    };

    assert_eq!(a.compare(&a), Causality::Equal);

    let expected = match a.compare(&b) {
        Causality::Newer => Causality::Older,
        Causality::Older => Causality::Newer,
        other => other,
    };
    assert_eq!(b.compare(&a), expected);

    let merged = ChangeVector::merged([&a, &b]);
    assert!(a.compare(&merged).is_covered());
    assert!(b.compare(&merged).is_covered());

    // Textual form is stable.
    let reparsed: ChangeVector = a.to_string().parse().expect("display output must parse");
    assert_eq!(reparsed, a);
});
