//! Product identity and the merge-preserving result collection.
//!
//! A product is identified by its catalog item code plus the listing it was
//! seen on. The `ProductSet` keeps at most one entry per identity and merges
//! repeated observations with monotonic-max semantics: the best quantity
//! observation wins across overlapping probing passes.

use std::collections::hash_map;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::ProbeError;

/// Item codes are exactly nine uppercase alphanumeric characters.
static ITEM_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Z]{9}$").expect("item code regex is valid"));

/// Extracts the item code from a detail-page URL (`.../pd/D5WD7BYBM/...`).
static DETAIL_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"pd/([0-9A-Z]{9})(?:$|/|\?)").expect("detail url regex is valid"));

/// Parse an item code out of a detail-page URL, if one is present.
pub fn parse_item_code(url: &str) -> Option<String> {
    DETAIL_URL_RE
        .captures(url)
        .map(|caps| caps[1].to_string())
}

/// Immutable identity of a probed product: item code + source listing.
///
/// Two keys are equal iff both components match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProductKey {
    code: String,
    source: String,
}

impl ProductKey {
    /// Build a key, validating the item code format.
    pub fn new(
        code: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<Self, ProbeError> {
        let code = code.into();
        if !ITEM_CODE_RE.is_match(&code) {
            return Err(ProbeError::InvalidIdentifier { code });
        }
        Ok(Self {
            code,
            source: source.into(),
        })
    }

    /// The catalog item code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The listing this product was observed on.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Canonical detail-page URL, derived deterministically from the code.
    pub fn detail_url(&self) -> String {
        format!("https://www.emag.ro/-/pd/{}/", self.code)
    }
}

/// One product observation: identity, quantity ceiling, listing rank.
///
/// `max_qty` of `None` means the ceiling has not been observed yet, which
/// is a distinct state from an observed ceiling of zero.
#[derive(Debug, Clone)]
pub struct ProbedProduct {
    key: ProductKey,
    max_qty: Option<u32>,
    rank: Option<NonZeroU32>,
}

impl ProbedProduct {
    /// A fresh observation with unknown quantity and no rank.
    pub fn new(key: ProductKey) -> Self {
        Self {
            key,
            max_qty: None,
            rank: None,
        }
    }

    /// Attach the 1-based position within the source listing.
    pub fn with_rank(mut self, rank: NonZeroU32) -> Self {
        self.rank = Some(rank);
        self
    }

    pub fn key(&self) -> &ProductKey {
        &self.key
    }

    pub fn max_qty(&self) -> Option<u32> {
        self.max_qty
    }

    pub fn set_max_qty(&mut self, qty: Option<u32>) {
        self.max_qty = qty;
    }

    pub fn rank(&self) -> Option<NonZeroU32> {
        self.rank
    }

    pub fn url(&self) -> String {
        self.key.detail_url()
    }
}

/// Does `incoming` improve on `current` under monotonic-max semantics?
///
/// Unknown never replaces anything; any observed quantity (including zero)
/// replaces unknown; among observed quantities the strictly greater wins.
fn improves(incoming: Option<u32>, current: Option<u32>) -> bool {
    match (incoming, current) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(new), Some(old)) => new > old,
    }
}

/// A mapping from product identity to its best observation so far.
#[derive(Debug, Clone, Default)]
pub struct ProductSet {
    entries: HashMap<ProductKey, ProbedProduct>,
}

impl ProductSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an observation, keeping the better quantity per key.
    ///
    /// Returns `true` if the observation was stored (new key, or a strictly
    /// greater quantity than the existing entry). The surviving entry keeps
    /// its own rank and other fields.
    pub fn add(&mut self, product: ProbedProduct) -> bool {
        match self.entries.entry(product.key.clone()) {
            hash_map::Entry::Vacant(slot) => {
                slot.insert(product);
                true
            }
            hash_map::Entry::Occupied(mut slot) => {
                if improves(product.max_qty, slot.get().max_qty) {
                    slot.insert(product);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Union with another set under the same merge rule.
    pub fn merge(&mut self, other: ProductSet) {
        for (_, product) in other.entries {
            self.add(product);
        }
    }

    pub fn contains(&self, key: &ProductKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &ProductKey) -> Option<&ProbedProduct> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProbedProduct> {
        self.entries.values()
    }
}

impl IntoIterator for ProductSet {
    type Item = ProbedProduct;
    type IntoIter = std::collections::hash_map::IntoValues<ProductKey, ProbedProduct>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_values()
    }
}

/// Result of one cart readback: parsed products plus the count of line
/// items that could not be resolved to an identity at all.
#[derive(Debug, Default)]
pub struct CartSnapshot {
    pub products: ProductSet,
    pub unparsed_lines: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: &str) -> ProductKey {
        ProductKey::new(code, "https://www.emag.ro/masinute/c").expect("valid key")
    }

    fn observed(code: &str, qty: u32) -> ProbedProduct {
        let mut p = ProbedProduct::new(key(code));
        p.set_max_qty(Some(qty));
        p
    }

    #[test]
    fn test_key_accepts_valid_codes() {
        for code in ["D6X0QBBBM", "DJ4XKKMBM", "123456789", "ABCDEFGHI"] {
            assert!(ProductKey::new(code, "src").is_ok(), "{code} should parse");
        }
    }

    #[test]
    fn test_key_rejects_malformed_codes() {
        for code in ["", "short", "d6x0qbbbm", "D6X0QBBBM1", "D6X0QBB-M", "D6X0QBBB"] {
            let err = ProductKey::new(code, "src").unwrap_err();
            assert!(
                matches!(err, ProbeError::InvalidIdentifier { .. }),
                "{code} should be rejected"
            );
        }
    }

    #[test]
    fn test_key_equality_needs_both_components() {
        let a = ProductKey::new("D6X0QBBBM", "page-1").unwrap();
        let b = ProductKey::new("D6X0QBBBM", "page-2").unwrap();
        let c = ProductKey::new("D6X0QBBBM", "page-1").unwrap();
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_detail_url_is_deterministic() {
        let k = key("D6X0QBBBM");
        assert_eq!(k.detail_url(), "https://www.emag.ro/-/pd/D6X0QBBBM/");
        assert_eq!(parse_item_code(&k.detail_url()).as_deref(), Some("D6X0QBBBM"));
    }

    #[test]
    fn test_parse_item_code_from_urls() {
        assert_eq!(
            parse_item_code("https://www.emag.ro/masinuta/pd/D6X0QBBBM/").as_deref(),
            Some("D6X0QBBBM")
        );
        assert_eq!(
            parse_item_code("https://www.emag.ro/x/pd/DJ4XKKMBM?ref=cart").as_deref(),
            Some("DJ4XKKMBM")
        );
        assert_eq!(parse_item_code("https://www.emag.ro/cart/products"), None);
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut set = ProductSet::new();
        set.add(observed("D6X0QBBBM", 5));
        set.add(observed("D6X0QBBBM", 5));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(&key("D6X0QBBBM")).unwrap().max_qty(), Some(5));
    }

    #[test]
    fn test_add_is_monotonic() {
        // (5, 3, 9) must end at 9: lower observations never win.
        let mut set = ProductSet::new();
        set.add(observed("D6X0QBBBM", 5));
        set.add(observed("D6X0QBBBM", 3));
        set.add(observed("D6X0QBBBM", 9));
        assert_eq!(set.get(&key("D6X0QBBBM")).unwrap().max_qty(), Some(9));
    }

    #[test]
    fn test_observed_zero_beats_unknown() {
        let mut set = ProductSet::new();
        set.add(ProbedProduct::new(key("D6X0QBBBM")));
        assert_eq!(set.get(&key("D6X0QBBBM")).unwrap().max_qty(), None);

        set.add(observed("D6X0QBBBM", 0));
        assert_eq!(set.get(&key("D6X0QBBBM")).unwrap().max_qty(), Some(0));

        // Unknown never downgrades an observation.
        set.add(ProbedProduct::new(key("D6X0QBBBM")));
        assert_eq!(set.get(&key("D6X0QBBBM")).unwrap().max_qty(), Some(0));
    }

    #[test]
    fn test_surviving_entry_keeps_its_rank() {
        let rank = NonZeroU32::new(7).unwrap();
        let mut set = ProductSet::new();

        let mut first = ProbedProduct::new(key("D6X0QBBBM")).with_rank(rank);
        first.set_max_qty(Some(9));
        set.add(first);

        // Lower quantity, different rank: the stored entry is untouched.
        let mut second = ProbedProduct::new(key("D6X0QBBBM"))
            .with_rank(NonZeroU32::new(2).unwrap());
        second.set_max_qty(Some(3));
        set.add(second);

        let stored = set.get(&key("D6X0QBBBM")).unwrap();
        assert_eq!(stored.max_qty(), Some(9));
        assert_eq!(stored.rank(), Some(rank));
    }

    #[test]
    fn test_merge_is_commutative_and_associative() {
        let batches: Vec<Vec<ProbedProduct>> = vec![
            vec![observed("D6X0QBBBM", 5), observed("DJ4XKKMBM", 2)],
            vec![observed("D6X0QBBBM", 9), observed("DHTSBQYBM", 1)],
            vec![observed("DJ4XKKMBM", 7)],
        ];

        let orders: Vec<Vec<usize>> = vec![
            vec![0, 1, 2],
            vec![2, 1, 0],
            vec![1, 0, 2],
        ];

        let mut finals = Vec::new();
        for order in orders {
            let mut set = ProductSet::new();
            for idx in order {
                let mut batch = ProductSet::new();
                for p in batches[idx].clone() {
                    batch.add(p);
                }
                set.merge(batch);
            }
            let mut quantities: Vec<(String, Option<u32>)> = set
                .iter()
                .map(|p| (p.key().code().to_string(), p.max_qty()))
                .collect();
            quantities.sort();
            finals.push(quantities);
        }

        assert_eq!(finals[0], finals[1]);
        assert_eq!(finals[1], finals[2]);
        assert_eq!(
            finals[0],
            vec![
                ("D6X0QBBBM".to_string(), Some(9)),
                ("DHTSBQYBM".to_string(), Some(1)),
                ("DJ4XKKMBM".to_string(), Some(7)),
            ]
        );
    }
}
