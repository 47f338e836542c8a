//! Item quality-label canonicalization.
//!
//! Inventory payloads arrive with every imaginable spelling of rarity --
//! English words, tier codes, Chinese labels. The writer canonicalizes
//! them to the fixed label set before a row is emitted, so replays and
//! diffs never disagree over `"UR"` versus `"神话"`.

use serde::{Deserialize, Serialize};

/// The canonical quality tiers, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QualityKey {
    /// Damaged or ruined gear.
    Broken,
    /// Ordinary gear. The fallback for unrecognized labels.
    Common,
    /// Uncommon and rare gear.
    Rare,
    /// Epic gear.
    Epic,
    /// Legendary gear.
    Legendary,
    /// Mythic, perfect, artifact-tier gear.
    Pristine,
}

impl QualityKey {
    /// The canonical display label.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Broken => "破损",
            Self::Common => "普通",
            Self::Rare => "稀有",
            Self::Epic => "史诗",
            Self::Legendary => "传说",
            Self::Pristine => "神话",
        }
    }

    /// The sort rank of this tier (higher is better).
    pub const fn rank(self) -> u8 {
        match self {
            Self::Broken => 0,
            Self::Common => 1,
            Self::Rare => 3,
            Self::Epic => 4,
            Self::Legendary => 5,
            Self::Pristine => 6,
        }
    }
}

/// Collapse an alias to its lookup form: lowercase with spaces,
/// underscores, and hyphens removed.
fn fold_alias(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .filter(|ch| !matches!(ch, ' ' | '_' | '-'))
        .collect()
}

/// Normalize any quality spelling to its canonical tier.
///
/// Unrecognized and empty labels fall back to [`QualityKey::Common`].
pub fn normalize_quality(raw: &str) -> QualityKey {
    match fold_alias(raw).as_str() {
        "broken" | "damaged" | "ruined" | "破损" | "损坏" => QualityKey::Broken,
        "common" | "normal" | "basic" | "n" | "c" | "普通" | "常见" => QualityKey::Common,
        "uncommon" | "rare" | "r" | "精良" | "稀有" => QualityKey::Rare,
        "epic" | "sr" | "s" | "史诗" => QualityKey::Epic,
        "legendary" | "ss" | "ssr" | "传说" => QualityKey::Legendary,
        "mythic" | "pristine" | "perfect" | "artifact" | "ur" | "ex" | "sss" | "神话" | "完美" => {
            QualityKey::Pristine
        }
        _ => QualityKey::Common,
    }
}

/// Normalize any quality spelling to its canonical display label.
pub fn normalize_quality_label(raw: &str) -> &'static str {
    normalize_quality(raw).label()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn tier_codes_map_to_canonical_labels() {
        assert_eq!(normalize_quality_label("UR"), "神话");
        assert_eq!(normalize_quality_label("ssr"), "传说");
        assert_eq!(normalize_quality_label("SR"), "史诗");
        assert_eq!(normalize_quality_label("r"), "稀有");
    }

    #[test]
    fn chinese_labels_pass_through() {
        assert_eq!(normalize_quality_label("神话"), "神话");
        assert_eq!(normalize_quality_label("精良"), "稀有");
        assert_eq!(normalize_quality_label("损坏"), "破损");
    }

    #[test]
    fn separators_and_case_are_ignored() {
        assert_eq!(normalize_quality("Leg endary"), QualityKey::Legendary);
        assert_eq!(normalize_quality("pris_tine"), QualityKey::Pristine);
    }

    #[test]
    fn unknown_labels_default_to_common() {
        assert_eq!(normalize_quality("???"), QualityKey::Common);
        assert_eq!(normalize_quality(""), QualityKey::Common);
    }

    #[test]
    fn ranks_are_ordered() {
        assert!(QualityKey::Pristine.rank() > QualityKey::Legendary.rank());
        assert!(QualityKey::Rare.rank() > QualityKey::Common.rank());
        assert_eq!(QualityKey::Broken.rank(), 0);
    }
}
